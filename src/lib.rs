//! # framewire
//!
//! Pooled asynchronous transport core for binary, length-framed, encrypted
//! session protocols.
//!
//! A fixed arena of buffer segments backs two bounded pools of operation
//! contexts, one per direction. Every socket read or write checks out a
//! context, uses its segment, and returns it; per-connection message tokens
//! reassemble frames across any number of reads.
//!
//! ## Modules
//! - [`core`]: arena, context pools, framing state machine, settings
//! - [`transport`]: connection manager and event surface
//! - [`protocol`]: cipher and payload codec collaborators
//! - [`config`]: TOML/env configuration
//! - [`utils`]: logging, metrics, timeouts
//!
//! ## Quick Start
//! ```rust,no_run
//! use framewire::prelude::*;
//!
//! # async fn run() -> Result<()> {
//! let server = NetworkManager::builder(RawCodec).build()?;
//! let addr = server.start("127.0.0.1:0").await?;
//!
//! let client = NetworkManager::builder(RawCodec).build()?;
//! let id = client.connect(addr).await?;
//! client.send(id, &bytes::Bytes::from_static(b"hello")).await?;
//!
//! client.shutdown().await;
//! server.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod core;
pub mod error;
pub mod protocol;
pub mod transport;
pub mod utils;

pub use error::{ErrorClass, ProtocolError, Result};

/// Commonly used types
pub mod prelude {
    pub use crate::config::{NetworkConfig, TransportConfig};
    pub use crate::core::settings::TransportSettings;
    pub use crate::core::token::{ByteOrder, FrameFormat, LengthPrefix};
    pub use crate::error::{ProtocolError, Result};
    pub use crate::protocol::{BincodeCodec, ChaChaCipher, Cipher, PayloadCodec, PlainCipher, RawCodec};
    pub use crate::transport::{
        ChannelHandler, ConnectionId, ConnectionState, DisconnectReason, NetworkManager,
        TransportEvent, TransportHandler,
    };
}
