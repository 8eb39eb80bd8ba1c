//! # Transport Layer
//!
//! TCP connection management on top of the pooled core.
//!
//! ## Components
//! - **Manager**: accept/connect, receive and send loops, shutdown
//! - **Connection**: identifiers, lifecycle state, disconnect reasons
//! - **Events**: the `TransportHandler` callback surface and `ChannelHandler`

pub mod connection;
pub mod events;
pub mod manager;

pub use connection::{ConnectionId, ConnectionState, DisconnectReason, SendReceipt};
pub use events::{ChannelHandler, NoopHandler, TransportEvent, TransportHandler};
pub use manager::{ManagerBuilder, NetworkManager};
