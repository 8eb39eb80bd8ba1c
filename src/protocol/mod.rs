//! # Protocol Collaborators
//!
//! Seams between the transport and the code that understands packets.
//!
//! ## Components
//! - **Cipher**: per-connection body encryption (`Cipher`, `CipherFactory`)
//! - **Payload**: message encoding (`PayloadCodec`, `RawCodec`, `BincodeCodec`)

pub mod cipher;
pub mod payload;

pub use cipher::{ChaChaCipher, Cipher, CipherFactory, PlainCipher, PlainCipherFactory};
pub use payload::{BincodeCodec, PayloadCodec, RawCodec};
