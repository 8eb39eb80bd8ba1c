//! # Payload Codecs
//!
//! Field-level encoding of messages lives outside the transport. A
//! [`PayloadCodec`] turns decrypted frame bodies into application messages and
//! back; the transport never looks inside them.

use std::fmt;
use std::marker::PhantomData;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{ProtocolError, Result};

pub trait PayloadCodec: Send + Sync + 'static {
    /// Application message type
    type Message: Send + 'static;

    fn encode(&self, message: &Self::Message) -> Result<Vec<u8>>;

    fn decode(&self, plaintext: &[u8]) -> Result<Self::Message>;
}

/// Passes payload bytes through unchanged
#[derive(Debug, Clone, Copy, Default)]
pub struct RawCodec;

impl PayloadCodec for RawCodec {
    type Message = Bytes;

    fn encode(&self, message: &Bytes) -> Result<Vec<u8>> {
        Ok(message.to_vec())
    }

    fn decode(&self, plaintext: &[u8]) -> Result<Bytes> {
        Ok(Bytes::copy_from_slice(plaintext))
    }
}

/// Serde messages encoded with bincode
pub struct BincodeCodec<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> BincodeCodec<T> {
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<T> Default for BincodeCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for BincodeCodec<T> {
    fn clone(&self) -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for BincodeCodec<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BincodeCodec<{}>", std::any::type_name::<T>())
    }
}

impl<T> PayloadCodec for BincodeCodec<T>
where
    T: Serialize + DeserializeOwned + Send + 'static,
{
    type Message = T;

    fn encode(&self, message: &T) -> Result<Vec<u8>> {
        Ok(bincode::serialize(message)?)
    }

    fn decode(&self, plaintext: &[u8]) -> Result<T> {
        bincode::deserialize(plaintext).map_err(|e| ProtocolError::DeserializeError(e.to_string()))
    }
}
