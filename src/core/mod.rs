//! # Core Transport Components
//!
//! The pooled I/O machinery underneath the connection manager.
//!
//! ## Components
//! - **Arena**: one contiguous region sliced into fixed-size segments
//! - **Context / Pool**: reusable send and receive descriptors, checked out
//!   and released around every socket operation
//! - **Token**: per-connection framing state machine
//! - **Codec**: tokio codec over the same framing, for `Framed` peers
//! - **Settings**: construction-time wiring of arena and pools
//!
//! ## Wire Format
//! ```text
//! [Length(2|3|4)] [Body(Length)]
//! ```
//!
//! ## Resource Guarantees
//! - No steady-state allocation for socket buffers
//! - Checked-out contexts never share arena bytes
//! - Every context is returned exactly once, including on cancellation

pub mod arena;
pub mod codec;
pub mod context;
pub mod pool;
pub mod settings;
pub mod token;
