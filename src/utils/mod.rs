//! # Utility Modules
//!
//! Supporting utilities shared by the transport.
//!
//! ## Components
//! - **Logging**: tracing-subscriber setup
//! - **Timeout**: Async timeout wrappers
//! - **Metrics**: Thread-safe observability counters

pub mod logging;
pub mod metrics;
pub mod timeout;

pub use metrics::{Metrics, MetricsSnapshot};
