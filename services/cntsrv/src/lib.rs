//! Counter acquisition service
//!
//! Polls ADAM-6051 style counter modules over Modbus-TCP, turns raw register
//! values into overflow-corrected totals and windowed rates, and writes them
//! to a time-series store with a durable dead-letter queue behind it.
//!
//! ```text
//! device task ──► DeviceLink ──► ChannelProcessor ──► BatchWriter ──► ReadingSink
//!                                                          │               ▲
//!                                                          ▼               │
//!                                                   DeadLetterStore ── retry loop
//! ```

pub mod bootstrap;
pub mod config;
pub mod link;
pub mod pipeline;
pub mod protocol;
pub mod reliability;
pub mod runtime;
pub mod storage;

pub use config::AppConfig;
pub use errors::{CounterError, CounterResult};
