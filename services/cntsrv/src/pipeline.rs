//! Counter processing: raw samples in, quality-tagged readings out

pub mod model;
pub mod processor;
pub mod rate_window;

pub use model::{ProcessedReading, Quality, RawSample};
pub use processor::ChannelProcessor;
pub use rate_window::{Overflow, PushOutcome, RateError, RateWindow};
