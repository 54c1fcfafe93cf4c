//! Write path reliability: batching and the durable dead-letter queue

pub mod batch_writer;
pub mod dead_letter;

pub use batch_writer::{BatchError, BatchStats, BatchWriter, FlushOutcome};
pub use dead_letter::{
    DeadLetterEntry, DeadLetterError, DeadLetterStats, DeadLetterStore, RetryDisposition,
    RetryReport,
};
