//! Retry with error classification and exponential backoff.

mod classifier;
mod manager;
mod policy;

pub use classifier::{ErrorClassifier, ErrorType};
pub use manager::{RetryAttempt, RetryEvent, RetryManager, RetryStatistics};
pub use policy::RetryPolicy;
