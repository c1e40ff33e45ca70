use std::time::Duration;

use thiserror::Error;

use crate::source::SourceError;

/// Errors raised while handing a single posting to a delivery channel.
#[derive(Error, Debug)]
pub enum DeliveryError {
    #[error("the channel could not be reached: {0}")]
    Request(#[from] reqwest::Error),

    /// The channel understood the request and said no. Retrying would get
    /// the same answer.
    #[error("the channel rejected the message: {code}: {description}")]
    Api { code: i64, description: String },

    /// The channel asked to slow down and told us for how long.
    #[error("the channel throttled the message, retry after {retry_after:?}")]
    Throttled { retry_after: Duration },

    #[error("gave up on the message after {attempts} throttled attempts")]
    AttemptsExhausted { attempts: u32 },
}

/// Errors that abort one ingestion cycle. The worker stays up and tries
/// again on the next tick.
#[derive(Error, Debug)]
pub enum CycleError {
    #[error(transparent)]
    Fetch(#[from] SourceError),
}

/// Errors that stop the worker loop for good.
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("shutdown requested")]
    Cancelled,
}
