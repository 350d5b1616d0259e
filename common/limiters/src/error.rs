use thiserror::Error;

/// Reasons a blocking admission gave up without consuming tokens.
///
/// A rejected `allow` is not an error and never produces one of these.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum WaitError {
    #[error("wait cancelled before enough tokens were available")]
    Cancelled,
    #[error("cost {cost} exceeds bucket capacity {capacity} at this instance's current share of the namespace rate")]
    ExceedsCapacity { cost: u32, capacity: f64 },
}

/// Enumeration of errors returned by a peer exchange transport.
#[derive(Error, Debug)]
pub enum ExchangeError {
    #[error("peer exchange timed out")]
    Timeout,
    #[error("peer exchange unavailable: {0}")]
    Unavailable(String),
    /// Retrying on the next round will not help, e.g. bad credentials.
    #[error("peer exchange misconfigured: {0}")]
    Misconfigured(String),
    #[error("failed to encode usage report: {0}")]
    Encode(#[from] serde_json::Error),
}

impl ExchangeError {
    /// Short label used as the `cause` tag on error counters.
    pub fn cause(&self) -> &'static str {
        match self {
            ExchangeError::Timeout => "timeout",
            ExchangeError::Unavailable(_) => "unavailable",
            ExchangeError::Misconfigured(_) => "misconfigured",
            ExchangeError::Encode(_) => "encode",
        }
    }
}
