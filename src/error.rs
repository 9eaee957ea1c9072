use thiserror::Error;

/// Failure taxonomy for the trading pipeline.
///
/// The split that matters operationally is transient vs. terminal: transient
/// errors are retried with backoff, everything else resolves the current
/// signal to `failed` and leaves a clean state for the next cycle.
#[derive(Debug, Error)]
pub enum TradingError {
    /// Network-level trouble: disconnects, timeouts, rate limits.
    /// Safe to retry with backoff.
    #[error("transient error: {0}")]
    Transient(String),

    /// The exchange rejected the order (insufficient margin, bad size).
    /// Retrying without re-sizing would just fail again.
    #[error("order rejected: {0}")]
    Rejected(String),

    /// Missing minute candles for a bucket. Resolved by the carry-forward
    /// policy in the aggregator, never a hard failure.
    #[error("data gap: {0}")]
    DataGap(String),

    /// A state-machine guarantee was broken (e.g. duplicate pending signal).
    /// Must never happen when processing is correctly serialized.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),
}

impl TradingError {
    pub fn is_transient(&self) -> bool {
        matches!(self, TradingError::Transient(_))
    }
}
