/// Result type for internal guard operations.
pub type Result<T> = std::result::Result<T, GuardError>;

/// Internal failures. None of these are ever surfaced to a caller as a block.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum GuardError {
    /// A rule failed validation and was not loaded.
    #[error("invalid rule for resource `{resource}`: {reason}")]
    InvalidRule { resource: String, reason: String },

    /// Bucket geometry that cannot form a window.
    #[error("invalid statistic parameters: {0}")]
    InvalidStatParams(String),

    /// The requested time lies behind a bucket that is already live.
    #[error("time {now_ms} is behind the live window starting at {window_start}")]
    ClockBackwards { now_ms: u64, window_start: u64 },

    /// The remote token service could not answer.
    #[error("token service unavailable: {0}")]
    TokenService(String),

    /// A slot in the chain reported a failure.
    #[error("slot `{slot}` failed: {reason}")]
    Slot { slot: &'static str, reason: String },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}
