use shot_guard::BlockError;
use tower::BoxError;

/// Errors produced by the guard middleware.
#[derive(Debug, Clone, thiserror::Error)]
pub enum AdmissionError {
    /// A rule refused the request.
    ///
    /// When the `axum` feature is enabled, this converts to `429 Too Many Requests`.
    #[error("request blocked: {0}")]
    Blocked(#[from] BlockError),

    /// `call` was made without a successful `poll_ready` first.
    #[error("service called before it was ready")]
    NotReady,

    /// An unexpected error occurred in the inner service.
    ///
    /// The string contains the `Display` representation of the inner error.
    /// When the `axum` feature is enabled, this converts to `500 Internal Server Error`.
    #[error("Internal service error: {0}")]
    Inner(String),
}

impl AdmissionError {
    /// Recover an `AdmissionError` from the boxed error a guarded service
    /// returns. Errors from the inner service become [`AdmissionError::Inner`].
    pub fn from_boxed(err: BoxError) -> Self {
        match err.downcast::<AdmissionError>() {
            Ok(err) => *err,
            Err(other) => Self::Inner(other.to_string()),
        }
    }

    pub fn is_blocked(&self) -> bool {
        matches!(self, Self::Blocked(_))
    }
}

#[cfg(feature = "axum")]
impl axum::response::IntoResponse for AdmissionError {
    fn into_response(self) -> axum::response::Response {
        use axum::http::StatusCode;

        let status = match self {
            Self::Blocked(_) => StatusCode::TOO_MANY_REQUESTS,
            Self::NotReady => StatusCode::SERVICE_UNAVAILABLE,
            Self::Inner(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, self.to_string()).into_response()
    }
}
