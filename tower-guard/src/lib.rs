//! # Tower Guard
//!
//! `tower-guard` runs every request of a [Tower](https://github.com/tower-rs/tower)
//! service inside a [`shot_guard`] entry, so the flow rules loaded into a
//! [`shot_guard::Sentinel`] decide which requests reach the service.
//!
//! ## Request Lifecycle
//!
//! 1. **Admission**: `poll_ready` asks the rules for an entry. A blocked request
//!    fails readiness with [`AdmissionError::Blocked`].
//! 2. **Queueing**: Throttling rules may queue a request instead. Readiness
//!    stays pending until the queue slot comes up; no task is parked on a thread.
//! 3. **Completion**: The entry exits when the response future resolves, so
//!    response time and concurrency are recorded. Inner errors are counted as
//!    errors of the resource.
//!
//! ## Feature Flags
//!
//! - `axum`: Enables `IntoResponse` for [`AdmissionError`], mapping a blocked
//!   request to `429` and inner failures to `500`.

mod error;
mod layer;
mod service;


pub use error::AdmissionError;
pub use layer::GuardLayer;
pub use service::GuardService;
pub use service::ResponseFuture;
