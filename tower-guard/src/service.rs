use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::Context;
use std::task::Poll;
use std::task::ready;

use opentelemetry::KeyValue;
use opentelemetry::global;
use opentelemetry::metrics::Counter;
use pin_project_lite::pin_project;
use shot_guard::Admission;
use shot_guard::Entry;
use shot_guard::EntryOptions;
use shot_guard::PendingEntry;
use shot_guard::Sentinel;
use tokio::time::Sleep;
use tokio::time::sleep;
use tower::BoxError;
use tower::Service;

use crate::error::AdmissionError;

#[derive(Clone, Debug)]
struct GuardServiceMetrics {
    passed: Counter<u64>,
    blocked: Counter<u64>,
    queued: Counter<u64>,
    attributes: [KeyValue; 1],
}

impl GuardServiceMetrics {
    fn new(resource: &str) -> Self {
        let meter = global::meter("guard_service");
        Self {
            passed: meter.u64_counter("guard_passed").build(),
            blocked: meter.u64_counter("guard_blocked").build(),
            queued: meter.u64_counter("guard_queued").build(),
            attributes: [KeyValue::new("resource", resource.to_string())],
        }
    }
}

/// Runs each request inside an entry of `resource`.
///
/// Admission happens in `poll_ready`. A blocked request fails readiness with
/// [`AdmissionError::Blocked`]; a queued one keeps readiness pending until its
/// wait is over. The entry is exited when the response future completes, and
/// an inner error is recorded on it first.
#[derive(Debug)]
pub struct GuardService<S> {
    inner: S,
    sentinel: Arc<Sentinel>,
    resource: Arc<str>,
    options: EntryOptions,
    sleep: Option<Pin<Box<Sleep>>>,
    pending: Option<PendingEntry>,
    entry: Option<Entry>,
    instruments: GuardServiceMetrics,
}

pin_project! {
    /// Completes the inner call, then exits its entry.
    #[project = ResponseFutureProj]
    pub enum ResponseFuture<F> {
        Admitted {
            #[pin]
            inner: F,
            entry: Option<Entry>,
        },
        Rejected {
            error: Option<AdmissionError>,
        },
    }
}

impl<F, T, E> Future for ResponseFuture<F>
where
    F: Future<Output = Result<T, E>>,
    E: Into<BoxError>,
{
    type Output = Result<T, BoxError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match self.project() {
            ResponseFutureProj::Admitted { inner, entry } => {
                let result = ready!(inner.poll(cx)).map_err(Into::into);
                if let Some(mut entry) = entry.take() {
                    if let Err(err) = &result {
                        entry.set_error(err.to_string());
                    }
                    entry.exit();
                }
                Poll::Ready(result)
            }
            ResponseFutureProj::Rejected { error } => {
                let error = error.take().unwrap_or(AdmissionError::NotReady);
                Poll::Ready(Err(Box::new(error)))
            }
        }
    }
}

// Manually implement Clone because Pin<Box<Sleep>> cannot be cloned
impl<S> Clone for GuardService<S>
where
    S: Clone,
{
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            sentinel: Arc::clone(&self.sentinel),
            resource: Arc::clone(&self.resource),
            options: self.options,
            // A clone starts without an admission of its own
            sleep: None,
            pending: None,
            entry: None,
            instruments: self.instruments.clone(),
        }
    }
}

impl<S, Req> Service<Req> for GuardService<S>
where
    S: Service<Req>,
    S::Error: Into<BoxError>,
{
    type Response = S::Response;
    type Error = BoxError;
    type Future = ResponseFuture<S::Future>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        // 1. A queued request is admitted once its sleep is over
        if let Some(fut) = self.sleep.as_mut() {
            ready!(fut.as_mut().poll(cx));
            self.sleep = None;
            if let Some(pending) = self.pending.take() {
                self.entry = Some(pending.admit());
                self.instruments.passed.add(1, &self.instruments.attributes);
            }
        }

        // 2. Check inner service readiness FIRST so no entry is taken for a
        // request that cannot be sent yet
        if let Err(err) = ready!(self.inner.poll_ready(cx)) {
            return Poll::Ready(Err(err.into()));
        }

        if self.entry.is_some() {
            return Poll::Ready(Ok(()));
        }

        // 3. Ask the rules
        match self.sentinel.try_entry(&self.resource, self.options) {
            Ok(Admission::Admitted(entry)) => {
                self.entry = Some(entry);
                self.instruments.passed.add(1, &self.instruments.attributes);
                Poll::Ready(Ok(()))
            }
            Ok(Admission::Queued(pending, wait)) => {
                self.instruments.queued.add(1, &self.instruments.attributes);
                let mut sleep_fut = Box::pin(sleep(wait));
                match sleep_fut.as_mut().poll(cx) {
                    Poll::Pending => {
                        self.sleep = Some(sleep_fut);
                        self.pending = Some(pending);
                        Poll::Pending
                    }
                    Poll::Ready(()) => {
                        self.entry = Some(pending.admit());
                        self.instruments.passed.add(1, &self.instruments.attributes);
                        Poll::Ready(Ok(()))
                    }
                }
            }
            Err(blocked) => {
                self.instruments.blocked.add(1, &self.instruments.attributes);
                Poll::Ready(Err(Box::new(AdmissionError::Blocked(blocked))))
            }
        }
    }

    fn call(&mut self, req: Req) -> Self::Future {
        match self.entry.take() {
            Some(entry) => ResponseFuture::Admitted {
                inner: self.inner.call(req),
                entry: Some(entry),
            },
            None => ResponseFuture::Rejected {
                error: Some(AdmissionError::NotReady),
            },
        }
    }
}

impl<S> GuardService<S> {
    pub fn new(inner: S, sentinel: Arc<Sentinel>, resource: impl Into<Arc<str>>) -> Self {
        let resource = resource.into();
        let instruments = GuardServiceMetrics::new(&resource);

        Self {
            inner,
            sentinel,
            resource,
            options: EntryOptions::new(),
            sleep: None,
            pending: None,
            entry: None,
            instruments,
        }
    }

    pub fn with_options(mut self, options: EntryOptions) -> Self {
        self.options = options;
        self
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }
}
