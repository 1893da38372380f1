use std::sync::Arc;

use shot_guard::EntryOptions;
use shot_guard::Sentinel;
use tower::Layer;

use crate::service::GuardService;

/// Guards every request to the wrapped service as an entry of one resource.
#[derive(Debug)]
pub struct GuardLayer {
    sentinel: Arc<Sentinel>,
    resource: Arc<str>,
    options: EntryOptions,
}

// Note: Deriving Clone causes issues when using the layer with Axum.
impl Clone for GuardLayer {
    fn clone(&self) -> Self {
        Self {
            sentinel: Arc::clone(&self.sentinel),
            resource: Arc::clone(&self.resource),
            options: self.options,
        }
    }
}

impl GuardLayer {
    pub fn new(sentinel: Arc<Sentinel>, resource: impl Into<Arc<str>>) -> Self {
        GuardLayer {
            sentinel,
            resource: resource.into(),
            options: EntryOptions::new(),
        }
    }

    /// Options used for every entry, e.g. inbound traffic or a batch count.
    pub fn with_options(mut self, options: EntryOptions) -> Self {
        self.options = options;
        self
    }

    pub fn resource(&self) -> &str {
        &self.resource
    }
}

impl<S> Layer<S> for GuardLayer {
    type Service = GuardService<S>;

    fn layer(&self, service: S) -> Self::Service {
        GuardService::new(service, self.sentinel.clone(), self.resource.clone()).with_options(self.options)
    }
}
