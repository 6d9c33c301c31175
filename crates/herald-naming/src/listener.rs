//! Endpoint change listener trait

use herald_common::Endpoint;

/// Receives membership changes from a [`HostDiscovery`](crate::HostDiscovery).
///
/// Callbacks run on the discovery's update task, one at a time and in order.
/// Within one change batch every `on_remove` precedes every `on_add`.
pub trait EndpointListener: Send + Sync + 'static {
    /// An endpoint appeared, or reappeared with a new payload.
    fn on_add(&self, endpoint: &Endpoint);

    /// An endpoint disappeared, or is about to be replaced with a new payload.
    fn on_remove(&self, endpoint: &Endpoint);
}

/// A listener built from two closures.
pub struct FnEndpointListener<A, R>
where
    A: Fn(&Endpoint) + Send + Sync + 'static,
    R: Fn(&Endpoint) + Send + Sync + 'static,
{
    on_add: A,
    on_remove: R,
}

impl<A, R> FnEndpointListener<A, R>
where
    A: Fn(&Endpoint) + Send + Sync + 'static,
    R: Fn(&Endpoint) + Send + Sync + 'static,
{
    pub fn new(on_add: A, on_remove: R) -> Self {
        Self { on_add, on_remove }
    }
}

impl<A, R> EndpointListener for FnEndpointListener<A, R>
where
    A: Fn(&Endpoint) + Send + Sync + 'static,
    R: Fn(&Endpoint) + Send + Sync + 'static,
{
    fn on_add(&self, endpoint: &Endpoint) {
        (self.on_add)(endpoint);
    }

    fn on_remove(&self, endpoint: &Endpoint) {
        (self.on_remove)(endpoint);
    }
}
