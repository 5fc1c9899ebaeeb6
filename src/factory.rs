//! The factory seam between the pool and the resources it manages
//!
//! The pool never interprets a resource's contents; it only asks the
//! caller-supplied factory to create, destroy, and validate instances.

use async_trait::async_trait;

/// Creates, destroys, and validates the resources a pool manages.
///
/// `destroy` is best-effort: it returns nothing, and implementations are
/// expected to log their own cleanup failures rather than surface them.
/// The default `validate` treats every resource as healthy, so a factory
/// without a real validator yields a health monitor that never replaces
/// anything.
#[async_trait]
pub trait ResourceFactory: Send + Sync + 'static {
    type Resource: Send + Sync + 'static;
    type Error: std::error::Error + Send + Sync + 'static;

    /// Create a fresh resource instance
    async fn create(&self) -> Result<Self::Resource, Self::Error>;

    /// Tear down a resource; failures must stay inside the factory
    async fn destroy(&self, resource: &Self::Resource);

    /// Check whether a resource is still usable
    async fn validate(&self, _resource: &Self::Resource) -> bool {
        true
    }
}
