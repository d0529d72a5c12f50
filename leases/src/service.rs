use crate::{
    context::Context,
    error::ServiceResult,
    lease::{DeleteOpt, Filter, Lease, LeaseId, LeaseOpt, Resource},
};
use async_trait::async_trait;

/// Client for the external lease store.
///
/// Implementations own lease storage and must tolerate concurrent create and
/// delete calls. They should fail with `ServiceError::Cancelled` or
/// `ServiceError::DeadlineExceeded` rather than block past the context.
#[async_trait]
pub trait LeaseService: Send + Sync + std::fmt::Debug {
    async fn create(&self, ctx: &Context, opts: &[LeaseOpt]) -> ServiceResult<Lease>;
    async fn delete(&self, ctx: &Context, lease: &Lease, opts: &[DeleteOpt]) -> ServiceResult<()>;
    async fn list(&self, ctx: &Context, filters: &[Filter]) -> ServiceResult<Vec<Lease>>;
    async fn add_resource(&self, ctx: &Context, lease: &Lease, resource: Resource) -> ServiceResult<()>;
    async fn delete_resource(&self, ctx: &Context, lease: &Lease, resource: &Resource) -> ServiceResult<()>;
    async fn list_resources(&self, ctx: &Context, lease: &Lease) -> ServiceResult<Vec<Resource>>;
}

// Context key for the active lease
#[derive(Debug, Clone)]
struct ActiveLease(LeaseId);

/// The lease ID carried by `ctx` or any of its ancestors.
pub fn from_context(ctx: &Context) -> Option<LeaseId> {
    ctx.value::<ActiveLease>().map(|active| active.0.clone())
}

/// Derive a child of `ctx` annotated with `id`.
pub fn with_lease(ctx: &Context, id: LeaseId) -> Context {
    ctx.with_value(ActiveLease(id))
}
