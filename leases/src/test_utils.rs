use crate::{
    context::Context,
    error::{ServiceError, ServiceResult},
    lease::{DeleteOpt, Filter, Lease, LeaseId, LeaseOpt, Resource},
    memory::InMemoryLeaseService,
    service::LeaseService,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// Install a fmt subscriber honoring `RUST_LOG`; safe to call more than once.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// In-memory lease service that records calls and can inject failures and latency.
#[derive(Debug, Default)]
pub struct RecordingLeaseService {
    inner: InMemoryLeaseService,
    create_calls: AtomicUsize,
    delete_calls: AtomicUsize,
    created: Mutex<Vec<Lease>>,
    deleted: Mutex<Vec<LeaseId>>,
    create_options: Mutex<Vec<Vec<LeaseOpt>>>,
    fail_create: Mutex<Option<String>>,
    fail_delete: Mutex<Option<String>>,
    create_latency: Mutex<Option<Duration>>,
}

impl RecordingLeaseService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn store(&self) -> &InMemoryLeaseService {
        &self.inner
    }

    pub fn create_calls(&self) -> usize {
        self.create_calls.load(Ordering::SeqCst)
    }

    pub fn delete_calls(&self) -> usize {
        self.delete_calls.load(Ordering::SeqCst)
    }

    pub fn created(&self) -> Vec<Lease> {
        self.created.lock().clone()
    }

    pub fn deleted(&self) -> Vec<LeaseId> {
        self.deleted.lock().clone()
    }

    /// Options passed to each `create` call, in order.
    pub fn create_options(&self) -> Vec<Vec<LeaseOpt>> {
        self.create_options.lock().clone()
    }

    /// Make the next `create` fail with `ServiceError::Unavailable`.
    pub fn fail_next_create(&self, reason: &str) {
        *self.fail_create.lock() = Some(reason.to_string());
    }

    /// Make the next `delete` fail with `ServiceError::Unavailable`.
    pub fn fail_next_delete(&self, reason: &str) {
        *self.fail_delete.lock() = Some(reason.to_string());
    }

    /// Delay every `create` by `latency` before touching the store.
    pub fn set_create_latency(&self, latency: Duration) {
        *self.create_latency.lock() = Some(latency);
    }
}

#[async_trait]
impl LeaseService for RecordingLeaseService {
    async fn create(&self, ctx: &Context, opts: &[LeaseOpt]) -> ServiceResult<Lease> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        self.create_options.lock().push(opts.to_vec());

        let latency = *self.create_latency.lock();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        let failure = self.fail_create.lock().take();
        if let Some(reason) = failure {
            return Err(ServiceError::Unavailable(reason));
        }

        let lease = self.inner.create(ctx, opts).await?;
        self.created.lock().push(lease.clone());
        Ok(lease)
    }

    async fn delete(&self, ctx: &Context, lease: &Lease, opts: &[DeleteOpt]) -> ServiceResult<()> {
        self.delete_calls.fetch_add(1, Ordering::SeqCst);

        let failure = self.fail_delete.lock().take();
        if let Some(reason) = failure {
            return Err(ServiceError::Unavailable(reason));
        }

        self.inner.delete(ctx, lease, opts).await?;
        self.deleted.lock().push(lease.id.clone());
        Ok(())
    }

    async fn list(&self, ctx: &Context, filters: &[Filter]) -> ServiceResult<Vec<Lease>> {
        self.inner.list(ctx, filters).await
    }

    async fn add_resource(&self, ctx: &Context, lease: &Lease, resource: Resource) -> ServiceResult<()> {
        self.inner.add_resource(ctx, lease, resource).await
    }

    async fn delete_resource(&self, ctx: &Context, lease: &Lease, resource: &Resource) -> ServiceResult<()> {
        self.inner.delete_resource(ctx, lease, resource).await
    }

    async fn list_resources(&self, ctx: &Context, lease: &Lease) -> ServiceResult<Vec<Resource>> {
        self.inner.list_resources(ctx, lease).await
    }
}
