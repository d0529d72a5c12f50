//! Scoped lease acquisition.
//!
//! [`LeaseScope::acquire`] makes sure exactly one lease protects the
//! operation running under a context chain. The first acquisition in a chain
//! creates a lease and hands back an active [`Release`]; nested acquisitions
//! see the existing annotation, create nothing, and get a no-op handle, so an
//! inner call can never delete the lease its caller owns.

use crate::{
    config::ScopeConfig,
    context::Context,
    error::{Error, Result},
    lease::{DeleteOpt, Lease, LeaseId, LeaseOpt},
    service::{from_context, with_lease, LeaseService},
};
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct LeaseScope {
    service: Arc<dyn LeaseService>,
    config: ScopeConfig,
}

impl LeaseScope {
    pub fn new(service: Arc<dyn LeaseService>) -> Self {
        Self::with_config(service, ScopeConfig::default())
    }

    pub fn with_config(service: Arc<dyn LeaseService>, config: ScopeConfig) -> Self {
        Self { service, config }
    }

    pub fn service(&self) -> &Arc<dyn LeaseService> {
        &self.service
    }

    pub fn config(&self) -> &ScopeConfig {
        &self.config
    }

    /// Ensure a lease is active for `ctx`.
    ///
    /// If `ctx` already carries a lease, `opts` are ignored and the returned
    /// context is a clone of `ctx` with a no-op [`Release`]. Otherwise a lease
    /// is created from `opts` (or the configured defaults when `opts` is
    /// empty) and attached to a child of `ctx`.
    ///
    /// On error the caller's context is left as it was and nothing needs to
    /// be released.
    pub async fn acquire(&self, ctx: &Context, opts: &[LeaseOpt]) -> Result<(Context, Release)> {
        if let Some(existing) = from_context(ctx) {
            if !opts.is_empty() {
                debug!(lease = %existing, ignored = opts.len(), "Lease already active, ignoring lease options");
            }
            return Ok((ctx.clone(), Release::inherited(existing)));
        }

        let defaults;
        let opts = if opts.is_empty() {
            defaults = self.config.default_opts();
            &defaults[..]
        } else {
            opts
        };

        if let Some(reason) = ctx.err() {
            return Err(Error::CreationFailed(reason));
        }

        debug!("Creating lease with {} options", opts.len());

        // A create abandoned here may still land on the service side; its
        // gc.expire label bounds how long it survives.
        let created = tokio::select! {
            biased;
            reason = ctx.done() => Err(reason),
            created = self.service.create(ctx, opts) => created,
        };

        let lease = match created {
            Ok(lease) => lease,
            Err(e) => {
                warn!("Lease creation failed: {}", e);
                return Err(Error::CreationFailed(e));
            }
        };

        info!(lease = %lease.id, expires_at = ?lease.expires_at(), "Lease attached to context");
        let leased = with_lease(ctx, lease.id.clone());
        Ok((leased, Release::active(self.service.clone(), lease)))
    }

    /// Run `f` under a lease and release it afterwards, whether `f` succeeded
    /// or not. An error from `f` takes precedence over a release error.
    pub async fn scoped<F, Fut, T, E>(&self, ctx: &Context, opts: &[LeaseOpt], f: F) -> std::result::Result<T, E>
    where
        F: FnOnce(Context) -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: From<Error>,
    {
        let (leased, release) = self.acquire(ctx, opts).await?;
        let outcome = f(leased).await;
        let released = release.release(ctx).await;

        match (outcome, released) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(e)) => Err(e.into()),
            (Err(e), Ok(())) => Err(e),
            (Err(e), Err(release_err)) => {
                warn!("Lease release failed after operation error: {}", release_err);
                Err(e)
            }
        }
    }
}

#[derive(Debug)]
enum ReleaseState {
    Inherited(LeaseId),
    Active {
        service: Arc<dyn LeaseService>,
        lease: Lease,
    },
    Done,
}

/// Handle returned by [`LeaseScope::acquire`].
///
/// Releasing consumes the handle. Dropping an active handle does not delete
/// the lease; it stays until the garbage collector sees it expire.
#[must_use = "an acquired lease is only deleted when released"]
#[derive(Debug)]
pub struct Release {
    state: ReleaseState,
}

impl Release {
    fn inherited(id: LeaseId) -> Self {
        Self {
            state: ReleaseState::Inherited(id),
        }
    }

    fn active(service: Arc<dyn LeaseService>, lease: Lease) -> Self {
        Self {
            state: ReleaseState::Active { service, lease },
        }
    }

    /// True when the lease belongs to an outer scope and releasing does nothing.
    pub fn is_noop(&self) -> bool {
        !matches!(self.state, ReleaseState::Active { .. })
    }

    pub fn lease_id(&self) -> Option<&LeaseId> {
        match &self.state {
            ReleaseState::Inherited(id) => Some(id),
            ReleaseState::Active { lease, .. } => Some(&lease.id),
            ReleaseState::Done => None,
        }
    }

    /// The created lease; `None` for inherited leases.
    pub fn lease(&self) -> Option<&Lease> {
        match &self.state {
            ReleaseState::Active { lease, .. } => Some(lease),
            _ => None,
        }
    }

    pub async fn release(self, ctx: &Context) -> Result<()> {
        self.release_with(ctx, &[]).await
    }

    pub async fn release_with(mut self, ctx: &Context, opts: &[DeleteOpt]) -> Result<()> {
        match std::mem::replace(&mut self.state, ReleaseState::Done) {
            ReleaseState::Active { service, lease } => {
                service
                    .delete(ctx, &lease, opts)
                    .await
                    .map_err(|source| Error::DeletionFailed {
                        id: lease.id.clone(),
                        source,
                    })?;
                info!(lease = %lease.id, "Lease released");
                Ok(())
            }
            ReleaseState::Inherited(id) => {
                debug!(lease = %id, "Lease owned by outer scope, nothing to release");
                Ok(())
            }
            ReleaseState::Done => Ok(()),
        }
    }
}

impl Drop for Release {
    fn drop(&mut self) {
        if let ReleaseState::Active { lease, .. } = &self.state {
            warn!(lease = %lease.id, "Lease handle dropped without release; lease lives until it expires");
        }
    }
}
