use crate::{
    context::Context,
    error::{ServiceError, ServiceResult},
    lease::{DeleteOpt, Filter, Lease, LeaseId, LeaseOpt, Resource},
    service::LeaseService,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::{mapref::entry::Entry, DashMap};
use std::collections::BTreeSet;
use tracing::debug;

/// Combined length limit for a label key and value
pub const MAX_LABEL_SIZE: usize = 4096;

#[derive(Debug, Clone)]
struct Record {
    lease: Lease,
    resources: BTreeSet<Resource>,
}

/// Lease service keeping everything in process memory.
///
/// Resources are dropped together with the lease that references them.
#[derive(Debug, Default)]
pub struct InMemoryLeaseService {
    leases: DashMap<LeaseId, Record>,
}

impl InMemoryLeaseService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &LeaseId) -> Option<Lease> {
        self.leases.get(id).map(|record| record.lease.clone())
    }

    pub fn contains(&self, id: &LeaseId) -> bool {
        self.leases.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.leases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.leases.is_empty()
    }

    /// Remove every lease whose expiry has passed, returning their IDs.
    pub fn prune_expired(&self, now: DateTime<Utc>) -> Vec<LeaseId> {
        let candidates: Vec<LeaseId> = self
            .leases
            .iter()
            .filter(|record| record.lease.is_expired(now))
            .map(|record| record.key().clone())
            .collect();
        self.remove_expired(candidates, now)
    }

    // Expiry is checked again under the shard lock: a candidate may have been
    // deleted and recreated since it was collected.
    fn remove_expired(&self, candidates: Vec<LeaseId>, now: DateTime<Utc>) -> Vec<LeaseId> {
        candidates
            .into_iter()
            .filter_map(|id| {
                self.leases
                    .remove_if(&id, |_, record| record.lease.is_expired(now))
                    .map(|(id, _)| id)
            })
            .collect()
    }
}

fn check_context(ctx: &Context) -> ServiceResult<()> {
    match ctx.err() {
        Some(reason) => Err(reason),
        None => Ok(()),
    }
}

fn validate(lease: &Lease) -> ServiceResult<()> {
    if lease.id.as_str().is_empty() {
        return Err(ServiceError::InvalidArgument("lease id must not be empty".to_string()));
    }
    for (key, value) in &lease.labels {
        if key.is_empty() {
            return Err(ServiceError::InvalidArgument("label key must not be empty".to_string()));
        }
        if key.len() + value.len() > MAX_LABEL_SIZE {
            return Err(ServiceError::InvalidArgument(format!(
                "label {:?} exceeds {} bytes",
                key, MAX_LABEL_SIZE
            )));
        }
    }
    Ok(())
}

#[async_trait]
impl LeaseService for InMemoryLeaseService {
    async fn create(&self, ctx: &Context, opts: &[LeaseOpt]) -> ServiceResult<Lease> {
        check_context(ctx)?;

        let now = Utc::now();
        let spec = LeaseOpt::resolve(opts, now);
        let id = spec.id.unwrap_or_else(LeaseId::random);
        let lease = Lease::new(id, now, spec.labels);
        validate(&lease)?;

        match self.leases.entry(lease.id.clone()) {
            Entry::Occupied(_) => Err(ServiceError::AlreadyExists(lease.id.to_string())),
            Entry::Vacant(slot) => {
                slot.insert(Record {
                    lease: lease.clone(),
                    resources: BTreeSet::new(),
                });
                debug!(lease = %lease.id, "Stored lease");
                Ok(lease)
            }
        }
    }

    async fn delete(&self, ctx: &Context, lease: &Lease, opts: &[DeleteOpt]) -> ServiceResult<()> {
        check_context(ctx)?;

        if self.leases.remove(&lease.id).is_none() {
            return Err(ServiceError::NotFound(lease.id.to_string()));
        }

        if opts.contains(&DeleteOpt::Synchronous) {
            let pruned = self.prune_expired(Utc::now());
            debug!(lease = %lease.id, pruned = pruned.len(), "Synchronous delete pruned expired leases");
        }
        Ok(())
    }

    async fn list(&self, ctx: &Context, filters: &[Filter]) -> ServiceResult<Vec<Lease>> {
        check_context(ctx)?;

        let mut leases: Vec<Lease> = self
            .leases
            .iter()
            .filter(|record| Filter::matches_all(filters, &record.lease))
            .map(|record| record.lease.clone())
            .collect();
        leases.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(leases)
    }

    async fn add_resource(&self, ctx: &Context, lease: &Lease, resource: Resource) -> ServiceResult<()> {
        check_context(ctx)?;

        if resource.id.is_empty() || resource.kind.is_empty() {
            return Err(ServiceError::InvalidArgument(
                "resource id and kind must not be empty".to_string(),
            ));
        }

        let mut record = self
            .leases
            .get_mut(&lease.id)
            .ok_or_else(|| ServiceError::NotFound(lease.id.to_string()))?;
        record.resources.insert(resource);
        Ok(())
    }

    async fn delete_resource(&self, ctx: &Context, lease: &Lease, resource: &Resource) -> ServiceResult<()> {
        check_context(ctx)?;

        let mut record = self
            .leases
            .get_mut(&lease.id)
            .ok_or_else(|| ServiceError::NotFound(lease.id.to_string()))?;
        record.resources.remove(resource);
        Ok(())
    }

    async fn list_resources(&self, ctx: &Context, lease: &Lease) -> ServiceResult<Vec<Resource>> {
        check_context(ctx)?;

        let record = self
            .leases
            .get(&lease.id)
            .ok_or_else(|| ServiceError::NotFound(lease.id.to_string()))?;
        Ok(record.resources.iter().cloned().collect())
    }
}
