// Lease data model and creation options

use chrono::{DateTime, Duration, NaiveDate, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// Label carrying a lease's absolute expiry, read by the garbage collector.
pub const LABEL_GC_EXPIRE: &str = "containerd.io/gc.expire";

/// Opaque identifier of a lease, as assigned by the lease service
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LeaseId(pub String);

impl LeaseId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a random identifier: sub-second nanos of the current time,
    /// then a v4 uuid.
    pub fn random() -> Self {
        let nanos = Utc::now().timestamp_subsec_nanos();
        Self(format!("{}-{}", nanos, Uuid::new_v4().simple()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LeaseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for LeaseId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for LeaseId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// A lease as stored by the lease service.
///
/// The calling context only ever holds the [`LeaseId`]; everything else is
/// owned by the service once the lease is created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub id: LeaseId,
    pub created_at: DateTime<Utc>,
    pub labels: BTreeMap<String, String>,
}

impl Lease {
    pub fn new(id: LeaseId, created_at: DateTime<Utc>, labels: BTreeMap<String, String>) -> Self {
        Self {
            id,
            created_at,
            labels,
        }
    }

    /// Absolute expiry taken from the `gc.expire` label, if set and parseable.
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        let raw = self.labels.get(LABEL_GC_EXPIRE)?;
        DateTime::parse_from_rfc3339(raw)
            .ok()
            .map(|t| t.with_timezone(&Utc))
    }

    /// A lease without an expiry label never expires.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at().map_or(false, |expiry| now >= expiry)
    }

    pub fn time_remaining(&self, now: DateTime<Utc>) -> Option<Duration> {
        let expiry = self.expires_at()?;
        if now < expiry {
            Some(expiry.signed_duration_since(now))
        } else {
            Some(Duration::zero())
        }
    }
}

/// Options describing how a lease should be created
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaseOpt {
    /// Let the service generate an opaque identifier
    RandomId,
    /// Use the caller-given identifier
    Id(String),
    /// Expire the lease `now + duration` after creation
    Expiration(std::time::Duration),
    /// Attach a set of labels
    Labels(BTreeMap<String, String>),
    /// Attach a single label
    Label(String, String),
}

/// The outcome of applying a list of [`LeaseOpt`]s in order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LeaseSpec {
    /// `None` means the service picks a random identifier.
    pub id: Option<LeaseId>,
    pub labels: BTreeMap<String, String>,
}

impl LeaseOpt {
    /// Apply options in order. Later identifiers replace earlier ones and
    /// labels merge with later keys winning.
    pub fn resolve(opts: &[LeaseOpt], now: DateTime<Utc>) -> LeaseSpec {
        let mut spec = LeaseSpec::default();
        for opt in opts {
            match opt {
                LeaseOpt::RandomId => spec.id = Some(LeaseId::random()),
                LeaseOpt::Id(id) => spec.id = Some(LeaseId::new(id.clone())),
                LeaseOpt::Expiration(duration) => {
                    let expiry = expiry_after(now, *duration);
                    spec.labels.insert(
                        LABEL_GC_EXPIRE.to_string(),
                        expiry.to_rfc3339_opts(SecondsFormat::Secs, true),
                    );
                }
                LeaseOpt::Labels(labels) => {
                    spec.labels
                        .extend(labels.iter().map(|(k, v)| (k.clone(), v.clone())));
                }
                LeaseOpt::Label(key, value) => {
                    spec.labels.insert(key.clone(), value.clone());
                }
            }
        }
        spec
    }
}

/// Latest expiry that RFC 3339 can carry: four-digit years only.
fn max_expiry() -> DateTime<Utc> {
    NaiveDate::from_ymd_opt(9999, 12, 31)
        .and_then(|date| date.and_hms_opt(23, 59, 59))
        .map_or(DateTime::<Utc>::MAX_UTC, |naive| naive.and_utc())
}

fn expiry_after(now: DateTime<Utc>, duration: std::time::Duration) -> DateTime<Utc> {
    // Durations too large for chrono saturate to the far future
    Duration::from_std(duration)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .map_or_else(max_expiry, |expiry| expiry.min(max_expiry()))
}

/// Options for deleting a lease
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOpt {
    /// Ask the service to run garbage collection before returning
    Synchronous,
}

/// A resource referenced by a lease, such as a content blob or snapshot.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Resource {
    pub id: String,
    /// Resource type, e.g. `content` or `snapshots/overlayfs`
    pub kind: String,
}

impl Resource {
    pub fn new(id: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: kind.into(),
        }
    }
}

/// Lease listing filter. A lease must match every filter given.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Filter {
    Id(LeaseId),
    Label { key: String, value: String },
    HasLabel(String),
}

impl Filter {
    pub fn matches(&self, lease: &Lease) -> bool {
        match self {
            Filter::Id(id) => &lease.id == id,
            Filter::Label { key, value } => lease.labels.get(key) == Some(value),
            Filter::HasLabel(key) => lease.labels.contains_key(key),
        }
    }

    pub fn matches_all(filters: &[Filter], lease: &Lease) -> bool {
        filters.iter().all(|f| f.matches(lease))
    }
}
