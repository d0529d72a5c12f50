use crate::{
    error::{Error, Result},
    lease::LeaseOpt,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::env;
use std::time::Duration;

/// Expiration applied when a scope creates a lease without caller options
pub const DEFAULT_EXPIRATION: Duration = Duration::from_secs(24 * 60 * 60);

pub const ENV_DEFAULT_EXPIRATION_SECS: &str = "LEASES_DEFAULT_EXPIRATION_SECS";
pub const ENV_DEFAULT_LABELS: &str = "LEASES_DEFAULT_LABELS";

/// Defaults used by [`LeaseScope`](crate::scope::LeaseScope) when the
/// caller supplies no lease options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScopeConfig {
    pub default_expiration_secs: u64,
    pub default_labels: BTreeMap<String, String>,
}

impl Default for ScopeConfig {
    fn default() -> Self {
        Self {
            default_expiration_secs: DEFAULT_EXPIRATION.as_secs(),
            default_labels: BTreeMap::new(),
        }
    }
}

impl ScopeConfig {
    pub fn default_expiration(&self) -> Duration {
        Duration::from_secs(self.default_expiration_secs)
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(raw)
            .map_err(|e| Error::Config(format!("invalid scope config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults overridden by `LEASES_DEFAULT_EXPIRATION_SECS` and
    /// `LEASES_DEFAULT_LABELS` (`key=value,key=value`).
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(raw) = lookup(ENV_DEFAULT_EXPIRATION_SECS) {
            config.default_expiration_secs = raw.trim().parse().map_err(|e| {
                Error::Config(format!("{} must be whole seconds: {}", ENV_DEFAULT_EXPIRATION_SECS, e))
            })?;
        }

        if let Some(raw) = lookup(ENV_DEFAULT_LABELS) {
            config.default_labels = parse_labels(&raw)?;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.default_expiration_secs == 0 {
            return Err(Error::Config(
                "default expiration must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Options used to create a lease when the caller passed none.
    pub fn default_opts(&self) -> Vec<LeaseOpt> {
        let mut opts = vec![
            LeaseOpt::RandomId,
            LeaseOpt::Expiration(self.default_expiration()),
        ];
        if !self.default_labels.is_empty() {
            opts.push(LeaseOpt::Labels(self.default_labels.clone()));
        }
        opts
    }
}

fn parse_labels(raw: &str) -> Result<BTreeMap<String, String>> {
    let mut labels = BTreeMap::new();
    for pair in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let (key, value) = pair
            .split_once('=')
            .ok_or_else(|| Error::Config(format!("label {:?} is not key=value", pair)))?;
        let key = key.trim();
        if key.is_empty() {
            return Err(Error::Config(format!("label {:?} has an empty key", pair)));
        }
        labels.insert(key.to_string(), value.trim().to_string());
    }
    Ok(labels)
}
