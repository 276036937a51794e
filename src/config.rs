//! Provisioning configuration
//!
//! Defaults reproduce the behaviour operators expect out of the box; a JSON
//! file can override any subset of fields. Durations are written in seconds
//! (fractions allowed).

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::policy::RequiredRoleSet;
use crate::retry::{RetryPolicy, DEFAULT_BACKOFF_UNIT};
use crate::{Error, Result};

/// Per-operation time bound for the command runner
pub const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_secs(300);

/// Default number of operations the runner keeps in flight
pub const DEFAULT_CONCURRENCY: usize = 5;

/// Settings for [`run_parallel`](crate::runner::run_parallel)
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RunnerConfig {
    /// Maximum operations in flight
    pub concurrency: usize,
    /// Bound on each operation
    #[serde(with = "duration_secs")]
    pub timeout: Duration,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            timeout: DEFAULT_OPERATION_TIMEOUT,
        }
    }
}

/// Settings for [`Provisioner`](crate::provisioner::Provisioner)
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ProvisionConfig {
    /// Location new buckets are created in
    pub bucket_location: String,
    /// Default storage class of new buckets
    pub bucket_storage_class: String,
    /// Roles every provisioned identity must hold
    pub required_roles: RequiredRoleSet,
    /// Wait after creating an identity before binding roles
    #[serde(with = "duration_secs")]
    pub settle_after_create: Duration,
    /// Wait after binding roles before issuing a key
    #[serde(with = "duration_secs")]
    pub settle_before_key: Duration,
    /// Wait after enabling services before anything uses them
    #[serde(with = "duration_secs")]
    pub settle_after_enable: Duration,
    /// Attempts for key issuance
    pub credential_attempts: u32,
    /// Attempts for each policy read/write while the identity propagates
    pub role_binding_attempts: u32,
    /// Re-reads allowed when a policy write hits a stale etag
    pub policy_write_attempts: u32,
    /// Unit of the exponential backoff
    #[serde(with = "duration_secs")]
    pub backoff_unit: Duration,
    /// Runner settings for batch setup operations
    pub runner: RunnerConfig,
}

impl Default for ProvisionConfig {
    fn default() -> Self {
        Self {
            bucket_location: "US".to_string(),
            bucket_storage_class: "STANDARD".to_string(),
            required_roles: RequiredRoleSet::default(),
            settle_after_create: Duration::from_secs(5),
            settle_before_key: Duration::from_secs(4),
            settle_after_enable: Duration::from_secs(5),
            credential_attempts: 3,
            role_binding_attempts: 3,
            policy_write_attempts: 3,
            backoff_unit: DEFAULT_BACKOFF_UNIT,
            runner: RunnerConfig::default(),
        }
    }
}

impl ProvisionConfig {
    /// Load a config file, filling unset fields with defaults
    pub fn from_file(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&data)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings that cannot work
    pub fn validate(&self) -> Result<()> {
        if self.bucket_location.trim().is_empty() {
            return Err(Error::validation("bucketLocation must not be empty"));
        }
        if self.bucket_storage_class.trim().is_empty() {
            return Err(Error::validation("bucketStorageClass must not be empty"));
        }
        if self.required_roles.is_empty() {
            return Err(Error::validation("requiredRoles must name at least one role"));
        }
        if self.runner.concurrency == 0 {
            return Err(Error::validation("runner.concurrency must be at least 1"));
        }
        Ok(())
    }

    /// Retry policy for key issuance
    pub fn credential_retry(&self) -> RetryPolicy {
        RetryPolicy::new(self.credential_attempts, self.backoff_unit)
    }

    /// Retry policy for policy reads and writes
    pub fn role_binding_retry(&self) -> RetryPolicy {
        RetryPolicy::new(self.role_binding_attempts, self.backoff_unit)
    }
}

/// Durations as (fractional) seconds
mod duration_secs {
    use std::time::Duration;

    use serde::{de::Error as _, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(D::Error::custom)
    }
}
