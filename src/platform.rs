//! Cloud platform abstractions
//!
//! The provisioner only talks to the platform through these traits so the
//! candidate walk, role reconciliation and key issuance can be tested
//! against mocks. [`crate::gcloud`] provides the production implementation.
//!
//! Every method reports failures through the crate [`Error`](crate::Error)
//! taxonomy: implementations are responsible for mapping platform responses
//! onto `NotFound`, `Conflict`, `PropagationDelay` and `PermissionDenied`.

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use serde::{Deserialize, Serialize};

use crate::policy::PolicyDocument;
use crate::Result;

/// Parameters for creating a bucket
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BucketSpec {
    /// Project the bucket is billed to
    pub project: String,
    /// Location (multi-region or region), e.g. `US`
    pub location: String,
    /// Default storage class, e.g. `STANDARD`
    pub storage_class: String,
}

/// Parameters for creating a service account
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServiceAccountSpec {
    /// Project the account is created in
    pub project: String,
    /// Account id (the part of the email before `@`)
    pub account_id: String,
    /// Human-readable name
    pub display_name: String,
    /// Free-form description
    pub description: String,
}

/// A service account as reported by the platform
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceAccount {
    /// Account email, the identity's principal name
    pub email: String,
    /// Platform-assigned numeric id
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unique_id: Option<String>,
    /// Human-readable name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
}

/// Email of a service account with the given id in a project
pub fn service_account_email(account_id: &str, project: &str) -> String {
    format!("{}@{}.iam.gserviceaccount.com", account_id, project)
}

/// Bucket lookup and creation
///
/// `get_bucket` must distinguish a missing bucket (`NotFound`) from one that
/// exists but belongs to someone else (`Conflict`).
#[cfg_attr(test, automock)]
#[async_trait]
pub trait BucketApi: Send + Sync {
    /// Succeeds when the bucket exists and is readable by the caller
    async fn get_bucket(&self, name: &str) -> Result<()>;

    /// Create a bucket; `Conflict` when the name was claimed meanwhile
    async fn create_bucket(&self, name: &str, spec: &BucketSpec) -> Result<()>;
}

/// Service account lookup, creation and key issuance
#[cfg_attr(test, automock)]
#[async_trait]
pub trait IdentityApi: Send + Sync {
    /// Look up a service account by email
    async fn get_service_account(&self, project: &str, email: &str) -> Result<ServiceAccount>;

    /// Create a service account; `Conflict` when the id already exists
    async fn create_service_account(&self, spec: &ServiceAccountSpec) -> Result<ServiceAccount>;

    /// Issue a new key for the account, returning the raw key file bytes
    async fn create_key(&self, project: &str, email: &str) -> Result<Vec<u8>>;
}

/// Project-level policy read and write
#[cfg_attr(test, automock)]
#[async_trait]
pub trait PolicyApi: Send + Sync {
    /// Read the current policy, including its etag
    async fn get_policy(&self, project: &str) -> Result<PolicyDocument>;

    /// Write the policy back; `Conflict` when its etag is stale
    async fn set_policy(&self, project: &str, policy: &PolicyDocument) -> Result<PolicyDocument>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_service_account_email() {
        assert_eq!(
            service_account_email("research-sa", "acme-prod"),
            "research-sa@acme-prod.iam.gserviceaccount.com"
        );
    }

    #[test]
    fn test_service_account_parses_platform_json() {
        let json = r#"{
            "email": "research-sa@acme-prod.iam.gserviceaccount.com",
            "uniqueId": "1234567890",
            "displayName": "Workload Service Account (research)",
            "projectId": "acme-prod"
        }"#;
        let sa: ServiceAccount = serde_json::from_str(json).unwrap();
        assert_eq!(sa.unique_id.as_deref(), Some("1234567890"));
        assert!(sa.email.starts_with("research-sa@"));
    }
}
