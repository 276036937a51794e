//! Idempotent provisioning of buckets and service identities
//!
//! Each `ensure_*` call walks the candidate names for its resource kind:
//!
//! ```text
//!   resolve ──▶ probe ──found──▶ reuse ─────────────┐
//!      ▲          │                                 ▼
//!      │          ├─not found──▶ create ──ok──▶ (identity: roles, key) ──▶ done
//!      │          │                │
//!      └─conflict─┴────────────────┘ conflict / per-candidate error
//! ```
//!
//! A name held by someone else, or lost to a concurrent creator, is
//! skipped. Permission errors abort. Running out of candidates is
//! [`Error::ExhaustedNamespace`].
//!
//! Walks over the same resolved names are serialized within a process, since
//! they would race over the exact same names.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::config::ProvisionConfig;
use crate::credentials::{Credential, CredentialIssuer, CredentialOutcome};
use crate::naming::{candidates, sanitize, Candidates, NameBase, ResourceKind};
use crate::platform::{
    service_account_email, BucketApi, BucketSpec, IdentityApi, PolicyApi, ServiceAccount,
    ServiceAccountSpec,
};
use crate::policy::{service_account_member, RoleBindingManager};
use crate::{Error, Result};

/// Longest display name the platform accepts for a service account
const DISPLAY_NAME_MAX: usize = 100;

/// Outcome of a successful `ensure_*` call
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProvisionResult {
    /// Resource kind that was provisioned
    pub kind: ResourceKind,
    /// Bucket name, or service account email
    pub resolved_name: String,
    /// `true` if created by this call, `false` if an owned resource was reused
    pub created: bool,
    /// Whether role bindings were added (identities only)
    pub roles_added: bool,
    /// Key issuance outcome (identities only)
    #[serde(skip)]
    pub credential: Option<CredentialOutcome>,
}

impl ProvisionResult {
    /// The issued credential, if any
    pub fn identity_credential(&self) -> Option<&Credential> {
        self.credential.as_ref().and_then(CredentialOutcome::credential)
    }
}

/// Orchestrates naming, probing, creation, role binding and key issuance
pub struct Provisioner {
    buckets: Arc<dyn BucketApi>,
    identities: Arc<dyn IdentityApi>,
    roles: RoleBindingManager,
    issuer: CredentialIssuer,
    config: ProvisionConfig,
    walks: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
}

impl Provisioner {
    /// Create a provisioner over the given platform capabilities
    pub fn new(
        buckets: Arc<dyn BucketApi>,
        identities: Arc<dyn IdentityApi>,
        policies: Arc<dyn PolicyApi>,
        config: ProvisionConfig,
    ) -> Self {
        let roles = RoleBindingManager::new(
            policies,
            config.role_binding_retry(),
            config.policy_write_attempts,
        );
        let issuer = CredentialIssuer::new(identities.clone(), config.credential_retry());
        Self {
            buckets,
            identities,
            roles,
            issuer,
            config,
            walks: DashMap::new(),
        }
    }

    /// The configuration in use
    pub fn config(&self) -> &ProvisionConfig {
        &self.config
    }

    /// Ensure a staging bucket exists for `agent` in `project`.
    #[instrument(skip(self))]
    pub async fn ensure_bucket(&self, project: &str, agent: &str) -> Result<ProvisionResult> {
        let base = NameBase { project, agent };
        let names = candidates(&base, ResourceKind::Bucket)?;
        let lock = self.walk_lock(project, &names);
        let _guard = lock.lock().await;

        let spec = BucketSpec {
            project: project.to_string(),
            location: self.config.bucket_location.clone(),
            storage_class: self.config.bucket_storage_class.clone(),
        };

        let (name, created) = walk(names, |name| self.claim_bucket(name, &spec)).await?;

        Ok(ProvisionResult {
            kind: ResourceKind::Bucket,
            resolved_name: name,
            created,
            roles_added: false,
            credential: None,
        })
    }

    /// Ensure a service identity exists for `agent`, holds the required
    /// roles, and has a fresh credential.
    ///
    /// A credential that could not be issued is reported in the result,
    /// not as an error.
    #[instrument(skip(self))]
    pub async fn ensure_service_identity(
        &self,
        project: &str,
        agent: &str,
        environment: &str,
    ) -> Result<ProvisionResult> {
        let base = NameBase { project, agent };
        let names = candidates(&base, ResourceKind::ServiceIdentity)?;
        let lock = self.walk_lock(project, &names);
        let _guard = lock.lock().await;

        let (_, (account, created)) = walk(names, |account_id| {
            self.claim_service_account(project, account_id, agent, environment)
        })
        .await?;

        if created {
            settle(self.config.settle_after_create, "identity creation").await;
        }

        let member = service_account_member(&account.email);
        let roles_added = self
            .roles
            .reconcile(project, &member, &self.config.required_roles)
            .await?;

        if created || roles_added {
            settle(self.config.settle_before_key, "role assignment").await;
        }

        let credential = self.issuer.issue(project, &account.email).await;

        Ok(ProvisionResult {
            kind: ResourceKind::ServiceIdentity,
            resolved_name: account.email,
            created,
            roles_added,
            credential: Some(credential),
        })
    }

    /// Lock shared by every walk over the same names. Keyed on what the
    /// inputs resolve to, so spellings that sanitize alike share it.
    fn walk_lock(&self, project: &str, names: &Candidates) -> Arc<tokio::sync::Mutex<()>> {
        let first = names.clone().next().unwrap_or_default();
        let key = format!("{}/{}/{}", names.kind(), sanitize(project), first);
        self.walks.entry(key).or_default().clone()
    }

    /// Probe one bucket name; create it when missing. Returns `created`.
    async fn claim_bucket(&self, name: String, spec: &BucketSpec) -> Result<bool> {
        match self.buckets.get_bucket(&name).await {
            Ok(()) => {
                info!(bucket = %name, "Found existing bucket");
                Ok(false)
            }
            Err(Error::NotFound { .. }) => {
                info!(bucket = %name, location = %spec.location, "Creating bucket");
                self.buckets.create_bucket(&name, spec).await?;
                info!(bucket = %name, "Created bucket");
                Ok(true)
            }
            Err(e) => Err(e),
        }
    }

    /// Probe one service account id; create it when missing.
    async fn claim_service_account(
        &self,
        project: &str,
        account_id: String,
        agent: &str,
        environment: &str,
    ) -> Result<(ServiceAccount, bool)> {
        let email = service_account_email(&account_id, project);

        match self.identities.get_service_account(project, &email).await {
            Ok(account) => {
                info!(service_account = %account.email, "Found existing service account");
                Ok((account, false))
            }
            Err(Error::NotFound { .. }) => {
                info!(service_account = %account_id, "Creating service account");
                let spec = ServiceAccountSpec {
                    project: project.to_string(),
                    display_name: truncate_chars(
                        &format!("Workload Service Account ({})", agent),
                        DISPLAY_NAME_MAX,
                    ),
                    description: format!(
                        "Service account for workload deployment: {} ({})",
                        agent, environment
                    ),
                    account_id,
                };
                let account = self.identities.create_service_account(&spec).await?;
                info!(service_account = %account.email, "Created service account");
                Ok((account, true))
            }
            Err(e) => Err(e),
        }
    }
}

/// Try candidates in order until one is claimed.
///
/// Fatal errors abort the walk; anything else skips to the next name.
async fn walk<T, F, Fut>(names: Candidates, mut claim: F) -> Result<(String, T)>
where
    F: FnMut(String) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let kind = names.kind();
    let mut attempted = 0usize;
    let mut last_error = String::from("no candidates");

    for name in names {
        attempted += 1;
        debug!(kind = %kind, candidate = %name, attempt = attempted, "Trying name");

        match claim(name.clone()).await {
            Ok(value) => return Ok((name, value)),
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                match &e {
                    Error::Conflict { .. } => {
                        warn!(kind = %kind, candidate = %name, "Name taken by someone else, trying next")
                    }
                    _ => warn!(kind = %kind, candidate = %name, error = %e, "Candidate failed, trying next"),
                }
                last_error = e.to_string();
            }
        }
    }

    Err(Error::ExhaustedNamespace {
        kind,
        attempted,
        last_error,
    })
}

async fn settle(delay: Duration, after: &str) {
    if delay.is_zero() {
        return;
    }
    info!(delay_ms = delay.as_millis() as u64, "Waiting for {} to propagate", after);
    tokio::time::sleep(delay).await;
}

fn truncate_chars(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}
