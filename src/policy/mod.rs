//! Project policy documents and role binding reconciliation
//!
//! A policy is an ordered list of bindings, each granting one role to a set
//! of principals. Reconciliation only ever appends: a principal is added to
//! an existing binding for the role, or a new binding is appended. Existing
//! bindings are never removed or reordered.
//!
//! The read-modify-write against the project policy carries the etag that
//! was read, so the platform rejects the write with a `Conflict` if someone
//! else changed the policy in between. [`RoleBindingManager`] then re-reads
//! and reconciles again.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::platform::PolicyApi;
use crate::retry::RetryPolicy;
use crate::{Error, Result};

/// Roles a workload identity needs before it is considered ready
pub const DEFAULT_REQUIRED_ROLES: &[&str] = &[
    "roles/aiplatform.user",
    "roles/iam.serviceAccountTokenCreator",
];

// =============================================================================
// Policy document
// =============================================================================

/// One role granted to a set of principals
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Binding {
    /// Role identifier, e.g. `roles/aiplatform.user`
    pub role: String,
    /// Principals holding the role, e.g. `serviceAccount:x@p.iam.gserviceaccount.com`
    #[serde(default)]
    pub members: Vec<String>,
    /// Condition restricting the grant; conditional bindings never satisfy
    /// a required role and are never appended to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<serde_json::Value>,
}

impl Binding {
    fn is_unconditional(&self) -> bool {
        self.condition.is_none()
    }
}

/// Project policy: role bindings plus the fields needed to write it back
///
/// Fields this crate doesn't interpret (audit configs, version) are kept
/// verbatim so a write never drops them.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PolicyDocument {
    /// Role bindings in platform order
    #[serde(default)]
    pub bindings: Vec<Binding>,
    /// Concurrency token from the read
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
    /// Everything else in the document
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl PolicyDocument {
    /// Whether `principal` holds `role` through an unconditional binding
    pub fn has_role(&self, principal: &str, role: &str) -> bool {
        self.bindings
            .iter()
            .any(|b| b.role == role && b.is_unconditional() && b.members.iter().any(|m| m == principal))
    }

    /// Principals holding `role` unconditionally
    pub fn members_of(&self, role: &str) -> Vec<&str> {
        self.bindings
            .iter()
            .filter(|b| b.role == role && b.is_unconditional())
            .flat_map(|b| b.members.iter().map(String::as_str))
            .collect()
    }
}

/// Ordered set of roles that must all be bound to a principal
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequiredRoleSet(Vec<String>);

impl RequiredRoleSet {
    /// Build a role set, dropping duplicates but keeping first-seen order
    pub fn new<I, S>(roles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut out: Vec<String> = Vec::new();
        for role in roles {
            let role = role.into();
            if !out.contains(&role) {
                out.push(role);
            }
        }
        Self(out)
    }

    /// Roles in order
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    /// Number of roles
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether no roles are required
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Default for RequiredRoleSet {
    fn default() -> Self {
        Self::new(DEFAULT_REQUIRED_ROLES.iter().copied())
    }
}

/// Policy principal for a service account email
pub fn service_account_member(email: &str) -> String {
    format!("serviceAccount:{}", email)
}

/// Add every missing required role for `principal` to `policy`.
///
/// Returns the policy and whether anything was added; persist the policy
/// only when it was.
pub fn ensure_roles(
    mut policy: PolicyDocument,
    principal: &str,
    required: &RequiredRoleSet,
) -> (PolicyDocument, bool) {
    let mut roles_added = false;

    for role in required.iter() {
        if policy.has_role(principal, role) {
            debug!(role = %role, principal = %principal, "Role already bound");
            continue;
        }

        match policy
            .bindings
            .iter_mut()
            .find(|b| b.role == role && b.is_unconditional())
        {
            Some(binding) => binding.members.push(principal.to_string()),
            None => policy.bindings.push(Binding {
                role: role.to_string(),
                members: vec![principal.to_string()],
                condition: None,
            }),
        }

        info!(role = %role, principal = %principal, "Adding role binding");
        roles_added = true;
    }

    (policy, roles_added)
}

// =============================================================================
// Reconciliation against the platform
// =============================================================================

/// Reconciles required roles against a project's live policy
pub struct RoleBindingManager {
    policies: Arc<dyn PolicyApi>,
    retry: RetryPolicy,
    write_attempts: u32,
}

impl RoleBindingManager {
    /// Create a manager
    ///
    /// `retry` covers reads and writes failing on a not-yet-visible
    /// principal; `write_attempts` bounds re-reads after a stale etag.
    pub fn new(policies: Arc<dyn PolicyApi>, retry: RetryPolicy, write_attempts: u32) -> Self {
        Self {
            policies,
            retry,
            write_attempts: write_attempts.max(1),
        }
    }

    /// Make sure `principal` holds every role in `required` on `project`.
    ///
    /// Returns whether the policy was written.
    pub async fn reconcile(
        &self,
        project: &str,
        principal: &str,
        required: &RequiredRoleSet,
    ) -> Result<bool> {
        let mut attempt = 0u32;

        loop {
            attempt += 1;

            let current = self
                .retry
                .execute("get_policy", || self.policies.get_policy(project))
                .await?;

            let (updated, roles_added) = ensure_roles(current, principal, required);
            if !roles_added {
                info!(principal = %principal, "Principal already has all required roles");
                return Ok(false);
            }

            match self
                .retry
                .execute("set_policy", || self.policies.set_policy(project, &updated))
                .await
            {
                Ok(_) => {
                    info!(project = %project, principal = %principal, "Policy updated");
                    return Ok(true);
                }
                Err(Error::Conflict { message, .. }) if attempt < self.write_attempts => {
                    warn!(
                        project = %project,
                        attempt,
                        error = %message,
                        "Policy changed concurrently, re-reading"
                    );
                }
                Err(e) => return Err(e),
            }
        }
    }
}
