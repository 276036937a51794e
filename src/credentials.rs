//! Service identity credential issuance
//!
//! Keys are issued through [`IdentityApi::create_key`] under a
//! [`RetryPolicy`], since a newly created identity may not be visible to
//! the key subsystem yet. The raw key bytes never leave this module: they
//! are base64-encoded into a [`Credential`] and zeroized.
//!
//! Failure to issue a key is not a provisioning failure. The identity
//! exists either way; the caller decides what a missing credential means.

use std::fmt;
use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD, Engine};
use tracing::{info, warn};
use zeroize::{Zeroize, Zeroizing};

use crate::platform::IdentityApi;
use crate::retry::RetryPolicy;

/// Base64-encoded service identity key (zeroized on drop)
#[derive(Clone, PartialEq, Eq)]
pub struct Credential(Zeroizing<String>);

impl Credential {
    /// Encode raw key bytes, wiping the input
    pub fn from_key_bytes(mut raw: Vec<u8>) -> Self {
        let encoded = STANDARD.encode(&raw);
        raw.zeroize();
        Self(Zeroizing::new(encoded))
    }

    /// The encoded key
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credential(<redacted>)")
    }
}

/// What came of a credential request
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CredentialOutcome {
    /// A key was issued
    Issued(Credential),
    /// No key could be issued; the identity itself is still usable
    Unavailable {
        /// Last error from the platform
        reason: String,
    },
}

impl CredentialOutcome {
    /// The credential, when one was issued
    pub fn credential(&self) -> Option<&Credential> {
        match self {
            CredentialOutcome::Issued(c) => Some(c),
            CredentialOutcome::Unavailable { .. } => None,
        }
    }
}

/// Issues keys for service identities
pub struct CredentialIssuer {
    identities: Arc<dyn IdentityApi>,
    retry: RetryPolicy,
}

impl CredentialIssuer {
    /// Create an issuer
    pub fn new(identities: Arc<dyn IdentityApi>, retry: RetryPolicy) -> Self {
        Self { identities, retry }
    }

    /// Issue a key for the service account `email` in `project`.
    pub async fn issue(&self, project: &str, email: &str) -> CredentialOutcome {
        let result = self
            .retry
            .execute("create_key", || self.identities.create_key(project, email))
            .await;

        match result {
            Ok(raw) => {
                info!(principal = %email, "Issued service account key");
                CredentialOutcome::Issued(Credential::from_key_bytes(raw))
            }
            Err(e) => {
                warn!(principal = %email, error = %e, "Could not issue service account key");
                CredentialOutcome::Unavailable {
                    reason: e.to_string(),
                }
            }
        }
    }
}
