//! Groundwork - idempotent provisioning of the cloud resources a workload
//! deployment needs before it can run
//!
//! For a project and an agent (workload) name, groundwork makes sure that:
//! - a staging bucket exists and is owned by the project
//! - a service identity exists, holds the required roles, and has a key
//! - the platform services the deployment relies on are enabled
//!
//! Every operation is safe to re-run. Existing resources are reused, and
//! names taken by someone else are skipped in favour of the next candidate.
//!
//! # Modules
//!
//! - [`naming`] - Deterministic candidate name sequences
//! - [`provisioner`] - Probe/create state machine over candidate names
//! - [`policy`] - Project policy read-modify-write for role bindings
//! - [`credentials`] - Service identity key issuance
//! - [`retry`] - Backoff for eventually consistent platform state
//! - [`runner`] - Bounded parallel execution of setup operations
//! - [`platform`] - Capability traits over the cloud platform
//! - [`gcloud`] - Platform implementation backed by the `gcloud` CLI
//! - [`config`] - Tunables and their defaults
//! - [`error`] - Error types

#![deny(missing_docs)]

pub mod config;
pub mod credentials;
pub mod error;
pub mod gcloud;
pub mod naming;
pub mod platform;
pub mod policy;
pub mod provisioner;
pub mod retry;
pub mod runner;

pub use config::{ProvisionConfig, RunnerConfig};
pub use credentials::{Credential, CredentialOutcome};
pub use error::Error;
pub use naming::ResourceKind;
pub use provisioner::{ProvisionResult, Provisioner};

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;
