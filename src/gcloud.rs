//! Platform implementation backed by the `gcloud` CLI
//!
//! Every call runs `gcloud ... --format=json` with a timeout and maps a
//! non-zero exit onto the crate error taxonomy by inspecting stderr. The
//! same stderr can mean different things depending on the call:
//!
//! - probing a bucket that belongs to another project is denied rather than
//!   missing, so a denial on a bucket probe is a `Conflict`
//! - "does not exist" on a probe means create it; on a call that depends on
//!   a just-created identity it means not propagated yet

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::process::{Output, Stdio};
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::config::{RunnerConfig, DEFAULT_OPERATION_TIMEOUT};
use crate::naming::ResourceKind;
use crate::platform::{
    service_account_email, BucketApi, BucketSpec, IdentityApi, PolicyApi, ServiceAccount,
    ServiceAccountSpec,
};
use crate::policy::PolicyDocument;
use crate::runner::{command_operation, run_parallel, Operation};
use crate::{Error, Result};

/// Platform APIs a workload deployment needs enabled
pub const REQUIRED_SERVICES: &[&str] = &[
    "iam.googleapis.com",
    "cloudresourcemanager.googleapis.com",
    "aiplatform.googleapis.com",
    "storage.googleapis.com",
];

/// What a failed call was doing, for stderr classification
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum CallKind {
    /// Looking up a resource by name
    Probe(ResourceKind),
    /// Creating a resource, or any other call taken at face value
    Create,
    /// Acting on a resource that may have just been created
    Dependent,
}

const NOT_FOUND_SIGNS: &[&str] = &["not_found", "not found", "does not exist"];
const CONFLICT_SIGNS: &[&str] = &[
    "already_exists",
    "already exists",
    "not available",
    "aborted",
    "concurrent policy changes",
    "etag",
];
const DENIED_SIGNS: &[&str] = &["permission_denied", "permission denied", "does not have", "forbidden", "denied"];

fn contains_any(haystack: &str, needles: &[&str]) -> bool {
    needles.iter().any(|n| haystack.contains(n))
}

/// Map gcloud stderr onto the error taxonomy
fn classify(call: CallKind, name: &str, stderr: &str) -> Error {
    let lower = stderr.to_lowercase();
    let message = stderr.trim().to_string();

    if contains_any(&lower, NOT_FOUND_SIGNS) {
        return match call {
            CallKind::Probe(kind) => Error::not_found(kind, name),
            CallKind::Dependent => Error::propagation_delay(name, message),
            CallKind::Create => Error::unclassified(name, message),
        };
    }
    if contains_any(&lower, CONFLICT_SIGNS) {
        return Error::conflict(name, message);
    }
    if contains_any(&lower, DENIED_SIGNS) {
        return match call {
            CallKind::Probe(ResourceKind::Bucket) => Error::conflict(name, message),
            _ => Error::permission_denied(name, message),
        };
    }
    Error::unclassified(name, message)
}

/// `gcloud` CLI client
#[derive(Clone, Debug)]
pub struct GcloudCli {
    program: PathBuf,
    timeout: Duration,
}

impl Default for GcloudCli {
    fn default() -> Self {
        Self::new()
    }
}

impl GcloudCli {
    /// Client using `gcloud` from `PATH`
    pub fn new() -> Self {
        Self {
            program: PathBuf::from("gcloud"),
            timeout: DEFAULT_OPERATION_TIMEOUT,
        }
    }

    /// Use a specific binary
    pub fn with_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.program = program.into();
        self
    }

    /// Bound every call
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn output(&self, args: &[String]) -> Result<Output> {
        debug!(program = %self.program.display(), args = ?args, "Running gcloud");

        let label = args.iter().take(3).cloned().collect::<Vec<_>>().join(" ");
        let child = Command::new(&self.program)
            .args(args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output();

        match tokio::time::timeout(self.timeout, child).await {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(e)) => Err(Error::command(
                label,
                format!("failed to run {}: {}", self.program.display(), e),
            )),
            Err(_) => Err(Error::Timeout {
                label,
                after: self.timeout,
            }),
        }
    }

    /// Run a call, returning stdout or a classified error
    async fn call(&self, call: CallKind, name: &str, args: Vec<String>) -> Result<String> {
        let output = self.output(&args).await?;
        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).into_owned())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(classify(call, name, &stderr))
        }
    }

    /// Names of the services enabled on a project
    pub async fn enabled_services(&self, project: &str) -> Result<BTreeSet<String>> {
        let stdout = self
            .call(
                CallKind::Create,
                project,
                args(&["services", "list", "--enabled", "--project", project, "--format=json"]),
            )
            .await?;
        parse_service_list(&stdout)
    }

    /// Enable `services` on `project`, skipping those already enabled.
    ///
    /// Enablement runs as a parallel batch. A failed operation still counts
    /// as success if the service shows up as enabled afterwards. When
    /// anything was newly enabled, waits `settle` before returning so
    /// resources can be created against the new services.
    pub async fn enable_services(
        &self,
        project: &str,
        services: &[&str],
        runner: &RunnerConfig,
        settle: Duration,
    ) -> Result<EnableReport> {
        let enabled = self.enabled_services(project).await?;
        let (already, missing): (Vec<&str>, Vec<&str>) =
            services.iter().copied().partition(|s| enabled.contains(*s));

        for service in &already {
            info!(service = %service, "Service already enabled");
        }
        if missing.is_empty() {
            return Ok(EnableReport {
                already_enabled: to_strings(&already),
                newly_enabled: Vec::new(),
            });
        }

        let program = self.program.to_string_lossy().into_owned();
        let ops: Vec<(String, Operation)> = missing
            .iter()
            .map(|&service| {
                let op = command_operation(
                    service,
                    &program,
                    args(&["services", "enable", service, "--project", project, "--quiet"]),
                );
                (service.to_string(), op)
            })
            .collect();

        info!(count = ops.len(), "Enabling services in parallel");
        let results = run_parallel(ops, runner).await;

        let failed: Vec<_> = results.iter().filter(|r| !r.success).collect();
        let recheck = if failed.is_empty() {
            BTreeSet::new()
        } else {
            self.enabled_services(project).await?
        };

        let mut still_failed = Vec::new();
        for result in &failed {
            if recheck.contains(&result.label) {
                info!(service = %result.label, "Service enabled despite reported error");
            } else {
                warn!(service = %result.label, error = %result.message, "Failed to enable service");
                still_failed.push(format!("{}: {}", result.label, result.message));
            }
        }

        if !still_failed.is_empty() {
            return Err(Error::command("enable services", still_failed.join("; ")));
        }

        if !settle.is_zero() {
            info!(delay_ms = settle.as_millis() as u64, "Waiting for enabled services to propagate");
            tokio::time::sleep(settle).await;
        }

        Ok(EnableReport {
            already_enabled: to_strings(&already),
            newly_enabled: to_strings(&missing),
        })
    }
}

/// Result of [`GcloudCli::enable_services`]
#[derive(Clone, Debug, Default, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EnableReport {
    /// Services that were enabled before the call
    pub already_enabled: Vec<String>,
    /// Services enabled by the call
    pub newly_enabled: Vec<String>,
}

fn args(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|s| s.to_string()).collect()
}

fn to_strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

#[derive(Deserialize)]
struct ServiceEntry {
    name: String,
    #[serde(default)]
    config: Option<ServiceEntryConfig>,
}

#[derive(Deserialize)]
struct ServiceEntryConfig {
    name: String,
}

fn parse_service_list(json: &str) -> Result<BTreeSet<String>> {
    let entries: Vec<ServiceEntry> = serde_json::from_str(json)?;
    Ok(entries
        .into_iter()
        .map(|e| match e.config {
            Some(config) => config.name,
            None => e.name.rsplit('/').next().unwrap_or_default().to_string(),
        })
        .collect())
}

// =============================================================================
// Platform trait implementations
// =============================================================================

#[async_trait]
impl BucketApi for GcloudCli {
    async fn get_bucket(&self, name: &str) -> Result<()> {
        self.call(
            CallKind::Probe(ResourceKind::Bucket),
            name,
            args(&["storage", "buckets", "describe", &format!("gs://{}", name), "--format=json"]),
        )
        .await
        .map(|_| ())
    }

    async fn create_bucket(&self, name: &str, spec: &BucketSpec) -> Result<()> {
        self.call(
            CallKind::Create,
            name,
            args(&[
                "storage",
                "buckets",
                "create",
                &format!("gs://{}", name),
                "--project",
                &spec.project,
                "--location",
                &spec.location,
                "--default-storage-class",
                &spec.storage_class,
                "--format=json",
            ]),
        )
        .await
        .map(|_| ())
    }
}

#[async_trait]
impl IdentityApi for GcloudCli {
    async fn get_service_account(&self, project: &str, email: &str) -> Result<ServiceAccount> {
        let stdout = self
            .call(
                CallKind::Probe(ResourceKind::ServiceIdentity),
                email,
                args(&["iam", "service-accounts", "describe", email, "--project", project, "--format=json"]),
            )
            .await?;
        Ok(serde_json::from_str(&stdout)?)
    }

    async fn create_service_account(&self, spec: &ServiceAccountSpec) -> Result<ServiceAccount> {
        let stdout = self
            .call(
                CallKind::Create,
                &spec.account_id,
                args(&[
                    "iam",
                    "service-accounts",
                    "create",
                    &spec.account_id,
                    "--project",
                    &spec.project,
                    "--display-name",
                    &spec.display_name,
                    "--description",
                    &spec.description,
                    "--format=json",
                ]),
            )
            .await?;

        if stdout.trim().is_empty() {
            return Ok(ServiceAccount {
                email: service_account_email(&spec.account_id, &spec.project),
                unique_id: None,
                display_name: Some(spec.display_name.clone()),
            });
        }
        Ok(serde_json::from_str(&stdout)?)
    }

    async fn create_key(&self, project: &str, email: &str) -> Result<Vec<u8>> {
        let dir = tempfile::tempdir()?;
        let key_path = dir.path().join("key.json");
        let key_arg = key_path.to_string_lossy().into_owned();

        self.call(
            CallKind::Dependent,
            email,
            args(&[
                "iam",
                "service-accounts",
                "keys",
                "create",
                &key_arg,
                "--iam-account",
                email,
                "--project",
                project,
                "--key-file-type=json",
            ]),
        )
        .await?;

        Ok(tokio::fs::read(&key_path).await?)
    }
}

#[async_trait]
impl PolicyApi for GcloudCli {
    async fn get_policy(&self, project: &str) -> Result<PolicyDocument> {
        let stdout = self
            .call(
                CallKind::Dependent,
                project,
                args(&["projects", "get-iam-policy", project, "--format=json"]),
            )
            .await?;
        Ok(serde_json::from_str(&stdout)?)
    }

    async fn set_policy(&self, project: &str, policy: &PolicyDocument) -> Result<PolicyDocument> {
        let file = tempfile::Builder::new().suffix(".json").tempfile()?;
        serde_json::to_writer(file.as_file(), policy)?;
        let path = file.path().to_string_lossy().into_owned();

        let stdout = self
            .call(
                CallKind::Dependent,
                project,
                args(&["projects", "set-iam-policy", project, &path, "--format=json"]),
            )
            .await?;
        Ok(serde_json::from_str(&stdout)?)
    }
}
