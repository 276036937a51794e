//! Bounded parallel execution of independent setup operations
//!
//! Every submitted operation yields exactly one [`OperationResult`], in
//! completion order. A failure, a timeout or even a panic in one operation
//! never cancels or hides the others; interpreting the aggregate is left
//! to the caller.

use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::process::Stdio;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::process::Command;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::config::RunnerConfig;
use crate::{Error, Result};

/// A unit of work: resolves to a success message or an error
pub type Operation = BoxFuture<'static, Result<String>>;

/// Outcome of one labelled operation
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OperationResult {
    /// Label the operation was submitted under
    pub label: String,
    /// Whether the operation succeeded
    pub success: bool,
    /// Output on success, error description on failure
    pub message: String,
}

impl OperationResult {
    fn ok(label: String, message: String) -> Self {
        Self {
            label,
            success: true,
            message,
        }
    }

    fn failed(label: String, message: String) -> Self {
        Self {
            label,
            success: false,
            message,
        }
    }
}

/// Run `operations` with at most `config.concurrency` in flight.
///
/// Each operation is bounded by `config.timeout`; the clock starts once it
/// holds a slot.
pub async fn run_parallel(
    operations: Vec<(String, Operation)>,
    config: &RunnerConfig,
) -> Vec<OperationResult> {
    let slots = Arc::new(Semaphore::new(config.concurrency.max(1)));
    let timeout = config.timeout;
    let mut labels = BTreeMap::new();
    let mut tasks = JoinSet::new();

    for (idx, (label, op)) in operations.into_iter().enumerate() {
        labels.insert(idx, label.clone());
        let slots = slots.clone();

        tasks.spawn(async move {
            let _permit = match slots.acquire_owned().await {
                Ok(permit) => permit,
                Err(e) => return (idx, OperationResult::failed(label, e.to_string())),
            };

            debug!(operation = %label, "Starting operation");
            let outcome = tokio::time::timeout(timeout, AssertUnwindSafe(op).catch_unwind()).await;

            let result = match outcome {
                Ok(Ok(Ok(message))) => OperationResult::ok(label, message),
                Ok(Ok(Err(e))) => OperationResult::failed(label, e.to_string()),
                Ok(Err(panic)) => OperationResult::failed(label, panic_message(panic.as_ref())),
                Err(_) => {
                    let err = Error::Timeout {
                        label: label.clone(),
                        after: timeout,
                    };
                    OperationResult::failed(label, err.to_string())
                }
            };
            (idx, result)
        });
    }

    let mut results = Vec::with_capacity(labels.len());
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((idx, result)) => {
                labels.remove(&idx);
                if !result.success {
                    warn!(operation = %result.label, error = %result.message, "Operation failed");
                }
                results.push(result);
            }
            Err(e) => warn!(error = %e, "Operation task aborted"),
        }
    }

    // Tasks that died without reporting still get a result
    for (_, label) in labels {
        results.push(OperationResult::failed(label, "operation aborted".to_string()));
    }

    results
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("operation panicked: {}", s)
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("operation panicked: {}", s)
    } else {
        "operation panicked".to_string()
    }
}

/// Build an [`Operation`] that runs an external program.
///
/// Succeeds with trimmed stdout when the program exits 0, otherwise fails
/// with its trimmed stderr. The child is killed if the operation is dropped
/// (e.g. on timeout).
pub fn command_operation(label: &str, program: &str, args: Vec<String>) -> Operation {
    let label = label.to_string();
    let program = program.to_string();

    async move {
        let output = Command::new(&program)
            .args(&args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| Error::command(&label, format!("failed to run {}: {}", program, e)))?;

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            let message = if stderr.is_empty() {
                format!("{} exited with {}", program, output.status)
            } else {
                stderr
            };
            Err(Error::command(&label, message))
        }
    }
    .boxed()
}
