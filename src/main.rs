//! Groundwork CLI - provision deployment prerequisites for a workload

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use groundwork::gcloud::{GcloudCli, REQUIRED_SERVICES};
use groundwork::{CredentialOutcome, ProvisionConfig, ProvisionResult, Provisioner};

/// Groundwork - idempotent provisioning of workload deployment prerequisites
#[derive(Parser, Debug)]
#[command(name = "groundwork", version, about, long_about = None)]
struct Cli {
    /// Target project
    #[arg(long, global = true, env = "GOOGLE_CLOUD_PROJECT")]
    project: Option<String>,

    /// JSON config file overriding the defaults
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Path to the gcloud binary
    #[arg(long, global = true, default_value = "gcloud")]
    gcloud: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Enable the platform services deployments rely on
    EnableApis,

    /// Ensure the staging bucket and service identity for an agent
    ///
    /// Existing resources owned by the project are reused. Prints a JSON
    /// summary on stdout.
    Provision(ProvisionArgs),
}

#[derive(Args, Debug)]
struct ProvisionArgs {
    /// Agent (workload) name the resources are derived from
    #[arg(long, env = "AGENT_NAME")]
    agent: String,

    /// Deployment environment recorded on the identity
    #[arg(long = "env", env = "DEPLOY_ENV", default_value = "dev")]
    environment: String,

    /// Include the base64 service identity key in the output
    #[arg(long)]
    emit_credential: bool,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ProvisionSummary<'a> {
    project: &'a str,
    agent: &'a str,
    environment: &'a str,
    bucket: &'a ProvisionResult,
    service_identity: &'a ProvisionResult,
    credential_issued: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    credential_error: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    credential: Option<&'a str>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Logs go to stderr so stdout stays machine-readable
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => ProvisionConfig::from_file(path)?,
        None => ProvisionConfig::default(),
    };
    let project = cli
        .project
        .as_deref()
        .ok_or_else(|| anyhow::anyhow!("--project or GOOGLE_CLOUD_PROJECT is required"))?;

    let gcloud = GcloudCli::new()
        .with_program(&cli.gcloud)
        .with_timeout(config.runner.timeout);

    match cli.command {
        Commands::EnableApis => {
            let report = gcloud
                .enable_services(
                    project,
                    REQUIRED_SERVICES,
                    &config.runner,
                    config.settle_after_enable,
                )
                .await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Provision(args) => provision(gcloud, config, project, args).await?,
    }

    Ok(())
}

async fn provision(
    gcloud: GcloudCli,
    config: ProvisionConfig,
    project: &str,
    args: ProvisionArgs,
) -> anyhow::Result<()> {
    let platform = Arc::new(gcloud);
    let provisioner = Provisioner::new(platform.clone(), platform.clone(), platform, config);

    info!(project = %project, agent = %args.agent, "Provisioning deployment prerequisites");
    let (bucket, identity) = tokio::try_join!(
        provisioner.ensure_bucket(project, &args.agent),
        provisioner.ensure_service_identity(project, &args.agent, &args.environment),
    )?;

    let credential_error = match &identity.credential {
        Some(CredentialOutcome::Unavailable { reason }) => Some(reason.as_str()),
        _ => None,
    };
    let issued = identity.identity_credential();

    let summary = ProvisionSummary {
        project,
        agent: &args.agent,
        environment: &args.environment,
        bucket: &bucket,
        service_identity: &identity,
        credential_issued: issued.is_some(),
        credential_error,
        credential: issued.filter(|_| args.emit_credential).map(|c| c.expose()),
    };
    println!("{}", serde_json::to_string_pretty(&summary)?);

    Ok(())
}
