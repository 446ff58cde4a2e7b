//! Deploy Verifier CLI
//!
//! Runs the verification pipeline against a throwaway kind cluster.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use tokio::signal;

use deploy_verifier::{
    ClusterProvider, KindProvider, Orchestrator, Result, RunConfig, SystemRunner, ToolLocator,
    Validate,
};

#[derive(Parser)]
#[command(name = "deploy-verifier", author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Provision a cluster, deploy, verify, and tear down.
    Run(RunArgs),
    /// Check tools and configuration without touching any cluster.
    Check(ConfigArgs),
    /// Delete a leftover cluster.
    Cleanup(CleanupArgs),
}

#[derive(Args)]
struct ConfigArgs {
    /// TOML or YAML run configuration.
    #[arg(short, long, env = "DEPLOY_VERIFIER_CONFIG")]
    config: Option<PathBuf>,
}

#[derive(Args)]
struct RunArgs {
    #[command(flatten)]
    config: ConfigArgs,

    #[arg(long)]
    cluster_name: Option<String>,

    #[arg(short, long)]
    namespace: Option<String>,

    /// Seconds to keep the cluster after the run before deleting it.
    #[arg(long, value_name = "SECS")]
    keep_for: Option<u64>,

    /// Never delete the cluster.
    #[arg(long)]
    keep_cluster: bool,

    /// Write a JSON run report here.
    #[arg(long, value_name = "FILE")]
    report: Option<PathBuf>,
}

#[derive(Args)]
struct CleanupArgs {
    #[command(flatten)]
    config: ConfigArgs,

    #[arg(long)]
    cluster_name: Option<String>,
}

fn load_config(path: Option<&Path>) -> Result<RunConfig> {
    match path {
        Some(path) => RunConfig::load(path),
        None => Ok(RunConfig::default()),
    }
}

fn validate(config: &RunConfig) -> Result<()> {
    for warning in config.validate().into_result()? {
        tracing::warn!(%warning, "configuration warning");
    }
    Ok(())
}

/// Resolves on SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        match signal::ctrl_c().await {
            Ok(()) => tracing::warn!("received SIGINT, tearing down"),
            Err(e) => {
                tracing::error!(error = %e, "failed to listen for SIGINT");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
                tracing::warn!("received SIGTERM, tearing down");
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

async fn run(args: RunArgs) -> Result<i32> {
    let mut config = load_config(args.config.config.as_deref())?;
    if let Some(name) = args.cluster_name {
        config = config.with_cluster_name(name);
    }
    if let Some(namespace) = args.namespace {
        config = config.with_namespace(namespace);
    }
    if let Some(secs) = args.keep_for {
        config = config.with_keep_for(Duration::from_secs(secs));
    }
    if args.keep_cluster {
        config = config.with_keep_cluster(true);
    }
    validate(&config)?;

    let orchestrator = Orchestrator::new(config)?;
    let result = orchestrator.run_until(shutdown_signal()).await;

    if let Some(path) = &args.report {
        match result.report.write_to(path) {
            Ok(()) => tracing::info!(path = %path.display(), "wrote run report"),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "failed to write run report")
            }
        }
    }

    if let Some(credentials) = &result.credentials {
        if result.report.exit_code() == 0 {
            println!("Admin username: {}", credentials.username);
            println!("Admin password: {}", credentials.password);
        }
    }

    Ok(result.report.exit_code())
}

fn check(args: ConfigArgs) -> Result<i32> {
    let config = load_config(args.config.as_deref())?;
    validate(&config)?;
    ToolLocator::from_env().check(config.tools.required())?;

    tracing::info!(cluster = %config.cluster_name, namespace = %config.namespace, "ready to run");
    Ok(0)
}

fn cleanup(args: CleanupArgs) -> Result<i32> {
    let mut config = load_config(args.config.config.as_deref())?;
    if let Some(name) = args.cluster_name {
        config = config.with_cluster_name(name);
    }

    let kind = KindProvider::new(std::sync::Arc::new(SystemRunner), &config.tools.kind);
    kind.delete(&config.cluster_name)?;
    tracing::info!(cluster = %config.cluster_name, "cluster deleted");
    Ok(0)
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let result = match Cli::parse().command {
        Command::Run(args) => run(args).await,
        Command::Check(args) => check(args),
        Command::Cleanup(args) => cleanup(args),
    };

    match result {
        Ok(code) => ExitCode::from(code as u8),
        Err(e) => {
            tracing::error!(error = %e, "deploy-verifier failed");
            ExitCode::FAILURE
        }
    }
}
