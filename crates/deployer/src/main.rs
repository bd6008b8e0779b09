//! Deployer CLI
//!
//! Deploys a file or the whole workspace to the targets configured in
//! `deploy.toml`.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use deploy_runtime::{CancelSignal, Orchestrator};
use deploy_types::{DeployConfig, DeployReport};
use deployer::{FileOrFolder, builtin_registry, file_or_folder, workspace_files};

/// Deploy files to configured targets
#[derive(Parser, Debug)]
#[command(name = "deployer")]
#[command(about = "Deploy files to configured targets", long_about = None)]
struct Args {
    /// Path to the configuration file
    #[arg(short, long, default_value = deploy_types::CONFIG_FILE, global = true)]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List configured targets
    Targets,

    /// Deploy one file, or every non-ignored file of a folder
    File {
        /// File or folder to deploy, relative to the workspace root or absolute
        file: PathBuf,

        /// Target name or glob pattern (repeatable, default: all targets)
        #[arg(short, long = "target")]
        targets: Vec<String>,
    },

    /// Deploy every non-ignored file of the workspace
    Workspace {
        /// Target name or glob pattern (repeatable, default: all targets)
        #[arg(short, long = "target")]
        targets: Vec<String>,
    },
}

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error("{failed} of {total} targets failed")]
    TargetsFailed { failed: usize, total: usize },

    #[error("No files to deploy under {0}")]
    NoFiles(PathBuf),
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("deployer=info,deploy_runtime=info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    let config = DeployConfig::load(&args.config)
        .await
        .with_context(|| format!("Failed to load {}", args.config.display()))?;

    let orchestrator = Arc::new(Orchestrator::new(config, builtin_registry()));
    let result = run(&orchestrator, args.command).await;
    orchestrator.shutdown();
    result
}

async fn run(orchestrator: &Arc<Orchestrator>, command: Command) -> Result<()> {
    let report = match command {
        Command::Targets => {
            list_targets(orchestrator);
            return Ok(());
        }
        Command::File { file, targets } => {
            let root = orchestrator.context().workspace_root().to_path_buf();
            match file_or_folder(&root, &file) {
                FileOrFolder::File(file) => {
                    let cancel = cancel_on_signal();
                    orchestrator.deploy_file(&file, &targets, &cancel).await?
                }
                FileOrFolder::Folder { dir, files } => {
                    if files.is_empty() {
                        return Err(CliError::NoFiles(dir).into());
                    }
                    info!("Deploying {} files from {}", files.len(), dir.display());

                    let cancel = cancel_on_signal();
                    orchestrator.deploy_workspace(&files, &targets, &cancel).await?
                }
            }
        }
        Command::Workspace { targets } => {
            let root = orchestrator.context().workspace_root().to_path_buf();
            let files = workspace_files(&root);
            if files.is_empty() {
                return Err(CliError::NoFiles(root).into());
            }
            info!("Deploying {} files from {}", files.len(), root.display());

            let cancel = cancel_on_signal();
            orchestrator.deploy_workspace(&files, &targets, &cancel).await?
        }
    };

    print_report(&report);

    let failed = report.failures().count();
    if failed > 0 {
        return Err(CliError::TargetsFailed {
            failed,
            total: report.targets.len(),
        }
        .into());
    }
    Ok(())
}

fn list_targets(orchestrator: &Orchestrator) {
    let targets = orchestrator.targets();
    if targets.is_empty() {
        println!("No targets configured");
        return;
    }

    let width = targets.iter().map(|t| t.name.len()).max().unwrap_or(0);
    for target in targets {
        println!(
            "{:width$}  {:8}  {}",
            target.name,
            target.plugin_type,
            target.description.as_deref().unwrap_or("")
        );
    }
}

fn print_report(report: &DeployReport) {
    for target in &report.targets {
        let status = match (&target.error, target.canceled) {
            (Some(e), _) => format!("failed: {e}"),
            (None, true) => "canceled".to_string(),
            (None, false) => "ok".to_string(),
        };
        println!("{} ({}): {}", target.target, target.plugin_type, status);

        for file in target.files.iter().filter(|f| f.error.is_some()) {
            if let Some(e) = &file.error {
                println!("  {}: {}", file.file.display(), e);
            }
        }
    }
}

/// A cancel signal fired by Ctrl+C or SIGTERM
fn cancel_on_signal() -> CancelSignal {
    let cancel = CancelSignal::new();
    let trigger = cancel.clone();

    tokio::spawn(async move {
        let ctrl_c = async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("Failed to listen for Ctrl+C: {}", e);
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut signal) => {
                    signal.recv().await;
                }
                Err(e) => {
                    warn!("Failed to listen for SIGTERM: {}", e);
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => info!("Received Ctrl+C, canceling..."),
            _ = terminate => info!("Received terminate signal, canceling..."),
        }
        trigger.cancel();
    });

    cancel
}
