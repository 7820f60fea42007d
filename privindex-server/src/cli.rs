//! Command-line interface for the index server
//!
//! Every command builds a [`WorkflowState`] from the settings flags and
//! acts with the admin secret of the instance it targets.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing::info;

use crate::backend::{OperationStatus, PackageMeta};
use crate::config::{
    ServerSettings, DEFAULT_AUTH_READ_EXPIRES, DEFAULT_AUTH_WRITE_EXPIRES, DEFAULT_SYNC_DEADLINE,
};
use crate::scheduler::TokioScheduler;
use crate::sync::{self, IndexSyncScheduler, SyncOutcome};
use crate::{BackendRegistry, WorkflowState};

/// Command-line interface for the private package index
#[derive(Parser)]
#[command(name = "privindex")]
#[command(about = "Private package index over pluggable storage backends")]
#[command(version)]
#[command(
    after_help = "Sync:\n  sync            Run the index sync daemon\n  sync-once       One sync cycle for every instance\n  publish-index   Rebuild and publish an instance index\n\nPackages:\n  upload          Upload a package file\n  list            List distributions or files"
)]
pub struct Cli {
    #[command(flatten)]
    pub settings: SettingsArgs,

    #[command(subcommand)]
    pub command: Commands,
}

/// Flags shared by every command, each with an environment fallback
#[derive(Args, Debug, Clone)]
pub struct SettingsArgs {
    /// Backend-instance config file
    #[arg(long, env = "PRIVINDEX_CONFIG", global = true)]
    pub config: Option<PathBuf>,
    /// Admin secret file, one secret per instance
    #[arg(long, env = "PRIVINDEX_ADMIN_SECRET", global = true)]
    pub admin_secret: Option<PathBuf>,
    /// Root folder for indexes, locks and caches
    #[arg(long, env = "PRIVINDEX_ROOT", global = true)]
    pub root: Option<PathBuf>,
    /// Read-auth cache TTL in seconds
    #[arg(long, env = "PRIVINDEX_AUTH_READ_EXPIRES", default_value_t = DEFAULT_AUTH_READ_EXPIRES, global = true)]
    pub auth_read_expires: u64,
    /// Write-auth cache TTL in seconds
    #[arg(long, env = "PRIVINDEX_AUTH_WRITE_EXPIRES", default_value_t = DEFAULT_AUTH_WRITE_EXPIRES, global = true)]
    pub auth_write_expires: u64,
    /// Deadline for one sync cycle of one instance, in seconds
    #[arg(long, default_value_t = DEFAULT_SYNC_DEADLINE, global = true)]
    pub sync_deadline: u64,
}

impl SettingsArgs {
    pub fn to_settings(&self) -> Result<ServerSettings> {
        let config = self
            .config
            .clone()
            .ok_or_else(|| anyhow!("--config (or PRIVINDEX_CONFIG) is required"))?;
        let mut settings = ServerSettings::new(config);
        settings.admin_secret = self.admin_secret.clone();
        if let Some(root) = &self.root {
            settings.root = root.clone();
        }
        settings.auth_read_expires = self.auth_read_expires;
        settings.auth_write_expires = self.auth_write_expires;
        settings.sync_deadline = self.sync_deadline;
        Ok(settings)
    }
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the index sync daemon until Ctrl-C
    Sync,
    /// Run one sync cycle for every instance and report
    SyncOnce,
    /// Rebuild an instance index from storage and publish it
    PublishIndex {
        /// Backend instance name
        instance: String,
    },
    /// Upload a package file
    Upload {
        /// Backend instance name
        instance: String,
        /// Package file to upload
        file: PathBuf,
        /// Package metadata as key=value, e.g. --meta name=Foo
        #[arg(long = "meta", value_parser = parse_meta_pair)]
        meta: Vec<(String, String)>,
    },
    /// List distributions, or the files of one distribution
    List {
        /// Backend instance name
        instance: String,
        /// Distribution to list files for
        distrib: Option<String>,
        /// Print JSON instead of plain lines
        #[arg(long)]
        json: bool,
    },
}

fn parse_meta_pair(raw: &str) -> std::result::Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => {
            Ok((key.trim().to_string(), value.to_string()))
        }
        _ => Err(format!("expected key=value, got '{raw}'")),
    }
}

/// Execute the CLI command
pub async fn run() -> Result<()> {
    let cli = Cli::parse();
    let settings = cli.settings.to_settings()?;
    let state = Arc::new(
        WorkflowState::from_settings(&settings, BackendRegistry::global())
            .await
            .context("Failed to initialize backend instances")?,
    );
    handle_command(cli.command, state, &settings).await
}

async fn handle_command(
    command: Commands,
    state: Arc<WorkflowState>,
    settings: &ServerSettings,
) -> Result<()> {
    match command {
        Commands::Sync => handle_sync(state, settings).await,
        Commands::SyncOnce => handle_sync_once(&state).await,
        Commands::PublishIndex { instance } => handle_publish(&state, &instance).await,
        Commands::Upload {
            instance,
            file,
            meta,
        } => handle_upload(&state, &instance, file, meta).await,
        Commands::List {
            instance,
            distrib,
            json,
        } => handle_list(&state, &instance, distrib.as_deref(), json).await,
    }
}

async fn handle_sync(state: Arc<WorkflowState>, settings: &ServerSettings) -> Result<()> {
    let scheduler = TokioScheduler::new();
    let daemon = IndexSyncScheduler::spawn(&scheduler, state, settings.sync_deadline());
    info!(tasks = daemon.len(), "Index sync daemon started");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    info!("Shutting down index sync daemon");
    daemon.shutdown();
    Ok(())
}

async fn handle_sync_once(state: &WorkflowState) -> Result<()> {
    let outcomes = sync::sync_all(state).await;
    let mut failures = 0;
    for (name, outcome) in &outcomes {
        if !outcome.is_ok() {
            failures += 1;
        }
        println!("{name}: {outcome}");
    }
    if failures > 0 {
        bail!("{failures} of {} instances failed to sync", outcomes.len());
    }
    Ok(())
}

async fn handle_publish(state: &WorkflowState, instance: &str) -> Result<()> {
    let secret = admin_secret(state, instance)?;
    let packages = sync::publish_index(state, instance, secret.as_ref()).await?;
    println!("Published index of \"{instance}\" with {packages} packages");

    // Pick up the new index locally right away.
    match sync::sync_instance(state, instance).await {
        SyncOutcome::Failed { message, .. } => bail!("Local sync after publish failed: {message}"),
        _ => Ok(()),
    }
}

async fn handle_upload(
    state: &WorkflowState,
    instance: &str,
    file: PathBuf,
    meta: Vec<(String, String)>,
) -> Result<()> {
    let secret = admin_secret(state, instance)?;
    let filename = file
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| anyhow!("Invalid file path: {}", file.display()))?
        .to_string();
    let meta: PackageMeta = meta.into_iter().collect();

    let result = state
        .upload_package(instance, secret.as_ref(), &filename, meta, &file)
        .await?;
    match (result.status, result.pkg_ref) {
        (OperationStatus::Succeeded, Some(pkg_ref)) => {
            println!(
                "Uploaded {} to \"{instance}\" (distrib={}, sha256={})",
                pkg_ref.filename(),
                pkg_ref.distrib,
                pkg_ref.sha256
            );
            Ok(())
        }
        _ => bail!("Upload failed: {}", result.message),
    }
}

async fn handle_list(
    state: &WorkflowState,
    instance: &str,
    distrib: Option<&str>,
    json: bool,
) -> Result<()> {
    let secret = admin_secret(state, instance)?;
    let index = state.index_for_read(instance, secret.as_ref()).await?;

    match distrib {
        None => {
            let distribs: Vec<&str> = index.all_distributions().collect();
            if json {
                println!("{}", serde_json::to_string_pretty(&distribs)?);
            } else {
                for distrib in distribs {
                    println!("{distrib}");
                }
            }
        }
        Some(distrib) => {
            let pkg_refs = index
                .get_pkg_refs(distrib)
                .ok_or_else(|| anyhow!("distrib={distrib} not found."))?;
            if json {
                println!("{}", serde_json::to_string_pretty(pkg_refs)?);
            } else {
                for pkg_ref in pkg_refs {
                    println!("{}  sha256={}", pkg_ref.filename(), pkg_ref.sha256);
                }
            }
        }
    }
    Ok(())
}

fn admin_secret(
    state: &WorkflowState,
    instance: &str,
) -> Result<Arc<dyn crate::backend::RepoSecret>> {
    state.instance(instance)?;
    state
        .admin_secret(instance)
        .ok_or_else(|| anyhow!("secret of \"{instance}\" is not provided (see --admin-secret)"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_upload_meta_pairs() {
        let cli = Cli::try_parse_from([
            "privindex",
            "--config",
            "c.toml",
            "upload",
            "local",
            "pkg-1.0.tar.gz",
            "--meta",
            "name=Pkg",
            "--meta",
            "summary=a=b",
        ])
        .unwrap();
        match cli.command {
            Commands::Upload { meta, .. } => assert_eq!(
                meta,
                vec![
                    ("name".to_string(), "Pkg".to_string()),
                    ("summary".to_string(), "a=b".to_string())
                ]
            ),
            _ => panic!("expected upload"),
        }
        assert!(parse_meta_pair("=x").is_err());
        assert!(parse_meta_pair("novalue").is_err());
    }

    #[test]
    fn test_settings_from_flags() {
        let cli = Cli::try_parse_from([
            "privindex",
            "--config",
            "c.toml",
            "--root",
            "/srv/privindex",
            "--auth-read-expires",
            "10",
            "sync-once",
        ])
        .unwrap();
        let settings = cli.settings.to_settings().unwrap();
        assert_eq!(settings.config, PathBuf::from("c.toml"));
        assert_eq!(settings.root, PathBuf::from("/srv/privindex"));
        assert_eq!(settings.auth_read_expires, 10);
    }
}
