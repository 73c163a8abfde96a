//! taskmesh command-line front end
//!
//! Mirrors JSON fixture files into a persistent task collection and plans
//! tasks for a day.
//!
//! Usage:
//!   taskmesh refresh tasks.json
//!   taskmesh list tasks.json
//!   taskmesh plan tasks.json --add 12 --remove 7 --date 2026-10-20

use anyhow::{Context, Result};
use chrono::{Local, NaiveDate};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use taskmesh_cache::JsonFileBackend;
use taskmesh_cli::{FixtureExtension, summarize_commit, summarize_refresh};
use taskmesh_extension::Extension;
use taskmesh_sync::{MutationKind, SyncConfig, TaskMesh};
use taskmesh_types::SourceIdentity;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser, Debug)]
#[command(name = "taskmesh")]
#[command(about = "Sync tasks from several sources into one collection")]
struct Args {
    /// Path to the TOML configuration file
    #[arg(short, long, default_value = "taskmesh.toml")]
    config: PathBuf,

    /// Path to the persisted cache blob
    #[arg(short, long, default_value = "taskmesh-data.json")]
    data: PathBuf,

    /// Enable verbose debug logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Refresh a fixture source and print the report
    Refresh { fixture: PathBuf },

    /// Refresh a fixture source and print its entities as JSON
    List { fixture: PathBuf },

    /// Stage tasks for a day and commit the plan
    Plan {
        fixture: PathBuf,

        /// Source keys to schedule
        #[arg(long)]
        add: Vec<String>,

        /// Source keys to unschedule
        #[arg(long)]
        remove: Vec<String>,

        /// Day to plan, defaults to today
        #[arg(long)]
        date: Option<NaiveDate>,
    },
}

impl Command {
    fn fixture(&self) -> &Path {
        match self {
            Self::Refresh { fixture } | Self::List { fixture } | Self::Plan { fixture, .. } => {
                fixture.as_path()
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let default_level = if args.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact()
        .init();

    let config = SyncConfig::load_from(&args.config);
    let mesh = TaskMesh::init(config, Arc::new(JsonFileBackend::new(args.data.clone())));

    let fixture = args.command.fixture();
    let extension = FixtureExtension::open(fixture)
        .await
        .with_context(|| format!("failed to open fixture {}", fixture.display()))?;
    let extension_id = extension.id().to_string();
    mesh.install(Arc::new(extension))?;
    mesh.activate(&extension_id)
        .await
        .with_context(|| format!("failed to activate source '{extension_id}'"))?;

    let result = run(&mesh, &extension_id, args.command).await;
    mesh.shutdown().await;
    result
}

async fn run(mesh: &TaskMesh, extension_id: &str, command: Command) -> Result<()> {
    let report = mesh.refresh(extension_id).await?;

    match command {
        Command::Refresh { .. } => {
            println!("{}", summarize_refresh(&report));
        }
        Command::List { .. } => {
            let entities = mesh.collection().entities_for(extension_id);
            println!("{}", serde_json::to_string_pretty(&entities)?);
        }
        Command::Plan {
            add, remove, date, ..
        } => {
            let date = date.unwrap_or_else(|| Local::now().date_naive());
            mesh.staging().start_session();
            stage_keys(mesh, extension_id, &add, MutationKind::Add)?;
            stage_keys(mesh, extension_id, &remove, MutationKind::Remove)?;

            let commit = mesh.commit_plan(date).await;
            println!("{}", summarize_commit(&commit));
            commit.into_result()?;
            info!(%date, "plan committed");
        }
    }
    Ok(())
}

fn stage_keys(
    mesh: &TaskMesh,
    extension_id: &str,
    keys: &[String],
    kind: MutationKind,
) -> Result<()> {
    for key in keys {
        let identity = SourceIdentity::new(extension_id, key.as_str());
        match mesh.collection().find_by_identity(&identity) {
            Some(entity) => mesh.staging().stage(entity.id, kind)?,
            None => warn!(key = %key, "no task with this key, skipping"),
        }
    }
    Ok(())
}
