mod config;
mod control;
mod plan;
mod run_cmd;
mod serve;

use std::path::PathBuf;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};

use config::ForemanConfig;

#[derive(Parser)]
#[command(name = "foreman", about = "Crash-recoverable orchestrator for staged coding agents")]
struct Cli {
    /// Control server port (overrides config file)
    #[arg(long, global = true)]
    port: Option<u16>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a foreman config file with a generated webhook secret
    Init {
        /// Overwrite an existing config file
        #[arg(long)]
        force: bool,
    },
    /// Execute a plan: create or recover state, then run to completion
    Run {
        /// Path to the plan file
        plan: PathBuf,
        /// Maximum number of concurrent team leads
        #[arg(long)]
        max_leads: Option<usize>,
        /// Retries after a failed first attempt
        #[arg(long)]
        retry_count: Option<u32>,
    },
    /// Pause all services, or one service
    Pause {
        /// Service to pause (omit to pause everything)
        service: Option<String>,
    },
    /// Resume all services, or one service
    Resume {
        /// Service to resume (omit to resume everything)
        service: Option<String>,
    },
    /// Show engine status (falls back to the checkpoint when no run is active)
    Status {
        /// Project id for the checkpoint fallback
        #[arg(long)]
        project: Option<String>,
    },
    /// Reopen a paused service so its remaining tasks run
    Retry {
        /// Service to retry
        service: String,
    },
    /// Resolve a blocker directly, without a ticket comment
    Resolve {
        /// Blocker id
        blocker_id: String,
        /// The human answer
        answer: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = ForemanConfig::resolve()?;
    let port = cli.port.unwrap_or(config.port);

    match cli.command {
        Commands::Init { force } => init(force),
        Commands::Run {
            plan,
            max_leads,
            retry_count,
        } => {
            run_cmd::run(
                config,
                run_cmd::RunArgs {
                    plan,
                    max_leads,
                    retry_count,
                    port: cli.port,
                },
            )
            .await
        }
        Commands::Pause { service } => {
            let path = match &service {
                Some(name) => format!("/api/services/{name}/pause"),
                None => "/api/pause".to_string(),
            };
            print_json(control::post(port, &path, None).await?);
            Ok(())
        }
        Commands::Resume { service } => {
            let path = match &service {
                Some(name) => format!("/api/services/{name}/resume"),
                None => "/api/resume".to_string(),
            };
            print_json(control::post(port, &path, None).await?);
            Ok(())
        }
        Commands::Status { project } => status(&config, port, project.as_deref()).await,
        Commands::Retry { service } => {
            print_json(control::post(port, &format!("/api/services/{service}/resume"), None).await?);
            Ok(())
        }
        Commands::Resolve { blocker_id, answer } => {
            print_json(
                control::post(
                    port,
                    &format!("/api/blockers/{blocker_id}/resolve"),
                    Some(serde_json::json!({ "answer": answer })),
                )
                .await?,
            );
            Ok(())
        }
    }
}

fn init(force: bool) -> Result<()> {
    let path = config::config_path();
    if path.exists() && !force {
        bail!(
            "config file already exists at {} (use --force to overwrite)",
            path.display()
        );
    }
    let mut file = config::ConfigFile::default();
    file.tickets.webhook_secret = config::generate_webhook_secret();
    config::save_config(&file)?;
    println!("wrote {}", path.display());
    Ok(())
}

async fn status(config: &ForemanConfig, port: u16, project: Option<&str>) -> Result<()> {
    match control::get(port, "/api/status").await {
        Ok(json) => {
            print_json(json);
            Ok(())
        }
        Err(e) => {
            let Some(project) = project else {
                bail!("{e:#}\nno active run reachable; pass --project to read the checkpoint");
            };
            let store =
                foreman_state::CheckpointStore::new(config.data_dir.join("projects"));
            let state = store.load(project).await?;
            println!(
                "{} (from checkpoint): {} tasks, {} succeeded, {} failed, {} pending",
                project, state.total_tasks, state.succeeded, state.failed, state.pending
            );
            for (name, service) in &state.services {
                println!(
                    "  {name}: {}/{} complete{}",
                    service.completed_task_ids.len(),
                    service.task_ids.len(),
                    if service.paused { " (paused)" } else { "" }
                );
            }
            Ok(())
        }
    }
}

fn print_json(value: serde_json::Value) {
    println!(
        "{}",
        serde_json::to_string_pretty(&value).unwrap_or_else(|_| value.to_string())
    );
}
