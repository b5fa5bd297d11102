use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use crate::application::{Application, InitBuilder};
use crate::config::Config;
use crate::services::{ExecutionCreateRequest, ExecutionEventRequest, ExecutionListRequest};
use crate::types::{ClaimOutcome, ExecutionKey, ExecutionPhase};

#[derive(Parser)]
#[command(name = "execution-store")]
#[command(about = "Execution store - claim and track workflow executions in Postgres", long_about = None)]
pub struct Cli {
    /// Path to config file (overrides default search)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Database URL (overrides config file and env vars)
    #[arg(long, global = true)]
    pub database_url: Option<String>,

    /// Log per-operation store latencies
    #[arg(long, global = true)]
    pub trace_metrics: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Apply embedded database migrations
    Migrate,

    /// Create an execution
    Create {
        #[arg(short = 'p', long)]
        project: String,

        #[arg(short = 'd', long)]
        domain: String,

        /// Execution name (generated when omitted)
        #[arg(short = 'n', long)]
        name: Option<String>,

        #[arg(long)]
        launch_plan_id: Option<i64>,

        #[arg(long)]
        workflow_id: Option<i64>,

        #[arg(long)]
        task_id: Option<i64>,

        /// File holding the opaque execution spec
        #[arg(long)]
        spec_file: Option<PathBuf>,

        #[arg(long)]
        inputs_uri: Option<String>,
    },

    /// Show an execution
    Get {
        /// Execution key as project/domain/name
        #[arg(value_parser = parse_key)]
        key: ExecutionKey,

        /// Show only input and output locations
        #[arg(long)]
        data: bool,
    },

    /// List executions in a project and domain
    List {
        #[arg(short = 'p', long)]
        project: String,

        #[arg(short = 'd', long)]
        domain: String,

        /// Filter expression, e.g. "eq(phase, RUNNING)+contains(name, nightly)"
        #[arg(short = 'f', long, default_value = "")]
        filters: String,

        #[arg(short = 'l', long, default_value = "20")]
        limit: i64,

        /// Token returned by the previous page
        #[arg(short = 't', long, default_value = "")]
        token: String,

        /// Sort key, e.g. created_at or launch_plan.name
        #[arg(long)]
        sort_by: Option<String>,

        #[arg(long)]
        desc: bool,
    },

    /// Show the event log of an execution
    Events {
        #[arg(value_parser = parse_key)]
        key: ExecutionKey,
    },

    /// Record a phase transition
    Event {
        #[arg(value_parser = parse_key)]
        key: ExecutionKey,

        /// New phase, e.g. RUNNING
        phase: ExecutionPhase,

        /// Event metadata (JSON object)
        #[arg(long)]
        metadata: Option<String>,

        #[arg(long)]
        outputs_uri: Option<String>,
    },

    /// Abort a running execution
    Terminate {
        #[arg(value_parser = parse_key)]
        key: ExecutionKey,

        #[arg(short = 'c', long)]
        cause: String,
    },

    /// Launch a copy of an existing execution
    Relaunch {
        #[arg(value_parser = parse_key)]
        key: ExecutionKey,

        /// Name of the new execution (generated when omitted)
        #[arg(short = 'n', long)]
        name: Option<String>,
    },

    /// Claim the next eligible execution once
    Claim {
        /// Identity recorded on the claimed execution
        #[arg(long)]
        cluster: Option<String>,
    },

    /// Keep claiming executions until interrupted
    Poll {
        #[arg(long)]
        cluster: Option<String>,

        /// Stop after this many claims
        #[arg(long)]
        max: Option<usize>,
    },

    /// Inspect configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
}

#[derive(Subcommand)]
pub enum ConfigCommand {
    /// Print the effective configuration as TOML
    Show,
}

/// Parse `project/domain/name`
pub fn parse_key(value: &str) -> Result<ExecutionKey, String> {
    let parts: Vec<&str> = value.split('/').collect();
    match parts.as_slice() {
        [project, domain, name]
            if !project.is_empty() && !domain.is_empty() && !name.is_empty() =>
        {
            Ok(ExecutionKey::new(*project, *domain, *name))
        }
        _ => Err(format!(
            "expected project/domain/name, got '{}'",
            value
        )),
    }
}

/// Run the CLI by parsing process arguments
pub async fn run_cli() -> Result<()> {
    let cli = Cli::parse();
    run_cli_with_args(cli).await
}

async fn connect(cli: &Cli, auto_migrate: bool) -> Result<Application> {
    let mut builder = InitBuilder::new()
        .auto_migrate(auto_migrate)
        .trace_metrics(cli.trace_metrics);
    if let Some(url) = &cli.database_url {
        builder = builder.database_url(url.clone());
    }
    if let Some(path) = &cli.config {
        builder = builder.config_path(path.clone());
    }
    builder.init().await
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!(
        "{}",
        serde_json::to_string_pretty(value).context("Failed to render output")?
    );
    Ok(())
}

async fn run_cli_with_args(cli: Cli) -> Result<()> {
    if let Commands::Config { command: ConfigCommand::Show } = &cli.command {
        let config = Config::builder()
            .database_url(cli.database_url.clone())
            .config_path(cli.config.clone())
            .build()?;
        print!("{}", config.to_toml()?);
        return Ok(());
    }

    if let Commands::Migrate = &cli.command {
        println!("Running migrations...");
        connect(&cli, true).await?;
        println!("Migrations complete!");
        return Ok(());
    }

    let app = connect(&cli, false).await?;
    let service = &app.execution_service;

    match cli.command {
        Commands::Migrate | Commands::Config { .. } => {}

        Commands::Create {
            project,
            domain,
            name,
            launch_plan_id,
            workflow_id,
            task_id,
            spec_file,
            inputs_uri,
        } => {
            let spec = match spec_file {
                Some(path) => std::fs::read(&path)
                    .with_context(|| format!("Failed to read spec file {}", path.display()))?,
                None => Vec::new(),
            };
            let key = service
                .create_execution(ExecutionCreateRequest {
                    project,
                    domain,
                    name,
                    launch_plan_id,
                    workflow_id,
                    task_id,
                    spec,
                    inputs_uri,
                })
                .await?;
            println!("{}", key);
        }

        Commands::Get { key, data } => {
            if data {
                print_json(&service.get_execution_data(&key).await?)?;
            } else {
                print_json(&service.get_execution(&key).await?)?;
            }
        }

        Commands::List {
            project,
            domain,
            filters,
            limit,
            token,
            sort_by,
            desc,
        } => {
            let page = service
                .list_executions(ExecutionListRequest {
                    project,
                    domain,
                    filters,
                    limit,
                    token,
                    sort_by,
                    descending: desc,
                })
                .await?;

            if page.executions.is_empty() {
                println!("No executions found");
            } else {
                println!("{:<8} {:<40} {:<12} {:<16} {}", "ID", "KEY", "PHASE", "CLUSTER", "UPDATED");
                for execution in &page.executions {
                    println!(
                        "{:<8} {:<40} {:<12} {:<16} {}",
                        execution.id,
                        execution.key().to_string(),
                        execution.phase.as_str(),
                        execution.cluster.as_deref().unwrap_or("-"),
                        execution.updated_at.format("%Y-%m-%d %H:%M:%S")
                    );
                }
            }
            if !page.token.is_empty() {
                println!("\nNext page: --token {}", page.token);
            }
        }

        Commands::Events { key } => {
            let execution = service.get_execution(&key).await?;
            for event in service.repo().list_events(execution.id).await? {
                println!(
                    "{} {:<12} {}",
                    event.occurred_at.format("%Y-%m-%d %H:%M:%S%.3f"),
                    event.phase.as_str(),
                    event.metadata
                );
            }
        }

        Commands::Event {
            key,
            phase,
            metadata,
            outputs_uri,
        } => {
            let metadata = metadata
                .map(|raw| serde_json::from_str(&raw).context("Invalid metadata JSON"))
                .transpose()?;
            let execution = service
                .record_execution_event(ExecutionEventRequest {
                    key,
                    phase,
                    occurred_at: None,
                    metadata,
                    outputs_uri,
                })
                .await?;
            println!("{} is now {}", execution.key(), execution.phase);
        }

        Commands::Terminate { key, cause } => {
            let execution = service.terminate_execution(&key, &cause).await?;
            println!("{} terminated: {}", execution.key(), cause);
        }

        Commands::Relaunch { key, name } => {
            let relaunched = service.relaunch_execution(&key, name).await?;
            println!("{}", relaunched);
        }

        Commands::Claim { cluster } => match service.retrieve_and_lock_execution(cluster).await? {
            ClaimOutcome::Claimed(execution) => print_json(&execution)?,
            ClaimOutcome::NoneEligible => println!("No eligible execution"),
        },

        Commands::Poll { cluster, max } => {
            let limit = max.unwrap_or(usize::MAX);
            if limit == 0 {
                return Err(anyhow!("--max must be greater than 0"));
            }

            let cancel = CancellationToken::new();
            let on_interrupt = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    on_interrupt.cancel();
                }
            });

            let poller = app.claim_poller(cluster);
            let mut claimed = 0;
            let stop = cancel.clone();
            poller
                .run(&cancel, |execution| {
                    claimed += 1;
                    println!(
                        "claimed {} (id {}) as {}",
                        execution.key(),
                        execution.id,
                        execution.cluster.as_deref().unwrap_or("-")
                    );
                    if claimed >= limit {
                        stop.cancel();
                    }
                    std::future::ready(())
                })
                .await?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_key() {
        assert_eq!(
            parse_key("flytesnacks/development/abc123").unwrap(),
            ExecutionKey::new("flytesnacks", "development", "abc123")
        );
        assert!(parse_key("p/d").is_err());
        assert!(parse_key("p//n").is_err());
        assert!(parse_key("p/d/n/extra").is_err());
    }

    #[test]
    fn test_cli_parses_commands() {
        let cli = Cli::try_parse_from([
            "execution-store",
            "--database-url",
            "postgresql://localhost/x",
            "event",
            "p/d/n1",
            "running",
            "--metadata",
            "{\"node\":\"n0\"}",
        ])
        .unwrap();
        assert_eq!(cli.database_url.as_deref(), Some("postgresql://localhost/x"));
        match cli.command {
            Commands::Event { key, phase, metadata, .. } => {
                assert_eq!(key, ExecutionKey::new("p", "d", "n1"));
                assert_eq!(phase, ExecutionPhase::Running);
                assert!(metadata.is_some());
            }
            _ => panic!("expected event command"),
        }

        let cli = Cli::try_parse_from(["execution-store", "list", "-p", "p", "-d", "d"]).unwrap();
        match cli.command {
            Commands::List { limit, token, .. } => {
                assert_eq!(limit, 20);
                assert!(token.is_empty());
            }
            _ => panic!("expected list command"),
        }

        assert!(Cli::try_parse_from(["execution-store", "get", "not-a-key"]).is_err());
    }
}
