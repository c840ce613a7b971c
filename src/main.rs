use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use console::style;
use maestro_hive::catalog::{BlueprintCatalog, PersonaCatalog, ReusePlan};
use maestro_hive::config::EngineConfig;
use maestro_hive::errors::EngineError;
use maestro_hive::policy::{PolicyBundle, PolicyEngine};
use maestro_hive::runner::CommandExecutor;
use maestro_hive::supervisor::{ExecutionStatus, ExecutionSupervisor, StartRequest};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "hive")]
#[command(version, about = "Workflow execution kernel for multi-agent development workflows")]
struct Cli {
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Directory containing hive.toml (defaults to the current directory)
    #[arg(long, global = true)]
    config_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start an execution and follow it to completion
    Run {
        /// The user requirement to decompose
        #[arg(short, long)]
        requirement: String,
        /// Comma-separated persona ids (alternative to --blueprint)
        #[arg(long, value_delimiter = ',')]
        personas: Vec<String>,
        /// Blueprint id resolving to a persona set
        #[arg(long)]
        blueprint: Option<String>,
        /// Persona catalog JSON file
        #[arg(long)]
        catalog: PathBuf,
        /// Blueprint catalog JSON file
        #[arg(long)]
        blueprints: Option<PathBuf>,
        /// Parsed policy bundle JSON file
        #[arg(long)]
        policy: PathBuf,
        /// Reuse decision map JSON file
        #[arg(long)]
        reuse: Option<PathBuf>,
        /// Execution id (generated when absent)
        #[arg(long)]
        execution_id: Option<String>,
    },
    /// Show the status snapshot of an execution
    Status {
        execution_id: String,
        /// Persona catalog JSON file
        #[arg(long)]
        catalog: PathBuf,
        /// Parsed policy bundle JSON file
        #[arg(long)]
        policy: PathBuf,
    },
    /// List executions under the checkpoint root
    List {
        #[arg(long)]
        catalog: PathBuf,
        #[arg(long)]
        policy: PathBuf,
    },
    /// Recover and resume a paused or interrupted execution
    Resume {
        execution_id: String,
        #[arg(long)]
        catalog: PathBuf,
        #[arg(long)]
        policy: PathBuf,
    },
    /// Cooperatively cancel an execution
    Cancel {
        execution_id: String,
        #[arg(long)]
        catalog: PathBuf,
        #[arg(long)]
        policy: PathBuf,
    },
}

fn init_tracing(verbose: bool) {
    let filter = if verbose { "maestro_hive=debug" } else { "maestro_hive=info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .with_target(false)
        .init();
}

fn load_policy(path: &PathBuf) -> Result<PolicyEngine> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read policy bundle: {}", path.display()))?;
    let bundle: PolicyBundle = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse policy bundle: {}", path.display()))?;
    Ok(PolicyEngine::new(bundle))
}

fn build_supervisor(
    config: EngineConfig,
    catalog: &PathBuf,
    blueprints: Option<&PathBuf>,
    policy: &PathBuf,
) -> Result<ExecutionSupervisor, EngineError> {
    let personas = PersonaCatalog::load(catalog).map_err(EngineError::Other)?;
    let blueprint_catalog = match blueprints {
        Some(path) => BlueprintCatalog::load(path).map_err(EngineError::Other)?,
        None => BlueprintCatalog::default(),
    };
    let engine = load_policy(policy).map_err(EngineError::Other)?;

    let mut supervisor =
        ExecutionSupervisor::new(config.clone(), engine, personas, blueprint_catalog)?;
    if !config.executors.is_empty() {
        supervisor = supervisor
            .with_executor(Arc::new(CommandExecutor::new(config.executors.clone())));
    }
    Ok(supervisor)
}

fn print_status(snapshot: &maestro_hive::supervisor::ExecutionSnapshot) {
    println!(
        "{} {} ({:.0}%)",
        style(&snapshot.execution_id).bold(),
        style(snapshot.status.to_string()).cyan(),
        snapshot.progress_percent
    );
    if let Some(ref phase) = snapshot.current_phase {
        println!("  current phase: {phase}");
    }
    for phase in &snapshot.phases {
        println!(
            "  {} {} (iteration {})",
            style(&phase.phase_id).dim(),
            phase.state,
            phase.iteration_index
        );
    }
    for node in &snapshot.nodes {
        println!(
            "    {} {} (attempt {})",
            node.node_id,
            node.state,
            node.attempt_count
        );
    }
    if let Some(ref failure) = snapshot.last_failure {
        println!(
            "  {} {}: {}",
            style("last failure").red(),
            failure.failed_node,
            failure.message
        );
    }
    for rec in &snapshot.recommendations {
        println!("  {} {rec}", style("hint").yellow());
    }
}

/// Exit code for a terminal execution: 2 for policy failures, 3 for the
/// rest, 0 on success.
fn exit_code_for(
    snapshot: &maestro_hive::supervisor::ExecutionSnapshot,
    status: ExecutionStatus,
) -> i32 {
    match status {
        ExecutionStatus::Completed => 0,
        ExecutionStatus::Cancelled | ExecutionStatus::Paused => 1,
        _ => {
            let policy_failure = snapshot
                .phases
                .iter()
                .any(|p| p.state == maestro_hive::phase::PhaseState::Blocked)
                || snapshot.last_failure.as_ref().is_some_and(|f| {
                    f.category == maestro_hive::breaker::FailureCategory::QualityGate
                });
            if policy_failure { 2 } else { 3 }
        }
    }
}

async fn run(cli: Cli) -> Result<i32, EngineError> {
    let config_dir = cli
        .config_dir
        .clone()
        .unwrap_or_else(|| PathBuf::from("."));
    let config = EngineConfig::load_or_default(&config_dir).map_err(EngineError::Other)?;

    match cli.command {
        Commands::Run {
            requirement,
            personas,
            blueprint,
            catalog,
            blueprints,
            policy,
            reuse,
            execution_id,
        } => {
            let reuse_plan = match reuse {
                Some(path) => {
                    let content = std::fs::read_to_string(&path)
                        .with_context(|| format!("Failed to read reuse map: {}", path.display()))
                        .map_err(EngineError::Other)?;
                    serde_json::from_str::<ReusePlan>(&content)
                        .context("Failed to parse reuse map")
                        .map_err(EngineError::Other)?
                }
                None => ReusePlan::default(),
            };

            let supervisor =
                build_supervisor(config, &catalog, blueprints.as_ref(), &policy)?;
            let execution_id = supervisor
                .start(StartRequest {
                    execution_id,
                    requirement,
                    personas,
                    blueprint_id: blueprint,
                    reuse: reuse_plan,
                })
                .await?;

            println!("{} {execution_id}", style("started").green());
            let status = supervisor.wait(&execution_id).await?;
            let snapshot = supervisor.status(&execution_id).await?;
            print_status(&snapshot);
            Ok(exit_code_for(&snapshot, status))
        }
        Commands::Status {
            execution_id,
            catalog,
            policy,
        } => {
            let supervisor = build_supervisor(config, &catalog, None, &policy)?;
            let snapshot = supervisor.status(&execution_id).await?;
            print_status(&snapshot);
            Ok(0)
        }
        Commands::List { catalog, policy } => {
            let supervisor = build_supervisor(config, &catalog, None, &policy)?;
            for execution_id in supervisor.checkpoints().list()? {
                match supervisor.status(&execution_id).await {
                    Ok(snapshot) => println!(
                        "{}  {}  {:.0}%",
                        execution_id,
                        snapshot.status,
                        snapshot.progress_percent
                    ),
                    Err(e) => println!("{execution_id}  {}", style(e.to_string()).red()),
                }
            }
            Ok(0)
        }
        Commands::Resume {
            execution_id,
            catalog,
            policy,
        } => {
            let supervisor = build_supervisor(config, &catalog, None, &policy)?;
            supervisor.recover_all().await?;
            supervisor.resume(&execution_id).await?;
            let status = supervisor.wait(&execution_id).await?;
            let snapshot = supervisor.status(&execution_id).await?;
            print_status(&snapshot);
            Ok(exit_code_for(&snapshot, status))
        }
        Commands::Cancel {
            execution_id,
            catalog,
            policy,
        } => {
            let supervisor = build_supervisor(config, &catalog, None, &policy)?;
            supervisor.recover_all().await?;
            supervisor.cancel(&execution_id).await?;
            supervisor.wait(&execution_id).await?;
            println!("{} {execution_id}", style("cancelled").yellow());
            Ok(0)
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match run(cli).await {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("{} {e}", style("error:").red().bold());
            std::process::exit(e.exit_code());
        }
    }
}
