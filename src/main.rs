use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use council_exec::checks::CheckKind;
use council_exec::config::Config;
use council_exec::credentials::{
    delete_actor_token, set_actor_token, ChainedCredentials, CredentialProvider, HttpHeaderAuth,
};
use council_exec::evidence::EvidenceWriter;
use council_exec::github::GitHubClient;
use council_exec::model::{ExecutionRequest, ExecutionResult, GateDecision, LogPhase, WorkOrder};
use council_exec::publisher::PrPublisher;
use council_exec::store::{FileStore, RunStore};
use council_exec::transport::{
    ExecutionTransport, LiveSettings, LiveTransport, SimulatedTransport,
};
use council_exec::workspace::WorkspaceManager;
use council_exec::{ControllerSettings, ExecutionController, Stores};
use serde::Deserialize;
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

const LOG_ENV: &str = "COUNCIL_LOG";

/// Build and test children stop this long before their phase limit.
const STEP_LIMIT_MARGIN: Duration = Duration::from_secs(5);

#[derive(Parser, Debug)]
#[command(
    name = "council-exec",
    about = "Execute council-approved work orders as pull requests",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run work orders against a repository and open a pull request
    Execute(ExecuteArgs),

    /// Show one run with its full log
    Show {
        run_id: Uuid,
    },

    /// List recent runs, newest first
    #[command(alias = "ls")]
    List {
        #[arg(long)]
        project: Option<String>,
        #[arg(short = 'n', long, default_value_t = 20)]
        limit: usize,
        #[arg(long)]
        json: bool,
    },

    /// Stream a run's log as newline-delimited JSON
    Logs {
        run_id: Uuid,
    },

    /// Manage per-actor repository credentials
    #[command(subcommand)]
    Auth(AuthCommands),

    /// Load work orders and gate decisions from a JSON file
    Import {
        path: PathBuf,
    },

    /// Remove workspaces left behind by interrupted runs
    Gc {
        #[arg(long)]
        max_age_hours: Option<u64>,
    },

    /// Mark work orders of completed runs IN_PROGRESS where that never landed
    Reconcile,

    /// Show the config file location and effective settings
    Config {
        /// Write the default config if none exists
        #[arg(long)]
        init: bool,
    },
}

#[derive(Args, Debug)]
struct ExecuteArgs {
    #[arg(long)]
    owner: String,
    #[arg(long)]
    repo: String,
    /// Branch the pull request targets (default: main)
    #[arg(long)]
    branch: Option<String>,
    #[arg(long = "work-order", short = 'w', required = true)]
    work_orders: Vec<String>,
    #[arg(long)]
    actor: String,
    #[arg(long)]
    project: Option<String>,
    #[arg(long)]
    gate_decision: Option<String>,
    /// Simulate every external step; nothing is cloned, pushed or mutated
    #[arg(long)]
    dry_run: bool,
    /// Print the result as JSON
    #[arg(long)]
    json: bool,
}

#[derive(Subcommand, Debug)]
enum AuthCommands {
    /// Store a token for an actor in the OS keychain (read from stdin)
    Set {
        #[arg(long)]
        actor: String,
    },
    /// Check whether a credential is available for an actor
    Status {
        #[arg(long)]
        actor: String,
    },
    /// Remove an actor's token from the OS keychain
    Clear {
        #[arg(long)]
        actor: String,
    },
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ImportFile {
    work_orders: Vec<WorkOrder>,
    gate_decisions: Vec<GateDecision>,
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();
    match run(Cli::parse()).await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("Error: {:#}", err);
            ExitCode::FAILURE
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .init();
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let config = Config::load();
    match cli.command {
        Commands::Execute(args) => execute(&config, args).await,
        Commands::Show { run_id } => {
            let controller = open_controller(&config, true)?;
            let details = controller
                .get_run(run_id)?
                .with_context(|| format!("No execution run {}", run_id))?;
            println!("{}", serde_json::to_string_pretty(&details)?);
            Ok(ExitCode::SUCCESS)
        }
        Commands::List {
            project,
            limit,
            json,
        } => {
            let controller = open_controller(&config, true)?;
            let runs = controller.list_recent_runs(project.as_deref(), limit)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&runs)?);
            } else if runs.is_empty() {
                println!("No execution runs recorded.");
            } else {
                for overview in &runs {
                    let run = &overview.run;
                    println!(
                        "{}  {:<11}  {:<30}  {}{}",
                        run.id,
                        run.status.as_str(),
                        run.target_label(),
                        run.created_at.format("%Y-%m-%d %H:%M:%S"),
                        if run.simulated { "  (dry run)" } else { "" }
                    );
                }
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::Logs { run_id } => {
            let store = open_store(&config)?;
            let logs = store.list_logs(run_id)?;
            let stdout = io::stdout();
            let mut out = stdout.lock();
            for log in logs {
                writeln!(out, "{}", serde_json::to_string(&log)?)?;
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::Auth(command) => auth(command).await,
        Commands::Import { path } => {
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            let file: ImportFile = serde_json::from_str(&content)
                .with_context(|| format!("Invalid import file {}", path.display()))?;
            let store = open_store(&config)?;
            let (orders, gates) = (file.work_orders.len(), file.gate_decisions.len());
            for order in file.work_orders {
                store.put_work_order(order)?;
            }
            for decision in file.gate_decisions {
                store.put_gate_decision(decision)?;
            }
            println!("Imported {} work order(s) and {} gate decision(s)", orders, gates);
            Ok(ExitCode::SUCCESS)
        }
        Commands::Gc { max_age_hours } => {
            let hours = max_age_hours.unwrap_or(config.stale_workspace_hours);
            let workspaces = workspace_manager(&config)?;
            let removed = workspaces.sweep_stale(Duration::from_secs(hours.saturating_mul(3600)))?;
            println!(
                "Removed {} stale workspace(s) from {}",
                removed,
                workspaces.root().display()
            );
            Ok(ExitCode::SUCCESS)
        }
        Commands::Reconcile => {
            let controller = open_controller(&config, true)?;
            let changed = controller.reconcile_work_orders()?;
            println!("Reconciled {} work order(s)", changed);
            Ok(ExitCode::SUCCESS)
        }
        Commands::Config { init } => {
            let path = Config::config_path().context("Could not determine config directory")?;
            if init && !path.exists() {
                Config::default().save_to(&path)?;
                println!("Wrote default config to {}", path.display());
            }
            println!("Config file: {}", path.display());
            println!("{}", serde_json::to_string_pretty(&config)?);
            let resolved = config.resolve()?;
            println!("Data directory: {}", resolved.data_dir.display());
            println!("Evidence directory: {}", resolved.evidence_dir.display());
            println!("Workspace root: {}", resolved.workspace_root.display());
            Ok(ExitCode::SUCCESS)
        }
    }
}

async fn execute(config: &Config, args: ExecuteArgs) -> Result<ExitCode> {
    let mut request = ExecutionRequest::new(args.owner, args.repo, args.work_orders, args.actor);
    request.target_branch = args.branch;
    request.project_id = args.project;
    request.gate_decision_ref = args.gate_decision;

    let controller = Arc::new(open_controller(config, args.dry_run)?);
    let handle = match controller.start(request) {
        Ok(handle) => handle,
        Err(rejected) => {
            print_result(&rejected, args.json)?;
            return Ok(ExitCode::FAILURE);
        }
    };

    let run_id = handle.run_id();
    eprintln!(
        "Execution run {}{}",
        run_id,
        if args.dry_run { " (dry run)" } else { "" }
    );

    let mut wait = Box::pin(handle.wait());
    let finished = tokio::select! {
        result = &mut wait => Some(result),
        _ = tokio::signal::ctrl_c() => None,
    };
    let result = match finished {
        Some(result) => result,
        None => {
            eprintln!("Cancelling run {}...", run_id);
            controller.cancel(run_id);
            wait.await
        }
    };

    print_result(&result, args.json)?;
    Ok(if result.success {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn print_result(result: &ExecutionResult, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(result)?);
        return Ok(());
    }
    if result.success {
        println!(
            "Pull request #{} opened: {}",
            result.pr_number.unwrap_or_default(),
            result.pr_url.as_deref().unwrap_or("-")
        );
    } else {
        let kind = result
            .error_kind
            .map(|k| k.to_string())
            .unwrap_or_else(|| "UNKNOWN".to_string());
        println!(
            "Execution failed [{}]: {}",
            kind,
            result.error.as_deref().unwrap_or("no error recorded")
        );
    }
    if let Some(run_id) = result.execution_run_id {
        println!("Run: {}", run_id);
    }
    Ok(())
}

async fn auth(command: AuthCommands) -> Result<ExitCode> {
    match command {
        AuthCommands::Set { actor } => {
            eprint!("Token for {}: ", actor);
            io::stderr().flush()?;
            let mut token = String::new();
            io::stdin().lock().read_line(&mut token)?;
            let token = token.trim();
            if token.is_empty() {
                bail!("No token provided");
            }
            set_actor_token(&actor, token)?;
            println!("Stored token for {}", actor);
            Ok(ExitCode::SUCCESS)
        }
        AuthCommands::Status { actor } => {
            let credentials = ChainedCredentials::standard();
            match credentials.token_for(&actor).await? {
                Some(_) => {
                    println!("Credential available for {}", actor);
                    Ok(ExitCode::SUCCESS)
                }
                None => {
                    println!(
                        "No credential for {} (checked {})",
                        actor,
                        credentials.describe()
                    );
                    Ok(ExitCode::FAILURE)
                }
            }
        }
        AuthCommands::Clear { actor } => {
            delete_actor_token(&actor)?;
            println!("Removed stored token for {}", actor);
            Ok(ExitCode::SUCCESS)
        }
    }
}

// ============================================================================
// Wiring
// ============================================================================

fn open_store(config: &Config) -> Result<Arc<FileStore>> {
    let resolved = config.resolve()?;
    let store = FileStore::open(&resolved.data_dir)
        .with_context(|| format!("Failed to open run store at {}", resolved.data_dir.display()))?;
    Ok(Arc::new(store))
}

fn workspace_manager(config: &Config) -> Result<WorkspaceManager> {
    let resolved = config.resolve()?;
    Ok(WorkspaceManager::new(
        resolved.workspace_root,
        resolved.git_base_url,
        config.commit_identity(),
        Arc::new(HttpHeaderAuth),
        config.timeouts.git_limit(),
    ))
}

/// Wire a controller over the file store. `simulated` picks the transport.
fn open_controller(config: &Config, simulated: bool) -> Result<ExecutionController> {
    let resolved = config.resolve()?;
    let store = open_store(config)?;
    let transport: Arc<dyn ExecutionTransport> = if simulated {
        Arc::new(SimulatedTransport::new())
    } else {
        let host = GitHubClient::new(resolved.github_api_url.clone())?;
        Arc::new(LiveTransport::new(
            Arc::new(workspace_manager(config)?),
            Arc::new(ChainedCredentials::standard()),
            Arc::new(PrPublisher::new(Arc::new(host))),
            LiveSettings {
                build_timeout: step_limit(config, CheckKind::Build),
                test_timeout: step_limit(config, CheckKind::Test),
                output_limit: config.output_limit,
            },
        ))
    };
    Ok(ExecutionController::new(Stores::shared(store), transport)
        .with_evidence(EvidenceWriter::new(resolved.evidence_dir))
        .with_settings(ControllerSettings::from_config(config)))
}

fn step_limit(config: &Config, kind: CheckKind) -> Duration {
    let phase = match kind {
        CheckKind::Build => LogPhase::Build,
        CheckKind::Test => LogPhase::Test,
    };
    let limit = config.timeouts.for_phase(phase);
    limit
        .checked_sub(STEP_LIMIT_MARGIN)
        .filter(|d| !d.is_zero())
        .unwrap_or(limit)
}
