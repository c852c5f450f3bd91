//! exportkit CLI - Incremental export pipeline and its supervised service.

use anyhow::{Context, Result, anyhow};
use clap::{Args, Parser, Subcommand};
use exportkit::client::{ReqwestTransport, Requester, RetryPolicy};
use exportkit::models::{AgentIdentity, Config, Locations};
use exportkit::pipeline::{ExportPlan, Orchestrator, RunOptions};
use exportkit::sender::JsonlSink;
use exportkit::source::RestSource;
use exportkit::state::{CheckpointStore, DedupStore};
use exportkit::supervisor::{
    EnrollOptions, InboxBus, ProcessRegistry, ProcessRunner, ServiceChild, Supervisor,
    shutdown_signal,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{Level, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser)]
#[command(name = "exportkit")]
#[command(version)]
#[command(about = "Incremental, rate-limit aware export pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Working directory holding config, state, output and logs
    #[arg(short, long, global = true, default_value = ".")]
    root: PathBuf,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the service with automatic restarts until SIGINT/SIGTERM
    ServiceRun {
        /// Enroll with this code before starting
        #[arg(long)]
        enroll: Option<String>,

        #[command(flatten)]
        validate: ValidateFlag,
    },

    /// Run the service once, without restarts (spawned by service-run)
    RunNoRestarts,

    /// Run a single export
    Export,

    /// Enroll the agent without starting the service
    EnrollNoServiceRun {
        /// Enrollment code
        code: String,

        #[command(flatten)]
        validate: ValidateFlag,
    },

    /// Validate configuration file
    #[command(alias = "validate")]
    ValidateConfig,

    /// Show example configuration
    Example,
}

#[derive(Args)]
struct ValidateFlag {
    /// Skip configuration validation during enrollment
    #[arg(long)]
    skip_validate: bool,
}

fn setup_logging(verbose: bool) -> Result<()> {
    let level = if verbose { Level::DEBUG } else { Level::INFO };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.as_str().to_lowercase()));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber).context("Failed to set subscriber")
}

fn print_example_config() {
    let example = r#"# exportkit configuration file (<root>/config.toml)

[requester]
max_general_retries = 2
general_retry_unit_secs = 60
max_throttled_retries = 3
throttle_cooldown_secs = 1800
# More than one request in flight trips abuse detection on some origins
max_concurrency = 1
timeout_secs = 180

[export]
# Primary entity ids or names to skip; each must exist
excluded = []
only_external_copy = false
linking_concurrency = 1
queue_capacity = 10
interval_secs = 3600

[supervisor]
initial_delay_secs = 15
max_delay_secs = 3600
multiplier = 2.0
cancel_poll_secs = 5

[source]
base_url = "https://api.example.com/v1"
# API token (can also use EXPORTKIT_API_TOKEN env var)
# api_token = "${MY_TOKEN}"
ref_type = "github"
page_size = 100
clone_url_template = "https://github.com/{name}.git"

[source.primary]
path = "/repos"
model = "sourcecode.repo"

[source.linking]
path = "/repos/{primary_id}/users"
model = "sourcecode.user"

[source.tasks]
path = "/repos/{primary_id}/pulls"
model = "sourcecode.pull_request"

[[source.dependents]]
path = "/repos/{primary_id}/pulls/{task_id}/comments"
model = "sourcecode.pull_request_comment"
hint_field = "has_comments"

[[source.dependents]]
path = "/repos/{primary_id}/pulls/{task_id}/reviews"
model = "sourcecode.pull_request_review"
hint_field = "has_reviews"
"#;
    println!("{example}");
}

fn load_config(locations: &Locations) -> Result<Config> {
    Config::from_file(&locations.config_file)
        .with_context(|| format!("Failed to load config from {:?}", locations.config_file))
}

fn load_agent(locations: &Locations) -> Result<AgentIdentity> {
    AgentIdentity::load(&locations.agent_file)?
        .ok_or_else(|| anyhow!("agent is not enrolled, run enroll-no-service-run first"))
}

/// Token cancelled on the first termination signal.
fn cancel_on_signal() -> CancellationToken {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        if let Err(e) = shutdown_signal().await {
            warn!(error = %e, "Signal handling unavailable");
            return;
        }
        info!("Signal received, cancelling");
        token.cancel();
    });
    cancel
}

fn validate(config: &Config) -> Result<()> {
    config
        .resolve_api_token()
        .context("Failed to resolve API token")?;

    info!("Configuration is valid");
    info!("  Origin: {} ({})", config.source.base_url, config.source.ref_type);
    info!("  Primary: {}", config.source.primary.model);
    info!("  Dependents: {}", config.source.dependents.len());
    info!("  Excluded: {}", config.export.excluded.len());
    Ok(())
}

fn enroll(locations: &Locations, code: &str, skip_validate: bool) -> Result<()> {
    if !skip_validate {
        validate(&load_config(locations)?)?;
    }
    let identity = match AgentIdentity::load(&locations.agent_file)? {
        Some(existing) if existing.enroll_code == code => {
            info!(device_id = %existing.device_id, "Already enrolled");
            existing
        }
        _ => {
            let identity = AgentIdentity::enroll(code);
            identity.save(&locations.agent_file)?;
            info!(device_id = %identity.device_id, "Enrolled");
            identity
        }
    };
    InboxBus::open(&locations.bus_dir, &identity.group_id())?;
    Ok(())
}

async fn export(locations: &Locations) -> Result<()> {
    let config = load_config(locations)?;
    let token = config
        .resolve_api_token()
        .context("Failed to resolve API token")?;
    let cancel = cancel_on_signal();

    let transport = Arc::new(ReqwestTransport::new(
        &config.source.base_url,
        &token,
        Duration::from_secs(config.requester.timeout_secs),
    )?);
    let requester = Arc::new(Requester::new(
        transport,
        RetryPolicy::from(&config.requester),
        config.requester.max_concurrency,
        cancel.clone(),
    ));
    let source = Arc::new(RestSource::new(Arc::clone(&requester), config.source.clone()));
    let sink = Arc::new(JsonlSink::new(&locations.output_dir)?);
    let dedup = Arc::new(DedupStore::open(&locations.dedup_file)?);
    let checkpoints = Arc::new(CheckpointStore::new(&locations.checkpoints_dir)?);

    let orchestrator = Orchestrator::new(
        source,
        sink,
        dedup,
        checkpoints,
        ExportPlan::from_source(&config.source),
        RunOptions::from_config(&config),
        cancel,
    );
    let summary = orchestrator.run().await?;
    let requests = requester.stats().snapshot();

    println!("\n=== Export Complete ===");
    println!("Primary:     {} found, {} excluded", summary.primary_found, summary.primary_excluded);
    println!("Git repos:   {}", summary.git_repos_queued);
    println!("Tasks:       {}", summary.tasks_produced);
    println!("Skipped:     {}", summary.dependents_skipped);
    for (model, stats) in &summary.models {
        println!("  {model}: {} sent, {} unchanged", stats.sent, stats.suppressed);
    }
    println!("Sent:        {}", summary.total_sent());
    println!("Unchanged:   {}", summary.total_suppressed());
    println!("Requests:    {} ({} throttled)", requests.total_requests, requests.throttled);
    println!("Runtime:     {:.1}s", summary.runtime_secs);
    println!("Output:      {:?}", locations.output_dir);
    Ok(())
}

async fn run_no_restarts(locations: &Locations, program: &Path) -> Result<()> {
    let config = load_config(locations)?;
    let agent = load_agent(locations)?;
    let cancel = cancel_on_signal();

    let runner = ProcessRunner::new(program, &locations.root, ProcessRegistry::new());
    let bus = Arc::new(InboxBus::open(&locations.bus_dir, &agent.group_id())?);
    let child = ServiceChild::new(
        runner,
        bus,
        Duration::from_secs(config.export.interval_secs),
        config.supervisor.cancel_poll(),
    );
    info!(device_id = %agent.device_id, "Service started");
    child.run(cancel).await?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose)?;

    let locations = Locations::new(&cli.root);
    let program = std::env::current_exe().context("Failed to locate own executable")?;

    match cli.command {
        Commands::Example => {
            print_example_config();
            Ok(())
        }

        Commands::ValidateConfig => load_config(&locations).and_then(|c| validate(&c)),

        Commands::EnrollNoServiceRun { code, validate: flags } => {
            enroll(&locations, &code, flags.skip_validate)
        }

        Commands::Export => export(&locations).await,

        Commands::RunNoRestarts => run_no_restarts(&locations, &program).await,

        Commands::ServiceRun { enroll, validate: flags } => {
            let config = match load_config(&locations) {
                Ok(config) => config.supervisor,
                Err(e) => {
                    warn!(error = %e, "Using default restart policy");
                    Default::default()
                }
            };
            let enroll = enroll.map(|code| EnrollOptions {
                code,
                skip_validate: flags.skip_validate,
            });
            Supervisor::new(&program, &locations, &config, enroll)
                .run()
                .await
                .map_err(Into::into)
        }
    }
}
