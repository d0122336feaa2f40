//! Runway CLI
//!
//! The `runway` command drives the orchestrator against a store.
//!
//! ## Commands
//!
//! - `apply`: write `runway.toml` into the store
//! - `versions`: show the version lineage
//! - `bundle`: register a bundle or update its commit heads
//! - `plan`: show the upgrade matrix a trigger would expand to
//! - `force`: prepare a batch now
//! - `schedule`: run scheduling cycles
//! - `run`: execute pending builds on this host
//! - `builds`: list builds in a state
//! - `retype-step`: change the job type of a step

mod host;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use runway_core::config::DEFAULT_INTERVAL_SECS;
use runway_core::{
    retype_step, LatestDoneResolver, OrchestratorConfig, RunOutcome, Runway, UpgradeMatrix,
    UpgradeMatrixGenerator, UpgradeTarget,
};
use runway_state::{
    BuildState, Category, CiStore, JobType, MemoryStore, StepJob, SurrealStore,
};
use serde_json::{json, Value};
use tracing::{info, Level};

use crate::host::ShellHost;

#[derive(Parser)]
#[command(name = "runway")]
#[command(author = "Stevedores Org")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Version-lineage CI orchestration", long_about = None)]
struct Cli {
    /// Orchestrator configuration file
    #[arg(short, long, global = true, env = "RUNWAY_CONFIG", default_value = "runway.toml")]
    config: PathBuf,

    /// Store backend
    #[arg(long, global = true, env = "RUNWAY_STORE", value_enum, default_value = "surreal")]
    store: StoreKind,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum StoreKind {
    /// Process-local store, lost on exit
    Memory,
    /// SurrealDB, see `SURREALDB_ENDPOINT` / `SURREALDB_URL`
    Surreal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Write the configuration file into the store
    Apply,

    /// Show known versions with their previous major and intermediates
    Versions,

    /// Register a bundle, or update its commit heads
    Bundle {
        /// Bundle name (base bundles match the configured pattern)
        name: String,

        /// Commit head as REPO=SHA, repeatable
        #[arg(long = "commit", value_parser = parse_commit)]
        commits: Vec<(String, String)>,
    },

    /// Show the upgrade matrix of a trigger for a bundle
    Plan {
        /// Bundle name
        #[arg(short, long, default_value = "master")]
        bundle: String,

        /// Trigger name
        #[arg(short, long)]
        trigger: String,

        #[arg(long, value_enum, default_value = "text")]
        format: OutputFormat,
    },

    /// Prepare a batch for a bundle now
    Force {
        /// Bundle name
        bundle: String,

        #[arg(long, value_parser = parse_category, default_value = "default")]
        category: Category,
    },

    /// Prepare batches for every bundle, periodically
    Schedule {
        /// Seconds between cycles (defaults to the configuration)
        #[arg(long)]
        interval: Option<u64>,

        /// Run a single cycle and exit
        #[arg(long)]
        once: bool,

        /// Categories to schedule, repeatable
        #[arg(long = "category", value_parser = parse_category, default_values = ["default"])]
        categories: Vec<Category>,
    },

    /// Execute pending builds on this host
    Run {
        /// Host name recorded on claimed builds
        #[arg(long, env = "RUNWAY_HOST")]
        host: Option<String>,

        /// Maximum number of builds to finish
        #[arg(short, long)]
        limit: Option<usize>,

        /// Keep going until no pending build can make progress
        #[arg(long, conflicts_with = "limit")]
        drain: bool,

        /// Per-step timeout in seconds
        #[arg(long)]
        timeout: Option<u64>,

        /// Working directory of step commands
        #[arg(long)]
        workdir: Option<PathBuf>,
    },

    /// List builds in a state
    Builds {
        #[arg(long, value_parser = parse_build_state, default_value = "pending")]
        state: BuildState,
    },

    /// Change the job type of a step
    RetypeStep {
        /// Step name
        step: String,

        #[arg(value_parser = parse_job_type)]
        job_type: JobType,
    },
}

fn parse_commit(raw: &str) -> std::result::Result<(String, String), String> {
    match raw.split_once('=') {
        Some((repo, sha)) if !repo.is_empty() && !sha.is_empty() => {
            Ok((repo.to_string(), sha.to_string()))
        }
        _ => Err(format!("expected REPO=SHA, got '{raw}'")),
    }
}

/// Parse a snake_case enum value through its serde representation.
fn parse_snake<T: serde::de::DeserializeOwned>(raw: &str) -> std::result::Result<T, String> {
    serde_json::from_value(Value::String(raw.to_string())).map_err(|e| e.to_string())
}

fn parse_category(raw: &str) -> std::result::Result<Category, String> {
    parse_snake(raw)
}

fn parse_build_state(raw: &str) -> std::result::Result<BuildState, String> {
    parse_snake(raw)
}

fn parse_job_type(raw: &str) -> std::result::Result<JobType, String> {
    parse_snake(raw)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    runway_core::telemetry::init_tracing(cli.json, level);

    let store = open_store(cli.store).await?;
    let (runway, config) = open(store, &cli.config).await?;
    let project = config.scheduler.project.clone();

    match cli.command {
        Commands::Apply => cmd_apply(&runway, &config).await,
        Commands::Versions => cmd_versions(&runway).await,
        Commands::Bundle { name, commits } => {
            cmd_bundle(&runway, &project, &name, commits.into_iter().collect()).await
        }
        Commands::Plan {
            bundle,
            trigger,
            format,
        } => cmd_plan(&runway, &project, &bundle, &trigger, format).await,
        Commands::Force { bundle, category } => {
            cmd_force(&runway, &project, &bundle, category).await
        }
        Commands::Schedule {
            interval,
            once,
            categories,
        } => {
            let interval = interval.unwrap_or(config.scheduler.interval_secs);
            cmd_schedule(&runway, &project, &categories, interval, once).await
        }
        Commands::Run {
            host,
            limit,
            drain,
            timeout,
            workdir,
        } => {
            let name = host
                .or_else(|| std::env::var("HOSTNAME").ok())
                .unwrap_or_else(|| "local".to_string());
            let host = ShellHost::new(name)
                .with_timeout(timeout.map(Duration::from_secs))
                .with_workdir(workdir);
            cmd_run(&runway, host, limit, drain).await
        }
        Commands::Builds { state } => cmd_builds(&runway, state).await,
        Commands::RetypeStep { step, job_type } => cmd_retype_step(&runway, &step, job_type).await,
    }
}

async fn open_store(kind: StoreKind) -> Result<Arc<dyn CiStore>> {
    match kind {
        StoreKind::Memory => Ok(Arc::new(MemoryStore::new())),
        StoreKind::Surreal => {
            let store = SurrealStore::from_env()
                .await
                .context("Failed to connect to Runway database")?;
            Ok(Arc::new(store))
        }
    }
}

/// Load the configuration, wire the orchestrator and apply the configuration
/// to the store. Applying is idempotent, so every command starts from the
/// file's definitions.
async fn open(store: Arc<dyn CiStore>, path: &Path) -> Result<(Runway, OrchestratorConfig)> {
    let config = OrchestratorConfig::load(path)
        .with_context(|| format!("Failed to load configuration {}", path.display()))?;
    let runway = Runway::new(store, &config.scheduler.base_pattern).await?;
    runway
        .apply(&config)
        .await
        .context("Failed to apply configuration")?;
    Ok((runway, config))
}

async fn cmd_apply(runway: &Runway, config: &OrchestratorConfig) -> Result<()> {
    let applied = runway.apply(config).await?;
    println!("Configs:  {}", applied.configs.len());
    println!("Steps:    {}", applied.steps.len());
    println!("Triggers: {}", applied.triggers.len());
    for bundle in &applied.bundles {
        let kind = if bundle.is_base { "base" } else { "dev" };
        println!("Bundle {} ({kind}) #{}", bundle.name, bundle.bundle_id);
    }
    Ok(())
}

async fn cmd_versions(runway: &Runway) -> Result<()> {
    let lineage = runway.catalog.snapshot().await;
    if lineage.is_empty() {
        println!("No versions registered");
        return Ok(());
    }

    for version in lineage.ordered() {
        let marker = if version.is_major { "*" } else { " " };
        let previous = lineage
            .previous_major_version(version.version_id)
            .map(|v| v.name.as_str())
            .unwrap_or("-");
        let intermediates: Vec<&str> = lineage
            .intermediate_versions(version.version_id)
            .into_iter()
            .map(|v| v.name.as_str())
            .collect();
        println!(
            "{marker} {:<14} previous major: {:<10} intermediates: {}",
            version.name,
            previous,
            if intermediates.is_empty() {
                "-".to_string()
            } else {
                intermediates.join(", ")
            }
        );
    }
    Ok(())
}

async fn cmd_bundle(
    runway: &Runway,
    project: &str,
    name: &str,
    commits: BTreeMap<String, String>,
) -> Result<()> {
    let bundle = runway
        .registry
        .register(project, name, commits)
        .await
        .with_context(|| format!("Failed to register bundle {name}"))?;
    let version = runway.store.get_version(bundle.version_id).await?;
    println!("Bundle {} #{}", bundle.name, bundle.bundle_id);
    println!("Version: {}", version.name);
    println!("Base:    {}", if bundle.is_base { "yes" } else { "no" });
    for (repo, sha) in &bundle.commits {
        println!("  {repo} {sha}");
    }
    Ok(())
}

async fn cmd_plan(
    runway: &Runway,
    project: &str,
    bundle: &str,
    trigger: &str,
    format: OutputFormat,
) -> Result<()> {
    let bundle = runway
        .store
        .find_bundle(project, bundle)
        .await?
        .with_context(|| format!("Bundle not found: {bundle}"))?;
    let trigger = runway
        .store
        .find_trigger(project, trigger)
        .await?
        .with_context(|| format!("Trigger not found: {trigger}"))?;
    let Some(dumps_trigger) = trigger.upgrade_dumps_trigger else {
        bail!("Trigger {} has no upgrade dumps trigger", trigger.name);
    };

    let ctx = runway
        .scheduler
        .context(bundle.bundle_id, trigger.category)
        .await?;
    let lineage = runway.catalog.snapshot().await;
    let resolver = LatestDoneResolver::new(runway.store.clone(), project);
    let config = runway.store.get_config(trigger.config_id).await?;

    let mut plans: Vec<(String, UpgradeMatrix)> = Vec::new();
    for step_id in &config.steps {
        let step = runway.store.get_step(*step_id).await?;
        if let StepJob::ConfigureUpgrade(policy) = &step.job {
            let matrix = UpgradeMatrixGenerator::new(&lineage, &resolver)
                .generate(policy, &ctx.version, ctx.master.as_ref(), dumps_trigger)
                .await?;
            plans.push((step.name, matrix));
        }
    }

    match format {
        OutputFormat::Json => {
            let value: Vec<Value> = plans
                .iter()
                .map(|(step, matrix)| matrix_json(step, matrix))
                .collect();
            println!("{}", serde_json::to_string_pretty(&value)?);
        }
        OutputFormat::Text => {
            if plans.is_empty() {
                println!("Trigger {} has no upgrade step", trigger.name);
            }
            for (step, matrix) in &plans {
                println!("{step} ({} pairs)", matrix.pairs.len());
                for (idx, pair) in matrix.pairs.iter().enumerate() {
                    let target = match &pair.target {
                        UpgradeTarget::Current => "current".to_string(),
                        UpgradeTarget::Reference(build) => format!("#{}", build.build_id),
                    };
                    let chained = pair
                        .chained_from
                        .map(|prev| format!(" after [{prev}]"))
                        .unwrap_or_default();
                    println!(
                        "  [{idx}] {:<24} from #{} to {target}{chained}",
                        pair.label(),
                        pair.from_build.build_id
                    );
                }
            }
        }
    }
    Ok(())
}

fn matrix_json(step: &str, matrix: &UpgradeMatrix) -> Value {
    let pairs: Vec<Value> = matrix
        .pairs
        .iter()
        .map(|pair| {
            json!({
                "from": pair.from.name,
                "to": pair.to.name,
                "from_build": pair.from_build.build_id.0,
                "to_build": match &pair.target {
                    UpgradeTarget::Current => Value::Null,
                    UpgradeTarget::Reference(build) => json!(build.build_id.0),
                },
                "chained_from": pair.chained_from,
            })
        })
        .collect();
    json!({
        "step": step,
        "pairs": pairs,
        "reference_ids": matrix.reference_ids.iter().map(|id| id.0).collect::<Vec<_>>(),
    })
}

async fn cmd_force(runway: &Runway, project: &str, bundle: &str, category: Category) -> Result<()> {
    let bundle = runway
        .store
        .find_bundle(project, bundle)
        .await?
        .with_context(|| format!("Bundle not found: {bundle}"))?;
    let prepared = runway.scheduler.force(bundle.bundle_id, category).await?;
    println!(
        "Batch #{} ({}) created: {} reused: {}{}",
        prepared.batch.batch_id,
        prepared.batch.state,
        prepared.created,
        prepared.reused,
        if prepared.fresh { "" } else { " (unchanged)" }
    );
    for slot in &prepared.batch.slots {
        let trigger = runway.store.get_trigger(slot.trigger_id).await?;
        println!("  {:<24} build #{}", trigger.name, slot.build_id);
    }
    Ok(())
}

async fn cmd_schedule(
    runway: &Runway,
    project: &str,
    categories: &[Category],
    interval: u64,
    once: bool,
) -> Result<()> {
    let period = Duration::from_secs(if interval == 0 {
        DEFAULT_INTERVAL_SECS
    } else {
        interval
    });
    let mut ticker = tokio::time::interval(period);
    info!(interval_secs = period.as_secs(), once, "scheduler started");

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = tokio::signal::ctrl_c() => {
                info!("scheduler stopped");
                return Ok(());
            }
        }

        let targets: Vec<_> = runway
            .store
            .list_bundles(project)
            .await?
            .iter()
            .flat_map(|bundle| categories.iter().map(move |c| (bundle.bundle_id, *c)))
            .collect();
        let report = runway.scheduler.run_cycle(&targets).await?;
        println!(
            "cycle: {} prepared ({} fresh), {} failed, {} batches done",
            report.prepared.len(),
            report.prepared.iter().filter(|p| p.fresh).count(),
            report.failed.len(),
            report.completed.len()
        );
        for (bundle, category, error) in &report.failed {
            println!("  bundle #{bundle} {category}: {error}");
        }

        if once {
            return Ok(());
        }
    }
}

async fn cmd_run(
    runway: &Runway,
    host: ShellHost,
    limit: Option<usize>,
    drain: bool,
) -> Result<()> {
    let runner = runway.runner(Arc::new(host));
    let outcomes = if drain {
        runner.drain().await?
    } else {
        runner.run_pending(limit.unwrap_or(usize::MAX)).await?
    };

    let mut failed = 0;
    for outcome in &outcomes {
        match outcome {
            RunOutcome::Done(build) => println!("#{} done", build.build_id),
            RunOutcome::Failed(build) => {
                failed += 1;
                println!(
                    "#{} error: {}",
                    build.build_id,
                    build.diagnostic.as_deref().unwrap_or("-")
                );
            }
            RunOutcome::Waiting(id) => println!("#{id} waiting for its dump"),
        }
    }
    let completed = runway.scheduler.refresh_batches().await?;
    println!(
        "{} builds run, {failed} failed, {} batches done",
        outcomes.iter().filter(|o| !o.is_waiting()).count(),
        completed.len()
    );
    Ok(())
}

async fn cmd_builds(runway: &Runway, state: BuildState) -> Result<()> {
    let builds = runway.store.list_builds(state).await?;
    if builds.is_empty() {
        println!("No {state} builds");
        return Ok(());
    }
    for build in builds {
        let config = runway.store.get_config(build.params.config_id).await?;
        let version = runway.store.get_version(build.params.version_id).await?;
        print!("#{:<6} {:<10} {:<24}", build.build_id, version.name, config.name);
        if let Some(parent) = runway.store.parent_of(build.build_id).await? {
            print!(" child of #{parent}");
        }
        if let Some(host) = &build.host {
            print!(" on {host}");
        }
        if let Some(diagnostic) = &build.diagnostic {
            print!(" ({diagnostic})");
        }
        println!();
    }
    Ok(())
}

async fn cmd_retype_step(runway: &Runway, name: &str, job_type: JobType) -> Result<()> {
    let step = runway
        .store
        .find_step(name)
        .await?
        .with_context(|| format!("Step not found: {name}"))?;
    let step = retype_step(runway.store.as_ref(), step.step_id, job_type).await?;
    println!("Step {} is now {}", step.name, step.job.job_type());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const CONFIG: &str = r#"
[scheduler]
project = "cli"

[[configs]]
name = "Install"
steps = ["install"]

[[steps]]
name = "install"
job_type = "install"
command = ["true"]
databases = ["all"]

[[triggers]]
name = "Server"
config = "Install"
repos = ["server"]

[[bundles]]
name = "master"
commits = { server = "abc123" }
"#;

    #[test]
    fn test_parse_commit() {
        assert_eq!(
            parse_commit("server=abc123").unwrap(),
            ("server".to_string(), "abc123".to_string())
        );
        assert!(parse_commit("server").is_err());
        assert!(parse_commit("=abc").is_err());
    }

    #[test]
    fn test_parse_enums() {
        assert_eq!(parse_category("nightly").unwrap(), Category::Nightly);
        assert_eq!(parse_job_type("test_upgrade").unwrap(), JobType::TestUpgrade);
        assert_eq!(parse_build_state("pending").unwrap(), BuildState::Pending);
        assert!(parse_category("hourly").is_err());
    }

    #[test]
    fn test_cli_parses() {
        let cli = Cli::try_parse_from([
            "runway",
            "--store",
            "memory",
            "schedule",
            "--once",
            "--category",
            "nightly",
            "--category",
            "weekly",
        ])
        .unwrap();
        assert_eq!(cli.store, StoreKind::Memory);
        let Commands::Schedule {
            once, categories, ..
        } = cli.command
        else {
            panic!("expected schedule");
        };
        assert!(once);
        assert_eq!(categories, vec![Category::Nightly, Category::Weekly]);
    }

    #[tokio::test]
    async fn test_open_applies_configuration() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(CONFIG.as_bytes()).unwrap();

        let store: Arc<dyn CiStore> = Arc::new(MemoryStore::new());
        let (runway, config) = open(store.clone(), file.path()).await.unwrap();
        assert_eq!(config.scheduler.project, "cli");
        assert!(store.find_bundle("cli", "master").await.unwrap().is_some());

        // Applying again through a second open is a no-op.
        let (again, _) = open(store.clone(), file.path()).await.unwrap();
        assert_eq!(again.store.list_bundles("cli").await.unwrap().len(), 1);

        let runner = runway.runner(Arc::new(ShellHost::new("local")));
        let bundle = store.find_bundle("cli", "master").await.unwrap().unwrap();
        runway
            .scheduler
            .force(bundle.bundle_id, Category::Default)
            .await
            .unwrap();
        let outcomes = runner.drain().await.unwrap();
        assert_eq!(outcomes.len(), 1);
        assert!(matches!(outcomes[0], RunOutcome::Done(_)));
        cmd_builds(&runway, BuildState::Done).await.unwrap();
    }

    #[tokio::test]
    async fn test_missing_configuration_is_reported() {
        let store: Arc<dyn CiStore> = Arc::new(MemoryStore::new());
        let err = open(store, Path::new("/nonexistent/runway.toml"))
            .await
            .err()
            .unwrap();
        assert!(err.to_string().contains("Failed to load configuration"));
    }
}
