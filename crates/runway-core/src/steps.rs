//! Step execution.
//!
//! Command jobs are handed to an [`ExecutionHost`]; `create_build` and
//! `configure_upgrade` run in-process and only ever attach children once per
//! (build, step).

use std::sync::Arc;

use async_trait::async_trait;
use runway_state::{
    Build, CiStore, CommandJob, ConfigId, ConfigStep, Database, JobType, StepJob, UpgradePolicy,
    Version,
};
use tracing::{debug, info};

use crate::error::{Result, RunwayError, ValidationError};
use crate::expansion::{ExpansionEngine, ExpansionReport};
use crate::lineage::VersionCatalog;
use crate::matrix::UpgradeMatrixGenerator;
use crate::reference::PinnedResolver;

/// What the host receives for one command step.
#[derive(Debug, Clone)]
pub struct StepRequest<'a> {
    pub build: &'a Build,
    pub step: &'a ConfigStep,
    pub command: &'a CommandJob,
    /// Destination name of the build, `"{id:05}-{version}"`.
    pub dest: String,
    /// Database to restore before running, for builds with a dump.
    pub restore_db: Option<String>,
}

/// Runs command steps on behalf of builds (containers, processes, ...).
#[async_trait]
pub trait ExecutionHost: Send + Sync {
    /// Host name recorded on claimed builds.
    fn name(&self) -> &str;

    /// Run one command step. `Err` carries the diagnostic.
    async fn run_step(&self, request: &StepRequest<'_>) -> std::result::Result<(), String>;
}

/// Everything a step needs while its build runs.
pub struct StepContext<'a> {
    pub store: &'a Arc<dyn CiStore>,
    pub catalog: &'a VersionCatalog,
    pub engine: &'a ExpansionEngine,
    pub host: &'a dyn ExecutionHost,
    pub build: &'a Build,
    pub version: &'a Version,
}

#[async_trait]
pub trait ExecuteStep {
    async fn execute(&self, ctx: &StepContext<'_>) -> Result<()>;
}

#[async_trait]
impl ExecuteStep for ConfigStep {
    async fn execute(&self, ctx: &StepContext<'_>) -> Result<()> {
        match &self.job {
            StepJob::Install(job)
            | StepJob::Run(job)
            | StepJob::Python(job)
            | StepJob::Restore(job)
            | StepJob::TestUpgrade(job) => run_command(self, job, ctx).await,
            StepJob::CreateBuild(job) => create_builds(self, &job.configs, ctx).await,
            StepJob::ConfigureUpgrade(policy) => configure_upgrade(self, policy, ctx)
                .await
                .map(|_| ()),
        }
    }
}

async fn run_command(step: &ConfigStep, job: &CommandJob, ctx: &StepContext<'_>) -> Result<()> {
    let dest = ctx.build.dest(ctx.version);
    let restore_db = restore_db(ctx).await?;
    let request = StepRequest {
        build: ctx.build,
        step,
        command: job,
        dest: dest.clone(),
        restore_db,
    };

    ctx.host
        .run_step(&request)
        .await
        .map_err(|diagnostic| RunwayError::ExecutionFailure {
            build: ctx.build.build_id.to_string(),
            step: step.name.clone(),
            diagnostic,
        })?;

    let mut suffixes: Vec<&str> = job.databases.iter().map(String::as_str).collect();
    // The upgraded database keeps the name it was restored under.
    if step.job.job_type() == JobType::TestUpgrade {
        suffixes.extend(ctx.build.params.dump_db_name.as_deref());
    }

    let existing = ctx.store.databases_of(ctx.build.build_id).await?;
    for suffix in suffixes {
        let name = format!("{dest}-{suffix}");
        if existing.iter().any(|d| d.name == name) {
            continue;
        }
        ctx.store
            .register_database(Database {
                name: name.clone(),
                build_id: ctx.build.build_id,
            })
            .await?;
        debug!(database = %name, "database registered");
    }
    Ok(())
}

/// `"{dump dest}-{dump_db_name}"` for builds restoring a dump.
async fn restore_db(ctx: &StepContext<'_>) -> Result<Option<String>> {
    let (Some(dump_id), Some(db_name)) = (
        ctx.build.params.dump_build,
        ctx.build.params.dump_db_name.as_deref(),
    ) else {
        return Ok(None);
    };
    let dump = ctx.store.get_build(dump_id).await?;
    let version = ctx.store.get_version(dump.params.version_id).await?;
    Ok(Some(format!("{}-{}", dump.dest(&version), db_name)))
}

async fn create_builds(
    step: &ConfigStep,
    configs: &[ConfigId],
    ctx: &StepContext<'_>,
) -> Result<()> {
    if configs.is_empty() {
        return Err(ValidationError::MissingChildConfigs {
            step: step.name.clone(),
        }
        .into());
    }
    let report = ctx
        .engine
        .create_children(ctx.build.build_id, step.step_id, configs)
        .await?;
    info!(
        step = %step.name,
        children = report.children.len(),
        created = report.created,
        "child builds attached"
    );
    Ok(())
}

/// Plan the matrix against the build's pinned references and expand it.
pub async fn configure_upgrade(
    step: &ConfigStep,
    policy: &UpgradePolicy,
    ctx: &StepContext<'_>,
) -> Result<ExpansionReport> {
    let trigger = ctx.store.get_trigger(ctx.build.params.trigger_id).await?;
    let dumps_trigger =
        trigger
            .upgrade_dumps_trigger
            .ok_or_else(|| ValidationError::MissingDumpsTrigger {
                trigger: trigger.name.clone(),
            })?;

    let mut lineage = ctx.catalog.snapshot().await;
    if lineage.get(ctx.version.version_id).is_none() {
        lineage = ctx.catalog.refresh().await?;
    }

    let resolver = PinnedResolver::load(
        ctx.store.as_ref(),
        ctx.build.params.builds_reference_ids.iter().copied(),
    )
    .await?;
    let matrix = UpgradeMatrixGenerator::new(&lineage, &resolver)
        .generate(policy, ctx.version, lineage.master(), dumps_trigger)
        .await?;

    let report = ctx
        .engine
        .expand(ctx.build.build_id, step.step_id, &matrix, policy)
        .await?;
    info!(
        step = %step.name,
        pairs = matrix.pairs.len(),
        children = report.children.len(),
        skipped = report.skipped.len(),
        "upgrade builds attached"
    );
    Ok(report)
}
