//! Runway Core Library
//!
//! Version lineage, upgrade planning and build orchestration on top of the
//! `runway-state` stores.
//!
//! Leaves first:
//! - `lineage`: version ordering, previous-major and intermediate relations
//! - `reference`: completed nightly/weekly builds per version and trigger
//! - `matrix`: upgrade pairs requested by a policy
//! - `expansion`: child builds for each pair and upgrade database
//! - `lifecycle`: claims, completion and batch closing checks
//! - `scheduler`, `runner`, `steps`: batches, host execution, step dispatch
//! - `config`: `runway.toml` and step authoring

pub mod bundles;
pub mod config;
pub mod error;
pub mod expansion;
pub mod lifecycle;
pub mod lineage;
pub mod locks;
pub mod matrix;
pub mod metrics;
pub mod obs;
pub mod reference;
pub mod runner;
pub mod scheduler;
pub mod steps;
pub mod telemetry;

pub use bundles::{BundleRegistry, DEFAULT_BASE_PATTERN};
pub use config::{
    retype_step, AppliedConfig, OrchestratorConfig, StepAuthoring, StepDefinition,
    UpgradeDbDefinition,
};
pub use error::{Result, RunwayError, ValidationError};
pub use expansion::{ExpansionEngine, ExpansionReport, SkipReason, SkippedEntry};
pub use lifecycle::{BuildLifecycle, Claim};
pub use lineage::{VersionCatalog, VersionLineage, MASTER};
pub use locks::BuildLocks;
pub use matrix::{plan_pairs, UpgradeMatrix, UpgradeMatrixGenerator, UpgradePair, UpgradeTarget};
pub use reference::{LatestDoneResolver, PinnedResolver, ReferenceResolver};
pub use runner::{BuildRunner, RunOutcome};
pub use scheduler::{CycleReport, PreparedBatch, Scheduler, SchedulingContext};
pub use steps::{ExecuteStep, ExecutionHost, StepContext, StepRequest};

use std::sync::Arc;

use runway_state::CiStore;

/// The orchestrator's components wired to one store.
pub struct Runway {
    pub store: Arc<dyn CiStore>,
    pub catalog: Arc<VersionCatalog>,
    pub registry: Arc<BundleRegistry>,
    pub lifecycle: Arc<BuildLifecycle>,
    pub engine: Arc<ExpansionEngine>,
    pub scheduler: Scheduler,
}

impl Runway {
    pub async fn new(store: Arc<dyn CiStore>, base_pattern: &str) -> Result<Self> {
        let catalog = Arc::new(VersionCatalog::load(store.clone()).await?);
        let registry = Arc::new(BundleRegistry::new(
            store.clone(),
            catalog.clone(),
            base_pattern,
        )?);
        let locks = Arc::new(BuildLocks::new());
        let lifecycle = Arc::new(BuildLifecycle::new(store.clone(), locks.clone()));
        let engine = Arc::new(ExpansionEngine::new(store.clone(), locks));
        let scheduler = Scheduler::new(
            store.clone(),
            catalog.clone(),
            registry.clone(),
            lifecycle.clone(),
        );
        Ok(Self {
            store,
            catalog,
            registry,
            lifecycle,
            engine,
            scheduler,
        })
    }

    /// Runner executing builds on `host`.
    pub fn runner(&self, host: Arc<dyn ExecutionHost>) -> BuildRunner {
        BuildRunner::new(
            self.store.clone(),
            self.lifecycle.clone(),
            self.catalog.clone(),
            self.engine.clone(),
            host,
        )
    }

    /// Write `config` into the store.
    pub async fn apply(&self, config: &OrchestratorConfig) -> Result<AppliedConfig> {
        config
            .apply(&self.store, &self.catalog, &self.registry)
            .await
    }
}
