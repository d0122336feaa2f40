//! Storage trait definitions for Runway
//!
//! One trait per record family:
//! - `VersionStore`: append-only product versions
//! - `BundleStore`: bundles and their commit heads
//! - `ConfigStore`: configs, steps and triggers
//! - `BuildStore`: builds, the parent -> children edge and produced databases
//! - `BatchStore`: batches and their slots
//!
//! All traits are async and backend-agnostic. Implementations enforce the
//! write-side invariants listed on each method; callers rely on them rather
//! than re-checking. In-memory fakes live in the `fakes` module.

use std::collections::BTreeMap;

use async_trait::async_trait;

use crate::error::StorageError;
use crate::schema::*;

/// Result type for storage operations
pub type StorageResult<T> = std::result::Result<T, StorageError>;

// ---------------------------------------------------------------------------
// VersionStore
// ---------------------------------------------------------------------------

#[async_trait]
pub trait VersionStore: Send + Sync {
    /// Register a version. Names are unique: a second insert of the same name
    /// returns `StorageError::DuplicateName`.
    async fn insert_version(
        &self,
        name: &str,
        number: VersionNumber,
        is_major: bool,
    ) -> StorageResult<Version>;

    async fn find_version(&self, name: &str) -> StorageResult<Option<Version>>;

    async fn get_version(&self, id: VersionId) -> StorageResult<Version>;

    /// All versions, in insertion order.
    async fn list_versions(&self) -> StorageResult<Vec<Version>>;
}

// ---------------------------------------------------------------------------
// BundleStore
// ---------------------------------------------------------------------------

#[async_trait]
pub trait BundleStore: Send + Sync {
    /// Register a bundle. `(project, name)` is unique.
    async fn insert_bundle(&self, bundle: NewBundle) -> StorageResult<Bundle>;

    async fn get_bundle(&self, id: BundleId) -> StorageResult<Bundle>;

    async fn find_bundle(&self, project: &str, name: &str) -> StorageResult<Option<Bundle>>;

    /// Bundles of a project, in insertion order.
    async fn list_bundles(&self, project: &str) -> StorageResult<Vec<Bundle>>;

    /// Replace the commit heads of a bundle.
    async fn set_bundle_commits(
        &self,
        id: BundleId,
        commits: BTreeMap<String, String>,
    ) -> StorageResult<Bundle>;
}

// ---------------------------------------------------------------------------
// ConfigStore
// ---------------------------------------------------------------------------

#[async_trait]
pub trait ConfigStore: Send + Sync {
    /// Register a configuration. Names are unique.
    async fn insert_config(&self, name: &str, steps: Vec<StepId>) -> StorageResult<BuildConfig>;

    async fn get_config(&self, id: ConfigId) -> StorageResult<BuildConfig>;

    async fn find_config(&self, name: &str) -> StorageResult<Option<BuildConfig>>;

    /// Register a step. Names are unique.
    async fn insert_step(&self, name: &str, job: StepJob) -> StorageResult<ConfigStep>;

    async fn get_step(&self, id: StepId) -> StorageResult<ConfigStep>;

    async fn find_step(&self, name: &str) -> StorageResult<Option<ConfigStep>>;

    /// Overwrite a stored step.
    async fn update_step(&self, step: ConfigStep) -> StorageResult<()>;

    /// Register a trigger. `(project, name)` is unique.
    async fn insert_trigger(&self, trigger: NewTrigger) -> StorageResult<Trigger>;

    async fn get_trigger(&self, id: TriggerId) -> StorageResult<Trigger>;

    async fn find_trigger(&self, project: &str, name: &str) -> StorageResult<Option<Trigger>>;

    /// Triggers of a project, optionally restricted to one category, in
    /// insertion order.
    async fn list_triggers(
        &self,
        project: &str,
        category: Option<Category>,
    ) -> StorageResult<Vec<Trigger>>;

    /// Overwrite a stored trigger.
    async fn update_trigger(&self, trigger: Trigger) -> StorageResult<()>;
}

// ---------------------------------------------------------------------------
// BuildStore
// ---------------------------------------------------------------------------

/// Outcome of [`BuildStore::create_build`].
#[derive(Debug, Clone)]
pub struct CreatedBuild {
    pub build: Build,
    /// `false` when an existing build was returned instead.
    pub created: bool,
}

#[async_trait]
pub trait BuildStore: Send + Sync {
    /// Create a build in `state`.
    ///
    /// With a parent, creation is idempotent: when the parent already has a
    /// child with the same params fingerprint that child is returned with
    /// `created == false`. The new child is appended to the parent's ordered
    /// children.
    async fn create_build(
        &self,
        params: BuildParams,
        parent: Option<BuildId>,
        state: BuildState,
    ) -> StorageResult<CreatedBuild>;

    /// Most recent root build (no parent) with the given fingerprint.
    async fn find_root_build(&self, fingerprint: &str) -> StorageResult<Option<Build>>;

    async fn get_build(&self, id: BuildId) -> StorageResult<Build>;

    /// Builds currently in `state`, oldest first.
    async fn list_builds(&self, state: BuildState) -> StorageResult<Vec<Build>>;

    /// Parent of a build, derived from the stored parent -> children edge.
    async fn parent_of(&self, id: BuildId) -> StorageResult<Option<BuildId>>;

    /// Direct children, in creation order.
    async fn children_of(&self, id: BuildId) -> StorageResult<Vec<Build>>;

    /// Apply a lifecycle transition.
    ///
    /// Illegal edges return `StorageError::InvalidTransition` and leave the
    /// build unchanged. Entering `running` records the host and start time;
    /// entering a terminal state records the finish time.
    async fn set_build_state(&self, id: BuildId, transition: BuildTransition)
        -> StorageResult<Build>;

    /// Record that `step` expanded children on `build`. A second call for the
    /// same pair returns `StorageError::AlreadyExpanded`.
    async fn mark_expanded(&self, id: BuildId, step: StepId) -> StorageResult<()>;

    async fn register_database(&self, database: Database) -> StorageResult<()>;

    async fn databases_of(&self, id: BuildId) -> StorageResult<Vec<Database>>;
}

// ---------------------------------------------------------------------------
// BatchStore
// ---------------------------------------------------------------------------

#[async_trait]
pub trait BatchStore: Send + Sync {
    /// Create an empty batch in `preparing`.
    async fn create_batch(&self, bundle: BundleId, category: Category) -> StorageResult<Batch>;

    async fn get_batch(&self, id: BatchId) -> StorageResult<Batch>;

    /// Bind a trigger to a build. A batch holds one slot per trigger.
    async fn add_slot(&self, id: BatchId, slot: Slot) -> StorageResult<Batch>;

    async fn set_batch_state(&self, id: BatchId, state: BatchState) -> StorageResult<Batch>;

    /// Batches of a bundle, newest first.
    async fn list_batches(
        &self,
        bundle: BundleId,
        category: Option<Category>,
    ) -> StorageResult<Vec<Batch>>;

    /// Batches in `state` across all bundles, oldest first.
    async fn batches_in_state(&self, state: BatchState) -> StorageResult<Vec<Batch>>;
}

/// Every store the orchestrator needs, behind one object.
pub trait CiStore: VersionStore + BundleStore + ConfigStore + BuildStore + BatchStore {}

impl<T> CiStore for T where T: VersionStore + BundleStore + ConfigStore + BuildStore + BatchStore {}

/// Reject an illegal build edge the same way in every backend.
pub fn check_build_transition(build: &Build, to: BuildState) -> StorageResult<()> {
    if build.state.can_transition_to(to) {
        Ok(())
    } else {
        Err(StorageError::InvalidTransition {
            entity: "build",
            id: build.build_id.to_string(),
            from: build.state.to_string(),
            to: to.to_string(),
        })
    }
}

pub fn check_batch_transition(batch: &Batch, to: BatchState) -> StorageResult<()> {
    if batch.state.can_transition_to(to) {
        Ok(())
    } else {
        Err(StorageError::InvalidTransition {
            entity: "batch",
            id: batch.batch_id.to_string(),
            from: batch.state.to_string(),
            to: to.to_string(),
        })
    }
}

/// Apply a validated transition to a build record in place.
pub fn apply_build_transition(build: &mut Build, transition: &BuildTransition) -> StorageResult<()> {
    check_build_transition(build, transition.to)?;
    let now = chrono::Utc::now();
    if transition.to == BuildState::Running {
        build.host = transition.host.clone();
        build.started_at = Some(now);
    }
    if transition.to.is_terminal() {
        build.finished_at = Some(now);
    }
    if let Some(diagnostic) = &transition.diagnostic {
        build.diagnostic = Some(diagnostic.clone());
    }
    build.state = transition.to;
    Ok(())
}
