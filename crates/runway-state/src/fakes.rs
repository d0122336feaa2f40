//! In-memory implementation of every storage trait
//!
//! `MemoryStore` keeps all records in `BTreeMap`s keyed by id behind a single
//! mutex, so each trait method is atomic with respect to the others. Used by
//! the test suites and by `runway --store memory`.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::Utc;

use crate::error::StorageError;
use crate::schema::*;
use crate::storage_traits::*;

#[derive(Debug, Default)]
struct MemoryState {
    next_id: u64,
    versions: BTreeMap<VersionId, Version>,
    bundles: BTreeMap<BundleId, Bundle>,
    configs: BTreeMap<ConfigId, BuildConfig>,
    steps: BTreeMap<StepId, ConfigStep>,
    triggers: BTreeMap<TriggerId, Trigger>,
    builds: BTreeMap<BuildId, Build>,
    parents: BTreeMap<BuildId, BuildId>,
    databases: Vec<Database>,
    batches: BTreeMap<BatchId, Batch>,
}

impl MemoryState {
    fn allocate(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn build_mut(&mut self, id: BuildId) -> StorageResult<&mut Build> {
        self.builds
            .get_mut(&id)
            .ok_or_else(|| StorageError::BuildNotFound {
                build: id.to_string(),
            })
    }

    fn batch_mut(&mut self, id: BatchId) -> StorageResult<&mut Batch> {
        self.batches
            .get_mut(&id)
            .ok_or_else(|| StorageError::BatchNotFound {
                batch: id.to_string(),
            })
    }
}

/// In-memory store implementing [`CiStore`].
///
/// Ids come from one shared counter, so they are unique across record kinds
/// and strictly increasing in creation order.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> StorageResult<MutexGuard<'_, MemoryState>> {
        self.state
            .lock()
            .map_err(|_| StorageError::Backend("memory store lock poisoned".to_string()))
    }
}

// ---------------------------------------------------------------------------
// VersionStore
// ---------------------------------------------------------------------------

#[async_trait]
impl VersionStore for MemoryStore {
    async fn insert_version(
        &self,
        name: &str,
        number: VersionNumber,
        is_major: bool,
    ) -> StorageResult<Version> {
        let mut state = self.state()?;
        if state.versions.values().any(|v| v.name == name) {
            return Err(StorageError::DuplicateName {
                kind: "version",
                name: name.to_string(),
            });
        }
        let version = Version {
            version_id: VersionId(state.allocate()),
            name: name.to_string(),
            number,
            is_major,
            created_at: Utc::now(),
        };
        state.versions.insert(version.version_id, version.clone());
        Ok(version)
    }

    async fn find_version(&self, name: &str) -> StorageResult<Option<Version>> {
        let state = self.state()?;
        Ok(state.versions.values().find(|v| v.name == name).cloned())
    }

    async fn get_version(&self, id: VersionId) -> StorageResult<Version> {
        let state = self.state()?;
        state
            .versions
            .get(&id)
            .cloned()
            .ok_or_else(|| StorageError::VersionNotFound {
                version: id.to_string(),
            })
    }

    async fn list_versions(&self) -> StorageResult<Vec<Version>> {
        let state = self.state()?;
        Ok(state.versions.values().cloned().collect())
    }
}

// ---------------------------------------------------------------------------
// BundleStore
// ---------------------------------------------------------------------------

#[async_trait]
impl BundleStore for MemoryStore {
    async fn insert_bundle(&self, bundle: NewBundle) -> StorageResult<Bundle> {
        let mut state = self.state()?;
        if state
            .bundles
            .values()
            .any(|b| b.project == bundle.project && b.name == bundle.name)
        {
            return Err(StorageError::DuplicateName {
                kind: "bundle",
                name: bundle.name,
            });
        }
        let record = Bundle {
            bundle_id: BundleId(state.allocate()),
            project: bundle.project,
            name: bundle.name,
            is_base: bundle.is_base,
            base_id: bundle.base_id,
            version_id: bundle.version_id,
            commits: bundle.commits,
        };
        state.bundles.insert(record.bundle_id, record.clone());
        Ok(record)
    }

    async fn get_bundle(&self, id: BundleId) -> StorageResult<Bundle> {
        let state = self.state()?;
        state
            .bundles
            .get(&id)
            .cloned()
            .ok_or_else(|| StorageError::BundleNotFound {
                bundle: id.to_string(),
            })
    }

    async fn find_bundle(&self, project: &str, name: &str) -> StorageResult<Option<Bundle>> {
        let state = self.state()?;
        Ok(state
            .bundles
            .values()
            .find(|b| b.project == project && b.name == name)
            .cloned())
    }

    async fn list_bundles(&self, project: &str) -> StorageResult<Vec<Bundle>> {
        let state = self.state()?;
        Ok(state
            .bundles
            .values()
            .filter(|b| b.project == project)
            .cloned()
            .collect())
    }

    async fn set_bundle_commits(
        &self,
        id: BundleId,
        commits: BTreeMap<String, String>,
    ) -> StorageResult<Bundle> {
        let mut state = self.state()?;
        let bundle = state
            .bundles
            .get_mut(&id)
            .ok_or_else(|| StorageError::BundleNotFound {
                bundle: id.to_string(),
            })?;
        bundle.commits = commits;
        Ok(bundle.clone())
    }
}

// ---------------------------------------------------------------------------
// ConfigStore
// ---------------------------------------------------------------------------

#[async_trait]
impl ConfigStore for MemoryStore {
    async fn insert_config(&self, name: &str, steps: Vec<StepId>) -> StorageResult<BuildConfig> {
        let mut state = self.state()?;
        if state.configs.values().any(|c| c.name == name) {
            return Err(StorageError::DuplicateName {
                kind: "config",
                name: name.to_string(),
            });
        }
        let config = BuildConfig {
            config_id: ConfigId(state.allocate()),
            name: name.to_string(),
            steps,
        };
        state.configs.insert(config.config_id, config.clone());
        Ok(config)
    }

    async fn get_config(&self, id: ConfigId) -> StorageResult<BuildConfig> {
        let state = self.state()?;
        state
            .configs
            .get(&id)
            .cloned()
            .ok_or_else(|| StorageError::ConfigNotFound {
                config: id.to_string(),
            })
    }

    async fn find_config(&self, name: &str) -> StorageResult<Option<BuildConfig>> {
        let state = self.state()?;
        Ok(state.configs.values().find(|c| c.name == name).cloned())
    }

    async fn insert_step(&self, name: &str, job: StepJob) -> StorageResult<ConfigStep> {
        let mut state = self.state()?;
        if state.steps.values().any(|s| s.name == name) {
            return Err(StorageError::DuplicateName {
                kind: "step",
                name: name.to_string(),
            });
        }
        let step = ConfigStep {
            step_id: StepId(state.allocate()),
            name: name.to_string(),
            job,
        };
        state.steps.insert(step.step_id, step.clone());
        Ok(step)
    }

    async fn get_step(&self, id: StepId) -> StorageResult<ConfigStep> {
        let state = self.state()?;
        state
            .steps
            .get(&id)
            .cloned()
            .ok_or_else(|| StorageError::StepNotFound {
                step: id.to_string(),
            })
    }

    async fn find_step(&self, name: &str) -> StorageResult<Option<ConfigStep>> {
        let state = self.state()?;
        Ok(state.steps.values().find(|s| s.name == name).cloned())
    }

    async fn update_step(&self, step: ConfigStep) -> StorageResult<()> {
        let mut state = self.state()?;
        match state.steps.get_mut(&step.step_id) {
            Some(slot) => {
                *slot = step;
                Ok(())
            }
            None => Err(StorageError::StepNotFound {
                step: step.step_id.to_string(),
            }),
        }
    }

    async fn insert_trigger(&self, trigger: NewTrigger) -> StorageResult<Trigger> {
        let mut state = self.state()?;
        if state
            .triggers
            .values()
            .any(|t| t.project == trigger.project && t.name == trigger.name)
        {
            return Err(StorageError::DuplicateName {
                kind: "trigger",
                name: trigger.name,
            });
        }
        let record = Trigger {
            trigger_id: TriggerId(state.allocate()),
            project: trigger.project,
            name: trigger.name,
            repos: trigger.repos,
            dependencies: trigger.dependencies,
            config_id: trigger.config_id,
            category: trigger.category,
            upgrade_dumps_trigger: trigger.upgrade_dumps_trigger,
        };
        state.triggers.insert(record.trigger_id, record.clone());
        Ok(record)
    }

    async fn get_trigger(&self, id: TriggerId) -> StorageResult<Trigger> {
        let state = self.state()?;
        state
            .triggers
            .get(&id)
            .cloned()
            .ok_or_else(|| StorageError::TriggerNotFound {
                trigger: id.to_string(),
            })
    }

    async fn find_trigger(&self, project: &str, name: &str) -> StorageResult<Option<Trigger>> {
        let state = self.state()?;
        Ok(state
            .triggers
            .values()
            .find(|t| t.project == project && t.name == name)
            .cloned())
    }

    async fn list_triggers(
        &self,
        project: &str,
        category: Option<Category>,
    ) -> StorageResult<Vec<Trigger>> {
        let state = self.state()?;
        Ok(state
            .triggers
            .values()
            .filter(|t| t.project == project)
            .filter(|t| category.map_or(true, |c| t.category == c))
            .cloned()
            .collect())
    }

    async fn update_trigger(&self, trigger: Trigger) -> StorageResult<()> {
        let mut state = self.state()?;
        match state.triggers.get_mut(&trigger.trigger_id) {
            Some(slot) => {
                *slot = trigger;
                Ok(())
            }
            None => Err(StorageError::TriggerNotFound {
                trigger: trigger.trigger_id.to_string(),
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// BuildStore
// ---------------------------------------------------------------------------

#[async_trait]
impl BuildStore for MemoryStore {
    async fn create_build(
        &self,
        params: BuildParams,
        parent: Option<BuildId>,
        state: BuildState,
    ) -> StorageResult<CreatedBuild> {
        let mut guard = self.state()?;
        let fingerprint = params.fingerprint();

        if let Some(parent_id) = parent {
            let siblings = guard.build_mut(parent_id)?.children.clone();
            let existing = siblings
                .iter()
                .filter_map(|id| guard.builds.get(id))
                .find(|b| b.fingerprint == fingerprint);
            if let Some(build) = existing {
                return Ok(CreatedBuild {
                    build: build.clone(),
                    created: false,
                });
            }
        }

        let build = Build {
            build_id: BuildId(guard.allocate()),
            params,
            fingerprint,
            state,
            host: None,
            children: Vec::new(),
            expanded_steps: BTreeSet::new(),
            diagnostic: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        };
        if let Some(parent_id) = parent {
            guard.build_mut(parent_id)?.children.push(build.build_id);
            guard.parents.insert(build.build_id, parent_id);
        }
        guard.builds.insert(build.build_id, build.clone());
        Ok(CreatedBuild {
            build,
            created: true,
        })
    }

    async fn find_root_build(&self, fingerprint: &str) -> StorageResult<Option<Build>> {
        let state = self.state()?;
        Ok(state
            .builds
            .values()
            .rev()
            .find(|b| b.fingerprint == fingerprint && !state.parents.contains_key(&b.build_id))
            .cloned())
    }

    async fn get_build(&self, id: BuildId) -> StorageResult<Build> {
        let state = self.state()?;
        state
            .builds
            .get(&id)
            .cloned()
            .ok_or_else(|| StorageError::BuildNotFound {
                build: id.to_string(),
            })
    }

    async fn list_builds(&self, build_state: BuildState) -> StorageResult<Vec<Build>> {
        let state = self.state()?;
        Ok(state
            .builds
            .values()
            .filter(|b| b.state == build_state)
            .cloned()
            .collect())
    }

    async fn parent_of(&self, id: BuildId) -> StorageResult<Option<BuildId>> {
        let state = self.state()?;
        if !state.builds.contains_key(&id) {
            return Err(StorageError::BuildNotFound {
                build: id.to_string(),
            });
        }
        Ok(state.parents.get(&id).copied())
    }

    async fn children_of(&self, id: BuildId) -> StorageResult<Vec<Build>> {
        let state = self.state()?;
        let build = state
            .builds
            .get(&id)
            .ok_or_else(|| StorageError::BuildNotFound {
                build: id.to_string(),
            })?;
        Ok(build
            .children
            .iter()
            .filter_map(|child| state.builds.get(child))
            .cloned()
            .collect())
    }

    async fn set_build_state(
        &self,
        id: BuildId,
        transition: BuildTransition,
    ) -> StorageResult<Build> {
        let mut state = self.state()?;
        let build = state.build_mut(id)?;
        apply_build_transition(build, &transition)?;
        Ok(build.clone())
    }

    async fn mark_expanded(&self, id: BuildId, step: StepId) -> StorageResult<()> {
        let mut state = self.state()?;
        let build = state.build_mut(id)?;
        if !build.expanded_steps.insert(step) {
            return Err(StorageError::AlreadyExpanded {
                build: id.to_string(),
                step: step.to_string(),
            });
        }
        Ok(())
    }

    async fn register_database(&self, database: Database) -> StorageResult<()> {
        let mut state = self.state()?;
        state.build_mut(database.build_id)?;
        if state.databases.iter().any(|d| d.name == database.name) {
            return Err(StorageError::DuplicateName {
                kind: "database",
                name: database.name,
            });
        }
        state.databases.push(database);
        Ok(())
    }

    async fn databases_of(&self, id: BuildId) -> StorageResult<Vec<Database>> {
        let state = self.state()?;
        Ok(state
            .databases
            .iter()
            .filter(|d| d.build_id == id)
            .cloned()
            .collect())
    }
}

// ---------------------------------------------------------------------------
// BatchStore
// ---------------------------------------------------------------------------

#[async_trait]
impl BatchStore for MemoryStore {
    async fn create_batch(&self, bundle: BundleId, category: Category) -> StorageResult<Batch> {
        let mut state = self.state()?;
        if !state.bundles.contains_key(&bundle) {
            return Err(StorageError::BundleNotFound {
                bundle: bundle.to_string(),
            });
        }
        let batch = Batch {
            batch_id: BatchId(state.allocate()),
            bundle_id: bundle,
            category,
            state: BatchState::Preparing,
            slots: Vec::new(),
            created_at: Utc::now(),
        };
        state.batches.insert(batch.batch_id, batch.clone());
        Ok(batch)
    }

    async fn get_batch(&self, id: BatchId) -> StorageResult<Batch> {
        let state = self.state()?;
        state
            .batches
            .get(&id)
            .cloned()
            .ok_or_else(|| StorageError::BatchNotFound {
                batch: id.to_string(),
            })
    }

    async fn add_slot(&self, id: BatchId, slot: Slot) -> StorageResult<Batch> {
        let mut state = self.state()?;
        let batch = state.batch_mut(id)?;
        if batch.slot_for(slot.trigger_id).is_some() {
            return Err(StorageError::DuplicateSlot {
                batch: id.to_string(),
                trigger: slot.trigger_id.to_string(),
            });
        }
        batch.slots.push(slot);
        Ok(batch.clone())
    }

    async fn set_batch_state(&self, id: BatchId, to: BatchState) -> StorageResult<Batch> {
        let mut state = self.state()?;
        let batch = state.batch_mut(id)?;
        check_batch_transition(batch, to)?;
        batch.state = to;
        Ok(batch.clone())
    }

    async fn list_batches(
        &self,
        bundle: BundleId,
        category: Option<Category>,
    ) -> StorageResult<Vec<Batch>> {
        let state = self.state()?;
        Ok(state
            .batches
            .values()
            .rev()
            .filter(|b| b.bundle_id == bundle)
            .filter(|b| category.map_or(true, |c| b.category == c))
            .cloned()
            .collect())
    }

    async fn batches_in_state(&self, batch_state: BatchState) -> StorageResult<Vec<Batch>> {
        let state = self.state()?;
        Ok(state
            .batches
            .values()
            .filter(|b| b.state == batch_state)
            .cloned()
            .collect())
    }
}
