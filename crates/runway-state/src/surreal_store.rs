//! SurrealDB-backed implementation of the storage traits
//!
//! Each record is stored as a [`DocRow`]: an integer `key` (the record id),
//! a few indexed lookup columns and the JSON-encoded record in `body`.
//!
//! Keys are drawn from a counter record inside the database, so several
//! handles (or processes) on one database never hand out the same key.
//! Build updates are compare-and-swap on the stored body: a claim that lost
//! to another writer re-reads the build and fails the lifecycle check
//! instead of overwriting it. Check-then-insert sequences also run under an
//! in-process write lock.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use surrealdb::engine::any::Any;
use surrealdb::Surreal;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::connection::{self, StoreSettings};
use crate::error::StorageError;
use crate::migrations;
use crate::schema::*;
use crate::storage_traits::*;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct DocRow {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    id: Option<surrealdb::sql::Thing>,
    key: i64,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    scope: Option<String>,
    #[serde(default)]
    parent: Option<i64>,
    body: String,
}

impl DocRow {
    fn new<T: Serialize>(key: u64, record: &T) -> StorageResult<Self> {
        Ok(Self {
            id: None,
            key: key as i64,
            name: None,
            scope: None,
            parent: None,
            body: serde_json::to_string(record)?,
        })
    }

    fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    fn scoped(mut self, scope: impl Into<String>) -> Self {
        self.scope = Some(scope.into());
        self
    }

    fn child_of(mut self, parent: u64) -> Self {
        self.parent = Some(parent as i64);
        self
    }

    fn decode<T: DeserializeOwned>(&self) -> StorageResult<T> {
        Ok(serde_json::from_str(&self.body)?)
    }
}

/// Attempts at a compare-and-swap update before giving up.
const SWAP_ATTEMPTS: usize = 8;

/// SurrealDB-backed implementation of [`CiStore`].
pub struct SurrealStore {
    db: Surreal<Any>,
    write_lock: Mutex<()>,
}

impl SurrealStore {
    /// Create an in-memory instance for testing.
    ///
    /// Connects to `mem://`, selects `runway/main`, and runs `init_schema`.
    pub async fn in_memory() -> crate::Result<Self> {
        let db = connection::connect_url("mem://").await?;
        let store = Self::open(db).await?;
        info!("SurrealStore connected (in-memory)");
        Ok(store)
    }

    /// Create from environment variables, see [`StoreSettings::from_env`].
    pub async fn from_env() -> crate::Result<Self> {
        Self::connect(&StoreSettings::from_env()).await
    }

    pub async fn connect(settings: &StoreSettings) -> crate::Result<Self> {
        let db = settings.connect().await?;
        Self::open(db).await
    }

    /// Wrap an already connected handle and initialise the schema.
    ///
    /// Several handles may be open on the same database at once.
    pub async fn open(db: Surreal<Any>) -> crate::Result<Self> {
        migrations::init_schema(&db).await?;
        Ok(Self {
            db,
            write_lock: Mutex::new(()),
        })
    }

    // -- private helpers -----------------------------------------------------

    /// Next key of the database-wide sequence. The increment is a single
    /// statement, so concurrent handles each get a distinct key.
    async fn allocate(&self) -> StorageResult<u64> {
        let mut res = self
            .db
            .query("UPSERT counters:keys SET n = (n ?? 0) + 1 RETURN VALUE n")
            .await?;
        let keys: Vec<i64> = res.take(0)?;
        keys.into_iter()
            .next()
            .map(|n| n as u64)
            .ok_or_else(|| StorageError::Backend("key counter returned no value".to_string()))
    }

    async fn select(
        &self,
        table: &'static str,
        clause: &str,
        binds: Vec<(&'static str, Value)>,
    ) -> StorageResult<Vec<DocRow>> {
        let sql = format!("SELECT * FROM type::table($tb) WHERE {clause}");
        let mut query = self.db.query(sql).bind(("tb", table));
        for bind in binds {
            query = query.bind(bind);
        }
        let mut res = query.await?;
        let mut rows: Vec<DocRow> = res.take(0)?;
        rows.sort_by_key(|r| r.key);
        Ok(rows)
    }

    async fn select_all(&self, table: &'static str) -> StorageResult<Vec<DocRow>> {
        self.select(table, "true", Vec::new()).await
    }

    async fn select_key(&self, table: &'static str, key: u64) -> StorageResult<Option<DocRow>> {
        let rows = self
            .select(table, "key = $key", vec![("key", json!(key as i64))])
            .await?;
        Ok(rows.into_iter().next())
    }

    async fn select_named(
        &self,
        table: &'static str,
        scope: Option<&str>,
        name: &str,
    ) -> StorageResult<Option<DocRow>> {
        let rows = match scope {
            Some(scope) => {
                self.select(
                    table,
                    "scope = $scope AND name = $name",
                    vec![("scope", json!(scope)), ("name", json!(name))],
                )
                .await?
            }
            None => {
                self.select(table, "name = $name", vec![("name", json!(name))])
                    .await?
            }
        };
        Ok(rows.into_iter().next())
    }

    async fn insert(&self, table: &'static str, row: DocRow) -> StorageResult<()> {
        let _created: Option<DocRow> = self.db.create(table).content(row).await?;
        Ok(())
    }

    async fn update_body<T: Serialize>(
        &self,
        table: &'static str,
        key: u64,
        record: &T,
    ) -> StorageResult<()> {
        let body = serde_json::to_string(record)?;
        self.db
            .query("UPDATE type::table($tb) SET body = $body WHERE key = $key")
            .bind(("tb", table))
            .bind(("body", body))
            .bind(("key", key as i64))
            .await?;
        Ok(())
    }

    /// Rewrite `body` only if the row still holds `expected`. Returns whether
    /// the row was updated.
    async fn swap_body<T: Serialize>(
        &self,
        table: &'static str,
        key: u64,
        expected: &str,
        record: &T,
    ) -> StorageResult<bool> {
        let body = serde_json::to_string(record)?;
        let mut res = self
            .db
            .query(
                "UPDATE type::table($tb) SET body = $body \
                 WHERE key = $key AND body = $expected RETURN VALUE key",
            )
            .bind(("tb", table))
            .bind(("body", body))
            .bind(("key", key as i64))
            .bind(("expected", expected.to_string()))
            .await?;
        let updated: Vec<i64> = res.take(0)?;
        Ok(!updated.is_empty())
    }

    /// Apply `change` to a build and store it, retrying from a fresh read when
    /// another writer changed the build in between. An error from `change`
    /// aborts without writing.
    async fn modify_build<F>(&self, id: BuildId, mut change: F) -> StorageResult<Build>
    where
        F: FnMut(&mut Build) -> StorageResult<()> + Send,
    {
        for attempt in 1..=SWAP_ATTEMPTS {
            let row = self
                .select_key("builds", id.0)
                .await?
                .ok_or_else(|| StorageError::BuildNotFound {
                    build: id.to_string(),
                })?;
            let mut build: Build = row.decode()?;
            change(&mut build)?;
            if self.swap_body("builds", id.0, &row.body, &build).await? {
                return Ok(build);
            }
            debug!(build = %id, attempt, "build changed concurrently, retrying");
        }
        warn!(build = %id, "giving up on contended build update");
        Err(StorageError::Backend(format!(
            "build {id} kept changing during update"
        )))
    }

    async fn load_version(&self, id: VersionId) -> StorageResult<Version> {
        self.select_key("versions", id.0)
            .await?
            .ok_or_else(|| StorageError::VersionNotFound {
                version: id.to_string(),
            })?
            .decode()
    }

    async fn load_bundle(&self, id: BundleId) -> StorageResult<Bundle> {
        self.select_key("bundles", id.0)
            .await?
            .ok_or_else(|| StorageError::BundleNotFound {
                bundle: id.to_string(),
            })?
            .decode()
    }

    async fn load_build(&self, id: BuildId) -> StorageResult<Build> {
        self.select_key("builds", id.0)
            .await?
            .ok_or_else(|| StorageError::BuildNotFound {
                build: id.to_string(),
            })?
            .decode()
    }

    async fn load_batch(&self, id: BatchId) -> StorageResult<Batch> {
        self.select_key("batches", id.0)
            .await?
            .ok_or_else(|| StorageError::BatchNotFound {
                batch: id.to_string(),
            })?
            .decode()
    }
}

fn decode_all<T: DeserializeOwned>(rows: Vec<DocRow>) -> StorageResult<Vec<T>> {
    rows.iter().map(DocRow::decode).collect()
}

// ---------------------------------------------------------------------------
// VersionStore
// ---------------------------------------------------------------------------

#[async_trait]
impl VersionStore for SurrealStore {
    async fn insert_version(
        &self,
        name: &str,
        number: VersionNumber,
        is_major: bool,
    ) -> StorageResult<Version> {
        let _guard = self.write_lock.lock().await;
        if self.select_named("versions", None, name).await?.is_some() {
            return Err(StorageError::DuplicateName {
                kind: "version",
                name: name.to_string(),
            });
        }
        let version = Version {
            version_id: VersionId(self.allocate().await?),
            name: name.to_string(),
            number,
            is_major,
            created_at: Utc::now(),
        };
        let row = DocRow::new(version.version_id.0, &version)?.named(name);
        self.insert("versions", row).await?;
        debug!(version = %version.name, id = %version.version_id, "version stored");
        Ok(version)
    }

    async fn find_version(&self, name: &str) -> StorageResult<Option<Version>> {
        self.select_named("versions", None, name)
            .await?
            .map(|row| row.decode())
            .transpose()
    }

    async fn get_version(&self, id: VersionId) -> StorageResult<Version> {
        self.load_version(id).await
    }

    async fn list_versions(&self) -> StorageResult<Vec<Version>> {
        decode_all(self.select_all("versions").await?)
    }
}

// ---------------------------------------------------------------------------
// BundleStore
// ---------------------------------------------------------------------------

#[async_trait]
impl BundleStore for SurrealStore {
    async fn insert_bundle(&self, bundle: NewBundle) -> StorageResult<Bundle> {
        let _guard = self.write_lock.lock().await;
        if self
            .select_named("bundles", Some(&bundle.project), &bundle.name)
            .await?
            .is_some()
        {
            return Err(StorageError::DuplicateName {
                kind: "bundle",
                name: bundle.name,
            });
        }
        let record = Bundle {
            bundle_id: BundleId(self.allocate().await?),
            project: bundle.project,
            name: bundle.name,
            is_base: bundle.is_base,
            base_id: bundle.base_id,
            version_id: bundle.version_id,
            commits: bundle.commits,
        };
        let row = DocRow::new(record.bundle_id.0, &record)?
            .named(record.name.clone())
            .scoped(record.project.clone());
        self.insert("bundles", row).await?;
        Ok(record)
    }

    async fn get_bundle(&self, id: BundleId) -> StorageResult<Bundle> {
        self.load_bundle(id).await
    }

    async fn find_bundle(&self, project: &str, name: &str) -> StorageResult<Option<Bundle>> {
        self.select_named("bundles", Some(project), name)
            .await?
            .map(|row| row.decode())
            .transpose()
    }

    async fn list_bundles(&self, project: &str) -> StorageResult<Vec<Bundle>> {
        let rows = self
            .select("bundles", "scope = $scope", vec![("scope", json!(project))])
            .await?;
        decode_all(rows)
    }

    async fn set_bundle_commits(
        &self,
        id: BundleId,
        commits: BTreeMap<String, String>,
    ) -> StorageResult<Bundle> {
        let _guard = self.write_lock.lock().await;
        let mut bundle = self.load_bundle(id).await?;
        bundle.commits = commits;
        self.update_body("bundles", id.0, &bundle).await?;
        Ok(bundle)
    }
}

// ---------------------------------------------------------------------------
// ConfigStore
// ---------------------------------------------------------------------------

#[async_trait]
impl ConfigStore for SurrealStore {
    async fn insert_config(&self, name: &str, steps: Vec<StepId>) -> StorageResult<BuildConfig> {
        let _guard = self.write_lock.lock().await;
        if self.select_named("configs", None, name).await?.is_some() {
            return Err(StorageError::DuplicateName {
                kind: "config",
                name: name.to_string(),
            });
        }
        let config = BuildConfig {
            config_id: ConfigId(self.allocate().await?),
            name: name.to_string(),
            steps,
        };
        let row = DocRow::new(config.config_id.0, &config)?.named(name);
        self.insert("configs", row).await?;
        Ok(config)
    }

    async fn get_config(&self, id: ConfigId) -> StorageResult<BuildConfig> {
        self.select_key("configs", id.0)
            .await?
            .ok_or_else(|| StorageError::ConfigNotFound {
                config: id.to_string(),
            })?
            .decode()
    }

    async fn find_config(&self, name: &str) -> StorageResult<Option<BuildConfig>> {
        self.select_named("configs", None, name)
            .await?
            .map(|row| row.decode())
            .transpose()
    }

    async fn insert_step(&self, name: &str, job: StepJob) -> StorageResult<ConfigStep> {
        let _guard = self.write_lock.lock().await;
        if self.select_named("steps", None, name).await?.is_some() {
            return Err(StorageError::DuplicateName {
                kind: "step",
                name: name.to_string(),
            });
        }
        let step = ConfigStep {
            step_id: StepId(self.allocate().await?),
            name: name.to_string(),
            job,
        };
        let row = DocRow::new(step.step_id.0, &step)?.named(name);
        self.insert("steps", row).await?;
        Ok(step)
    }

    async fn get_step(&self, id: StepId) -> StorageResult<ConfigStep> {
        self.select_key("steps", id.0)
            .await?
            .ok_or_else(|| StorageError::StepNotFound {
                step: id.to_string(),
            })?
            .decode()
    }

    async fn find_step(&self, name: &str) -> StorageResult<Option<ConfigStep>> {
        self.select_named("steps", None, name)
            .await?
            .map(|row| row.decode())
            .transpose()
    }

    async fn update_step(&self, step: ConfigStep) -> StorageResult<()> {
        let _guard = self.write_lock.lock().await;
        if self.select_key("steps", step.step_id.0).await?.is_none() {
            return Err(StorageError::StepNotFound {
                step: step.step_id.to_string(),
            });
        }
        self.update_body("steps", step.step_id.0, &step).await
    }

    async fn insert_trigger(&self, trigger: NewTrigger) -> StorageResult<Trigger> {
        let _guard = self.write_lock.lock().await;
        if self
            .select_named("triggers", Some(&trigger.project), &trigger.name)
            .await?
            .is_some()
        {
            return Err(StorageError::DuplicateName {
                kind: "trigger",
                name: trigger.name,
            });
        }
        let record = Trigger {
            trigger_id: TriggerId(self.allocate().await?),
            project: trigger.project,
            name: trigger.name,
            repos: trigger.repos,
            dependencies: trigger.dependencies,
            config_id: trigger.config_id,
            category: trigger.category,
            upgrade_dumps_trigger: trigger.upgrade_dumps_trigger,
        };
        let row = DocRow::new(record.trigger_id.0, &record)?
            .named(record.name.clone())
            .scoped(record.project.clone());
        self.insert("triggers", row).await?;
        Ok(record)
    }

    async fn get_trigger(&self, id: TriggerId) -> StorageResult<Trigger> {
        self.select_key("triggers", id.0)
            .await?
            .ok_or_else(|| StorageError::TriggerNotFound {
                trigger: id.to_string(),
            })?
            .decode()
    }

    async fn find_trigger(&self, project: &str, name: &str) -> StorageResult<Option<Trigger>> {
        self.select_named("triggers", Some(project), name)
            .await?
            .map(|row| row.decode())
            .transpose()
    }

    async fn list_triggers(
        &self,
        project: &str,
        category: Option<Category>,
    ) -> StorageResult<Vec<Trigger>> {
        let rows = self
            .select("triggers", "scope = $scope", vec![("scope", json!(project))])
            .await?;
        let triggers: Vec<Trigger> = decode_all(rows)?;
        Ok(triggers
            .into_iter()
            .filter(|t| category.map_or(true, |c| t.category == c))
            .collect())
    }

    async fn update_trigger(&self, trigger: Trigger) -> StorageResult<()> {
        let _guard = self.write_lock.lock().await;
        if self
            .select_key("triggers", trigger.trigger_id.0)
            .await?
            .is_none()
        {
            return Err(StorageError::TriggerNotFound {
                trigger: trigger.trigger_id.to_string(),
            });
        }
        self.update_body("triggers", trigger.trigger_id.0, &trigger)
            .await
    }
}

// ---------------------------------------------------------------------------
// BuildStore
// ---------------------------------------------------------------------------

#[async_trait]
impl BuildStore for SurrealStore {
    async fn create_build(
        &self,
        params: BuildParams,
        parent: Option<BuildId>,
        state: BuildState,
    ) -> StorageResult<CreatedBuild> {
        let _guard = self.write_lock.lock().await;
        let fingerprint = params.fingerprint();

        let parent_build = match parent {
            Some(id) => Some(self.load_build(id).await?),
            None => None,
        };
        if let Some(parent_build) = &parent_build {
            let siblings = self
                .select(
                    "builds",
                    "parent = $parent AND name = $name",
                    vec![
                        ("parent", json!(parent_build.build_id.0 as i64)),
                        ("name", json!(fingerprint)),
                    ],
                )
                .await?;
            if let Some(row) = siblings.into_iter().next() {
                return Ok(CreatedBuild {
                    build: row.decode()?,
                    created: false,
                });
            }
        }

        let build = Build {
            build_id: BuildId(self.allocate().await?),
            params,
            fingerprint: fingerprint.clone(),
            state,
            host: None,
            children: Vec::new(),
            expanded_steps: Default::default(),
            diagnostic: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        };
        let mut row = DocRow::new(build.build_id.0, &build)?.named(fingerprint);
        if let Some(parent_id) = parent {
            row = row.child_of(parent_id.0);
        }
        self.insert("builds", row).await?;
        if let Some(parent_id) = parent {
            let child = build.build_id;
            self.modify_build(parent_id, |parent| {
                if !parent.children.contains(&child) {
                    parent.children.push(child);
                }
                Ok(())
            })
            .await?;
        }
        debug!(build = %build.build_id, parent = ?parent, "build stored");
        Ok(CreatedBuild {
            build,
            created: true,
        })
    }

    async fn find_root_build(&self, fingerprint: &str) -> StorageResult<Option<Build>> {
        let rows = self
            .select(
                "builds",
                "name = $name AND parent = NONE",
                vec![("name", json!(fingerprint))],
            )
            .await?;
        rows.last().map(DocRow::decode).transpose()
    }

    async fn get_build(&self, id: BuildId) -> StorageResult<Build> {
        self.load_build(id).await
    }

    async fn list_builds(&self, state: BuildState) -> StorageResult<Vec<Build>> {
        let builds: Vec<Build> = decode_all(self.select_all("builds").await?)?;
        Ok(builds.into_iter().filter(|b| b.state == state).collect())
    }

    async fn parent_of(&self, id: BuildId) -> StorageResult<Option<BuildId>> {
        let row = self
            .select_key("builds", id.0)
            .await?
            .ok_or_else(|| StorageError::BuildNotFound {
                build: id.to_string(),
            })?;
        Ok(row.parent.map(|p| BuildId(p as u64)))
    }

    async fn children_of(&self, id: BuildId) -> StorageResult<Vec<Build>> {
        let parent = self.load_build(id).await?;
        let rows = self
            .select(
                "builds",
                "parent = $parent",
                vec![("parent", json!(id.0 as i64))],
            )
            .await?;
        let mut children: BTreeMap<BuildId, Build> = BTreeMap::new();
        for row in rows {
            let build: Build = row.decode()?;
            children.insert(build.build_id, build);
        }
        Ok(parent
            .children
            .iter()
            .filter_map(|child| children.remove(child))
            .collect())
    }

    async fn set_build_state(
        &self,
        id: BuildId,
        transition: BuildTransition,
    ) -> StorageResult<Build> {
        self.modify_build(id, |build| apply_build_transition(build, &transition))
            .await
    }

    async fn mark_expanded(&self, id: BuildId, step: StepId) -> StorageResult<()> {
        self.modify_build(id, |build| {
            if build.expanded_steps.insert(step) {
                Ok(())
            } else {
                Err(StorageError::AlreadyExpanded {
                    build: id.to_string(),
                    step: step.to_string(),
                })
            }
        })
        .await
        .map(|_| ())
    }

    async fn register_database(&self, database: Database) -> StorageResult<()> {
        let _guard = self.write_lock.lock().await;
        self.load_build(database.build_id).await?;
        if self
            .select_named("databases", None, &database.name)
            .await?
            .is_some()
        {
            return Err(StorageError::DuplicateName {
                kind: "database",
                name: database.name,
            });
        }
        let row = DocRow::new(self.allocate().await?, &database)?
            .named(database.name.clone())
            .child_of(database.build_id.0);
        self.insert("databases", row).await
    }

    async fn databases_of(&self, id: BuildId) -> StorageResult<Vec<Database>> {
        let rows = self
            .select(
                "databases",
                "parent = $parent",
                vec![("parent", json!(id.0 as i64))],
            )
            .await?;
        decode_all(rows)
    }
}

// ---------------------------------------------------------------------------
// BatchStore
// ---------------------------------------------------------------------------

#[async_trait]
impl BatchStore for SurrealStore {
    async fn create_batch(&self, bundle: BundleId, category: Category) -> StorageResult<Batch> {
        let _guard = self.write_lock.lock().await;
        self.load_bundle(bundle).await?;
        let batch = Batch {
            batch_id: BatchId(self.allocate().await?),
            bundle_id: bundle,
            category,
            state: BatchState::Preparing,
            slots: Vec::new(),
            created_at: Utc::now(),
        };
        let row = DocRow::new(batch.batch_id.0, &batch)?
            .named(category.as_str())
            .child_of(bundle.0);
        self.insert("batches", row).await?;
        Ok(batch)
    }

    async fn get_batch(&self, id: BatchId) -> StorageResult<Batch> {
        self.load_batch(id).await
    }

    async fn add_slot(&self, id: BatchId, slot: Slot) -> StorageResult<Batch> {
        let _guard = self.write_lock.lock().await;
        let mut batch = self.load_batch(id).await?;
        if batch.slot_for(slot.trigger_id).is_some() {
            return Err(StorageError::DuplicateSlot {
                batch: id.to_string(),
                trigger: slot.trigger_id.to_string(),
            });
        }
        batch.slots.push(slot);
        self.update_body("batches", id.0, &batch).await?;
        Ok(batch)
    }

    async fn set_batch_state(&self, id: BatchId, state: BatchState) -> StorageResult<Batch> {
        let _guard = self.write_lock.lock().await;
        let mut batch = self.load_batch(id).await?;
        check_batch_transition(&batch, state)?;
        batch.state = state;
        self.update_body("batches", id.0, &batch).await?;
        Ok(batch)
    }

    async fn list_batches(
        &self,
        bundle: BundleId,
        category: Option<Category>,
    ) -> StorageResult<Vec<Batch>> {
        let rows = match category {
            Some(category) => {
                self.select(
                    "batches",
                    "parent = $parent AND name = $name",
                    vec![
                        ("parent", json!(bundle.0 as i64)),
                        ("name", json!(category.as_str())),
                    ],
                )
                .await?
            }
            None => {
                self.select(
                    "batches",
                    "parent = $parent",
                    vec![("parent", json!(bundle.0 as i64))],
                )
                .await?
            }
        };
        let mut batches: Vec<Batch> = decode_all(rows)?;
        batches.reverse();
        Ok(batches)
    }

    async fn batches_in_state(&self, state: BatchState) -> StorageResult<Vec<Batch>> {
        let batches: Vec<Batch> = decode_all(self.select_all("batches").await?)?;
        Ok(batches.into_iter().filter(|b| b.state == state).collect())
    }
}
