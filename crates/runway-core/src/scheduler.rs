//! Batch scheduling.
//!
//! A scheduling cycle turns (bundle, category) targets into batches: one slot
//! per trigger of the category, each bound to a root build that is reused by
//! fingerprint when the same work was already scheduled. Upgrade planning
//! happens here, so the reference builds a build will expand against are part
//! of its params.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use futures::future::join_all;
use runway_state::{
    Batch, BatchId, BatchState, BuildId, BuildParams, BuildState, Bundle, BundleId,
    Category, CiStore, Slot, StepJob, Trigger, Version,
};
use tracing::{debug, info, warn};

use crate::bundles::BundleRegistry;
use crate::error::{Result, RunwayError, ValidationError};
use crate::lifecycle::BuildLifecycle;
use crate::lineage::VersionCatalog;
use crate::matrix::UpgradeMatrixGenerator;
use crate::metrics::METRICS;
use crate::obs;
use crate::reference::LatestDoneResolver;

/// Explicit inputs of one batch preparation.
#[derive(Debug, Clone)]
pub struct SchedulingContext {
    pub bundle: Bundle,
    /// Version of the bundle.
    pub version: Version,
    pub master: Option<Version>,
    pub category: Category,
}

#[derive(Debug, Clone)]
pub struct PreparedBatch {
    pub batch: Batch,
    pub created: usize,
    pub reused: usize,
    /// `false` when the newest batch already covered exactly this work and
    /// was returned as is.
    pub fresh: bool,
}

#[derive(Debug, Default)]
pub struct CycleReport {
    pub prepared: Vec<PreparedBatch>,
    pub failed: Vec<(BundleId, Category, String)>,
    /// Batches closed by the refresh at the end of the cycle.
    pub completed: Vec<BatchId>,
}

pub struct Scheduler {
    store: Arc<dyn CiStore>,
    catalog: Arc<VersionCatalog>,
    registry: Arc<BundleRegistry>,
    lifecycle: Arc<BuildLifecycle>,
}

impl Scheduler {
    pub fn new(
        store: Arc<dyn CiStore>,
        catalog: Arc<VersionCatalog>,
        registry: Arc<BundleRegistry>,
        lifecycle: Arc<BuildLifecycle>,
    ) -> Self {
        Self {
            store,
            catalog,
            registry,
            lifecycle,
        }
    }

    pub async fn context(&self, bundle: BundleId, category: Category) -> Result<SchedulingContext> {
        let bundle = self.registry.get(bundle).await?;
        let mut lineage = self.catalog.snapshot().await;
        if lineage.get(bundle.version_id).is_none() {
            lineage = self.catalog.refresh().await?;
        }
        let version = match lineage.get(bundle.version_id) {
            Some(version) => version.clone(),
            None => self.store.get_version(bundle.version_id).await?,
        };
        Ok(SchedulingContext {
            bundle,
            version,
            master: lineage.master().cloned(),
            category,
        })
    }

    /// Prepare a batch for `bundle` in `category`.
    pub async fn prepare_batch(
        &self,
        bundle: BundleId,
        category: Category,
    ) -> Result<PreparedBatch> {
        let ctx = self.context(bundle, category).await?;
        let base = self.registry.base_of(&ctx.bundle).await?;
        let triggers = self
            .store
            .list_triggers(&ctx.bundle.project, Some(category))
            .await?;

        let mut planned: Vec<(Trigger, BuildParams)> = Vec::with_capacity(triggers.len());
        for trigger in triggers {
            let params = self.plan_params(&ctx, &base, &trigger).await?;
            planned.push((trigger, params));
        }

        if let Some(existing) = self.unchanged_batch(&ctx, &planned).await? {
            debug!(batch = %existing.batch_id, bundle = %ctx.bundle.name, "batch unchanged");
            let reused = existing.slots.len();
            return Ok(PreparedBatch {
                batch: existing,
                created: 0,
                reused,
                fresh: false,
            });
        }

        let batch = self.store.create_batch(ctx.bundle.bundle_id, category).await?;
        let mut drafts: Vec<BuildId> = Vec::new();
        let mut reused = 0;
        for (trigger, params) in planned {
            let fingerprint = params.fingerprint();
            let build = match self.store.find_root_build(&fingerprint).await? {
                Some(build) if build.state != BuildState::Skipped => {
                    METRICS.inc_builds_reused();
                    reused += 1;
                    build
                }
                _ => {
                    let created = self.store.create_build(params, None, BuildState::Draft).await?;
                    METRICS.inc_builds_created();
                    drafts.push(created.build.build_id);
                    created.build
                }
            };
            self.store
                .add_slot(
                    batch.batch_id,
                    Slot {
                        trigger_id: trigger.trigger_id,
                        build_id: build.build_id,
                    },
                )
                .await?;
            debug!(trigger = %trigger.name, build = %build.build_id, "slot bound");
        }

        let batch = self.store.set_batch_state(batch.batch_id, BatchState::Ready).await?;
        for id in &drafts {
            self.lifecycle.promote(*id).await?;
        }
        self.supersede(&batch).await?;

        obs::emit_batch_prepared(
            batch.batch_id,
            ctx.bundle.bundle_id,
            category,
            batch.slots.len(),
            drafts.len(),
        );
        Ok(PreparedBatch {
            batch,
            created: drafts.len(),
            reused,
            fresh: true,
        })
    }

    /// Prepare a batch now, outside the regular cycle.
    pub async fn force(&self, bundle: BundleId, category: Category) -> Result<PreparedBatch> {
        info!(bundle = %bundle, category = %category, "forced batch");
        self.prepare_batch(bundle, category).await
    }

    /// Prepare every target concurrently, then close finished batches.
    pub async fn run_cycle(&self, targets: &[(BundleId, Category)]) -> Result<CycleReport> {
        let results = join_all(
            targets
                .iter()
                .map(|(bundle, category)| self.prepare_batch(*bundle, *category)),
        )
        .await;

        let mut report = CycleReport::default();
        for ((bundle, category), result) in targets.iter().zip(results) {
            match result {
                Ok(prepared) => report.prepared.push(prepared),
                Err(err) => {
                    warn!(bundle = %bundle, category = %category, error = %err, "batch preparation failed");
                    report.failed.push((*bundle, *category, err.to_string()));
                }
            }
        }
        report.completed = self.refresh_batches().await?;
        METRICS.flush();
        Ok(report)
    }

    /// Mark ready batches done once every build in them is transitively
    /// terminal.
    pub async fn refresh_batches(&self) -> Result<Vec<BatchId>> {
        let mut completed = Vec::new();
        for batch in self.store.batches_in_state(BatchState::Ready).await? {
            let mut finished = true;
            for id in batch.build_ids() {
                if !self.lifecycle.is_transitively_terminal(id).await? {
                    finished = false;
                    break;
                }
            }
            if finished {
                self.store
                    .set_batch_state(batch.batch_id, BatchState::Done)
                    .await?;
                info!(batch = %batch.batch_id, "batch done");
                completed.push(batch.batch_id);
            }
        }
        Ok(completed)
    }

    async fn plan_params(
        &self,
        ctx: &SchedulingContext,
        base: &Bundle,
        trigger: &Trigger,
    ) -> Result<BuildParams> {
        let mut params = BuildParams::new(
            ctx.bundle.project.clone(),
            trigger.config_id,
            ctx.version.version_id,
            trigger.trigger_id,
        );
        params.commits = trigger_commits(trigger, &ctx.bundle, base);

        let config = self.store.get_config(trigger.config_id).await?;
        for step_id in &config.steps {
            let step = self.store.get_step(*step_id).await?;
            let StepJob::ConfigureUpgrade(policy) = &step.job else {
                continue;
            };
            let dumps_trigger =
                trigger
                    .upgrade_dumps_trigger
                    .ok_or_else(|| ValidationError::MissingDumpsTrigger {
                        trigger: trigger.name.clone(),
                    })?;
            let lineage = self.catalog.snapshot().await;
            let resolver = LatestDoneResolver::new(self.store.clone(), ctx.bundle.project.clone());
            let matrix = UpgradeMatrixGenerator::new(&lineage, &resolver)
                .generate(policy, &ctx.version, ctx.master.as_ref(), dumps_trigger)
                .await?;
            debug!(
                trigger = %trigger.name,
                step = %step.name,
                pairs = matrix.pairs.len(),
                references = matrix.reference_ids.len(),
                "upgrade matrix planned"
            );
            params.builds_reference_ids.extend(matrix.reference_ids);
        }
        Ok(params)
    }

    /// Newest live batch, when it already binds every planned trigger to a
    /// build with the planned fingerprint.
    async fn unchanged_batch(
        &self,
        ctx: &SchedulingContext,
        planned: &[(Trigger, BuildParams)],
    ) -> Result<Option<Batch>> {
        let latest = self
            .store
            .list_batches(ctx.bundle.bundle_id, Some(ctx.category))
            .await?
            .into_iter()
            .find(|b| matches!(b.state, BatchState::Ready | BatchState::Done));
        let Some(latest) = latest else {
            return Ok(None);
        };
        if latest.slots.len() != planned.len() {
            return Ok(None);
        }
        for (trigger, params) in planned {
            let Some(slot) = latest.slot_for(trigger.trigger_id) else {
                return Ok(None);
            };
            let build = self.store.get_build(slot.build_id).await?;
            if build.state == BuildState::Skipped || build.fingerprint != params.fingerprint() {
                return Ok(None);
            }
        }
        Ok(Some(latest))
    }

    /// Retire older batches of the same bundle and category.
    async fn supersede(&self, current: &Batch) -> Result<()> {
        let keep: BTreeSet<BuildId> = current.build_ids().collect();
        for older in self
            .store
            .list_batches(current.bundle_id, Some(current.category))
            .await?
        {
            if older.batch_id >= current.batch_id {
                continue;
            }
            match older.state {
                BatchState::Preparing => {
                    self.store
                        .set_batch_state(older.batch_id, BatchState::Skipped)
                        .await?;
                }
                BatchState::Ready => {
                    for id in older.build_ids().filter(|id| !keep.contains(id)) {
                        let build = self.store.get_build(id).await?;
                        if matches!(build.state, BuildState::Draft | BuildState::Pending) {
                            match self.lifecycle.skip(id).await {
                                Ok(_) => {}
                                // Claimed by a host since we read it.
                                Err(RunwayError::InvalidTransition { .. }) => {}
                                Err(err) => return Err(err),
                            }
                        }
                    }
                }
                BatchState::Done | BatchState::Skipped => {}
            }
        }
        Ok(())
    }
}

/// Commits of the trigger's repositories: the bundle's head when it has one,
/// otherwise the base bundle's.
pub fn trigger_commits(
    trigger: &Trigger,
    bundle: &Bundle,
    base: &Bundle,
) -> BTreeMap<String, String> {
    trigger
        .all_repos()
        .filter_map(|repo| {
            bundle
                .commits
                .get(repo)
                .or_else(|| base.commits.get(repo))
                .map(|sha| (repo.clone(), sha.clone()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use runway_state::{ConfigId, TriggerId, VersionId};

    fn bundle(name: &str, commits: &[(&str, &str)]) -> Bundle {
        Bundle {
            bundle_id: BundleId(1),
            project: "tests".into(),
            name: name.into(),
            is_base: false,
            base_id: None,
            version_id: VersionId(1),
            commits: commits
                .iter()
                .map(|(r, c)| (r.to_string(), c.to_string()))
                .collect(),
        }
    }

    #[test]
    fn test_trigger_commits_fall_back_to_base() {
        let trigger = Trigger {
            trigger_id: TriggerId(1),
            project: "tests".into(),
            name: "server".into(),
            repos: vec!["server".into()],
            dependencies: vec!["addons".into()],
            config_id: ConfigId(1),
            category: Category::Default,
            upgrade_dumps_trigger: None,
        };
        let dev = bundle("13.0-fix", &[("server", "aaa"), ("enterprise", "zzz")]);
        let base = bundle("13.0", &[("server", "bbb"), ("addons", "ccc")]);

        let commits = trigger_commits(&trigger, &dev, &base);
        assert_eq!(commits.get("server").map(String::as_str), Some("aaa"));
        assert_eq!(commits.get("addons").map(String::as_str), Some("ccc"));
        assert!(!commits.contains_key("enterprise"));
    }
}
