//! Build expansion: turn an upgrade matrix (or a list of child configs) into
//! child builds attached to a running parent.
//!
//! Expansion of a given (build, step) happens at most once. It runs under the
//! parent's lock; calling it again returns the children created the first
//! time, and the store rejects a second `mark_expanded` as a backstop.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Arc;

use runway_state::{
    Build, BuildId, BuildParams, BuildState, CiStore, ConfigId, StepId, UpgradePolicy, VersionId,
    VersionNumber,
};
use tracing::{debug, warn};

use crate::error::{Result, ValidationError};
use crate::locks::BuildLocks;
use crate::matrix::UpgradeMatrix;
use crate::metrics::METRICS;
use crate::obs;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// The pair's target is older than the entry's `min_target_version`.
    BelowMinTarget,
    /// The source reference has no descendant built with the entry's config.
    DumpMismatch,
}

/// An `upgrade_dbs` entry that produced no child for one pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedEntry {
    pub pair: String,
    pub db_name: String,
    pub reason: SkipReason,
}

#[derive(Debug, Clone, Default)]
pub struct ExpansionReport {
    pub children: Vec<Build>,
    /// Children actually inserted by this call.
    pub created: usize,
    pub skipped: Vec<SkippedEntry>,
    /// The step had already expanded; `children` are the existing ones.
    pub already_expanded: bool,
}

pub struct ExpansionEngine {
    store: Arc<dyn CiStore>,
    locks: Arc<BuildLocks>,
}

impl ExpansionEngine {
    pub fn new(store: Arc<dyn CiStore>, locks: Arc<BuildLocks>) -> Self {
        Self { store, locks }
    }

    /// Attach one child per (pair, `upgrade_dbs` entry) to `parent`.
    pub async fn expand(
        &self,
        parent: BuildId,
        step: StepId,
        matrix: &UpgradeMatrix,
        policy: &UpgradePolicy,
    ) -> Result<ExpansionReport> {
        let _guard = self.locks.lock(parent).await;
        let parent_build = self.store.get_build(parent).await?;

        let upgrade_config =
            policy
                .upgrade_config
                .ok_or_else(|| ValidationError::MissingUpgradeConfig {
                    step: step.to_string(),
                })?;

        if parent_build.has_expanded(step) {
            debug!(parent = %parent, step = %step, "upgrade step already expanded");
            let children = self
                .store
                .children_of(parent)
                .await?
                .into_iter()
                .filter(|c| {
                    c.params.config_id == upgrade_config && c.params.upgrade_from_build.is_some()
                })
                .collect();
            return Ok(ExpansionReport {
                children,
                already_expanded: true,
                ..Default::default()
            });
        }

        let mut min_targets: HashMap<VersionId, VersionNumber> = HashMap::new();
        for entry in &policy.upgrade_dbs {
            if let Some(min) = entry.min_target_version {
                if !min_targets.contains_key(&min) {
                    let version = self.store.get_version(min).await?;
                    min_targets.insert(min, version.number);
                }
            }
        }

        let mut report = ExpansionReport::default();
        // hop_children[pair][entry]: child created for that entry, used as the
        // dump of the next hop of a chain.
        let mut hop_children: Vec<Vec<Option<BuildId>>> = Vec::with_capacity(matrix.pairs.len());

        for pair in &matrix.pairs {
            let mut created_for_pair = vec![None; policy.upgrade_dbs.len()];

            for (entry_idx, entry) in policy.upgrade_dbs.iter().enumerate() {
                let below_min = entry
                    .min_target_version
                    .and_then(|min| min_targets.get(&min))
                    .is_some_and(|min| pair.to.number < *min);
                if below_min {
                    report.skipped.push(SkippedEntry {
                        pair: pair.label(),
                        db_name: entry.db_name.clone(),
                        reason: SkipReason::BelowMinTarget,
                    });
                    continue;
                }

                let chained_dump = pair
                    .chained_from
                    .and_then(|prev| hop_children.get(prev))
                    .and_then(|children| children[entry_idx]);
                let dump = match chained_dump {
                    Some(dump) => Some(dump),
                    None => self
                        .find_dump(pair.from_build.build_id, entry.target_config)
                        .await?
                        .map(|b| b.build_id),
                };
                let Some(dump) = dump else {
                    obs::emit_dump_mismatch(
                        pair.from_build.build_id,
                        &entry.db_name,
                        &pair.from.name,
                        &pair.to.name,
                    );
                    METRICS.inc_dump_mismatches();
                    report.skipped.push(SkippedEntry {
                        pair: pair.label(),
                        db_name: entry.db_name.clone(),
                        reason: SkipReason::DumpMismatch,
                    });
                    continue;
                };

                let mut params = BuildParams::new(
                    parent_build.params.project.clone(),
                    upgrade_config,
                    pair.to.version_id,
                    parent_build.params.trigger_id,
                );
                params.commits = parent_build.params.commits.clone();
                params.upgrade_to_build = Some(pair.target.build_id(parent));
                params.upgrade_from_build = Some(pair.from_build.build_id);
                params.dump_build = Some(dump);
                params.dump_db_name = Some(entry.db_name.clone());

                let child = self
                    .store
                    .create_build(params, Some(parent), BuildState::Pending)
                    .await?;
                if child.created {
                    report.created += 1;
                }
                created_for_pair[entry_idx] = Some(child.build.build_id);
                report.children.push(child.build);
            }
            hop_children.push(created_for_pair);
        }

        self.store.mark_expanded(parent, step).await?;
        METRICS.add_children_expanded(report.created as u64);
        obs::emit_upgrade_expanded(
            parent,
            matrix.pairs.len(),
            report.created,
            report.skipped.len(),
        );
        Ok(report)
    }

    /// Attach one child per config to `parent`, sharing its version, trigger
    /// and commits.
    pub async fn create_children(
        &self,
        parent: BuildId,
        step: StepId,
        configs: &[ConfigId],
    ) -> Result<ExpansionReport> {
        let _guard = self.locks.lock(parent).await;
        let parent_build = self.store.get_build(parent).await?;

        if parent_build.has_expanded(step) {
            let wanted: BTreeSet<ConfigId> = configs.iter().copied().collect();
            let children = self
                .store
                .children_of(parent)
                .await?
                .into_iter()
                .filter(|c| {
                    wanted.contains(&c.params.config_id) && c.params.upgrade_from_build.is_none()
                })
                .collect();
            return Ok(ExpansionReport {
                children,
                already_expanded: true,
                ..Default::default()
            });
        }

        let mut report = ExpansionReport::default();
        for config in configs {
            let mut params = BuildParams::new(
                parent_build.params.project.clone(),
                *config,
                parent_build.params.version_id,
                parent_build.params.trigger_id,
            );
            params.commits = parent_build.params.commits.clone();
            let child = self
                .store
                .create_build(params, Some(parent), BuildState::Pending)
                .await?;
            if child.created {
                report.created += 1;
            }
            report.children.push(child.build);
        }

        self.store.mark_expanded(parent, step).await?;
        METRICS.add_children_expanded(report.created as u64);
        debug!(parent = %parent, children = report.children.len(), "child builds created");
        Ok(report)
    }

    /// First descendant of `reference` built with `config`, breadth-first.
    pub async fn find_dump(&self, reference: BuildId, config: ConfigId) -> Result<Option<Build>> {
        let mut queue = VecDeque::from([reference]);
        let mut seen = BTreeSet::from([reference]);
        while let Some(id) = queue.pop_front() {
            for child in self.store.children_of(id).await? {
                if !seen.insert(child.build_id) {
                    warn!(build = %child.build_id, "build reachable twice below reference");
                    continue;
                }
                if child.params.config_id == config {
                    return Ok(Some(child));
                }
                queue.push_back(child.build_id);
            }
        }
        Ok(None)
    }
}
