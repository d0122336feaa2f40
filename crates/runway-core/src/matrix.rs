//! Upgrade matrix generation.
//!
//! From an [`UpgradePolicy`] and the version lineage, compute the
//! `(from, to)` version pairs to test, resolve the reference builds each pair
//! needs and, when the policy is not flat, link consecutive major hops into
//! chains.

use std::collections::{BTreeMap, BTreeSet};

use runway_state::{Build, BuildId, TriggerId, UpgradePolicy, Version, VersionId};

use crate::error::Result;
use crate::lineage::VersionLineage;
use crate::metrics::METRICS;
use crate::obs;
use crate::reference::ReferenceResolver;

/// Build that stands for the target side of an upgrade.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpgradeTarget {
    /// The build being planned (target is the current version).
    Current,
    /// The reference build of the target version.
    Reference(Build),
}

impl UpgradeTarget {
    /// Id of the target build, with `current` standing in for the planning
    /// build.
    pub fn build_id(&self, current: BuildId) -> BuildId {
        match self {
            UpgradeTarget::Current => current,
            UpgradeTarget::Reference(build) => build.build_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpgradePair {
    pub from: Version,
    pub to: Version,
    /// Reference build of `from`; holds the database to upgrade.
    pub from_build: Build,
    pub target: UpgradeTarget,
    /// Index of the previous hop when this pair continues a chain.
    pub chained_from: Option<usize>,
}

impl UpgradePair {
    pub fn label(&self) -> String {
        format!("{} -> {}", self.from.name, self.to.name)
    }
}

/// Ordered upgrade pairs plus the reference builds consulted for them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpgradeMatrix {
    pub pairs: Vec<UpgradePair>,
    pub reference_ids: BTreeSet<BuildId>,
}

impl UpgradeMatrix {
    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }
}

/// A candidate pair before reference resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedPair {
    pub from: Version,
    pub to: Version,
    /// Target selected through `upgrade_to_current`.
    pub to_current: bool,
    /// Source is the target's previous major.
    pub major_hop: bool,
}

/// Version pairs requested by `policy`, deduplicated and ordered by target
/// number then source number. No reference is consulted.
///
/// `master` is the scheduling context's master; `upgrade_to_master` adds no
/// target without one.
pub fn plan_pairs(
    policy: &UpgradePolicy,
    current: &Version,
    master: Option<&Version>,
    lineage: &VersionLineage,
) -> Vec<PlannedPair> {
    let mut targets: BTreeMap<VersionId, (Version, bool)> = BTreeMap::new();
    if policy.upgrade_to_current {
        targets.insert(current.version_id, (current.clone(), true));
    }
    if policy.upgrade_to_major_versions {
        if let Some(oldest) = lineage.oldest_major() {
            for major in lineage.majors().filter(|v| v.number > oldest.number) {
                targets
                    .entry(major.version_id)
                    .or_insert_with(|| (major.clone(), false));
            }
        }
    }
    if policy.upgrade_to_master {
        if let Some(master) = master {
            targets
                .entry(master.version_id)
                .or_insert_with(|| (master.clone(), false));
        }
    }

    let mut pairs: BTreeMap<(VersionId, VersionId), PlannedPair> = BTreeMap::new();
    for (target, to_current) in targets.into_values() {
        let previous = lineage.previous_major_version(target.version_id);
        let intermediates = lineage.intermediate_versions(target.version_id);

        let mut sources: Vec<&Version> = Vec::new();
        if policy.upgrade_from_previous_major_version {
            sources.extend(previous);
        }
        if policy.upgrade_from_all_intermediate_version {
            sources.extend(intermediates.iter().copied());
        } else if policy.upgrade_from_last_intermediate_version {
            sources.extend(intermediates.last().copied());
        }

        for source in sources {
            let major_hop = previous.is_some_and(|p| p.version_id == source.version_id);
            pairs
                .entry((source.version_id, target.version_id))
                .or_insert_with(|| PlannedPair {
                    from: source.clone(),
                    to: target.clone(),
                    to_current,
                    major_hop,
                });
        }
    }

    let mut pairs: Vec<PlannedPair> = pairs.into_values().collect();
    pairs.sort_by(|a, b| {
        a.to.sort_key()
            .cmp(&b.to.sort_key())
            .then_with(|| a.from.sort_key().cmp(&b.from.sort_key()))
    });
    pairs
}

/// Resolves planned pairs against reference builds.
pub struct UpgradeMatrixGenerator<'a> {
    lineage: &'a VersionLineage,
    resolver: &'a dyn ReferenceResolver,
}

impl<'a> UpgradeMatrixGenerator<'a> {
    pub fn new(lineage: &'a VersionLineage, resolver: &'a dyn ReferenceResolver) -> Self {
        Self { lineage, resolver }
    }

    /// Compute the matrix for a build of `current`, taking dumps from
    /// `dumps_trigger`.
    ///
    /// Pairs whose source reference (or, for non-current targets, target
    /// reference) cannot be resolved are dropped; a later cycle picks them up
    /// once the nightly exists.
    pub async fn generate(
        &self,
        policy: &UpgradePolicy,
        current: &Version,
        master: Option<&Version>,
        dumps_trigger: TriggerId,
    ) -> Result<UpgradeMatrix> {
        let planned = plan_pairs(policy, current, master, self.lineage);

        let mut cache: BTreeMap<VersionId, Option<Build>> = BTreeMap::new();
        let mut matrix = UpgradeMatrix::default();
        let mut hop_ends: Vec<Option<VersionId>> = Vec::new();

        for pair in planned {
            let Some(from_build) = self.reference(&mut cache, &pair.from, dumps_trigger).await?
            else {
                continue;
            };
            let target = if pair.to_current {
                UpgradeTarget::Current
            } else {
                match self.reference(&mut cache, &pair.to, dumps_trigger).await? {
                    Some(build) => UpgradeTarget::Reference(build),
                    None => continue,
                }
            };

            matrix.reference_ids.insert(from_build.build_id);
            if let UpgradeTarget::Reference(build) = &target {
                matrix.reference_ids.insert(build.build_id);
            }

            // A hop continues the chain whose last kept hop ends at its source.
            let chains = !policy.upgrade_flat && pair.major_hop;
            let chained_from = if chains {
                hop_ends
                    .iter()
                    .position(|end| *end == Some(pair.from.version_id))
            } else {
                None
            };
            hop_ends.push(chains.then_some(pair.to.version_id));

            matrix.pairs.push(UpgradePair {
                from: pair.from,
                to: pair.to,
                from_build,
                target,
                chained_from,
            });
        }

        Ok(matrix)
    }

    async fn reference(
        &self,
        cache: &mut BTreeMap<VersionId, Option<Build>>,
        version: &Version,
        trigger: TriggerId,
    ) -> Result<Option<Build>> {
        if let Some(found) = cache.get(&version.version_id) {
            return Ok(found.clone());
        }
        let found = self.resolver.resolve(version, trigger).await?;
        if found.is_none() {
            obs::emit_reference_missing(&version.name, trigger);
            METRICS.inc_references_missing();
        }
        cache.insert(version.version_id, found.clone());
        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lineage::{is_major_name, parse_version_number};
    use async_trait::async_trait;
    use chrono::Utc;
    use runway_state::{BuildParams, BuildState, ConfigId};
    use std::collections::BTreeSet as Set;

    const DUMPS: TriggerId = TriggerId(500);

    fn lineage(names: &[&str]) -> VersionLineage {
        VersionLineage::from_versions(names.iter().enumerate().map(|(i, name)| Version {
            version_id: VersionId(i as u64 + 1),
            name: name.to_string(),
            number: parse_version_number(name),
            is_major: is_major_name(name),
            created_at: Utc::now(),
        }))
    }

    /// Resolves a done build for every version listed in `available`.
    struct FakeResolver {
        available: Set<String>,
    }

    #[async_trait]
    impl ReferenceResolver for FakeResolver {
        async fn resolve(&self, version: &Version, trigger: TriggerId) -> Result<Option<Build>> {
            if !self.available.contains(&version.name) {
                return Ok(None);
            }
            let params = BuildParams::new("tests", ConfigId(1), version.version_id, trigger);
            Ok(Some(Build {
                build_id: BuildId(1000 + version.version_id.0),
                fingerprint: params.fingerprint(),
                params,
                state: BuildState::Done,
                host: None,
                children: vec![],
                expanded_steps: Default::default(),
                diagnostic: None,
                created_at: Utc::now(),
                started_at: None,
                finished_at: None,
            }))
        }
    }

    fn resolver(names: &[&str]) -> FakeResolver {
        FakeResolver {
            available: names.iter().map(|n| n.to_string()).collect(),
        }
    }

    fn labels(matrix: &UpgradeMatrix) -> Vec<String> {
        matrix.pairs.iter().map(UpgradePair::label).collect()
    }

    const ALL: &[&str] = &[
        "11.0",
        "saas-11.3",
        "12.0",
        "saas-12.3",
        "13.0",
        "saas-13.1",
        "saas-13.2",
        "saas-13.3",
        "master",
    ];

    #[test]
    fn test_last_intermediate_is_superseded_by_all() {
        let l = lineage(ALL);
        let master = l.by_name("master").unwrap();
        let policy = UpgradePolicy {
            upgrade_to_current: true,
            upgrade_from_previous_major_version: true,
            upgrade_from_last_intermediate_version: true,
            upgrade_from_all_intermediate_version: true,
            ..Default::default()
        };
        let pairs = plan_pairs(&policy, master, l.master(), &l);
        let sources: Vec<&str> = pairs.iter().map(|p| p.from.name.as_str()).collect();
        assert_eq!(sources, vec!["13.0", "saas-13.1", "saas-13.2", "saas-13.3"]);
        assert!(pairs.iter().all(|p| p.to_current));
    }

    #[tokio::test]
    async fn test_to_current_uses_planning_build() {
        let l = lineage(ALL);
        let master = l.by_name("master").unwrap();
        let policy = UpgradePolicy {
            upgrade_to_current: true,
            upgrade_from_previous_major_version: true,
            upgrade_from_last_intermediate_version: true,
            upgrade_flat: true,
            ..Default::default()
        };
        let r = resolver(&["13.0", "saas-13.1", "saas-13.2", "saas-13.3"]);
        let matrix = UpgradeMatrixGenerator::new(&l, &r)
            .generate(&policy, master, l.master(), DUMPS)
            .await
            .unwrap();

        assert_eq!(labels(&matrix), vec!["13.0 -> master", "saas-13.3 -> master"]);
        assert!(matrix
            .pairs
            .iter()
            .all(|p| p.target == UpgradeTarget::Current));
        let expected: Set<BuildId> = ["13.0", "saas-13.3"]
            .iter()
            .map(|n| BuildId(1000 + l.by_name(n).unwrap().version_id.0))
            .collect();
        assert_eq!(matrix.reference_ids, expected);
    }

    #[tokio::test]
    async fn test_missing_target_reference_drops_pair() {
        let l = lineage(ALL);
        let master = l.by_name("master").unwrap();
        let policy = UpgradePolicy {
            upgrade_to_major_versions: true,
            upgrade_from_previous_major_version: true,
            upgrade_flat: true,
            ..Default::default()
        };
        // No master nightly: 13.0 -> master cannot be resolved.
        let r = resolver(&["11.0", "12.0", "13.0"]);
        let matrix = UpgradeMatrixGenerator::new(&l, &r)
            .generate(&policy, master, l.master(), DUMPS)
            .await
            .unwrap();

        assert_eq!(labels(&matrix), vec!["11.0 -> 12.0", "12.0 -> 13.0"]);
        assert!(matrix.pairs.iter().all(|p| p.chained_from.is_none()));
        assert_eq!(matrix.reference_ids.len(), 3);
    }

    #[tokio::test]
    async fn test_chains_follow_consecutive_major_hops() {
        let l = lineage(ALL);
        let master = l.by_name("master").unwrap();
        let policy = UpgradePolicy {
            upgrade_to_master: true,
            upgrade_to_major_versions: true,
            upgrade_from_previous_major_version: true,
            upgrade_from_last_intermediate_version: true,
            upgrade_flat: false,
            ..Default::default()
        };
        let r = resolver(ALL);
        let matrix = UpgradeMatrixGenerator::new(&l, &r)
            .generate(&policy, master, l.master(), DUMPS)
            .await
            .unwrap();

        assert_eq!(
            labels(&matrix),
            vec![
                "11.0 -> 12.0",
                "saas-11.3 -> 12.0",
                "12.0 -> 13.0",
                "saas-12.3 -> 13.0",
                "13.0 -> master",
                "saas-13.3 -> master",
            ]
        );
        let links: Vec<Option<usize>> = matrix.pairs.iter().map(|p| p.chained_from).collect();
        assert_eq!(links, vec![None, None, Some(0), None, Some(2), None]);
    }

    #[test]
    fn test_to_master_needs_explicit_master() {
        let l = lineage(ALL);
        let current = l.by_name("13.0").unwrap();
        let policy = UpgradePolicy {
            upgrade_to_master: true,
            upgrade_from_previous_major_version: true,
            ..Default::default()
        };

        assert!(plan_pairs(&policy, current, None, &l).is_empty());
        let pairs = plan_pairs(&policy, current, l.master(), &l);
        assert_eq!(pairs.len(), 1);
        assert_eq!(pairs[0].to.name, "master");
        assert_eq!(pairs[0].from.name, "13.0");
        assert!(!pairs[0].to_current);
    }

    #[tokio::test]
    async fn test_missing_hop_splits_chain() {
        let l = lineage(&["11.0", "12.0", "13.0", "14.0", "master"]);
        let master = l.by_name("master").unwrap();
        let policy = UpgradePolicy {
            upgrade_to_major_versions: true,
            upgrade_from_previous_major_version: true,
            upgrade_flat: false,
            ..Default::default()
        };
        // 12.0 has no nightly: both 11->12 and 12->13 are dropped.
        let r = resolver(&["11.0", "13.0", "14.0", "master"]);
        let matrix = UpgradeMatrixGenerator::new(&l, &r)
            .generate(&policy, master, l.master(), DUMPS)
            .await
            .unwrap();

        assert_eq!(labels(&matrix), vec!["13.0 -> 14.0", "14.0 -> master"]);
        assert_eq!(matrix.pairs[0].chained_from, None);
        assert_eq!(matrix.pairs[1].chained_from, Some(0));
    }
}
