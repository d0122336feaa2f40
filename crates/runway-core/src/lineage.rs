//! Version lineage: ordering of product versions and the derived
//! previous-major / intermediate relationships.
//!
//! Relationships are never stored. [`VersionLineage`] is an immutable
//! snapshot computed from the full version list; [`VersionCatalog`] owns the
//! current snapshot and replaces it whenever a version is registered.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use runway_state::{CiStore, StorageError, Version, VersionId, VersionNumber};
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::error::Result;

pub const MASTER: &str = "master";

/// Numeric key of a version name: every character that is not a digit or a
/// dot is dropped and the rest split on dots (`saas-13.1` -> `[13, 1]`).
pub fn parse_version_number(name: &str) -> VersionNumber {
    if name == MASTER {
        return VersionNumber::master();
    }
    let cleaned: String = name
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '.')
        .collect();
    let components: Vec<u32> = cleaned
        .split('.')
        .filter(|part| !part.is_empty())
        .filter_map(|part| part.parse().ok())
        .collect();
    if components.is_empty() {
        VersionNumber(vec![0])
    } else {
        VersionNumber(components)
    }
}

/// `master` and plain `X.Y` names are majors; everything else is an
/// intermediate release.
pub fn is_major_name(name: &str) -> bool {
    if name == MASTER {
        return true;
    }
    match name.split_once('.') {
        Some((major, minor)) => all_digits(major) && all_digits(minor),
        None => false,
    }
}

fn all_digits(part: &str) -> bool {
    !part.is_empty() && part.bytes().all(|b| b.is_ascii_digit())
}

/// Immutable view of every known version and its derived relationships.
#[derive(Debug, Clone, Default)]
pub struct VersionLineage {
    versions: BTreeMap<VersionId, Version>,
    ordered: Vec<VersionId>,
    by_name: HashMap<String, VersionId>,
    previous_major: HashMap<VersionId, VersionId>,
    intermediates: HashMap<VersionId, Vec<VersionId>>,
}

impl VersionLineage {
    pub fn from_versions(versions: impl IntoIterator<Item = Version>) -> Self {
        let versions: BTreeMap<VersionId, Version> =
            versions.into_iter().map(|v| (v.version_id, v)).collect();

        let mut ordered: Vec<&Version> = versions.values().collect();
        ordered.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));

        let mut previous_major = HashMap::new();
        let mut intermediates = HashMap::new();
        for (idx, version) in ordered.iter().enumerate() {
            let previous = ordered[..idx]
                .iter()
                .rev()
                .find(|v| v.is_major && v.number < version.number);
            let Some(previous) = previous else {
                continue;
            };
            previous_major.insert(version.version_id, previous.version_id);
            let between: Vec<VersionId> = ordered
                .iter()
                .filter(|v| !v.is_major && previous.number < v.number && v.number < version.number)
                .map(|v| v.version_id)
                .collect();
            if !between.is_empty() {
                intermediates.insert(version.version_id, between);
            }
        }

        let ordered: Vec<VersionId> = ordered.iter().map(|v| v.version_id).collect();
        let by_name = versions
            .values()
            .map(|v| (v.name.clone(), v.version_id))
            .collect();

        Self {
            versions,
            ordered,
            by_name,
            previous_major,
            intermediates,
        }
    }

    pub fn len(&self) -> usize {
        self.versions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.versions.is_empty()
    }

    pub fn get(&self, id: VersionId) -> Option<&Version> {
        self.versions.get(&id)
    }

    pub fn by_name(&self, name: &str) -> Option<&Version> {
        self.by_name.get(name).and_then(|id| self.versions.get(id))
    }

    /// Nearest strictly older major version.
    pub fn previous_major_version(&self, id: VersionId) -> Option<&Version> {
        self.previous_major.get(&id).and_then(|p| self.versions.get(p))
    }

    /// Non-major versions strictly between the previous major and `id`,
    /// ascending.
    pub fn intermediate_versions(&self, id: VersionId) -> Vec<&Version> {
        self.intermediates
            .get(&id)
            .map(|ids| ids.iter().filter_map(|i| self.versions.get(i)).collect())
            .unwrap_or_default()
    }

    /// All versions, ascending.
    pub fn ordered(&self) -> impl Iterator<Item = &Version> {
        self.ordered.iter().filter_map(|id| self.versions.get(id))
    }

    /// Major versions, ascending.
    pub fn majors(&self) -> impl Iterator<Item = &Version> {
        self.ordered().filter(|v| v.is_major)
    }

    pub fn master(&self) -> Option<&Version> {
        self.majors().find(|v| v.is_master())
    }

    pub fn oldest_major(&self) -> Option<&Version> {
        self.majors().next()
    }
}

/// Registry of versions backed by the store, with a shared lineage snapshot.
pub struct VersionCatalog {
    store: Arc<dyn CiStore>,
    lineage: RwLock<Arc<VersionLineage>>,
}

impl VersionCatalog {
    /// Load every stored version and compute the initial lineage.
    pub async fn load(store: Arc<dyn CiStore>) -> Result<Self> {
        let versions = store.list_versions().await?;
        info!(versions = versions.len(), "version catalog loaded");
        Ok(Self {
            store,
            lineage: RwLock::new(Arc::new(VersionLineage::from_versions(versions))),
        })
    }

    /// Current lineage snapshot. Later registrations do not alter it.
    pub async fn snapshot(&self) -> Arc<VersionLineage> {
        self.lineage.read().await.clone()
    }

    /// Return the version called `name`, registering it on first reference.
    pub async fn get_or_create(&self, name: &str) -> Result<Version> {
        if let Some(version) = self.lineage.read().await.by_name(name) {
            return Ok(version.clone());
        }

        let mut lineage = self.lineage.write().await;
        if let Some(version) = lineage.by_name(name) {
            return Ok(version.clone());
        }

        let number = parse_version_number(name);
        let is_major = is_major_name(name);
        let version = match self
            .store
            .insert_version(name, number.clone(), is_major)
            .await
        {
            Ok(version) => version,
            // Registered by another process since our snapshot was taken.
            Err(StorageError::DuplicateName { .. }) => match self.store.find_version(name).await? {
                Some(version) => version,
                None => {
                    return Err(StorageError::VersionNotFound {
                        version: name.to_string(),
                    }
                    .into())
                }
            },
            Err(err) => return Err(err.into()),
        };
        debug!(version = %version.name, number = %number, is_major, "version registered");

        let mut versions: Vec<Version> = lineage.versions.values().cloned().collect();
        versions.push(version.clone());
        *lineage = Arc::new(VersionLineage::from_versions(versions));
        Ok(version)
    }

    /// Reload the lineage from the store.
    pub async fn refresh(&self) -> Result<Arc<VersionLineage>> {
        let versions = self.store.list_versions().await?;
        let fresh = Arc::new(VersionLineage::from_versions(versions));
        *self.lineage.write().await = fresh.clone();
        Ok(fresh)
    }
}
