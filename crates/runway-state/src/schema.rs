//! Record types persisted by the Runway stores.
//!
//! Records reference each other by id only. The one stored edge between
//! builds is parent -> children; everything else (the parent of a build, the
//! lineage of a version) is derived by lookup.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

macro_rules! record_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub u64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

record_id!(
    /// Identifier of a [`Version`].
    VersionId
);
record_id!(
    /// Identifier of a [`Bundle`].
    BundleId
);
record_id!(
    /// Identifier of a [`Trigger`].
    TriggerId
);
record_id!(
    /// Identifier of a [`BuildConfig`].
    ConfigId
);
record_id!(
    /// Identifier of a [`ConfigStep`].
    StepId
);
record_id!(
    /// Identifier of a [`Batch`].
    BatchId
);
record_id!(
    /// Identifier of a [`Build`]. Ids grow monotonically, so a higher id is a
    /// more recent build.
    BuildId
);

// ---------------------------------------------------------------------------
// Versions
// ---------------------------------------------------------------------------

/// Numeric ordering key of a version name.
///
/// `master` is represented by a single `u32::MAX` component so it sorts above
/// every numbered release.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VersionNumber(pub Vec<u32>);

impl VersionNumber {
    pub const MASTER_COMPONENT: u32 = u32::MAX;

    pub fn master() -> Self {
        VersionNumber(vec![Self::MASTER_COMPONENT])
    }

    pub fn is_master(&self) -> bool {
        self.0.first() == Some(&Self::MASTER_COMPONENT)
    }

    /// Leading component, `0` for an empty number.
    pub fn major(&self) -> u32 {
        self.0.first().copied().unwrap_or(0)
    }
}

impl fmt::Display for VersionNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_master() {
            return write!(f, "~");
        }
        let parts: Vec<String> = self.0.iter().map(|c| format!("{c:02}")).collect();
        write!(f, "{}", parts.join("."))
    }
}

/// A product release line. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Version {
    pub version_id: VersionId,
    pub name: String,
    pub number: VersionNumber,
    pub is_major: bool,
    pub created_at: DateTime<Utc>,
}

impl Version {
    pub fn major(&self) -> u32 {
        self.number.major()
    }

    pub fn is_master(&self) -> bool {
        self.number.is_master()
    }

    /// Total order used by the lineage: number first, name as tie-breaker.
    pub fn sort_key(&self) -> (&VersionNumber, &str) {
        (&self.number, self.name.as_str())
    }
}

// ---------------------------------------------------------------------------
// Bundles
// ---------------------------------------------------------------------------

/// A named grouping of branches across repositories.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bundle {
    pub bundle_id: BundleId,
    pub project: String,
    pub name: String,
    pub is_base: bool,
    /// Base bundle this one builds on; `None` for base bundles.
    pub base_id: Option<BundleId>,
    pub version_id: VersionId,
    /// Latest known head per repository (`repo -> sha`).
    pub commits: BTreeMap<String, String>,
}

/// Fields required to register a bundle.
#[derive(Debug, Clone)]
pub struct NewBundle {
    pub project: String,
    pub name: String,
    pub is_base: bool,
    pub base_id: Option<BundleId>,
    pub version_id: VersionId,
    pub commits: BTreeMap<String, String>,
}

// ---------------------------------------------------------------------------
// Triggers, configs and steps
// ---------------------------------------------------------------------------

/// Scheduling category of a trigger and of the batches it produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Default,
    Nightly,
    Weekly,
}

impl Category {
    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Default => "default",
            Category::Nightly => "nightly",
            Category::Weekly => "weekly",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A named build template bound to a project.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trigger {
    pub trigger_id: TriggerId,
    pub project: String,
    pub name: String,
    /// Repositories whose changes this trigger tests.
    pub repos: Vec<String>,
    /// Repositories checked out alongside, without being tested.
    pub dependencies: Vec<String>,
    pub config_id: ConfigId,
    pub category: Category,
    /// Trigger whose completed root builds provide restorable databases.
    pub upgrade_dumps_trigger: Option<TriggerId>,
}

impl Trigger {
    /// Repositories whose commits end up in this trigger's build params.
    pub fn all_repos(&self) -> impl Iterator<Item = &String> {
        self.repos.iter().chain(self.dependencies.iter())
    }
}

/// Fields required to register a trigger.
#[derive(Debug, Clone)]
pub struct NewTrigger {
    pub project: String,
    pub name: String,
    pub repos: Vec<String>,
    pub dependencies: Vec<String>,
    pub config_id: ConfigId,
    pub category: Category,
    pub upgrade_dumps_trigger: Option<TriggerId>,
}

/// An ordered list of steps.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildConfig {
    pub config_id: ConfigId,
    pub name: String,
    pub steps: Vec<StepId>,
}

/// Discriminant of [`StepJob`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    Install,
    Run,
    Python,
    Restore,
    TestUpgrade,
    CreateBuild,
    ConfigureUpgrade,
}

impl JobType {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::Install => "install",
            JobType::Run => "run",
            JobType::Python => "python",
            JobType::Restore => "restore",
            JobType::TestUpgrade => "test_upgrade",
            JobType::CreateBuild => "create_build",
            JobType::ConfigureUpgrade => "configure_upgrade",
        }
    }
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Command handed to the execution host.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandJob {
    #[serde(default)]
    pub command: Vec<String>,
    /// Database suffixes the command leaves behind when it succeeds.
    #[serde(default)]
    pub databases: Vec<String>,
}

/// Creates one child build per listed configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateBuildJob {
    #[serde(default)]
    pub configs: Vec<ConfigId>,
}

/// One database to restore in each generated upgrade build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpgradeDbEntry {
    /// Configuration of the reference descendant holding the dump.
    pub target_config: ConfigId,
    /// Database suffix inside that build.
    pub db_name: String,
    /// Entry only applies to targets at or above this version.
    #[serde(default)]
    pub min_target_version: Option<VersionId>,
}

/// Upgrade-testing policy carried by a configure-upgrade step.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpgradePolicy {
    pub upgrade_to_current: bool,
    pub upgrade_to_major_versions: bool,
    pub upgrade_to_master: bool,
    pub upgrade_from_previous_major_version: bool,
    pub upgrade_from_last_intermediate_version: bool,
    pub upgrade_from_all_intermediate_version: bool,
    pub upgrade_flat: bool,
    /// Configuration given to every generated upgrade build.
    pub upgrade_config: Option<ConfigId>,
    pub upgrade_dbs: Vec<UpgradeDbEntry>,
}

impl UpgradePolicy {
    pub fn has_target(&self) -> bool {
        self.upgrade_to_current || self.upgrade_to_major_versions || self.upgrade_to_master
    }

    pub fn has_source(&self) -> bool {
        self.upgrade_from_previous_major_version
            || self.upgrade_from_last_intermediate_version
            || self.upgrade_from_all_intermediate_version
    }

    /// True when any upgrade-specific field carries a value.
    pub fn is_populated(&self) -> bool {
        self.has_target()
            || self.has_source()
            || self.upgrade_flat
            || self.upgrade_config.is_some()
            || !self.upgrade_dbs.is_empty()
    }
}

/// The job a step performs, one variant per job type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "job_type", rename_all = "snake_case")]
pub enum StepJob {
    Install(CommandJob),
    Run(CommandJob),
    Python(CommandJob),
    Restore(CommandJob),
    TestUpgrade(CommandJob),
    CreateBuild(CreateBuildJob),
    ConfigureUpgrade(UpgradePolicy),
}

impl StepJob {
    pub fn job_type(&self) -> JobType {
        match self {
            StepJob::Install(_) => JobType::Install,
            StepJob::Run(_) => JobType::Run,
            StepJob::Python(_) => JobType::Python,
            StepJob::Restore(_) => JobType::Restore,
            StepJob::TestUpgrade(_) => JobType::TestUpgrade,
            StepJob::CreateBuild(_) => JobType::CreateBuild,
            StepJob::ConfigureUpgrade(_) => JobType::ConfigureUpgrade,
        }
    }

    pub fn upgrade_policy(&self) -> Option<&UpgradePolicy> {
        match self {
            StepJob::ConfigureUpgrade(policy) => Some(policy),
            _ => None,
        }
    }

    pub fn command(&self) -> Option<&CommandJob> {
        match self {
            StepJob::Install(job)
            | StepJob::Run(job)
            | StepJob::Python(job)
            | StepJob::Restore(job)
            | StepJob::TestUpgrade(job) => Some(job),
            StepJob::CreateBuild(_) | StepJob::ConfigureUpgrade(_) => None,
        }
    }

    /// Whether running this job attaches child builds.
    pub fn creates_children(&self) -> bool {
        matches!(self, StepJob::CreateBuild(_) | StepJob::ConfigureUpgrade(_))
    }
}

/// A named, reusable build step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigStep {
    pub step_id: StepId,
    pub name: String,
    pub job: StepJob,
}

// ---------------------------------------------------------------------------
// Builds
// ---------------------------------------------------------------------------

/// Immutable description of one unit of work.
///
/// Identical params describe the same work; [`BuildParams::fingerprint`] is
/// the identity used to avoid creating it twice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildParams {
    pub project: String,
    pub config_id: ConfigId,
    pub version_id: VersionId,
    pub trigger_id: TriggerId,
    #[serde(default)]
    pub commits: BTreeMap<String, String>,
    #[serde(default)]
    pub upgrade_to_build: Option<BuildId>,
    #[serde(default)]
    pub upgrade_from_build: Option<BuildId>,
    #[serde(default)]
    pub dump_build: Option<BuildId>,
    #[serde(default)]
    pub dump_db_name: Option<String>,
    /// Historical root builds consulted while planning this build's children.
    #[serde(default)]
    pub builds_reference_ids: BTreeSet<BuildId>,
}

impl BuildParams {
    pub fn new(
        project: impl Into<String>,
        config_id: ConfigId,
        version_id: VersionId,
        trigger_id: TriggerId,
    ) -> Self {
        Self {
            project: project.into(),
            config_id,
            version_id,
            trigger_id,
            commits: BTreeMap::new(),
            upgrade_to_build: None,
            upgrade_from_build: None,
            dump_build: None,
            dump_db_name: None,
            builds_reference_ids: BTreeSet::new(),
        }
    }

    /// SHA-256 over the canonical JSON form of the params.
    pub fn fingerprint(&self) -> String {
        let json = serde_json::to_vec(self).unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(&json);
        hex::encode(hasher.finalize())
    }
}

/// Lifecycle state of a build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildState {
    Draft,
    Pending,
    Running,
    Done,
    Error,
    Skipped,
}

impl BuildState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BuildState::Draft => "draft",
            BuildState::Pending => "pending",
            BuildState::Running => "running",
            BuildState::Done => "done",
            BuildState::Error => "error",
            BuildState::Skipped => "skipped",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, BuildState::Done | BuildState::Error | BuildState::Skipped)
    }

    /// Legal edges of the build state machine.
    pub fn can_transition_to(&self, next: BuildState) -> bool {
        use BuildState::*;
        matches!(
            (self, next),
            (Draft, Pending)
                | (Draft, Skipped)
                | (Pending, Running)
                | (Pending, Error)
                | (Pending, Skipped)
                | (Running, Done)
                | (Running, Error)
        )
    }
}

impl fmt::Display for BuildState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A schedulable unit of work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Build {
    pub build_id: BuildId,
    pub params: BuildParams,
    pub fingerprint: String,
    pub state: BuildState,
    pub host: Option<String>,
    pub children: Vec<BuildId>,
    /// Child-creating steps that already ran on this build.
    #[serde(default)]
    pub expanded_steps: BTreeSet<StepId>,
    pub diagnostic: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Build {
    /// Destination name, prefix of every database the build produces.
    pub fn dest(&self, version: &Version) -> String {
        format!("{:05}-{}", self.build_id.0, version.name)
    }

    pub fn has_expanded(&self, step: StepId) -> bool {
        self.expanded_steps.contains(&step)
    }
}

/// A requested state change, validated by the store.
#[derive(Debug, Clone)]
pub struct BuildTransition {
    pub to: BuildState,
    pub host: Option<String>,
    pub diagnostic: Option<String>,
}

impl BuildTransition {
    pub fn to(state: BuildState) -> Self {
        Self {
            to: state,
            host: None,
            diagnostic: None,
        }
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    pub fn with_diagnostic(mut self, diagnostic: impl Into<String>) -> Self {
        self.diagnostic = Some(diagnostic.into());
        self
    }
}

/// A database produced by a build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Database {
    pub name: String,
    pub build_id: BuildId,
}

impl Database {
    /// Name without the producing build's `"{dest}-"` prefix.
    pub fn suffix<'a>(&'a self, dest: &str) -> &'a str {
        self.name
            .strip_prefix(dest)
            .and_then(|rest| rest.strip_prefix('-'))
            .unwrap_or(&self.name)
    }
}

// ---------------------------------------------------------------------------
// Batches
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchState {
    Preparing,
    Ready,
    Done,
    Skipped,
}

impl BatchState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchState::Preparing => "preparing",
            BatchState::Ready => "ready",
            BatchState::Done => "done",
            BatchState::Skipped => "skipped",
        }
    }

    pub fn can_transition_to(&self, next: BatchState) -> bool {
        use BatchState::*;
        matches!(
            (self, next),
            (Preparing, Ready) | (Preparing, Skipped) | (Ready, Done) | (Ready, Skipped)
        )
    }
}

impl fmt::Display for BatchState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Binds a trigger of a batch to exactly one build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Slot {
    pub trigger_id: TriggerId,
    pub build_id: BuildId,
}

/// Builds produced for one bundle and category at one scheduling instant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Batch {
    pub batch_id: BatchId,
    pub bundle_id: BundleId,
    pub category: Category,
    pub state: BatchState,
    pub slots: Vec<Slot>,
    pub created_at: DateTime<Utc>,
}

impl Batch {
    pub fn slot_for(&self, trigger: TriggerId) -> Option<&Slot> {
        self.slots.iter().find(|s| s.trigger_id == trigger)
    }

    pub fn build_ids(&self) -> impl Iterator<Item = BuildId> + '_ {
        self.slots.iter().map(|s| s.build_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> BuildParams {
        BuildParams::new("tests", ConfigId(1), VersionId(2), TriggerId(3))
    }

    #[test]
    fn test_version_number_orders_master_last() {
        let v13 = VersionNumber(vec![13, 0]);
        let v133 = VersionNumber(vec![13, 3]);
        let v14 = VersionNumber(vec![14, 0]);
        assert!(v13 < v133);
        assert!(v133 < v14);
        assert!(v14 < VersionNumber::master());
        assert_eq!(VersionNumber::master().to_string(), "~");
        assert_eq!(v133.to_string(), "13.03");
    }

    #[test]
    fn test_fingerprint_is_stable_and_sensitive() {
        let a = params();
        let mut b = params();
        assert_eq!(a.fingerprint(), b.fingerprint());

        b.builds_reference_ids.insert(BuildId(9));
        assert_ne!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn test_fingerprint_ignores_commit_insertion_order() {
        let mut a = params();
        a.commits.insert("server".into(), "aaa".into());
        a.commits.insert("addons".into(), "bbb".into());
        let mut b = params();
        b.commits.insert("addons".into(), "bbb".into());
        b.commits.insert("server".into(), "aaa".into());
        assert_eq!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn test_build_state_edges() {
        assert!(BuildState::Draft.can_transition_to(BuildState::Pending));
        assert!(BuildState::Pending.can_transition_to(BuildState::Running));
        assert!(BuildState::Pending.can_transition_to(BuildState::Error));
        assert!(BuildState::Running.can_transition_to(BuildState::Done));
        assert!(!BuildState::Error.can_transition_to(BuildState::Running));
        assert!(!BuildState::Done.can_transition_to(BuildState::Pending));
        assert!(!BuildState::Running.can_transition_to(BuildState::Skipped));
    }

    #[test]
    fn test_database_suffix_strips_dest() {
        let db = Database {
            name: "00042-13.0-no-demo-all".to_string(),
            build_id: BuildId(42),
        };
        assert_eq!(db.suffix("00042-13.0"), "no-demo-all");
        assert_eq!(db.suffix("00043-13.0"), "00042-13.0-no-demo-all");
    }

    #[test]
    fn test_step_job_serde_uses_job_type_tag() {
        let job = StepJob::ConfigureUpgrade(UpgradePolicy {
            upgrade_to_current: true,
            ..Default::default()
        });
        let json = serde_json::to_value(&job).expect("serialize");
        assert_eq!(json["job_type"], "configure_upgrade");
        assert_eq!(json["upgrade_to_current"], true);
        let back: StepJob = serde_json::from_value(json).expect("deserialize");
        assert_eq!(back, job);
    }

    #[test]
    fn test_policy_population() {
        assert!(!UpgradePolicy::default().is_populated());
        let policy = UpgradePolicy {
            upgrade_dbs: vec![UpgradeDbEntry {
                target_config: ConfigId(1),
                db_name: "all".into(),
                min_target_version: None,
            }],
            ..Default::default()
        };
        assert!(policy.is_populated());
        assert!(!policy.has_target());
    }
}
