//! Upgrade planning and expansion over a realistic nightly history.
//!
//! Every version gets a nightly batch with a server and an addons trigger.
//! Each nightly root creates a "Nightly generate" child which in turn creates
//! the "Demo" and "No demo" builds holding the restorable databases.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use runway_core::{
    retype_step, AppliedConfig, BuildRunner, ExecutionHost, OrchestratorConfig, RunOutcome,
    Runway, RunwayError, StepRequest, ValidationError, DEFAULT_BASE_PATTERN,
};
use runway_state::{
    Build, BuildId, BuildState, Bundle, Category, CiStore, JobType, MemoryStore, StepJob,
    TriggerId, Version,
};

const PROJECT: &str = "tests";
const HOST: &str = "test-host";

const FIXTURE: &str = r#"
[scheduler]
project = "tests"

[[configs]]
name = "Nightly config"
steps = ["generate"]

[[configs]]
name = "Nightly generate"
steps = ["create_dumps"]

[[configs]]
name = "Demo"
steps = ["install_all"]

[[configs]]
name = "No demo"
steps = ["install_no_demo"]

[[configs]]
name = "Upgrade server"
steps = ["restore", "test_upgrade"]

[[configs]]
name = "Server upgrade"
steps = ["upgrade_server"]

[[configs]]
name = "Upgrade"
steps = ["upgrade"]

[[configs]]
name = "Upgrade nightly"
steps = ["upgrade_nightly"]

[[steps]]
name = "generate"
job_type = "create_build"
configs = ["Nightly generate"]

[[steps]]
name = "create_dumps"
job_type = "create_build"
configs = ["Demo", "No demo"]

[[steps]]
name = "install_all"
job_type = "install"
command = ["server", "install", "--demo"]
databases = ["all"]

[[steps]]
name = "install_no_demo"
job_type = "install"
command = ["server", "install", "--without-demo"]
databases = ["no-demo-all"]

[[steps]]
name = "restore"
job_type = "restore"
command = ["server", "restore"]

[[steps]]
name = "test_upgrade"
job_type = "test_upgrade"
command = ["server", "upgrade"]

[[steps]]
name = "upgrade_server"
job_type = "configure_upgrade"
upgrade_to_current = true
upgrade_from_previous_major_version = true
upgrade_from_last_intermediate_version = true
upgrade_flat = true
upgrade_config = "Upgrade server"
upgrade_dbs = [
    { config = "Demo", db_name = "all", min_target_version = "master" },
    { config = "No demo", db_name = "no-demo-all" },
]

[[steps]]
name = "upgrade"
job_type = "configure_upgrade"
upgrade_to_major_versions = true
upgrade_from_previous_major_version = true
upgrade_flat = true
upgrade_config = "Upgrade server"
upgrade_dbs = [
    { config = "Demo", db_name = "all", min_target_version = "master" },
    { config = "No demo", db_name = "no-demo-all" },
]

[[steps]]
name = "upgrade_nightly"
job_type = "configure_upgrade"
upgrade_to_master = true
upgrade_to_major_versions = true
upgrade_from_previous_major_version = true
upgrade_from_all_intermediate_version = true
upgrade_flat = false
upgrade_config = "Upgrade server"
upgrade_dbs = [{ config = "No demo", db_name = "no-demo-all" }]

[[triggers]]
name = "Nightly server"
config = "Nightly config"
category = "nightly"
dependencies = ["server"]

[[triggers]]
name = "Nightly addons"
config = "Nightly config"
category = "nightly"
dependencies = ["server", "addons"]

[[triggers]]
name = "Server upgrade"
config = "Server upgrade"
repos = ["upgrade", "server"]
upgrade_dumps_trigger = "Nightly server"

[[triggers]]
name = "Upgrade"
config = "Upgrade"
repos = ["upgrade"]
upgrade_dumps_trigger = "Nightly addons"

[[triggers]]
name = "Nightly upgrade"
config = "Upgrade nightly"
category = "weekly"
dependencies = ["upgrade"]
upgrade_dumps_trigger = "Nightly addons"

[[bundles]]
name = "master"
commits = { server = "server-master", addons = "addons-master", upgrade = "123abc789" }
"#;

/// Host that accepts every command and remembers what it was asked to run.
#[derive(Default)]
struct RecordingHost {
    requests: Mutex<Vec<(BuildId, String, Option<String>)>>,
}

impl RecordingHost {
    fn restores_of(&self, build: BuildId) -> Vec<String> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|(id, _, _)| *id == build)
            .filter_map(|(_, _, restore)| restore.clone())
            .collect()
    }
}

#[async_trait]
impl ExecutionHost for RecordingHost {
    fn name(&self) -> &str {
        HOST
    }

    async fn run_step(&self, request: &StepRequest<'_>) -> Result<(), String> {
        self.requests.lock().unwrap().push((
            request.build.build_id,
            request.step.name.clone(),
            request.restore_db.clone(),
        ));
        Ok(())
    }
}

struct Harness {
    runway: Runway,
    runner: BuildRunner,
    host: Arc<RecordingHost>,
    applied: AppliedConfig,
}

/// Builds of one nightly slot.
#[derive(Debug, Clone)]
struct NightlyBuilds {
    root: Build,
    demo: Build,
    no_demo: Build,
}

impl Harness {
    async fn new() -> Self {
        let store: Arc<dyn CiStore> = Arc::new(MemoryStore::new());
        let runway = Runway::new(store, DEFAULT_BASE_PATTERN).await.unwrap();
        let config = OrchestratorConfig::from_toml_str(FIXTURE).unwrap();
        let applied = runway.apply(&config).await.unwrap();
        let host = Arc::new(RecordingHost::default());
        let runner = runway.runner(host.clone());
        Self {
            runway,
            runner,
            host,
            applied,
        }
    }

    fn trigger(&self, name: &str) -> TriggerId {
        self.applied.triggers[name]
    }

    fn store(&self) -> &Arc<dyn CiStore> {
        &self.runway.store
    }

    async fn master_bundle(&self) -> Bundle {
        self.store()
            .find_bundle(PROJECT, "master")
            .await
            .unwrap()
            .unwrap()
    }

    async fn version(&self, name: &str) -> Version {
        self.store().find_version(name).await.unwrap().unwrap()
    }

    /// Register a base bundle and run its nightly batch to completion.
    async fn create_version(&self, name: &str) -> HashMap<TriggerId, NightlyBuilds> {
        let digits: String = name.chars().filter(|c| c.is_ascii_digit()).collect();
        let commits = BTreeMap::from([
            ("server".to_string(), format!("server{digits}")),
            ("addons".to_string(), format!("addons{digits}")),
        ]);
        let bundle = self
            .runway
            .registry
            .register(PROJECT, name, commits)
            .await
            .unwrap();
        assert!(bundle.is_base);

        let prepared = self
            .runway
            .scheduler
            .force(bundle.bundle_id, Category::Nightly)
            .await
            .unwrap();
        assert_eq!(prepared.batch.slots.len(), 2);
        self.runner.drain().await.unwrap();
        let completed = self.runway.scheduler.refresh_batches().await.unwrap();
        assert!(completed.contains(&prepared.batch.batch_id));

        let mut builds = HashMap::new();
        for slot in &prepared.batch.slots {
            let root = self.store().get_build(slot.build_id).await.unwrap();
            assert_eq!(root.state, BuildState::Done);
            let generate = self.store().children_of(root.build_id).await.unwrap();
            let dumps = self
                .store()
                .children_of(generate[0].build_id)
                .await
                .unwrap();
            builds.insert(
                slot.trigger_id,
                NightlyBuilds {
                    root,
                    demo: dumps[0].clone(),
                    no_demo: dumps[1].clone(),
                },
            );
        }
        builds
    }

    async fn create_versions(
        &self,
        names: &[&str],
    ) -> HashMap<String, HashMap<TriggerId, NightlyBuilds>> {
        let mut all = HashMap::new();
        for name in names {
            all.insert(name.to_string(), self.create_version(name).await);
        }
        all
    }

    /// Root build of `trigger` in a fresh batch of the master bundle.
    async fn force_master(&self, category: Category, trigger: TriggerId) -> Build {
        let master = self.master_bundle().await;
        let prepared = self
            .runway
            .scheduler
            .force(master.bundle_id, category)
            .await
            .unwrap();
        let slot = prepared.batch.slot_for(trigger).unwrap();
        self.store().get_build(slot.build_id).await.unwrap()
    }
}

const ALL_VERSIONS: &[&str] = &[
    "11.0",
    "saas-11.3",
    "12.0",
    "saas-12.3",
    "13.0",
    "saas-13.1",
    "saas-13.2",
    "saas-13.3",
];

fn names(versions: Vec<&Version>) -> Vec<String> {
    versions.into_iter().map(|v| v.name.clone()).collect()
}

fn roots(
    nightlies: &HashMap<String, HashMap<TriggerId, NightlyBuilds>>,
    trigger: TriggerId,
    versions: &[&str],
) -> BTreeSet<BuildId> {
    versions
        .iter()
        .map(|v| nightlies[*v][&trigger].root.build_id)
        .collect()
}

#[tokio::test]
async fn test_version_relations() {
    let h = Harness::new().await;
    for name in [
        "11.0",
        "saas-11.3",
        "12.0",
        "saas-12.2",
        "saas-12.4",
        "13.0",
        "saas-13.1",
        "saas-13.2",
        "saas-13.3",
        "master",
    ] {
        h.runway.catalog.get_or_create(name).await.unwrap();
    }
    let lineage = h.runway.catalog.snapshot().await;
    let id = |name: &str| lineage.by_name(name).unwrap().version_id;

    assert!(lineage.previous_major_version(id("11.0")).is_none());
    assert!(lineage.intermediate_versions(id("11.0")).is_empty());
    assert_eq!(
        lineage.previous_major_version(id("saas-11.3")).unwrap().name,
        "11.0"
    );
    assert_eq!(
        names(lineage.intermediate_versions(id("12.0"))),
        vec!["saas-11.3"]
    );
    assert_eq!(
        names(lineage.intermediate_versions(id("13.0"))),
        vec!["saas-12.2", "saas-12.4"]
    );
    assert_eq!(
        names(lineage.intermediate_versions(id("saas-13.2"))),
        vec!["saas-13.1"]
    );
    assert_eq!(
        lineage.previous_major_version(id("master")).unwrap().name,
        "13.0"
    );
    assert_eq!(
        names(lineage.intermediate_versions(id("master"))),
        vec!["saas-13.1", "saas-13.2", "saas-13.3"]
    );

    for version in lineage.ordered() {
        if let Some(previous) = lineage.previous_major_version(version.version_id) {
            assert!(previous.number < version.number);
            for between in lineage.intermediate_versions(version.version_id) {
                assert!(previous.number < between.number && between.number < version.number);
                assert!(!between.is_major);
            }
        }
    }
}

#[tokio::test]
async fn test_reference_ids_follow_intermediate_policy() {
    let h = Harness::new().await;
    let nightlies = h
        .create_versions(&["13.0", "saas-13.1", "saas-13.2", "saas-13.3"])
        .await;
    let server_nightly = h.trigger("Nightly server");
    let server_upgrade = h.trigger("Server upgrade");

    let build = h.force_master(Category::Default, server_upgrade).await;
    assert_eq!(
        build.params.config_id,
        h.applied.configs["Server upgrade"]
    );
    assert_eq!(
        build.params.builds_reference_ids,
        roots(&nightlies, server_nightly, &["13.0", "saas-13.3"])
    );

    let step_id = h.applied.steps["upgrade_server"];
    let mut step = h.store().get_step(step_id).await.unwrap();
    let StepJob::ConfigureUpgrade(policy) = &mut step.job else {
        panic!("upgrade_server is a configure_upgrade step");
    };
    policy.upgrade_from_all_intermediate_version = true;
    h.store().update_step(step).await.unwrap();

    let build = h.force_master(Category::Default, server_upgrade).await;
    assert_eq!(
        build.params.builds_reference_ids,
        roots(
            &nightlies,
            server_nightly,
            &["13.0", "saas-13.1", "saas-13.2", "saas-13.3"]
        )
    );
}

#[tokio::test]
async fn test_upgrade_to_current_and_to_major_versions() {
    let h = Harness::new().await;
    let nightlies = h.create_versions(ALL_VERSIONS).await;
    let server_nightly = h.trigger("Nightly server");
    let addons_nightly = h.trigger("Nightly addons");

    // Upgrades towards the build being tested.
    let upgrade_current = h
        .force_master(Category::Default, h.trigger("Server upgrade"))
        .await;
    let outcome = h.runner.execute(upgrade_current.build_id).await.unwrap();
    let RunOutcome::Done(done) = outcome else {
        panic!("configure_upgrade build should finish: {outcome:?}");
    };
    assert_eq!(done.state, BuildState::Done);

    let children = h.store().children_of(done.build_id).await.unwrap();
    assert_eq!(children.len(), 4);
    assert!(children.iter().all(|c| c.state == BuildState::Pending));

    let n13 = &nightlies["13.0"][&server_nightly];
    let n133 = &nightlies["saas-13.3"][&server_nightly];
    let expected = [
        (n13, &n13.demo, "all"),
        (n13, &n13.no_demo, "no-demo-all"),
        (n133, &n133.demo, "all"),
        (n133, &n133.no_demo, "no-demo-all"),
    ];
    let master = h.version("master").await;
    for (child, (from, dump, db_name)) in children.iter().zip(expected) {
        assert_eq!(child.params.upgrade_to_build, Some(done.build_id));
        assert_eq!(child.params.upgrade_from_build, Some(from.root.build_id));
        assert_eq!(child.params.dump_build, Some(dump.build_id));
        assert_eq!(child.params.dump_db_name.as_deref(), Some(db_name));
        assert_eq!(child.params.version_id, master.version_id);
        assert_eq!(child.params.config_id, h.applied.configs["Upgrade server"]);
    }

    // Upgrades between consecutive majors; master has no addons nightly.
    let upgrade_majors = h
        .force_master(Category::Default, h.trigger("Upgrade"))
        .await;
    let RunOutcome::Done(done) = h.runner.execute(upgrade_majors.build_id).await.unwrap() else {
        panic!("configure_upgrade build should finish");
    };
    let children = h.store().children_of(done.build_id).await.unwrap();
    assert_eq!(children.len(), 2);

    let [b11_12, b12_13] = [&children[0], &children[1]];
    let n11 = &nightlies["11.0"][&addons_nightly];
    let n12 = &nightlies["12.0"][&addons_nightly];
    let n13 = &nightlies["13.0"][&addons_nightly];

    assert_eq!(b11_12.params.upgrade_to_build, Some(n12.root.build_id));
    assert_eq!(b11_12.params.upgrade_from_build, Some(n11.root.build_id));
    assert_eq!(b11_12.params.dump_build, Some(n11.no_demo.build_id));
    assert_eq!(b11_12.params.dump_db_name.as_deref(), Some("no-demo-all"));

    assert_eq!(b12_13.params.upgrade_to_build, Some(n13.root.build_id));
    assert_eq!(b12_13.params.upgrade_from_build, Some(n12.root.build_id));
    assert_eq!(b12_13.params.dump_build, Some(n12.no_demo.build_id));
    assert_eq!(b12_13.params.dump_db_name.as_deref(), Some("no-demo-all"));
}

#[tokio::test]
async fn test_children_restore_the_dump_database() {
    let h = Harness::new().await;
    let nightlies = h.create_versions(&["13.0", "saas-13.3"]).await;
    let server_nightly = h.trigger("Nightly server");

    let parent = h
        .force_master(Category::Default, h.trigger("Server upgrade"))
        .await;
    h.runner.execute(parent.build_id).await.unwrap();
    let children = h.store().children_of(parent.build_id).await.unwrap();
    let first = &children[0];
    assert!(matches!(
        h.runner.execute(first.build_id).await.unwrap(),
        RunOutcome::Done(_)
    ));

    let dump = &nightlies["13.0"][&server_nightly].demo;
    let v13 = h.version("13.0").await;
    let expected = format!("{}-all", dump.dest(&v13));
    assert_eq!(
        h.host.restores_of(first.build_id),
        vec![expected.clone(), expected.clone()]
    );

    let databases = h.store().databases_of(dump.build_id).await.unwrap();
    assert!(databases.iter().any(|d| d.name == expected));
    assert_eq!(databases[0].suffix(&dump.dest(&v13)), "all");
}

#[tokio::test]
async fn test_expansion_is_idempotent() {
    let h = Harness::new().await;
    h.create_versions(&["13.0", "saas-13.3"]).await;

    let parent = h
        .force_master(Category::Default, h.trigger("Server upgrade"))
        .await;
    h.runner.execute(parent.build_id).await.unwrap();
    let before = h.store().children_of(parent.build_id).await.unwrap();
    assert_eq!(before.len(), 4);

    // Expanding the same step again returns the same children.
    let step = h.store().get_step(h.applied.steps["upgrade_server"]).await.unwrap();
    let StepJob::ConfigureUpgrade(policy) = &step.job else {
        panic!("upgrade_server is a configure_upgrade step");
    };
    let matrix = runway_core::UpgradeMatrix::default();
    let report = h
        .runway
        .engine
        .expand(parent.build_id, step.step_id, &matrix, policy)
        .await
        .unwrap();
    assert!(report.already_expanded);
    assert_eq!(report.created, 0);
    assert_eq!(report.children, before);
    assert_eq!(h.store().children_of(parent.build_id).await.unwrap(), before);
}

#[tokio::test]
async fn test_scheduling_twice_reuses_builds() {
    let h = Harness::new().await;
    h.create_versions(&["13.0", "saas-13.3"]).await;
    let master = h.master_bundle().await;

    let first = h
        .runway
        .scheduler
        .prepare_batch(master.bundle_id, Category::Default)
        .await
        .unwrap();
    assert!(first.fresh);
    assert_eq!(first.created, 2);

    let again = h
        .runway
        .scheduler
        .prepare_batch(master.bundle_id, Category::Default)
        .await
        .unwrap();
    assert!(!again.fresh);
    assert_eq!(again.batch.batch_id, first.batch.batch_id);
    assert_eq!(again.created, 0);
    let ids: Vec<BuildId> = again.batch.build_ids().collect();
    assert_eq!(ids, first.batch.build_ids().collect::<Vec<_>>());
}

#[tokio::test]
async fn test_retyping_upgrade_step_is_rejected() {
    let h = Harness::new().await;
    let id = h.applied.steps["upgrade_server"];
    let before = h.store().get_step(id).await.unwrap();

    let err = retype_step(h.store().as_ref(), id, JobType::Install)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        RunwayError::Validation(ValidationError::UpgradeStepRetyped { .. })
    ));
    assert_eq!(h.store().get_step(id).await.unwrap(), before);
}

#[tokio::test]
async fn test_nightly_upgrades_chain_major_hops() {
    let h = Harness::new().await;
    let nightlies = h.create_versions(ALL_VERSIONS).await;
    let addons_nightly = h.trigger("Nightly addons");

    let parent = h
        .force_master(Category::Weekly, h.trigger("Nightly upgrade"))
        .await;
    h.runner.execute(parent.build_id).await.unwrap();
    let children = h.store().children_of(parent.build_id).await.unwrap();

    // 11.0 -> 12.0, saas-11.3 -> 12.0, 12.0 -> 13.0, saas-12.3 -> 13.0; no
    // hop reaches master without a master nightly.
    let from: Vec<Option<BuildId>> = children
        .iter()
        .map(|c| c.params.upgrade_from_build)
        .collect();
    let root = |v: &str| Some(nightlies[v][&addons_nightly].root.build_id);
    assert_eq!(
        from,
        vec![root("11.0"), root("saas-11.3"), root("12.0"), root("saas-12.3")]
    );

    let hop_11_12 = &children[0];
    let hop_12_13 = &children[2];
    assert_eq!(
        hop_11_12.params.dump_build,
        Some(nightlies["11.0"][&addons_nightly].no_demo.build_id)
    );
    assert_eq!(hop_12_13.params.dump_build, Some(hop_11_12.build_id));
    assert_eq!(
        children[3].params.dump_build,
        Some(nightlies["saas-12.3"][&addons_nightly].no_demo.build_id)
    );

    // The second hop waits for the first one, then restores its database.
    assert!(h.runner.execute(hop_12_13.build_id).await.unwrap().is_waiting());
    let outcomes = h.runner.drain().await.unwrap();
    assert!(outcomes.iter().all(|o| matches!(o, RunOutcome::Done(_))));

    let v12 = h.version("12.0").await;
    let upgraded = format!("{}-no-demo-all", hop_11_12.dest(&v12));
    assert!(h
        .store()
        .databases_of(hop_11_12.build_id)
        .await
        .unwrap()
        .iter()
        .any(|d| d.name == upgraded));
    assert!(h.host.restores_of(hop_12_13.build_id).contains(&upgraded));

    let completed = h.runway.scheduler.refresh_batches().await.unwrap();
    assert!(!completed.is_empty());
}
