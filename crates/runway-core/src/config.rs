//! Orchestrator configuration: the `runway.toml` file and step authoring.
//!
//! Steps are written as flat [`StepDefinition`]s and validated into typed
//! [`StepJob`]s. Configs, steps and triggers refer to each other by name;
//! [`OrchestratorConfig::apply`] resolves the names against the store.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;
use std::sync::Arc;

use regex::Regex;
use runway_state::{
    Bundle, Category, CiStore, CommandJob, ConfigId, ConfigStep, CreateBuildJob, JobType,
    NewTrigger, StepId, StepJob, TriggerId, UpgradeDbEntry, UpgradePolicy, VersionId,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::bundles::{BundleRegistry, DEFAULT_BASE_PATTERN};
use crate::error::{Result, RunwayError, ValidationError};
use crate::lineage::VersionCatalog;

/// Default scheduling interval in seconds.
pub const DEFAULT_INTERVAL_SECS: u64 = 60;

// ---------------------------------------------------------------------------
// Step authoring
// ---------------------------------------------------------------------------

/// One `[[steps]]` entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepDefinition {
    pub name: String,
    pub job_type: JobType,
    #[serde(default)]
    pub command: Vec<String>,
    /// Database suffixes the command leaves behind.
    #[serde(default)]
    pub databases: Vec<String>,
    /// Child config names, for `create_build`.
    #[serde(default)]
    pub configs: Vec<String>,
    #[serde(default)]
    pub upgrade_to_current: bool,
    #[serde(default)]
    pub upgrade_to_major_versions: bool,
    #[serde(default)]
    pub upgrade_to_master: bool,
    #[serde(default)]
    pub upgrade_from_previous_major_version: bool,
    #[serde(default)]
    pub upgrade_from_last_intermediate_version: bool,
    #[serde(default)]
    pub upgrade_from_all_intermediate_version: bool,
    #[serde(default)]
    pub upgrade_flat: bool,
    #[serde(default)]
    pub upgrade_config: Option<String>,
    #[serde(default)]
    pub upgrade_dbs: Vec<UpgradeDbDefinition>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpgradeDbDefinition {
    pub config: String,
    pub db_name: String,
    #[serde(default)]
    pub min_target_version: Option<String>,
}

impl StepDefinition {
    fn has_upgrade_fields(&self) -> bool {
        self.upgrade_to_current
            || self.upgrade_to_major_versions
            || self.upgrade_to_master
            || self.upgrade_from_previous_major_version
            || self.upgrade_from_last_intermediate_version
            || self.upgrade_from_all_intermediate_version
            || self.upgrade_flat
            || self.upgrade_config.is_some()
            || !self.upgrade_dbs.is_empty()
    }

    pub fn validate(&self) -> std::result::Result<(), ValidationError> {
        let step = || self.name.clone();
        match self.job_type {
            JobType::ConfigureUpgrade => {
                if self.upgrade_config.is_none() {
                    return Err(ValidationError::MissingUpgradeConfig { step: step() });
                }
                if !(self.upgrade_to_current
                    || self.upgrade_to_major_versions
                    || self.upgrade_to_master)
                {
                    return Err(ValidationError::MissingUpgradeTarget { step: step() });
                }
                if !(self.upgrade_from_previous_major_version
                    || self.upgrade_from_last_intermediate_version
                    || self.upgrade_from_all_intermediate_version)
                {
                    return Err(ValidationError::MissingUpgradeSource { step: step() });
                }
                if self.upgrade_dbs.is_empty() {
                    return Err(ValidationError::MissingUpgradeDbs { step: step() });
                }
                Ok(())
            }
            other if self.has_upgrade_fields() => Err(ValidationError::UpgradeFieldsOnJobType {
                step: step(),
                job_type: other.to_string(),
            }),
            JobType::CreateBuild if self.configs.is_empty() => {
                Err(ValidationError::MissingChildConfigs { step: step() })
            }
            JobType::CreateBuild => Ok(()),
            other if self.command.is_empty() => Err(ValidationError::MissingCommand {
                step: step(),
                job_type: other.to_string(),
            }),
            _ => Ok(()),
        }
    }

    /// Validate and resolve config and version names into a job.
    pub fn to_job(
        &self,
        configs: &HashMap<String, ConfigId>,
        versions: &HashMap<String, VersionId>,
    ) -> std::result::Result<StepJob, ValidationError> {
        self.validate()?;
        let config_id = |name: &str| {
            configs
                .get(name)
                .copied()
                .ok_or_else(|| ValidationError::UnknownReference {
                    kind: "config",
                    name: name.to_string(),
                })
        };
        let command = || CommandJob {
            command: self.command.clone(),
            databases: self.databases.clone(),
        };

        Ok(match self.job_type {
            JobType::Install => StepJob::Install(command()),
            JobType::Run => StepJob::Run(command()),
            JobType::Python => StepJob::Python(command()),
            JobType::Restore => StepJob::Restore(command()),
            JobType::TestUpgrade => StepJob::TestUpgrade(command()),
            JobType::CreateBuild => StepJob::CreateBuild(CreateBuildJob {
                configs: self
                    .configs
                    .iter()
                    .map(|c| config_id(c))
                    .collect::<std::result::Result<_, _>>()?,
            }),
            JobType::ConfigureUpgrade => {
                let mut upgrade_dbs = Vec::with_capacity(self.upgrade_dbs.len());
                for entry in &self.upgrade_dbs {
                    let min_target_version = match &entry.min_target_version {
                        Some(name) => Some(versions.get(name).copied().ok_or_else(|| {
                            ValidationError::UnknownReference {
                                kind: "version",
                                name: name.clone(),
                            }
                        })?),
                        None => None,
                    };
                    upgrade_dbs.push(UpgradeDbEntry {
                        target_config: config_id(&entry.config)?,
                        db_name: entry.db_name.clone(),
                        min_target_version,
                    });
                }
                StepJob::ConfigureUpgrade(UpgradePolicy {
                    upgrade_to_current: self.upgrade_to_current,
                    upgrade_to_major_versions: self.upgrade_to_major_versions,
                    upgrade_to_master: self.upgrade_to_master,
                    upgrade_from_previous_major_version: self.upgrade_from_previous_major_version,
                    upgrade_from_last_intermediate_version: self
                        .upgrade_from_last_intermediate_version,
                    upgrade_from_all_intermediate_version: self
                        .upgrade_from_all_intermediate_version,
                    upgrade_flat: self.upgrade_flat,
                    upgrade_config: self.upgrade_config.as_deref().map(config_id).transpose()?,
                    upgrade_dbs,
                })
            }
        })
    }

    /// Names of the configs this step refers to.
    fn config_refs(&self) -> impl Iterator<Item = &str> {
        self.configs
            .iter()
            .map(String::as_str)
            .chain(self.upgrade_config.as_deref())
            .chain(self.upgrade_dbs.iter().map(|d| d.config.as_str()))
    }
}

/// Job-type changes on stored steps.
pub trait StepAuthoring {
    /// Switch the job type, resetting the payload. A configure-upgrade step
    /// with populated upgrade fields cannot change type; it is left as is.
    fn set_job_type(&mut self, job_type: JobType) -> std::result::Result<(), ValidationError>;
}

impl StepAuthoring for ConfigStep {
    fn set_job_type(&mut self, job_type: JobType) -> std::result::Result<(), ValidationError> {
        if self.job.job_type() == job_type {
            return Ok(());
        }
        if let Some(policy) = self.job.upgrade_policy() {
            if policy.is_populated() {
                return Err(ValidationError::UpgradeStepRetyped {
                    step: self.name.clone(),
                    job_type: job_type.to_string(),
                });
            }
        }
        self.job = empty_job(job_type);
        Ok(())
    }
}

fn empty_job(job_type: JobType) -> StepJob {
    match job_type {
        JobType::Install => StepJob::Install(CommandJob::default()),
        JobType::Run => StepJob::Run(CommandJob::default()),
        JobType::Python => StepJob::Python(CommandJob::default()),
        JobType::Restore => StepJob::Restore(CommandJob::default()),
        JobType::TestUpgrade => StepJob::TestUpgrade(CommandJob::default()),
        JobType::CreateBuild => StepJob::CreateBuild(CreateBuildJob::default()),
        JobType::ConfigureUpgrade => StepJob::ConfigureUpgrade(UpgradePolicy::default()),
    }
}

/// Change the job type of a stored step.
pub async fn retype_step(
    store: &dyn CiStore,
    id: StepId,
    job_type: JobType,
) -> Result<ConfigStep> {
    let mut step = store.get_step(id).await?;
    step.set_job_type(job_type)?;
    store.update_step(step.clone()).await?;
    Ok(step)
}

// ---------------------------------------------------------------------------
// Orchestrator file
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerSection {
    pub project: String,
    pub interval_secs: u64,
    pub base_pattern: String,
}

impl Default for SchedulerSection {
    fn default() -> Self {
        Self {
            project: "default".to_string(),
            interval_secs: DEFAULT_INTERVAL_SECS,
            base_pattern: DEFAULT_BASE_PATTERN.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigDefinition {
    pub name: String,
    #[serde(default)]
    pub steps: Vec<String>,
}

fn default_category() -> Category {
    Category::Default
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerDefinition {
    pub name: String,
    pub config: String,
    #[serde(default = "default_category")]
    pub category: Category,
    #[serde(default)]
    pub repos: Vec<String>,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub upgrade_dumps_trigger: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundleDefinition {
    pub name: String,
    #[serde(default)]
    pub commits: BTreeMap<String, String>,
}

/// Parsed `runway.toml`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    #[serde(default)]
    pub scheduler: SchedulerSection,
    #[serde(default)]
    pub configs: Vec<ConfigDefinition>,
    #[serde(default)]
    pub steps: Vec<StepDefinition>,
    #[serde(default)]
    pub triggers: Vec<TriggerDefinition>,
    #[serde(default)]
    pub bundles: Vec<BundleDefinition>,
}

/// Ids of everything an [`OrchestratorConfig::apply`] touched.
#[derive(Debug, Clone, Default)]
pub struct AppliedConfig {
    pub configs: BTreeMap<String, ConfigId>,
    pub steps: BTreeMap<String, StepId>,
    pub triggers: BTreeMap<String, TriggerId>,
    pub bundles: Vec<Bundle>,
}

impl OrchestratorConfig {
    /// Read and validate a config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| RunwayError::Config(format!("cannot read {}: {e}", path.display())))?;
        let config = Self::from_toml_str(&text).map_err(|e| match e {
            RunwayError::Config(msg) => RunwayError::Config(format!("{}: {msg}", path.display())),
            other => other,
        })?;
        debug!(path = %path.display(), "orchestrator config loaded");
        Ok(config)
    }

    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(text).map_err(|e| RunwayError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check steps and every cross-reference by name.
    pub fn validate(&self) -> Result<()> {
        Regex::new(&self.scheduler.base_pattern).map_err(|e| ValidationError::InvalidPattern {
            pattern: self.scheduler.base_pattern.clone(),
            reason: e.to_string(),
        })?;

        let configs = unique_names("config", self.configs.iter().map(|c| c.name.as_str()))?;
        let steps = unique_names("step", self.steps.iter().map(|s| s.name.as_str()))?;
        let triggers = unique_names("trigger", self.triggers.iter().map(|t| t.name.as_str()))?;
        unique_names("bundle", self.bundles.iter().map(|b| b.name.as_str()))?;

        for step in &self.steps {
            step.validate()?;
            for config in step.config_refs() {
                require(&configs, "config", config)?;
            }
        }
        for config in &self.configs {
            for step in &config.steps {
                require(&steps, "step", step)?;
            }
        }

        let upgrade_steps: BTreeSet<&str> = self
            .steps
            .iter()
            .filter(|s| s.job_type == JobType::ConfigureUpgrade)
            .map(|s| s.name.as_str())
            .collect();
        for trigger in &self.triggers {
            require(&configs, "config", &trigger.config)?;
            if let Some(dumps) = &trigger.upgrade_dumps_trigger {
                require(&triggers, "trigger", dumps)?;
            }
            let upgrades = self
                .configs
                .iter()
                .filter(|c| c.name == trigger.config)
                .flat_map(|c| c.steps.iter())
                .any(|s| upgrade_steps.contains(s.as_str()));
            if upgrades && trigger.upgrade_dumps_trigger.is_none() {
                return Err(ValidationError::MissingDumpsTrigger {
                    trigger: trigger.name.clone(),
                }
                .into());
            }
        }
        Ok(())
    }

    /// Write the configuration into the store. Existing records with the same
    /// names are updated in place; versions named by `min_target_version` and
    /// base bundles are registered on the way.
    pub async fn apply(
        &self,
        store: &Arc<dyn CiStore>,
        catalog: &VersionCatalog,
        registry: &BundleRegistry,
    ) -> Result<AppliedConfig> {
        self.validate()?;
        let project = self.scheduler.project.as_str();
        let mut applied = AppliedConfig::default();

        // Steps first with their stored (or empty) job; jobs refer to configs
        // and are resolved once every config has an id.
        let mut existing_steps: HashMap<String, ConfigStep> = HashMap::new();
        for def in &self.steps {
            let step = match store.find_step(&def.name).await? {
                Some(step) => step,
                None => store.insert_step(&def.name, empty_job(def.job_type)).await?,
            };
            applied.steps.insert(def.name.clone(), step.step_id);
            existing_steps.insert(def.name.clone(), step);
        }

        for def in &self.configs {
            let step_ids: Vec<StepId> = def
                .steps
                .iter()
                .filter_map(|name| applied.steps.get(name).copied())
                .collect();
            let config = match store.find_config(&def.name).await? {
                Some(config) => {
                    if config.steps != step_ids {
                        warn!(config = %def.name, "stored config has different steps; keeping stored order");
                    }
                    config
                }
                None => store.insert_config(&def.name, step_ids).await?,
            };
            applied.configs.insert(def.name.clone(), config.config_id);
        }

        let mut versions: HashMap<String, VersionId> = HashMap::new();
        for name in self
            .steps
            .iter()
            .flat_map(|s| s.upgrade_dbs.iter())
            .filter_map(|d| d.min_target_version.as_deref())
        {
            let version = catalog.get_or_create(name).await?;
            versions.insert(name.to_string(), version.version_id);
        }

        let config_ids: HashMap<String, ConfigId> = applied
            .configs
            .iter()
            .map(|(k, v)| (k.clone(), *v))
            .collect();
        for def in &self.steps {
            let job = def.to_job(&config_ids, &versions)?;
            let Some(mut step) = existing_steps.remove(&def.name) else {
                continue;
            };
            if step.job == job {
                continue;
            }
            step.set_job_type(def.job_type)?;
            step.job = job;
            store.update_step(step).await?;
        }

        // Triggers in two passes: dumps triggers may be declared later.
        for def in &self.triggers {
            let config_id = config_ids.get(&def.config).copied().ok_or_else(|| {
                ValidationError::UnknownReference {
                    kind: "config",
                    name: def.config.clone(),
                }
            })?;
            let trigger = match store.find_trigger(project, &def.name).await? {
                Some(mut trigger) => {
                    trigger.repos = def.repos.clone();
                    trigger.dependencies = def.dependencies.clone();
                    trigger.config_id = config_id;
                    trigger.category = def.category;
                    store.update_trigger(trigger.clone()).await?;
                    trigger
                }
                None => {
                    store
                        .insert_trigger(NewTrigger {
                            project: project.to_string(),
                            name: def.name.clone(),
                            repos: def.repos.clone(),
                            dependencies: def.dependencies.clone(),
                            config_id,
                            category: def.category,
                            upgrade_dumps_trigger: None,
                        })
                        .await?
                }
            };
            applied.triggers.insert(def.name.clone(), trigger.trigger_id);
        }
        for def in &self.triggers {
            let id = applied.triggers[&def.name];
            let dumps = def
                .upgrade_dumps_trigger
                .as_ref()
                .and_then(|name| applied.triggers.get(name).copied());
            let mut trigger = store.get_trigger(id).await?;
            if trigger.upgrade_dumps_trigger != dumps {
                trigger.upgrade_dumps_trigger = dumps;
                store.update_trigger(trigger).await?;
            }
        }

        // Base bundles before the bundles hanging off them.
        let mut bundles: Vec<&BundleDefinition> = self.bundles.iter().collect();
        bundles.sort_by_key(|b| !registry.is_base_name(&b.name));
        for def in bundles {
            let bundle = registry.register(project, &def.name, def.commits.clone()).await?;
            applied.bundles.push(bundle);
        }

        info!(
            project = %project,
            configs = applied.configs.len(),
            steps = applied.steps.len(),
            triggers = applied.triggers.len(),
            bundles = applied.bundles.len(),
            "orchestrator config applied"
        );
        Ok(applied)
    }
}

fn unique_names<'a>(
    kind: &'static str,
    names: impl Iterator<Item = &'a str>,
) -> Result<BTreeSet<&'a str>> {
    let mut seen = BTreeSet::new();
    for name in names {
        if !seen.insert(name) {
            return Err(RunwayError::Config(format!("duplicate {kind} '{name}'")));
        }
    }
    Ok(seen)
}

fn require(names: &BTreeSet<&str>, kind: &'static str, name: &str) -> Result<()> {
    if names.contains(name) {
        Ok(())
    } else {
        Err(ValidationError::UnknownReference {
            kind,
            name: name.to_string(),
        }
        .into())
    }
}
