//! Test environment
//!
//! Everything a run needs, loaded once from a test161 directory:
//!
//! ```text
//! test161/
//!   commands/   *.tc command templates
//!   tests/      *.t test documents
//!   targets/    *.tt targets
//!   overlays/   per-target source overlays
//! ```
//!
//! The environment turns run requests into groups, hands them to a group
//! runner and aggregates the results into a [`GroupReport`].

use crate::builder::{BuildConf, BuildTest};
use crate::config::ClientConfig;
use crate::errors::{Result, Test161Error};
use crate::group::{GroupConfig, TestGroup, TestMap};
use crate::group_runner::{DependencyRunner, GroupRunner, SimpleRunner};
use crate::manager::JobManager;
use crate::persistence::{
    Entity, FieldMask, FilePersistence, MsgType, NullPersistence, PersistenceManager,
};
use crate::runner::{RunnerConfig, Sys161Runner, TestRunner};
use crate::target::Target;
use crate::template::TemplateRegistry;
use crate::test::{TestResult, TestStatus};
use rand::rngs::StdRng;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

pub struct TestEnvironment {
    pub test161_dir: PathBuf,
    pub registry: TemplateRegistry,
    pub tests: TestMap,
    pub targets: BTreeMap<String, Target>,
    pub runner_config: RunnerConfig,
    pub persistence: Arc<dyn PersistenceManager>,
    pub manager: Arc<JobManager>,
}

impl TestEnvironment {
    /// Load templates, tests and targets from `test161_dir`.
    pub fn load(
        test161_dir: &Path,
        runner_config: RunnerConfig,
        persistence: Arc<dyn PersistenceManager>,
        manager: Arc<JobManager>,
    ) -> Result<Self> {
        let registry = TemplateRegistry::load_dir(&test161_dir.join("commands"))?;
        let tests = TestMap::load_dir(&test161_dir.join("tests"))?;
        let targets = Target::load_dir(&test161_dir.join("targets"))?;
        info!(
            dir = %test161_dir.display(),
            templates = registry.len(),
            tests = tests.len(),
            targets = targets.len(),
            "loaded test environment"
        );
        Ok(Self {
            test161_dir: test161_dir.to_path_buf(),
            registry,
            tests,
            targets,
            runner_config,
            persistence,
            manager,
        })
    }

    /// Load from a client configuration, starting a job manager sized by
    /// its parallelism.
    pub fn from_config(config: &ClientConfig) -> Result<Self> {
        let persistence: Arc<dyn PersistenceManager> = match &config.persist_dir {
            Some(dir) => Arc::new(FilePersistence::new(dir)?),
            None => Arc::new(NullPersistence),
        };
        let manager = Arc::new(JobManager::new(config.parallelism));
        manager.start();
        Self::load(
            &config.test161dir,
            config.runner_config(),
            persistence,
            manager,
        )
    }

    pub fn runner(&self) -> Arc<dyn TestRunner> {
        Arc::new(Sys161Runner::new(
            self.runner_config.clone(),
            Arc::clone(&self.persistence),
        ))
    }

    /// Build a group from run request names. A name that matches a target
    /// is instantiated as that target unless `force_tags` is set; targets
    /// must be requested alone. Any other name is a test specifier.
    pub fn group_from_names(
        &self,
        names: &[String],
        use_deps: bool,
        force_tags: bool,
        rng: &mut StdRng,
    ) -> Result<TestGroup> {
        if names.is_empty() {
            return Err(Test161Error::ConfigParse("nothing to run".to_string()));
        }

        if !force_tags {
            if let Some(target) = names.iter().find_map(|n| self.targets.get(n)) {
                if names.len() > 1 {
                    return Err(Test161Error::ConfigParse(format!(
                        "target {} must be run alone",
                        target.name
                    )));
                }
                info!(target = %target.name, version = target.version, "running target");
                return target.instance(&self.tests, &self.registry, rng);
            }
        }

        let config = GroupConfig {
            name: names.join(" "),
            use_deps,
            tests: names.to_vec(),
            force_tags,
        };
        TestGroup::build(config, &self.tests, &self.registry, rng)
    }

    /// Run a group to completion and report on it.
    pub fn run_group(&self, mut group: TestGroup) -> GroupReport {
        self.notify_group(&group, MsgType::Create);

        let runner = self.runner();
        let results = if group.config.use_deps {
            DependencyRunner::new(
                Arc::clone(&self.manager),
                runner,
                Arc::clone(&self.persistence),
            )
            .run(group.clone())
        } else {
            SimpleRunner::new(Arc::clone(&self.manager), runner).run(group.clone())
        };

        let mut errors = BTreeMap::new();
        for result in results {
            let id = result.test.dependency_id.clone();
            if let Some(e) = result.error {
                warn!(test = %id, error = %e, "test did not complete");
                errors.insert(id.clone(), e.to_string());
            }
            group.tests.insert(id, result.test);
        }

        self.notify_group(&group, MsgType::Complete);
        GroupReport::new(&group, &errors)
    }

    /// Build the kernel for a target into `root_dir` from `repo`.
    pub fn build(
        &self,
        target: &Target,
        repo: &str,
        commit_ref: &str,
        work_dir: &Path,
        root_dir: &Path,
    ) -> Result<PathBuf> {
        let overlay = (!target.overlay.is_empty())
            .then(|| self.test161_dir.join("overlays").join(&target.overlay));
        let conf = BuildConf {
            repo: repo.to_string(),
            commit_ref: commit_ref.to_string(),
            required_commit: target.required_commit.clone(),
            kconfig: target.kconfig.clone(),
            userland: target.userland,
            overlay,
            src_dir: work_dir.join("src"),
            root_dir: root_dir.to_path_buf(),
        };
        let mut build = BuildTest::new(conf);
        build.run(self.persistence.as_ref())
    }

    fn notify_group(&self, group: &TestGroup, msg: MsgType) {
        if let Err(e) = self
            .persistence
            .notify(Entity::Group(group), msg, FieldMask::STATUS | FieldMask::SCORE)
        {
            warn!(group = %group.config.name, error = %e, "persistence notification failed");
        }
    }
}

/// One line of a group report
#[derive(Debug, Clone, Serialize)]
pub struct ReportRow {
    pub id: String,
    pub name: String,
    pub result: TestResult,
    /// Terminal status label, e.g. `shutdown` or `timeout`
    pub status: String,
    pub message: String,
    pub points_available: u32,
    pub points_earned: u32,
    pub mem_leak_deducted: u32,
}

/// Per-test rows and totals for a finished group
#[derive(Debug, Clone, Serialize)]
pub struct GroupReport {
    pub name: String,
    pub rows: Vec<ReportRow>,
    pub points_available: u32,
    pub points_earned: u32,
    pub correct: usize,
    pub incorrect: usize,
    pub skipped: usize,
    pub aborted: usize,
}

impl GroupReport {
    /// Rows follow the group's id order. `errors` carries infrastructure
    /// failures by test id; they replace the status message.
    pub fn new(group: &TestGroup, errors: &BTreeMap<String, String>) -> Self {
        let (points_available, points_earned) = group.total_points();
        let mut report = Self {
            name: group.config.name.clone(),
            rows: Vec::with_capacity(group.len()),
            points_available,
            points_earned,
            correct: 0,
            incorrect: 0,
            skipped: 0,
            aborted: 0,
        };

        for (id, test) in &group.tests {
            let terminal: Option<&TestStatus> = test.terminal_status();
            let message = match errors.get(id) {
                Some(e) => e.clone(),
                None => terminal.map(|s| s.message.clone()).unwrap_or_default(),
            };
            match test.result {
                TestResult::Correct => report.correct += 1,
                TestResult::Skip => report.skipped += 1,
                TestResult::Abort => report.aborted += 1,
                TestResult::Incorrect | TestResult::None => report.incorrect += 1,
            }
            report.rows.push(ReportRow {
                id: id.clone(),
                name: test.name.clone(),
                result: test.result,
                status: terminal.map_or("none", |s| s.status.as_str()).to_string(),
                message,
                points_available: test.points_available,
                points_earned: test.points_earned,
                mem_leak_deducted: test.mem_leak_deducted,
            });
        }
        report
    }

    pub fn all_correct(&self) -> bool {
        self.correct == self.rows.len()
    }
}
