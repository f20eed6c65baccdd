//! Group runners
//!
//! A group runner feeds the tests of a [`TestGroup`] to the shared
//! [`JobManager`] and streams each finished test on the returned channel.
//! The channel closes once every member has been reported.
//!
//! [`SimpleRunner`] submits everything at once. [`DependencyRunner`] holds a
//! test back until all of its in-group dependencies have finished `correct`,
//! and skips every test that depends on one that did not.

use crate::errors::Test161Error;
use crate::group::TestGroup;
use crate::manager::{Job, JobManager, JobResult};
use crate::persistence::{Entity, FieldMask, MsgType, PersistenceManager};
use crate::runner::TestRunner;
use crate::test::{Test, TestResult};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread;
use tracing::{debug, info, warn};

/// Runs a group and streams results
pub trait GroupRunner {
    fn run(&self, group: TestGroup) -> Receiver<JobResult>;
}

/// Submits every test immediately
pub struct SimpleRunner {
    manager: Arc<JobManager>,
    runner: Arc<dyn TestRunner>,
}

impl SimpleRunner {
    pub fn new(manager: Arc<JobManager>, runner: Arc<dyn TestRunner>) -> Self {
        Self { manager, runner }
    }
}

impl GroupRunner for SimpleRunner {
    fn run(&self, group: TestGroup) -> Receiver<JobResult> {
        let (tx, rx) = mpsc::channel();
        info!(group = %group.config.name, tests = group.len(), "submitting group");
        for (_, test) in group.tests {
            let job = Job {
                test,
                runner: Arc::clone(&self.runner),
                done: tx.clone(),
            };
            // a rejected job is answered on `tx` by the manager
            if let Err(e) = self.manager.submit(job) {
                debug!(error = %e, "job rejected");
            }
        }
        rx
    }
}

/// Releases tests in dependency order
pub struct DependencyRunner {
    manager: Arc<JobManager>,
    runner: Arc<dyn TestRunner>,
    persistence: Arc<dyn PersistenceManager>,
}

impl DependencyRunner {
    pub fn new(
        manager: Arc<JobManager>,
        runner: Arc<dyn TestRunner>,
        persistence: Arc<dyn PersistenceManager>,
    ) -> Self {
        Self {
            manager,
            runner,
            persistence,
        }
    }
}

impl GroupRunner for DependencyRunner {
    fn run(&self, group: TestGroup) -> Receiver<JobResult> {
        let (out, rx) = mpsc::channel();
        let coordinator = Coordinator {
            manager: Arc::clone(&self.manager),
            runner: Arc::clone(&self.runner),
            persistence: Arc::clone(&self.persistence),
            out,
        };
        thread::spawn(move || coordinator.drive(group));
        rx
    }
}

struct Coordinator {
    manager: Arc<JobManager>,
    runner: Arc<dyn TestRunner>,
    persistence: Arc<dyn PersistenceManager>,
    out: Sender<JobResult>,
}

impl Coordinator {
    fn drive(self, group: TestGroup) {
        info!(group = %group.config.name, tests = group.len(), "running group with dependencies");
        let members: BTreeSet<String> = group.tests.keys().cloned().collect();

        let mut waiting: BTreeMap<String, (Test, BTreeSet<String>)> = group
            .tests
            .into_iter()
            .map(|(id, test)| {
                let deps = test
                    .expanded_deps
                    .iter()
                    .filter(|d| members.contains(*d))
                    .cloned()
                    .collect();
                (id, (test, deps))
            })
            .collect();

        let (done_tx, done_rx) = mpsc::channel::<JobResult>();
        let mut passed: BTreeSet<String> = BTreeSet::new();
        let mut in_flight = 0usize;

        loop {
            let ready: Vec<String> = waiting
                .iter()
                .filter(|(_, (_, deps))| deps.is_subset(&passed))
                .map(|(id, _)| id.clone())
                .collect();
            for id in ready {
                let Some((test, _)) = waiting.remove(&id) else {
                    continue;
                };
                debug!(test = %id, "releasing test");
                in_flight += 1;
                let job = Job {
                    test,
                    runner: Arc::clone(&self.runner),
                    done: done_tx.clone(),
                };
                if let Err(e) = self.manager.submit(job) {
                    debug!(test = %id, error = %e, "job rejected");
                }
            }

            if in_flight == 0 {
                break;
            }
            let Ok(result) = done_rx.recv() else {
                break;
            };
            in_flight -= 1;

            let id = result.test.dependency_id.clone();
            let ok = result.error.is_none() && result.test.result == TestResult::Correct;
            if ok {
                passed.insert(id);
            } else {
                self.skip_dependents(&id, &mut waiting);
            }
            self.send(result);
        }

        // Anything still waiting depends on a test that never passed; with
        // the skips above this only happens for members of a cycle.
        for (id, (mut test, _)) in std::mem::take(&mut waiting) {
            warn!(test = %id, "dependencies never satisfied");
            test.skip("dependencies not satisfied");
            self.complete_skipped(test);
        }
        debug!("group finished");
    }

    /// Skip every waiting test that transitively depends on `failed`.
    fn skip_dependents(
        &self,
        failed: &str,
        waiting: &mut BTreeMap<String, (Test, BTreeSet<String>)>,
    ) {
        let dependents: Vec<String> = waiting
            .iter()
            .filter(|(_, (_, deps))| deps.contains(failed))
            .map(|(id, _)| id.clone())
            .collect();
        for id in dependents {
            if let Some((mut test, _)) = waiting.remove(&id) {
                info!(test = %id, dependency = %failed, "skipping test");
                test.skip(&format!("dependency {} failed", failed));
                self.complete_skipped(test);
            }
        }
    }

    fn complete_skipped(&self, test: Test) {
        if let Err(e) = self.persistence.notify(
            Entity::Test(&test),
            MsgType::Complete,
            FieldMask::STATUS | FieldMask::STATUSES,
        ) {
            warn!(test = %test.dependency_id, error = %e, "persistence notification failed");
        }
        self.send(JobResult { test, error: None });
    }

    fn send(&self, result: JobResult) {
        if self.out.send(result).is_err() {
            debug!("group result receiver dropped");
        }
    }
}

/// Whether a job ended with the manager refusing it
pub fn was_cancelled(result: &JobResult) -> bool {
    matches!(result.error, Some(Test161Error::ManagerStopped))
}
