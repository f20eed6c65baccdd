//! Bounded job scheduling
//!
//! The job manager is the single admission point for test runs. Jobs arrive
//! on a submit channel; a dispatcher thread hands each one to a worker that
//! waits until fewer than `capacity` jobs are running (0 = unlimited), runs
//! the test, and delivers the result on the job's own channel.
//!
//! The manager is an explicit object with `start`/`stop`; callers share it
//! through an `Arc`.

use crate::errors::{Result, Test161Error};
use crate::runner::TestRunner;
use crate::test::Test;
use serde::{Deserialize, Serialize};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use tracing::{debug, info, warn};

/// Scheduler counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManagerStats {
    /// Jobs currently executing
    pub running: usize,

    /// Jobs waiting for a slot
    pub queued: usize,

    /// Most jobs ever executing at once
    pub high_watermark_running: usize,

    /// Most jobs ever waiting at once
    pub high_watermark_queued: usize,

    /// Jobs that have returned
    pub finished: usize,
}

/// Outcome of one job
#[derive(Debug)]
pub struct JobResult {
    pub test: Test,
    pub error: Option<Test161Error>,
}

/// A unit of work: a test, the runner that executes it, and where to send
/// the result.
pub struct Job {
    pub test: Test,
    pub runner: Arc<dyn TestRunner>,
    pub done: Sender<JobResult>,
}

struct State {
    stats: ManagerStats,
    stopped: bool,
}

struct Shared {
    capacity: usize,
    state: Mutex<State>,
    slot_freed: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Process-wide bounded scheduler, injected where needed
pub struct JobManager {
    shared: Arc<Shared>,
    submit: Mutex<Option<Sender<Job>>>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl JobManager {
    /// Create a stopped manager with the given capacity.
    pub fn new(capacity: usize) -> Self {
        Self {
            shared: Arc::new(Shared {
                capacity,
                state: Mutex::new(State {
                    stats: ManagerStats::default(),
                    stopped: true,
                }),
                slot_freed: Condvar::new(),
            }),
            submit: Mutex::new(None),
            dispatcher: Mutex::new(None),
        }
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    /// Open the submit channel and start the dispatcher. Starting a running
    /// manager is a no-op.
    pub fn start(&self) {
        let mut submit = self.submit.lock().unwrap_or_else(|p| p.into_inner());
        if submit.is_some() {
            return;
        }

        let (tx, rx) = mpsc::channel::<Job>();
        *submit = Some(tx);
        self.shared.lock().stopped = false;

        let shared = Arc::clone(&self.shared);
        let handle = thread::spawn(move || dispatch(shared, rx));
        *self.dispatcher.lock().unwrap_or_else(|p| p.into_inner()) = Some(handle);
        info!(capacity = self.shared.capacity, "job manager started");
    }

    /// Close the submit channel and stop admitting. Running jobs finish;
    /// jobs still waiting for a slot are returned with `ManagerStopped`.
    pub fn stop(&self) {
        let tx = self.submit.lock().unwrap_or_else(|p| p.into_inner()).take();
        if tx.is_none() {
            return;
        }
        drop(tx);

        self.shared.lock().stopped = true;
        self.shared.slot_freed.notify_all();

        if let Some(handle) = self.dispatcher.lock().unwrap_or_else(|p| p.into_inner()).take() {
            if handle.join().is_err() {
                warn!("job dispatcher panicked");
            }
        }
        info!("job manager stopped");
    }

    /// Queue a job. When the manager is not running the job is answered
    /// at once with `ManagerStopped` on its own channel, and the same error
    /// is returned.
    pub fn submit(&self, job: Job) -> Result<()> {
        let rejected = {
            let submit = self.submit.lock().unwrap_or_else(|p| p.into_inner());
            match submit.as_ref() {
                Some(tx) => tx.send(job).err().map(|mpsc::SendError(job)| job),
                None => Some(job),
            }
        };
        match rejected {
            None => Ok(()),
            Some(job) => {
                let _ = job.done.send(JobResult {
                    test: job.test,
                    error: Some(Test161Error::ManagerStopped),
                });
                Err(Test161Error::ManagerStopped)
            }
        }
    }

    pub fn stats(&self) -> ManagerStats {
        self.shared.lock().stats
    }

    pub fn is_running(&self) -> bool {
        !self.shared.lock().stopped
    }
}

impl Drop for JobManager {
    fn drop(&mut self) {
        self.stop();
    }
}

fn dispatch(shared: Arc<Shared>, rx: Receiver<Job>) {
    for job in rx {
        {
            let mut state = shared.lock();
            state.stats.queued += 1;
            state.stats.high_watermark_queued =
                state.stats.high_watermark_queued.max(state.stats.queued);
        }
        let shared = Arc::clone(&shared);
        thread::spawn(move || work(shared, job));
    }
    debug!("submit channel closed");
}

fn work(shared: Arc<Shared>, job: Job) {
    let Job {
        mut test,
        runner,
        done,
    } = job;

    {
        let mut state = shared.lock();
        while !state.stopped
            && shared.capacity > 0
            && state.stats.running >= shared.capacity
        {
            state = shared
                .slot_freed
                .wait(state)
                .unwrap_or_else(|p| p.into_inner());
        }
        state.stats.queued -= 1;
        if state.stopped {
            drop(state);
            debug!(test = %test.dependency_id, "dropped queued job");
            let _ = done.send(JobResult {
                test,
                error: Some(Test161Error::ManagerStopped),
            });
            return;
        }
        state.stats.running += 1;
        state.stats.high_watermark_running =
            state.stats.high_watermark_running.max(state.stats.running);
    }

    debug!(test = %test.dependency_id, "job admitted");
    let error = runner.run(&mut test).err();

    {
        let mut state = shared.lock();
        state.stats.running -= 1;
        state.stats.finished += 1;
    }
    shared.slot_freed.notify_one();

    if done.send(JobResult { test, error }).is_err() {
        warn!("job result receiver dropped");
    }
}
