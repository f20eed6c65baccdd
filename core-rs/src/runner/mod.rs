//! Test runner: drives one test through the simulator.
//!
//! Three activities share a run: the stepper (this module) which sends
//! commands and waits for prompts while recording console output, the
//! telemetry monitor ([`monitor`]), and the progress watchdog. They share the
//! test behind one mutex; a condition variable signals telemetry ticks. The
//! first terminal status written wins, whichever activity writes it.

pub mod monitor;
pub mod pty;
pub mod sys161;

use crate::errors::{Result, Test161Error};
use crate::persistence::{Entity, FieldMask, MsgType, NullPersistence, PersistenceManager};
use crate::scoring;
use crate::test::{Command, Environment, StatusKind, Test, TestConfig};
use chrono::Utc;
use once_cell::sync::Lazy;
use pty::{Expected, Expecter};
use regex::Regex;
use std::collections::VecDeque;
use std::fs;
use std::path::PathBuf;
use std::process::Command as ProcessCommand;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

static BYTES_IN_USE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(\d+)\s+bytes\s+in\s+use").expect("static regex"));

/// Something that can run a test to completion
pub trait TestRunner: Send + Sync {
    /// Run `test`, recording output, statuses and the scored result in it.
    /// Errors are infrastructure failures; test failures are reported
    /// through the test's status and result.
    fn run(&self, test: &mut Test) -> Result<()>;
}

/// How to reach the simulator and its tools
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    pub sim_path: String,
    /// Arguments placed before the kernel path
    pub sim_args: Vec<String>,
    pub disk_tool: String,
    /// Installed kernel root copied into each work directory
    pub root_dir: Option<PathBuf>,
    /// Base directory for work directories; the system default when unset
    pub temp_dir: Option<PathBuf>,
    /// Connect to the metering socket
    pub telemetry: bool,
    /// Require signed output for trusted lines
    pub secure: bool,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            sim_path: "sys161".to_string(),
            sim_args: vec!["-X".to_string()],
            disk_tool: "disk161".to_string(),
            root_dir: None,
            temp_dir: None,
            telemetry: true,
            secure: false,
        }
    }
}

/// Kills the simulator out of band
#[derive(Debug, Default)]
pub(crate) struct Killer {
    pid: AtomicI32,
}

impl Killer {
    fn arm(&self, pid: i32) {
        self.pid.store(pid, Ordering::SeqCst);
    }

    #[cfg(unix)]
    pub(crate) fn kill(&self) {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        let pid = self.pid.load(Ordering::SeqCst);
        if pid > 0 {
            if let Err(e) = kill(Pid::from_raw(pid), Signal::SIGKILL) {
                debug!(pid, error = %e, "kill failed");
            }
        }
    }

    #[cfg(not(unix))]
    pub(crate) fn kill(&self) {}
}

/// State shared by the activities of one run
pub(crate) struct RunState {
    pub test: Test,
    /// Index of the command receiving output and telemetry
    pub current: Option<usize>,
    pub sim_time: f64,
    pub ticks: u64,
    pub telemetry_done: bool,
    pub telemetry_error: Option<String>,
    pub last_activity: Instant,
    pub finished: bool,
}

pub(crate) struct RunShared {
    pub state: Mutex<RunState>,
    pub tick: Condvar,
    pub killer: Killer,
    pub started: Instant,
}

impl RunShared {
    pub(crate) fn lock(&self) -> MutexGuard<'_, RunState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }
}

/// Record one console character into the current command.
fn record(shared: &RunShared, c: char) {
    let walltime = shared.started.elapsed().as_secs_f64();
    let mut st = shared.lock();
    st.last_activity = Instant::now();
    let simtime = st.sim_time;
    if let Some(idx) = st.current {
        let mut buf = [0u8; 4];
        st.test.commands[idx].append_output(c.encode_utf8(&mut buf), walltime, simtime);
    }
}

/// Progress watchdog: times the run out when the console stays silent.
fn watch_progress(shared: Arc<RunShared>, timeout: Duration) {
    let mut st = shared.lock();
    loop {
        if st.finished {
            return;
        }
        let idle = st.last_activity.elapsed();
        if idle >= timeout {
            if let Some(idx) = st.current {
                st.test.commands[idx].timed_out = true;
            }
            let msg = Test161Error::ProgressTimeout(timeout.as_secs_f64()).to_string();
            let simtime = st.sim_time;
            if st.test.set_terminal(StatusKind::Timeout, &msg, simtime) {
                warn!(test = %st.test.dependency_id, "{}", msg);
                shared.killer.kill();
            }
            return;
        }
        let wait = (timeout - idle).min(Duration::from_millis(250));
        st = shared
            .tick
            .wait_timeout(st, wait)
            .map(|(g, _)| g)
            .unwrap_or_else(|p| p.into_inner().0);
    }
}

/// Where the stepper stands after a command
enum Step {
    Prompt(Environment),
    /// A terminal status has been set; stop driving
    Stop,
}

struct Stepper {
    shared: Arc<RunShared>,
    exp: Expecter,
    config: TestConfig,
    telemetry: bool,
    persistence: Arc<dyn PersistenceManager>,
}

impl Stepper {
    fn prompt_timeout(&self, cmd_timeout: f64) -> f64 {
        if cmd_timeout > 0.0 {
            cmd_timeout
        } else {
            self.config.misc.prompttimeout
        }
    }

    /// Make `cmd` the current command, closing out the previous one.
    fn begin(&self, mut cmd: Command) -> usize {
        let mut st = self.shared.lock();
        if let Some(prev) = st.current {
            st.test.commands[prev].finish_output();
            self.notify_command(&st, prev, MsgType::Complete);
        }
        cmd.seq = st.test.commands.len();
        debug!(test = %st.test.dependency_id, command = %cmd.input.line(), "command");
        st.test.commands.push(cmd);
        let idx = st.test.commands.len() - 1;
        st.current = Some(idx);
        self.notify_command(&st, idx, MsgType::Create);
        idx
    }

    fn notify_command(&self, st: &RunState, idx: usize, msg: MsgType) {
        let entity = Entity::Command(&st.test, &st.test.commands[idx]);
        let fields = match msg {
            MsgType::Create => FieldMask::NONE,
            _ => FieldMask::OUTPUT | FieldMask::STATUS,
        };
        if let Err(e) = self.persistence.notify(entity, msg, fields) {
            warn!(error = %e, "persistence notification failed");
        }
    }

    /// Block until the monitor has delivered a fresh tick.
    fn wait_for_tick(&self) -> Result<()> {
        if !self.telemetry {
            return Ok(());
        }
        let limit = Duration::from_secs_f64(self.config.monitor.progresstimeout.max(1.0));
        let deadline = Instant::now() + limit;
        let mut st = self.shared.lock();
        let seen = st.ticks;
        while st.ticks == seen
            && !st.telemetry_done
            && st.telemetry_error.is_none()
            && st.test.terminal_status().is_none()
        {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            st = self
                .shared
                .tick
                .wait_timeout(st, deadline - now)
                .map(|(g, _)| g)
                .unwrap_or_else(|p| p.into_inner().0);
        }
        match st.telemetry_error.take() {
            Some(e) => Err(Test161Error::TelemetryIOError(e)),
            None => Ok(()),
        }
    }

    fn on_eof(&self) -> Step {
        let mut st = self.shared.lock();
        let simtime = st.sim_time;
        if st.test.set_terminal(StatusKind::Crash, "unexpected end of simulator output", simtime) {
            info!(test = %st.test.dependency_id, "simulator exited unexpectedly");
        }
        Step::Stop
    }

    fn on_timeout(&self, idx: usize, msg: String) -> Step {
        let mut st = self.shared.lock();
        st.test.commands[idx].timed_out = true;
        let simtime = st.sim_time;
        if st.test.set_terminal(StatusKind::Timeout, &msg, simtime) {
            info!(test = %st.test.dependency_id, "{}", msg);
        }
        drop(st);
        self.shared.killer.kill();
        Step::Stop
    }

    fn fatal(&self, msg: &str) -> Step {
        let mut st = self.shared.lock();
        let simtime = st.sim_time;
        if st.test.set_terminal(StatusKind::Crash, msg, simtime) {
            warn!(test = %st.test.dependency_id, "{}", msg);
        }
        drop(st);
        self.shared.killer.kill();
        Step::Stop
    }

    /// Type `text` one character at a time, waiting for each echo.
    fn type_line(&mut self, idx: usize, text: &str) -> Result<Option<Step>> {
        let char_timeout = Duration::from_millis(self.config.misc.charactertimeout);
        let retries = self.config.misc.commandretries.max(1);
        let shared = Arc::clone(&self.shared);
        let mut sink = move |c: char| record(&shared, c);

        for c in text.chars() {
            let mut echoed = false;
            for _ in 0..retries {
                if let Some(step) = self.send(&c.to_string())? {
                    return Ok(Some(step));
                }
                match self.exp.expect_echo(c, char_timeout, &mut sink) {
                    Expected::Echo => {
                        echoed = true;
                        break;
                    }
                    Expected::Eof => return Ok(Some(self.on_eof())),
                    _ => continue,
                }
            }
            if !echoed {
                return Ok(Some(self.on_timeout(
                    idx,
                    format!("no echo for {:?} after {} attempts", c, retries),
                )));
            }
        }
        self.send("\n")
    }

    /// Write to the console. A failed write after a terminal status was set
    /// means the simulator was killed under us.
    fn send(&mut self, text: &str) -> Result<Option<Step>> {
        match self.exp.send(text) {
            Ok(()) => Ok(None),
            Err(_) if self.stopped() => Ok(Some(Step::Stop)),
            Err(e) => Err(e),
        }
    }

    /// Send one command and wait for the next prompt.
    fn run_command(&mut self, cmd: Command) -> Result<Step> {
        self.wait_for_tick()?;
        if self.stopped() {
            return Ok(Step::Stop);
        }
        let timeout = self.prompt_timeout(cmd.timeout);
        let text = cmd.input.command_text();
        let idx = self.begin(cmd);

        if let Some(step) = self.type_line(idx, &text)? {
            return Ok(step);
        }

        let shared = Arc::clone(&self.shared);
        let mut sink = move |c: char| record(&shared, c);
        Ok(
            match self
                .exp
                .expect_prompt(Duration::from_secs_f64(timeout), &mut sink)
            {
                Expected::Prompt(env) => Step::Prompt(env),
                Expected::Eof => self.on_eof(),
                Expected::Timeout | Expected::Echo => {
                    self.on_timeout(idx, Test161Error::PromptTimeout(timeout).to_string())
                }
            },
        )
    }

    /// Run a runner-generated command that must land at `want`.
    fn run_synthetic(&mut self, id: &str, env: Environment, want: Environment) -> Result<Step> {
        match self.run_command(Command::synthetic(0, env, id))? {
            Step::Prompt(got) if got == want => Ok(Step::Prompt(got)),
            Step::Prompt(_) => Ok(self.fatal(&format!("unexpected prompt after {}", id))),
            Step::Stop => Ok(Step::Stop),
        }
    }

    /// Run `khu` and parse the kernel heap usage.
    fn heap_in_use(&mut self) -> Result<Option<i64>> {
        if let Step::Stop = self.run_synthetic("khu", Environment::Kernel, Environment::Kernel)? {
            return Ok(None);
        }
        let st = self.shared.lock();
        let Some(idx) = st.current else {
            return Ok(None);
        };
        let mut cmd = st.test.commands[idx].clone();
        drop(st);
        cmd.finish_output();
        Ok(cmd
            .output
            .iter()
            .rev()
            .find_map(|l| BYTES_IN_USE.captures(&l.line))
            .and_then(|caps| caps[1].parse().ok()))
    }

    fn boot(&mut self) -> Step {
        let timeout = self.config.misc.prompttimeout;
        let idx = self.begin(Command::synthetic(0, Environment::Kernel, "boot"));
        let shared = Arc::clone(&self.shared);
        let mut sink = move |c: char| record(&shared, c);
        match self
            .exp
            .expect_prompt(Duration::from_secs_f64(timeout), &mut sink)
        {
            Expected::Prompt(Environment::Kernel) => Step::Prompt(Environment::Kernel),
            Expected::Prompt(Environment::Shell) => self.fatal("shell prompt before kernel prompt"),
            Expected::Eof => self.on_eof(),
            Expected::Timeout | Expected::Echo => {
                self.on_timeout(idx, Test161Error::PromptTimeout(timeout).to_string())
            }
        }
    }

    fn shutdown(&mut self) -> Result<()> {
        self.wait_for_tick()?;
        if self.stopped() {
            return Ok(());
        }
        let timeout = self.config.misc.prompttimeout;
        let idx = self.begin(Command::synthetic(0, Environment::Kernel, "q"));
        if self.type_line(idx, "q")?.is_some() {
            return Ok(());
        }

        if self.config.misc.killonexit {
            self.shared.killer.kill();
            let mut st = self.shared.lock();
            let simtime = st.sim_time;
            st.test.set_terminal(StatusKind::Shutdown, "", simtime);
            return Ok(());
        }

        let shared = Arc::clone(&self.shared);
        let mut sink = move |c: char| record(&shared, c);
        match self
            .exp
            .expect_eof(Duration::from_secs_f64(timeout), &mut sink)
        {
            Expected::Eof => {
                let mut st = self.shared.lock();
                let simtime = st.sim_time;
                st.test.set_terminal(StatusKind::Shutdown, "", simtime);
            }
            _ => {
                self.on_timeout(idx, Test161Error::PromptTimeout(timeout).to_string());
            }
        }
        Ok(())
    }

    /// The command-stepping state machine.
    fn drive(&mut self, body: Vec<Command>, mem_leak: bool) -> Result<()> {
        let mut env = match self.boot() {
            Step::Prompt(env) => env,
            Step::Stop => return Ok(()),
        };

        let heap_before = if mem_leak { self.heap_in_use()? } else { None };
        if mem_leak && heap_before.is_none() && self.stopped() {
            return Ok(());
        }

        let mut queue: VecDeque<Command> = body.into();
        loop {
            let step = match queue.front() {
                Some(next) if next.env == Environment::Shell && env == Environment::Kernel => {
                    self.run_synthetic("s", Environment::Kernel, Environment::Shell)?
                }
                Some(next) if next.env == Environment::Kernel && env == Environment::Shell => {
                    self.run_synthetic("exit", Environment::Shell, Environment::Kernel)?
                }
                Some(_) => match queue.pop_front() {
                    Some(cmd) => self.run_command(cmd)?,
                    None => break,
                },
                None if env == Environment::Shell => {
                    self.run_synthetic("exit", Environment::Shell, Environment::Kernel)?
                }
                None => break,
            };
            match step {
                Step::Prompt(next) => env = next,
                Step::Stop => return Ok(()),
            }
        }

        if mem_leak {
            if let (Some(before), Some(after)) = (heap_before, self.heap_in_use()?) {
                self.shared.lock().test.mem_leak_bytes = after - before;
            }
            if self.stopped() {
                return Ok(());
            }
        }

        self.shutdown()
    }

    fn stopped(&self) -> bool {
        self.shared.lock().test.terminal_status().is_some()
    }
}

/// Runs tests under sys161
pub struct Sys161Runner {
    config: RunnerConfig,
    persistence: Arc<dyn PersistenceManager>,
}

impl Sys161Runner {
    pub fn new(config: RunnerConfig, persistence: Arc<dyn PersistenceManager>) -> Self {
        Self {
            config,
            persistence,
        }
    }

    pub fn with_config(config: RunnerConfig) -> Self {
        Self::new(config, Arc::new(NullPersistence))
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    fn notify(&self, test: &Test, msg: MsgType, fields: FieldMask) {
        if let Err(e) = self.persistence.notify(Entity::Test(test), msg, fields) {
            warn!(test = %test.dependency_id, error = %e, "persistence notification failed");
        }
    }

    /// Create the work directory: kernel root, configuration, disks and the
    /// socket directory.
    fn prepare(&self, test: &mut Test) -> Result<tempfile::TempDir> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("test161-");
        let dir = match &self.config.temp_dir {
            Some(base) => builder.tempdir_in(base)?,
            None => builder.tempdir()?,
        };

        if let Some(root) = &self.config.root_dir {
            sys161::copy_tree(root, dir.path())?;
        }

        let seed = test
            .config
            .sys161
            .random
            .unwrap_or_else(rand::random::<u16>);
        test.sim_conf = sys161::conf_string(&test.config.sys161, seed);
        fs::write(dir.path().join(sys161::CONF_FILE), &test.sim_conf)?;
        sys161::create_disks(dir.path(), &test.config.sys161, &self.config.disk_tool)?;
        fs::create_dir_all(dir.path().join(".sockets"))?;
        Ok(dir)
    }
}

impl TestRunner for Sys161Runner {
    fn run(&self, test: &mut Test) -> Result<()> {
        if test.commands.is_empty() && !test.body.is_empty() {
            return Err(Test161Error::InvalidCommand(format!(
                "{}: commands not instantiated",
                test.dependency_id
            )));
        }

        test.start_time = Some(Utc::now());
        let workdir = self.prepare(test)?;
        info!(test = %test.dependency_id, dir = %workdir.path().display(), "starting test");

        let mut cmd = ProcessCommand::new(&self.config.sim_path);
        cmd.args(&self.config.sim_args)
            .arg("kernel")
            .current_dir(workdir.path());
        let exp = Expecter::spawn(cmd)?;

        let body = std::mem::take(&mut test.commands);
        let mem_leak = test.mem_leak_points > 0;
        test.add_status(StatusKind::Started, "", 0.0);
        self.notify(test, MsgType::Create, FieldMask::STATUSES);

        let shared = Arc::new(RunShared {
            state: Mutex::new(RunState {
                test: test.clone(),
                current: None,
                sim_time: 0.0,
                ticks: 0,
                telemetry_done: false,
                telemetry_error: None,
                last_activity: Instant::now(),
                finished: false,
            }),
            tick: Condvar::new(),
            killer: Killer::default(),
            started: Instant::now(),
        });
        shared.killer.arm(exp.pid());

        let watchdog = {
            let shared = Arc::clone(&shared);
            let timeout = Duration::from_secs_f64(test.config.monitor.progresstimeout.max(0.001));
            thread::spawn(move || watch_progress(shared, timeout))
        };

        let monitor = self.config.telemetry.then(|| {
            let shared = Arc::clone(&shared);
            let conf = monitor::MeterConf {
                socket: workdir.path().join(".sockets").join("meter"),
                interval: test.config.stat.interval,
                stat_window: test.config.stat.window,
                cpus: test.config.sys161.cpus,
                monitor: test.config.monitor.clone(),
            };
            thread::spawn(move || monitor::run(shared, conf))
        });

        let mut stepper = Stepper {
            shared: Arc::clone(&shared),
            exp,
            config: test.config.clone(),
            telemetry: self.config.telemetry,
            persistence: Arc::clone(&self.persistence),
        };
        let outcome = stepper.drive(body, mem_leak);

        {
            let mut st = shared.lock();
            st.finished = true;
            if let Some(idx) = st.current {
                st.test.commands[idx].finish_output();
                stepper.notify_command(&st, idx, MsgType::Complete);
            }
            st.current = None;
        }
        shared.tick.notify_all();
        if !stepper.exp.exited() {
            shared.killer.kill();
        }
        drop(stepper);

        if watchdog.join().is_err() {
            warn!("progress watchdog panicked");
        }
        if let Some(handle) = monitor {
            if handle.join().is_err() {
                warn!("telemetry monitor panicked");
            }
        }

        *test = shared.lock().test.clone();
        test.end_time = Some(Utc::now());
        self.notify(test, MsgType::Update, FieldMask::STATUS | FieldMask::STATUSES);
        scoring::score_test(test, self.config.secure);
        info!(
            test = %test.dependency_id,
            result = %test.result,
            status = test.terminal_status().map_or("none", |s| s.status.as_str()),
            "finished test"
        );
        self.notify(
            test,
            MsgType::Complete,
            FieldMask::STATUS | FieldMask::SCORE | FieldMask::STATUSES,
        );

        outcome
    }
}
