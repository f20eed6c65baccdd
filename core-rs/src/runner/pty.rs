//! Expect-style driving of the simulator console over a pseudoterminal.
//!
//! Every character read from the console is handed to a sink as it arrives,
//! so callers can record output with arrival timestamps. Prompt regexes are
//! matched against the text received since the last match.

use crate::errors::{Result, Test161Error};
use crate::test::Environment;
use once_cell::sync::Lazy;
use regex::Regex;
use rexpect::process::wait::WaitStatus;
use rexpect::session::{spawn_command, PtySession};
use std::process::Command as ProcessCommand;
use std::thread;
use std::time::{Duration, Instant};

static KERNEL_PROMPT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"OS/161 kernel \[\? for menu\]: $").expect("static regex"));
static SHELL_PROMPT: Lazy<Regex> = Lazy::new(|| Regex::new(r"OS/161\$ $").expect("static regex"));

const POLL: Duration = Duration::from_millis(10);
/// Output drained after the child exits before EOF is reported
const EXIT_GRACE: Duration = Duration::from_millis(100);
const PENDING_LIMIT: usize = 4096;

/// What an expect call ended on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expected {
    Prompt(Environment),
    /// The awaited character was echoed
    Echo,
    Eof,
    Timeout,
}

enum Read {
    Char(char),
    Empty,
    Eof,
}

pub struct Expecter {
    session: PtySession,
    pending: String,
    exited_at: Option<Instant>,
}

impl Expecter {
    /// Spawn `cmd` under a pseudoterminal.
    pub fn spawn(cmd: ProcessCommand) -> Result<Self> {
        let name = format!("{:?}", cmd.get_program());
        let session = spawn_command(cmd, None)
            .map_err(|e| Test161Error::SimulatorSpawnFailed(format!("{}: {}", name, e)))?;
        Ok(Self {
            session,
            pending: String::new(),
            exited_at: None,
        })
    }

    /// Raw pid of the child, for out-of-band killing
    pub fn pid(&self) -> i32 {
        self.session.process.child_pid.as_raw()
    }

    /// Whether the child has been observed to exit
    pub fn exited(&self) -> bool {
        self.exited_at.is_some()
    }

    pub fn send(&mut self, text: &str) -> Result<()> {
        self.session
            .send(text)
            .and_then(|_| self.session.flush())
            .map_err(|e| Test161Error::SimulatorCrashed(format!("console write failed: {}", e)))
    }

    fn read(&mut self) -> Read {
        if let Some(c) = self.session.try_read() {
            return Read::Char(c);
        }
        match self.exited_at {
            Some(at) if at.elapsed() >= EXIT_GRACE => Read::Eof,
            Some(_) => Read::Empty,
            None => {
                if !matches!(self.session.process.status(), Some(WaitStatus::StillAlive)) {
                    self.exited_at = Some(Instant::now());
                }
                Read::Empty
            }
        }
    }

    fn push_pending(&mut self, c: char) {
        self.pending.push(c);
        if self.pending.len() > PENDING_LIMIT {
            let cut = self.pending.len() - PENDING_LIMIT / 2;
            let cut = (cut..self.pending.len())
                .find(|i| self.pending.is_char_boundary(*i))
                .unwrap_or(self.pending.len());
            self.pending.drain(..cut);
        }
    }

    fn matched_prompt(&mut self) -> Option<Environment> {
        let env = if KERNEL_PROMPT.is_match(&self.pending) {
            Environment::Kernel
        } else if SHELL_PROMPT.is_match(&self.pending) {
            Environment::Shell
        } else {
            return None;
        };
        self.pending.clear();
        Some(env)
    }

    /// Wait for either prompt.
    pub fn expect_prompt(&mut self, timeout: Duration, sink: &mut dyn FnMut(char)) -> Expected {
        let deadline = Instant::now() + timeout;
        loop {
            match self.read() {
                Read::Char(c) => {
                    sink(c);
                    self.push_pending(c);
                    if c == ' ' {
                        if let Some(env) = self.matched_prompt() {
                            return Expected::Prompt(env);
                        }
                    }
                }
                Read::Eof => return Expected::Eof,
                Read::Empty => {
                    if Instant::now() >= deadline {
                        return Expected::Timeout;
                    }
                    thread::sleep(POLL);
                }
            }
        }
    }

    /// Wait for `want` to be echoed.
    pub fn expect_echo(
        &mut self,
        want: char,
        timeout: Duration,
        sink: &mut dyn FnMut(char),
    ) -> Expected {
        let deadline = Instant::now() + timeout;
        loop {
            match self.read() {
                Read::Char(c) => {
                    sink(c);
                    self.push_pending(c);
                    if c == want {
                        return Expected::Echo;
                    }
                }
                Read::Eof => return Expected::Eof,
                Read::Empty => {
                    if Instant::now() >= deadline {
                        return Expected::Timeout;
                    }
                    thread::sleep(POLL);
                }
            }
        }
    }

    /// Wait for the child to exit, recording anything it prints.
    pub fn expect_eof(&mut self, timeout: Duration, sink: &mut dyn FnMut(char)) -> Expected {
        let deadline = Instant::now() + timeout;
        loop {
            match self.read() {
                Read::Char(c) => sink(c),
                Read::Eof => return Expected::Eof,
                Read::Empty => {
                    if Instant::now() >= deadline {
                        return Expected::Timeout;
                    }
                    thread::sleep(POLL);
                }
            }
        }
    }
}
