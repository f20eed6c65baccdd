//! Kernel build driver
//!
//! A build is a batch of external commands run in order (clone, checkout,
//! configure, compile, install). The first failing step stops the batch.
//! On success the kernel root directory holds an installed kernel that test
//! runs copy into their work directories.

use crate::errors::{Result, Test161Error};
use crate::persistence::{Entity, FieldMask, MsgType, PersistenceManager};
use crate::runner::sys161::copy_tree;
use crate::test::{CommandStatus, TestResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::process::Command as ProcessCommand;
use tracing::{error, info, warn};
use uuid::Uuid;

/// What to build and where
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BuildConf {
    /// Git URL or local path of the source repository
    pub repo: String,
    /// Branch, tag or commit to check out; empty keeps the default branch
    pub commit_ref: String,
    /// Commit that must be an ancestor of the checked-out revision
    pub required_commit: String,
    /// Kernel configuration name, e.g. `ASST1`
    pub kconfig: String,
    /// Build and install userland before the kernel
    pub userland: bool,
    /// Directory copied over the source tree after checkout
    pub overlay: Option<PathBuf>,
    /// Checkout destination
    pub src_dir: PathBuf,
    /// Install root (`--ostree`)
    pub root_dir: PathBuf,
}

/// One step of a build
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildCommand {
    pub seq: usize,
    pub dir: PathBuf,
    pub program: String,
    pub args: Vec<String>,
    pub output: Vec<String>,
    pub exit_code: Option<i32>,
    pub status: CommandStatus,
}

impl BuildCommand {
    pub fn new(dir: &Path, program: &str, args: &[&str]) -> Self {
        Self {
            seq: 0,
            dir: dir.to_path_buf(),
            program: program.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
            output: Vec::new(),
            exit_code: None,
            status: CommandStatus::None,
        }
    }

    pub fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }

    fn execute(&mut self) -> Result<()> {
        let out = ProcessCommand::new(&self.program)
            .args(&self.args)
            .current_dir(&self.dir)
            .output();

        let out = match out {
            Ok(out) => out,
            Err(e) => {
                self.status = CommandStatus::Incorrect;
                self.output.push(e.to_string());
                return Err(Test161Error::BuildFailed(format!("{}: {}", self.command_line(), e)));
            }
        };

        for stream in [&out.stdout, &out.stderr] {
            self.output
                .extend(String::from_utf8_lossy(stream).lines().map(str::to_string));
        }
        self.exit_code = out.status.code();

        if out.status.success() {
            self.status = CommandStatus::Correct;
            Ok(())
        } else {
            self.status = CommandStatus::Incorrect;
            Err(Test161Error::BuildFailed(format!(
                "{}: exit status {}",
                self.command_line(),
                self.exit_code.map_or("signal".to_string(), |c| c.to_string())
            )))
        }
    }
}

/// A build run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildTest {
    pub id: Uuid,
    pub conf: BuildConf,
    pub commands: Vec<BuildCommand>,
    pub result: TestResult,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
}

impl BuildTest {
    /// Plan the standard clone/configure/compile/install batch.
    pub fn new(conf: BuildConf) -> Self {
        let commands = plan(&conf);
        Self::with_commands(conf, commands)
    }

    /// A build with an explicit command list.
    pub fn with_commands(conf: BuildConf, mut commands: Vec<BuildCommand>) -> Self {
        for (seq, cmd) in commands.iter_mut().enumerate() {
            cmd.seq = seq;
        }
        Self {
            id: Uuid::new_v4(),
            conf,
            commands,
            result: TestResult::None,
            start_time: None,
            end_time: None,
        }
    }

    /// Run the batch. Returns the kernel root on success.
    pub fn run(&mut self, persistence: &dyn PersistenceManager) -> Result<PathBuf> {
        self.start_time = Some(Utc::now());
        notify(persistence, Entity::Build(self), MsgType::Create, FieldMask::NONE);
        info!(build = %self.id, steps = self.commands.len(), "starting build");

        let mut failure = None;
        let mut overlay_applied = false;
        for i in 0..self.commands.len() {
            // The overlay lands once the checkout exists, ahead of configure.
            if !overlay_applied && self.commands[i].program == "./configure" {
                overlay_applied = true;
                if let Err(e) = self.apply_overlay() {
                    failure = Some(e);
                    break;
                }
            }

            info!(build = %self.id, step = %self.commands[i].command_line(), "build step");
            let outcome = self.commands[i].execute();
            notify(
                persistence,
                Entity::BuildCommand(self, &self.commands[i]),
                MsgType::Complete,
                FieldMask::STATUS | FieldMask::OUTPUT,
            );
            if let Err(e) = outcome {
                error!(build = %self.id, error = %e, "build step failed");
                failure = Some(e);
                break;
            }
        }

        self.end_time = Some(Utc::now());
        self.result = if failure.is_none() {
            TestResult::Correct
        } else {
            TestResult::Incorrect
        };
        notify(persistence, Entity::Build(self), MsgType::Complete, FieldMask::STATUS);

        match failure {
            Some(e) => Err(e),
            None => Ok(self.conf.root_dir.clone()),
        }
    }

    fn apply_overlay(&self) -> Result<()> {
        match &self.conf.overlay {
            Some(overlay) => copy_tree(overlay, &self.conf.src_dir).map_err(|e| {
                Test161Error::BuildFailed(format!("overlay {}: {}", overlay.display(), e))
            }),
            None => Ok(()),
        }
    }
}

fn notify(persistence: &dyn PersistenceManager, entity: Entity<'_>, msg: MsgType, fields: FieldMask) {
    if let Err(e) = persistence.notify(entity, msg, fields) {
        warn!(error = %e, "persistence notification failed");
    }
}

fn plan(conf: &BuildConf) -> Vec<BuildCommand> {
    let src = conf.src_dir.as_path();
    let parent = src.parent().unwrap_or_else(|| Path::new("."));
    let src_str = src.to_string_lossy();
    let ostree = format!("--ostree={}", conf.root_dir.to_string_lossy());

    let mut cmds = vec![BuildCommand::new(
        parent,
        "git",
        &["clone", &conf.repo, &src_str],
    )];
    if !conf.commit_ref.is_empty() {
        cmds.push(BuildCommand::new(src, "git", &["checkout", &conf.commit_ref]));
    }
    if !conf.required_commit.is_empty() {
        cmds.push(BuildCommand::new(
            src,
            "git",
            &["merge-base", "--is-ancestor", &conf.required_commit, "HEAD"],
        ));
    }
    cmds.push(BuildCommand::new(src, "./configure", &[&ostree]));
    if conf.userland {
        cmds.push(BuildCommand::new(src, "bmake", &[]));
        cmds.push(BuildCommand::new(src, "bmake", &["install"]));
    }

    let kconf = src.join("kern/conf");
    let compile = src.join("kern/compile").join(&conf.kconfig);
    cmds.push(BuildCommand::new(&kconf, "./config", &[&conf.kconfig]));
    cmds.push(BuildCommand::new(&compile, "bmake", &["depend"]));
    cmds.push(BuildCommand::new(&compile, "bmake", &[]));
    cmds.push(BuildCommand::new(&compile, "bmake", &["install"]));
    cmds
}
