/**
 * config.rs
 * Parser for .test161.conf client configuration files (YAML format)
 *
 * Format:
 * ```yaml
 * rootdir: ./root
 * test161dir: ./test161
 * parallelism: 4
 * secure: false
 * ```
 *
 * Relative paths are resolved against the directory holding the file.
 */

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::errors::{Result, Test161Error};
use crate::runner::RunnerConfig;

pub const CONF_FILE: &str = ".test161.conf";

/// .test161.conf file structure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ClientConfig {
    /// Installed kernel root copied into each work directory
    pub rootdir: Option<PathBuf>,

    /// Directory holding `commands/`, `tests/` and `targets/`
    pub test161dir: PathBuf,

    pub sim_path: String,
    pub sim_args: Vec<String>,
    pub disk_tool: String,

    /// Job manager capacity; 0 means unlimited
    pub parallelism: usize,

    pub tempdir: Option<PathBuf>,
    pub secure: bool,
    pub telemetry: bool,

    /// Where JSON snapshots are written, if anywhere
    pub persist_dir: Option<PathBuf>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        let defaults = RunnerConfig::default();
        Self {
            rootdir: None,
            test161dir: PathBuf::from("test161"),
            sim_path: defaults.sim_path,
            sim_args: defaults.sim_args,
            disk_tool: defaults.disk_tool,
            parallelism: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            tempdir: None,
            secure: false,
            telemetry: true,
            persist_dir: None,
        }
    }
}

impl ClientConfig {
    /// Load a configuration file, resolving relative paths against its
    /// directory.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(Test161Error::ConfigParse(format!(
                "config file not found: {}",
                path.display()
            )));
        }

        let content = fs::read_to_string(path)?;
        let mut config: ClientConfig = serde_yaml::from_str(&content).map_err(|e| {
            Test161Error::ConfigParse(format!("{}: {}", path.display(), e))
        })?;

        let base = path.parent().unwrap_or_else(|| Path::new("."));
        config.resolve_paths(base);
        config.validate()?;
        Ok(config)
    }

    /// Search `start` and its ancestors for `.test161.conf`.
    pub fn find(start: &Path) -> Option<PathBuf> {
        start
            .ancestors()
            .map(|dir| dir.join(CONF_FILE))
            .find(|candidate| candidate.is_file())
    }

    /// Load the nearest configuration above `start`, or defaults rooted at
    /// `start` when there is none.
    pub fn discover(start: &Path) -> Result<Self> {
        match Self::find(start) {
            Some(path) => Self::load(path),
            None => {
                let mut config = Self::default();
                config.resolve_paths(start);
                Ok(config)
            }
        }
    }

    fn resolve_paths(&mut self, base: &Path) {
        let join = |p: &Path| {
            if p.is_absolute() {
                p.to_path_buf()
            } else {
                base.join(p)
            }
        };
        self.test161dir = join(&self.test161dir);
        self.rootdir = self.rootdir.as_deref().map(join);
        self.tempdir = self.tempdir.as_deref().map(join);
        self.persist_dir = self.persist_dir.as_deref().map(join);
    }

    pub fn validate(&self) -> Result<()> {
        if self.sim_path.is_empty() {
            return Err(Test161Error::ConfigParse(
                "sim_path cannot be empty".to_string(),
            ));
        }
        if self.disk_tool.is_empty() {
            return Err(Test161Error::ConfigParse(
                "disk_tool cannot be empty".to_string(),
            ));
        }
        Ok(())
    }

    /// Runner settings derived from this configuration
    pub fn runner_config(&self) -> RunnerConfig {
        RunnerConfig {
            sim_path: self.sim_path.clone(),
            sim_args: self.sim_args.clone(),
            disk_tool: self.disk_tool.clone(),
            root_dir: self.rootdir.clone(),
            temp_dir: self.tempdir.clone(),
            telemetry: self.telemetry,
            secure: self.secure,
        }
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let yaml = serde_yaml::to_string(self)?;
        fs::write(path.as_ref(), yaml)?;
        Ok(())
    }
}
