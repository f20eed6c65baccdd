//! Targets: versioned, point-weighted bundles of tests
//!
//! ```yaml
//! name: asst1
//! version: 1
//! type: asst
//! points: 50
//! kconfig: ASST1
//! userland: false
//! tests:
//!   - id: sync/sy1.t
//!     points: 20
//!   - id: sync/sy2.t
//!     scoring: partial
//!     points: 30
//!     commands:
//!       - id: sy2
//!         index: 1
//!         points: 30
//! ```

use crate::errors::{Result, Test161Error};
use crate::group::{GroupConfig, TestGroup, TestMap};
use crate::template::TemplateRegistry;
use crate::test::ScoringMethod;
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;
use tracing::{debug, warn};
use walkdir::WalkDir;

/// Extension of target files
pub const TARGET_FILE_EXT: &str = "tt";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TargetType {
    #[default]
    #[serde(alias = "asst")]
    Assignment,
    #[serde(alias = "perf")]
    Performance,
}

/// Per-command scoring override inside a test binding
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetCommand {
    pub id: String,
    /// 1-based position among commands with this id; 0 binds every instance
    #[serde(default)]
    pub index: usize,
    #[serde(default)]
    pub points: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<Vec<String>>,
}

/// A test's binding within a target
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetTest {
    pub id: String,
    #[serde(default)]
    pub scoring: ScoringMethod,
    #[serde(default)]
    pub points: u32,
    /// Points deducted when the kernel leaks memory during the test
    #[serde(default)]
    pub mem_leak: u32,
    #[serde(default)]
    pub commands: Vec<TargetCommand>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Target {
    pub name: String,
    #[serde(default)]
    pub version: u32,
    #[serde(rename = "type", default)]
    pub kind: TargetType,
    #[serde(default)]
    pub points: u32,
    #[serde(default)]
    pub overlay: String,
    #[serde(default)]
    pub kconfig: String,
    #[serde(default)]
    pub required_commit: String,
    #[serde(default)]
    pub userland: bool,
    #[serde(default)]
    pub tests: Vec<TargetTest>,

    #[serde(skip)]
    pub file_name: String,
    #[serde(skip)]
    pub file_hash: String,
}

impl Target {
    /// Parse target YAML, stamping it with the file name and the SHA-256 of
    /// the raw bytes.
    pub fn parse(bytes: &[u8], file_name: &str) -> Result<Self> {
        let mut target: Target = serde_yaml::from_slice(bytes)
            .map_err(|e| Test161Error::ConfigParse(format!("{}: {}", file_name, e)))?;
        if target.name.trim().is_empty() {
            return Err(Test161Error::ConfigParse(format!("{}: target has no name", file_name)));
        }
        target.file_name = file_name.to_string();
        target.file_hash = hex::encode(Sha256::digest(bytes));
        Ok(target)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let bytes = fs::read(path)?;
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Self::parse(&bytes, &file_name)
    }

    /// Load every `*.tt` below `dir`. When two files share a name, the higher
    /// version wins.
    pub fn load_dir(dir: &Path) -> Result<BTreeMap<String, Target>> {
        let mut targets: BTreeMap<String, Target> = BTreeMap::new();
        if !dir.exists() {
            return Ok(targets);
        }

        let mut errors = Vec::new();
        for entry in WalkDir::new(dir).sort_by_file_name() {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    errors.push(Test161Error::ConfigParse(e.to_string()));
                    continue;
                }
            };
            let path = entry.path();
            if !entry.file_type().is_file()
                || path.extension().and_then(|e| e.to_str()) != Some(TARGET_FILE_EXT)
            {
                continue;
            }
            match Self::load(path) {
                Ok(target) => {
                    debug!(target = %target.name, version = target.version, "loaded target");
                    match targets.get(&target.name) {
                        Some(existing) if existing.version >= target.version => {
                            warn!(target = %target.name, file = %target.file_name, "shadowed by newer version");
                        }
                        _ => {
                            targets.insert(target.name.clone(), target);
                        }
                    }
                }
                Err(e) => errors.push(e),
            }
        }
        Test161Error::from_batch(errors)?;
        Ok(targets)
    }

    /// Build the target's group and apply its bindings.
    pub fn instance(
        &self,
        map: &TestMap,
        registry: &TemplateRegistry,
        rng: &mut StdRng,
    ) -> Result<TestGroup> {
        let config = GroupConfig {
            name: self.name.clone(),
            use_deps: true,
            tests: self.tests.iter().map(|t| t.id.clone()).collect(),
            ..Default::default()
        };
        let mut group = TestGroup::build(config, map, registry, rng)?;
        self.bind(&mut group, registry, rng)?;
        Ok(group)
    }

    /// Apply points, scoring methods and command overrides to a built group.
    pub fn bind(
        &self,
        group: &mut TestGroup,
        registry: &TemplateRegistry,
        rng: &mut StdRng,
    ) -> Result<()> {
        let mut errors = Vec::new();
        let mut total = 0u32;

        for binding in &self.tests {
            total = add_points(total, binding.points, &self.name)?;
            if let Err(e) = bind_test(binding, group, registry, rng) {
                errors.push(e);
            }
        }

        if errors.is_empty() && total != self.points {
            errors.push(Test161Error::ScoringMismatch(format!(
                "target {}: test points sum to {}, target is worth {}",
                self.name, total, self.points
            )));
        }
        Test161Error::from_batch(errors)
    }
}

fn bind_test(
    binding: &TargetTest,
    group: &mut TestGroup,
    registry: &TemplateRegistry,
    rng: &mut StdRng,
) -> Result<()> {
    let test = group
        .tests
        .get_mut(&binding.id)
        .ok_or_else(|| Test161Error::DependencyUnresolved(binding.id.clone()))?;

    test.points_available = binding.points;
    test.scoring = binding.scoring;
    test.mem_leak_points = binding.mem_leak;

    let mut bound = BTreeSet::new();
    let mut overridden: BTreeMap<&str, Vec<usize>> = BTreeMap::new();
    let mut command_points = 0u32;

    for ov in &binding.commands {
        let positions: Vec<usize> = test
            .commands
            .iter()
            .enumerate()
            .filter(|(_, c)| !c.synthetic && c.id() == ov.id)
            .map(|(i, _)| i)
            .collect();

        if positions.is_empty() {
            return Err(Test161Error::UnknownTemplate(format!(
                "{}: no command {}",
                binding.id, ov.id
            )));
        }

        overridden.insert(ov.id.as_str(), positions.clone());

        let selected = if ov.index > 0 {
            match positions.get(ov.index - 1) {
                Some(&p) => vec![p],
                None => {
                    return Err(Test161Error::InvalidCommand(format!(
                        "{}: command {} index {} out of range (have {})",
                        binding.id,
                        ov.id,
                        ov.index,
                        positions.len()
                    )))
                }
            }
        } else {
            positions
        };

        for pos in selected {
            if !bound.insert(pos) {
                return Err(Test161Error::ScoringMismatch(format!(
                    "{}: command {} bound more than once",
                    binding.id, ov.id
                )));
            }
            let cmd = &mut test.commands[pos];
            if let Some(args) = &ov.args {
                cmd.override_args(args.clone(), registry, rng)?;
            }
            if binding.scoring == ScoringMethod::Partial {
                cmd.points_available = ov.points;
                command_points = add_points(command_points, ov.points, &binding.id)?;
            }
        }
    }

    for (id, positions) in &overridden {
        let unbound = positions.iter().filter(|p| !bound.contains(*p)).count();
        if unbound > 0 {
            return Err(Test161Error::ScoringMismatch(format!(
                "{}: {} of {} instances of command {} left unbound",
                binding.id,
                unbound,
                positions.len(),
                id
            )));
        }
    }

    if binding.scoring == ScoringMethod::Partial && command_points != binding.points {
        return Err(Test161Error::ScoringMismatch(format!(
            "{}: command points sum to {}, test is worth {}",
            binding.id, command_points, binding.points
        )));
    }
    Ok(())
}

fn add_points(sum: u32, points: u32, owner: &str) -> Result<u32> {
    sum.checked_add(points).ok_or_else(|| {
        Test161Error::ScoringMismatch(format!("{}: points overflow", owner))
    })
}
