//! Tests: a parsed document plus everything a run records about it.


pub use command::{tokenize, Command, CommandStatus, Environment, InputLine, OutputLine};
pub use config::{DiskConf, Limits, MiscConf, MonitorConf, StatConf, Sys161Conf, TestConfig};
pub use document::{Document, FrontMatter};

use crate::errors::{Result, Test161Error};
use crate::template::TemplateRegistry;
use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Extension of test documents
pub const TEST_FILE_EXT: &str = "t";

/// Final verdict of a test
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TestResult {
    #[default]
    None,
    Correct,
    Incorrect,
    Skip,
    Abort,
}

impl TestResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            TestResult::None => "none",
            TestResult::Correct => "correct",
            TestResult::Incorrect => "incorrect",
            TestResult::Skip => "skip",
            TestResult::Abort => "abort",
        }
    }
}

impl std::fmt::Display for TestResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ScoringMethod {
    #[default]
    Entire,
    Partial,
}

/// Status labels recorded in a test's history
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusKind {
    Started,
    Shutdown,
    Crash,
    Timeout,
    Monitor,
    Skipped,
}

impl StatusKind {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, StatusKind::Started)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StatusKind::Started => "started",
            StatusKind::Shutdown => "shutdown",
            StatusKind::Crash => "crash",
            StatusKind::Timeout => "timeout",
            StatusKind::Monitor => "monitor",
            StatusKind::Skipped => "skipped",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestStatus {
    pub simtime: f64,
    pub status: StatusKind,
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub message: String,
}

/// A test and its run state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Test {
    pub id: Uuid,
    /// Path relative to the tests directory, e.g. `threads/tt1.t`
    pub dependency_id: String,
    pub name: String,
    pub description: String,
    pub tags: Vec<String>,
    pub depends: Vec<String>,
    pub body: Vec<String>,
    pub config: TestConfig,

    /// Transitive closure of `depends`, as dependency ids
    pub expanded_deps: Vec<String>,
    pub sim_conf: String,
    pub commands: Vec<Command>,
    pub status: Vec<TestStatus>,
    pub result: TestResult,

    pub scoring: ScoringMethod,
    pub points_available: u32,
    pub points_earned: u32,
    pub mem_leak_bytes: i64,
    pub mem_leak_points: u32,
    pub mem_leak_deducted: u32,

    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
}

impl Test {
    /// Parse a test document. `dependency_id` is its path below the tests
    /// directory.
    pub fn parse(dependency_id: &str, text: &str) -> Result<Self> {
        let doc = document::parse(text, dependency_id)?;
        Ok(Self::from_document(dependency_id, doc))
    }

    pub fn from_document(dependency_id: &str, doc: Document) -> Self {
        let config = doc.front.config();
        let name = if doc.front.name.is_empty() {
            dependency_id.to_string()
        } else {
            doc.front.name
        };
        Self {
            id: Uuid::new_v4(),
            dependency_id: dependency_id.to_string(),
            name,
            description: doc.front.description,
            tags: doc.front.tags,
            depends: doc.front.depends,
            body: doc.body,
            config,
            expanded_deps: Vec::new(),
            sim_conf: String::new(),
            commands: Vec::new(),
            status: Vec::new(),
            result: TestResult::None,
            scoring: ScoringMethod::Entire,
            points_available: 0,
            points_earned: 0,
            mem_leak_bytes: 0,
            mem_leak_points: 0,
            mem_leak_deducted: 0,
            start_time: None,
            end_time: None,
        }
    }

    pub fn to_document(&self) -> Result<String> {
        document::render(&Document {
            front: FrontMatter {
                name: self.name.clone(),
                description: self.description.clone(),
                tags: self.tags.clone(),
                depends: self.depends.clone(),
                sys161: self.config.sys161.clone(),
                stat: self.config.stat.clone(),
                monitor: self.config.monitor.clone(),
                misc: self.config.misc.clone(),
            },
            body: self.body.clone(),
        })
    }

    /// Expand every body line into a command instance. Expansion errors are
    /// collected rather than stopping at the first.
    pub fn instantiate(&mut self, registry: &TemplateRegistry, rng: &mut StdRng) -> Result<()> {
        let mut commands = Vec::with_capacity(self.body.len());
        let mut errors = Vec::new();
        for (seq, line) in self.body.iter().enumerate() {
            match Command::from_body_line(seq, line, registry, rng) {
                Ok(cmd) => commands.push(cmd),
                Err(e) => errors.push(Test161Error::InvalidCommand(format!(
                    "{}: line {:?}: {}",
                    self.dependency_id, line, e
                ))),
            }
        }
        Test161Error::from_batch(errors)?;
        self.commands = commands;
        Ok(())
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t == tag)
    }

    /// Record a non-terminal status entry.
    pub fn add_status(&mut self, status: StatusKind, message: &str, simtime: f64) {
        self.status.push(TestStatus {
            simtime,
            status,
            message: message.to_string(),
        });
    }

    /// The terminal status, if one has been set.
    pub fn terminal_status(&self) -> Option<&TestStatus> {
        self.status.iter().find(|s| s.status.is_terminal())
    }

    /// Set the terminal status unless one is already present. Returns
    /// whether this call won.
    pub fn set_terminal(&mut self, status: StatusKind, message: &str, simtime: f64) -> bool {
        if self.terminal_status().is_some() {
            return false;
        }
        self.add_status(status, message, simtime);
        true
    }

    /// Mark a test skipped without running it.
    pub fn skip(&mut self, message: &str) {
        self.set_terminal(StatusKind::Skipped, message, 0.0);
        self.result = TestResult::Skip;
        self.points_earned = 0;
    }

    /// Commands that came from the body (not runner-generated).
    pub fn body_commands(&self) -> impl Iterator<Item = &Command> {
        self.commands.iter().filter(|c| !c.synthetic)
    }
}

impl PartialEq for Test {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    const DOC: &str = "---\nname: Thread Test 1\ntags: [threads]\ndepends: [boot.t]\n---\ntt1\n$ /bin/true\n";

    #[test]
    fn test_parse_sets_identity() {
        let t = Test::parse("threads/tt1.t", DOC).unwrap();
        assert_eq!(t.dependency_id, "threads/tt1.t");
        assert_eq!(t.name, "Thread Test 1");
        assert!(t.has_tag("threads"));
        assert_eq!(t.body.len(), 2);
        assert_eq!(t.result, TestResult::None);
    }

    #[test]
    fn test_unnamed_test_uses_path() {
        let t = Test::parse("misc/x.t", "boot\n").unwrap();
        assert_eq!(t.name, "misc/x.t");
    }

    #[test]
    fn test_to_document_round_trip() {
        let t = Test::parse("threads/tt1.t", DOC).unwrap();
        let again = Test::parse("threads/tt1.t", &t.to_document().unwrap()).unwrap();
        assert_eq!(again.name, t.name);
        assert_eq!(again.tags, t.tags);
        assert_eq!(again.depends, t.depends);
        assert_eq!(again.body, t.body);
        assert_eq!(again.config, t.config);
    }

    /// Only the first terminal status is kept
    #[test]
    fn test_terminal_status_set_once() {
        let mut t = Test::parse("a.t", "boot\n").unwrap();
        t.add_status(StatusKind::Started, "", 0.0);
        assert!(t.set_terminal(StatusKind::Monitor, "too many kernel cycles", 1.0));
        assert!(!t.set_terminal(StatusKind::Timeout, "no prompt", 2.0));
        let term = t.terminal_status().unwrap();
        assert_eq!(term.status, StatusKind::Monitor);
        assert_eq!(t.status.len(), 2);
    }

    #[test]
    fn test_instantiate_collects_errors() {
        let mut t = Test::parse("a.t", "tt1\nbad 'quote\nworse \"quote\n").unwrap();
        let mut rng = StdRng::seed_from_u64(0);
        match t.instantiate(&TemplateRegistry::new(), &mut rng) {
            Err(Test161Error::Batch(errs)) => assert_eq!(errs.len(), 2),
            other => panic!("Expected batch, got {:?}", other),
        }
    }

    #[test]
    fn test_instantiate_builds_commands() {
        let mut t = Test::parse("threads/tt1.t", DOC).unwrap();
        let mut rng = StdRng::seed_from_u64(0);
        t.instantiate(&TemplateRegistry::new(), &mut rng).unwrap();
        assert_eq!(t.commands.len(), 2);
        assert_eq!(t.commands[1].env, Environment::Shell);
        assert_eq!(t.commands[1].expected[0].text, "/bin/true: SUCCESS");
    }
}
