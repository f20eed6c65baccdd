//! Error types for test161

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Test161Error {
    #[error("Config parse error: {0}")]
    ConfigParse(String),

    #[error("Cycle in template expansion: {0}")]
    CycleInTemplateExpansion(String),

    #[error("Unknown template: {0}")]
    UnknownTemplate(String),

    #[error("Dependency unresolved: {0}")]
    DependencyUnresolved(String),

    #[error("Dependency cycle: {0}")]
    DependencyCycle(String),

    #[error("Scoring mismatch: {0}")]
    ScoringMismatch(String),

    #[error("Build failed: {0}")]
    BuildFailed(String),

    #[error("Simulator spawn failed: {0}")]
    SimulatorSpawnFailed(String),

    #[error("no prompt for {0} s")]
    PromptTimeout(f64),

    #[error("no progress for {0} s")]
    ProgressTimeout(f64),

    #[error("Monitor violation: {0}")]
    MonitorViolation(String),

    #[error("Simulator crashed: {0}")]
    SimulatorCrashed(String),

    #[error("Telemetry IO error: {0}")]
    TelemetryIOError(String),

    #[error("Persistence error: {0}")]
    PersistenceError(String),

    #[error("Expression error: {0}")]
    Expression(String),

    #[error("Invalid command: {0}")]
    InvalidCommand(String),

    #[error("Job manager stopped")]
    ManagerStopped,

    #[error("{} errors: {}", .0.len(), join_errors(.0))]
    Batch(Vec<Test161Error>),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Glob error: {0}")]
    Glob(#[from] globset::Error),
}

impl Test161Error {
    /// Collapse a list of errors: none is `Ok`, one is returned as is,
    /// several become a `Batch`.
    pub fn from_batch(mut errors: Vec<Test161Error>) -> Result<()> {
        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(Test161Error::Batch(errors)),
        }
    }
}

fn join_errors(errors: &[Test161Error]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

pub type Result<T> = std::result::Result<T, Test161Error>;
