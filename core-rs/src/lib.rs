//! # test161
//!
//! Automated evaluation of instructional operating-system kernels running
//! under the sys161 machine simulator.
//!
//! A client builds a *group* of tests, either from test specifiers or by
//! instantiating a *target*, and hands it to a group runner. Group runners
//! submit test jobs to the shared job manager; each admitted job is driven
//! through a fresh simulator by the test runner, which records console
//! output and telemetry, enforces liveness limits, and scores the result.
//!
//! ## Layout
//!
//! ```text
//! test161/
//!   commands/   command templates (*.tc)
//!   tests/      test documents (*.t)
//!   targets/    graded targets (*.tt)
//! ```
//!
//! ## Flow
//!
//! ```text
//!  names ──► TestEnvironment ──► TestGroup ──► GroupRunner
//!                                                  │
//!                                                  ▼
//!                        JobManager ◄── Job ── (per test)
//!                            │
//!                            ▼
//!                      Sys161Runner ──► sys161 (pty + meter socket)
//!                            │
//!                            ▼
//!                     scoring ──► PersistenceManager
//! ```

pub mod errors;
pub mod graph;
pub mod expression;
pub mod template;
pub mod stats;
pub mod test;
pub mod group;
pub mod target;
pub mod scoring;
pub mod manager;
pub mod runner;
pub mod group_runner;
pub mod persistence;
pub mod builder;
pub mod config;
pub mod environment;

pub use errors::{Result, Test161Error};
pub use graph::Graph;
pub use template::{CommandTemplate, Policy, TemplateRegistry};
pub use test::{Command, Environment, ScoringMethod, StatusKind, Test, TestConfig, TestResult};
pub use group::{GroupConfig, TestGroup, TestMap};
pub use target::{Target, TargetType};
pub use manager::{Job, JobManager, JobResult, ManagerStats};
pub use runner::{RunnerConfig, Sys161Runner, TestRunner};
pub use group_runner::{DependencyRunner, GroupRunner, SimpleRunner};
pub use persistence::{Entity, FieldMask, FilePersistence, MsgType, NullPersistence, PersistenceManager};
pub use builder::{BuildConf, BuildTest};
pub use config::ClientConfig;
pub use environment::{GroupReport, ReportRow, TestEnvironment};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
