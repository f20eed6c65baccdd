//! Lifecycle notification sinks
//!
//! Runners call [`PersistenceManager::notify`] synchronously whenever a test,
//! command, group or build is created, updated or completed. Sinks must
//! return quickly.

use crate::builder::{BuildCommand, BuildTest};
use crate::errors::{Result, Test161Error};
use crate::group::TestGroup;
use crate::test::{Command, Test};
use serde_json::json;
use std::fs;
use std::ops::BitOr;
use std::path::{Path, PathBuf};
use tracing::trace;

/// The object a notification is about
#[derive(Debug, Clone, Copy)]
pub enum Entity<'a> {
    Test(&'a Test),
    Command(&'a Test, &'a Command),
    Group(&'a TestGroup),
    Build(&'a BuildTest),
    BuildCommand(&'a BuildTest, &'a BuildCommand),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsgType {
    Create,
    Update,
    Complete,
}

/// Which fields changed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FieldMask(u8);

impl FieldMask {
    pub const NONE: FieldMask = FieldMask(0);
    pub const STATUS: FieldMask = FieldMask(1);
    pub const SCORE: FieldMask = FieldMask(1 << 1);
    pub const OUTPUT: FieldMask = FieldMask(1 << 2);
    pub const STATUSES: FieldMask = FieldMask(1 << 3);
    pub const ALL: FieldMask = FieldMask(0b1111);

    pub fn contains(&self, other: FieldMask) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for FieldMask {
    type Output = FieldMask;

    fn bitor(self, rhs: FieldMask) -> FieldMask {
        FieldMask(self.0 | rhs.0)
    }
}

/// A sink for lifecycle notifications
pub trait PersistenceManager: Send + Sync {
    fn notify(&self, entity: Entity<'_>, msg: MsgType, fields: FieldMask) -> Result<()>;
}

/// Discards every notification
#[derive(Debug, Default, Clone, Copy)]
pub struct NullPersistence;

impl PersistenceManager for NullPersistence {
    fn notify(&self, _entity: Entity<'_>, _msg: MsgType, _fields: FieldMask) -> Result<()> {
        Ok(())
    }
}

/// Writes one JSON snapshot per entity under a directory, overwriting it on
/// each notification
#[derive(Debug, Clone)]
pub struct FilePersistence {
    dir: PathBuf,
}

impl FilePersistence {
    pub fn new(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir).map_err(|e| {
            Test161Error::PersistenceError(format!("{}: {}", dir.display(), e))
        })?;
        Ok(Self {
            dir: dir.to_path_buf(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn snapshot(entity: Entity<'_>) -> Result<(String, serde_json::Value)> {
        Ok(match entity {
            Entity::Test(t) => (format!("test-{}", t.id), serde_json::to_value(t)?),
            Entity::Command(t, c) => (
                format!("test-{}-cmd-{}", t.id, c.seq),
                serde_json::to_value(c)?,
            ),
            Entity::Group(g) => (
                format!("group-{}", g.id),
                json!({
                    "id": g.id,
                    "name": g.config.name,
                    "tests": g.tests.values().map(|t| json!({
                        "id": t.id,
                        "dependency_id": t.dependency_id,
                        "result": t.result,
                        "points_available": t.points_available,
                        "points_earned": t.points_earned,
                    })).collect::<Vec<_>>(),
                }),
            ),
            Entity::Build(b) => (format!("build-{}", b.id), serde_json::to_value(b)?),
            Entity::BuildCommand(b, c) => (
                format!("build-{}-cmd-{}", b.id, c.seq),
                serde_json::to_value(c)?,
            ),
        })
    }
}

impl PersistenceManager for FilePersistence {
    fn notify(&self, entity: Entity<'_>, msg: MsgType, fields: FieldMask) -> Result<()> {
        let (name, value) = Self::snapshot(entity)?;
        let path = self.dir.join(format!("{}.json", name));
        let bytes = serde_json::to_vec_pretty(&value)?;
        fs::write(&path, bytes)
            .map_err(|e| Test161Error::PersistenceError(format!("{}: {}", path.display(), e)))?;
        trace!(file = %path.display(), ?msg, mask = fields.0, "persisted snapshot");
        Ok(())
    }
}
