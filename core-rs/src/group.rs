//! Test discovery and group building
//!
//! A [`TestMap`] indexes every test document under the tests directory by
//! dependency id (its relative path) and by tag. Specifiers name tests by
//! exact path, by doublestar glob, or by tag; groups are built from a set of
//! root specifiers and, when dependencies are enabled, their transitive
//! closure.

use crate::errors::{Result, Test161Error};
use crate::graph::Graph;
use crate::template::TemplateRegistry;
use crate::test::{Test, TEST_FILE_EXT};
use globset::GlobBuilder;
use rand::rngs::StdRng;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;
use tracing::{debug, info};
use uuid::Uuid;
use walkdir::WalkDir;

/// All known tests, indexed by id and tag
#[derive(Debug, Clone, Default)]
pub struct TestMap {
    tests: BTreeMap<String, Test>,
    tags: BTreeMap<String, BTreeSet<String>>,
}

fn is_glob(spec: &str) -> bool {
    spec.contains(|c: char| matches!(c, '*' | '?' | '[' | '{'))
}

impl TestMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Discover and parse every `*.t` file below `dir`. Parse failures are
    /// collected into one batch error.
    pub fn load_dir(dir: &Path) -> Result<Self> {
        if !dir.exists() {
            return Err(Test161Error::ConfigParse(format!(
                "tests directory not found: {}",
                dir.display()
            )));
        }

        let mut map = Self::new();
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
                || path.extension().and_then(|e| e.to_str()) != Some(TEST_FILE_EXT)
            {
                continue;
            }

            let id = match path.strip_prefix(dir) {
                Ok(rel) => rel
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/"),
                Err(_) => continue,
            };

            let parsed = fs::read_to_string(path)
                .map_err(Test161Error::from)
                .and_then(|text| Test::parse(&id, &text));
            match parsed {
                Ok(test) => {
                    debug!(test = %id, "discovered test");
                    map.insert(test);
                }
                Err(e) => errors.push(e),
            }
        }

        Test161Error::from_batch(errors)?;
        info!(count = map.len(), dir = %dir.display(), "loaded tests");
        Ok(map)
    }

    pub fn insert(&mut self, test: Test) {
        for tag in &test.tags {
            self.tags
                .entry(tag.clone())
                .or_default()
                .insert(test.dependency_id.clone());
        }
        self.tests.insert(test.dependency_id.clone(), test);
    }

    pub fn get(&self, id: &str) -> Option<&Test> {
        self.tests.get(id)
    }

    pub fn len(&self) -> usize {
        self.tests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tests.is_empty()
    }

    pub fn tests(&self) -> impl Iterator<Item = &Test> {
        self.tests.values()
    }

    pub fn tags(&self) -> &BTreeMap<String, BTreeSet<String>> {
        &self.tags
    }

    /// Resolve one specifier to test ids.
    ///
    /// Exact paths win over globs, globs over tags. With `force_tags` the
    /// specifier is tried as a tag first.
    pub fn resolve(&self, spec: &str, force_tags: bool) -> Result<BTreeSet<String>> {
        let spec = spec.trim();
        if force_tags {
            if let Some(ids) = self.tags.get(spec) {
                return Ok(ids.clone());
            }
        }

        if self.tests.contains_key(spec) {
            return Ok(BTreeSet::from([spec.to_string()]));
        }

        if is_glob(spec) {
            let matcher = GlobBuilder::new(spec)
                .literal_separator(true)
                .build()?
                .compile_matcher();
            let ids: BTreeSet<String> = self
                .tests
                .keys()
                .filter(|id| matcher.is_match(id.as_str()))
                .cloned()
                .collect();
            if !ids.is_empty() {
                return Ok(ids);
            }
        }

        if let Some(ids) = self.tags.get(spec) {
            return Ok(ids.clone());
        }

        Err(Test161Error::DependencyUnresolved(spec.to_string()))
    }

    /// Direct dependencies of one test, resolved.
    pub fn direct_deps(&self, id: &str) -> Result<BTreeSet<String>> {
        let test = self
            .tests
            .get(id)
            .ok_or_else(|| Test161Error::DependencyUnresolved(id.to_string()))?;
        let mut deps = BTreeSet::new();
        let mut errors = Vec::new();
        for spec in &test.depends {
            match self.resolve(spec, false) {
                Ok(ids) => deps.extend(ids),
                Err(_) => errors.push(Test161Error::DependencyUnresolved(format!(
                    "{} (required by {})",
                    spec, id
                ))),
            }
        }
        Test161Error::from_batch(errors)?;
        Ok(deps)
    }

    /// Transitive dependencies of one test. A test reachable from itself is
    /// included, which later surfaces as a dependency cycle.
    pub fn expand_deps(&self, id: &str) -> Result<BTreeSet<String>> {
        let mut seen = BTreeSet::new();
        let mut stack: Vec<String> = self.direct_deps(id)?.into_iter().collect();
        while let Some(next) = stack.pop() {
            if !seen.insert(next.clone()) {
                continue;
            }
            for dep in self.direct_deps(&next)? {
                if !seen.contains(&dep) {
                    stack.push(dep);
                }
            }
        }
        Ok(seen)
    }
}

/// How to build a group
#[derive(Debug, Clone, Default)]
pub struct GroupConfig {
    pub name: String,
    pub use_deps: bool,
    /// Root specifiers: paths, globs or tags
    pub tests: Vec<String>,
    /// Interpret specifiers as tags before paths
    pub force_tags: bool,
}

/// A runnable set of instantiated tests keyed by dependency id
#[derive(Debug, Clone)]
pub struct TestGroup {
    pub id: Uuid,
    pub config: GroupConfig,
    pub tests: BTreeMap<String, Test>,
}

impl TestGroup {
    /// Resolve the roots, close over dependencies when enabled, and
    /// instantiate a fresh copy of every member test.
    pub fn build(
        config: GroupConfig,
        map: &TestMap,
        registry: &TemplateRegistry,
        rng: &mut StdRng,
    ) -> Result<Self> {
        let mut errors = Vec::new();
        let mut roots = BTreeSet::new();
        for spec in &config.tests {
            match map.resolve(spec, config.force_tags) {
                Ok(ids) => roots.extend(ids),
                Err(e) => errors.push(e),
            }
        }
        Test161Error::from_batch(errors)?;

        let mut expanded: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        let mut members = roots.clone();
        if config.use_deps {
            let mut errors = Vec::new();
            for id in &roots {
                match map.expand_deps(id) {
                    Ok(deps) => {
                        members.extend(deps.iter().cloned());
                    }
                    Err(e) => errors.push(e),
                }
            }
            Test161Error::from_batch(errors)?;
            for id in &members {
                expanded.insert(id.clone(), map.expand_deps(id)?);
            }
        }

        let mut tests = BTreeMap::new();
        let mut errors = Vec::new();
        for id in &members {
            let Some(proto) = map.get(id) else {
                errors.push(Test161Error::DependencyUnresolved(id.clone()));
                continue;
            };
            let mut test = proto.clone();
            test.id = Uuid::new_v4();
            test.expanded_deps = expanded
                .get(id)
                .map(|d| d.iter().cloned().collect())
                .unwrap_or_default();
            if let Err(e) = test.instantiate(registry, rng) {
                errors.push(e);
                continue;
            }
            tests.insert(id.clone(), test);
        }
        Test161Error::from_batch(errors)?;

        let group = Self {
            id: Uuid::new_v4(),
            config,
            tests,
        };
        if group.config.use_deps {
            group.graph()?.topsort()?;
        }
        debug!(group = %group.config.name, tests = group.tests.len(), "built test group");
        Ok(group)
    }

    /// Dependency graph over the members: an edge `dep -> test` for every
    /// expanded dependency that is part of the group.
    pub fn graph(&self) -> Result<Graph<String>> {
        let mut graph = Graph::new();
        for id in self.tests.keys() {
            graph.add_node(id, id.clone());
        }
        for (id, test) in &self.tests {
            for dep in &test.expanded_deps {
                if self.tests.contains_key(dep) {
                    graph.add_edge(dep, id)?;
                }
            }
        }
        Ok(graph)
    }

    pub fn len(&self) -> usize {
        self.tests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tests.is_empty()
    }

    /// Available and earned points over all members. Binding rejects
    /// overflowing targets, so saturation only guards hand-built groups.
    pub fn total_points(&self) -> (u32, u32) {
        self.tests.values().fold((0, 0), |(avail, earned), t| {
            (
                avail.saturating_add(t.points_available),
                earned.saturating_add(t.points_earned),
            )
        })
    }
}
