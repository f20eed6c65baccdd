//! Environment Integration Tests
//!
//! Loads the fixture test161 tree and checks discovery, target loading and
//! group construction end to end. Nothing here starts a simulator.

use rand::rngs::StdRng;
use rand::SeedableRng;
use std::path::PathBuf;
use std::sync::Arc;
use test161::{
    JobManager, NullPersistence, RunnerConfig, ScoringMethod, Test161Error, TestEnvironment,
};

fn fixture_dir() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("core-rs/tests/fixtures/test161")
}

fn load() -> TestEnvironment {
    TestEnvironment::load(
        &fixture_dir(),
        RunnerConfig::default(),
        Arc::new(NullPersistence),
        Arc::new(JobManager::new(1)),
    )
    .expect("fixture environment loads")
}

fn names(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}

#[test]
fn test_fixture_discovery() {
    let env = load();
    assert_eq!(env.tests.len(), 14);
    assert!(env.tests.get("threads/tt1.t").is_some());
    assert!(env.tests.get("sync/sy3.t").is_some());
    assert_eq!(env.tests.tags()["threads"].len(), 3);
    assert!(env.registry.contains("/testbin/add"));
    assert!(env.registry.contains("hangok"));
}

/// The newer of two same-named targets wins and carries its file hash
#[test]
fn test_target_versions_and_hash() {
    let env = load();
    let asst1 = &env.targets["asst1"];
    assert_eq!(asst1.version, 2);
    assert_eq!(asst1.points, 20);
    assert_eq!(asst1.file_name, "asst1.tt");
    assert_eq!(asst1.file_hash.len(), 64);
    assert!(asst1.file_hash.chars().all(|c| c.is_ascii_hexdigit()));
}

/// A glob dependency pulls in every matching test, transitively
#[test]
fn test_glob_dependencies_expand() {
    let env = load();
    let mut rng = StdRng::seed_from_u64(1);
    let group = env
        .group_from_names(&names(&["sync/sy3.t"]), true, false, &mut rng)
        .unwrap();

    let ids: Vec<&str> = group.tests.keys().map(String::as_str).collect();
    assert_eq!(
        ids,
        vec![
            "boot.t",
            "sync/sy2.t",
            "sync/sy3.t",
            "threads/tt1.t",
            "threads/tt2.t",
            "threads/tt3.t"
        ]
    );
    let sy3 = &group.tests["sync/sy3.t"];
    assert_eq!(sy3.expanded_deps.len(), 5);

    let order = group.graph().unwrap().topsort().unwrap();
    let pos = |id: &str| order.iter().position(|x| x == id).unwrap();
    assert!(pos("boot.t") < pos("threads/tt2.t"));
    assert!(pos("threads/tt3.t") < pos("sync/sy2.t"));
    assert!(pos("sync/sy2.t") < pos("sync/sy3.t"));
}

#[test]
fn test_without_deps_only_roots() {
    let env = load();
    let mut rng = StdRng::seed_from_u64(1);
    let group = env
        .group_from_names(&names(&["sync/sy3.t", "misc/*.t"]), false, false, &mut rng)
        .unwrap();
    assert_eq!(group.len(), 8);
    assert!(group.tests.values().all(|t| t.expanded_deps.is_empty()));
}

/// Target binding applies points, scoring and the memory-leak deduction
#[test]
fn test_shell_target_binding() {
    let env = load();
    let mut rng = StdRng::seed_from_u64(3);
    let group = env
        .group_from_names(&names(&["shell"]), true, false, &mut rng)
        .unwrap();

    let add = &group.tests["shell/add.t"];
    assert_eq!(add.scoring, ScoringMethod::Partial);
    assert_eq!(add.points_available, 6);
    let bound: Vec<u32> = add.body_commands().map(|c| c.points_available).collect();
    assert_eq!(bound, vec![3, 3, 0]);

    // Generated arguments feed the expected output
    let first = add.body_commands().next().unwrap();
    assert_eq!(first.input.args.len(), 2);
    let sum: i64 = first
        .input
        .args
        .iter()
        .map(|a| a.parse::<i64>().unwrap())
        .sum();
    assert_eq!(first.expected[0].text, sum.to_string());

    let leak = &group.tests["misc/leak.t"];
    assert_eq!(leak.mem_leak_points, 4);
    assert!(group.tests.contains_key("boot.t"));
    assert_eq!(group.tests["boot.t"].points_available, 0);
}

#[test]
fn test_unknown_specifier() {
    let env = load();
    let mut rng = StdRng::seed_from_u64(1);
    let err = env
        .group_from_names(&names(&["nope/*.t"]), false, false, &mut rng)
        .unwrap_err();
    assert!(matches!(err, Test161Error::DependencyUnresolved(_)));
}

/// Tags resolve to every tagged test
#[test]
fn test_tag_specifier() {
    let env = load();
    let mut rng = StdRng::seed_from_u64(1);
    let group = env
        .group_from_names(&names(&["locks"]), false, true, &mut rng)
        .unwrap();
    assert_eq!(group.tests.keys().collect::<Vec<_>>(), vec!["sync/sy2.t"]);
}
