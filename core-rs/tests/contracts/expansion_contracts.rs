// Expansion Contract Tests
//
// These tests pin down how templates, tests and targets are expanded before
// anything runs. Every failure here changes what a student's kernel is
// graded against.

use rand::rngs::StdRng;
use rand::SeedableRng;
use test161::expression::TemplateData;
use test161::runner::sys161;
use test161::test::{document, Sys161Conf};
use test161::{GroupConfig, Target, Test, Test161Error, TestGroup, TestMap, TemplateRegistry};

fn registry(yaml: &str) -> TemplateRegistry {
    let mut r = TemplateRegistry::new();
    r.load_str(yaml, "contract").unwrap();
    r
}

fn map(docs: &[(&str, &str)]) -> TestMap {
    let mut m = TestMap::new();
    for (id, text) in docs {
        m.insert(Test::parse(id, text).unwrap());
    }
    m
}

fn build(m: &TestMap, r: &TemplateRegistry, roots: &[&str]) -> test161::Result<TestGroup> {
    let config = GroupConfig {
        name: "contract".to_string(),
        use_deps: true,
        tests: roots.iter().map(|s| s.to_string()).collect(),
        ..Default::default()
    };
    TestGroup::build(config, m, r, &mut StdRng::seed_from_u64(0))
}

/// WHY: A template without declared output expects exactly "<name>: SUCCESS"
/// REASON: Kernel test programs print this line on success
/// BREAKS: Every test that relies on the implicit success line
#[test]
fn default_output_is_single_success_line() {
    let r = registry("templates:\n  - name: km1\n");
    let lines = r
        .expand("km1", &TemplateData::default(), &mut StdRng::seed_from_u64(0))
        .unwrap();
    assert_eq!(lines.len(), 1);
    assert_eq!(lines[0].text, "km1: SUCCESS");
    assert!(lines[0].trusted);
}

/// WHY: External references must not loop
/// BREAKS: Expansion would recurse forever on a -> b -> a
#[test]
fn template_cycle_is_reported_with_path() {
    let r = registry(
        "templates:\n  - name: a\n    output:\n      - {text: b, external: true}\n  - name: b\n    output:\n      - {text: a, external: true}\n",
    );
    match r.expand("a", &TemplateData::default(), &mut StdRng::seed_from_u64(0)) {
        Err(Test161Error::CycleInTemplateExpansion(path)) => assert_eq!(path, "a -> b -> a"),
        other => panic!("expected cycle, got {:?}", other),
    }
}

/// WHY: The same external template may appear twice side by side
/// REASON: Only a repeat on one expansion path is a cycle
#[test]
fn repeated_sibling_reference_is_not_a_cycle() {
    let r = registry(
        "templates:\n  - name: leaf\n  - name: pair\n    output:\n      - {text: leaf, external: true}\n      - {text: leaf, external: true}\n",
    );
    let lines = r
        .expand("pair", &TemplateData::default(), &mut StdRng::seed_from_u64(0))
        .unwrap();
    assert_eq!(lines.len(), 2);
}

/// WHY: Dependency cycles must be rejected before anything runs
/// BREAKS: The dependency runner would wait forever
#[test]
fn dependency_cycle_rejected() {
    let m = map(&[
        ("a.t", "---\ndepends: [b.t]\n---\na\n"),
        ("b.t", "---\ndepends: [a.t]\n---\nb\n"),
    ]);
    let err = build(&m, &TemplateRegistry::new(), &["a.t"]).unwrap_err();
    assert!(matches!(err, Test161Error::DependencyCycle(_)), "{:?}", err);
}

#[test]
fn unresolved_dependency_rejected() {
    let m = map(&[("a.t", "---\ndepends: [missing.t]\n---\na\n")]);
    let err = build(&m, &TemplateRegistry::new(), &["a.t"]).unwrap_err();
    assert!(matches!(err, Test161Error::DependencyUnresolved(_)), "{:?}", err);
}

const TARGET_MAP: &[(&str, &str)] = &[("t.t", "---\nname: t\n---\nsy1\nsy1\nsy2\n")];

fn target(tests: &str, points: u32) -> Target {
    let yaml = format!("name: c\nversion: 1\ntype: asst\npoints: {}\ntests:\n{}", points, tests);
    Target::parse(yaml.as_bytes(), "c.tt").unwrap()
}

fn bind(t: &Target) -> test161::Result<TestGroup> {
    t.instance(
        &map(TARGET_MAP),
        &TemplateRegistry::new(),
        &mut StdRng::seed_from_u64(0),
    )
}

/// WHY: Partial scoring must account for every point of the test
/// BREAKS: sum(command.points) != test.points makes grades unexplainable
#[test]
fn partial_points_must_sum() {
    let t = target(
        "  - id: t.t\n    scoring: partial\n    points: 10\n    commands:\n      - {id: sy1, index: 1, points: 4}\n",
        10,
    );
    assert!(matches!(bind(&t), Err(Test161Error::ScoringMismatch(_))));

    let ok = target(
        "  - id: t.t\n    scoring: partial\n    points: 10\n    commands:\n      - {id: sy1, points: 3}\n      - {id: sy2, points: 4}\n",
        10,
    );
    let group = bind(&ok).unwrap();
    let points: u32 = group.tests["t.t"]
        .body_commands()
        .map(|c| c.points_available)
        .sum();
    assert_eq!(points, 10);
}

/// WHY: Each command instance is scored at most once
#[test]
fn instance_bound_twice_rejected() {
    let t = target(
        "  - id: t.t\n    scoring: partial\n    points: 6\n    commands:\n      - {id: sy1, points: 2}\n      - {id: sy1, index: 2, points: 2}\n",
        6,
    );
    assert!(matches!(bind(&t), Err(Test161Error::ScoringMismatch(_))));
}

#[test]
fn bad_command_references_rejected() {
    let unknown = target(
        "  - id: t.t\n    points: 1\n    commands:\n      - {id: nope}\n",
        1,
    );
    assert!(matches!(bind(&unknown), Err(Test161Error::UnknownTemplate(_))));

    let out_of_range = target(
        "  - id: t.t\n    points: 1\n    commands:\n      - {id: sy2, index: 2}\n",
        1,
    );
    assert!(matches!(bind(&out_of_range), Err(Test161Error::InvalidCommand(_))));
}

/// WHY: Test points must add up to the target total
#[test]
fn target_total_must_match() {
    let t = target("  - id: t.t\n    points: 5\n", 6);
    assert!(matches!(bind(&t), Err(Test161Error::ScoringMismatch(_))));
}

/// WHY: Seeded runs must reproduce the same generated arguments
/// REASON: Reruns of a graded submission must see identical inputs
#[test]
fn seeded_generation_is_deterministic() {
    let r = registry("templates:\n  - name: /testbin/add\n    input:\n      - \"{{randInt 1 1000}} {{randInt 1 1000}}\"\n");
    let gen = |seed| {
        r.generate_args("/testbin/add", &mut StdRng::seed_from_u64(seed))
            .unwrap()
            .unwrap()
    };
    assert_eq!(gen(42), gen(42));
    assert_eq!(gen(42).len(), 2);
}

/// WHY: Serializing a parsed test and parsing it again changes nothing
#[test]
fn document_round_trip() {
    let text = "---\nname: Round\ntags: [a, b]\ndepends: [x.t]\nsys161:\n  cpus: 2\nmisc:\n  prompttimeout: 30.0\n---\nsy1\n$ /bin/true\n";
    let first = Test::parse("r.t", text).unwrap();
    let second = Test::parse("r.t", &first.to_document().unwrap()).unwrap();
    assert_eq!(first.name, second.name);
    assert_eq!(first.tags, second.tags);
    assert_eq!(first.depends, second.depends);
    assert_eq!(first.body, second.body);
    assert_eq!(first.config, second.config);
    assert_eq!(document::parse(text, "r.t").unwrap().front.sys161.cpus, 2);
}

/// WHY: Disabled disks leave no line in sys161.conf
/// FORMAT: positional slots 0,1,(2,3),28,29,30,31
#[test]
fn simulator_conf_suppresses_empty_lines() {
    let conf = Sys161Conf::default();
    let text = sys161::conf_string(&conf, 7);
    assert_eq!(
        text,
        "0 serial\n1 emufs\n28 random seed=7\n29 timer\n30 trace\n31 mainboard ramsize=1M cpus=8\n"
    );
}
