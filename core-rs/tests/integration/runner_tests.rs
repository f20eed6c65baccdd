//! Runner Integration Tests
//!
//! Drives whole test runs against `fixtures/fake-sys161.sh`, a bash
//! stand-in for the simulator console. Telemetry is disabled unless a test
//! serves the metering socket itself with `fake_meter`.
//!
//! Uses tempfile for isolation - work directories are reclaimed per run

use rand::rngs::StdRng;
use rand::SeedableRng;
use std::fs;
use std::io::Write;
use std::os::unix::net::UnixListener;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use test161::{
    Entity, FieldMask, FilePersistence, GroupConfig, JobManager, MsgType, NullPersistence,
    PersistenceManager, RunnerConfig, StatusKind, Sys161Runner, Test, TestEnvironment, TestGroup,
    TestMap, TestResult, TestRunner,
};

fn fixtures() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("core-rs/tests/fixtures")
}

fn runner_config() -> RunnerConfig {
    RunnerConfig {
        sim_path: "bash".to_string(),
        sim_args: vec![fixtures()
            .join("fake-sys161.sh")
            .to_string_lossy()
            .into_owned()],
        telemetry: false,
        ..Default::default()
    }
}

fn load(persistence: Arc<dyn PersistenceManager>) -> TestEnvironment {
    let manager = Arc::new(JobManager::new(2));
    manager.start();
    TestEnvironment::load(
        &fixtures().join("test161"),
        runner_config(),
        persistence,
        manager,
    )
    .unwrap()
}

/// Instantiate one fixture test without its dependencies.
fn instance(env: &TestEnvironment, id: &str) -> Test {
    let mut rng = StdRng::seed_from_u64(11);
    let config = GroupConfig {
        name: id.to_string(),
        tests: vec![id.to_string()],
        ..Default::default()
    };
    let mut group = TestGroup::build(config, &env.tests, &env.registry, &mut rng).unwrap();
    group.tests.remove(id).unwrap()
}

fn run(id: &str) -> Test {
    let env = load(Arc::new(NullPersistence));
    let mut test = instance(&env, id);
    env.runner().run(&mut test).unwrap();
    test
}

fn command_ids(test: &Test) -> Vec<&str> {
    test.commands.iter().map(|c| c.id()).collect()
}

fn terminal(test: &Test) -> StatusKind {
    test.terminal_status().unwrap().status
}

#[test]
fn test_boot_and_shutdown() {
    let test = run("boot.t");
    assert_eq!(command_ids(&test), vec!["boot", "q"]);
    assert_eq!(terminal(&test), StatusKind::Shutdown);
    assert_eq!(test.result, TestResult::Correct);
    assert_eq!(test.status[0].status, StatusKind::Started);
    assert!(test.sim_conf.contains("31 mainboard ramsize=1M cpus=8"));
    assert!(test.start_time.is_some() && test.end_time.is_some());

    let boot = &test.commands[0];
    assert!(boot.output.iter().any(|l| l.line.contains("System/161")));
}

#[test]
fn test_kernel_command_output_recorded() {
    let test = run("threads/tt1.t");
    assert_eq!(command_ids(&test), vec!["boot", "tt1", "q"]);
    let tt1 = &test.commands[1];
    assert_eq!(tt1.output[0].line, "tt1");
    assert!(tt1.output.iter().any(|l| l.line == "tt1: SUCCESS"));
    assert_eq!(test.result, TestResult::Correct);
}

/// Shell commands are bracketed by `s` and `exit`
#[test]
fn test_shell_transitions() {
    let test = run("shell/add.t");
    assert_eq!(
        command_ids(&test),
        vec![
            "boot",
            "s",
            "/testbin/add",
            "/testbin/add",
            "exit",
            "/testbin/true",
            "q"
        ]
    );
    let fixed = &test.commands[3];
    assert!(fixed.output.iter().any(|l| l.line == "270"));
    assert_eq!(test.commands[5].input.prefix, "p");
    assert_eq!(test.result, TestResult::Correct);
}

#[test]
fn test_wrong_output_is_incorrect() {
    let test = run("misc/fail.t");
    assert_eq!(terminal(&test), StatusKind::Shutdown);
    assert_eq!(test.result, TestResult::Incorrect);
}

/// A permitted panic ends the run as a crash and still passes
#[test]
fn test_expected_panic() {
    let test = run("misc/panic.t");
    assert_eq!(terminal(&test), StatusKind::Crash);
    assert!(test.commands[1].panicked);
    assert_eq!(test.result, TestResult::Correct);
}

#[test]
fn test_unexpected_panic_aborts() {
    let test = run("misc/abort.t");
    assert_eq!(terminal(&test), StatusKind::Crash);
    assert_eq!(test.result, TestResult::Abort);
}

#[test]
fn test_prompt_timeout() {
    let test = run("misc/hang.t");
    let status = test.terminal_status().unwrap();
    assert_eq!(status.status, StatusKind::Timeout);
    assert_eq!(status.message, "no prompt for 1 s");
    assert!(test.commands[1].timed_out);
    assert_eq!(test.result, TestResult::Incorrect);
}

#[test]
fn test_tolerated_timeout() {
    let test = run("misc/hangok.t");
    assert_eq!(terminal(&test), StatusKind::Timeout);
    assert_eq!(test.result, TestResult::Correct);
}

/// Heap growth between the two khu probes is deducted
#[test]
fn test_memory_leak_deduction() {
    let env = load(Arc::new(NullPersistence));
    let mut test = instance(&env, "misc/leak.t");
    test.points_available = 10;
    test.mem_leak_points = 4;
    env.runner().run(&mut test).unwrap();

    assert_eq!(command_ids(&test), vec!["boot", "khu", "leak", "khu", "q"]);
    assert_eq!(test.mem_leak_bytes, 4096);
    assert_eq!(test.result, TestResult::Correct);
    assert_eq!(test.mem_leak_deducted, 4);
    assert_eq!(test.points_earned, 6);
}

#[test]
fn test_completion_is_persisted() {
    let dir = TempDir::new().unwrap();
    let persistence = Arc::new(FilePersistence::new(dir.path()).unwrap());
    let env = load(persistence);
    let mut test = instance(&env, "threads/tt2.t");
    env.runner().run(&mut test).unwrap();

    let snapshot = dir.path().join(format!("test-{}.json", test.id));
    let json: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(snapshot).unwrap()).unwrap();
    assert_eq!(json["result"], "correct");
    assert!(dir
        .path()
        .join(format!("test-{}-cmd-1.json", test.id))
        .exists());
}

#[test]
fn test_work_directory_reclaimed() {
    let base = TempDir::new().unwrap();
    let config = RunnerConfig {
        temp_dir: Some(base.path().to_path_buf()),
        ..runner_config()
    };
    let env = load(Arc::new(NullPersistence));
    let mut test = instance(&env, "boot.t");
    Sys161Runner::with_config(config).run(&mut test).unwrap();
    assert_eq!(test.result, TestResult::Correct);
    assert_eq!(fs::read_dir(base.path()).unwrap().count(), 0);
}

/// Runs the test with a metering socket served by `frame`, one frame
/// every 5 ms until the runner hangs up.
fn run_metered(mut test: Test, frame: fn(u64) -> String) -> Test {
    let base = TempDir::new().unwrap();
    let config = RunnerConfig {
        temp_dir: Some(base.path().to_path_buf()),
        telemetry: true,
        ..runner_config()
    };
    let meter = fake_meter(base.path().to_path_buf(), frame);
    Sys161Runner::with_config(config).run(&mut test).unwrap();
    assert!(meter.join().unwrap() > 0, "meter never connected");
    test
}

/// Serve `<workdir>/.sockets/meter` for the single run started under `base`.
fn fake_meter(base: PathBuf, frame: fn(u64) -> String) -> thread::JoinHandle<u64> {
    thread::spawn(move || {
        let deadline = Instant::now() + Duration::from_secs(20);
        let socket = loop {
            let sockets = fs::read_dir(&base).ok().and_then(|mut entries| {
                entries.find_map(|e| {
                    let dir = e.ok()?.path().join(".sockets");
                    dir.is_dir().then_some(dir)
                })
            });
            if let Some(dir) = sockets {
                break dir.join("meter");
            }
            if Instant::now() > deadline {
                return 0;
            }
            thread::sleep(Duration::from_millis(2));
        };

        let listener = UnixListener::bind(&socket).unwrap();
        listener.set_nonblocking(true).unwrap();
        let mut stream = loop {
            match listener.accept() {
                Ok((stream, _)) => break stream,
                Err(_) if Instant::now() < deadline => thread::sleep(Duration::from_millis(2)),
                Err(_) => return 0,
            }
        };
        stream.set_nonblocking(false).unwrap();

        let mut sent = 0;
        while Instant::now() < deadline {
            if stream.write_all(frame(sent + 1).as_bytes()).is_err() {
                break;
            }
            sent += 1;
            thread::sleep(Duration::from_millis(5));
        }
        sent
    })
}

fn idle_kernel(tick: u64) -> String {
    format!("DATA {} 0 {} 0 0 0 0 0 0 0 0\n", tick * 10, tick * 990)
}

fn user_in_kernel(tick: u64) -> String {
    format!("DATA {} {} {} 0 0 0 0 0 0 0 0\n", tick * 10, tick * 5, tick * 985)
}

/// Quiet telemetry paces the commands and is attributed to them
#[test]
fn test_telemetry_attributed_to_commands() {
    let env = load(Arc::new(NullPersistence));
    let test = run_metered(instance(&env, "threads/tt1.t"), idle_kernel);

    assert_eq!(command_ids(&test), vec!["boot", "tt1", "q"]);
    assert_eq!(terminal(&test), StatusKind::Shutdown);
    assert_eq!(test.result, TestResult::Correct);
    assert!(!test.commands[1].all_stats.is_empty());
}

/// User cycles while the kernel menu runs stop the test early
#[test]
fn test_monitor_stops_run() {
    let env = load(Arc::new(NullPersistence));
    let mut test = instance(&env, "threads/tt1.t");
    test.config.monitor.window = 1;
    let test = run_metered(test, user_in_kernel);

    let status = test.terminal_status().unwrap();
    assert_eq!(status.status, StatusKind::Monitor);
    assert_eq!(status.message, "non-zero user cycles during kernel operation");
    assert_eq!(test.result, TestResult::Incorrect);
}

/// A silent console trips the progress watchdog long before the prompt
/// timeout
#[test]
fn test_progress_watchdog() {
    let env = load(Arc::new(NullPersistence));
    let mut map = TestMap::new();
    map.insert(
        Test::parse(
            "stall.t",
            "---\nmisc:\n  prompttimeout: 60\nmonitor:\n  progresstimeout: 1\n---\nstall\n",
        )
        .unwrap(),
    );
    let config = GroupConfig {
        name: "stall".to_string(),
        tests: vec!["stall.t".to_string()],
        ..Default::default()
    };
    let mut rng = StdRng::seed_from_u64(11);
    let mut group = TestGroup::build(config, &map, &env.registry, &mut rng).unwrap();
    let mut test = group.tests.remove("stall.t").unwrap();

    let started = Instant::now();
    env.runner().run(&mut test).unwrap();
    assert!(started.elapsed() < Duration::from_secs(30));

    let status = test.terminal_status().unwrap();
    assert_eq!(status.status, StatusKind::Timeout);
    assert_eq!(status.message, "no progress for 1 s");
    assert!(test.commands[1].timed_out);
    assert_eq!(test.result, TestResult::Incorrect);
}

/// Records notifications as (entity, message type)
#[derive(Default)]
struct Recorder {
    events: Mutex<Vec<(String, MsgType)>>,
}

impl PersistenceManager for Recorder {
    fn notify(&self, entity: Entity<'_>, msg: MsgType, _fields: FieldMask) -> test161::Result<()> {
        let key = match entity {
            Entity::Test(t) => t.dependency_id.clone(),
            Entity::Command(_, c) => format!("cmd {}", c.id()),
            _ => "other".to_string(),
        };
        self.events.lock().unwrap().push((key, msg));
        Ok(())
    }
}

/// Tests and commands are announced before they complete
#[test]
fn test_lifecycle_notifications() {
    let recorder = Arc::new(Recorder::default());
    let env = load(recorder.clone());
    let mut test = instance(&env, "threads/tt1.t");
    env.runner().run(&mut test).unwrap();

    let events = recorder.events.lock().unwrap().clone();
    let expected: Vec<(String, MsgType)> = [
        ("threads/tt1.t", MsgType::Create),
        ("cmd boot", MsgType::Create),
        ("cmd boot", MsgType::Complete),
        ("cmd tt1", MsgType::Create),
        ("cmd tt1", MsgType::Complete),
        ("cmd q", MsgType::Create),
        ("cmd q", MsgType::Complete),
        ("threads/tt1.t", MsgType::Update),
        ("threads/tt1.t", MsgType::Complete),
    ]
    .iter()
    .map(|(k, m)| (k.to_string(), *m))
    .collect();
    assert_eq!(events, expected);
}
