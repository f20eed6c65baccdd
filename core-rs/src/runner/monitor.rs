//! Telemetry monitor
//!
//! Reads the simulator's metering socket, turns cumulative counter records
//! into per-tick deltas stamped with simulator time, attributes them to the
//! current command, and evaluates the liveness predicates over a sliding
//! window. A violation sets the test's terminal status and kills the
//! simulator.

use super::RunShared;
use crate::errors::{Result, Test161Error};
use crate::stats::{parse_meter_line, Counters, MeterRecord, Stat};
use crate::test::{MonitorConf, StatusKind};
use std::collections::VecDeque;
use std::io::{ErrorKind, Read, Write};
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, trace, warn};

/// Simulator clock assumed until the socket announces one
pub const DEFAULT_HZ: u64 = 25_000_000;

const CONNECT_RETRY: Duration = Duration::from_millis(20);
const READ_TIMEOUT: Duration = Duration::from_millis(100);

/// Telemetry settings for one run
#[derive(Debug, Clone)]
pub struct MeterConf {
    pub socket: PathBuf,
    /// Metering interval in simulated seconds
    pub interval: f64,
    /// Ticks per recorded per-interval sample
    pub stat_window: u32,
    pub cpus: u32,
    pub monitor: MonitorConf,
}

/// The last `size` samples of one command
#[derive(Debug)]
struct Window {
    size: usize,
    command: Option<usize>,
    samples: VecDeque<Counters>,
}

impl Window {
    fn new(size: u32) -> Self {
        let size = size.max(1) as usize;
        Self {
            size,
            command: None,
            samples: VecDeque::with_capacity(size),
        }
    }

    /// Add a sample; returns the aggregate once the window is full.
    fn push(&mut self, command: usize, sample: Counters) -> Option<Counters> {
        if self.command != Some(command) {
            self.samples.clear();
            self.command = Some(command);
        }
        if self.samples.len() == self.size {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
        if self.samples.len() < self.size {
            return None;
        }
        Some(
            self.samples
                .iter()
                .fold(Counters::default(), |acc, s| acc.add(s)),
        )
    }
}

/// Evaluate the monitor predicates over an aggregate window.
pub fn evaluate(window: &Counters, userland: bool, conf: &MonitorConf) -> Result<()> {
    match violation(window, userland, conf) {
        Some(reason) => Err(Test161Error::MonitorViolation(reason.to_string())),
        None => Ok(()),
    }
}

fn violation(window: &Counters, userland: bool, conf: &MonitorConf) -> Option<&'static str> {
    let total = window.total_cycles();
    if total == 0 {
        return None;
    }
    let kernel = window.kern_cycles as f64 / total as f64;
    let user = window.user_cycles as f64 / total as f64;

    if !userland && window.user_cycles > 0 {
        return Some("non-zero user cycles during kernel operation");
    }
    if conf.kernel.enablemin && kernel < conf.kernel.min {
        return Some("insufficient kernel cycles (potential deadlock)");
    }
    if kernel > conf.kernel.max {
        return Some("too many kernel cycles (potential livelock)");
    }
    if userland && conf.user.enablemin && user < conf.user.min {
        return Some("insufficient user cycles");
    }
    if userland && user > conf.user.max {
        return Some("too many user cycles");
    }
    None
}

/// Accumulates cumulative readings into stamped deltas
#[derive(Debug)]
struct Meter {
    hz: u64,
    cpus: u32,
    last: Counters,
    cycles: u64,
    prev_end: f64,
}

impl Meter {
    fn new(cpus: u32) -> Self {
        Self {
            hz: DEFAULT_HZ,
            cpus: cpus.max(1),
            last: Counters::default(),
            cycles: 0,
            prev_end: 0.0,
        }
    }

    fn tick(&mut self, reading: Counters) -> Stat {
        let delta = reading.sub(&self.last);
        self.last = reading;
        self.cycles += delta.total_cycles();
        let end = self.cycles as f64 / (self.hz as f64 * f64::from(self.cpus));
        let stat = Stat {
            start: self.prev_end,
            end,
            length: end - self.prev_end,
            counters: delta,
        };
        self.prev_end = end;
        stat
    }
}

/// Monitor thread body. Returns when the socket closes or the run ends.
pub(crate) fn run(shared: Arc<RunShared>, conf: MeterConf) {
    let stream = loop {
        if shared.lock().finished {
            return;
        }
        match UnixStream::connect(&conf.socket) {
            Ok(s) => break s,
            Err(_) => thread::sleep(CONNECT_RETRY),
        }
    };
    debug!(socket = %conf.socket.display(), "telemetry connected");

    if let Err(e) = setup(&stream, conf.interval) {
        fail(&shared, format!("meter setup: {}", e));
        return;
    }

    let mut stream = stream;
    let mut meter = Meter::new(conf.cpus);
    let mut window = Window::new(conf.monitor.window);
    let mut buf = [0u8; 4096];
    let mut line = Vec::new();

    loop {
        match stream.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                for &b in &buf[..n] {
                    if b != b'\n' {
                        line.push(b);
                        continue;
                    }
                    let text = String::from_utf8_lossy(&line).into_owned();
                    line.clear();
                    handle_line(&shared, &conf, &mut meter, &mut window, &text);
                }
                if shared.lock().finished {
                    break;
                }
            }
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                if shared.lock().finished {
                    break;
                }
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => {
                if shared.lock().finished {
                    break;
                }
                fail(&shared, e.to_string());
                return;
            }
        }
    }

    shared.lock().telemetry_done = true;
    shared.tick.notify_all();
    debug!("telemetry closed");
}

fn setup(stream: &UnixStream, interval: f64) -> std::io::Result<()> {
    stream.set_read_timeout(Some(READ_TIMEOUT))?;
    let ns = (interval * 1e9).round().max(1.0) as u64;
    let mut writer = stream;
    writer.write_all(format!("INTERVAL {}\n", ns).as_bytes())
}

fn fail(shared: &RunShared, msg: String) {
    warn!(error = %msg, "telemetry failed");
    let mut st = shared.lock();
    if st.test.terminal_status().is_none() {
        st.telemetry_error = Some(msg);
    }
    st.telemetry_done = true;
    drop(st);
    shared.tick.notify_all();
}

fn handle_line(
    shared: &RunShared,
    conf: &MeterConf,
    meter: &mut Meter,
    window: &mut Window,
    line: &str,
) {
    let reading = match parse_meter_line(line) {
        Some(MeterRecord::Hz(hz)) => {
            meter.hz = hz;
            return;
        }
        Some(MeterRecord::Data(c)) => c,
        None => {
            trace!(line, "skipping meter record");
            return;
        }
    };

    let stat = meter.tick(reading);
    let mut st = shared.lock();
    st.sim_time = stat.end;

    if let Some(idx) = st.current {
        st.test.commands[idx].add_stat(&stat, conf.stat_window);

        if conf.monitor.enabled {
            if let Some(agg) = window.push(idx, stat.counters) {
                let userland = st.test.commands[idx].runs_userland();
                if let Err(Test161Error::MonitorViolation(msg)) =
                    evaluate(&agg, userland, &conf.monitor)
                {
                    if st.current == Some(idx)
                        && st.test.set_terminal(StatusKind::Monitor, &msg, stat.end)
                    {
                        warn!(test = %st.test.dependency_id, command = %st.test.commands[idx].id(), reason = %msg, "monitor violation");
                        shared.killer.kill();
                    }
                }
            }
        }
    }

    st.ticks += 1;
    drop(st);
    shared.tick.notify_all();
}
