//! Simulator telemetry samples
//!
//! The simulator's metering socket emits one text record per tick:
//!
//! ```text
//! DATA <kern> <user> <idle> <kinsns> <uinsns> <irqs> <exns> <disk> <con> <emu> <net>
//! ```
//!
//! Counters are cumulative `u32`s and may wrap; deltas use wrapping
//! subtraction.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

static DATA_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^DATA((?:\s+\d+){11})\s*$").expect("static regex")
});

static HZ_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^HZ\s+(\d+)\s*$").expect("static regex"));

/// The eleven simulator counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Counters {
    pub kern_cycles: u64,
    pub user_cycles: u64,
    pub idle_cycles: u64,
    pub kern_instructions: u64,
    pub user_instructions: u64,
    pub irqs: u64,
    pub exceptions: u64,
    pub disk_ops: u64,
    pub con_ops: u64,
    pub emufs_ops: u64,
    pub net_ops: u64,
}

impl Counters {
    fn fields(&self) -> [u64; 11] {
        [
            self.kern_cycles,
            self.user_cycles,
            self.idle_cycles,
            self.kern_instructions,
            self.user_instructions,
            self.irqs,
            self.exceptions,
            self.disk_ops,
            self.con_ops,
            self.emufs_ops,
            self.net_ops,
        ]
    }

    fn from_fields(f: [u64; 11]) -> Self {
        Counters {
            kern_cycles: f[0],
            user_cycles: f[1],
            idle_cycles: f[2],
            kern_instructions: f[3],
            user_instructions: f[4],
            irqs: f[5],
            exceptions: f[6],
            disk_ops: f[7],
            con_ops: f[8],
            emufs_ops: f[9],
            net_ops: f[10],
        }
    }

    fn zip(&self, other: &Counters, op: impl Fn(u64, u64) -> u64) -> Counters {
        let (a, b) = (self.fields(), other.fields());
        let mut out = [0u64; 11];
        for i in 0..11 {
            out[i] = op(a[i], b[i]);
        }
        Counters::from_fields(out)
    }

    pub fn add(&self, other: &Counters) -> Counters {
        self.zip(other, |a, b| a.saturating_add(b))
    }

    /// Field-wise difference of two cumulative `u32` readings, wrap-aware.
    pub fn sub(&self, other: &Counters) -> Counters {
        self.zip(other, |a, b| u64::from((a as u32).wrapping_sub(b as u32)))
    }

    pub fn total_cycles(&self) -> u64 {
        self.kern_cycles + self.user_cycles + self.idle_cycles
    }
}

/// A telemetry interval in simulator time
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Stat {
    pub start: f64,
    pub end: f64,
    pub length: f64,
    #[serde(flatten)]
    pub counters: Counters,
}

impl Stat {
    pub fn add(&self, other: &Stat) -> Stat {
        Stat {
            start: self.start,
            end: self.end,
            length: self.length,
            counters: self.counters.add(&other.counters),
        }
    }

    pub fn sub(&self, other: &Stat) -> Stat {
        Stat {
            start: self.start,
            end: self.end,
            length: self.length,
            counters: self.counters.sub(&other.counters),
        }
    }

    /// Extend this interval to cover `other` and accumulate its counters.
    /// Merging into an empty stat adopts `other`'s start.
    pub fn merge(&mut self, other: &Stat) {
        if self.length == 0.0 && self.counters == Counters::default() {
            self.start = other.start;
        } else {
            self.start = self.start.min(other.start);
        }
        self.end = self.end.max(other.end);
        self.length = self.end - self.start;
        self.counters = self.counters.add(&other.counters);
    }

    fn ratio(part: u64, total: u64) -> f64 {
        if total == 0 {
            0.0
        } else {
            part as f64 / total as f64
        }
    }

    pub fn kernel_ratio(&self) -> f64 {
        Self::ratio(self.counters.kern_cycles, self.counters.total_cycles())
    }

    pub fn user_ratio(&self) -> f64 {
        Self::ratio(self.counters.user_cycles, self.counters.total_cycles())
    }
}

/// One line read from the metering socket
#[derive(Debug, Clone, PartialEq)]
pub enum MeterRecord {
    Hz(u64),
    Data(Counters),
}

/// Parse a metering record; anything non-conforming is `None`.
pub fn parse_meter_line(line: &str) -> Option<MeterRecord> {
    let line = line.trim_end_matches(&['\r', '\n'][..]);
    if let Some(caps) = DATA_RE.captures(line) {
        let mut fields = [0u64; 11];
        for (i, tok) in caps[1].split_whitespace().enumerate() {
            fields[i] = u64::from(tok.parse::<u32>().ok()?);
        }
        return Some(MeterRecord::Data(Counters::from_fields(fields)));
    }
    HZ_RE
        .captures(line)
        .and_then(|caps| caps[1].parse::<u64>().ok())
        .filter(|hz| *hz > 0)
        .map(MeterRecord::Hz)
}
