//! The TOD clock and per-CPU timer state.
//!
//! TOD format: bit 51 counts microseconds, so a wall-clock sample in
//! microseconds since the 1900 epoch shifted left 12 is the architectural
//! value. The shared clock hands out strictly increasing values: if the
//! wall source has not advanced since the previous read, the previous
//! value plus one is returned instead.

use std::time::{SystemTime, UNIX_EPOCH};

/// TOD value of the Unix epoch (seconds from 1900-01-01 to 1970-01-01,
/// as microseconds shifted into bit 51).
pub const TOD_1970: u64 = 2_208_988_800 * 1_000_000 << 12;

/// Convert a Unix timestamp in microseconds to TOD format.
#[must_use]
pub const fn tod_from_unix(micros: u64) -> u64 {
    TOD_1970.wrapping_add(micros << 12)
}

fn wall_tod() -> u64 {
    let micros = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0);
    tod_from_unix(micros)
}

#[derive(Debug, Clone, Copy)]
struct CpuTimers {
    clkc: u64,
    ptimer: i64,
}

/// State behind the TOD lock.
#[derive(Debug)]
pub(crate) struct TodState {
    /// Last value handed out (epoch offset already applied).
    last: u64,
    /// Offset added to the wall sample; set by SCK.
    offset: u64,
    /// Wall sample at the previous timer tick, for CPU-timer decrement.
    last_tick: u64,
    cpus: Vec<CpuTimers>,
}

impl TodState {
    pub(crate) fn new(numcpu: usize) -> Self {
        let now = wall_tod();
        Self {
            last: now,
            offset: 0,
            last_tick: now,
            cpus: vec![
                CpuTimers {
                    clkc: 0,
                    ptimer: 0,
                };
                numcpu
            ],
        }
    }

    fn sample(&mut self) -> u64 {
        let mut v = wall_tod().wrapping_add(self.offset);
        if v <= self.last {
            v = self.last.wrapping_add(1);
        }
        self.last = v;
        v
    }

    /// Strictly increasing read.
    pub(crate) fn read(&mut self) -> u64 {
        self.sample()
    }

    /// Set the clock: subsequent reads report `value` onward. The raw wall
    /// source is never moved; only the offset changes.
    pub(crate) fn set(&mut self, value: u64) {
        let raw = wall_tod();
        self.offset = value.wrapping_sub(raw);
        self.last = value;
    }

    pub(crate) fn clkc(&self, cpu: usize) -> u64 {
        self.cpus[cpu].clkc
    }

    pub(crate) fn set_clkc(&mut self, cpu: usize, value: u64) {
        self.cpus[cpu].clkc = value;
    }

    /// True if the TOD has passed the comparator of `cpu`.
    pub(crate) fn clkc_expired(&mut self, cpu: usize) -> Option<bool> {
        let now = self.sample();
        Some(now > self.cpus[cpu].clkc)
    }

    pub(crate) fn ptimer(&self, cpu: usize) -> i64 {
        self.cpus[cpu].ptimer
    }

    pub(crate) fn set_ptimer(&mut self, cpu: usize, value: i64) {
        self.cpus[cpu].ptimer = value;
    }

    /// Advance the clock one timer-thread tick: decrement every CPU timer
    /// by the elapsed TOD delta and evaluate every clock comparator.
    ///
    /// Returns the new TOD value and one `(clkc_expired, ptimer_expired)`
    /// pair per CPU.
    pub(crate) fn tick(&mut self) -> (u64, Vec<(bool, bool)>) {
        let now = self.sample();
        let delta = now.saturating_sub(self.last_tick) as i64;
        self.last_tick = now;
        let results = self
            .cpus
            .iter_mut()
            .map(|t| {
                t.ptimer = t.ptimer.wrapping_sub(delta);
                (now > t.clkc, t.ptimer < 0)
            })
            .collect();
        (now, results)
    }
}
