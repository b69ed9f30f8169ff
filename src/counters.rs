//! Monotonic message/error counters plus per-phase online timing
//! statistics (Welford's single-pass mean/variance).

use std::collections::HashMap;
use std::time::Duration;

use serde::Serialize;

use crate::telegram::SeqState;

#[derive(Debug, Clone, Default, Serialize)]
pub struct Counters {
    pub total: u64,

    pub success: u64,
    pub success_ms: u64,
    pub success_mm: u64,
    pub success_bc: u64,

    pub failure: u64,
    pub failure_master: HashMap<String, u64>,
    pub failure_slave: HashMap<String, u64>,

    pub special_00: u64,
    pub special_0704_success: u64,
    pub special_0704_failure: u64,

    pub arbitration_first_round_lost: u64,
    pub arbitration_second_round_won: u64,
    pub arbitration_won: u64,
    pub arbitration_lost: u64,
    pub arbitration_error: u64,
    pub arbitration_late: u64,
    pub arbitration_restart: u64,

    pub bus_request_failed: u64,
    pub sending_failed: u64,
}

fn state_key(state: SeqState) -> &'static str {
    match state {
        SeqState::Empty => "empty",
        SeqState::Ok => "ok",
        SeqState::ErrShort => "err_short",
        SeqState::ErrLong => "err_long",
        SeqState::ErrNn => "err_nn",
        SeqState::ErrCrc => "err_crc",
        SeqState::ErrAck => "err_ack",
        SeqState::ErrQq => "err_qq",
        SeqState::ErrZz => "err_zz",
        SeqState::ErrAckMiss => "err_ack_miss",
        SeqState::ErrInvalid => "err_invalid",
    }
}

impl Counters {
    pub fn new() -> Self {
        let mut c = Self::default();
        for state in SeqState::ALL {
            c.failure_master.insert(state_key(state).to_string(), 0);
            c.failure_slave.insert(state_key(state).to_string(), 0);
        }
        c
    }

    pub fn success_percent(&self) -> f32 {
        if self.total == 0 {
            0.0
        } else {
            self.success as f32 / self.total as f32 * 100.0
        }
    }

    pub fn failure_percent(&self) -> f32 {
        if self.total == 0 {
            0.0
        } else {
            self.failure as f32 / self.total as f32 * 100.0
        }
    }

    pub fn bump_failure_master(&mut self, state: SeqState) {
        *self
            .failure_master
            .entry(state_key(state).to_string())
            .or_insert(0) += 1;
    }

    pub fn bump_failure_slave(&mut self, state: SeqState) {
        *self
            .failure_slave
            .entry(state_key(state).to_string())
            .or_insert(0) += 1;
    }

    pub fn reset(&mut self) {
        *self = Counters::new();
    }
}

/// A single phase's online `(last, mean, stddev, count)` statistics,
/// updated with Welford's algorithm so no sample history needs to be
/// retained.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PhaseStat {
    pub last: f64,
    pub mean: f64,
    #[serde(skip)]
    m2: f64,
    pub count: u64,
}

impl PhaseStat {
    pub fn observe(&mut self, sample: Duration) {
        let x = sample.as_secs_f64();
        self.last = x;
        self.count += 1;
        let delta = x - self.mean;
        self.mean += delta / self.count as f64;
        let delta2 = x - self.mean;
        self.m2 += delta * delta2;
    }

    pub fn variance(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.m2 / self.count as f64
        }
    }

    pub fn stddev(&self) -> f64 {
        self.variance().sqrt()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    IsrDelay,
    IsrWindow,
    Write,
    ActiveFirst,
    ActiveData,
    PassiveFirst,
    PassiveData,
    Sync,
    Callback,
    HandlerState,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct Timing {
    phases: HashMap<String, PhaseStat>,
}

fn phase_key(phase: Phase) -> &'static str {
    match phase {
        Phase::IsrDelay => "isr_delay",
        Phase::IsrWindow => "isr_window",
        Phase::Write => "write",
        Phase::ActiveFirst => "active_first",
        Phase::ActiveData => "active_data",
        Phase::PassiveFirst => "passive_first",
        Phase::PassiveData => "passive_data",
        Phase::Sync => "sync",
        Phase::Callback => "callback",
        Phase::HandlerState => "handler_state",
    }
}

impl Timing {
    pub fn observe(&mut self, phase: Phase, sample: Duration) {
        self.phases
            .entry(phase_key(phase).to_string())
            .or_default()
            .observe(sample);
    }

    pub fn get(&self, phase: Phase) -> Option<&PhaseStat> {
        self.phases.get(phase_key(phase))
    }

    pub fn reset(&mut self) {
        self.phases.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn welford_mean_matches_simple_average() {
        let mut stat = PhaseStat::default();
        for ms in [10, 20, 30] {
            stat.observe(Duration::from_millis(ms));
        }
        assert!((stat.mean - 0.020).abs() < 1e-9);
        assert_eq!(stat.count, 3);
    }

    #[test]
    fn counters_seed_all_seq_states() {
        let c = Counters::new();
        assert_eq!(c.failure_master.len(), SeqState::ALL.len());
    }

    #[test]
    fn success_percent_is_zero_with_no_samples() {
        let c = Counters::new();
        assert_eq!(c.success_percent(), 0.0);
    }
}
