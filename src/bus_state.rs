//! Tracks bus synchronization and address framing from raw received bytes.

use std::time::{Duration, Instant};

use crate::sequence::SYN;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Startup,
    StartupFirstSyn,
    StartupSymbolAfterFirstSyn,
    StartupSecondSyn,
    ReceivedFirstSyn,
    ReceivedAddressAfterFirstSyn,
    ReceivedSecondSyn,
    ReceivedAddressAfterSecondSyn,
    Busy,
}

/// Drives the 9-state bus tracker described in `SPEC_FULL.md` §4.C, one
/// received byte at a time.
pub struct BusState {
    state: State,
    previous_state: State,
    master: u8,
    symbol: u8,
    syn_time: Instant,
    previous_syn_time: Instant,
}

impl BusState {
    pub fn new() -> Self {
        let now = Instant::now();
        Self {
            state: State::Startup,
            previous_state: State::Startup,
            master: 0,
            symbol: 0,
            syn_time: now,
            previous_syn_time: now,
        }
    }

    pub fn reset(&mut self) {
        self.state = State::Startup;
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn master(&self) -> u8 {
        self.master
    }

    pub fn symbol(&self) -> u8 {
        self.symbol
    }

    fn syn(&mut self, new_state: State) -> State {
        self.previous_syn_time = self.syn_time;
        self.syn_time = Instant::now();
        new_state
    }

    pub fn microseconds_since_last_syn(&self) -> u64 {
        Instant::now()
            .saturating_duration_since(self.syn_time)
            .as_micros() as u64
    }

    pub fn microseconds_since_previous_syn(&self) -> u64 {
        Instant::now()
            .saturating_duration_since(self.previous_syn_time)
            .as_micros() as u64
    }

    pub fn syn_time(&self) -> Instant {
        self.syn_time
    }

    /// Feed one received byte, returning the new state.
    pub fn data(&mut self, symbol: u8) -> State {
        self.previous_state = self.state;
        let is_syn = symbol == SYN;
        self.state = match self.state {
            State::Startup => {
                if is_syn {
                    self.syn(State::StartupFirstSyn)
                } else {
                    State::Startup
                }
            }
            State::StartupFirstSyn => {
                if is_syn {
                    self.syn(State::ReceivedFirstSyn)
                } else {
                    State::StartupSymbolAfterFirstSyn
                }
            }
            State::StartupSymbolAfterFirstSyn => {
                if is_syn {
                    State::StartupSecondSyn
                } else {
                    State::Busy
                }
            }
            State::StartupSecondSyn => {
                if is_syn {
                    self.syn(State::ReceivedFirstSyn)
                } else {
                    State::Busy
                }
            }
            State::ReceivedFirstSyn => {
                if is_syn {
                    self.syn(State::ReceivedFirstSyn)
                } else {
                    self.master = symbol;
                    State::ReceivedAddressAfterFirstSyn
                }
            }
            State::ReceivedAddressAfterFirstSyn => {
                if is_syn {
                    State::ReceivedSecondSyn
                } else {
                    self.symbol = symbol;
                    State::Busy
                }
            }
            State::ReceivedSecondSyn => {
                if is_syn {
                    self.syn(State::ReceivedFirstSyn)
                } else {
                    self.master = symbol;
                    State::ReceivedAddressAfterSecondSyn
                }
            }
            State::ReceivedAddressAfterSecondSyn => {
                if is_syn {
                    self.syn(State::ReceivedFirstSyn)
                } else {
                    State::Busy
                }
            }
            State::Busy => {
                if is_syn {
                    self.syn(State::ReceivedFirstSyn)
                } else {
                    State::Busy
                }
            }
        };
        self.state
    }

    pub fn previous_state(&self) -> State {
        self.previous_state
    }
}

impl Default for BusState {
    fn default() -> Self {
        Self::new()
    }
}

/// Post-SYN commit window for arbitration: `4456 - 4160 - 20` microseconds.
pub const T_LATE: Duration = Duration::from_micros(4456 - 4160 - 20);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn startup_sequence_reaches_received_first_syn() {
        let mut bs = BusState::new();
        assert_eq!(bs.data(SYN), State::StartupFirstSyn);
        assert_eq!(bs.data(SYN), State::ReceivedFirstSyn);
    }

    #[test]
    fn address_after_first_syn_records_master() {
        let mut bs = BusState::new();
        bs.data(SYN);
        bs.data(SYN);
        assert_eq!(bs.data(0x10), State::ReceivedAddressAfterFirstSyn);
        assert_eq!(bs.master(), 0x10);
    }

    #[test]
    fn unexpected_syn_in_second_round_errors_back_to_received_first_syn() {
        let mut bs = BusState::new();
        bs.data(SYN);
        bs.data(SYN);
        bs.data(0x10);
        bs.data(SYN); // -> ReceivedSecondSyn
        assert_eq!(bs.data(SYN), State::ReceivedFirstSyn);
    }

    #[test]
    fn t_late_is_about_276_micros() {
        assert_eq!(T_LATE.as_micros(), 276);
    }
}
