//! Two-round priority/sub-priority arbitration contest.

use crate::bus_state::{BusState, State, T_LATE};
use crate::sequence::SYN;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    None,
    Arbitrating,
    /// Didn't win the first round (either a different priority class won
    /// outright, or we matched on sub-priority and are proceeding to a
    /// second round). Non-terminal: the caller should keep watching.
    FirstRoundLost,
    Won,
    /// Won specifically in the second round, after `FirstRoundLost`.
    SecondRoundWon,
    Lost,
    /// The bus restarted (a fresh SYN sequence) before our arbitration
    /// attempt completed.
    Restart,
    Error,
}

/// A pending bus-write request: the byte to write, and whatever it
/// writes is delivered through `Bus::write` (the caller supplies the
/// actual write side-effect).
pub struct Arbitration {
    arbitrating: bool,
    participate_second: bool,
    address: u8,
}

impl Arbitration {
    pub fn new() -> Self {
        Self {
            arbitrating: false,
            participate_second: false,
            address: 0,
        }
    }

    pub fn is_arbitrating(&self) -> bool {
        self.arbitrating
    }

    /// Attempt to start arbitrating for `my_address`. Returns `Some(())`
    /// (the engine wants the byte written now) iff accepted; `None` if
    /// already arbitrating, the bus isn't in `ReceivedFirstSyn`, or the
    /// post-SYN commit window has already passed.
    pub fn start(&mut self, bus: &BusState, my_address: u8) -> bool {
        if self.arbitrating || my_address == SYN {
            return false;
        }
        if bus.state() != State::ReceivedFirstSyn {
            return false;
        }
        if bus.microseconds_since_last_syn() > T_LATE.as_micros() as u64 {
            return false;
        }
        self.address = my_address;
        self.arbitrating = true;
        self.participate_second = false;
        true
    }

    pub fn address(&self) -> u8 {
        self.address
    }

    /// Feed one received byte while arbitrating. When this returns
    /// `Arbitrating` with `wants_second_write() == true` the caller must
    /// write `address()` to the bus immediately (the second-round SYN
    /// re-assertion).
    pub fn data(&mut self, bus_state: State, symbol: u8) -> Outcome {
        if !self.arbitrating {
            return Outcome::None;
        }
        match bus_state {
            State::Startup
            | State::StartupFirstSyn
            | State::StartupSymbolAfterFirstSyn
            | State::StartupSecondSyn
            | State::ReceivedFirstSyn => {
                self.arbitrating = false;
                Outcome::Restart
            }
            State::ReceivedAddressAfterFirstSyn => {
                if symbol == self.address {
                    self.arbitrating = false;
                    Outcome::Won
                } else if symbol & 0x0F == self.address & 0x0F {
                    self.participate_second = true;
                    Outcome::FirstRoundLost
                } else {
                    Outcome::FirstRoundLost
                }
            }
            State::ReceivedSecondSyn => Outcome::Arbitrating,
            State::ReceivedAddressAfterSecondSyn => {
                if symbol == self.address {
                    self.arbitrating = false;
                    Outcome::SecondRoundWon
                } else {
                    Outcome::Arbitrating
                }
            }
            State::Busy => {
                self.arbitrating = false;
                Outcome::Lost
            }
        }
    }

    /// Whether the caller must re-assert `address()` on the current
    /// second SYN (called when `bus_state == ReceivedSecondSyn`).
    pub fn wants_second_write(&self) -> bool {
        self.arbitrating && self.participate_second
    }

    /// Whether a `start()` attempted right now would be rejected solely
    /// for arriving past the `T_LATE` window (as opposed to being in the
    /// wrong bus state already).
    pub fn would_be_late(&self, bus: &BusState) -> bool {
        bus.state() == State::ReceivedFirstSyn
            && bus.microseconds_since_last_syn() > T_LATE.as_micros() as u64
    }
}

impl Default for Arbitration {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_refused_outside_received_first_syn() {
        let bus = BusState::new();
        let mut arb = Arbitration::new();
        assert!(!arb.start(&bus, 0x10));
    }

    #[test]
    fn start_accepted_right_after_syn() {
        let mut bus = BusState::new();
        bus.data(SYN);
        bus.data(SYN);
        let mut arb = Arbitration::new();
        assert!(arb.start(&bus, 0x10));
        assert!(arb.is_arbitrating());
    }

    #[test]
    fn wins_first_round_on_matching_address() {
        let mut bus = BusState::new();
        bus.data(SYN);
        bus.data(SYN);
        let mut arb = Arbitration::new();
        arb.start(&bus, 0x10);
        let state = bus.data(0x10);
        assert_eq!(arb.data(state, 0x10), Outcome::Won);
    }

    #[test]
    fn s4_two_round_arbitration() {
        // Pending request for 0x13; 0x03 wins first round (same priority
        // class, low nibble 3), engine re-asserts on second SYN, wins.
        let mut bus = BusState::new();
        bus.data(SYN);
        bus.data(SYN);
        let mut arb = Arbitration::new();
        assert!(arb.start(&bus, 0x13));

        let state = bus.data(0x03);
        assert_eq!(arb.data(state, 0x03), Outcome::FirstRoundLost);
        assert!(arb.wants_second_write());

        let state = bus.data(SYN); // -> ReceivedSecondSyn
        assert_eq!(arb.data(state, SYN), Outcome::Arbitrating);

        let state = bus.data(0x13); // -> ReceivedAddressAfterSecondSyn
        assert_eq!(arb.data(state, 0x13), Outcome::SecondRoundWon);
    }

    #[test]
    fn loses_on_busy() {
        // Different priority class wins outright; our engine never matches
        // in either round and the bus falls to `Busy` on the next byte.
        let mut bus = BusState::new();
        bus.data(SYN);
        bus.data(SYN);
        let mut arb = Arbitration::new();
        arb.start(&bus, 0x11); // low nibble 1

        let state = bus.data(0x07); // low nibble 7, different class -> wait for Busy
        assert_eq!(arb.data(state, 0x07), Outcome::FirstRoundLost);

        let state = bus.data(SYN); // -> ReceivedSecondSyn
        assert_eq!(arb.data(state, SYN), Outcome::Arbitrating);
        assert!(!arb.wants_second_write());

        let state = bus.data(0x09); // -> ReceivedAddressAfterSecondSyn, not ours
        assert_eq!(arb.data(state, 0x09), Outcome::Arbitrating);

        let state = bus.data(0x01); // a following data byte -> Busy
        assert_eq!(arb.data(state, 0x01), Outcome::Lost);
    }
}
