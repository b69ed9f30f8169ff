//! Drives one in-flight active telegram through send/acknowledge/receive
//! phases with retries, and classifies passively observed telegrams.

use crate::sequence::{Sequence, ACK, EXP, NAK, SYN};
use crate::telegram::{SeqState, Telegram, TelegramType};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    MonitorBus,
    Arbitration,
    SendMessage,
    ReceiveAcknowledge,
    ReceiveResponse,
    SendPositiveAcknowledge,
    SendNegativeAcknowledge,
    FreeBus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Active,
    Passive,
    Reactive,
}

/// Events the handler emits asynchronously to the scheduler.
#[derive(Debug, Clone)]
pub enum Event {
    Won,
    Lost,
    /// Fine-grained arbitration sub-outcomes, reported alongside `Won`/
    /// `Lost` for statistics purposes.
    FirstRoundLost,
    SecondRoundWon,
    Restart,
    ArbitrationError,
    Late,
    Telegram {
        message_type: MessageType,
        telegram_type: TelegramType,
        master: Vec<u8>,
        slave: Vec<u8>,
    },
    Error {
        description: String,
        master: Vec<u8>,
        slave: Vec<u8>,
    },
}

/// The handler FSM. Pure and synchronous: it emits write requests and
/// events for the caller to act on (write to UART, forward to scheduler
/// channel) rather than performing I/O itself.
pub struct Handler {
    address: u8,
    state: State,

    telegram: Telegram,

    master: Sequence,
    send_index: usize,
    receive_index: usize,
    master_repeated: bool,

    slave: Sequence,
    slave_index: usize,
    slave_nn: usize,
    slave_repeated: bool,

    send_acknowledge: bool,
    send_syn: bool,

    passive_accum: Sequence,

    events: Vec<Event>,
}

impl Handler {
    pub fn new(address: u8) -> Self {
        Self {
            address,
            state: State::MonitorBus,
            telegram: Telegram::default(),
            master: Sequence::new(),
            send_index: 0,
            receive_index: 0,
            master_repeated: false,
            slave: Sequence::new(),
            slave_index: 0,
            slave_nn: 0,
            slave_repeated: false,
            send_acknowledge: true,
            send_syn: true,
            passive_accum: Sequence::new(),
            events: Vec::new(),
        }
    }

    pub fn address(&self) -> u8 {
        self.address
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn is_idle(&self) -> bool {
        self.state == State::MonitorBus
    }

    pub fn reset(&mut self) {
        self.state = State::MonitorBus;
        self.telegram.clear();
        self.master.clear();
        self.send_index = 0;
        self.receive_index = 0;
        self.master_repeated = false;
        self.slave.clear();
        self.slave_index = 0;
        self.slave_nn = 0;
        self.slave_repeated = false;
        self.send_acknowledge = true;
        self.send_syn = true;
    }

    /// Build a master part from `body = ZZ PB SB NN DB..`, byte-stuff it,
    /// and enter `Arbitration` on success.
    pub fn enqueue(&mut self, body: &[u8]) -> bool {
        self.reset();
        match Telegram::build_master(self.address, body) {
            Ok(mut master) => {
                master.extend();
                self.master = master;
                self.state = State::Arbitration;
                true
            }
            Err(_) => false,
        }
    }

    /// Drain pending events (handler -> scheduler channel).
    pub fn take_events(&mut self) -> Vec<Event> {
        std::mem::take(&mut self.events)
    }

    /// Called once per tick; returns the single byte to write to the bus,
    /// if the current state wants to write right now.
    pub fn send(&mut self) -> Option<u8> {
        match self.state {
            State::SendMessage => {
                if self.send_index == self.receive_index && self.send_index < self.master.len() {
                    let byte = self.master[self.send_index];
                    self.send_index += 1;
                    Some(byte)
                } else {
                    None
                }
            }
            State::SendPositiveAcknowledge => {
                if self.send_acknowledge {
                    self.send_acknowledge = false;
                    Some(ACK)
                } else {
                    None
                }
            }
            State::SendNegativeAcknowledge => {
                if self.send_acknowledge {
                    self.send_acknowledge = false;
                    Some(NAK)
                } else {
                    None
                }
            }
            State::FreeBus => {
                if self.send_syn {
                    self.send_syn = false;
                    Some(SYN)
                } else {
                    None
                }
            }
            _ => None,
        }
    }

    /// Called on arbitration win to move from `Arbitration` to
    /// `SendMessage`, with the echoed address byte already accounted for.
    pub fn won_arbitration(&mut self) {
        if self.state == State::Arbitration {
            self.send_index = 1;
            self.receive_index = 1;
            self.state = State::SendMessage;
            self.events.push(Event::Won);
        }
    }

    /// Called when arbitration reports a loss for the in-flight job.
    pub fn lost_arbitration(&mut self) {
        if self.state == State::Arbitration {
            self.state = State::MonitorBus;
            self.events.push(Event::Lost);
        }
    }

    /// Feed one received bus byte into the active-job state machine. The
    /// passive accumulator is fed independently via `monitor`.
    pub fn receive(&mut self, byte: u8) {
        match self.state {
            State::SendMessage => {
                self.receive_index += 1;
                if self.receive_index >= self.master.len() {
                    if self.telegram_is_broadcast() {
                        self.finish_broadcast();
                    } else {
                        self.state = State::ReceiveAcknowledge;
                    }
                }
            }
            State::ReceiveAcknowledge => match byte {
                ACK => {
                    if self.is_master_master() {
                        self.finish_ok(Vec::new());
                    } else {
                        self.state = State::ReceiveResponse;
                    }
                }
                NAK => {
                    if !self.master_repeated {
                        self.master_repeated = true;
                        self.send_index = 1;
                        self.receive_index = 1;
                        self.state = State::SendMessage;
                    } else {
                        self.abandon("master NAK retry exhausted");
                    }
                }
                _ => self.abandon("unexpected byte awaiting master ACK"),
            },
            State::ReceiveResponse => {
                self.slave_index += 1;
                self.slave.push(byte);
                if self.slave.len() == 1 {
                    self.slave_nn = 1 + byte as usize + 1;
                }
                if byte == EXP {
                    self.slave_nn += 1;
                }
                if self.slave.len() >= self.slave_nn {
                    let mut reduced = self.slave.clone();
                    reduced.reduce();
                    let parsed = Telegram::parse(reduced.as_slice());
                    if parsed.slave_state.is_ok() {
                        self.send_acknowledge = true;
                        self.state = State::SendPositiveAcknowledge;
                        self.events.push(Event::Telegram {
                            message_type: MessageType::Active,
                            telegram_type: TelegramType::Ms,
                            master: self.master_raw(),
                            slave: parsed.slave.as_slice().to_vec(),
                        });
                    } else if !self.slave_repeated {
                        self.slave_repeated = true;
                        self.slave_index = 0;
                        self.slave = Sequence::new();
                        self.send_acknowledge = true;
                        self.state = State::SendNegativeAcknowledge;
                    } else {
                        self.abandon("slave CRC retry exhausted");
                    }
                }
            }
            State::SendPositiveAcknowledge => {
                // Echo of the ACK byte this handler just wrote.
                self.state = State::FreeBus;
            }
            State::SendNegativeAcknowledge => {
                // Echo of the NAK byte this handler just wrote.
                if !self.slave_repeated {
                    self.state = State::ReceiveResponse;
                } else {
                    self.state = State::FreeBus;
                }
            }
            State::FreeBus => {
                // Echo of the SYN byte this handler just wrote.
                self.state = State::MonitorBus;
            }
            State::MonitorBus | State::Arbitration => {
                // Arbitration transition into SendMessage is driven
                // externally via `won_arbitration`; MonitorBus does not
                // consume active-job bytes.
            }
        }
    }

    fn telegram_is_broadcast(&self) -> bool {
        self.master.len() >= 2 && self.master[1] == crate::sequence::BROADCAST
    }

    fn is_master_master(&self) -> bool {
        self.master.len() >= 2 && crate::telegram::is_master(self.master[1])
    }

    fn master_raw(&self) -> Vec<u8> {
        let mut reduced = self.master.clone();
        reduced.reduce();
        reduced.as_slice().to_vec()
    }

    fn finish_broadcast(&mut self) {
        self.events.push(Event::Telegram {
            message_type: MessageType::Active,
            telegram_type: TelegramType::Bc,
            master: self.master_raw(),
            slave: Vec::new(),
        });
        self.state = State::FreeBus;
    }

    fn finish_ok(&mut self, slave: Vec<u8>) {
        self.events.push(Event::Telegram {
            message_type: MessageType::Active,
            telegram_type: TelegramType::Mm,
            master: self.master_raw(),
            slave,
        });
        self.state = State::FreeBus;
    }

    fn abandon(&mut self, description: &str) {
        self.events.push(Event::Error {
            description: description.to_string(),
            master: self.master_raw(),
            slave: self.slave.as_slice().to_vec(),
        });
        self.state = State::FreeBus;
    }

    /// Independent passive/reactive accumulator: feed every received
    /// byte here regardless of active-job state. On a SYN delimiter with
    /// a non-empty scratch buffer, parse it as a standalone telegram and
    /// emit a classification event, then feed counters via the returned
    /// `Telegram` for the caller (scheduler) to score.
    pub fn monitor(&mut self, byte: u8) -> Option<Telegram> {
        if byte == SYN {
            if self.passive_accum.is_empty() {
                return None;
            }
            let stream = std::mem::take(&mut self.passive_accum);
            let tel = Telegram::parse(stream.as_slice());
            let message_type = if tel.master.len() >= 2 && tel.master[1] == self.address {
                MessageType::Reactive
            } else {
                MessageType::Passive
            };
            self.events.push(Event::Telegram {
                message_type,
                telegram_type: tel.telegram_type,
                master: tel.master.as_slice().to_vec(),
                slave: tel.slave.as_slice().to_vec(),
            });
            Some(tel)
        } else {
            self.passive_accum.push(byte);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enqueue_transitions_to_arbitration() {
        let mut h = Handler::new(0x10);
        assert!(h.enqueue(&[0x08, 0xB5, 0x11, 0x01, 0x01]));
        assert_eq!(h.state(), State::Arbitration);
    }

    #[test]
    fn broadcast_skips_slave_and_acks() {
        let mut h = Handler::new(0xFF);
        h.enqueue(&[crate::sequence::BROADCAST, 0x07, 0xFF, 0x00]);
        h.won_arbitration();
        assert_eq!(h.state(), State::SendMessage);

        // Drive the echo-bus discipline: each written byte is echoed back.
        while h.state() == State::SendMessage {
            if let Some(byte) = h.send() {
                h.receive(byte);
            } else {
                break;
            }
        }
        assert_eq!(h.state(), State::FreeBus);
        let events = h.take_events();
        assert!(events
            .iter()
            .any(|e| matches!(e, Event::Telegram { telegram_type: TelegramType::Bc, slave, .. } if slave.is_empty())));
    }

    #[test]
    fn monitor_classifies_on_syn() {
        let mut h = Handler::new(0xFF);
        let built = Telegram::build_master(0x10, &[0x08, 0xB5, 0x11, 0x01, 0x01]).unwrap();
        for &b in built.as_slice() {
            assert!(h.monitor(b).is_none());
        }
        let tel = h.monitor(SYN).unwrap();
        assert_eq!(tel.master_state, SeqState::Ok);
    }

    #[test]
    fn monitor_classifies_reactive_on_addressee_not_sender() {
        // QQ (sender) == our own address, ZZ (addressee) is someone else:
        // this is our own outgoing traffic being echoed back, not a
        // telegram addressed to us, so it must not be Reactive.
        let mut h = Handler::new(0x10);
        let built = Telegram::build_master(0x10, &[0x08, 0xB5, 0x11, 0x01, 0x01]).unwrap();
        for &b in built.as_slice() {
            h.monitor(b);
        }
        h.monitor(SYN);
        let events = h.take_events();
        assert!(events.iter().any(
            |e| matches!(e, Event::Telegram { message_type: MessageType::Passive, .. })
        ));
        assert!(!events.iter().any(
            |e| matches!(e, Event::Telegram { message_type: MessageType::Reactive, .. })
        ));
    }

    #[test]
    fn monitor_classifies_reactive_on_matching_addressee() {
        // ZZ (addressee) == our own address -> genuinely addressed to us.
        let mut h = Handler::new(0x08);
        let built = Telegram::build_master(0x10, &[0x08, 0xB5, 0x11, 0x01, 0x01]).unwrap();
        for &b in built.as_slice() {
            h.monitor(b);
        }
        h.monitor(SYN);
        let events = h.take_events();
        assert!(events.iter().any(
            |e| matches!(e, Event::Telegram { message_type: MessageType::Reactive, .. })
        ));
    }
}
