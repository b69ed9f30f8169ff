//! The bus task: the highest-priority, time-critical loop that drives
//! the bus-state tracker, arbitration engine, and handler FSM off of
//! timestamped bytes from the UART, and writes bytes back out.

use tokio::sync::{broadcast, mpsc};

use crate::arbitration::{Arbitration, Outcome};
use crate::bus_state::BusState;
use crate::handler::{Event, Handler};
use crate::uart::{TimestampedByte, UartWriter};

pub struct BusTask {
    address: u8,
    bus_state: BusState,
    arbitration: Arbitration,
    handler: Handler,
    writer: UartWriter,
}

impl BusTask {
    pub fn new(address: u8, writer: UartWriter) -> Self {
        Self {
            address,
            bus_state: BusState::new(),
            arbitration: Arbitration::new(),
            handler: Handler::new(address),
            writer,
        }
    }

    /// Run forever, consuming bytes from the reader thread and jobs from
    /// the scheduler, emitting handler events back to it.
    pub async fn run(
        mut self,
        mut bytes_rx: mpsc::Receiver<TimestampedByte>,
        mut job_rx: mpsc::Receiver<Vec<u8>>,
        event_tx: mpsc::Sender<Event>,
        monitor_tx: broadcast::Sender<u8>,
    ) {
        loop {
            tokio::select! {
                biased;

                Some(tb) = bytes_rx.recv() => {
                    self.on_byte(tb.byte, &event_tx, &monitor_tx).await;
                }
                Some(job) = job_rx.recv(), if self.handler.is_idle() => {
                    self.handler.enqueue(&job);
                }
                else => return,
            }
        }
    }

    async fn on_byte(&mut self, byte: u8, event_tx: &mpsc::Sender<Event>, monitor_tx: &broadcast::Sender<u8>) {
        let _ = monitor_tx.send(byte);

        let was_received_first_syn = self.bus_state.state() == crate::bus_state::State::ReceivedFirstSyn;
        let new_state = self.bus_state.data(byte);

        if !self.arbitration.is_arbitrating()
            && was_received_first_syn
            && self.handler.state() == crate::handler::State::Arbitration
        {
            if self.arbitration.start(&self.bus_state, self.address) {
                if let Err(e) = self.writer.write_byte(self.arbitration.address()) {
                    log::error!("arbitration write failed: {e}");
                    let _ = event_tx.send(Event::ArbitrationError).await;
                }
            } else if self.arbitration.would_be_late(&self.bus_state) {
                let _ = event_tx.send(Event::Late).await;
            }
        }

        if self.arbitration.is_arbitrating() {
            let outcome = self.arbitration.data(new_state, byte);
            if self.arbitration.wants_second_write() && new_state == crate::bus_state::State::ReceivedSecondSyn {
                let _ = self.writer.write_byte(self.arbitration.address());
            }
            match outcome {
                Outcome::Won => self.handler.won_arbitration(),
                Outcome::SecondRoundWon => {
                    self.handler.won_arbitration();
                    let _ = event_tx.send(Event::SecondRoundWon).await;
                }
                Outcome::FirstRoundLost => {
                    let _ = event_tx.send(Event::FirstRoundLost).await;
                }
                Outcome::Lost => self.handler.lost_arbitration(),
                Outcome::Restart => {
                    self.handler.lost_arbitration();
                    let _ = event_tx.send(Event::Restart).await;
                }
                Outcome::Error => {
                    self.handler.lost_arbitration();
                    let _ = event_tx.send(Event::ArbitrationError).await;
                }
                Outcome::Arbitrating | Outcome::None => {}
            }
        }

        self.handler.receive(byte);
        self.handler.monitor(byte);

        for event in self.handler.take_events() {
            let _ = event_tx.send(event).await;
        }

        if let Some(next) = self.handler.send() {
            let _ = self.writer.write_byte(next);
        }
    }
}
