//! Turns the command store and device manager into a priority-ordered
//! stream of jobs for the handler, and folds handler events back into
//! stored values, counters, and timing.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use crate::counters::{Counters, Phase, Timing};
use crate::device::DeviceManager;
use crate::handler::{Event, MessageType};
use crate::store::Store;
use crate::telegram::{SeqState, TelegramType};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Schedule,
    Internal,
    Scan,
    FullScan,
    Send,
    Read,
    Write,
}

fn priority(mode: Mode) -> u8 {
    match mode {
        Mode::Internal => 5,
        Mode::Send | Mode::Write | Mode::Read => 4,
        Mode::Schedule => 3,
        Mode::Scan => 2,
        Mode::FullScan => 1,
    }
}

#[derive(Debug, Clone)]
pub struct QueuedCommand {
    pub mode: Mode,
    pub command: Vec<u8>,
    pub schedule_key: Option<String>,
}

impl PartialEq for QueuedCommand {
    fn eq(&self, other: &Self) -> bool {
        priority(self.mode) == priority(other.mode)
    }
}
impl Eq for QueuedCommand {}
impl PartialOrd for QueuedCommand {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for QueuedCommand {
    fn cmp(&self, other: &Self) -> Ordering {
        priority(self.mode).cmp(&priority(other.mode))
    }
}

pub struct ActiveCommand {
    pub queued: QueuedCommand,
    pub bus_attempts: u8,
    pub send_attempts: u8,
    pub set_time: u64,
}

const MAX_BUS_ATTEMPTS: u8 = 3;
const MAX_SEND_ATTEMPTS: u8 = 3;
const ACTIVE_COMMAND_TIMEOUT_MS: u64 = 1_000;

/// Offset-2 match for "inquiry of existence" (service 07h FEh).
const INQUIRY_OF_EXISTENCE: [u8; 3] = [0x07, 0xFE, 0x00];
/// Broadcast "sign of life" sent in response, at `Mode::Internal` priority.
const SIGN_OF_LIFE: [u8; 4] = [0xFE, 0x07, 0xFF, 0x00];

pub struct Scheduler {
    pub store: Store,
    pub devices: DeviceManager,
    pub counters: Counters,
    pub timing: Timing,

    address: u8,
    queue: BinaryHeap<QueuedCommand>,
    active: Option<ActiveCommand>,

    distance_scans_ms: u64,
    last_scan_ms: u64,
    distance_full_scans_ms: u64,
    last_full_scan_ms: u64,

    pub forward: bool,
    pub forward_filters: Vec<Vec<u8>>,
}

impl Scheduler {
    pub fn new(address: u8) -> Self {
        Self {
            store: Store::new(),
            devices: DeviceManager::new(address),
            counters: Counters::new(),
            timing: Timing::default(),
            address,
            queue: BinaryHeap::new(),
            active: None,
            distance_scans_ms: 10_000,
            last_scan_ms: 0,
            distance_full_scans_ms: 500,
            last_full_scan_ms: 0,
            forward: false,
            forward_filters: Vec::new(),
        }
    }

    pub fn enqueue_send(&mut self, command: Vec<u8>) {
        self.queue.push(QueuedCommand {
            mode: Mode::Send,
            command,
            schedule_key: None,
        });
    }

    /// Inquiry-of-existence and other engine-internal jobs that must
    /// preempt everything else.
    pub fn enqueue_internal(&mut self, command: Vec<u8>) {
        self.queue.push(QueuedCommand {
            mode: Mode::Internal,
            command,
            schedule_key: None,
        });
    }

    pub fn enqueue_write(&mut self, command: Vec<u8>) {
        self.queue.push(QueuedCommand {
            mode: Mode::Write,
            command,
            schedule_key: None,
        });
    }

    /// At most one `Schedule` job may sit in the queue at once — a
    /// higher-priority job repeatedly preempting it must not cause it to
    /// be enqueued again on every `tick()`.
    fn has_queued(&self, mode: Mode) -> bool {
        self.queue.iter().any(|q| q.mode == mode)
    }

    fn enqueue_schedule_command(&mut self, now_ms: u64) {
        if self.has_queued(Mode::Schedule) {
            return;
        }
        if let Some(key) = self.store.next_active_command(now_ms) {
            if let Some(cmd) = self.store.find(key) {
                self.queue.push(QueuedCommand {
                    mode: Mode::Schedule,
                    command: cmd.read_cmd.clone(),
                    schedule_key: Some(key.to_string()),
                });
            }
        }
    }

    fn enqueue_startup_scan(&mut self) {
        if self.devices.has_next_startup_scan() {
            let cmd = self.devices.next_startup_scan_command();
            self.queue.push(QueuedCommand {
                mode: Mode::Scan,
                command: cmd,
                schedule_key: None,
            });
        }
    }

    fn enqueue_full_scan(&mut self) {
        if self.has_queued(Mode::FullScan) {
            return;
        }
        if self.devices.has_next_full_scan() {
            let cmd = self.devices.next_full_scan_command();
            self.queue.push(QueuedCommand {
                mode: Mode::FullScan,
                command: cmd,
                schedule_key: None,
            });
        }
    }

    /// Called on the tokio scheduling tick: top up the queue from timers
    /// and deadlines, then pop the next job if one is ready and nothing
    /// is currently active.
    pub fn tick(&mut self, now_ms: u64) -> Option<Vec<u8>> {
        if self.active.is_some() {
            if now_ms.saturating_sub(self.active.as_ref().unwrap().set_time)
                > ACTIVE_COMMAND_TIMEOUT_MS
            {
                self.counters.bus_request_failed += 1;
                self.active = None;
            } else {
                return None;
            }
        }

        self.enqueue_schedule_command(now_ms);
        self.enqueue_startup_scan();

        if now_ms.saturating_sub(self.last_scan_ms) >= self.distance_scans_ms {
            self.last_scan_ms = now_ms;
            self.enqueue_startup_scan();
        }
        if now_ms.saturating_sub(self.last_full_scan_ms) >= self.distance_full_scans_ms {
            self.last_full_scan_ms = now_ms;
            self.enqueue_full_scan();
        }

        let queued = self.queue.pop()?;
        let command = queued.command.clone();
        self.active = Some(ActiveCommand {
            queued,
            bus_attempts: 0,
            send_attempts: 0,
            set_time: now_ms,
        });
        Some(command)
    }

    pub fn bus_request_failed(&mut self, now_ms: u64) -> Option<Vec<u8>> {
        if let Some(active) = &mut self.active {
            active.bus_attempts += 1;
            if active.bus_attempts < MAX_BUS_ATTEMPTS {
                let command = active.queued.command.clone();
                active.set_time = now_ms;
                return Some(command);
            }
        }
        self.counters.bus_request_failed += 1;
        self.active = None;
        None
    }

    pub fn sending_failed(&mut self, now_ms: u64) -> Option<Vec<u8>> {
        if let Some(active) = &mut self.active {
            active.send_attempts += 1;
            if active.queued.mode != Mode::FullScan && active.send_attempts < MAX_SEND_ATTEMPTS {
                let command = active.queued.command.clone();
                active.set_time = now_ms;
                return Some(command);
            }
        }
        self.counters.sending_failed += 1;
        self.active = None;
        None
    }

    /// Process one event drained from the handler. Returns a forwarded
    /// telegram (master, slave) if `forward` is enabled and it passed
    /// the filter list.
    pub fn handle_event(&mut self, event: Event, now_ms: u64) -> Option<(Vec<u8>, Vec<u8>)> {
        match event {
            Event::Won => {
                self.counters.arbitration_won += 1;
                None
            }
            Event::Lost => {
                self.counters.arbitration_lost += 1;
                None
            }
            Event::FirstRoundLost => {
                self.counters.arbitration_first_round_lost += 1;
                None
            }
            Event::SecondRoundWon => {
                self.counters.arbitration_second_round_won += 1;
                None
            }
            Event::Restart => {
                self.counters.arbitration_restart += 1;
                None
            }
            Event::ArbitrationError => {
                self.counters.arbitration_error += 1;
                None
            }
            Event::Late => {
                self.counters.arbitration_late += 1;
                None
            }
            Event::Telegram {
                message_type,
                telegram_type,
                master,
                slave,
            } => {
                self.counters.total += 1;
                self.devices.collect_data(&master, &slave);

                match message_type {
                    MessageType::Active => {
                        self.process_active(&master, &slave, now_ms);
                    }
                    MessageType::Passive | MessageType::Reactive => {}
                }
                // Some commands are both master- and slave-observed, so
                // passive matching (schedule updates, inquiry-of-existence)
                // runs regardless of how the telegram was classified.
                self.process_passive(&master, &slave, now_ms);

                self.counters.success += 1;
                match telegram_type {
                    TelegramType::Bc => self.counters.success_bc += 1,
                    TelegramType::Mm => self.counters.success_mm += 1,
                    TelegramType::Ms => self.counters.success_ms += 1,
                    TelegramType::Undefined => {}
                }

                if self.forward && self.passes_forward_filter(&master) {
                    Some((master, slave))
                } else {
                    None
                }
            }
            Event::Error {
                description: _,
                master,
                slave,
            } => {
                self.counters.total += 1;
                self.counters.failure += 1;
                self.counters.bump_failure_master(SeqState::ErrCrc);
                if !slave.is_empty() {
                    self.counters.bump_failure_slave(SeqState::ErrCrc);
                }
                let _ = master;
                self.active = None;
                None
            }
        }
    }

    fn process_active(&mut self, master: &[u8], slave: &[u8], now_ms: u64) {
        if let Some(active) = self.active.take() {
            if let Some(key) = &active.queued.schedule_key {
                self.store.update_data(key, master, slave, now_ms);
            }
        }
        self.timing.observe(Phase::ActiveData, std::time::Duration::from_millis(0));
    }

    fn process_passive(&mut self, master: &[u8], slave: &[u8], now_ms: u64) {
        let keys: Vec<String> = self
            .store
            .find_matching_commands(master)
            .into_iter()
            .map(|s| s.to_string())
            .collect();
        for key in keys {
            self.store.update_data(&key, master, slave, now_ms);
        }

        if master.len() >= 2 + INQUIRY_OF_EXISTENCE.len()
            && master[2..2 + INQUIRY_OF_EXISTENCE.len()] == INQUIRY_OF_EXISTENCE
        {
            self.enqueue_internal(SIGN_OF_LIFE.to_vec());
        }

        self.timing.observe(Phase::PassiveData, std::time::Duration::from_millis(0));
    }

    fn passes_forward_filter(&self, master: &[u8]) -> bool {
        if self.forward_filters.is_empty() {
            return true;
        }
        self.forward_filters
            .iter()
            .any(|f| crate::sequence::Sequence::contains_from(master, f, 0))
    }

    pub fn address(&self) -> u8 {
        self.address
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::Command;
    use crate::datatypes::Datatype;

    fn sample_command() -> Command {
        Command {
            key: "temp".into(),
            name: "Temp".into(),
            read_cmd: vec![0xB5, 0x09, 0x02, 0x00],
            write_cmd: vec![],
            active: true,
            interval: 60,
            master: false,
            position: 1,
            datatype: Datatype::Uint8,
            divider: 1.0,
            min: None,
            max: None,
            digits: 0,
            unit: String::new(),
            presentation: serde_json::Value::Null,
            last: 0,
            data: vec![],
        }
    }

    #[test]
    fn tick_pops_schedule_job_for_never_run_command() {
        let mut sched = Scheduler::new(0xFF);
        sched.store.insert(sample_command());
        let job = sched.tick(1000);
        assert_eq!(job, Some(vec![0xB5, 0x09, 0x02, 0x00]));
    }

    #[test]
    fn send_outranks_schedule_when_both_queued() {
        let mut sched = Scheduler::new(0xFF);
        sched.store.insert(sample_command());
        sched.enqueue_send(vec![0x07, 0x04, 0x00]);
        let job = sched.tick(1000);
        assert_eq!(job, Some(vec![0x07, 0x04, 0x00]));
    }

    #[test]
    fn bus_request_failure_retries_then_gives_up() {
        let mut sched = Scheduler::new(0xFF);
        sched.enqueue_send(vec![0x07, 0x04, 0x00]);
        sched.tick(0);
        assert!(sched.bus_request_failed(10).is_some());
        assert!(sched.bus_request_failed(20).is_some());
        assert!(sched.bus_request_failed(30).is_none());
        assert_eq!(sched.counters.bus_request_failed, 1);
    }

    #[test]
    fn fullscan_send_error_never_retries() {
        let mut sched = Scheduler::new(0xFF);
        sched.queue.push(QueuedCommand {
            mode: Mode::FullScan,
            command: vec![0x01, 0x07, 0x04, 0x00],
            schedule_key: None,
        });
        sched.tick(0);
        assert!(sched.sending_failed(10).is_none());
        assert_eq!(sched.counters.sending_failed, 1);
    }

    #[test]
    fn schedule_job_is_not_duplicated_while_queued() {
        let mut sched = Scheduler::new(0xFF);
        sched.store.insert(sample_command());
        sched.enqueue_schedule_command(1000);
        sched.enqueue_schedule_command(1000);
        assert_eq!(sched.queue_len(), 1);
    }

    #[test]
    fn inquiry_of_existence_enqueues_sign_of_life() {
        let mut sched = Scheduler::new(0x10);
        let master = [0x10, 0x08, 0x07, 0xFE, 0x00];
        sched.process_passive(&master, &[], 0);
        assert_eq!(sched.queue_len(), 1);
        let job = sched.tick(0);
        assert_eq!(job, Some(vec![0xFE, 0x07, 0xFF, 0x00]));
    }
}
