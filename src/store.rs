//! In-memory command store. Persistence to disk is handled externally
//! by `persistence.rs`, which serializes/deserializes via `to_json` and
//! `load_from_json` below.

use std::collections::HashMap;

use crate::command::Command;
use crate::sequence::Sequence;

#[derive(Default)]
pub struct Store {
    commands: HashMap<String, Command>,
}

impl Store {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, command: Command) {
        self.commands.insert(command.key.clone(), command);
    }

    pub fn remove(&mut self, key: &str) -> Option<Command> {
        self.commands.remove(key)
    }

    pub fn find(&self, key: &str) -> Option<&Command> {
        self.commands.get(key)
    }

    pub fn find_mut(&mut self, key: &str) -> Option<&mut Command> {
        self.commands.get_mut(key)
    }

    pub fn all(&self) -> impl Iterator<Item = &Command> {
        self.commands.values()
    }

    pub fn active_count(&self) -> usize {
        self.commands.values().filter(|c| c.active).count()
    }

    pub fn passive_count(&self) -> usize {
        self.commands.values().filter(|c| !c.active).count()
    }

    /// Among active commands, the one with `last == 0` if any exists,
    /// otherwise the one minimizing `last + interval*1000`. Returns
    /// `None` if its deadline hasn't passed yet.
    pub fn next_active_command(&self, now_ms: u64) -> Option<&str> {
        let active: Vec<&Command> = self.commands.values().filter(|c| c.active).collect();
        if let Some(never_run) = active.iter().find(|c| c.last == 0) {
            return Some(&never_run.key);
        }
        let soonest = active
            .iter()
            .min_by_key(|c| c.last + c.interval as u64 * 1000)?;
        let deadline = soonest.last + soonest.interval as u64 * 1000;
        if now_ms >= deadline {
            Some(&soonest.key)
        } else {
            None
        }
    }

    /// All non-active commands whose `read_cmd` is a prefix of `master`
    /// starting at offset 2 (`PB SB NN DB..`).
    pub fn find_passive_commands(&self, master: &[u8]) -> Vec<&Command> {
        self.commands
            .values()
            .filter(|c| !c.active)
            .filter(|c| Sequence::contains_from(master, &c.read_cmd, 2))
            .collect()
    }

    /// All commands (active or passive) whose `read_cmd` prefixes
    /// `master` at offset 2 — used by the scheduler to update every
    /// matching command on a telegram event, active or not.
    pub fn find_matching_commands(&self, master: &[u8]) -> Vec<&str> {
        self.commands
            .values()
            .filter(|c| Sequence::contains_from(master, &c.read_cmd, 2))
            .map(|c| c.key.as_str())
            .collect()
    }

    pub fn update_data(&mut self, key: &str, master: &[u8], slave: &[u8], now_ms: u64) {
        if let Some(cmd) = self.commands.get_mut(key) {
            cmd.last = now_ms;
            let width = cmd.datatype.width();
            cmd.data = if cmd.master {
                master
                    .get(4 + cmd.position..4 + cmd.position + width)
                    .map(|s| s.to_vec())
                    .unwrap_or_default()
            } else {
                slave
                    .get(cmd.position..cmd.position + width)
                    .map(|s| s.to_vec())
                    .unwrap_or_default()
            };
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        let list: Vec<&Command> = self.commands.values().collect();
        serde_json::to_string(&list)
    }

    pub fn load_from_json(&mut self, json: &str) -> serde_json::Result<usize> {
        let list: Vec<Command> = serde_json::from_str(json)?;
        let count = list.len();
        for cmd in list {
            self.insert(cmd);
        }
        Ok(count)
    }

    pub fn wipe(&mut self) {
        self.commands.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datatypes::Datatype;

    fn cmd(key: &str, active: bool, interval: u32, last: u64) -> Command {
        Command {
            key: key.into(),
            name: key.into(),
            read_cmd: vec![0xB5, 0x09, 0x02, 0x00],
            write_cmd: vec![],
            active,
            interval,
            master: false,
            position: 1,
            datatype: Datatype::Uint8,
            divider: 1.0,
            min: None,
            max: None,
            digits: 0,
            unit: String::new(),
            presentation: serde_json::Value::Null,
            last,
            data: vec![],
        }
    }

    #[test]
    fn next_active_command_prefers_never_run() {
        let mut store = Store::new();
        store.insert(cmd("a", true, 60, 1000));
        store.insert(cmd("b", true, 60, 0));
        assert_eq!(store.next_active_command(2000), Some("b"));
    }

    #[test]
    fn next_active_command_defers_until_deadline() {
        let mut store = Store::new();
        store.insert(cmd("a", true, 60, 1000));
        assert_eq!(store.next_active_command(1500), None);
        assert_eq!(store.next_active_command(61_000), Some("a"));
    }

    #[test]
    fn passive_match_requires_offset_two_prefix() {
        let mut store = Store::new();
        store.insert(cmd("a", false, 60, 0));
        let master = [0x10, 0x08, 0xB5, 0x09, 0x02, 0x00];
        assert_eq!(store.find_passive_commands(&master).len(), 1);
        let mismatch = [0x10, 0x08, 0xB5, 0x09, 0x03, 0x00];
        assert_eq!(store.find_passive_commands(&mismatch).len(), 0);
    }

    #[test]
    fn wipe_clears_store() {
        let mut store = Store::new();
        store.insert(cmd("a", true, 60, 0));
        store.wipe();
        assert_eq!(store.active_count(), 0);
    }
}
