//! Device discovery: tracks identification data per slave address and
//! builds the scan commands needed to fill it in.

use std::collections::HashMap;

use serde::Serialize;

use crate::sequence::Sequence;
use crate::telegram::{is_slave, master_of};

const VENDOR_VAILLANT: u8 = 0xb5;

const VEC_070400: [u8; 3] = [0x07, 0x04, 0x00];
const VEC_B5090124: [u8; 4] = [0xb5, 0x09, 0x01, 0x24];
const VEC_B5090125: [u8; 4] = [0xb5, 0x09, 0x01, 0x25];
const VEC_B5090126: [u8; 4] = [0xb5, 0x09, 0x01, 0x26];
const VEC_B5090127: [u8; 4] = [0xb5, 0x09, 0x01, 0x27];

fn manufacturer(code: u8) -> Option<&'static str> {
    Some(match code {
        0x06 => "Dungs",
        0x0f => "FH Ostfalia",
        0x10 => "TEM",
        0x11 => "Lamberti",
        0x14 => "CEB",
        0x15 => "Landis-Staefa",
        0x16 => "FERRO",
        0x17 => "MONDIAL",
        0x18 => "Wikon",
        0x19 => "Wolf",
        0x20 => "RAWE",
        0x30 => "Satronic",
        0x40 => "ENCON",
        0x50 => "Kromschroeder",
        0x60 => "Eberle",
        0x65 => "EBV",
        0x75 => "Graesslin",
        0x85 => "ebm-papst",
        0x95 => "SIG",
        0xa5 => "Theben",
        0xa7 => "Thermowatt",
        0xb5 => "Vaillant",
        0xc0 => "Toby",
        0xc5 => "Weishaupt",
        0xfd => "ebusd.eu",
        _ => return None,
    })
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct Device {
    slave: u8,
    #[serde(skip)]
    vec_070400: Vec<u8>,
    #[serde(skip)]
    vec_b5090124: Vec<u8>,
    #[serde(skip)]
    vec_b5090125: Vec<u8>,
    #[serde(skip)]
    vec_b5090126: Vec<u8>,
    #[serde(skip)]
    vec_b5090127: Vec<u8>,
}

impl Device {
    pub fn slave(&self) -> u8 {
        self.slave
    }

    pub fn update(&mut self, master: &[u8], slave: &[u8]) {
        self.slave = master[1];
        if Sequence::contains_from(master, &VEC_070400, 2) {
            self.vec_070400 = slave.to_vec();
        } else if Sequence::contains_from(master, &VEC_B5090124, 2) {
            self.vec_b5090124 = slave.to_vec();
        } else if Sequence::contains_from(master, &VEC_B5090125, 2) {
            self.vec_b5090125 = slave.to_vec();
        } else if Sequence::contains_from(master, &VEC_B5090126, 2) {
            self.vec_b5090126 = slave.to_vec();
        } else if Sequence::contains_from(master, &VEC_B5090127, 2) {
            self.vec_b5090127 = slave.to_vec();
        }
    }

    fn is_vaillant(&self) -> bool {
        self.vec_070400.len() > 1 && self.vec_070400[1] == VENDOR_VAILLANT
    }

    fn is_vaillant_valid(&self) -> bool {
        !self.vec_b5090124.is_empty()
            && !self.vec_b5090125.is_empty()
            && !self.vec_b5090126.is_empty()
            && !self.vec_b5090127.is_empty()
    }

    fn unit_id(&self) -> String {
        char_range(&self.vec_070400, 2, 5)
    }

    fn ebusd_configuration(&self) -> String {
        let mut unitid: String = self
            .unit_id()
            .chars()
            .filter(|c| c.is_alphanumeric())
            .collect();
        while unitid.len() > 3 && unitid.ends_with('0') {
            unitid.pop();
        }
        let unitid = unitid.to_lowercase();
        let mut conf = format!("{:02X}", self.slave);
        if !unitid.is_empty() {
            conf.push('.');
            conf.push_str(&unitid);
            conf.push('*');
        } else {
            conf.push_str(".*");
        }
        conf
    }

    pub fn to_json(&self) -> serde_json::Value {
        let master = master_of(self.slave);
        let mut doc = serde_json::json!({
            "master": if master != self.slave { format!("{:02X}", master) } else { String::new() },
            "slave": format!("{:02X}", self.slave),
            "manufacturer": self.vec_070400.get(1).and_then(|&b| manufacturer(b)).unwrap_or(""),
            "unitid": self.unit_id(),
            "software": hex_range(&self.vec_070400, 7, 2),
            "hardware": hex_range(&self.vec_070400, 9, 2),
            "ebusd": self.ebusd_configuration(),
        });
        if self.is_vaillant() && self.is_vaillant_valid() {
            let mut serial = char_range(&self.vec_b5090124, 2, 8);
            serial.push_str(&char_range(&self.vec_b5090125, 1, 9));
            serial.push_str(&char_range(&self.vec_b5090126, 1, 9));
            serial.push_str(&char_range(&self.vec_b5090127, 1, 2));
            if serial.len() >= 16 {
                doc["product"] = serde_json::Value::String(serial[6..16].to_string());
            }
        }
        doc
    }

    /// Identification scan command body for `slave`: `ZZ 07 04 00`.
    pub fn scan_command(slave: u8) -> Vec<u8> {
        let mut cmd = vec![slave];
        cmd.extend_from_slice(&VEC_070400);
        cmd
    }

    /// Vaillant-specific follow-up scans for any identification fields
    /// not yet collected.
    pub fn vendor_scan_commands(&self) -> Vec<Vec<u8>> {
        let mut commands = Vec::new();
        if self.is_vaillant() {
            let slots: [(&[u8], &Vec<u8>); 4] = [
                (&VEC_B5090124, &self.vec_b5090124),
                (&VEC_B5090125, &self.vec_b5090125),
                (&VEC_B5090126, &self.vec_b5090126),
                (&VEC_B5090127, &self.vec_b5090127),
            ];
            for (body, collected) in slots {
                if collected.is_empty() {
                    let mut cmd = vec![self.slave];
                    cmd.extend_from_slice(body);
                    commands.push(cmd);
                }
            }
        }
        commands
    }
}

fn char_range(bytes: &[u8], start: usize, len: usize) -> String {
    bytes
        .get(start..start + len.min(bytes.len().saturating_sub(start)))
        .map(|s| {
            s.iter()
                .take_while(|&&b| b != 0x00)
                .map(|&b| b as char)
                .collect()
        })
        .unwrap_or_default()
}

fn hex_range(bytes: &[u8], start: usize, len: usize) -> String {
    bytes
        .get(start..start + len.min(bytes.len().saturating_sub(start)))
        .map(Sequence::bytes_to_hex)
        .unwrap_or_default()
}

/// Registry of observed devices plus full-bus and startup scan cursors.
#[derive(Debug, Default)]
pub struct DeviceManager {
    devices: HashMap<u8, Device>,
    masters: HashMap<u8, u32>,
    slaves: HashMap<u8, u32>,

    address: u8,

    full_scan: bool,
    full_scan_index: u8,

    scan_on_startup: bool,
    startup_scan_index: u8,
    startup_scan_addr: u8,
    max_startup_scans: u8,
}

impl DeviceManager {
    pub fn new(address: u8) -> Self {
        Self {
            address,
            max_startup_scans: 5,
            ..Default::default()
        }
    }

    pub fn collect_data(&mut self, master: &[u8], slave: &[u8]) {
        if master.len() < 2 {
            return;
        }
        *self.masters.entry(master[0]).or_insert(0) += 1;
        let addr = master[1];
        *self.slaves.entry(addr).or_insert(0) += 1;
        self.devices.entry(addr).or_default().update(master, slave);
    }

    pub fn reset_addresses(&mut self) {
        self.masters.clear();
        self.slaves.clear();
    }

    pub fn devices_json(&self) -> serde_json::Value {
        serde_json::Value::Array(self.devices.values().map(Device::to_json).collect())
    }

    pub fn devices(&self) -> impl Iterator<Item = &Device> {
        self.devices.values()
    }

    pub fn scan_commands(&self) -> Vec<Vec<u8>> {
        (0x01u16..0xffu16)
            .map(|addr| Device::scan_command(addr as u8))
            .collect()
    }

    pub fn vendor_scan_commands(&self) -> Vec<Vec<u8>> {
        self.devices.values().flat_map(Device::vendor_scan_commands).collect()
    }

    pub fn set_full_scan(&mut self, enable: bool) {
        self.full_scan = enable;
    }

    pub fn full_scan(&self) -> bool {
        self.full_scan
    }

    pub fn reset_full_scan(&mut self) {
        self.full_scan_index = 0;
    }

    pub fn has_next_full_scan(&self) -> bool {
        self.full_scan && (self.full_scan_index as u16) < 0xff
    }

    pub fn next_full_scan_command(&mut self) -> Vec<u8> {
        loop {
            self.full_scan_index = self.full_scan_index.wrapping_add(1);
            let addr = self.full_scan_index;
            if addr == 0 || (addr as u16) >= 0xff {
                // Exhausted the range without finding another probe-worthy
                // address; return a command for whatever we landed on so
                // the caller always gets a byte sequence back.
                return Device::scan_command(addr);
            }
            if is_slave(addr) && addr != self.address {
                return Device::scan_command(addr);
            }
        }
    }

    pub fn set_scan_on_startup(&mut self, enable: bool) {
        self.scan_on_startup = enable;
    }

    pub fn scan_on_startup(&self) -> bool {
        self.scan_on_startup
    }

    pub fn reset_startup_scan(&mut self) {
        self.startup_scan_index = 0;
        self.startup_scan_addr = 0;
    }

    pub fn has_next_startup_scan(&self) -> bool {
        self.scan_on_startup && self.startup_scan_index < self.max_startup_scans
    }

    pub fn next_startup_scan_command(&mut self) -> Vec<u8> {
        loop {
            self.startup_scan_addr = self.startup_scan_addr.wrapping_add(1);
            let addr = self.startup_scan_addr;
            self.startup_scan_index += 1;
            if addr == 0 || (addr as u16) >= 0xff || (is_slave(addr) && addr != self.address) {
                return Device::scan_command(addr);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn update_routes_identification_reply() {
        let mut d = Device::default();
        let master = [0x10, 0x15, 0x07, 0x04, 0x00];
        d.update(&master, &[0x05, 0xb5, b'T', b'E', b'M', 0x00, 0x01, 0x02]);
        assert_eq!(d.slave(), 0x15);
        assert_eq!(d.vec_070400[1], 0xb5);
    }

    #[test]
    fn vaillant_vendor_scan_requested_until_collected() {
        let mut d = Device::default();
        d.slave = 0x15;
        d.vec_070400 = vec![0x05, 0xb5];
        assert_eq!(d.vendor_scan_commands().len(), 4);
        d.vec_b5090124 = vec![1, 2, 3];
        assert_eq!(d.vendor_scan_commands().len(), 3);
    }

    #[test]
    fn scan_commands_cover_full_address_range() {
        let dm = DeviceManager::new(0xFF);
        let cmds = dm.scan_commands();
        assert_eq!(cmds.len(), 0xfe);
        assert_eq!(cmds[0][0], 0x01);
    }
}
