//! A command definition: how to recognise, read, and decode one eBUS value.

use serde::{Deserialize, Serialize};

use crate::datatypes::{decode_scaled, encode_scaled, Datatype, Value};
use crate::sequence::Sequence;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Command {
    pub key: String,
    pub name: String,
    #[serde(with = "hex_bytes")]
    pub read_cmd: Vec<u8>,
    #[serde(with = "hex_bytes", default)]
    pub write_cmd: Vec<u8>,
    pub active: bool,
    #[serde(default = "default_interval")]
    pub interval: u32,

    pub master: bool,
    #[serde(default = "default_position")]
    pub position: usize,
    pub datatype: Datatype,
    #[serde(default = "default_divider")]
    pub divider: f64,
    pub min: Option<f64>,
    pub max: Option<f64>,
    #[serde(default = "default_digits")]
    pub digits: u8,
    #[serde(default)]
    pub unit: String,

    /// Presentation metadata (Home Assistant discovery, etc.) the core
    /// does not interpret but forwards to the broker collaborator.
    #[serde(default)]
    pub presentation: serde_json::Value,

    #[serde(skip)]
    pub last: u64,
    #[serde(skip)]
    pub data: Vec<u8>,
}

fn default_interval() -> u32 {
    60
}
fn default_position() -> usize {
    1
}
fn default_divider() -> f64 {
    1.0
}
fn default_digits() -> u8 {
    2
}

mod hex_bytes {
    use super::Sequence;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&Sequence::bytes_to_hex(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        Sequence::hex_to_bytes(&s).ok_or_else(|| serde::de::Error::custom("invalid hex bytes"))
    }
}

impl Command {
    /// Decode this command's current `data` into a physical value.
    pub fn value(&self) -> Option<Value> {
        if self.data.is_empty() {
            return None;
        }
        decode_scaled(self.datatype, &self.data, self.divider, self.digits)
    }

    /// Encode a value for a `write` job: `write_cmd` body followed by the
    /// clamped/scaled/encoded bytes.
    pub fn encode_write(&self, value: f64) -> Option<Vec<u8>> {
        if self.write_cmd.is_empty() {
            return None;
        }
        let encoded = encode_scaled(
            self.datatype,
            value,
            self.divider,
            self.digits,
            self.min,
            self.max,
        )?;
        let mut bytes = self.write_cmd.clone();
        bytes.extend(encoded);
        Some(bytes)
    }

    /// Validate a freshly deserialized definition's semantic constraints
    /// (shape/type checks already happened via serde). Returns an error
    /// description on failure.
    pub fn evaluate(doc: &serde_json::Value) -> Option<String> {
        let obj = doc.as_object()?;
        for required in ["key", "name", "read_cmd", "active", "datatype"] {
            if !obj.contains_key(required) {
                return Some(format!("missing required field `{required}`"));
            }
        }
        if let Some(interval) = obj.get("interval").and_then(|v| v.as_u64()) {
            if interval == 0 {
                return Some("interval must be > 0".to_string());
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Command {
        Command {
            key: "outside_temp".into(),
            name: "Outside temperature".into(),
            read_cmd: vec![0xB5, 0x09, 0x02, 0x00],
            write_cmd: vec![],
            active: true,
            interval: 60,
            master: false,
            position: 1,
            datatype: Datatype::Data2c,
            divider: 1.0,
            min: None,
            max: None,
            digits: 1,
            unit: "°C".into(),
            presentation: serde_json::Value::Null,
            last: 0,
            data: vec![],
        }
    }

    #[test]
    fn value_none_before_any_data() {
        assert!(sample().value().is_none());
    }

    #[test]
    fn value_decodes_stored_data() {
        let mut cmd = sample();
        cmd.data = vec![0x10, 0x00]; // int16=16, /16=1.0
        assert_eq!(cmd.value(), Some(Value::Number(1.0)));
    }

    #[test]
    fn evaluate_rejects_missing_fields() {
        let doc = serde_json::json!({"key": "x"});
        assert!(Command::evaluate(&doc).is_some());
    }

    #[test]
    fn read_cmd_round_trips_through_json() {
        let cmd = sample();
        let json = serde_json::to_string(&cmd).unwrap();
        let back: Command = serde_json::from_str(&json).unwrap();
        assert_eq!(back.read_cmd, cmd.read_cmd);
    }
}
