//! Engineering-value codecs: raw eBUS bytes <-> physical values.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Datatype {
    Bcd,
    Uint8,
    Int8,
    Uint16,
    Int16,
    Uint32,
    Int32,
    Data1b,
    Data1c,
    Data2b,
    Data2c,
    Float,
    Char(u8),
    Hex(u8),
}

impl Datatype {
    /// Byte width on the wire.
    pub fn width(self) -> usize {
        match self {
            Datatype::Bcd
            | Datatype::Uint8
            | Datatype::Int8
            | Datatype::Data1b
            | Datatype::Data1c => 1,
            Datatype::Uint16 | Datatype::Int16 | Datatype::Data2b | Datatype::Data2c => 2,
            Datatype::Float => 2,
            Datatype::Uint32 | Datatype::Int32 => 4,
            Datatype::Char(n) | Datatype::Hex(n) => n as usize,
        }
    }

    pub fn is_numeric(self) -> bool {
        !matches!(self, Datatype::Char(_) | Datatype::Hex(_))
    }
}

fn round_digits(value: f64, digits: u8) -> f64 {
    let factor = 10f64.powi(digits as i32);
    (value * factor).round() / factor
}

fn byte_2_bcd(bytes: &[u8]) -> u8 {
    let b = bytes[0];
    let hi = (b >> 4) & 0x0F;
    let lo = b & 0x0F;
    if hi > 9 || lo > 9 {
        0xFF
    } else {
        hi * 10 + lo
    }
}

fn bcd_2_byte(value: u8) -> u8 {
    if value > 99 {
        0xFF
    } else {
        ((value / 10) << 4) | (value % 10)
    }
}

fn le_bytes_to_u32(bytes: &[u8]) -> u32 {
    let mut v = 0u32;
    for (i, &b) in bytes.iter().enumerate() {
        v |= (b as u32) << (8 * i);
    }
    v
}

fn u32_to_le_bytes(value: u32, width: usize) -> Vec<u8> {
    (0..width).map(|i| (value >> (8 * i)) as u8).collect()
}

/// Decode raw wire bytes for `datatype` into a physical value as `f64`
/// (numeric types) or a `String` (CHAR/HEX).
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Number(f64),
    Text(String),
}

pub fn decode(datatype: Datatype, bytes: &[u8]) -> Option<Value> {
    if bytes.len() < datatype.width() {
        return None;
    }
    let bytes = &bytes[..datatype.width()];
    Some(match datatype {
        Datatype::Bcd => Value::Number(byte_2_bcd(bytes) as f64),
        Datatype::Uint8 => Value::Number(bytes[0] as f64),
        Datatype::Int8 => Value::Number(bytes[0] as i8 as f64),
        Datatype::Uint16 => Value::Number(le_bytes_to_u32(bytes) as u16 as f64),
        Datatype::Int16 => Value::Number(le_bytes_to_u32(bytes) as u16 as i16 as f64),
        Datatype::Uint32 => Value::Number(le_bytes_to_u32(bytes) as f64),
        Datatype::Int32 => Value::Number(le_bytes_to_u32(bytes) as i32 as f64),
        Datatype::Data1b => Value::Number(bytes[0] as i8 as f64),
        Datatype::Data1c => Value::Number(bytes[0] as f64 / 2.0),
        Datatype::Data2b => {
            let raw = le_bytes_to_u32(bytes) as u16 as i16;
            Value::Number(raw as f64 / 256.0)
        }
        Datatype::Data2c => {
            let raw = le_bytes_to_u32(bytes) as u16 as i16;
            Value::Number(raw as f64 / 16.0)
        }
        Datatype::Float => {
            let raw = le_bytes_to_u32(bytes) as u16 as i16;
            Value::Number(round_digits(raw as f64 / 1000.0, 3))
        }
        Datatype::Char(_) => Value::Text(
            bytes
                .iter()
                .map(|&b| b as char)
                .collect::<String>()
                .trim_end_matches('\0')
                .to_string(),
        ),
        Datatype::Hex(_) => Value::Text(crate::sequence::Sequence::bytes_to_hex(bytes)),
    })
}

/// Encode a physical numeric value back into raw wire bytes.
pub fn encode_number(datatype: Datatype, value: f64) -> Option<Vec<u8>> {
    Some(match datatype {
        Datatype::Bcd => vec![bcd_2_byte(value.round() as u8)],
        Datatype::Uint8 => vec![value.round() as u8],
        Datatype::Int8 => vec![(value.round() as i8) as u8],
        Datatype::Uint16 => u32_to_le_bytes(value.round() as u32, 2),
        Datatype::Int16 => u32_to_le_bytes((value.round() as i16) as u16 as u32, 2),
        Datatype::Uint32 => u32_to_le_bytes(value.round() as u32, 4),
        Datatype::Int32 => u32_to_le_bytes((value.round() as i32) as u32, 4),
        Datatype::Data1b => vec![(value.round() as i8) as u8],
        Datatype::Data1c => vec![(value * 2.0).round() as u8],
        Datatype::Data2b => u32_to_le_bytes(((value * 256.0).round() as i16) as u16 as u32, 2),
        Datatype::Data2c => u32_to_le_bytes(((value * 16.0).round() as i16) as u16 as u32, 2),
        Datatype::Float => u32_to_le_bytes(
            ((round_digits(value, 3) * 1000.0).round() as i16) as u16 as u32,
            2,
        ),
        Datatype::Char(_) | Datatype::Hex(_) => return None,
    })
}

/// Decode then apply `divider`/`digits` presentation, clamped to
/// `[min, max]` when provided. Mirrors `Store::updateData`'s consumer.
pub fn decode_scaled(
    datatype: Datatype,
    bytes: &[u8],
    divider: f64,
    digits: u8,
) -> Option<Value> {
    match decode(datatype, bytes)? {
        Value::Number(n) => Some(Value::Number(round_digits(n / divider, digits))),
        text => Some(text),
    }
}

/// Inverse of [`decode_scaled`], used by `write`: clamp, multiply, round,
/// then encode.
pub fn encode_scaled(
    datatype: Datatype,
    value: f64,
    divider: f64,
    digits: u8,
    min: Option<f64>,
    max: Option<f64>,
) -> Option<Vec<u8>> {
    let mut v = value;
    if let Some(min) = min {
        v = v.max(min);
    }
    if let Some(max) = max {
        v = v.min(max);
    }
    v = round_digits(v * divider, digits);
    encode_number(datatype, v)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bcd_round_trip() {
        assert_eq!(byte_2_bcd(&[0x42]), 42);
        assert_eq!(bcd_2_byte(42), 0x42);
        assert_eq!(byte_2_bcd(&[0xFA]), 0xFF); // invalid nibble -> sentinel
    }

    #[test]
    fn data2c_matches_formula() {
        // int16(0x0010) = 16, /16 = 1.0
        let v = decode(Datatype::Data2c, &[0x10, 0x00]).unwrap();
        assert_eq!(v, Value::Number(1.0));
    }

    #[test]
    fn float_rounds_to_three_decimals() {
        // int16 = 1234, /1000 = 1.234
        let v = decode(Datatype::Float, &[0xD2, 0x04]).unwrap();
        assert_eq!(v, Value::Number(1.234));
    }

    #[test]
    fn hex_string_formats_lowercase_unseparated() {
        let v = decode(Datatype::Hex(2), &[0xAB, 0x0C]).unwrap();
        assert_eq!(v, Value::Text("ab0c".to_string()));
    }

    #[test]
    fn scaled_round_trip_with_divider() {
        let divider = 10.0;
        let bytes = encode_scaled(Datatype::Int16, 25.5, divider, 1, Some(0.0), Some(100.0))
            .unwrap();
        let decoded = decode_scaled(Datatype::Int16, &bytes, divider, 1).unwrap();
        assert_eq!(decoded, Value::Number(25.5));
    }
}
