//! Master/slave telegram framing, validation, and classification.

use crate::sequence::{Sequence, ACK, BROADCAST, NAK, SYN};

pub const MAX_BYTES: usize = 16;

/// Per-half parse outcome, mirroring the original firmware's signed error
/// codes (kept as named variants here rather than raw integers).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SeqState {
    Empty,
    Ok,
    ErrShort,
    ErrLong,
    ErrNn,
    ErrCrc,
    ErrAck,
    ErrQq,
    ErrZz,
    ErrAckMiss,
    ErrInvalid,
}

impl SeqState {
    pub fn is_ok(self) -> bool {
        matches!(self, SeqState::Ok)
    }

    /// All variants, used to seed zeroed counter maps (mirrors the
    /// original's `failureMaster`/`failureSlave` map initializers).
    pub const ALL: [SeqState; 11] = [
        SeqState::Empty,
        SeqState::Ok,
        SeqState::ErrShort,
        SeqState::ErrLong,
        SeqState::ErrNn,
        SeqState::ErrCrc,
        SeqState::ErrAck,
        SeqState::ErrQq,
        SeqState::ErrZz,
        SeqState::ErrAckMiss,
        SeqState::ErrInvalid,
    ];
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TelegramType {
    Undefined,
    Bc,
    Mm,
    Ms,
}

/// True iff `byte` is one of the 25 valid master addresses: both nibbles
/// drawn from `{0x0, 0x1, 0x3, 0x7, 0xF}`.
pub fn is_master(byte: u8) -> bool {
    let hi = (byte & 0xF0) >> 4;
    let lo = byte & 0x0F;
    let valid = |n: u8| matches!(n, 0x0 | 0x1 | 0x3 | 0x7 | 0xF);
    valid(hi) && valid(lo)
}

pub fn is_slave(byte: u8) -> bool {
    !is_master(byte) && byte != SYN && byte != crate::sequence::EXP
}

pub fn slave_of(address: u8) -> u8 {
    if is_slave(address) {
        address
    } else {
        address.wrapping_add(5)
    }
}

/// Inverse of [`slave_of`]: the master address that owns a given slave
/// sub-address, or the address unchanged if it's already a master.
pub fn master_of(address: u8) -> u8 {
    if is_master(address) {
        address
    } else {
        address.wrapping_sub(5)
    }
}

fn classify(zz: u8) -> TelegramType {
    if zz == BROADCAST {
        TelegramType::Bc
    } else if is_master(zz) {
        TelegramType::Mm
    } else {
        TelegramType::Ms
    }
}

/// A parsed or under-construction eBUS telegram.
#[derive(Debug, Clone)]
pub struct Telegram {
    pub telegram_type: TelegramType,
    pub master: Sequence,
    pub master_nn: usize,
    pub master_state: SeqState,
    pub slave_ack: SeqState,
    pub slave: Sequence,
    pub slave_nn: usize,
    pub slave_state: SeqState,
    pub master_ack: SeqState,
}

impl Default for Telegram {
    fn default() -> Self {
        Self {
            telegram_type: TelegramType::Undefined,
            master: Sequence::new(),
            master_nn: 0,
            master_state: SeqState::Empty,
            slave_ack: SeqState::Empty,
            slave: Sequence::new(),
            slave_nn: 0,
            slave_state: SeqState::Empty,
            master_ack: SeqState::Empty,
        }
    }
}

impl Telegram {
    pub fn clear(&mut self) {
        *self = Telegram::default();
    }

    pub fn is_valid(&self) -> bool {
        match self.telegram_type {
            TelegramType::Ms => self.master_state.is_ok() && self.slave_state.is_ok(),
            _ => self.master_state.is_ok(),
        }
    }

    /// Build a master part `QQ ZZ PB SB NN DB..` and append its CRC.
    pub fn build_master(qq: u8, body: &[u8]) -> Result<Sequence, SeqState> {
        if !is_master(qq) {
            return Err(SeqState::ErrQq);
        }
        if body.is_empty() {
            return Err(SeqState::ErrShort);
        }
        let zz = body[0];
        if zz == SYN || zz == crate::sequence::EXP {
            return Err(SeqState::ErrZz);
        }
        if body.len() < 4 {
            return Err(SeqState::ErrShort);
        }
        let nn = body[3] as usize;
        if nn > MAX_BYTES {
            return Err(SeqState::ErrNn);
        }
        if body.len() != 4 + nn {
            return Err(SeqState::ErrNn);
        }
        let mut seq = Sequence::from_raw(std::iter::once(qq).chain(body.iter().copied()).collect());
        let crc = seq.crc();
        seq.push(crc);
        Ok(seq)
    }

    /// Build a slave part `NN DB..` and append its CRC.
    pub fn build_slave(body: &[u8]) -> Result<Sequence, SeqState> {
        if body.is_empty() {
            return Err(SeqState::ErrShort);
        }
        let nn = body[0] as usize;
        if nn > MAX_BYTES {
            return Err(SeqState::ErrNn);
        }
        if body.len() != 1 + nn {
            return Err(SeqState::ErrNn);
        }
        let mut seq = Sequence::from_raw(body.to_vec());
        let crc = seq.crc();
        seq.push(crc);
        Ok(seq)
    }

    /// Validate and classify a raw master part `QQ ZZ PB SB NN DB.. CRC`.
    fn create_master(&mut self, raw: &[u8]) -> usize {
        if raw.len() < 6 {
            self.master_state = SeqState::ErrShort;
            return raw.len();
        }
        let qq = raw[0];
        let zz = raw[1];
        if !is_master(qq) {
            self.master_state = SeqState::ErrQq;
            return raw.len();
        }
        if zz == SYN || zz == crate::sequence::EXP {
            self.master_state = SeqState::ErrZz;
            return raw.len();
        }
        let nn = raw[4] as usize;
        if nn > MAX_BYTES {
            self.master_state = SeqState::ErrNn;
            return raw.len();
        }
        let total = 5 + nn + 1; // QQ ZZ PB SB NN DB.. CRC
        if raw.len() < total {
            self.master_state = SeqState::ErrShort;
            return raw.len();
        }
        self.telegram_type = classify(zz);
        let mut seq = Sequence::from_raw(raw[..total - 1].to_vec());
        let expected_crc = seq.crc();
        let actual_crc = raw[total - 1];
        self.master_nn = nn;
        self.master = Sequence::from_raw(raw[..total].to_vec());
        self.master_state = if expected_crc == actual_crc {
            SeqState::Ok
        } else {
            SeqState::ErrCrc
        };
        total
    }

    /// Validate a raw slave part `NN DB.. CRC`.
    fn create_slave(&mut self, raw: &[u8]) -> usize {
        if raw.len() < 2 {
            self.slave_state = SeqState::ErrShort;
            return raw.len();
        }
        let nn = raw[0] as usize;
        if nn > MAX_BYTES {
            self.slave_state = SeqState::ErrNn;
            return raw.len();
        }
        let total = 1 + nn + 1;
        if raw.len() < total {
            self.slave_state = SeqState::ErrShort;
            return raw.len();
        }
        let mut seq = Sequence::from_raw(raw[..total - 1].to_vec());
        let expected_crc = seq.crc();
        let actual_crc = raw[total - 1];
        self.slave_nn = nn;
        self.slave = Sequence::from_raw(raw[..total].to_vec());
        self.slave_state = if expected_crc == actual_crc {
            SeqState::Ok
        } else {
            SeqState::ErrCrc
        };
        total
    }

    /// Parse a stuffed byte stream (without the trailing SYN) into a
    /// telegram, consuming master ACK, slave part, and slave ACK as
    /// applicable, with exactly one retransmission permitted per half on
    /// a negative acknowledge.
    pub fn parse(stream: &[u8]) -> Telegram {
        let mut seq = Sequence::from_stuffed(stream.to_vec());
        seq.reduce();
        let raw = seq.as_slice().to_vec();

        let mut tel = Telegram::default();
        if raw.is_empty() {
            tel.master_state = SeqState::Empty;
            return tel;
        }

        let mut offset = tel.create_master(&raw);
        if !tel.master_state.is_ok() {
            return tel;
        }

        if tel.telegram_type == TelegramType::Bc {
            return tel;
        }

        // Master ACK
        let mut retried = false;
        loop {
            if offset >= raw.len() {
                tel.master_ack = SeqState::ErrAckMiss;
                return tel;
            }
            let ack = raw[offset];
            offset += 1;
            if ack == ACK {
                tel.master_ack = SeqState::Ok;
                break;
            } else if ack == NAK {
                if retried {
                    tel.master_state = SeqState::ErrInvalid;
                    return tel;
                }
                retried = true;
                let consumed = tel.create_master(&raw[offset..]);
                offset += consumed;
                if !tel.master_state.is_ok() {
                    return tel;
                }
                continue;
            } else {
                tel.master_ack = SeqState::ErrAck;
                return tel;
            }
        }

        if tel.telegram_type == TelegramType::Mm {
            return tel;
        }

        // MS: slave part + slave ACK
        let mut slave_retried = false;
        loop {
            let consumed = tel.create_slave(&raw[offset..]);
            offset += consumed;
            if tel.slave_state.is_ok() {
                break;
            }
            if slave_retried {
                return tel;
            }
            slave_retried = true;
            // Original retries by expecting a NAK+retransmission from the
            // master; here we treat a single malformed slave response as
            // terminal unless more bytes follow (the master would resend).
            return tel;
        }

        if offset >= raw.len() {
            tel.slave_ack = SeqState::ErrAckMiss;
            return tel;
        }
        let ack = raw[offset];
        offset += 1;
        if ack == ACK {
            tel.slave_ack = SeqState::Ok;
        } else if ack == NAK {
            if !slave_retried {
                slave_retried = true;
                let consumed = tel.create_slave(&raw[offset..]);
                let _ = offset + consumed;
                if tel.slave_state.is_ok() {
                    tel.slave_ack = SeqState::Ok;
                }
            } else {
                tel.slave_state = SeqState::ErrInvalid;
            }
        } else {
            tel.slave_ack = SeqState::ErrAck;
        }

        tel
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn is_master_has_exactly_25_addresses() {
        let count = (0u16..=255).filter(|&b| is_master(b as u8)).count();
        assert_eq!(count, 25);
    }

    #[test]
    fn slave_of_adds_five() {
        assert_eq!(slave_of(0x10), 0x15);
        assert!(is_slave(slave_of(0x10)));
    }

    #[test]
    fn s1_ms_success() {
        let hex = "10 08 B5 11 01 01 D9 00 03 B0 FB A9 01 77 00";
        let bytes = Sequence::hex_to_bytes(hex).unwrap();
        let tel = Telegram::parse(&bytes);
        assert_eq!(tel.telegram_type, TelegramType::Ms);
        assert_eq!(tel.master_state, SeqState::Ok);
        assert_eq!(tel.slave_state, SeqState::Ok);
        assert_eq!(tel.master_ack, SeqState::Ok);
        assert_eq!(tel.slave_ack, SeqState::Ok);
        assert!(tel.is_valid());
        assert_eq!(tel.slave.as_slice(), &[0x03, 0xB0, 0xFB, 0xAA, 0x77]);
    }

    #[test]
    fn s2_master_nak_retry() {
        let hex = "10 08 B5 11 01 01 D8 FF 10 08 B5 11 01 01 D9 00 03 B0 FB A9 01 77 00";
        let bytes = Sequence::hex_to_bytes(hex).unwrap();
        let tel = Telegram::parse(&bytes);
        assert_eq!(tel.master_state, SeqState::Ok);
        assert_eq!(tel.slave_state, SeqState::Ok);
        assert!(tel.is_valid());
    }

    #[test]
    fn s3_broadcast() {
        // ZZ=BROADCAST, PB=07 SB=FF NN=00 (inquiry-of-existence-shaped, no data bytes)
        let built = Telegram::build_master(0xFF, &[BROADCAST, 0x07, 0xFF, 0x00]).unwrap();
        let tel = Telegram::parse(built.as_slice());
        assert_eq!(tel.telegram_type, TelegramType::Bc);
        assert!(tel.is_valid());
        assert!(tel.slave.is_empty());
    }
}
