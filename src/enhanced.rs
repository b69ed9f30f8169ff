//! Wire framing for the "enhanced" TCP client protocol: a 1- or 2-byte
//! encoding that lets a network client drive arbitration and carry a
//! few out-of-band commands alongside raw bus bytes.

const MASK_FIRST: u8 = 0b1100_0000;
const MASK_SECOND: u8 = 0b1000_0000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Request {
    /// Single raw bus byte, sent unframed (top bit clear).
    Send(u8),
    Init,
    /// Arbitration start/stop: `SYN` clears it, anything else requests it
    /// with `d` as the contending address.
    Start(u8),
    Info,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Response {
    Resetted,
    Received(u8),
    Started(u8),
    Info(u8),
    Failed(u8),
    ErrorEbus(u8),
    ErrorHost(u8),
}

const CMD_INIT: u8 = 0;
const CMD_SEND: u8 = 1;
const CMD_START: u8 = 2;
const CMD_INFO: u8 = 3;

const RESETTED: u8 = 0x0;
const RECEIVED: u8 = 0x1;
const STARTED: u8 = 0x2;
const INFO: u8 = 0x3;
const FAILED: u8 = 0xa;
const ERROR_EBUS: u8 = 0xb;
const ERROR_HOST: u8 = 0xc;

pub const ERR_FRAMING: u8 = 0x00;
pub const ERR_OVERRUN: u8 = 0x01;

fn encode(c: u8, d: u8) -> [u8; 2] {
    [
        MASK_FIRST | (c << 2) | (d >> 6),
        MASK_SECOND | (d & 0b0011_1111),
    ]
}

fn decode(b1: u8, b2: u8) -> (u8, u8) {
    let c = (b1 >> 2) & 0b1111;
    let d = ((b1 & 0b11) << 6) | (b2 & 0b0011_1111);
    (c, d)
}

impl Response {
    pub fn encode(self) -> [u8; 2] {
        match self {
            Response::Resetted => encode(RESETTED, 0),
            Response::Received(d) => encode(RECEIVED, d),
            Response::Started(d) => encode(STARTED, d),
            Response::Info(d) => encode(INFO, d),
            Response::Failed(d) => encode(FAILED, d),
            Response::ErrorEbus(d) => encode(ERROR_EBUS, d),
            Response::ErrorHost(d) => encode(ERROR_HOST, d),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FramingError {
    /// First byte had the `10` high bits expected only on a second byte.
    FirstByteSignature,
    /// Second byte lacked the `10` high-bit marker.
    SecondByteSignature,
}

/// Incremental request reader: feed bytes one at a time as they arrive
/// from the socket. Returns `Ok(Some(request))` once a full request has
/// been assembled, `Ok(None)` if more bytes are needed, or an error if
/// the client violated the framing.
#[derive(Debug, Default)]
pub struct RequestReader {
    pending_first: Option<u8>,
}

impl RequestReader {
    pub fn push(&mut self, byte: u8) -> Result<Option<Request>, FramingError> {
        if let Some(b1) = self.pending_first.take() {
            if byte & MASK_FIRST != MASK_SECOND {
                return Err(FramingError::SecondByteSignature);
            }
            let (c, d) = decode(b1, byte);
            return Ok(Some(match c {
                CMD_INIT => Request::Init,
                CMD_SEND => Request::Send(d),
                CMD_START => Request::Start(d),
                CMD_INFO => Request::Info,
                _ => Request::Info,
            }));
        }

        if byte < 0b1000_0000 {
            return Ok(Some(Request::Send(byte)));
        }
        if byte < 0b1100_0000 {
            return Err(FramingError::FirstByteSignature);
        }
        self.pending_first = Some(byte);
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_byte_below_0x80_is_a_plain_send() {
        let mut r = RequestReader::default();
        assert_eq!(r.push(0x2A).unwrap(), Some(Request::Send(0x2A)));
    }

    #[test]
    fn two_byte_frame_round_trips_through_encode_decode() {
        let frame = encode(CMD_START, 0x17);
        let mut r = RequestReader::default();
        assert_eq!(r.push(frame[0]).unwrap(), None);
        assert_eq!(r.push(frame[1]).unwrap(), Some(Request::Start(0x17)));
    }

    #[test]
    fn malformed_second_byte_is_rejected() {
        let mut r = RequestReader::default();
        r.push(0xC8).unwrap();
        assert_eq!(r.push(0x01), Err(FramingError::SecondByteSignature));
    }

    #[test]
    fn response_encoding_matches_known_layout() {
        assert_eq!(Response::Resetted.encode(), [0b1100_0000, 0b1000_0000]);
    }
}
