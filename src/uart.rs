//! Blocking serial-port driver. The bus protocol is time-critical at
//! 2400 baud, so reading happens on a dedicated OS thread rather than
//! inside the tokio runtime; received bytes are forwarded to async
//! consumers over a channel.

use std::time::Duration;

use serialport::SerialPort;
use tokio::sync::mpsc;

use crate::error::GatewayError;

/// One byte observed on the bus, timestamped at the moment it was read
/// off the wire (needed for the `T_LATE` arbitration window).
#[derive(Debug, Clone, Copy)]
pub struct TimestampedByte {
    pub byte: u8,
    pub received_at: std::time::Instant,
}

pub struct Uart {
    port: Box<dyn SerialPort>,
}

impl Uart {
    pub fn open(path: &str, baud_rate: u32) -> Result<Self, GatewayError> {
        let port = serialport::new(path, baud_rate)
            .timeout(Duration::from_millis(50))
            .open()?;
        Ok(Self { port })
    }

    pub fn write_byte(&mut self, byte: u8) -> Result<(), GatewayError> {
        self.port.write_all(&[byte]).map_err(GatewayError::Io)
    }

    /// Split into a writer kept on the caller's side and a receiver fed
    /// by a dedicated blocking reader thread. Every byte read off the
    /// wire is timestamped and pushed to the channel; the thread exits
    /// when the channel closes or the port errors out.
    pub fn split(self) -> Result<(UartWriter, mpsc::Receiver<TimestampedByte>), GatewayError> {
        let reader_port = self.port.try_clone().map_err(GatewayError::Serial)?;
        let (tx, rx) = mpsc::channel(256);
        std::thread::spawn(move || {
            let mut port = reader_port;
            let mut buf = [0u8; 256];
            loop {
                match port.read(&mut buf) {
                    Ok(0) => continue,
                    Ok(n) => {
                        let now = std::time::Instant::now();
                        for &byte in &buf[..n] {
                            if tx
                                .blocking_send(TimestampedByte {
                                    byte,
                                    received_at: now,
                                })
                                .is_err()
                            {
                                return;
                            }
                        }
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::TimedOut => continue,
                    Err(e) => {
                        log::error!("uart read error: {e}");
                        return;
                    }
                }
            }
        });
        Ok((UartWriter { port: self.port }, rx))
    }
}

/// The write half, kept separate from the reader thread so the async
/// side can hold it directly (the echo comes back through the reader
/// channel, not a return value from `write_byte`).
pub struct UartWriter {
    port: Box<dyn SerialPort>,
}

impl UartWriter {
    pub fn write_byte(&mut self, byte: u8) -> Result<(), GatewayError> {
        self.port.write_all(&[byte]).map_err(GatewayError::Io)
    }
}
