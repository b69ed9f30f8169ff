//! TCP front door: three listeners (read-only monitor, regular
//! passthrough, enhanced framed) multiplexing network clients onto the
//! bus and the scheduler's active-send queue.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use log::{debug, info};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, Mutex};

use crate::config::PortsConfig;
use crate::enhanced::{FramingError, Request, RequestReader, Response, ERR_FRAMING};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientKind {
    ReadOnly,
    Regular,
    Enhanced,
}

pub struct ClientManager {
    ports: PortsConfig,
    bus_tx: mpsc::Sender<u8>,
    bus_monitor: broadcast::Sender<u8>,
    arbitration_owner: Arc<Mutex<Option<u64>>>,
    next_client_id: AtomicU64,
}

impl ClientManager {
    pub fn new(
        ports: PortsConfig,
        bus_tx: mpsc::Sender<u8>,
        bus_monitor: broadcast::Sender<u8>,
    ) -> Arc<Self> {
        Arc::new(Self {
            ports,
            bus_tx,
            bus_monitor,
            arbitration_owner: Arc::new(Mutex::new(None)),
            next_client_id: AtomicU64::new(1),
        })
    }

    pub async fn run(self: Arc<Self>) -> anyhow::Result<()> {
        let read_only = TcpListener::bind(("0.0.0.0", self.ports.read_only)).await?;
        let regular = TcpListener::bind(("0.0.0.0", self.ports.regular)).await?;
        let enhanced = TcpListener::bind(("0.0.0.0", self.ports.enhanced)).await?;

        info!(
            "client listeners up: read-only={} regular={} enhanced={}",
            self.ports.read_only, self.ports.regular, self.ports.enhanced
        );

        let this_ro = self.clone();
        let ro_task = tokio::spawn(async move { this_ro.accept_loop(read_only, ClientKind::ReadOnly).await });
        let this_reg = self.clone();
        let reg_task = tokio::spawn(async move { this_reg.accept_loop(regular, ClientKind::Regular).await });
        let this_enh = self.clone();
        let enh_task = tokio::spawn(async move { this_enh.accept_loop(enhanced, ClientKind::Enhanced).await });

        let _ = tokio::try_join!(ro_task, reg_task, enh_task)?;
        Ok(())
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener, kind: ClientKind) -> anyhow::Result<()> {
        loop {
            let (stream, addr) = listener.accept().await?;
            debug!("{:?} client connected from {}", kind, addr);
            let this = self.clone();
            tokio::spawn(async move {
                let id = this.next_client_id.fetch_add(1, Ordering::Relaxed);
                let result = match kind {
                    ClientKind::ReadOnly => this.handle_read_only(stream).await,
                    ClientKind::Regular => this.handle_regular(stream).await,
                    ClientKind::Enhanced => this.handle_enhanced(stream, id).await,
                };
                if let Err(e) = result {
                    debug!("{:?} client {} disconnected: {}", kind, addr, e);
                }
                if kind == ClientKind::Enhanced {
                    let mut owner = this.arbitration_owner.lock().await;
                    if *owner == Some(id) {
                        *owner = None;
                    }
                }
            });
        }
    }

    /// Pure monitor: streams every bus byte to the client, ignores
    /// anything the client writes.
    async fn handle_read_only(&self, mut stream: TcpStream) -> anyhow::Result<()> {
        let mut rx = self.bus_monitor.subscribe();
        let mut discard = [0u8; 256];
        loop {
            tokio::select! {
                byte = rx.recv() => {
                    match byte {
                        Ok(b) => stream.write_all(&[b]).await?,
                        Err(broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(broadcast::error::RecvError::Closed) => return Ok(()),
                    }
                }
                n = stream.read(&mut discard) => {
                    if n? == 0 { return Ok(()); }
                }
            }
        }
    }

    /// Regular client: raw bytes straight from TCP are pulled one at a
    /// time and handed to the bus as arbitration/send bytes; every byte
    /// received on the bus is mirrored back raw. No length prefixing or
    /// framing of any kind.
    async fn handle_regular(&self, mut stream: TcpStream) -> anyhow::Result<()> {
        let mut rx = self.bus_monitor.subscribe();
        let mut in_buf = [0u8; 1];
        loop {
            tokio::select! {
                byte = rx.recv() => {
                    match byte {
                        Ok(b) => stream.write_all(&[b]).await?,
                        Err(broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(broadcast::error::RecvError::Closed) => return Ok(()),
                    }
                }
                n = stream.read(&mut in_buf) => {
                    if n? == 0 {
                        return Ok(());
                    }
                    if self.bus_tx.send(in_buf[0]).await.is_err() {
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Enhanced client: framed per [`crate::enhanced`]. `CMD_SEND` bytes
    /// go straight to the bus; `CMD_START`/`CMD_INIT` manage this
    /// client's arbitration slot.
    async fn handle_enhanced(&self, mut stream: TcpStream, id: u64) -> anyhow::Result<()> {
        let mut reader = RequestReader::default();
        let mut buf = [0u8; 1];
        loop {
            let n = stream.read(&mut buf).await?;
            if n == 0 {
                return Ok(());
            }
            match reader.push(buf[0]) {
                Ok(Some(request)) => {
                    let response = self.process_enhanced(request, id).await;
                    stream.write_all(&response.encode()).await?;
                }
                Ok(None) => {}
                Err(FramingError::FirstByteSignature | FramingError::SecondByteSignature) => {
                    stream
                        .write_all(&Response::ErrorHost(ERR_FRAMING).encode())
                        .await?;
                }
            }
        }
    }

    async fn process_enhanced(&self, request: Request, id: u64) -> Response {
        match request {
            Request::Init => Response::Resetted,
            Request::Start(sync_byte) if sync_byte == crate::sequence::SYN => {
                let mut owner = self.arbitration_owner.lock().await;
                *owner = None;
                Response::Started(0)
            }
            Request::Start(address) => {
                let mut owner = self.arbitration_owner.lock().await;
                match *owner {
                    None => {
                        *owner = Some(id);
                        Response::Started(address)
                    }
                    Some(current) if current == id => Response::Started(address),
                    Some(_) => Response::ErrorHost(ERR_FRAMING),
                }
            }
            Request::Send(byte) => {
                if self.bus_tx.send(byte).await.is_ok() {
                    Response::Received(byte)
                } else {
                    Response::Failed(byte)
                }
            }
            Request::Info => Response::Info(0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arbitration_owner_starts_empty() {
        let owner: Option<u64> = None;
        assert_eq!(owner, None);
    }
}
