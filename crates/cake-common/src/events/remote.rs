//! Out-of-process event bus over TCP.
//!
//! A [`BusServer`] hosts a [`LocalBus`] and accepts connections. Clients
//! ([`RemoteBus`]) exchange frames with it: a 4 byte big-endian length prefix
//! followed by a JSON payload.
//!
//! - `publish` frames are fanned out to every subscribed connection
//! - a `subscribe` frame is acknowledged with `subscribed` only after the
//!   subscriber is registered, so nothing published after `subscribe()`
//!   returns can be missed

use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{EventBus, EventReceiver, LocalBus, StatusEvent};
use crate::{Error, Result};

/// Refuse frames larger than this
const MAX_FRAME_BYTES: usize = 1024 * 1024;

/// Deadline for connecting to the broker and for each frame write
const IO_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum Frame {
    Publish { event: StatusEvent },
    Subscribe,
    Subscribed,
    Event { event: StatusEvent },
}

async fn write_frame<W: AsyncWrite + Unpin>(w: &mut W, frame: &Frame) -> std::io::Result<()> {
    let bytes = serde_json::to_vec(frame)?;
    let len = u32::try_from(bytes.len())
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidData, "frame too large"))?;
    w.write_all(&len.to_be_bytes()).await?;
    w.write_all(&bytes).await?;
    w.flush().await
}

/// Read one frame; `Ok(None)` on clean EOF.
async fn read_frame<R: AsyncRead + Unpin>(r: &mut R) -> std::io::Result<Option<Frame>> {
    let mut len_buf = [0u8; 4];
    match r.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_BYTES {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("frame of {len} bytes exceeds limit"),
        ));
    }
    let mut payload = vec![0u8; len];
    r.read_exact(&mut payload).await?;
    let frame = serde_json::from_slice(&payload)?;
    Ok(Some(frame))
}

/// TCP broker for the event bus
pub struct BusServer {
    listener: TcpListener,
    bus: LocalBus,
}

impl BusServer {
    /// Bind the broker to `addr`
    pub async fn bind(addr: &str) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| Error::connectivity(addr, format!("failed to bind event bus: {e}")))?;
        Ok(Self {
            listener,
            bus: LocalBus::new(),
        })
    }

    /// Address the broker is listening on
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// In-process handle onto the broker's bus.
    ///
    /// Events published here reach remote subscribers and vice versa.
    pub fn bus(&self) -> LocalBus {
        self.bus.clone()
    }

    /// Run the accept loop on a background task
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.serve())
    }

    /// Run the accept loop until the task is cancelled
    pub async fn serve(self) {
        if let Ok(addr) = self.listener.local_addr() {
            info!(addr = %addr, "Event bus broker listening");
        }
        loop {
            match self.listener.accept().await {
                Ok((stream, peer)) => {
                    debug!(peer = %peer, "event bus client connected");
                    let bus = self.bus.clone();
                    tokio::spawn(handle_client(stream, bus));
                }
                Err(e) => warn!(error = %e, "Failed to accept event bus connection"),
            }
        }
    }
}

async fn handle_client(stream: TcpStream, bus: LocalBus) {
    let (mut read_half, write_half) = stream.into_split();
    let mut write_half = Some(write_half);
    let mut forwarder: Option<JoinHandle<()>> = None;

    loop {
        let frame = match read_frame(&mut read_half).await {
            Ok(Some(frame)) => frame,
            Ok(None) => break,
            Err(e) => {
                warn!(error = %e, "dropping event bus client after bad frame");
                break;
            }
        };

        match frame {
            Frame::Publish { event } => bus.fan_out(event),
            Frame::Subscribe => {
                let Some(mut writer) = write_half.take() else {
                    warn!("duplicate subscribe on one connection ignored");
                    continue;
                };
                let mut receiver = bus.register();
                if write_frame(&mut writer, &Frame::Subscribed).await.is_err() {
                    break;
                }
                forwarder = Some(tokio::spawn(async move {
                    while let Some(event) = receiver.recv().await {
                        if write_frame(&mut writer, &Frame::Event { event })
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                }));
            }
            Frame::Subscribed | Frame::Event { .. } => {
                warn!("ignoring server-only frame sent by client");
            }
        }
    }

    // A subscriber keeps its forwarder alive until the peer hangs up
    if let Some(task) = forwarder {
        let _ = task.await;
    }
}

/// Client side of the TCP event bus
pub struct RemoteBus {
    addr: String,
    writer: Mutex<OwnedWriteHalf>,
}

impl RemoteBus {
    /// Connect to a broker. Failure is a connectivity error.
    pub async fn connect(addr: impl Into<String>) -> Result<Self> {
        let addr = addr.into();
        let stream = dial(&addr).await?;
        let (_read, writer) = stream.into_split();
        Ok(Self {
            addr,
            writer: Mutex::new(writer),
        })
    }

    /// Broker address this client talks to
    pub fn addr(&self) -> &str {
        &self.addr
    }
}

async fn dial(addr: &str) -> Result<TcpStream> {
    match tokio::time::timeout(IO_TIMEOUT, TcpStream::connect(addr)).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(e)) => Err(Error::connectivity(addr, e.to_string())),
        Err(_) => Err(Error::connectivity(addr, "connect timed out")),
    }
}

#[async_trait]
impl EventBus for RemoteBus {
    async fn publish(&self, event: StatusEvent) -> Result<()> {
        let mut writer = self.writer.lock().await;
        match tokio::time::timeout(
            IO_TIMEOUT,
            write_frame(&mut *writer, &Frame::Publish { event }),
        )
        .await
        {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(Error::connectivity(&self.addr, e.to_string())),
            Err(_) => Err(Error::connectivity(&self.addr, "publish timed out")),
        }
    }

    async fn subscribe(&self) -> Result<EventReceiver> {
        let stream = dial(&self.addr).await?;
        let (mut read_half, mut write_half) = stream.into_split();

        let handshake = async {
            write_frame(&mut write_half, &Frame::Subscribe).await?;
            read_frame(&mut read_half).await
        };
        match tokio::time::timeout(IO_TIMEOUT, handshake).await {
            Ok(Ok(Some(Frame::Subscribed))) => {}
            Ok(Ok(other)) => {
                return Err(Error::connectivity(
                    &self.addr,
                    format!("unexpected subscribe reply: {other:?}"),
                ))
            }
            Ok(Err(e)) => return Err(Error::connectivity(&self.addr, e.to_string())),
            Err(_) => return Err(Error::connectivity(&self.addr, "subscribe timed out")),
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let addr = self.addr.clone();
        tokio::spawn(async move {
            // Holding the write half keeps the subscription open
            let _write_half = write_half;
            loop {
                match read_frame(&mut read_half).await {
                    Ok(Some(Frame::Event { event })) => {
                        if tx.send(event).is_err() {
                            break;
                        }
                    }
                    Ok(Some(_)) => {}
                    Ok(None) => break,
                    Err(e) => {
                        warn!(addr = %addr, error = %e, "event bus subscription lost");
                        break;
                    }
                }
            }
        });

        Ok(EventReceiver::new(rx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn broker() -> (String, LocalBus) {
        let server = BusServer::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr().unwrap().to_string();
        let bus = server.bus();
        server.spawn();
        (addr, bus)
    }

    /// Story: a provisioning process and a remote progress server share a bus
    #[tokio::test]
    async fn story_events_cross_process_boundary_in_order() {
        let (addr, _local) = broker().await;

        let subscriber = RemoteBus::connect(&addr).await.unwrap();
        let mut events = subscriber.subscribe().await.unwrap();

        let publisher = RemoteBus::connect(&addr).await.unwrap();
        for msg in [
            "phase-start:install-control-plane",
            "clusterctl init",
            "phase-end:install-control-plane",
        ] {
            publisher.publish(StatusEvent::checkpoint(msg)).await.unwrap();
        }

        assert_eq!(
            events.recv().await.unwrap().msg,
            "phase-start:install-control-plane"
        );
        assert_eq!(events.recv().await.unwrap().msg, "clusterctl init");
        assert_eq!(
            events.recv().await.unwrap().msg,
            "phase-end:install-control-plane"
        );
    }

    #[tokio::test]
    async fn in_process_publish_reaches_remote_subscriber() {
        let (addr, local) = broker().await;
        let remote = RemoteBus::connect(&addr).await.unwrap();
        let mut events = remote.subscribe().await.unwrap();

        local
            .publish(StatusEvent::warning("namespace exists"))
            .await
            .unwrap();
        let event = events.recv().await.unwrap();
        assert_eq!(event.msg, "namespace exists");
        assert_eq!(event.level, crate::events::Level::Warn);
    }

    #[tokio::test]
    async fn unreachable_broker_is_a_connectivity_error() {
        // Bind then drop to get a port nobody listens on
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        match RemoteBus::connect(&addr).await {
            Err(Error::Connectivity { endpoint, .. }) => assert_eq!(endpoint, addr),
            Err(other) => panic!("expected connectivity error, got {other:?}"),
            Ok(_) => panic!("expected connectivity error, got a connection"),
        }
    }

    #[tokio::test]
    async fn oversized_frame_is_rejected() {
        let (mut client, mut server) = tokio::io::duplex(64);
        let len = (MAX_FRAME_BYTES as u32 + 1).to_be_bytes();
        client.write_all(&len).await.unwrap();
        let err = read_frame(&mut server).await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
    }
}
