//! Framed message connection

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpSocket, TcpStream};

use syncshot_core::{SyncError, SyncResult};
use syncshot_wire::{FrameDecoder, Message};

fn transport_error(e: io::Error) -> SyncError {
    SyncError::Transport(e.to_string())
}

/// A bidirectional message stream to one peer.
///
/// Generic over the byte stream so agents can be driven over in-memory
/// pipes; production code uses the `TcpStream` default.
#[derive(Debug)]
pub struct Connection<S = TcpStream> {
    stream: S,
    decoder: FrameDecoder,
    peer_addr: Option<SocketAddr>,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Wrap an already connected stream
    pub fn new(stream: S) -> Self {
        Connection {
            stream,
            decoder: FrameDecoder::new(),
            peer_addr: None,
        }
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    /// Write one framed message
    pub async fn send(&mut self, message: &Message) -> SyncResult<()> {
        tracing::trace!(peer = ?self.peer_addr, %message, "send");
        self.stream
            .write_all(&message.encode())
            .await
            .map_err(transport_error)?;
        self.stream.flush().await.map_err(transport_error)
    }

    /// Read the next message, waiting as long as it takes.
    ///
    /// Cancel-safe: bytes already read stay buffered for the next call.
    pub async fn recv(&mut self) -> SyncResult<Message> {
        loop {
            if let Some(message) = self.decoder.next_message()? {
                tracing::trace!(peer = ?self.peer_addr, %message, "recv");
                return Ok(message);
            }

            let read = self
                .stream
                .read_buf(self.decoder.buffer_mut())
                .await
                .map_err(transport_error)?;
            if read == 0 {
                if self.decoder.pending() > 0 {
                    tracing::debug!(
                        peer = ?self.peer_addr,
                        pending = self.decoder.pending(),
                        "stream closed mid-frame"
                    );
                }
                return Err(SyncError::ConnectionClosed);
            }
        }
    }

    /// Read the next message within `timeout`
    pub async fn recv_timeout(&mut self, timeout: Duration) -> SyncResult<Message> {
        match tokio::time::timeout(timeout, self.recv()).await {
            Ok(result) => result,
            Err(_) => Err(SyncError::ReceiveTimeout(timeout)),
        }
    }

    /// Close the write half; errors are irrelevant at this point
    pub async fn shutdown(&mut self) {
        if let Err(e) = self.stream.shutdown().await {
            tracing::debug!(peer = ?self.peer_addr, "shutdown: {}", e);
        }
    }
}

impl Connection<TcpStream> {
    /// Adopt an accepted or connected TCP stream.
    ///
    /// Nagle is disabled: every frame is a latency-critical command.
    pub fn from_tcp(stream: TcpStream) -> SyncResult<Self> {
        stream.set_nodelay(true).map_err(transport_error)?;
        let peer_addr = stream.peer_addr().map_err(transport_error)?;
        let mut connection = Connection::new(stream);
        connection.peer_addr = Some(peer_addr);
        Ok(connection)
    }

    pub fn local_addr(&self) -> SyncResult<SocketAddr> {
        self.stream.local_addr().map_err(transport_error)
    }
}

/// Connect to the coordinator.
///
/// `local_ip` pins the source address, which the coordinator uses to derive
/// the agent id.
pub async fn connect(addr: SocketAddr, local_ip: Option<IpAddr>) -> SyncResult<Connection> {
    let socket = match addr {
        SocketAddr::V4(_) => TcpSocket::new_v4(),
        SocketAddr::V6(_) => TcpSocket::new_v6(),
    };
    let socket = socket.map_err(transport_error)?;

    if let Some(ip) = local_ip {
        socket
            .bind(SocketAddr::new(ip, 0))
            .map_err(transport_error)?;
    }

    let stream = socket.connect(addr).await.map_err(transport_error)?;
    Connection::from_tcp(stream)
}

/// Connect, retrying while the coordinator is not yet listening.
///
/// Agents are usually launched before the coordinator binds, so the first
/// attempts are expected to be refused.
pub async fn connect_with_retry(
    addr: SocketAddr,
    local_ip: Option<IpAddr>,
    attempts: u32,
    backoff: Duration,
) -> SyncResult<Connection> {
    let attempts = attempts.max(1);
    let mut last_error = SyncError::ConnectionClosed;

    for attempt in 1..=attempts {
        match connect(addr, local_ip).await {
            Ok(connection) => {
                tracing::info!(%addr, attempt, "connected to coordinator");
                return Ok(connection);
            }
            Err(e) => {
                tracing::debug!(%addr, attempt, "connect failed: {}", e);
                last_error = e;
            }
        }
        if attempt < attempts {
            tokio::time::sleep(backoff).await;
        }
    }

    Err(last_error)
}
