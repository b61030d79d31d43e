//! TCP transport: the socket a [`Peer`](crate::peer::Peer) reads
//! [`Envelope`]s from and writes them to.
//!
//! Tunes the socket with `socket2` (nodelay, explicit send/recv buffer
//! sizes) and applies a backpressure posture on writes: one that blocks
//! past a short soft threshold is logged, and one that blocks past a hard
//! ceiling is failed outright rather than left to stall the connection
//! forever.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use socket2::{SockRef, TcpKeepalive};
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::warn;

use crate::codec::{read_frame, write_frame};
use crate::config::PeerConfiguration;
use crate::error::{PeerError, Result};
use crate::message::{Envelope, Received};

const BACKPRESSURE_SOFT_THRESHOLD: Duration = Duration::from_millis(5);
const BACKPRESSURE_HARD_TIMEOUT: Duration = Duration::from_secs(5);

/// A bidirectional, length-framed channel of [`Envelope`]s. A
/// [`Connection`](crate::connection::Connection) is built on top of one.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, envelope: &Envelope) -> Result<()>;
    /// `Ok(None)` means the peer closed the socket cleanly.
    async fn receive(&self) -> Result<Option<Received>>;
    async fn close(&self) -> Result<()>;
}

/// A [`Transport`] over a plain TCP socket.
pub struct TcpTransport {
    reader: Mutex<ReadHalf<TcpStream>>,
    writer: Mutex<WriteHalf<TcpStream>>,
    max_incoming: u32,
    max_outgoing: u32,
}

impl TcpTransport {
    pub async fn connect(addr: SocketAddr, config: &PeerConfiguration) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        Self::from_stream(stream, config)
    }

    pub fn from_stream(stream: TcpStream, config: &PeerConfiguration) -> Result<Self> {
        tune_socket(&stream, config)?;
        let (reader, writer) = tokio::io::split(stream);
        Ok(Self {
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
            max_incoming: config.max_incoming_message_size,
            max_outgoing: config.max_outgoing_message_size,
        })
    }
}

fn tune_socket(stream: &TcpStream, config: &PeerConfiguration) -> Result<()> {
    let sock_ref = SockRef::from(stream);
    sock_ref.set_nodelay(config.tcp_nodelay)?;
    sock_ref.set_recv_buffer_size(config.buffer_size)?;
    sock_ref.set_send_buffer_size(config.buffer_size)?;
    let keepalive = TcpKeepalive::new().with_time(Duration::from_secs(60));
    sock_ref.set_tcp_keepalive(&keepalive)?;
    Ok(())
}

#[async_trait]
impl Transport for TcpTransport {
    async fn send(&self, envelope: &Envelope) -> Result<()> {
        let started = Instant::now();
        let mut writer = self.writer.lock().await;
        let result = tokio::time::timeout(
            BACKPRESSURE_HARD_TIMEOUT,
            write_frame(&mut *writer, envelope, self.max_outgoing),
        )
        .await;

        let elapsed = started.elapsed();
        if elapsed > BACKPRESSURE_SOFT_THRESHOLD {
            warn!(?elapsed, "slow write to transport, peer may be backpressured");
        }

        match result {
            Ok(inner) => inner,
            Err(_) => Err(PeerError::Connection(format!(
                "write blocked for more than {BACKPRESSURE_HARD_TIMEOUT:?}"
            ))),
        }
    }

    async fn receive(&self) -> Result<Option<Received>> {
        let mut reader = self.reader.lock().await;
        read_frame(&mut *reader, self.max_incoming).await
    }

    async fn close(&self) -> Result<()> {
        use tokio::io::AsyncWriteExt;
        let mut writer = self.writer.lock().await;
        writer.shutdown().await.map_err(PeerError::Io)
    }
}

/// Lets tests drive [`Transport::send`]/[`Transport::receive`] over any
/// in-memory duplex pipe instead of a real socket.
pub struct PipeTransport<R, W> {
    reader: Mutex<R>,
    writer: Mutex<W>,
    max_incoming: u32,
    max_outgoing: u32,
}

impl<R, W> PipeTransport<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(reader: R, writer: W, config: &PeerConfiguration) -> Self {
        Self {
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
            max_incoming: config.max_incoming_message_size,
            max_outgoing: config.max_outgoing_message_size,
        }
    }
}

#[async_trait]
impl<R, W> Transport for PipeTransport<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    async fn send(&self, envelope: &Envelope) -> Result<()> {
        let mut writer = self.writer.lock().await;
        write_frame(&mut *writer, envelope, self.max_outgoing).await
    }

    async fn receive(&self) -> Result<Option<Received>> {
        let mut reader = self.reader.lock().await;
        read_frame(&mut *reader, self.max_incoming).await
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{CacheResponse, Frame, WireBody};

    #[tokio::test]
    async fn pipe_transport_round_trips_an_envelope() {
        let (client, server) = tokio::io::duplex(4096);
        let config = PeerConfiguration::default();
        let (client_read, client_write) = tokio::io::split(client);
        let (server_read, server_write) = tokio::io::split(server);
        let client_transport = PipeTransport::new(client_read, client_write, &config);
        let server_transport = PipeTransport::new(server_read, server_write, &config);

        let envelope = Envelope::new(
            5,
            Frame::response(1, 1, WireBody::CacheResponse(CacheResponse::Size(3))),
        );
        client_transport.send(&envelope).await.unwrap();
        let received = server_transport.receive().await.unwrap().unwrap().into_envelope();
        assert_eq!(received.channel_id, 5);
    }
}
