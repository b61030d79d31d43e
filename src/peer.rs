//! `Peer`: the service loop that owns a connection's socket, decodes
//! incoming frames and routes them to the right channel.
//!
//! The loop itself is a single Tokio task reading from the transport in a
//! tight `receive().await` cycle. A second task drives the periodic ping
//! when `ping_interval` is set.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::config::PeerConfiguration;
use crate::connection::{ChannelRole, Connection};
use crate::error::{protocol_bail, Result};
use crate::message::{Envelope, PeerWire, Received, WireBody};
use crate::protocol::{self, VersionRange};
use crate::transport::{TcpTransport, Transport};

/// Lifecycle state of a [`Peer`]'s service loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    Initial,
    Starting,
    Started,
    Stopping,
    Stopped,
}

/// Owns a [`Connection`] and the background tasks that keep it alive:
/// the frame-dispatch loop and, if configured, the periodic ping.
pub struct Peer {
    connection: Arc<Connection>,
    control_channel: Arc<crate::channel::Channel>,
    config: PeerConfiguration,
    state: Mutex<ServiceState>,
    /// Protocols this peer will accept an inbound channel open for, keyed
    /// by name, each with the version range to negotiate against the
    /// requester -- the acceptor-side counterpart to the range
    /// `open_channel`'s caller supplies for an outbound one.
    acceptable_protocols: parking_lot::Mutex<HashMap<String, VersionRange>>,
}

impl Peer {
    /// Dial `addr` over TCP and bring a peer up on top of it.
    pub async fn connect(addr: SocketAddr, config: PeerConfiguration) -> Result<Arc<Self>> {
        let transport = Arc::new(TcpTransport::connect(addr, &config).await?);
        Self::start(transport, config).await
    }

    /// Bring a peer up over an already-established transport (a real
    /// socket, or a [`crate::transport::PipeTransport`] in tests).
    pub async fn start(transport: Arc<dyn Transport>, config: PeerConfiguration) -> Result<Arc<Self>> {
        let connection = Connection::new(uuid::Uuid::new_v4(), transport, config.clone());
        let control_channel =
            connection.open_control_channel(protocol::PEER_PROTOCOL_VERSION.current);

        let peer = Arc::new(Self {
            connection,
            control_channel,
            config,
            state: Mutex::new(ServiceState::Starting),
            acceptable_protocols: parking_lot::Mutex::new(HashMap::new()),
        });

        peer.clone().spawn_service_loop();
        *peer.state.lock().await = ServiceState::Started;
        Ok(peer)
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    pub fn control_channel(&self) -> &Arc<crate::channel::Channel> {
        &self.control_channel
    }

    /// Open a new channel for `protocol` at a version negotiated against
    /// `remote_range`, the first step a [`crate::cache::RemoteCache`]
    /// takes before issuing any request.
    ///
    /// The channel id is chosen by this side and proposed in the open
    /// request, mirroring how the original acceptor validates a
    /// caller-supplied id (reserved id 0, duplicates) rather than minting
    /// one itself.
    pub async fn open_channel(
        &self,
        protocol_name: &str,
        local_range: VersionRange,
        remote_range: VersionRange,
    ) -> Result<Arc<crate::channel::Channel>> {
        let version = protocol::negotiate_version(local_range, remote_range)?;
        let channel = self.connection.create_channel(
            protocol_name.to_string(),
            version,
            ChannelRole::Initiator,
        );

        let response = self
            .control_channel
            .request(
                WireBody::Peer(PeerWire::OpenChannelRequest {
                    channel_id: channel.id(),
                    protocol: protocol_name.to_string(),
                    protocol_version: version,
                    receiver_name: None,
                    identity_token: None,
                }),
                Some(self.config.request_timeout),
            )
            .await;

        if let Err(e) = response {
            self.connection.remove_channel(channel.id());
            return Err(e);
        }

        Ok(channel)
    }

    /// Declare that this peer will accept an inbound channel open for
    /// `protocol`, negotiating within `version_range` the same way
    /// [`open_channel`](Self::open_channel) negotiates for an outbound
    /// one. Without a matching call here, an `OpenChannelRequest` or
    /// `AcceptChannelRequest` naming that protocol is refused.
    pub fn accept_channel_for(&self, protocol: impl Into<String>, version_range: VersionRange) {
        self.acceptable_protocols
            .lock()
            .insert(protocol.into(), version_range);
    }

    pub async fn close(&self, cause: Option<String>) {
        *self.state.lock().await = ServiceState::Stopping;
        self.connection.close(cause).await;
        *self.state.lock().await = ServiceState::Stopped;
    }

    pub async fn state(&self) -> ServiceState {
        *self.state.lock().await
    }

    fn spawn_service_loop(self: Arc<Self>) {
        let reader = self.clone();
        tokio::spawn(async move { reader.service_loop().await });

        if let Some(interval) = self.config.ping_interval {
            let pinger = self.clone();
            tokio::spawn(async move { pinger.ping_loop(interval).await });
        }
    }

    async fn service_loop(self: Arc<Self>) {
        loop {
            match self.connection.receive().await {
                Ok(Some(Received::Envelope(envelope))) => self.dispatch(envelope).await,
                Ok(Some(Received::BadChannelFrame { channel_id, error })) => {
                    warn!(channel_id, error = %error, "dropping a frame that failed to decode, closing only its channel");
                    if let Some(channel) = self.connection.remove_channel(channel_id) {
                        channel.close(Some(error.to_string())).await;
                    }
                }
                Ok(None) => {
                    debug!("peer closed the connection");
                    self.connection
                        .close(Some("peer closed the connection".into()))
                        .await;
                    break;
                }
                Err(e) => {
                    warn!(error = %e, "transport read failed, closing connection");
                    self.connection.close(Some(e.to_string())).await;
                    break;
                }
            }
        }
    }

    async fn dispatch(&self, envelope: Envelope) {
        let Envelope { channel_id, frame } = envelope;

        if channel_id == 0 {
            match &frame.body {
                WireBody::Peer(PeerWire::Ping) => {
                    if let Some(request_id) = frame.request_id {
                        let control = self.control_channel.clone();
                        tokio::spawn(async move {
                            if let Err(e) = control
                                .reply(request_id, WireBody::Peer(PeerWire::Pong))
                                .await
                            {
                                warn!(error = %e, "failed to answer a ping");
                            }
                        });
                    }
                }
                WireBody::Peer(PeerWire::OpenChannelRequest {
                    channel_id: proposed_id,
                    protocol,
                    protocol_version,
                    ..
                }) => {
                    if let Some(request_id) = frame.request_id {
                        let proposed_id = *proposed_id;
                        let protocol = protocol.clone();
                        let protocol_version = *protocol_version;
                        self.handle_open_channel_request(request_id, proposed_id, protocol, protocol_version)
                            .await;
                    }
                }
                WireBody::Peer(PeerWire::AcceptChannelRequest { uri, .. }) => {
                    if let Some(request_id) = frame.request_id {
                        let uri = uri.clone();
                        self.handle_accept_channel_request(request_id, uri).await;
                    }
                }
                _ => self.control_channel.complete(frame),
            }
            return;
        }

        let Some(channel) = self.connection.channel(channel_id) else {
            debug!(channel_id, "frame for an unknown channel, dropping it");
            return;
        };

        match &frame.body {
            WireBody::Event(_) => channel.dispatch_push(frame),
            _ => channel.complete(frame),
        }
    }

    /// Answer an inbound `OpenChannelRequest`: the remote's own id, proposed
    /// as its side's initiator, is adopted as-is (it already satisfies the
    /// initiator-side positivity rule if the remote followed it); this peer
    /// only validates and registers.
    async fn handle_open_channel_request(
        &self,
        request_id: u64,
        proposed_id: i32,
        protocol: String,
        protocol_version: i32,
    ) {
        let body = match self.accept_proposed_channel(&protocol, protocol_version, proposed_id) {
            Ok(()) => WireBody::Peer(PeerWire::OpenChannelResponse { channel_id: proposed_id }),
            Err(e) => WireBody::Failure { code: 0, message: e.to_string() },
        };
        if let Err(e) = self.control_channel.reply(request_id, body).await {
            warn!(error = %e, "failed to answer an OpenChannelRequest");
        }
    }

    /// Answer an inbound `AcceptChannelRequest`: the uri names the channel
    /// id and protocol the remote wants this peer to adopt for a channel it
    /// already opened elsewhere (e.g. handed out by an earlier cache
    /// operation), rather than proposing a fresh one.
    async fn handle_accept_channel_request(&self, request_id: u64, uri: String) {
        let outcome = uri.parse::<protocol::ChannelUri>().and_then(|parsed| {
            self.accept_proposed_channel(&parsed.protocol, protocol::PEER_PROTOCOL_VERSION.current, parsed.channel_id)
        });
        let body = match outcome {
            Ok(()) => WireBody::Peer(PeerWire::AcceptChannelResponse),
            Err(e) => WireBody::Failure { code: 0, message: e.to_string() },
        };
        if let Err(e) = self.control_channel.reply(request_id, body).await {
            warn!(error = %e, "failed to answer an AcceptChannelRequest");
        }
    }

    fn accept_proposed_channel(&self, protocol_name: &str, protocol_version: i32, proposed_id: i32) -> Result<()> {
        let Some(range) = self.acceptable_protocols.lock().get(protocol_name).copied() else {
            protocol_bail!("no receiver registered for protocol {protocol_name}");
        };
        let requested = VersionRange::new(protocol_version, protocol_version);
        let negotiated = protocol::negotiate_version(range, requested)?;
        self.connection
            .accept_channel(proposed_id, protocol_name.to_string(), negotiated)?;
        Ok(())
    }

    async fn ping_loop(self: Arc<Self>, interval: Duration) {
        let timeout = self.config.effective_ping_timeout();
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await; // first tick fires immediately; skip it

        loop {
            ticker.tick().await;
            if !self.connection.is_open() {
                break;
            }
            let result = self
                .control_channel
                .request(WireBody::Peer(PeerWire::Ping), Some(timeout))
                .await;
            if let Err(e) = result {
                warn!(error = %e, "did not receive a response to a ping, closing connection");
                self.connection
                    .close(Some(format!("did not receive a response to a ping: {e}")))
                    .await;
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{CacheResponse, Frame};
    use crate::transport::PipeTransport;

    #[tokio::test]
    async fn answers_a_ping_with_a_pong() {
        let (client_io, server_io) = tokio::io::duplex(8192);
        let config = PeerConfiguration::default();
        let (cr, cw) = tokio::io::split(client_io);
        let (sr, sw) = tokio::io::split(server_io);
        let client_transport = Arc::new(PipeTransport::new(cr, cw, &config));
        let server_transport = Arc::new(PipeTransport::new(sr, sw, &config));

        let _peer = Peer::start(client_transport, config).await.unwrap();

        server_transport
            .send(&Envelope::new(0, Frame::request(1, 1, WireBody::Peer(PeerWire::Ping))))
            .await
            .unwrap();

        let response = server_transport.receive().await.unwrap().unwrap().into_envelope();
        assert!(matches!(response.frame.body, WireBody::Peer(PeerWire::Pong)));
        assert_eq!(response.frame.request_id, Some(1));
    }

    #[tokio::test]
    async fn routes_a_cache_response_to_its_channel() {
        let (client_io, server_io) = tokio::io::duplex(8192);
        let config = PeerConfiguration::default();
        let (cr, cw) = tokio::io::split(client_io);
        let (sr, sw) = tokio::io::split(server_io);
        let client_transport = Arc::new(PipeTransport::new(cr, cw, &config));
        let server_transport = Arc::new(PipeTransport::new(sr, sw, &config));

        let peer = Peer::start(client_transport, config.clone()).await.unwrap();
        let channel = peer
            .connection()
            .create_channel("NamedCacheProtocol".into(), 1, ChannelRole::Initiator);

        let request_task = {
            let channel = channel.clone();
            tokio::spawn(async move {
                channel
                    .request(
                        WireBody::CacheRequest(crate::message::CacheRequest::Size),
                        Some(Duration::from_secs(1)),
                    )
                    .await
            })
        };

        let incoming = server_transport.receive().await.unwrap().unwrap().into_envelope();
        let request_id = incoming.frame.request_id.unwrap();
        server_transport
            .send(&Envelope::new(
                incoming.channel_id,
                Frame::response(
                    request_id,
                    1,
                    WireBody::CacheResponse(CacheResponse::Size(7)),
                ),
            ))
            .await
            .unwrap();

        let response = request_task.await.unwrap().unwrap();
        assert!(matches!(
            response.body,
            WireBody::CacheResponse(CacheResponse::Size(7))
        ));
    }

    #[tokio::test]
    async fn accepts_an_inbound_open_channel_request_for_a_registered_protocol() {
        let (client_io, server_io) = tokio::io::duplex(8192);
        let config = PeerConfiguration::default();
        let (cr, cw) = tokio::io::split(client_io);
        let (sr, sw) = tokio::io::split(server_io);
        let client_transport = Arc::new(PipeTransport::new(cr, cw, &config));
        let server_transport = Arc::new(PipeTransport::new(sr, sw, &config));

        let peer = Peer::start(client_transport, config).await.unwrap();
        peer.accept_channel_for("NamedCacheProtocol", VersionRange::new(1, 1));

        server_transport
            .send(&Envelope::new(
                0,
                Frame::request(
                    1,
                    1,
                    WireBody::Peer(PeerWire::OpenChannelRequest {
                        channel_id: 42,
                        protocol: "NamedCacheProtocol".into(),
                        protocol_version: 1,
                        receiver_name: None,
                        identity_token: None,
                    }),
                ),
            ))
            .await
            .unwrap();

        let response = server_transport.receive().await.unwrap().unwrap().into_envelope();
        match response.frame.body {
            WireBody::Peer(PeerWire::OpenChannelResponse { channel_id }) => {
                assert_eq!(channel_id, 42);
            }
            other => panic!("expected an OpenChannelResponse, got {other:?}"),
        }
        assert!(peer.connection().channel(42).is_some());
    }

    #[tokio::test]
    async fn refuses_an_inbound_open_channel_request_for_an_unregistered_protocol() {
        let (client_io, server_io) = tokio::io::duplex(8192);
        let config = PeerConfiguration::default();
        let (cr, cw) = tokio::io::split(client_io);
        let (sr, sw) = tokio::io::split(server_io);
        let client_transport = Arc::new(PipeTransport::new(cr, cw, &config));
        let server_transport = Arc::new(PipeTransport::new(sr, sw, &config));

        let peer = Peer::start(client_transport, config).await.unwrap();

        server_transport
            .send(&Envelope::new(
                0,
                Frame::request(
                    1,
                    1,
                    WireBody::Peer(PeerWire::OpenChannelRequest {
                        channel_id: 42,
                        protocol: "NamedCacheProtocol".into(),
                        protocol_version: 1,
                        receiver_name: None,
                        identity_token: None,
                    }),
                ),
            ))
            .await
            .unwrap();

        let response = server_transport.receive().await.unwrap().unwrap().into_envelope();
        assert!(matches!(response.frame.body, WireBody::Failure { .. }));
        assert!(peer.connection().channel(42).is_none());
    }
}
