//! `Connection`: one multiplexed link to a peer, owning its channel table
//! and the transport the channels write through.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use rand::Rng;
use uuid::Uuid;

use crate::channel::Channel;
use crate::config::PeerConfiguration;
use crate::error::{PeerError, Result};
use crate::gate::{EntryGate, SharedGate};
use crate::message::{Envelope, Frame, Received};
use crate::transport::Transport;

/// Which side minted a channel id, constraining which half of the signed
/// range it must be drawn from: an id this connection proposes as the
/// initiator of a channel open is positive, one it proposes as the
/// acceptor of somebody else's is negative. Id `0` is reserved for the
/// control channel regardless of role.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelRole {
    Initiator,
    Acceptor,
}

/// A connection to a peer: its identity, its open channels, and the
/// transport those channels write through.
///
/// Channels hold only a [`Weak`] reference back here: a connection
/// outlives every channel it hosts, never the reverse, so the strong
/// direction of the reference must point from connection to channel.
pub struct Connection {
    id: Uuid,
    transport: Arc<dyn Transport>,
    config: PeerConfiguration,
    channels: Mutex<HashMap<i32, Arc<Channel>>>,
    gate: SharedGate,
    open: AtomicBool,
}

impl Connection {
    pub fn new(id: Uuid, transport: Arc<dyn Transport>, config: PeerConfiguration) -> Arc<Self> {
        Arc::new(Self {
            id,
            transport,
            config,
            channels: Mutex::new(HashMap::new()),
            gate: Arc::new(EntryGate::new()),
            open: AtomicBool::new(true),
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn config(&self) -> &PeerConfiguration {
        &self.config
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    /// Pick a channel id not already in use, drawn from the half of the
    /// signed range `role` owns: `1..=i32::MAX` for an initiator,
    /// `i32::MIN..=-1` for an acceptor.
    fn generate_channel_id(&self, channels: &HashMap<i32, Arc<Channel>>, role: ChannelRole) -> i32 {
        let mut rng = rand::thread_rng();
        loop {
            let candidate: i32 = match role {
                ChannelRole::Initiator => rng.gen_range(1..=i32::MAX),
                ChannelRole::Acceptor => rng.gen_range(i32::MIN..=-1),
            };
            if !channels.contains_key(&candidate) {
                return candidate;
            }
        }
    }

    /// Open a new channel for `protocol` at `protocol_version`, typically
    /// the result of a prior [`crate::protocol::negotiate_version`] call.
    /// `role` decides which half of the channel id space this side draws
    /// from; [`Peer::open_channel`](crate::peer::Peer::open_channel) always
    /// creates as [`ChannelRole::Initiator`].
    pub fn create_channel(
        self: &Arc<Self>,
        protocol: String,
        protocol_version: i32,
        role: ChannelRole,
    ) -> Arc<Channel> {
        let mut channels = self.channels.lock();
        let id = self.generate_channel_id(&channels, role);
        let channel = Arc::new(Channel::new(id, protocol, protocol_version, Arc::downgrade(self)));
        channels.insert(id, channel.clone());
        channel
    }

    /// Register a channel at an id the remote peer itself proposed (its
    /// own [`create_channel`](Self::create_channel) as
    /// [`ChannelRole::Initiator`]), rather than minting one locally:
    /// whichever side opens a channel picks the id, the other side only
    /// validates and adopts it. Used by
    /// [`Peer`](crate::peer::Peer)'s acceptor-side `OpenChannelRequest`/
    /// `AcceptChannelRequest` handling.
    pub fn accept_channel(
        self: &Arc<Self>,
        id: i32,
        protocol: String,
        protocol_version: i32,
    ) -> Result<Arc<Channel>> {
        if id <= 0 {
            return Err(PeerError::Protocol(format!(
                "proposed channel id {id} is not a valid initiator-side id"
            )));
        }
        let mut channels = self.channels.lock();
        if channels.contains_key(&id) {
            return Err(PeerError::Protocol(format!(
                "channel id {id} is already in use on this connection"
            )));
        }
        let channel = Arc::new(Channel::new(id, protocol, protocol_version, Arc::downgrade(self)));
        channels.insert(id, channel.clone());
        Ok(channel)
    }

    /// Register the always-open control channel at the well-known id 0.
    pub fn open_control_channel(self: &Arc<Self>, protocol_version: i32) -> Arc<Channel> {
        let channel = Arc::new(Channel::new(
            0,
            crate::protocol::PEER_PROTOCOL.to_string(),
            protocol_version,
            Arc::downgrade(self),
        ));
        self.channels.lock().insert(0, channel.clone());
        channel
    }

    pub fn channel(&self, id: i32) -> Option<Arc<Channel>> {
        self.channels.lock().get(&id).cloned()
    }

    pub(crate) fn remove_channel(&self, id: i32) -> Option<Arc<Channel>> {
        self.channels.lock().remove(&id)
    }

    pub(crate) async fn send_frame(&self, channel_id: i32, frame: Frame) -> Result<()> {
        if !self.is_open() {
            return Err(PeerError::Connection(format!(
                "connection {} is closed",
                self.id
            )));
        }
        let _entered = self.gate.enter().await;
        self.transport.send(&Envelope::new(channel_id, frame)).await
    }

    pub(crate) async fn receive(&self) -> Result<Option<Received>> {
        self.transport.receive().await
    }

    /// The five-step close sequence: stop admitting new work,
    /// drain what's in flight, close every channel (failing its pending
    /// requests), forget them, then close the transport itself.
    pub async fn close(&self, cause: Option<String>) {
        if !self.open.swap(false, Ordering::AcqRel) {
            return;
        }
        self.gate.close().await;

        let channels: Vec<Arc<Channel>> = {
            let mut guard = self.channels.lock();
            guard.drain().map(|(_, c)| c).collect()
        };
        for channel in &channels {
            channel.close(cause.clone()).await;
        }

        let _ = self.transport.close().await;
    }
}
