//! `Channel`: one logical, multiplexed request/response stream within a
//! [`Connection`].
//!
//! A channel owns its own pending-request table and request-id sequence;
//! request ids are scoped to the channel, not the connection, so two
//! channels can reuse the same id concurrently without colliding.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;

use crate::connection::Connection;
use crate::error::{PeerError, Result};
use crate::gate::{EntryGate, SharedGate};
use crate::message::{Frame, RequestStatus, WireBody};

/// One multiplexed stream of request/response traffic, identified by a
/// connection-unique, possibly-negative id (id `0` is reserved for the
/// always-open control channel).
pub struct Channel {
    id: i32,
    protocol: String,
    protocol_version: i32,
    connection: Weak<Connection>,
    pending: Mutex<HashMap<u64, RequestStatus>>,
    next_request_id: AtomicU64,
    gate: SharedGate,
    open: AtomicBool,
    push_handler: Mutex<Option<Arc<dyn Fn(Frame) + Send + Sync>>>,
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.id)
            .field("protocol", &self.protocol)
            .field("protocol_version", &self.protocol_version)
            .field("open", &self.open)
            .finish_non_exhaustive()
    }
}

impl Channel {
    pub(crate) fn new(
        id: i32,
        protocol: String,
        protocol_version: i32,
        connection: Weak<Connection>,
    ) -> Self {
        Self {
            id,
            protocol,
            protocol_version,
            connection,
            pending: Mutex::new(HashMap::new()),
            // Starting at 1 keeps 0 available as a sentinel for "no
            // request id" in logs; wrapping is intentional (: a
            // sustained connection will eventually wrap this counter,
            // and by the time it does the original request has long
            // since completed or timed out).
            next_request_id: AtomicU64::new(1),
            gate: Arc::new(EntryGate::new()),
            open: AtomicBool::new(true),
            push_handler: Mutex::new(None),
        }
    }

    /// Install the callback that handles unsolicited, request-id-less
    /// frames on this channel (server-pushed [`crate::message::MapEvent`]s,
    /// chiefly). Only [`crate::cache::RemoteCache`] needs this.
    pub fn set_push_handler(&self, handler: Arc<dyn Fn(Frame) + Send + Sync>) {
        *self.push_handler.lock() = Some(handler);
    }

    /// Hand a pushed frame to this channel's push handler, if one is
    /// installed. Frames arriving before a handler is registered, or on a
    /// channel that never gets one, are dropped.
    pub fn dispatch_push(&self, frame: Frame) {
        let handler = self.push_handler.lock().clone();
        if let Some(handler) = handler {
            handler(frame);
        }
    }

    pub fn id(&self) -> i32 {
        self.id
    }

    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    pub fn protocol_version(&self) -> i32 {
        self.protocol_version
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    /// Send `body` and don't wait for a response; used for one-way
    /// notifications.
    pub async fn send(&self, body: WireBody) -> Result<()> {
        let _entered = self.gate.enter().await;
        self.ensure_open()?;
        let frame = Frame::push(self.protocol_version, body);
        self.write(frame).await
    }

    /// Send `body` as a request and wait for its response, or
    /// [`PeerError::RequestTimeout`] if `timeout` elapses first.
    pub async fn request(&self, body: WireBody, timeout: Option<Duration>) -> Result<Frame> {
        let _entered = self.gate.enter().await;
        self.ensure_open()?;

        let request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let status = RequestStatus::new(request_id);
        self.pending.lock().insert(request_id, status.clone());

        let frame = Frame::request(request_id, self.protocol_version, body);
        if let Err(e) = self.write(frame).await {
            self.pending.lock().remove(&request_id);
            return Err(e);
        }

        let result = status.wait_for_response(timeout).await;
        self.pending.lock().remove(&request_id);

        let frame = result?;
        if let crate::message::WireBody::Failure { code, message } = &frame.body {
            return Err(PeerError::Remote {
                code: *code,
                message: message.clone(),
            });
        }
        Ok(frame)
    }

    /// Answer a request this peer received, by request id, with `body`.
    /// Used to reply to a server-initiated request such as a `Ping`.
    pub async fn reply(&self, request_id: u64, body: WireBody) -> Result<()> {
        let _entered = self.gate.enter().await;
        self.ensure_open()?;
        let frame = Frame::response(request_id, self.protocol_version, body);
        self.write(frame).await
    }

    /// Route a response frame to the pending request it answers. A
    /// no-op if no such request is outstanding (already timed out, or a
    /// duplicate/late delivery).
    pub fn complete(&self, frame: Frame) {
        if let Some(request_id) = frame.request_id {
            if let Some(status) = self.pending.lock().get(&request_id) {
                status.complete_response(frame);
            }
        }
    }

    /// Close the channel: fail every pending request with
    /// [`PeerError::ChannelClosed`] and admit no further operations.
    pub async fn close(&self, cause: Option<String>) {
        self.open.store(false, Ordering::Release);
        self.gate.close().await;
        let message = cause.unwrap_or_else(|| format!("channel {} closed", self.id));
        let pending: Vec<RequestStatus> = self.pending.lock().drain().map(|(_, v)| v).collect();
        for status in pending {
            status.fail(&PeerError::ChannelClosed(message.clone()));
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if !self.is_open() {
            return Err(PeerError::ChannelClosed(format!(
                "channel {} is closed",
                self.id
            )));
        }
        Ok(())
    }

    async fn write(&self, frame: Frame) -> Result<()> {
        let connection = self
            .connection
            .upgrade()
            .ok_or_else(|| PeerError::Connection("owning connection dropped".into()))?;
        connection.send_frame(self.id, frame).await
    }
}
