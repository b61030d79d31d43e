//! The typed request/response catalogue and the one-shot future that
//! correlates a sent [`Request`] with its eventual [`Response`].

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;

use crate::error::{PeerError, Result};

/// Opaque key or value bytes. The codec that turns domain objects into
/// these bytes is an external collaborator; this crate only ever
/// moves `Binary` around.
pub type Binary = Vec<u8>;

/// Filters and aggregators/processors are likewise opaque to this crate --
/// it forwards whatever bytes the external serializer produced for them
/// and otherwise only needs to know a filter's identity for paging state.
pub type Opaque = Vec<u8>;

/// `inserted` / `updated` / `deleted`, mirroring the three states a
/// `MapEventMessage` can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MapEventKind {
    Inserted,
    Updated,
    Deleted,
}

/// Whether a `MapEventMessage` carries original values, or a transformed
/// view produced by a server-side event transformer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransformationState {
    NonTransformable,
    Transformable,
    Transformed,
}

/// A server-pushed cache notification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MapEvent {
    pub event_id: MapEventKind,
    pub filter_ids: Vec<i64>,
    pub key: Binary,
    pub old_value: Option<Binary>,
    pub new_value: Option<Binary>,
    pub synthetic: bool,
    pub transformation_state: TransformationState,
    pub priming: bool,
}

/// The named-cache operation catalogue.
///
/// Each variant corresponds to one request type-id from the protocol
/// table. Paged operations (`Query`, `InvokeFilter`) carry the cookie from
/// the previous page's [`PartialResult`]; `None` starts a fresh iteration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum CacheRequest {
    Size,
    ContainsKey { key: Binary },
    ContainsValue { value: Binary },
    Get { key: Binary },
    GetAll { keys: Vec<Binary> },
    Put { key: Binary, value: Binary, ttl_millis: i64, return_value: bool },
    Remove { key: Binary, return_value: bool },
    PutAll { entries: Vec<(Binary, Binary)> },
    Clear { truncate: bool },
    ContainsAll { keys: Vec<Binary> },
    RemoveAll { keys: Vec<Binary> },
    ListenerKey { key: Binary, add: bool, lite: bool, priming: bool },
    ListenerFilter { filter_id: i64, filter: Opaque, add: bool, lite: bool, priming: bool },
    Lock { key: Binary, wait_millis: i64 },
    Unlock { key: Binary },
    Query { filter: Opaque, keys_only: bool, cookie: Option<Opaque> },
    Index { filter: Opaque, add: bool, ordered: bool },
    AggregateAll { keys: Vec<Binary>, aggregator: Opaque },
    AggregateFilter { filter: Opaque, aggregator: Opaque },
    InvokeAll { keys: Vec<Binary>, processor: Opaque },
    InvokeFilter { filter: Opaque, processor: Opaque, cookie: Option<Opaque> },
}

impl CacheRequest {
    /// Stable wire type-id, used for the self-describing frame header
    /// and for `tracing` spans.
    pub fn type_id(&self) -> i32 {
        match self {
            CacheRequest::Size => 1,
            CacheRequest::ContainsKey { .. } => 2,
            CacheRequest::ContainsValue { .. } => 3,
            CacheRequest::Put { .. } => 5,
            CacheRequest::Remove { .. } => 6,
            CacheRequest::PutAll { .. } => 7,
            CacheRequest::Clear { .. } => 8,
            CacheRequest::ContainsAll { .. } => 9,
            CacheRequest::RemoveAll { .. } => 10,
            CacheRequest::ListenerKey { .. } => 11,
            CacheRequest::ListenerFilter { .. } => 12,
            CacheRequest::Get { .. } => 21,
            CacheRequest::GetAll { .. } => 22,
            CacheRequest::Lock { .. } => 31,
            CacheRequest::Unlock { .. } => 32,
            CacheRequest::Query { .. } => 41,
            CacheRequest::Index { .. } => 42,
            CacheRequest::AggregateAll { .. } => 52,
            CacheRequest::AggregateFilter { .. } => 53,
            CacheRequest::InvokeAll { .. } => 54,
            CacheRequest::InvokeFilter { .. } => 55,
        }
    }

    /// The lowest negotiated named-cache protocol version that still
    /// understands this request. `Clear { truncate: true }` needs version
    /// > 5; everything else has always existed.
    pub fn minimum_version(&self) -> i32 {
        match self {
            CacheRequest::Clear { truncate: true } => 6,
            _ => 1,
        }
    }
}

/// Responses to [`CacheRequest`]. A single `PartialResult` variant serves
/// every paged operation (`Query`, `InvokeFilter`): `cookie = None` signals
/// end-of-stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum CacheResponse {
    Size(i64),
    Bool(bool),
    Value(Option<Binary>),
    Map(Vec<(Binary, Binary)>),
    FilterId(i64),
    PartialResult {
        cookie: Option<Opaque>,
        keys: Vec<Binary>,
        entries: Vec<(Binary, Binary)>,
        /// Anchor state a limit-filter copies back onto its filter before
        /// re-issuing the next page.
        filter_anchor: Option<Opaque>,
    },
    Unit,
}

/// Peer-protocol wire messages that ride on channel 0. Internal
/// control work-orders (`OpenConnection`, `CreateChannel`, ...) never
/// appear here: they are [`crate::peer::PeerCommand`] values that stay on
/// the service thread and are never encoded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum PeerWire {
    Ping,
    Pong,
    NotifyConnectionClosed { cause: Option<String> },
    OpenChannelRequest {
        channel_id: i32,
        protocol: String,
        protocol_version: i32,
        receiver_name: Option<String>,
        identity_token: Option<Vec<u8>>,
    },
    OpenChannelResponse { channel_id: i32 },
    AcceptChannelRequest {
        uri: String,
        identity_token: Option<Vec<u8>>,
    },
    AcceptChannelResponse,
}

/// The full catalogue of bodies that can occupy a [`Frame`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum WireBody {
    Peer(PeerWire),
    CacheRequest(CacheRequest),
    CacheResponse(CacheResponse),
    Event(MapEvent),
    NoStorageMembers,
    /// A bare failure: the request's `CacheResponse` counterpart was never
    /// produced because the server raised an exception.
    Failure { code: i32, message: String },
}

/// The on-wire envelope: `[type_id][impl_version][request_id?][body]`,
/// plus any trailing bytes this reader's version doesn't understand,
/// preserved verbatim for evolvability.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Frame {
    pub type_id: i32,
    pub impl_version: i32,
    pub request_id: Option<u64>,
    pub failure: bool,
    pub body: WireBody,
    pub future_data: Vec<u8>,
}

/// A frame tagged with the channel it belongs to -- the unit that
/// actually crosses the wire.
/// Channel 0 always carries [`PeerWire`] control traffic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub channel_id: i32,
    pub frame: Frame,
}

impl Envelope {
    pub fn new(channel_id: i32, frame: Frame) -> Self {
        Self { channel_id, frame }
    }
}

/// What one read off the wire produced: either a clean [`Envelope`], or a
/// frame whose body failed to decode on a non-zero channel. The two are
/// kept distinct so a caller can close just the offending channel instead
/// of the whole connection; a decode failure on channel 0 itself is never
/// wrapped this way -- it comes back as a connection-fatal `Err`.
#[derive(Debug)]
pub enum Received {
    Envelope(Envelope),
    BadChannelFrame { channel_id: i32, error: PeerError },
}

impl Received {
    /// Unwrap a clean envelope, panicking on a per-channel decode failure.
    /// For call sites (mostly tests) that only exercise the happy path.
    pub fn into_envelope(self) -> Envelope {
        match self {
            Received::Envelope(envelope) => envelope,
            Received::BadChannelFrame { channel_id, error } => {
                panic!("expected an envelope, got a decode failure on channel {channel_id}: {error}")
            }
        }
    }
}

impl Frame {
    pub fn request(request_id: u64, impl_version: i32, body: WireBody) -> Self {
        let type_id = wire_body_type_id(&body);
        Self {
            type_id,
            impl_version,
            request_id: Some(request_id),
            failure: false,
            body,
            future_data: Vec::new(),
        }
    }

    pub fn response(request_id: u64, impl_version: i32, body: WireBody) -> Self {
        let type_id = wire_body_type_id(&body);
        Self {
            type_id,
            impl_version,
            request_id: Some(request_id),
            failure: matches!(body, WireBody::Failure { .. }),
            body,
            future_data: Vec::new(),
        }
    }

    pub fn push(impl_version: i32, body: WireBody) -> Self {
        let type_id = wire_body_type_id(&body);
        Self {
            type_id,
            impl_version,
            request_id: None,
            failure: false,
            body,
            future_data: Vec::new(),
        }
    }

    /// True for frames that answer a request (the presence of
    /// `request_id` is not sufficient on its own: a `Request` also carries
    /// one).
    pub fn is_response(&self) -> bool {
        matches!(
            self.body,
            WireBody::CacheResponse(_) | WireBody::Failure { .. }
        ) || matches!(self.body, WireBody::Peer(PeerWire::Pong))
            || matches!(
                self.body,
                WireBody::Peer(PeerWire::OpenChannelResponse { .. })
                    | WireBody::Peer(PeerWire::AcceptChannelResponse)
            )
    }
}

fn wire_body_type_id(body: &WireBody) -> i32 {
    match body {
        WireBody::Peer(PeerWire::Ping) => 3,
        WireBody::Peer(PeerWire::Pong) => 4,
        WireBody::Peer(PeerWire::NotifyConnectionClosed { .. }) => 10,
        WireBody::Peer(PeerWire::OpenChannelRequest { .. }) => 11,
        WireBody::Peer(PeerWire::OpenChannelResponse { .. }) => 12,
        WireBody::Peer(PeerWire::AcceptChannelRequest { .. }) => 13,
        WireBody::Peer(PeerWire::AcceptChannelResponse) => 14,
        WireBody::CacheRequest(req) => req.type_id(),
        WireBody::CacheResponse(CacheResponse::PartialResult { .. }) => 1000,
        WireBody::CacheResponse(_) => -1000,
        WireBody::Event(_) => 13,
        WireBody::NoStorageMembers => 56,
        WireBody::Failure { .. } => -1,
    }
}

/// Outcome of a completed [`RequestStatus`].
enum Outcome {
    Response(Frame),
    Failed(PeerErrorPayload),
}

/// `PeerError` is not `Clone`, so the status stores a small serializable
/// payload and rebuilds the concrete error for each waiter.
#[derive(Clone)]
enum PeerErrorPayload {
    Connection(String),
    ChannelClosed(String),
    Timeout(Duration),
    Remote { code: i32, message: String },
}

impl From<PeerErrorPayload> for PeerError {
    fn from(p: PeerErrorPayload) -> Self {
        match p {
            PeerErrorPayload::Connection(s) => PeerError::Connection(s),
            PeerErrorPayload::ChannelClosed(s) => PeerError::ChannelClosed(s),
            PeerErrorPayload::Timeout(d) => PeerError::RequestTimeout(d),
            PeerErrorPayload::Remote { code, message } => PeerError::Remote { code, message },
        }
    }
}

enum StatusState {
    Pending,
    Completed(Outcome),
}

/// A one-shot future coupling a sent request to its eventual response,
/// failure, or timeout.
///
/// Cloning a `RequestStatus` shares the same underlying slot; the channel
/// keeps one clone in its pending table and hands another to the caller.
#[derive(Clone)]
pub struct RequestStatus {
    request_id: u64,
    state: Arc<Mutex<StatusState>>,
    notify: Arc<Notify>,
}

impl RequestStatus {
    pub fn new(request_id: u64) -> Self {
        Self {
            request_id,
            state: Arc::new(Mutex::new(StatusState::Pending)),
            notify: Arc::new(Notify::new()),
        }
    }

    pub fn request_id(&self) -> u64 {
        self.request_id
    }

    /// Complete with a response received off the wire. A no-op if the
    /// status was already completed (e.g. by a timeout).
    pub fn complete_response(&self, frame: Frame) {
        let mut state = self.state.lock();
        if matches!(*state, StatusState::Pending) {
            *state = StatusState::Completed(Outcome::Response(frame));
            self.notify.notify_waiters();
        }
    }

    /// Complete with a connection- or channel-level failure.
    pub fn fail(&self, error: &PeerError) {
        let payload = match error {
            PeerError::Connection(s) => PeerErrorPayload::Connection(s.clone()),
            PeerError::ChannelClosed(s) => PeerErrorPayload::ChannelClosed(s.clone()),
            PeerError::RequestTimeout(d) => PeerErrorPayload::Timeout(*d),
            PeerError::Remote { code, message } => PeerErrorPayload::Remote {
                code: *code,
                message: message.clone(),
            },
            other => PeerErrorPayload::Connection(other.to_string()),
        };
        let mut state = self.state.lock();
        if matches!(*state, StatusState::Pending) {
            *state = StatusState::Completed(Outcome::Failed(payload));
            self.notify.notify_waiters();
        }
    }

    /// Await the response. `timeout = None` waits forever; `Some(d)`
    /// raises [`PeerError::RequestTimeout`] after at most `d`.
    pub async fn wait_for_response(&self, timeout: Option<Duration>) -> Result<Frame> {
        loop {
            {
                let state = self.state.lock();
                match &*state {
                    StatusState::Completed(Outcome::Response(frame)) => return Ok(frame.clone()),
                    StatusState::Completed(Outcome::Failed(payload)) => {
                        return Err(payload.clone().into())
                    }
                    StatusState::Pending => {}
                }
            }

            let notified = self.notify.notified();
            match timeout {
                Some(d) => {
                    if tokio::time::timeout(d, notified).await.is_err() {
                        self.fail(&PeerError::RequestTimeout(d));
                        // Loop once more to pick up the failure we just set.
                        continue;
                    }
                }
                None => notified.await,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn completes_with_the_matching_response() {
        let status = RequestStatus::new(7);
        let frame = Frame::response(7, 1, WireBody::CacheResponse(CacheResponse::Size(3)));
        status.complete_response(frame.clone());

        let got = status.wait_for_response(None).await.unwrap();
        assert_eq!(got.request_id, Some(7));
    }

    #[tokio::test]
    async fn times_out_and_then_ignores_a_late_response() {
        let status = RequestStatus::new(9);
        let err = status
            .wait_for_response(Some(Duration::from_millis(20)))
            .await
            .unwrap_err();
        assert!(matches!(err, PeerError::RequestTimeout(_)));

        // A response arriving after the timeout must not overwrite the
        // already-completed (failed) state.
        let frame = Frame::response(9, 1, WireBody::CacheResponse(CacheResponse::Unit));
        status.complete_response(frame);
        let err2 = status.wait_for_response(None).await.unwrap_err();
        assert!(matches!(err2, PeerError::RequestTimeout(_)));
    }

    #[test]
    fn clear_truncate_requires_version_six() {
        let truncate = CacheRequest::Clear { truncate: true };
        assert_eq!(truncate.minimum_version(), 6);
        let clear = CacheRequest::Clear { truncate: false };
        assert_eq!(clear.minimum_version(), 1);
    }
}
