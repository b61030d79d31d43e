//! `RemoteCache`: a map-API façade over a [`Channel`] opened against the
//! named-cache protocol, translating each operation into the matching
//! typed [`CacheRequest`]/[`CacheResponse`] pair.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::warn;

use crate::channel::Channel;
use crate::error::{PeerError, Result};
use crate::events::EventDispatcher;
use crate::key;
use crate::listener::{ListenerSupport, MapListener};
use crate::message::{
    Binary, CacheRequest, CacheResponse, Frame, Opaque, TransformationState, WireBody,
};
use crate::peer::Peer;
use crate::protocol;

/// One page of a paged query or filtered invocation.
pub struct Page<T> {
    pub items: Vec<T>,
    pub cookie: Option<Opaque>,
}

impl<T> Page<T> {
    pub fn is_last(&self) -> bool {
        self.cookie.is_none()
    }
}

/// A proxy for one named cache on the remote grid.
pub struct RemoteCache {
    name: String,
    channel: Arc<Channel>,
    listeners: Mutex<ListenerSupport>,
    dispatcher: EventDispatcher,
    default_timeout: Duration,
    warned_lock_deprecated: AtomicBool,
}

impl RemoteCache {
    /// Open a channel against `peer` for the named-cache protocol and
    /// wrap it as a cache proxy for `name`.
    pub async fn connect(peer: &Peer, name: impl Into<String>) -> Result<Arc<Self>> {
        let channel = peer
            .open_channel(
                protocol::CACHE_PROTOCOL,
                protocol::CACHE_PROTOCOL_VERSION,
                protocol::CACHE_PROTOCOL_VERSION,
            )
            .await?;

        let cache = Arc::new(Self {
            name: name.into(),
            channel: channel.clone(),
            listeners: Mutex::new(ListenerSupport::new()),
            dispatcher: EventDispatcher::new(),
            default_timeout: peer.connection().config().request_timeout,
            warned_lock_deprecated: AtomicBool::new(false),
        });

        let push_target = cache.clone();
        channel.set_push_handler(Arc::new(move |frame| push_target.handle_push(frame)));
        Ok(cache)
    }

    /// Wrap an already-open, already-negotiated channel directly -- used
    /// by tests that drive both ends of a pipe by hand.
    pub fn with_channel(name: impl Into<String>, channel: Arc<Channel>, default_timeout: Duration) -> Arc<Self> {
        let cache = Arc::new(Self {
            name: name.into(),
            channel: channel.clone(),
            listeners: Mutex::new(ListenerSupport::new()),
            dispatcher: EventDispatcher::new(),
            default_timeout,
            warned_lock_deprecated: AtomicBool::new(false),
        });
        let push_target = cache.clone();
        channel.set_push_handler(Arc::new(move |frame| push_target.handle_push(frame)));
        cache
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn handle_push(&self, frame: Frame) {
        if let WireBody::Event(event) = frame.body {
            let transformed = event.transformation_state == TransformationState::Transformed;
            let listeners = self
                .listeners
                .lock()
                .listeners_for(&event.key, &event.filter_ids, transformed);
            self.dispatcher.dispatch(listeners, event);
        }
    }

    async fn call(&self, request: CacheRequest) -> Result<CacheResponse> {
        let frame = self
            .channel
            .request(WireBody::CacheRequest(request), Some(self.default_timeout))
            .await?;
        match frame.body {
            WireBody::CacheResponse(response) => Ok(response),
            other => Err(PeerError::Protocol(format!(
                "unexpected response body for a cache request: {other:?}"
            ))),
        }
    }

    pub async fn size(&self) -> Result<i64> {
        match self.call(CacheRequest::Size).await? {
            CacheResponse::Size(n) => Ok(n),
            other => Err(unexpected(other)),
        }
    }

    pub async fn contains_key(&self, key: Binary) -> Result<bool> {
        match self.call(CacheRequest::ContainsKey { key }).await? {
            CacheResponse::Bool(b) => Ok(b),
            other => Err(unexpected(other)),
        }
    }

    pub async fn contains_value(&self, value: Binary) -> Result<bool> {
        match self.call(CacheRequest::ContainsValue { value }).await? {
            CacheResponse::Bool(b) => Ok(b),
            other => Err(unexpected(other)),
        }
    }

    pub async fn contains_all(&self, keys: Vec<Binary>) -> Result<bool> {
        match self.call(CacheRequest::ContainsAll { keys }).await? {
            CacheResponse::Bool(b) => Ok(b),
            other => Err(unexpected(other)),
        }
    }

    pub async fn get(&self, key: Binary) -> Result<Option<Binary>> {
        match self.call(CacheRequest::Get { key }).await? {
            CacheResponse::Value(v) => Ok(v),
            other => Err(unexpected(other)),
        }
    }

    /// Like [`get`](Self::get), but first decorates `key` with the
    /// partition hint `association` resolves, for a domain key that must
    /// route to a different partition than its own bytes would.
    pub async fn get_with_association(
        &self,
        key: Binary,
        association: &dyn key::KeyAssociation,
    ) -> Result<Option<Binary>> {
        self.get(decorate_key(&key, association)).await
    }

    pub async fn get_all(&self, keys: Vec<Binary>) -> Result<Vec<(Binary, Binary)>> {
        match self.call(CacheRequest::GetAll { keys }).await? {
            CacheResponse::Map(entries) => Ok(entries),
            other => Err(unexpected(other)),
        }
    }

    /// `ttl_millis = 0` means the cache's default expiry.
    pub async fn put(
        &self,
        key: Binary,
        value: Binary,
        ttl_millis: i64,
        return_previous: bool,
    ) -> Result<Option<Binary>> {
        match self
            .call(CacheRequest::Put {
                key,
                value,
                ttl_millis,
                return_value: return_previous,
            })
            .await?
        {
            CacheResponse::Value(v) => Ok(v),
            CacheResponse::Unit => Ok(None),
            other => Err(unexpected(other)),
        }
    }

    /// Like [`put`](Self::put), but first decorates `key` with the
    /// partition hint `association` resolves.
    pub async fn put_with_association(
        &self,
        key: Binary,
        value: Binary,
        ttl_millis: i64,
        return_previous: bool,
        association: &dyn key::KeyAssociation,
    ) -> Result<Option<Binary>> {
        self.put(decorate_key(&key, association), value, ttl_millis, return_previous)
            .await
    }

    pub async fn put_all(&self, entries: Vec<(Binary, Binary)>) -> Result<()> {
        match self.call(CacheRequest::PutAll { entries }).await? {
            CacheResponse::Unit => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    pub async fn remove(&self, key: Binary, return_previous: bool) -> Result<Option<Binary>> {
        match self
            .call(CacheRequest::Remove {
                key,
                return_value: return_previous,
            })
            .await?
        {
            CacheResponse::Value(v) => Ok(v),
            CacheResponse::Unit => Ok(None),
            other => Err(unexpected(other)),
        }
    }

    /// Like [`remove`](Self::remove), but first decorates `key` with the
    /// partition hint `association` resolves.
    pub async fn remove_with_association(
        &self,
        key: Binary,
        return_previous: bool,
        association: &dyn key::KeyAssociation,
    ) -> Result<Option<Binary>> {
        self.remove(decorate_key(&key, association), return_previous).await
    }

    pub async fn remove_all(&self, keys: Vec<Binary>) -> Result<()> {
        match self.call(CacheRequest::RemoveAll { keys }).await? {
            CacheResponse::Unit => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    pub async fn clear(&self) -> Result<()> {
        match self.call(CacheRequest::Clear { truncate: false }).await? {
            CacheResponse::Unit => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    /// `truncate()` needs protocol version >= 6. A
    /// peer negotiated at an older version never sees a wire request: the
    /// rejection is entirely local, matching how an unsupported operation
    /// is reported against an old service.
    pub async fn truncate(&self) -> Result<()> {
        let request = CacheRequest::Clear { truncate: true };
        let negotiated = self.channel.protocol_version();
        if negotiated < request.minimum_version() {
            return Err(PeerError::UnsupportedAtVersion {
                what: "truncate()".into(),
                negotiated,
            });
        }
        match self.call(request).await? {
            CacheResponse::Unit => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    pub async fn add_index(&self, filter: Opaque, ordered: bool) -> Result<()> {
        match self
            .call(CacheRequest::Index {
                filter,
                add: true,
                ordered,
            })
            .await?
        {
            CacheResponse::Unit => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    pub async fn remove_index(&self, filter: Opaque) -> Result<()> {
        match self
            .call(CacheRequest::Index {
                filter,
                add: false,
                ordered: false,
            })
            .await?
        {
            CacheResponse::Unit => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    /// Deprecated in favor of external locking, but still wired through
    /// for parity with the original API; warns exactly once per cache.
    pub async fn lock(&self, key: Binary, wait_millis: i64) -> Result<bool> {
        if self
            .warned_lock_deprecated
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            warn!(cache = %self.name, "lock()/unlock() are deprecated; prefer an EntryProcessor");
        }
        match self.call(CacheRequest::Lock { key, wait_millis }).await? {
            CacheResponse::Bool(b) => Ok(b),
            other => Err(unexpected(other)),
        }
    }

    pub async fn unlock(&self, key: Binary) -> Result<bool> {
        match self.call(CacheRequest::Unlock { key }).await? {
            CacheResponse::Bool(b) => Ok(b),
            other => Err(unexpected(other)),
        }
    }

    pub async fn invoke(&self, key: Binary, processor: Opaque) -> Result<Option<Binary>> {
        match self
            .call(CacheRequest::InvokeAll {
                keys: vec![key],
                processor,
            })
            .await?
        {
            CacheResponse::Map(mut entries) => Ok(entries.pop().map(|(_, v)| v)),
            other => Err(unexpected(other)),
        }
    }

    pub async fn invoke_all(
        &self,
        keys: Vec<Binary>,
        processor: Opaque,
    ) -> Result<Vec<(Binary, Binary)>> {
        match self.call(CacheRequest::InvokeAll { keys, processor }).await? {
            CacheResponse::Map(entries) => Ok(entries),
            other => Err(unexpected(other)),
        }
    }

    pub async fn aggregate(&self, keys: Vec<Binary>, aggregator: Opaque) -> Result<Binary> {
        match self
            .call(CacheRequest::AggregateAll { keys, aggregator })
            .await?
        {
            CacheResponse::Value(Some(v)) => Ok(v),
            other => Err(unexpected(other)),
        }
    }

    pub async fn aggregate_filter(&self, filter: Opaque, aggregator: Opaque) -> Result<Binary> {
        match self
            .call(CacheRequest::AggregateFilter { filter, aggregator })
            .await?
        {
            CacheResponse::Value(Some(v)) => Ok(v),
            other => Err(unexpected(other)),
        }
    }

    /// Run `processor` against every entry matching `filter`, draining
    /// every page of the result the way [`key_set`](Self::key_set)/
    /// [`entry_set`](Self::entry_set) drain a plain query.
    pub async fn invoke_filter(&self, filter: Opaque, processor: Opaque) -> Result<Vec<(Binary, Binary)>> {
        let mut results = Vec::new();
        let mut cookie = None;
        loop {
            match self
                .call(CacheRequest::InvokeFilter {
                    filter: filter.clone(),
                    processor: processor.clone(),
                    cookie,
                })
                .await?
            {
                CacheResponse::PartialResult {
                    cookie: next_cookie,
                    entries,
                    ..
                } => {
                    results.extend(entries);
                    if next_cookie.is_none() {
                        break;
                    }
                    cookie = next_cookie;
                }
                other => return Err(unexpected(other)),
            }
        }
        Ok(results)
    }

    /// Fetch one page of a filtered key/entry query, continuing from
    /// `cookie` (`None` starts a fresh iteration). The caller loops until
    /// [`Page::is_last`].
    pub async fn query_page(
        &self,
        filter: Opaque,
        keys_only: bool,
        cookie: Option<Opaque>,
    ) -> Result<Page<(Binary, Option<Binary>)>> {
        match self
            .call(CacheRequest::Query {
                filter,
                keys_only,
                cookie,
            })
            .await?
        {
            CacheResponse::PartialResult {
                cookie,
                keys,
                entries,
                ..
            } => {
                let items = if keys_only {
                    keys.into_iter().map(|k| (k, None)).collect()
                } else {
                    entries.into_iter().map(|(k, v)| (k, Some(v))).collect()
                };
                Ok(Page { items, cookie })
            }
            other => Err(unexpected(other)),
        }
    }

    /// Drain every page of a filtered key query into one vector.
    pub async fn key_set(&self, filter: Opaque) -> Result<Vec<Binary>> {
        let mut keys = Vec::new();
        let mut cookie = None;
        loop {
            let page = self.query_page(filter.clone(), true, cookie).await?;
            keys.extend(page.items.into_iter().map(|(k, _)| k));
            if page.cookie.is_none() {
                break;
            }
            cookie = page.cookie;
        }
        Ok(keys)
    }

    /// Drain every page of a filtered entry query into one vector.
    pub async fn entry_set(&self, filter: Opaque) -> Result<Vec<(Binary, Binary)>> {
        let mut entries = Vec::new();
        let mut cookie = None;
        loop {
            let page = self.query_page(filter.clone(), false, cookie).await?;
            for (k, v) in page.items {
                entries.push((k, v.unwrap_or_default()));
            }
            if page.cookie.is_none() {
                break;
            }
            cookie = page.cookie;
        }
        Ok(entries)
    }

    /// Register `listener` for `key`. Only sends a wire request when the
    /// registration actually changes what the server must track.
    /// `priming` asks the server to synthesize an initial `Inserted` event
    /// with the entry's current value, so a listener registered against a
    /// key that already exists still sees it once.
    pub async fn add_key_listener(
        &self,
        key: Binary,
        listener: Arc<dyn MapListener>,
        lite: bool,
        priming: bool,
    ) -> Result<()> {
        let change = self
            .listeners
            .lock()
            .add_key_listener(key.clone(), listener, lite, priming);
        if !change.issue_wire_request {
            return Ok(());
        }
        let result = self
            .call(CacheRequest::ListenerKey {
                key: key.clone(),
                add: true,
                lite: change.effective_lite,
                priming: change.effective_priming,
            })
            .await;
        if result.is_err() {
            // Roll back: the wire request failed, so the server never
            // learned about this registration.
            self.listeners.lock().add_key_listener_rollback(&key);
        }
        result.map(|_| ())
    }

    pub async fn remove_key_listener(
        &self,
        key: Binary,
        listener: &Arc<dyn MapListener>,
    ) -> Result<()> {
        let change = self.listeners.lock().remove_key_listener(&key, listener);
        if !change.issue_wire_request {
            return Ok(());
        }
        self.call(CacheRequest::ListenerKey {
            key,
            add: false,
            lite: true,
            priming: false,
        })
        .await?;
        Ok(())
    }

    /// `priming` asks the server to synthesize an initial `Inserted` event
    /// per currently-matching entry, the filter-listener counterpart of
    /// [`add_key_listener`](Self::add_key_listener)'s `priming` flag.
    pub async fn add_filter_listener(
        &self,
        filter: Opaque,
        listener: Arc<dyn MapListener>,
        lite: bool,
        priming: bool,
    ) -> Result<i64> {
        let (filter_id, change) = self
            .listeners
            .lock()
            .add_filter_listener(filter.clone(), listener, lite, priming);
        if !change.issue_wire_request {
            return Ok(filter_id);
        }
        self.call(CacheRequest::ListenerFilter {
            filter_id,
            filter,
            add: true,
            lite: change.effective_lite,
            priming: change.effective_priming,
        })
        .await?;
        Ok(filter_id)
    }

    pub async fn remove_filter_listener(
        &self,
        filter: Opaque,
        listener: &Arc<dyn MapListener>,
    ) -> Result<()> {
        let removed = self.listeners.lock().remove_filter_listener(&filter, listener);
        let Some((filter_id, change)) = removed else {
            return Ok(());
        };
        if !change.issue_wire_request {
            return Ok(());
        }
        self.call(CacheRequest::ListenerFilter {
            filter_id,
            filter,
            add: false,
            lite: true,
            priming: false,
        })
        .await?;
        Ok(())
    }
}

fn unexpected(response: CacheResponse) -> PeerError {
    PeerError::Protocol(format!("unexpected cache response: {response:?}"))
}

/// The key-association decoration helper a cache applies before handing a
/// key to the channel, kept as a free function since it needs no cache
/// state.
pub fn decorate_key(key: &Binary, association: &dyn key::KeyAssociation) -> Binary {
    let association_key = key::resolve_association(key, association);
    key::to_decorated(key, &association_key)
}
