//! End-to-end scenarios driven over an in-memory duplex pipe, standing in
//! for a real grid proxy: a `Peer` on one end, a hand-rolled fake server
//! on the other, so these tests exercise the full
//! connect -> open channel -> request/response path rather than any one
//! module in isolation.

use std::sync::Arc;
use std::time::Duration;

use extend_client::config::PeerConfiguration;
use extend_client::listener::MapListener;
use extend_client::message::{
    CacheRequest, CacheResponse, Envelope, Frame, MapEvent, MapEventKind, PeerWire,
    TransformationState, WireBody,
};
use extend_client::peer::Peer;
use extend_client::protocol;
use extend_client::transport::{PipeTransport, Transport};
use extend_client::RemoteCache;

/// Build a client/server transport pair over an in-memory duplex pipe.
fn duplex_pair(config: &PeerConfiguration) -> (Arc<dyn Transport>, Arc<dyn Transport>) {
    let (client_io, server_io) = tokio::io::duplex(1 << 20);
    let (cr, cw) = tokio::io::split(client_io);
    let (sr, sw) = tokio::io::split(server_io);
    let client: Arc<dyn Transport> = Arc::new(PipeTransport::new(cr, cw, config));
    let server: Arc<dyn Transport> = Arc::new(PipeTransport::new(sr, sw, config));
    (client, server)
}

/// Answer exactly one `OpenChannelRequest` on the control channel,
/// returning the channel id the client proposed.
async fn accept_one_channel(server: &Arc<dyn Transport>) -> i32 {
    let incoming = server.receive().await.unwrap().unwrap().into_envelope();
    assert_eq!(incoming.channel_id, 0);
    let request_id = incoming.frame.request_id.unwrap();
    let channel_id = match incoming.frame.body {
        WireBody::Peer(PeerWire::OpenChannelRequest { channel_id, .. }) => channel_id,
        other => panic!("expected an OpenChannelRequest, got {other:?}"),
    };
    server
        .send(&Envelope::new(
            0,
            Frame::response(
                request_id,
                protocol::PEER_PROTOCOL_VERSION.current,
                WireBody::Peer(PeerWire::OpenChannelResponse { channel_id }),
            ),
        ))
        .await
        .unwrap();
    channel_id
}

/// Receive the next request on `channel_id` and return its request id and
/// body, for a test to inspect before crafting a response.
async fn next_request(server: &Arc<dyn Transport>, channel_id: i32) -> (u64, CacheRequest) {
    let incoming = server.receive().await.unwrap().unwrap().into_envelope();
    assert_eq!(incoming.channel_id, channel_id);
    let request_id = incoming.frame.request_id.expect("request frame must carry an id");
    match incoming.frame.body {
        WireBody::CacheRequest(req) => (request_id, req),
        other => panic!("expected a CacheRequest, got {other:?}"),
    }
}

async fn respond(server: &Arc<dyn Transport>, channel_id: i32, request_id: u64, response: CacheResponse) {
    server
        .send(&Envelope::new(
            channel_id,
            Frame::response(request_id, 1, WireBody::CacheResponse(response)),
        ))
        .await
        .unwrap();
}

#[tokio::test]
async fn put_then_get_round_trips_through_a_freshly_opened_cache() {
    let config = PeerConfiguration::default();
    let (client, server) = duplex_pair(&config);

    let peer = Peer::start(client, config).await.unwrap();

    let server_task = tokio::spawn(async move {
        let channel_id = accept_one_channel(&server).await;

        let (id, req) = next_request(&server, channel_id).await;
        assert!(matches!(req, CacheRequest::Put { ref key, ref value, .. }
            if key == b"hello" && value == b"world"));
        respond(&server, channel_id, id, CacheResponse::Value(None)).await;

        let (id, req) = next_request(&server, channel_id).await;
        assert!(matches!(req, CacheRequest::Get { ref key } if key == b"hello"));
        respond(&server, channel_id, id, CacheResponse::Value(Some(b"world".to_vec()))).await;
    });

    let cache = RemoteCache::connect(peer.as_ref(), "demo-cache").await.unwrap();
    let previous = cache.put(b"hello".to_vec(), b"world".to_vec(), 0, true).await.unwrap();
    assert_eq!(previous, None);

    let value = cache.get(b"hello".to_vec()).await.unwrap();
    assert_eq!(value, Some(b"world".to_vec()));

    server_task.await.unwrap();
    peer.close(None).await;
}

#[tokio::test]
async fn paged_query_drains_every_page_until_the_cookie_runs_out() {
    let config = PeerConfiguration::default();
    let (client, server) = duplex_pair(&config);
    let peer = Peer::start(client, config).await.unwrap();

    let server_task = tokio::spawn(async move {
        let channel_id = accept_one_channel(&server).await;

        // Page 1: cookie present, more to come.
        let (id, req) = next_request(&server, channel_id).await;
        assert!(matches!(req, CacheRequest::Query { cookie: None, .. }));
        respond(
            &server,
            channel_id,
            id,
            CacheResponse::PartialResult {
                cookie: Some(b"page-2".to_vec()),
                keys: vec![b"k1".to_vec(), b"k2".to_vec()],
                entries: vec![],
                filter_anchor: None,
            },
        )
        .await;

        // Page 2: final page, no cookie.
        let (id, req) = next_request(&server, channel_id).await;
        assert!(matches!(req, CacheRequest::Query { cookie: Some(ref c), .. } if c == b"page-2"));
        respond(
            &server,
            channel_id,
            id,
            CacheResponse::PartialResult {
                cookie: None,
                keys: vec![b"k3".to_vec()],
                entries: vec![],
                filter_anchor: None,
            },
        )
        .await;
    });

    let cache = RemoteCache::connect(peer.as_ref(), "demo-cache").await.unwrap();
    let keys = cache.key_set(b"always-true".to_vec()).await.unwrap();
    assert_eq!(keys, vec![b"k1".to_vec(), b"k2".to_vec(), b"k3".to_vec()]);

    server_task.await.unwrap();
    peer.close(None).await;
}

#[tokio::test]
async fn a_registered_listener_receives_a_pushed_event() {
    let config = PeerConfiguration::default();
    let (client, server) = duplex_pair(&config);
    let peer = Peer::start(client, config).await.unwrap();

    let server_task = tokio::spawn(async move {
        let channel_id = accept_one_channel(&server).await;

        let (id, req) = next_request(&server, channel_id).await;
        assert!(matches!(req, CacheRequest::ListenerKey { ref key, add: true, .. } if key == b"watched"));
        respond(&server, channel_id, id, CacheResponse::Unit).await;

        // Push an unsolicited MapEvent: no request_id, not a response to
        // anything the client asked for.
        server
            .send(&Envelope::new(
                channel_id,
                Frame::push(
                    1,
                    WireBody::Event(MapEvent {
                        event_id: MapEventKind::Updated,
                        filter_ids: vec![],
                        key: b"watched".to_vec(),
                        old_value: Some(b"old".to_vec()),
                        new_value: Some(b"new".to_vec()),
                        synthetic: false,
                        transformation_state: TransformationState::NonTransformable,
                        priming: false,
                    }),
                ),
            ))
            .await
            .unwrap();
    });

    struct Recorder(Arc<tokio::sync::Notify>, parking_lot::Mutex<Vec<Vec<u8>>>);
    impl MapListener for Recorder {
        fn entry_inserted(&self, _event: &MapEvent) {}
        fn entry_updated(&self, event: &MapEvent) {
            self.1.lock().push(event.new_value.clone().unwrap_or_default());
            self.0.notify_one();
        }
        fn entry_deleted(&self, _event: &MapEvent) {}
    }

    let notify = Arc::new(tokio::sync::Notify::new());
    let recorder = Arc::new(Recorder(notify.clone(), parking_lot::Mutex::new(Vec::new())));

    let cache = RemoteCache::connect(peer.as_ref(), "demo-cache").await.unwrap();
    cache
        .add_key_listener(b"watched".to_vec(), recorder.clone(), true, false)
        .await
        .unwrap();

    tokio::time::timeout(Duration::from_secs(1), notify.notified())
        .await
        .expect("listener was never invoked");
    assert_eq!(recorder.1.lock().as_slice(), &[b"new".to_vec()]);

    server_task.await.unwrap();
    peer.close(None).await;
}

#[tokio::test]
async fn dropping_the_connection_fails_an_in_flight_request() {
    let config = PeerConfiguration::default();
    let (client, server) = duplex_pair(&config);
    let peer = Peer::start(client, config).await.unwrap();

    let connect_task = {
        let peer = peer.clone();
        tokio::spawn(async move { RemoteCache::connect(peer.as_ref(), "demo-cache").await })
    };
    let channel_id = accept_one_channel(&server).await;
    let cache = connect_task.await.unwrap().unwrap();

    // Issue a request but never answer it; instead drop the server side
    // of the pipe entirely while the request is still in flight.
    let size_task = {
        let cache = cache.clone();
        tokio::spawn(async move { cache.size().await })
    };
    let _ = next_request(&server, channel_id).await;
    drop(server);

    let result = size_task.await.unwrap();
    assert!(result.is_err());
}

#[tokio::test]
async fn an_unanswered_ping_closes_the_connection() {
    let mut config = PeerConfiguration::default();
    config.ping_interval = Some(Duration::from_millis(30));
    config.ping_timeout = Duration::from_millis(30);
    let (client, server) = duplex_pair(&config);
    let peer = Peer::start(client, config).await.unwrap();

    // Accept the control-channel open if the caller makes one, but never
    // answer the Ping that follows -- simulate a peer that has gone dark.
    tokio::spawn(async move {
        loop {
            match server.receive().await {
                Ok(Some(_)) => continue,
                _ => break,
            }
        }
    });

    for _ in 0..50 {
        if !peer.connection().is_open() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(!peer.connection().is_open(), "connection should have closed after a missed ping");
}
