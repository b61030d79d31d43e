//! # Extend Client
//!
//! The core of a remote client for a distributed in-memory data grid: a
//! wire-level messaging runtime that multiplexes many logical
//! request/response channels over one connection, and a remote cache
//! proxy built on top of it.
//!
//! [`Peer`](peer::Peer) owns the connection's service loop. A
//! [`Connection`](connection::Connection) multiplexes
//! [`Channel`](channel::Channel)s, each running its own protocol at its
//! own negotiated version. [`RemoteCache`](cache::RemoteCache) is the
//! application-facing façade most callers actually use.

pub mod cache;
pub mod channel;
pub mod cli;
pub mod codec;
pub mod config;
pub mod connection;
pub mod error;
pub mod events;
pub mod gate;
pub mod key;
pub mod listener;
pub mod logging;
pub mod message;
pub mod peer;
pub mod protocol;
pub mod transport;

pub use cache::RemoteCache;
pub use channel::Channel;
pub use config::{ClientConfiguration, PeerConfiguration};
pub use connection::Connection;
pub use error::{PeerError, Result};
pub use peer::Peer;

/// The version of this crate's wire protocol implementation, not to be
/// confused with a negotiated protocol version (`protocol::negotiate_version`).
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
