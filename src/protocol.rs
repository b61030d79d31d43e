//! Protocol identity, version negotiation and channel URIs.
//!
//! A "protocol" here is just a name plus a `(supported_version ..=
//! current_version)` range that a [`crate::channel::Channel`] negotiates
//! once, at open time, with its peer. Everything downstream gates optional
//! wire fields on the resulting integer.

use std::fmt;
use std::str::FromStr;

use crate::error::{protocol_bail, PeerError, Result};

/// Name of the always-present control protocol carried on channel 0.
pub const PEER_PROTOCOL: &str = "PeerProtocol";
/// Name of the named-cache protocol used by [`crate::cache::RemoteCache`].
pub const CACHE_PROTOCOL: &str = "NamedCacheProtocol";

/// `(supported_version, current_version)` for a protocol this crate speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VersionRange {
    pub supported: i32,
    pub current: i32,
}

impl VersionRange {
    pub const fn new(supported: i32, current: i32) -> Self {
        Self { supported, current }
    }
}

/// Versions this crate's peer protocol implementation understands.
pub const PEER_PROTOCOL_VERSION: VersionRange = VersionRange::new(1, 8);
/// Versions this crate's named-cache protocol implementation understands.
/// Version 6 is where `ClearRequest.truncate` and priming-listener fields
/// were introduced -- current is kept one past that line so the crate
/// can exercise the "version 5 peer rejects truncate" scenario in tests.
pub const CACHE_PROTOCOL_VERSION: VersionRange = VersionRange::new(1, 6);

/// Negotiate the version both sides of a channel will use for a protocol.
///
/// Chosen version is the largest value both ends understand: the maximum
/// `current_version` that both sides can understand, constrained so
/// `supported_version <= chosen <= current_version` holds on both ends.
pub fn negotiate_version(local: VersionRange, remote: VersionRange) -> Result<i32> {
    let chosen = local.current.min(remote.current);
    let floor = local.supported.max(remote.supported);
    if chosen < floor {
        protocol_bail!(
            "no compatible protocol version: local {:?}, remote {:?}",
            local,
            remote
        );
    }
    Ok(chosen)
}

/// A parsed `channel:<id>#<protocol>` URI.
///
/// ```
/// use extend_client::protocol::ChannelUri;
/// let uri: ChannelUri = "channel:42#NamedCacheProtocol".parse().unwrap();
/// assert_eq!(uri.channel_id, 42);
/// assert_eq!(uri.protocol, "NamedCacheProtocol");
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelUri {
    pub channel_id: i32,
    pub protocol: String,
}

impl fmt::Display for ChannelUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "channel:{}#{}", self.channel_id, self.protocol)
    }
}

impl FromStr for ChannelUri {
    type Err = PeerError;

    fn from_str(s: &str) -> Result<Self> {
        let rest = s
            .strip_prefix("channel:")
            .ok_or_else(|| PeerError::Protocol(format!("illegal URI: {s}")))?;
        let (id_part, protocol) = rest
            .split_once('#')
            .ok_or_else(|| PeerError::Protocol(format!("illegal URI: {s}")))?;
        let channel_id: i32 = id_part
            .parse()
            .map_err(|_| PeerError::Protocol(format!("illegal URI: {s}")))?;
        if channel_id == 0 {
            protocol_bail!("channel 0 is reserved");
        }
        if protocol.is_empty() {
            protocol_bail!("illegal URI: {s}");
        }
        Ok(ChannelUri {
            channel_id,
            protocol: protocol.to_string(),
        })
    }
}
