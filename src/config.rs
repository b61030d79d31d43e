//! Tunables for a [`Peer`](crate::peer::Peer) and for the TCP transport it
//! drives: buffer sizing and frame-size caps alongside the ping/timeout
//! knobs a connection's keepalive loop needs.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Configuration for one [`Peer`](crate::peer::Peer) and the connection it
/// drives.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerConfiguration {
    /// How often an idle connection sends a ping. `None` disables
    /// pinging entirely.
    pub ping_interval: Option<Duration>,
    /// How long to wait for a pong before treating the connection as dead.
    /// The effective timeout is `min(ping_interval, ping_timeout)`.
    pub ping_timeout: Duration,
    /// Default timeout applied to a request when the caller doesn't supply
    /// one explicitly.
    pub request_timeout: Duration,
    /// Largest frame this peer will accept from its socket.
    pub max_incoming_message_size: u32,
    /// Largest frame this peer will write to its socket.
    pub max_outgoing_message_size: u32,
    /// Socket-level read/write buffer size.
    pub buffer_size: usize,
    /// Disable Nagle's algorithm on the underlying TCP socket.
    pub tcp_nodelay: bool,
}

impl Default for PeerConfiguration {
    fn default() -> Self {
        Self {
            ping_interval: Some(Duration::from_secs(30)),
            ping_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
            max_incoming_message_size: 32 * 1024 * 1024,
            max_outgoing_message_size: 32 * 1024 * 1024,
            buffer_size: 64 * 1024,
            tcp_nodelay: true,
        }
    }
}

impl PeerConfiguration {
    /// `min(ping_interval, ping_timeout)`, or `ping_timeout` alone when
    /// pinging is disabled.
    pub fn effective_ping_timeout(&self) -> Duration {
        match self.ping_interval {
            Some(interval) => interval.min(self.ping_timeout),
            None => self.ping_timeout,
        }
    }
}

/// Where a client connects to reach the proxy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfiguration {
    pub host: String,
    pub port: u16,
    pub peer: PeerConfiguration,
}

impl ClientConfiguration {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            peer: PeerConfiguration::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn effective_ping_timeout_is_the_smaller_of_the_two() {
        let mut cfg = PeerConfiguration::default();
        cfg.ping_interval = Some(Duration::from_secs(5));
        cfg.ping_timeout = Duration::from_secs(10);
        assert_eq!(cfg.effective_ping_timeout(), Duration::from_secs(5));

        cfg.ping_interval = Some(Duration::from_secs(20));
        assert_eq!(cfg.effective_ping_timeout(), Duration::from_secs(10));
    }

    #[test]
    fn disabled_pinging_falls_back_to_the_timeout_alone() {
        let mut cfg = PeerConfiguration::default();
        cfg.ping_interval = None;
        assert_eq!(cfg.effective_ping_timeout(), cfg.ping_timeout);
    }
}
