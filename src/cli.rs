//! Command-line arguments for the `extend-client-demo` binary.
//!
//! This is a small driver, not a benchmark harness: it connects a
//! [`Peer`](crate::peer::Peer) to a grid proxy, opens a
//! [`RemoteCache`](crate::cache::RemoteCache), and runs a scripted
//! put/get, paged query, and listener demonstration against it, printing
//! what happened along the way.

use clap::builder::styling::{AnsiColor, Styles};
use clap::Parser;
use std::time::Duration;

use crate::config::{ClientConfiguration, PeerConfiguration};

/// Matches clap v3's default color scheme for the help output.
fn styles() -> Styles {
    Styles::styled()
        .header(AnsiColor::Yellow.on_default())
        .usage(AnsiColor::Yellow.on_default())
        .literal(AnsiColor::Green.on_default())
        .placeholder(AnsiColor::Green.on_default())
}

/// Connect to a remote cache proxy and run a scripted demonstration
/// against it: put/get, a paged filtered query, and a key listener.
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None, styles = styles())]
pub struct Args {
    /// Host name or address of the cache proxy to connect to.
    #[arg(long, default_value = "127.0.0.1", help_heading = "Connection")]
    pub host: String,

    /// TCP port the cache proxy is listening on.
    #[arg(short = 'p', long, default_value_t = 7574, help_heading = "Connection")]
    pub port: u16,

    /// Name of the cache to open on the remote grid.
    #[arg(long, default_value = "demo-cache", help_heading = "Connection")]
    pub cache: String,

    /// How often to send a ping on an otherwise idle connection.
    ///
    /// Accepts human-readable durations like "30s" or "1m". Pass "off" to
    /// disable pinging entirely.
    #[arg(long, default_value = "30s", value_parser = parse_optional_duration, help_heading = "Connection")]
    pub ping_interval: Option<Duration>,

    /// How long to wait for a pong before treating the connection as dead.
    #[arg(long, default_value = "10s", value_parser = parse_duration, help_heading = "Connection")]
    pub ping_timeout: Duration,

    /// Default timeout applied to a request when none is given explicitly.
    #[arg(long, default_value = "30s", value_parser = parse_duration, help_heading = "Connection")]
    pub request_timeout: Duration,

    /// Largest frame this client will accept from the socket, in bytes.
    #[arg(long, default_value_t = 32 * 1024 * 1024, help_heading = "Advanced")]
    pub max_incoming_message_size: u32,

    /// Largest frame this client will write to the socket, in bytes.
    #[arg(long, default_value_t = 32 * 1024 * 1024, help_heading = "Advanced")]
    pub max_outgoing_message_size: u32,

    /// Socket read/write buffer size, in bytes.
    #[arg(long, default_value_t = 64 * 1024, help_heading = "Advanced")]
    pub buffer_size: usize,

    /// Number of synthetic entries to put during the paged-query part of
    /// the demo.
    #[arg(long, default_value_t = 250, help_heading = "Demo")]
    pub demo_entries: usize,

    /// Suppress colorized console output; only write to the log file.
    #[arg(short, long)]
    pub quiet: bool,

    /// Increase log verbosity (-v for debug, -vv for trace).
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Directory log files are rolled into, one per day.
    #[arg(long, default_value = "logs")]
    pub log_dir: std::path::PathBuf,
}

fn parse_duration(s: &str) -> Result<Duration, String> {
    parse_optional_duration(s)?.ok_or_else(|| "duration must not be \"off\" here".to_string())
}

fn parse_optional_duration(s: &str) -> Result<Option<Duration>, String> {
    if s.eq_ignore_ascii_case("off") {
        return Ok(None);
    }
    let (number, unit) = s
        .find(|c: char| !c.is_ascii_digit())
        .map(|idx| s.split_at(idx))
        .ok_or_else(|| format!("invalid duration: {s}"))?;
    let value: u64 = number
        .parse()
        .map_err(|_| format!("invalid duration: {s}"))?;
    let duration = match unit {
        "s" => Duration::from_secs(value),
        "m" => Duration::from_secs(value * 60),
        "h" => Duration::from_secs(value * 3600),
        "ms" => Duration::from_millis(value),
        other => return Err(format!("unknown duration unit: {other}")),
    };
    Ok(Some(duration))
}

impl From<&Args> for ClientConfiguration {
    fn from(args: &Args) -> Self {
        ClientConfiguration {
            host: args.host.clone(),
            port: args.port,
            peer: PeerConfiguration {
                ping_interval: args.ping_interval,
                ping_timeout: args.ping_timeout,
                request_timeout: args.request_timeout,
                max_incoming_message_size: args.max_incoming_message_size,
                max_outgoing_message_size: args.max_outgoing_message_size,
                buffer_size: args.buffer_size,
                tcp_nodelay: true,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_seconds() {
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
    }

    #[test]
    fn parses_minutes_and_hours() {
        assert_eq!(parse_duration("2m").unwrap(), Duration::from_secs(120));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
    }

    #[test]
    fn off_disables_the_ping_interval() {
        assert_eq!(parse_optional_duration("off").unwrap(), None);
        assert_eq!(parse_optional_duration("OFF").unwrap(), None);
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse_duration("soon").is_err());
        assert!(parse_duration("10x").is_err());
    }

    #[test]
    fn converts_into_a_client_configuration() {
        let args = Args::parse_from([
            "extend-client-demo",
            "--host",
            "cache.example.com",
            "--port",
            "9099",
        ]);
        let config: ClientConfiguration = (&args).into();
        assert_eq!(config.host, "cache.example.com");
        assert_eq!(config.port, 9099);
    }
}
