use std::net::ToSocketAddrs;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, Level};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

use extend_client::cache::RemoteCache;
use extend_client::cli::Args;
use extend_client::config::ClientConfiguration;
use extend_client::listener::MapListener;
use extend_client::logging::SeverityColorFormatter;
use extend_client::message::MapEvent;
use extend_client::peer::Peer;

struct DemoListener;

impl MapListener for DemoListener {
    fn entry_inserted(&self, event: &MapEvent) {
        info!(key = ?event.key, "demo listener saw an insert");
    }

    fn entry_updated(&self, event: &MapEvent) {
        info!(key = ?event.key, "demo listener saw an update");
    }

    fn entry_deleted(&self, event: &MapEvent) {
        info!(key = ?event.key, "demo listener saw a delete");
    }
}

fn init_logging(args: &Args) -> Result<tracing_appender::non_blocking::WorkerGuard> {
    let level = match args.verbose {
        0 => Level::INFO,
        1 => Level::DEBUG,
        _ => Level::TRACE,
    };

    std::fs::create_dir_all(&args.log_dir).context("creating log directory")?;
    let file_appender = tracing_appender::rolling::daily(&args.log_dir, "extend-client-demo.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_filter(EnvFilter::new(level.to_string()));

    let registry = tracing_subscriber::registry().with(file_layer);

    if args.quiet {
        registry.init();
    } else {
        let console_layer = fmt::layer()
            .event_format(SeverityColorFormatter)
            .with_filter(EnvFilter::new(level.to_string()));
        registry.with(console_layer).init();
    }

    Ok(guard)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let _log_guard = init_logging(&args)?;

    let config: ClientConfiguration = (&args).into();
    let addr = (config.host.as_str(), config.port)
        .to_socket_addrs()
        .context("resolving cache proxy address")?
        .next()
        .context("cache proxy address resolved to no addresses")?;

    info!(%addr, "connecting to cache proxy");
    let peer = Peer::connect(addr, config.peer.clone())
        .await
        .context("connecting to cache proxy")?;

    let cache = RemoteCache::connect(peer.as_ref(), args.cache.clone())
        .await
        .context("opening remote cache")?;

    run_demo(&cache, &args).await?;

    peer.close(Some("demo finished".into())).await;
    Ok(())
}

async fn run_demo(cache: &Arc<RemoteCache>, args: &Args) -> Result<()> {
    info!(cache = cache.name(), "put/get round trip");
    cache.put(b"hello".to_vec(), b"world".to_vec(), 0, false).await?;
    let value = cache.get(b"hello".to_vec()).await?;
    info!(?value, "fetched back the value we just put");

    info!(entries = args.demo_entries, "populating entries for the paged query demo");
    let entries: Vec<(Vec<u8>, Vec<u8>)> = (0..args.demo_entries)
        .map(|i| (format!("key-{i}").into_bytes(), format!("value-{i}").into_bytes()))
        .collect();
    cache.put_all(entries).await?;

    let always_true_filter = b"always-true".to_vec();
    let mut query_pages = 0usize;
    let mut total_keys = 0usize;
    let mut cookie = None;
    loop {
        let page = cache
            .query_page(always_true_filter.clone(), true, cookie)
            .await?;
        query_pages += 1;
        total_keys += page.items.len();
        if page.is_last() {
            break;
        }
        cookie = page.cookie;
    }
    info!(query_pages, total_keys, "paged query finished");

    cache
        .add_key_listener(b"hello".to_vec(), Arc::new(DemoListener), true, false)
        .await?;
    info!("registered a key listener on \"hello\"");

    let size = cache.size().await?;
    info!(size, "final cache size");

    let summary = DemoSummary {
        cache: cache.name().to_string(),
        entries_put: args.demo_entries + 1,
        query_pages,
        query_keys: total_keys,
        final_size: size,
    };
    println!("{}", serde_json::to_string_pretty(&summary)?);

    Ok(())
}

#[derive(serde::Serialize)]
struct DemoSummary {
    cache: String,
    entries_put: usize,
    query_pages: usize,
    query_keys: usize,
    final_size: i64,
}
