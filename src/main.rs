use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use dnstap_blackhole::admission::RecordAdmission;
use dnstap_blackhole::blocklist::DomainMatcher;
use dnstap_blackhole::config::Config;
use dnstap_blackhole::dnstap::StreamIngestor;
use dnstap_blackhole::init::{open_store, setup_logging};
use dnstap_blackhole::routes::BirdRouteFile;
use dnstap_blackhole::stats::{Gauges, StatsCollector};

#[derive(Parser, Debug)]
#[command(version, about = "Blackholes addresses of blocklisted domains seen over dnstap")]
struct Args {
    /// Path to the TOML config file
    #[arg(short, long, default_value = "dnstap-blackhole.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // 1. Load Config
    let config = Config::load(&args.config)
        .await
        .with_context(|| format!("Unable to load config '{}'", args.config.display()))?;

    // 2. Setup Logging
    setup_logging(&config);
    info!("Starting dnstap-blackhole...");

    config.validate()?;
    let ttl = config.ttl();
    let listen = config.listen_addr()?;

    // 3. Load blocklist
    let matcher = Arc::new(DomainMatcher::new());
    let report = matcher
        .load_file(&config.domains)
        .with_context(|| format!("Unable to load domains from '{}'", config.domains.display()))?;
    info!("Domains loaded: {}, skipped: {}", report.loaded, report.skipped);

    // 4. Route file, store and admission
    let (routes, route_writer) = BirdRouteFile::create(&config.routes, config.reload_command())
        .await
        .with_context(|| format!("Unable to create route file '{}'", config.routes.display()))?;
    let routes = Arc::new(routes);

    let store = open_store(&config)?;
    let stats = Arc::new(StatsCollector::new());
    let admission = RecordAdmission::new(
        ttl,
        matcher.clone(),
        store.clone(),
        routes.clone(),
        stats.clone(),
    );

    let restored = admission
        .restore(SystemTime::now())
        .context("Unable to load entries from store")?;
    info!(
        "Loaded from store: {}, expired: {}, vanished: {}",
        restored.restored, restored.expired, restored.vanished
    );

    // 5. Start ingestor
    let ingestor = StreamIngestor::bind(
        &listen,
        config.ingest_options(),
        matcher.clone(),
        admission.clone(),
        stats.clone(),
    )
    .await
    .with_context(|| format!("Unable to listen on {}", listen))?;
    info!("dnstap listening on {}, TTL {:?}", listen, ttl);

    let shutdown = CancellationToken::new();
    let server = tokio::spawn(ingestor.run(shutdown.clone()));

    // 6. Periodic stats
    let reporter = if config.logging.stats_interval_seconds > 0 {
        let admission = admission.clone();
        let matcher = matcher.clone();
        Some(stats.clone().spawn_reporter(
            Duration::from_secs(config.logging.stats_interval_seconds),
            move || Gauges {
                blackholed: admission.cache().count(),
                domains: matcher.count(),
            },
        ))
    } else {
        None
    };

    // 7. Signals
    let mut hangup = signal(SignalKind::hangup())?;
    let mut terminate = signal(SignalKind::terminate())?;
    let mut user1 = signal(SignalKind::user_defined1())?;
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = hangup.recv() => {
                info!("SIGHUP received, reloading domains");
                let matcher = matcher.clone();
                let path = config.domains.clone();
                match tokio::task::spawn_blocking(move || matcher.load_file(path)).await {
                    Ok(Ok(report)) => {
                        info!("Domains loaded: {}, skipped: {}", report.loaded, report.skipped)
                    }
                    Ok(Err(e)) => error!("Unable to reload domains, keeping previous list: {}", e),
                    Err(e) => error!("Domain reload task failed: {}", e),
                }
            }
            _ = user1.recv() => {
                info!(
                    "{} addresses blackholed, {} domains loaded",
                    admission.cache().count(),
                    matcher.count()
                );
            }
            _ = terminate.recv() => {
                info!("SIGTERM received.");
                break;
            }
            _ = &mut ctrl_c => {
                info!("Shutdown signal received.");
                break;
            }
        }
    }

    // 8. Graceful Shutdown
    shutdown.cancel();
    if let Some(reporter) = reporter {
        reporter.abort();
        let _ = reporter.await;
    }
    if let Err(e) = server.await {
        error!("dnstap listener task failed: {}", e);
    }

    admission.close();
    // Closing drains queued writes on the store's own thread.
    match tokio::task::spawn_blocking(move || store.close()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("Unable to close store: {}", e),
        Err(e) => error!("Store close task failed: {}", e),
    }

    // The route writer exits once its last sender is gone.
    drop(admission);
    drop(routes);
    if tokio::time::timeout(Duration::from_secs(5), route_writer)
        .await
        .is_err()
    {
        warn!("Route writer did not finish in time");
    }

    info!("Stopped.");
    Ok(())
}
