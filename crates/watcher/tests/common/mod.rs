//! Shared helpers for watch service integration tests

use std::sync::Once;
use std::time::{Duration, Instant};
use watcher::{PortBackend, WatchConfig, WatchEvent, WatchHandle, WatchService};

static TRACING: Once = Once::new();

/// Route `tracing` output through the test harness
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_test_writer()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("watcher=debug")),
            )
            .try_init();
    });
}

/// A service on the platform's default port with a short fallback scan interval
pub fn fast_service() -> anyhow::Result<WatchService> {
    init_tracing();
    let config = WatchConfig {
        poll_interval_ms: 10,
        ..WatchConfig::default()
    };
    Ok(WatchService::with_config(config)?)
}

/// A service forced onto the stat port
pub fn stat_service() -> anyhow::Result<WatchService> {
    init_tracing();
    let config = WatchConfig {
        backend: PortBackend::Stat,
        poll_interval_ms: 10,
        ..WatchConfig::default()
    };
    Ok(WatchService::with_config(config)?)
}

pub const TIMEOUT: Duration = Duration::from_secs(10);

/// Collect events for `handle` until `done` holds or `timeout` passes
pub fn collect_until(
    service: &WatchService,
    handle: &WatchHandle,
    timeout: Duration,
    mut done: impl FnMut(&[WatchEvent]) -> bool,
) -> anyhow::Result<Vec<WatchEvent>> {
    let deadline = Instant::now() + timeout;
    let mut events = Vec::new();

    while !done(&events) {
        let now = Instant::now();
        if now >= deadline {
            break;
        }
        if let Some(signalled) = service.poll_timeout(deadline - now)? {
            if &signalled == handle {
                events.extend(signalled.poll_events());
            }
            signalled.reset();
        }
    }
    Ok(events)
}

/// Whether `events` holds an event of `kind` for entry `name`
pub fn has_event(events: &[WatchEvent], kind: watcher::EventKind, name: &str) -> bool {
    events
        .iter()
        .any(|e| e.kind() == kind && e.name() == Some(std::path::Path::new(name)))
}
