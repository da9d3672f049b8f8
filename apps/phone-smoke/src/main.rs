//! Connectivity smoke check against a live dialink device.
//!
//! Connects, prints the first few events from the stream, then exits.

use std::{env, sync::Arc, time::Duration};

use phone_device::{DeviceConfig, RuntimeConfig, spawn_runtime};
use phone_platform::JsonFileSnapshotStore;
use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "info,phone_device=debug,phone_core=debug";

/// Initialize global tracing subscriber with severity gating from environment.
///
/// Precedence:
/// 1) `RUST_LOG`
/// 2) `DIALINK_LOG`
/// 3) internal default filter
fn init_logging() {
    let env_filter = filter_from_env();
    let _ = tracing_subscriber::fmt()
        .with_target(true)
        .with_env_filter(env_filter)
        .try_init();
}

fn filter_from_env() -> EnvFilter {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return filter;
    }

    if let Some(value) = env::var("DIALINK_LOG")
        .ok()
        .filter(|v| !v.trim().is_empty())
        && let Ok(filter) = EnvFilter::try_new(value)
    {
        return filter;
    }

    EnvFilter::new(DEFAULT_FILTER)
}

#[tokio::main]
async fn main() {
    init_logging();

    let Ok(host) = env::var("DIALINK_HOST") else {
        eprintln!("DIALINK_HOST must be set to the device address");
        std::process::exit(2);
    };
    let snapshot_dir = env::var("DIALINK_SNAPSHOT_DIR")
        .unwrap_or_else(|_| "./.dialink-smoke-store".to_owned());

    let config = RuntimeConfig::new(DeviceConfig::new(host));
    let store = Arc::new(JsonFileSnapshotStore::new(snapshot_dir));

    let handle = match spawn_runtime(config, store) {
        Ok(handle) => handle,
        Err(err) => {
            eprintln!("Failed to start device runtime: {err}");
            std::process::exit(1);
        }
    };

    println!("Runtime started. Listening for events for 30 seconds...");
    let mut events = handle.subscribe();
    let listen = async {
        for _ in 0..10 {
            match events.recv().await {
                Ok(event) => println!("event: {event:?}"),
                Err(_) => break,
            }
        }
    };
    let _ = tokio::time::timeout(Duration::from_secs(30), listen).await;

    let state = handle.phone_state();
    println!(
        "state: app_state={:?} connected={} last_seq={}",
        state.app_state, state.connected, state.last_seq
    );

    handle.shutdown().await;
}
