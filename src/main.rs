//! Herd Cache demo
//!
//! Drives a thundering-herd workload through a coordinator and prints the
//! resulting statistics as JSON.

use std::env;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use tokio::signal;
use tokio::task::JoinSet;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use herd_cache::{spawn_cleanup_task, CacheError, Config, Coordinator};

/// Shape of the simulated workload.
#[derive(Debug, Clone)]
struct Workload {
    /// Concurrent callers per round
    callers: usize,
    /// Distinct keys the callers spread over
    keys: usize,
    /// Rounds to run; later rounds mostly hit
    rounds: usize,
    /// Simulated load latency
    load_latency: Duration,
}

impl Workload {
    /// # Environment Variables
    /// - `HERD_DEMO_CALLERS` (default: 100)
    /// - `HERD_DEMO_KEYS` (default: 10)
    /// - `HERD_DEMO_ROUNDS` (default: 3)
    /// - `HERD_DEMO_LOAD_MS` (default: 50)
    fn from_env() -> Self {
        fn var(name: &str, default: u64) -> u64 {
            env::var(name)
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default)
        }

        Self {
            callers: var("HERD_DEMO_CALLERS", 100) as usize,
            keys: var("HERD_DEMO_KEYS", 10).max(1) as usize,
            rounds: var("HERD_DEMO_ROUNDS", 3) as usize,
            load_latency: Duration::from_millis(var("HERD_DEMO_LOAD_MS", 50)),
        }
    }
}

/// Main entry point for the demo.
///
/// # Startup Sequence
/// 1. Initialize tracing subscriber for logging
/// 2. Load configuration from environment variables
/// 3. Create the coordinator
/// 4. Start background TTL cleanup task
/// 5. Run the workload until done or Ctrl+C
/// 6. Print statistics
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Defaults to "info" level, can be overridden with RUST_LOG env var
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "herd_cache=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Herd Cache demo");

    let config = Config::from_env();
    info!(
        "Configuration loaded: capacity={}, ttl={:?}, max_concurrent={:?}, rate_limit={:?}, policy={:?}",
        config.capacity,
        config.ttl,
        config.max_concurrent,
        config.rate_limit,
        config.rate_limit_policy
    );

    let coordinator: Coordinator<String, String> =
        Coordinator::new(config.clone()).context("invalid coordinator configuration")?;

    let cleanup_handle = config
        .cleanup_interval
        .map(|interval| spawn_cleanup_task(coordinator.clone(), interval));

    let workload = Workload::from_env();
    info!("Workload: {:?}", workload);

    tokio::select! {
        loads = run_workload(coordinator.clone(), workload) => {
            info!("Workload finished with {} underlying loads", loads);
        }
        _ = signal::ctrl_c() => {
            warn!("Received Ctrl+C, stopping workload early");
        }
    }

    if let Some(handle) = cleanup_handle {
        handle.abort();
    }

    let stats = serde_json::to_string_pretty(&coordinator.stats())?;
    println!("{}", stats);

    Ok(())
}

/// Runs every round and returns how many times the loader actually ran.
async fn run_workload(coordinator: Coordinator<String, String>, workload: Workload) -> u64 {
    let loads = Arc::new(AtomicU64::new(0));

    for round in 0..workload.rounds {
        let started = Instant::now();
        let mut callers = JoinSet::new();

        for caller in 0..workload.callers {
            let coordinator = coordinator.clone();
            let loads = loads.clone();
            let key = format!("item-{}", caller % workload.keys);
            let latency = workload.load_latency;

            callers.spawn(async move {
                coordinator
                    .get(key.clone(), move || async move {
                        loads.fetch_add(1, Ordering::Relaxed);
                        tokio::time::sleep(latency).await;
                        Ok::<_, anyhow::Error>(format!("payload for {}", key))
                    })
                    .await
            });
        }

        let mut failures = 0;
        while let Some(joined) = callers.join_next().await {
            match joined {
                Ok(Ok(_)) => {}
                Ok(Err(CacheError::RateLimited)) => failures += 1,
                Ok(Err(err)) => {
                    failures += 1;
                    warn!("Caller failed: {}", err);
                }
                Err(err) => {
                    failures += 1;
                    warn!("Caller task panicked: {}", err);
                }
            }
        }

        info!(
            "Round {} done in {:?} ({} failed calls)",
            round + 1,
            started.elapsed(),
            failures
        );
    }

    loads.load(Ordering::Relaxed)
}
