//! TTL Cleanup Task
//!
//! Background task that periodically removes expired cache entries.

use std::fmt::Debug;
use std::hash::Hash;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::coordinator::Coordinator;

/// Spawns a background task that periodically purges expired entries.
///
/// Expired entries are already treated as absent on read; the sweep only
/// returns their capacity early. The task runs until aborted.
///
/// # Arguments
/// * `coordinator` - Handle to the coordinator to sweep
/// * `interval` - Time between sweeps
///
/// # Returns
/// A JoinHandle for the spawned task, which can be used to abort the task
/// during shutdown.
///
/// # Example
/// ```ignore
/// let coordinator = Coordinator::new(Config::default())?;
/// let cleanup_handle = spawn_cleanup_task(coordinator.clone(), Duration::from_secs(1));
/// // Later, during shutdown:
/// cleanup_handle.abort();
/// ```
pub fn spawn_cleanup_task<K, V>(coordinator: Coordinator<K, V>, interval: Duration) -> JoinHandle<()>
where
    K: Hash + Eq + Clone + Debug + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    tokio::spawn(async move {
        info!("Starting TTL cleanup task with interval of {:?}", interval);

        loop {
            tokio::time::sleep(interval).await;

            let removed = coordinator.cleanup_expired();

            if removed > 0 {
                info!("TTL cleanup: removed {} expired entries", removed);
            } else {
                debug!("TTL cleanup: no expired entries found");
            }
        }
    })
}
