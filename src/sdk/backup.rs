use std::sync::Arc;

use log::{debug, error};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};

use crate::sdk::Store;

/// Spawns the periodic safety copy of the primary into the backup blob.
///
/// Ticks every [`StoreConfig::backup_interval`](crate::sdk::StoreConfig), the
/// first tick one full interval after the call. Ticks are skipped while the
/// store is not served by the primary. Abort the handle to stop it.
pub fn spawn_auto_backup(store: Arc<Store>) -> JoinHandle<()> {
    let period = store.config().backup_interval;
    tokio::spawn(async move {
        let mut ticker = time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            match store.backup_now().await {
                Ok(true) => debug!("Auto-backup written"),
                Ok(false) => debug!("Auto-backup skipped, primary storage not live"),
                Err(e) => error!("Auto-backup failed: {}", e),
            }
        }
    })
}
