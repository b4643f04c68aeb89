//! Scheduled snapshots: periodically create a backup and prune the oldest
//! directories beyond the configured retention.

use crate::store::Store;
use meshdb_core::config::BackupConfig;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info};

/// Spawn the auto-backup loop. Returns `None` when auto-backup is off.
pub fn spawn_auto_backup(
    store: Arc<Store>,
    config: BackupConfig,
    mut shutdown: watch::Receiver<bool>,
) -> Option<tokio::task::JoinHandle<()>> {
    if !config.auto_backup {
        return None;
    }
    let period = Duration::from_secs(config.interval.max(1));

    Some(tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // Skip the immediate first tick; a backup at t=0 snapshots nothing.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match store.create_backup() {
                        Ok(name) => {
                            info!(backup = %name, "automatic backup created");
                            prune(&store, config.max_backups);
                        }
                        Err(e) => error!(error = %e, "automatic backup failed"),
                    }
                }
                _ = shutdown.changed() => {
                    debug!("auto-backup task shutting down");
                    break;
                }
            }
        }
    }))
}

/// Delete the oldest backups beyond `max_backups`. Zero keeps everything.
pub fn prune(store: &Store, max_backups: usize) {
    if max_backups == 0 {
        return;
    }
    let names = match store.list_backups() {
        Ok(names) => names,
        Err(e) => {
            error!(error = %e, "could not list backups for pruning");
            return;
        }
    };
    if names.len() <= max_backups {
        return;
    }
    // Names embed the timestamp, so the sorted list is oldest-first.
    for name in &names[..names.len() - max_backups] {
        match store.delete_backup(name) {
            Ok(()) => info!(backup = %name, "pruned old backup"),
            Err(e) => error!(backup = %name, error = %e, "failed to prune backup"),
        }
    }
}
