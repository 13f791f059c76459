//! Lease reaper

use crate::registry::EndpointRegistry;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info};

/// Expire lapsed endpoints every `interval` until shutdown
pub async fn run(
    registry: Arc<EndpointRegistry>,
    interval: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    info!(interval_secs = interval.as_secs_f64(), "Lease reaper started");

    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {
                let expired = registry.expire(Utc::now()).await;
                if expired.is_empty() {
                    debug!("No leases expired");
                } else {
                    info!(count = expired.len(), hosts = ?expired, "Expired endpoints");
                }
            }
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    debug!("Lease reaper stopping");
                    break;
                }
            }
        }
    }
}
