// Tunnel health probe

//! Periodic health check of local tunnels
//!
//! Compares every registered tunnel with the remote status endpoint and
//! reads the kernel transfer counters of its interface. Read only: problems
//! are logged, nothing is restarted or removed.

use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::api_client::{is_not_found, ProvisioningApi};
use crate::tunnel_manager::TunnelManager;
use crate::types::TunnelStatusKind;

/// Result of probing one tunnel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelHealth {
    /// Tunnel id
    pub tunnel_id: String,
    /// Local interface name
    pub interface: String,
    /// Remote status, `None` when the status call failed
    pub remote: Option<TunnelStatusKind>,
    /// Remote error message or the reason the status call failed
    pub error: Option<String>,
    /// (rx, tx) bytes, `None` when the interface could not be read
    pub transfer: Option<(u64, u64)>,
}

impl TunnelHealth {
    /// Remote reports the tunnel as active or still pending
    pub fn is_healthy(&self) -> bool {
        matches!(
            self.remote,
            Some(TunnelStatusKind::Active) | Some(TunnelStatusKind::Pending)
        )
    }
}

/// Probe every registered tunnel once
pub async fn probe(api: &dyn ProvisioningApi, manager: &TunnelManager) -> Vec<TunnelHealth> {
    let mut report = Vec::new();

    for tunnel in manager.list().await {
        let (remote, error) = match api.tunnel_status(&tunnel.id).await {
            Ok(status) => (Some(status.status), status.error),
            Err(e) if is_not_found(&e) => (Some(TunnelStatusKind::NotFound), None),
            Err(e) => (None, Some(e.to_string())),
        };

        let transfer = match manager.transfer_stats(&tunnel.id).await {
            Ok(stats) => Some(stats),
            Err(e) => {
                log::debug!("No transfer stats for {}: {:#}", tunnel.interface, e);
                None
            }
        };

        let health = TunnelHealth {
            tunnel_id: tunnel.id,
            interface: tunnel.interface,
            remote,
            error,
            transfer,
        };

        if health.is_healthy() {
            if let Some((rx, tx)) = health.transfer {
                log::debug!(
                    "Tunnel {} healthy (rx: {} bytes, tx: {} bytes)",
                    health.tunnel_id,
                    rx,
                    tx
                );
            }
        } else {
            log::warn!(
                "Tunnel {} unhealthy: remote status {:?}{}",
                health.tunnel_id,
                health.remote,
                health
                    .error
                    .as_deref()
                    .map(|e| format!(" ({})", e))
                    .unwrap_or_default()
            );
        }

        report.push(health);
    }

    report
}

/// Probe every `interval` until cancelled
pub async fn run_probe_loop(
    api: Arc<dyn ProvisioningApi>,
    manager: Arc<TunnelManager>,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick completes immediately
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let report = probe(api.as_ref(), &manager).await;
                let unhealthy = report.iter().filter(|h| !h.is_healthy()).count();
                log::info!(
                    "Health probe: {} tunnel(s), {} unhealthy",
                    report.len(),
                    unhealthy
                );
            }
        }
    }
}
