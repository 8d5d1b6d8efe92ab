// Registry of locally running tunnels

//! Tunnel lifecycle manager
//!
//! The manager is the only writer of the tunnel registry. Every operation
//! holds one exclusive lock for its full duration, including the external
//! process start/stop, so operations on different tunnels are serialised.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::sync::Mutex;

#[cfg(test)]
use mockall::automock;

use crate::tunnel::{LocalTunnel, WgQuick};
use crate::types::TunnelConfig;

/// Local tunnel operations the reconciler depends on
#[cfg_attr(test, automock)]
#[async_trait]
pub trait TunnelLifecycle: Send + Sync {
    /// Start a tunnel that is not registered yet
    async fn create(&self, config: &TunnelConfig) -> Result<()>;

    /// Restart a registered tunnel with a new configuration
    async fn update(&self, config: &TunnelConfig) -> Result<()>;

    /// Stop and unregister a tunnel
    async fn delete(&self, tunnel_id: &str) -> Result<()>;

    /// Whether a tunnel is registered
    async fn contains(&self, tunnel_id: &str) -> bool;
}

/// Read-only snapshot of a registered tunnel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelInfo {
    /// Tunnel id assigned by the provisioning server
    pub id: String,
    /// WireGuard configuration text
    pub config: String,
    /// Where the configuration is written on disk
    pub config_path: PathBuf,
    /// Kernel interface name
    pub interface: String,
    /// Pid of the last `wg-quick up` child, if still tracked
    pub pid: Option<u32>,
}

impl TunnelInfo {
    fn of(tunnel: &LocalTunnel) -> Self {
        Self {
            id: tunnel.id().to_string(),
            config: tunnel.config().to_string(),
            config_path: tunnel.config_path(),
            interface: tunnel.interface_name(),
            pid: tunnel.pid(),
        }
    }
}

/// Owner of all local tunnels
pub struct TunnelManager {
    driver: WgQuick,
    tunnels: Mutex<HashMap<String, LocalTunnel>>,
}

impl TunnelManager {
    /// Create an empty manager using `driver` for new tunnels
    pub fn new(driver: WgQuick) -> Self {
        Self {
            driver,
            tunnels: Mutex::new(HashMap::new()),
        }
    }

    /// Snapshot of one tunnel
    pub async fn get(&self, tunnel_id: &str) -> Result<TunnelInfo> {
        let tunnels = self.tunnels.lock().await;
        tunnels
            .get(tunnel_id)
            .map(TunnelInfo::of)
            .with_context(|| format!("tunnel {} not found", tunnel_id))
    }

    /// Snapshot of all tunnels, sorted by id
    pub async fn list(&self) -> Vec<TunnelInfo> {
        let tunnels = self.tunnels.lock().await;
        let mut infos: Vec<TunnelInfo> = tunnels.values().map(TunnelInfo::of).collect();
        infos.sort_by(|a, b| a.id.cmp(&b.id));
        infos
    }

    /// Kernel transfer counters (rx, tx) of one tunnel's interface
    pub async fn transfer_stats(&self, tunnel_id: &str) -> Result<(u64, u64)> {
        let tunnels = self.tunnels.lock().await;
        let tunnel = tunnels
            .get(tunnel_id)
            .with_context(|| format!("tunnel {} not found", tunnel_id))?;
        tunnel.transfer_stats().await
    }

    /// Stop every tunnel, keeping the ones that fail to stop registered
    pub async fn shutdown(&self) {
        let mut tunnels = self.tunnels.lock().await;
        let ids: Vec<String> = tunnels.keys().cloned().collect();

        for id in ids {
            let stopped = match tunnels.get_mut(&id) {
                Some(tunnel) => tunnel.stop().await,
                None => continue,
            };
            match stopped {
                Ok(()) => {
                    tunnels.remove(&id);
                }
                Err(e) => log::error!("Failed to stop tunnel {} during shutdown: {:#}", id, e),
            }
        }
    }
}

#[async_trait]
impl TunnelLifecycle for TunnelManager {
    async fn create(&self, config: &TunnelConfig) -> Result<()> {
        let mut tunnels = self.tunnels.lock().await;

        if tunnels.contains_key(&config.tunnel_id) {
            anyhow::bail!("tunnel {} already exists", config.tunnel_id);
        }

        let mut tunnel =
            LocalTunnel::new(config, self.driver.clone()).context("failed to create tunnel")?;
        tunnel.start().await.context("failed to start tunnel")?;

        log::info!("Registered local tunnel {}", config.tunnel_id);
        tunnels.insert(config.tunnel_id.clone(), tunnel);
        Ok(())
    }

    async fn update(&self, config: &TunnelConfig) -> Result<()> {
        let mut tunnels = self.tunnels.lock().await;

        let tunnel = tunnels
            .get_mut(&config.tunnel_id)
            .with_context(|| format!("tunnel {} not found", config.tunnel_id))?;

        tunnel
            .update(&config.wg_config)
            .await
            .context("failed to update tunnel")?;

        log::info!("Updated local tunnel {}", config.tunnel_id);
        Ok(())
    }

    async fn delete(&self, tunnel_id: &str) -> Result<()> {
        let mut tunnels = self.tunnels.lock().await;

        let tunnel = tunnels
            .get_mut(tunnel_id)
            .with_context(|| format!("tunnel {} not found", tunnel_id))?;

        tunnel.stop().await.context("failed to stop tunnel")?;

        tunnels.remove(tunnel_id);
        log::info!("Removed local tunnel {}", tunnel_id);
        Ok(())
    }

    async fn contains(&self, tunnel_id: &str) -> bool {
        self.tunnels.lock().await.contains_key(tunnel_id)
    }
}
