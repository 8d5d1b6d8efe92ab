// WireGuard tunnel process wrapper

//! One local WireGuard tunnel driven through `wg-quick`
//!
//! A [`LocalTunnel`] owns its configuration file (which contains key material)
//! and the handle of the spawned bring-up process. Artifacts left behind on
//! failure:
//!
//! - `start`: a failed spawn removes the config file again; nothing is left.
//! - `stop`: a failed kill or bring-down leaves the config file and the
//!   interface in place; a failed file removal leaves only the file.
//! - `update`: a failed start after a successful stop leaves nothing running.

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::{Child, Command};
use wireguard_control::{Backend, Device, InterfaceName};

use crate::types::TunnelConfig;

/// Owner read/write only
const CONFIG_FILE_MODE: u32 = 0o600;

/// IFNAMSIZ minus the trailing NUL
const MAX_INTERFACE_LEN: usize = 15;

/// Hex digits of the id digest used when `wg-<id>` is too long
const HASHED_SUFFIX_LEN: usize = 12;

/// Validates that a tunnel id is safe to use in file paths and command arguments.
/// Only allows alphanumeric characters, hyphens, and underscores.
pub fn validate_tunnel_id(id: &str) -> Result<()> {
    if id.is_empty() {
        anyhow::bail!("Tunnel id cannot be empty");
    }

    if !id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        anyhow::bail!(
            "Tunnel id contains invalid characters: '{}'. Only alphanumeric, hyphens, and underscores are allowed",
            id
        );
    }

    Ok(())
}

/// Kernel interface name for a tunnel id
///
/// `wg-<id>` when it fits in an interface name, otherwise `wg-` followed by
/// the first 12 hex digits of the id's SHA-256. `wg-quick` takes the
/// interface name from the config file stem, so this also names the file.
pub fn interface_name(tunnel_id: &str) -> String {
    let plain = format!("wg-{}", tunnel_id);
    if plain.len() <= MAX_INTERFACE_LEN {
        return plain;
    }

    let digest = hex::encode(Sha256::digest(tunnel_id.as_bytes()));
    format!("wg-{}", &digest[..HASHED_SUFFIX_LEN])
}

/// How tunnels are brought up and down on this host
#[derive(Debug, Clone)]
pub struct WgQuick {
    program: String,
    config_dir: PathBuf,
}

impl WgQuick {
    /// Driver invoking `program up|down <path>` with configs under `config_dir`
    pub fn new(program: impl Into<String>, config_dir: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            config_dir: config_dir.into(),
        }
    }

    /// Config file path for a tunnel id
    pub fn config_path(&self, tunnel_id: &str) -> PathBuf {
        self.config_dir
            .join(format!("{}.conf", interface_name(tunnel_id)))
    }
}

impl Default for WgQuick {
    fn default() -> Self {
        Self::new("wg-quick", std::env::temp_dir())
    }
}

/// A WireGuard tunnel instance
pub struct LocalTunnel {
    id: String,
    config: String,
    driver: WgQuick,
    child: Option<Child>,
}

impl LocalTunnel {
    /// Create a tunnel that is not running yet
    ///
    /// # Errors
    ///
    /// Returns an error if the tunnel id contains characters that are unsafe
    /// in a file name or command argument.
    pub fn new(config: &TunnelConfig, driver: WgQuick) -> Result<Self> {
        validate_tunnel_id(&config.tunnel_id)?;

        Ok(Self {
            id: config.tunnel_id.clone(),
            config: config.wg_config.clone(),
            driver,
            child: None,
        })
    }

    /// Tunnel id
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Current configuration text
    pub fn config(&self) -> &str {
        &self.config
    }

    /// Path of the on-disk configuration
    pub fn config_path(&self) -> PathBuf {
        self.driver.config_path(&self.id)
    }

    /// Interface name wg-quick derives from the config file stem
    pub fn interface_name(&self) -> String {
        interface_name(&self.id)
    }

    /// Pid of the bring-up process, if one is held
    pub fn pid(&self) -> Option<u32> {
        self.child.as_ref().and_then(|c| c.id())
    }

    /// Write the config and launch `wg-quick up` without waiting for it
    ///
    /// A config file already on disk belongs to an interface a previous
    /// controller run left up, which is brought down first.
    pub async fn start(&mut self) -> Result<()> {
        let path = self.config_path();
        if path.exists() {
            self.bring_down_leftover(&path).await;
        }

        write_config(&path, &self.config)
            .with_context(|| format!("Failed to write config for tunnel {}", self.id))?;

        log::info!("Bringing up WireGuard tunnel {} ({:?})", self.id, path);

        let spawned = Command::new(&self.driver.program)
            .arg("up")
            .arg(&path)
            .stdin(Stdio::null())
            .spawn();

        match spawned {
            Ok(child) => {
                self.child = Some(child);
                Ok(())
            }
            Err(e) => {
                if let Err(rm) = fs::remove_file(&path) {
                    log::warn!("Failed to remove config {:?} after spawn failure: {}", path, rm);
                }
                Err(e).with_context(|| format!("Failed to execute {} up", self.driver.program))
            }
        }
    }

    /// Kill the bring-up process, run `wg-quick down` and remove the config
    pub async fn stop(&mut self) -> Result<()> {
        if let Some(mut child) = self.child.take() {
            match child.kill().await {
                Ok(()) => {}
                // Already reaped
                Err(e) if e.kind() == ErrorKind::InvalidInput => {}
                Err(e) => {
                    self.child = Some(child);
                    return Err(e).with_context(|| {
                        format!("Failed to kill bring-up process of tunnel {}", self.id)
                    });
                }
            }
        }

        let path = self.config_path();
        log::info!("Bringing down WireGuard tunnel {} ({:?})", self.id, path);

        let output = Command::new(&self.driver.program)
            .arg("down")
            .arg(&path)
            .stdin(Stdio::null())
            .output()
            .await
            .with_context(|| format!("Failed to execute {} down", self.driver.program))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!("{} down failed for tunnel {}: {}", self.driver.program, self.id, stderr);
        }

        fs::remove_file(&path)
            .with_context(|| format!("Failed to remove config file {:?}", path))?;

        log::info!("WireGuard tunnel {} is down", self.id);
        Ok(())
    }

    async fn bring_down_leftover(&self, path: &Path) {
        log::info!("Replacing leftover WireGuard tunnel {} ({:?})", self.id, path);

        let output = Command::new(&self.driver.program)
            .arg("down")
            .arg(path)
            .stdin(Stdio::null())
            .output()
            .await;

        match output {
            Ok(output) if !output.status.success() => log::debug!(
                "{} down for leftover tunnel {} exited with {}",
                self.driver.program,
                self.id,
                output.status
            ),
            Ok(_) => {}
            Err(e) => log::warn!(
                "Failed to execute {} down for leftover tunnel {}: {}",
                self.driver.program,
                self.id,
                e
            ),
        }
    }

    /// Restart with a new configuration (bring-down, then bring-up)
    pub async fn update(&mut self, wg_config: &str) -> Result<()> {
        self.stop().await.context("Failed to stop tunnel for update")?;
        self.config = wg_config.to_string();
        self.start().await
    }

    /// Transfer statistics from the kernel WireGuard interface
    /// Returns (rx_bytes, tx_bytes) summed across all peers
    pub async fn transfer_stats(&self) -> Result<(u64, u64)> {
        let iface = self.interface_name();
        let iface_name: InterfaceName = iface
            .parse()
            .with_context(|| format!("Invalid interface name: {}", iface))?;

        // Netlink call is synchronous
        tokio::task::spawn_blocking(move || {
            let device = Device::get(&iface_name, Backend::Kernel)
                .context("Failed to get WireGuard device info")?;

            let mut total_rx = 0u64;
            let mut total_tx = 0u64;
            for peer in device.peers {
                total_rx += peer.stats.rx_bytes;
                total_tx += peer.stats.tx_bytes;
            }

            Ok::<(u64, u64), anyhow::Error>((total_rx, total_tx))
        })
        .await
        .context("Netlink task panicked")?
    }
}

/// Write `contents` to `path` readable and writable by the owner only
fn write_config(path: &Path, contents: &str) -> Result<()> {
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(CONFIG_FILE_MODE)
        .open(path)?;

    // mode() only applies on creation
    file.set_permissions(fs::Permissions::from_mode(CONFIG_FILE_MODE))?;
    file.write_all(contents.as_bytes())?;
    file.sync_all()?;
    Ok(())
}
