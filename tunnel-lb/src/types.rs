// Shared types between the controller, the provisioning client and the tunnel manager

//! Shared data structures
//!
//! This module defines the provisioning API wire models, the local tunnel
//! configuration request, and the daemon configuration structures.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Request body for creating or updating a remote tunnel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TunnelRequest {
    /// Resource name (Ingress or Service)
    pub ingress_name: String,
    /// Resource namespace
    pub ingress_namespace: String,
    /// Ingress host, empty for Services
    pub hostname: String,
    /// Ports to expose, in declaration order
    pub ports: Vec<i32>,
    /// Full annotation map of the resource
    pub annotations: BTreeMap<String, String>,
}

/// Remote tunnel status values
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TunnelStatusKind {
    /// Tunnel is up
    Active,
    /// Tunnel is being provisioned
    Pending,
    /// Provisioning failed
    Error,
    /// Server has no such tunnel
    NotFound,
    /// Any value this build does not know about
    #[serde(other)]
    Unknown,
}

/// Response from the provisioning server for a create/update request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TunnelResponse {
    /// Server-assigned tunnel id
    pub tunnel_id: String,
    /// Public IP, when assigned
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_ip: Option<String>,
    /// Public hostname, when assigned
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_host: Option<String>,
    /// Provisioning state
    pub status: TunnelStatusKind,
    /// WireGuard config text, absent while pending
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wg_config: Option<String>,
}

impl TunnelResponse {
    /// External IP, treating an empty string as absent
    pub fn external_ip(&self) -> Option<&str> {
        non_empty(&self.external_ip)
    }

    /// External hostname, treating an empty string as absent
    pub fn external_host(&self) -> Option<&str> {
        non_empty(&self.external_host)
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|v| !v.is_empty())
}

/// Current status of a remote tunnel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TunnelStatus {
    /// Tunnel id
    pub tunnel_id: String,
    /// Provisioning state
    pub status: TunnelStatusKind,
    /// Server-side error message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Configuration handed to the tunnel manager for one local tunnel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelConfig {
    /// Tunnel id, also the registry key
    pub tunnel_id: String,
    /// WireGuard config text written for `wg-quick`
    pub wg_config: String,
}

impl TunnelConfig {
    /// Build the local configuration from a provisioning response
    pub fn from_response(resp: &TunnelResponse) -> anyhow::Result<Self> {
        let wg_config = match non_empty(&resp.wg_config) {
            Some(cfg) => cfg.to_string(),
            None => anyhow::bail!(
                "provisioning server returned no WireGuard config for tunnel {}",
                resp.tunnel_id
            ),
        };

        Ok(Self {
            tunnel_id: resp.tunnel_id.clone(),
            wg_config,
        })
    }
}

/// Main configuration structure
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// `[general]` section
    #[serde(default)]
    pub general: GeneralConfig,
    /// `[server]` section
    #[serde(default)]
    pub server: ServerConfig,
    /// `[controller]` section
    #[serde(default)]
    pub controller: ControllerConfig,
    /// `[tunnel]` section
    #[serde(default)]
    pub tunnel: TunnelDriverConfig,
}

/// General configuration options
#[derive(Debug, Deserialize, Clone)]
pub struct GeneralConfig {
    /// `env_logger` filter used when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// Provisioning server connection
#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Base URL of the provisioning server
    #[serde(default = "default_server_url")]
    pub url: String,
    /// Bearer token, no `Authorization` header when empty
    #[serde(default)]
    pub api_key: String,
    /// Request timeout in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout: u64,
}

/// Which resources to watch and how many workers reconcile them
#[derive(Debug, Deserialize, Clone)]
pub struct ControllerConfig {
    /// Watch Ingresses
    #[serde(default = "default_true")]
    pub watch_ingresses: bool,
    /// Watch `LoadBalancer` Services
    #[serde(default = "default_true")]
    pub watch_services: bool,
    /// Restrict watches to one namespace (all namespaces when unset)
    #[serde(default)]
    pub namespace: Option<String>,
    /// Worker loops per resource kind
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Seconds between tunnel health probes, 0 disables the probe
    #[serde(default = "default_health_interval")]
    pub health_interval: u64,
}

/// Local WireGuard driver settings
#[derive(Debug, Deserialize, Clone)]
pub struct TunnelDriverConfig {
    /// Program invoked as `<wg_quick> up|down <config path>`
    #[serde(default = "default_wg_quick")]
    pub wg_quick: String,
    /// Directory holding per-tunnel config files (system temp dir when unset)
    #[serde(default)]
    pub config_dir: Option<PathBuf>,
    /// Bring every local tunnel down on SIGTERM/SIGINT
    ///
    /// Off by default: tunnels keep running across a controller restart and
    /// are adopted again by the next reconcile of their resource.
    #[serde(default)]
    pub teardown_on_exit: bool,
}

// Default values for configuration
fn default_log_level() -> String {
    "info".to_string()
}

fn default_server_url() -> String {
    "http://localhost:8080".to_string()
}

fn default_request_timeout() -> u64 {
    30
}

fn default_true() -> bool {
    true
}

fn default_workers() -> usize {
    1
}

fn default_health_interval() -> u64 {
    60
}

fn default_wg_quick() -> String {
    "wg-quick".to_string()
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            url: default_server_url(),
            api_key: String::new(),
            request_timeout: default_request_timeout(),
        }
    }
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            watch_ingresses: true,
            watch_services: true,
            namespace: None,
            workers: default_workers(),
            health_interval: default_health_interval(),
        }
    }
}

impl Default for TunnelDriverConfig {
    fn default() -> Self {
        Self {
            wg_quick: default_wg_quick(),
            config_dir: None,
            teardown_on_exit: false,
        }
    }
}
