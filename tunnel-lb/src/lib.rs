// Tunnel load balancer controller library
// Shared modules for the daemon and tests

//! Tunnel load balancer controller
//!
//! Watches annotated Ingresses and `LoadBalancer` Services, provisions a
//! tunnel for each through a remote provisioning server and runs the matching
//! WireGuard tunnel on this host.
//!
//! # Main Components
//!
//! - [`config`]: Configuration file parsing and validation
//! - [`resource`]: Kind-independent view of watched resources
//! - [`k8s_client`]: Kubernetes fetch, status write-back and change feed
//! - [`api_client`]: Provisioning server HTTP client
//! - [`queue`]: De-duplicating rate-limited work queue
//! - [`reconciler`]: Convergence logic per resource
//! - [`watcher`]: Event filtering and worker loops
//! - [`tunnel`]: One `wg-quick` driven tunnel
//! - [`tunnel_manager`]: Registry of local tunnels
//! - [`health`]: Periodic tunnel health probe
//! - [`types`]: Shared data structures

#![warn(missing_docs)]

pub mod api_client;
pub mod config;
pub mod health;
pub mod k8s_client;
pub mod queue;
pub mod reconciler;
pub mod resource;
pub mod tunnel;
pub mod tunnel_manager;
pub mod types;
pub mod watcher;
