// Tunnel reconciliation

//! Convergence logic for one watched resource
//!
//! A resource without a tunnel id gets a new remote tunnel, and the id is
//! written back to the resource as soon as the remote create succeeds. A
//! resource with a tunnel id gets its remote tunnel updated. Either way the
//! local tunnel is then started or restarted with the returned config. The
//! reconciler does not compare against previous state, every pass issues the
//! calls again.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

#[cfg(test)]
use mockall::automock;

use crate::api_client::ProvisioningApi;
use crate::k8s_client::ClusterClient;
use crate::resource::{ResourceKind, WatchedResource};
use crate::tunnel_manager::TunnelLifecycle;
use crate::types::{TunnelConfig, TunnelResponse};

/// Handler invoked by the watcher
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Reconcile: Send + Sync {
    /// Converge the remote and local tunnel of a live resource
    async fn reconcile(&self, resource: &WatchedResource) -> Result<()>;

    /// Tear down the tunnel of a deleted resource
    async fn handle_delete(&self, resource: &WatchedResource) -> Result<()>;
}

/// Tunnel ids written to resources whose update event has not come back yet
///
/// Keyed by `namespace/name`. The watcher consumes an entry when the
/// matching annotation change arrives, so only that one echo is ignored.
#[derive(Debug, Default)]
pub struct PersistedTunnelIds {
    ids: Mutex<HashMap<String, String>>,
}

impl PersistedTunnelIds {
    /// Remember that `tunnel_id` is being written to `key`
    pub async fn record(&self, key: &str, tunnel_id: &str) {
        self.ids
            .lock()
            .await
            .insert(key.to_string(), tunnel_id.to_string());
    }

    /// Drop the record for `key`
    pub async fn forget(&self, key: &str) {
        self.ids.lock().await.remove(key);
    }

    /// Consume the record for `key` if it matches `tunnel_id`
    pub async fn take_matching(&self, key: &str, tunnel_id: Option<&str>) -> bool {
        let mut ids = self.ids.lock().await;
        match (ids.get(key), tunnel_id) {
            (Some(recorded), Some(id)) if recorded == id => {
                ids.remove(key);
                true
            }
            _ => false,
        }
    }
}

/// Reconciler backed by the provisioning API, the local tunnel manager and
/// the cluster
pub struct Reconciler {
    api: Arc<dyn ProvisioningApi>,
    tunnels: Arc<dyn TunnelLifecycle>,
    cluster: Arc<dyn ClusterClient>,
    persisted: Arc<PersistedTunnelIds>,
}

impl Reconciler {
    /// Create a reconciler over the three collaborators
    pub fn new(
        api: Arc<dyn ProvisioningApi>,
        tunnels: Arc<dyn TunnelLifecycle>,
        cluster: Arc<dyn ClusterClient>,
    ) -> Self {
        Self {
            api,
            tunnels,
            cluster,
            persisted: Arc::new(PersistedTunnelIds::default()),
        }
    }

    /// Ids this reconciler wrote, shared with the watchers
    pub fn persisted_ids(&self) -> Arc<PersistedTunnelIds> {
        Arc::clone(&self.persisted)
    }

    async fn persist_tunnel_id(&self, resource: &WatchedResource, tunnel_id: &str) -> Result<()> {
        let key = resource.key();
        self.persisted.record(&key, tunnel_id).await;

        if let Err(e) = self.cluster.annotate_tunnel_id(resource, tunnel_id).await {
            self.persisted.forget(&key).await;
            return Err(e).context("failed to persist tunnel id");
        }
        Ok(())
    }

    /// Start the local tunnel, or restart it when already registered
    ///
    /// A tunnel id can outlive the local registry (controller restart, or a
    /// pass that failed after the id was persisted), so an unknown id on the
    /// update path is started fresh.
    async fn apply_local(&self, config: &TunnelConfig) -> Result<()> {
        if self.tunnels.contains(&config.tunnel_id).await {
            self.tunnels
                .update(config)
                .await
                .context("failed to update local tunnel")
        } else {
            self.tunnels
                .create(config)
                .await
                .context("failed to create local tunnel")
        }
    }

    /// Write the external address of a tunnel to the resource status
    async fn write_status(&self, resource: &WatchedResource, response: &TunnelResponse) -> Result<()> {
        // Ingress load balancer entries only carry the hostname
        let ip = match resource.kind {
            ResourceKind::Service => response.external_ip().map(str::to_string),
            ResourceKind::Ingress => None,
        };
        let hostname = response.external_host().map(str::to_string);

        if ip.is_none() && hostname.is_none() {
            log::debug!("{} {}: no external address yet", resource.kind, resource.key());
            return Ok(());
        }

        self.cluster
            .set_load_balancer(resource, ip, hostname)
            .await
            .context("failed to update load balancer status")
    }
}

#[async_trait]
impl Reconcile for Reconciler {
    async fn reconcile(&self, resource: &WatchedResource) -> Result<()> {
        let key = resource.key();

        if !resource.is_enabled() {
            log::debug!("{} {}: tunnel not enabled, skipping", resource.kind, key);
            return Ok(());
        }

        let request = resource.tunnel_request();

        let response = match resource.tunnel_id() {
            None => {
                let response = self
                    .api
                    .create_tunnel(&request)
                    .await
                    .context("failed to create remote tunnel")?;
                if response.tunnel_id.is_empty() {
                    anyhow::bail!("provisioning server returned an empty tunnel id");
                }

                // Later failures retry through the update path
                self.persist_tunnel_id(resource, &response.tunnel_id).await?;
                log::info!(
                    "{} {}: created tunnel {}",
                    resource.kind,
                    key,
                    response.tunnel_id
                );
                response
            }
            Some(tunnel_id) => {
                let response = self
                    .api
                    .update_tunnel(tunnel_id, &request)
                    .await
                    .with_context(|| format!("failed to update remote tunnel {}", tunnel_id))?;
                log::info!("{} {}: updated tunnel {}", resource.kind, key, tunnel_id);
                response
            }
        };

        let config = TunnelConfig::from_response(&response)?;
        self.apply_local(&config).await?;
        self.write_status(resource, &response).await
    }

    async fn handle_delete(&self, resource: &WatchedResource) -> Result<()> {
        let Some(tunnel_id) = resource.tunnel_id() else {
            log::debug!("{} {}: no tunnel to delete", resource.kind, resource.key());
            return Ok(());
        };

        self.api
            .delete_tunnel(tunnel_id)
            .await
            .with_context(|| format!("failed to delete remote tunnel {}", tunnel_id))?;

        self.tunnels.delete(tunnel_id).await.with_context(|| {
            format!(
                "remote tunnel {} deleted but local teardown failed",
                tunnel_id
            )
        })?;

        log::info!(
            "{} {}: deleted tunnel {}",
            resource.kind,
            resource.key(),
            tunnel_id
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api_client::{ApiError, MockProvisioningApi};
    use crate::k8s_client::MockClusterClient;
    use crate::resource::fixtures::{ingress, watched_service};
    use crate::resource::{Watchable, ENABLED_ANNOTATION, TUNNEL_ID_ANNOTATION};
    use crate::tunnel_manager::MockTunnelLifecycle;
    use crate::types::TunnelStatusKind;
    use mockall::Sequence;

    fn response(id: &str, ip: Option<&str>, host: Option<&str>) -> TunnelResponse {
        TunnelResponse {
            tunnel_id: id.to_string(),
            external_ip: ip.map(str::to_string),
            external_host: host.map(str::to_string),
            status: TunnelStatusKind::Active,
            wg_config: Some("test-config".to_string()),
        }
    }

    fn reconciler(
        api: MockProvisioningApi,
        tunnels: MockTunnelLifecycle,
        cluster: MockClusterClient,
    ) -> Reconciler {
        Reconciler::new(Arc::new(api), Arc::new(tunnels), Arc::new(cluster))
    }

    fn enabled_service() -> WatchedResource {
        watched_service("test-service", &[80, 443], &[(ENABLED_ANNOTATION, "true")])
    }

    fn annotated_service(tunnel_id: &str) -> WatchedResource {
        watched_service(
            "test-service",
            &[80],
            &[(ENABLED_ANNOTATION, "true"), (TUNNEL_ID_ANNOTATION, tunnel_id)],
        )
    }

    #[tokio::test]
    async fn test_reconcile_creates_tunnel() {
        let mut seq = Sequence::new();
        let mut api = MockProvisioningApi::new();
        let mut tunnels = MockTunnelLifecycle::new();
        let mut cluster = MockClusterClient::new();

        api.expect_create_tunnel()
            .withf(|req| {
                req.ingress_name == "test-service"
                    && req.ingress_namespace == "default"
                    && req.ports == vec![80, 443]
                    && req.hostname.is_empty()
            })
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| {
                Ok(response(
                    "new-tunnel-id",
                    Some("1.2.3.4"),
                    Some("test.example.com"),
                ))
            });
        cluster
            .expect_annotate_tunnel_id()
            .withf(|r, id| r.name == "test-service" && id == "new-tunnel-id")
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(()));
        tunnels
            .expect_contains()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| false);
        tunnels
            .expect_create()
            .withf(|c| c.tunnel_id == "new-tunnel-id" && c.wg_config == "test-config")
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));
        cluster
            .expect_set_load_balancer()
            .withf(|r, ip, host| {
                r.name == "test-service"
                    && ip.as_deref() == Some("1.2.3.4")
                    && host.as_deref() == Some("test.example.com")
            })
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _, _| Ok(()));
        api.expect_update_tunnel().times(0);
        tunnels.expect_update().times(0);

        let reconciler = reconciler(api, tunnels, cluster);
        reconciler.reconcile(&enabled_service()).await.unwrap();

        // The write is remembered until the watcher sees it
        let ids = reconciler.persisted_ids();
        assert!(
            ids.take_matching("default/test-service", Some("new-tunnel-id"))
                .await
        );
    }

    #[tokio::test]
    async fn test_reconcile_updates_existing_tunnel() {
        let mut api = MockProvisioningApi::new();
        let mut tunnels = MockTunnelLifecycle::new();
        let mut cluster = MockClusterClient::new();

        api.expect_create_tunnel().times(0);
        api.expect_update_tunnel()
            .withf(|id, req| id == "existing-id" && req.ports == vec![80])
            .times(1)
            .returning(|_, _| Ok(response("existing-id", Some("1.2.3.4"), None)));
        tunnels.expect_contains().returning(|_| true);
        tunnels.expect_create().times(0);
        tunnels
            .expect_update()
            .withf(|c| c.tunnel_id == "existing-id")
            .times(1)
            .returning(|_| Ok(()));
        cluster.expect_annotate_tunnel_id().times(0);
        cluster
            .expect_set_load_balancer()
            .withf(|_, ip, host| ip.as_deref() == Some("1.2.3.4") && host.is_none())
            .times(1)
            .returning(|_, _, _| Ok(()));

        reconciler(api, tunnels, cluster)
            .reconcile(&annotated_service("existing-id"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_reconcile_twice_updates_twice() {
        let resource = annotated_service("t1");

        let mut api = MockProvisioningApi::new();
        let mut tunnels = MockTunnelLifecycle::new();
        let mut cluster = MockClusterClient::new();

        api.expect_update_tunnel()
            .times(2)
            .returning(|_, _| Ok(response("t1", None, Some("t1.example.com"))));
        tunnels.expect_contains().returning(|_| true);
        tunnels.expect_update().times(2).returning(|_| Ok(()));
        cluster
            .expect_set_load_balancer()
            .times(2)
            .returning(|_, _, _| Ok(()));

        let reconciler = reconciler(api, tunnels, cluster);
        reconciler.reconcile(&resource).await.unwrap();
        reconciler.reconcile(&resource).await.unwrap();
    }

    #[tokio::test]
    async fn test_reconcile_update_starts_unregistered_tunnel() {
        // Registry is empty after a controller restart
        let mut api = MockProvisioningApi::new();
        let mut tunnels = MockTunnelLifecycle::new();
        let mut cluster = MockClusterClient::new();

        api.expect_create_tunnel().times(0);
        api.expect_update_tunnel()
            .times(1)
            .returning(|_, _| Ok(response("t1", Some("1.2.3.4"), None)));
        tunnels.expect_contains().times(1).returning(|_| false);
        tunnels.expect_update().times(0);
        tunnels
            .expect_create()
            .withf(|c| c.tunnel_id == "t1")
            .times(1)
            .returning(|_| Ok(()));
        cluster
            .expect_set_load_balancer()
            .times(1)
            .returning(|_, _, _| Ok(()));

        reconciler(api, tunnels, cluster)
            .reconcile(&annotated_service("t1"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_reconcile_not_enabled_is_noop() {
        // No expectations: any call panics
        let reconciler = reconciler(
            MockProvisioningApi::new(),
            MockTunnelLifecycle::new(),
            MockClusterClient::new(),
        );

        let resource = watched_service("plain", &[80], &[]);
        reconciler.reconcile(&resource).await.unwrap();
    }

    #[tokio::test]
    async fn test_reconcile_ingress_writes_hostname_only() {
        let resource = ingress(
            "test-ingress",
            "test.example.com",
            &[80],
            &[(ENABLED_ANNOTATION, "true")],
        )
        .to_watched();

        let mut api = MockProvisioningApi::new();
        let mut tunnels = MockTunnelLifecycle::new();
        let mut cluster = MockClusterClient::new();

        api.expect_create_tunnel()
            .withf(|req| {
                req.ingress_name == "test-ingress"
                    && req.hostname == "test.example.com"
                    && req.ports == vec![80]
            })
            .times(1)
            .returning(|_| Ok(response("t1", Some("1.2.3.4"), Some("test.example.com"))));
        tunnels.expect_contains().returning(|_| false);
        tunnels.expect_create().times(1).returning(|_| Ok(()));
        cluster
            .expect_annotate_tunnel_id()
            .times(1)
            .returning(|_, _| Ok(()));
        cluster
            .expect_set_load_balancer()
            .withf(|_, ip, host| ip.is_none() && host.as_deref() == Some("test.example.com"))
            .times(1)
            .returning(|_, _, _| Ok(()));

        reconciler(api, tunnels, cluster)
            .reconcile(&resource)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_reconcile_without_address_skips_status() {
        let resource = ingress("web", "web.example.com", &[80], &[(ENABLED_ANNOTATION, "")])
            .to_watched();

        let mut api = MockProvisioningApi::new();
        let mut tunnels = MockTunnelLifecycle::new();
        let mut cluster = MockClusterClient::new();

        // Ingresses ignore the ip, so this answer has nothing to write
        api.expect_create_tunnel()
            .times(1)
            .returning(|_| Ok(response("t1", Some("1.2.3.4"), Some(""))));
        tunnels.expect_contains().returning(|_| false);
        tunnels.expect_create().times(1).returning(|_| Ok(()));
        cluster
            .expect_annotate_tunnel_id()
            .times(1)
            .returning(|_, _| Ok(()));
        cluster.expect_set_load_balancer().times(0);

        reconciler(api, tunnels, cluster)
            .reconcile(&resource)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_reconcile_remote_failure_stops_pass() {
        let mut api = MockProvisioningApi::new();
        api.expect_create_tunnel().times(1).returning(|_| {
            Err(ApiError::Status {
                status: 503,
                body: "unavailable".to_string(),
            })
        });

        let reconciler = reconciler(api, MockTunnelLifecycle::new(), MockClusterClient::new());
        let err = reconciler.reconcile(&enabled_service()).await.unwrap_err();
        assert!(format!("{:#}", err).contains("failed to create remote tunnel"));
        assert!(format!("{:#}", err).contains("503"));
    }

    #[tokio::test]
    async fn test_reconcile_pending_tunnel_retries_as_update() {
        let mut seq = Sequence::new();
        let mut api = MockProvisioningApi::new();
        let mut tunnels = MockTunnelLifecycle::new();
        let mut cluster = MockClusterClient::new();

        // First pass: created remotely, but no config yet
        api.expect_create_tunnel()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| {
                let mut resp = response("t1", None, None);
                resp.status = TunnelStatusKind::Pending;
                resp.wg_config = None;
                Ok(resp)
            });
        cluster
            .expect_annotate_tunnel_id()
            .withf(|_, id| id == "t1")
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(()));

        // Retry sees the persisted id and takes the update path
        api.expect_update_tunnel()
            .withf(|id, _| id == "t1")
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(response("t1", Some("1.2.3.4"), None)));
        tunnels.expect_contains().times(1).returning(|_| false);
        tunnels
            .expect_create()
            .withf(|c| c.tunnel_id == "t1")
            .times(1)
            .returning(|_| Ok(()));
        cluster
            .expect_set_load_balancer()
            .times(1)
            .returning(|_, _, _| Ok(()));

        let reconciler = reconciler(api, tunnels, cluster);
        assert!(reconciler.reconcile(&enabled_service()).await.is_err());

        let mut retried = enabled_service();
        retried
            .annotations
            .insert(TUNNEL_ID_ANNOTATION.to_string(), "t1".to_string());
        reconciler.reconcile(&retried).await.unwrap();
    }

    #[tokio::test]
    async fn test_reconcile_annotation_failure_stops_pass() {
        let mut api = MockProvisioningApi::new();
        let mut cluster = MockClusterClient::new();

        api.expect_create_tunnel()
            .times(1)
            .returning(|_| Ok(response("t1", Some("1.2.3.4"), None)));
        cluster
            .expect_annotate_tunnel_id()
            .times(1)
            .returning(|_, _| Err(anyhow::anyhow!("forbidden")));

        // No local tunnel is started without a persisted id
        let reconciler = reconciler(api, MockTunnelLifecycle::new(), cluster);
        let err = reconciler.reconcile(&enabled_service()).await.unwrap_err();
        assert!(format!("{:#}", err).contains("failed to persist tunnel id"));

        let ids = reconciler.persisted_ids();
        assert!(!ids.take_matching("default/test-service", Some("t1")).await);
    }

    #[tokio::test]
    async fn test_reconcile_local_failure_skips_status() {
        let mut api = MockProvisioningApi::new();
        let mut tunnels = MockTunnelLifecycle::new();
        let mut cluster = MockClusterClient::new();

        api.expect_create_tunnel()
            .times(1)
            .returning(|_| Ok(response("t1", Some("1.2.3.4"), None)));
        cluster
            .expect_annotate_tunnel_id()
            .times(1)
            .returning(|_, _| Ok(()));
        tunnels.expect_contains().returning(|_| false);
        tunnels
            .expect_create()
            .times(1)
            .returning(|_| Err(anyhow::anyhow!("wg-quick failed")));
        cluster.expect_set_load_balancer().times(0);

        let reconciler = reconciler(api, tunnels, cluster);
        let err = reconciler.reconcile(&enabled_service()).await.unwrap_err();
        assert!(format!("{:#}", err).contains("failed to create local tunnel"));
    }

    #[tokio::test]
    async fn test_reconcile_status_failure_is_returned() {
        let mut api = MockProvisioningApi::new();
        let mut tunnels = MockTunnelLifecycle::new();
        let mut cluster = MockClusterClient::new();

        api.expect_create_tunnel()
            .returning(|_| Ok(response("t1", Some("1.2.3.4"), None)));
        tunnels.expect_contains().returning(|_| false);
        tunnels.expect_create().returning(|_| Ok(()));
        cluster.expect_annotate_tunnel_id().returning(|_, _| Ok(()));
        cluster
            .expect_set_load_balancer()
            .returning(|_, _, _| Err(anyhow::anyhow!("forbidden")));

        let reconciler = reconciler(api, tunnels, cluster);
        let err = reconciler.reconcile(&enabled_service()).await.unwrap_err();
        assert!(format!("{:#}", err).contains("failed to update load balancer status"));
    }

    #[tokio::test]
    async fn test_persisted_ids_match_only_recorded_value() {
        let ids = PersistedTunnelIds::default();
        ids.record("default/web", "t1").await;

        assert!(!ids.take_matching("default/web", Some("t2")).await);
        assert!(!ids.take_matching("default/web", None).await);
        assert!(!ids.take_matching("default/api", Some("t1")).await);
        assert!(ids.take_matching("default/web", Some("t1")).await);
        // Consumed
        assert!(!ids.take_matching("default/web", Some("t1")).await);
    }

    #[tokio::test]
    async fn test_handle_delete_remote_then_local() {
        let resource = annotated_service("tunnel-to-delete");

        let mut seq = Sequence::new();
        let mut api = MockProvisioningApi::new();
        let mut tunnels = MockTunnelLifecycle::new();

        api.expect_delete_tunnel()
            .withf(|id| id == "tunnel-to-delete")
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));
        tunnels
            .expect_delete()
            .withf(|id| id == "tunnel-to-delete")
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));

        reconciler(api, tunnels, MockClusterClient::new())
            .handle_delete(&resource)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_handle_delete_without_tunnel_id_is_noop() {
        let reconciler = reconciler(
            MockProvisioningApi::new(),
            MockTunnelLifecycle::new(),
            MockClusterClient::new(),
        );

        let resource = enabled_service();
        reconciler.handle_delete(&resource).await.unwrap();
    }

    #[tokio::test]
    async fn test_handle_delete_remote_failure_keeps_local() {
        let resource = watched_service("svc", &[80], &[(TUNNEL_ID_ANNOTATION, "t1")]);

        let mut api = MockProvisioningApi::new();
        api.expect_delete_tunnel().times(1).returning(|_| {
            Err(ApiError::Status {
                status: 404,
                body: String::new(),
            })
        });

        let reconciler = reconciler(api, MockTunnelLifecycle::new(), MockClusterClient::new());
        assert!(reconciler.handle_delete(&resource).await.is_err());
    }

    #[tokio::test]
    async fn test_handle_delete_local_failure_is_returned() {
        let resource = watched_service("svc", &[80], &[(TUNNEL_ID_ANNOTATION, "t1")]);

        let mut api = MockProvisioningApi::new();
        let mut tunnels = MockTunnelLifecycle::new();
        api.expect_delete_tunnel().times(1).returning(|_| Ok(()));
        tunnels
            .expect_delete()
            .times(1)
            .returning(|_| Err(anyhow::anyhow!("tunnel t1 not found")));

        let reconciler = reconciler(api, tunnels, MockClusterClient::new());
        let err = reconciler.handle_delete(&resource).await.unwrap_err();
        assert!(format!("{:#}", err).contains("local teardown failed"));
    }
}
