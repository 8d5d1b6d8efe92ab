// Kubernetes API access

//! Cluster client and change feed
//!
//! [`ClusterClient`] covers the three calls the controller makes against the
//! API server: fetch by key, status write-back and tunnel-id persistence.
//! [`feed`] turns a `kube` watch into a stream of [`FeedEvent`]s, keeping a
//! reflector store of the last seen objects on the way.

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::stream::{self, BoxStream};
use futures_util::StreamExt;
use k8s_openapi::api::core::v1::Service;
use k8s_openapi::api::networking::v1::Ingress;
use k8s_openapi::NamespaceResourceScope;
use kube::api::{Api, Patch, PatchParams};
use kube::runtime::reflector::{self, store::Writer, ObjectRef, Store};
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Client, Resource};
use serde::de::DeserializeOwned;
use serde_json::{json, Map, Value};
use std::collections::HashSet;
use std::fmt::Debug;
use std::hash::Hash;

#[cfg(test)]
use mockall::automock;

use crate::resource::{ResourceKind, Watchable, WatchedResource, TUNNEL_ID_ANNOTATION};

/// Cluster operations the controller depends on
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Fetch the current object, `None` when it no longer exists
    async fn get(
        &self,
        kind: ResourceKind,
        namespace: &str,
        name: &str,
    ) -> Result<Option<WatchedResource>>;

    /// Replace `status.loadBalancer.ingress` with a single entry
    async fn set_load_balancer(
        &self,
        resource: &WatchedResource,
        ip: Option<String>,
        hostname: Option<String>,
    ) -> Result<()>;

    /// Persist the tunnel id annotation
    async fn annotate_tunnel_id(&self, resource: &WatchedResource, tunnel_id: &str) -> Result<()>;
}

/// `kube`-backed cluster client
#[derive(Clone)]
pub struct KubeClusterClient {
    client: Client,
}

impl KubeClusterClient {
    /// Wrap a connected `kube` client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api<K>(&self, namespace: &str) -> Api<K>
    where
        K: Resource<Scope = NamespaceResourceScope>,
        <K as Resource>::DynamicType: Default,
    {
        Api::namespaced(self.client.clone(), namespace)
    }

    async fn get_as<K>(&self, namespace: &str, name: &str) -> Result<Option<WatchedResource>>
    where
        K: Resource<Scope = NamespaceResourceScope> + Watchable + Clone + DeserializeOwned + Debug,
        <K as Resource>::DynamicType: Default,
    {
        let object = self
            .api::<K>(namespace)
            .get_opt(name)
            .await
            .with_context(|| format!("failed to get {} {}/{}", K::KIND, namespace, name))?;
        Ok(object.map(|o| o.to_watched()))
    }

    async fn patch_status<K>(&self, resource: &WatchedResource, patch: &Value) -> Result<()>
    where
        K: Resource<Scope = NamespaceResourceScope> + Clone + DeserializeOwned + Debug,
        <K as Resource>::DynamicType: Default,
    {
        self.api::<K>(&resource.namespace)
            .patch_status(&resource.name, &PatchParams::default(), &Patch::Merge(patch))
            .await
            .with_context(|| format!("failed to patch status of {}", resource.key()))?;
        Ok(())
    }

    async fn patch_metadata<K>(&self, resource: &WatchedResource, patch: &Value) -> Result<()>
    where
        K: Resource<Scope = NamespaceResourceScope> + Clone + DeserializeOwned + Debug,
        <K as Resource>::DynamicType: Default,
    {
        self.api::<K>(&resource.namespace)
            .patch(&resource.name, &PatchParams::default(), &Patch::Merge(patch))
            .await
            .with_context(|| format!("failed to patch metadata of {}", resource.key()))?;
        Ok(())
    }
}

#[async_trait]
impl ClusterClient for KubeClusterClient {
    async fn get(
        &self,
        kind: ResourceKind,
        namespace: &str,
        name: &str,
    ) -> Result<Option<WatchedResource>> {
        match kind {
            ResourceKind::Ingress => self.get_as::<Ingress>(namespace, name).await,
            ResourceKind::Service => self.get_as::<Service>(namespace, name).await,
        }
    }

    async fn set_load_balancer(
        &self,
        resource: &WatchedResource,
        ip: Option<String>,
        hostname: Option<String>,
    ) -> Result<()> {
        let patch = load_balancer_patch(ip.as_deref(), hostname.as_deref());
        match resource.kind {
            ResourceKind::Ingress => self.patch_status::<Ingress>(resource, &patch).await?,
            ResourceKind::Service => self.patch_status::<Service>(resource, &patch).await?,
        }
        log::info!(
            "Updated load balancer status of {} {} (ip: {}, hostname: {})",
            resource.kind,
            resource.key(),
            ip.as_deref().unwrap_or("-"),
            hostname.as_deref().unwrap_or("-")
        );
        Ok(())
    }

    async fn annotate_tunnel_id(&self, resource: &WatchedResource, tunnel_id: &str) -> Result<()> {
        let patch = tunnel_id_patch(tunnel_id);
        match resource.kind {
            ResourceKind::Ingress => self.patch_metadata::<Ingress>(resource, &patch).await,
            ResourceKind::Service => self.patch_metadata::<Service>(resource, &patch).await,
        }
    }
}

/// Status merge patch with a single load balancer ingress entry
pub fn load_balancer_patch(ip: Option<&str>, hostname: Option<&str>) -> Value {
    let mut entry = Map::new();
    if let Some(ip) = ip {
        entry.insert("ip".to_string(), Value::from(ip));
    }
    if let Some(hostname) = hostname {
        entry.insert("hostname".to_string(), Value::from(hostname));
    }

    json!({ "status": { "loadBalancer": { "ingress": [entry] } } })
}

/// Metadata merge patch setting the tunnel id annotation
pub fn tunnel_id_patch(tunnel_id: &str) -> Value {
    json!({ "metadata": { "annotations": { TUNNEL_ID_ANNOTATION: tunnel_id } } })
}

/// Added or modified object together with the state it replaced
#[derive(Debug, Clone, PartialEq)]
pub struct Change {
    /// State carried by the event
    pub current: WatchedResource,
    /// Last state held in the store, `None` for a first sighting
    pub previous: Option<WatchedResource>,
}

/// Change feed event, already projected into a [`WatchedResource`]
#[derive(Debug, Clone, PartialEq)]
pub enum FeedEvent {
    /// A re-list started
    Init,
    /// Object seen during a re-list
    InitApply(Change),
    /// The re-list completed
    InitDone,
    /// Object added or modified
    Apply(Change),
    /// Object deleted, carrying its final state
    Delete(WatchedResource),
}

/// Reflector store kept in step with a watch
///
/// Every event is translated before it is applied to the store, so an
/// update can be paired with the state it replaces. Objects that were in the
/// store before a re-list but are missing from it afterwards come out as
/// [`FeedEvent::Delete`] tombstones carrying their last known state.
pub struct FeedTracker<K>
where
    K: Resource + Clone + 'static,
    K::DynamicType: Default + Eq + Hash + Clone,
{
    store: Store<K>,
    writer: Writer<K>,
}

impl<K> Default for FeedTracker<K>
where
    K: Resource + Clone + 'static,
    K::DynamicType: Default + Eq + Hash + Clone,
{
    fn default() -> Self {
        let (store, writer) = reflector::store();
        Self { store, writer }
    }
}

impl<K> FeedTracker<K>
where
    K: Resource + Watchable + Clone + 'static,
    K::DynamicType: Default + Eq + Hash + Clone,
{
    /// Read handle on the tracked objects
    pub fn store(&self) -> Store<K> {
        self.store.clone()
    }

    fn change(&self, obj: &K) -> Change {
        Change {
            current: obj.to_watched(),
            previous: self
                .store
                .get(&ObjectRef::from_obj(obj))
                .map(|prev| prev.to_watched()),
        }
    }

    /// Translate one watch event and apply it to the store
    pub fn track(&mut self, event: watcher::Event<K>) -> Vec<FeedEvent> {
        let translated = match &event {
            watcher::Event::Init => vec![FeedEvent::Init],
            watcher::Event::InitApply(obj) => vec![FeedEvent::InitApply(self.change(obj))],
            watcher::Event::Apply(obj) => vec![FeedEvent::Apply(self.change(obj))],
            watcher::Event::Delete(obj) => vec![FeedEvent::Delete(obj.to_watched())],
            watcher::Event::InitDone => {
                // The store only swaps in the re-listed objects on InitDone
                let before = self.store.state();
                self.writer.apply_watcher_event(&event);
                let after: HashSet<ObjectRef<K>> = self
                    .store
                    .state()
                    .iter()
                    .map(|obj| ObjectRef::from_obj(obj.as_ref()))
                    .collect();

                let mut gone: Vec<WatchedResource> = before
                    .iter()
                    .filter(|obj| !after.contains(&ObjectRef::from_obj(obj.as_ref())))
                    .map(|obj| obj.to_watched())
                    .collect();
                gone.sort_by_key(WatchedResource::key);

                let mut events: Vec<FeedEvent> = gone.into_iter().map(FeedEvent::Delete).collect();
                events.push(FeedEvent::InitDone);
                return events;
            }
        };

        self.writer.apply_watcher_event(&event);
        translated
    }
}

/// Watch every object of `api`, retrying with backoff on watch errors
pub fn feed<K>(api: Api<K>) -> BoxStream<'static, FeedEvent>
where
    K: Resource + Watchable + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
    K::DynamicType: Default + Eq + Hash + Clone + Send + Sync,
{
    let mut tracker = FeedTracker::<K>::default();

    watcher(api, watcher::Config::default())
        .default_backoff()
        .filter_map(|event| async move {
            match event {
                Ok(event) => Some(event),
                Err(e) => {
                    log::warn!("{} watch error: {}", K::KIND, e);
                    None
                }
            }
        })
        .map(move |event| stream::iter(tracker.track(event)))
        .flatten()
        .boxed()
}
