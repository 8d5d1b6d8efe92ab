// Watched resource model

//! Kind-independent view of the resources the controller manages
//!
//! Ingresses and `LoadBalancer` Services are projected into a
//! [`WatchedResource`] as soon as they come off the watch, so the queue,
//! reconciler and cluster client never deal with the Kubernetes types.

use k8s_openapi::api::core::v1::Service;
use k8s_openapi::api::networking::v1::Ingress;
use kube::ResourceExt;
use std::collections::BTreeMap;
use std::fmt;

use crate::types::TunnelRequest;

/// Annotation opting a resource into tunnel management
pub const ENABLED_ANNOTATION: &str = "tunnel-lb.io/enabled";

/// Annotation holding the id of the provisioned tunnel
pub const TUNNEL_ID_ANNOTATION: &str = "tunnel-lb.io/tunnel-id";

/// Service type that qualifies a Service for tunnel management
pub const LOAD_BALANCER_TYPE: &str = "LoadBalancer";

/// Kind of watched resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    /// `networking.k8s.io/v1` Ingress
    Ingress,
    /// `v1` Service of type `LoadBalancer`
    Service,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceKind::Ingress => write!(f, "ingress"),
            ResourceKind::Service => write!(f, "service"),
        }
    }
}

/// Projection of an Ingress or Service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchedResource {
    /// Ingress or Service
    pub kind: ResourceKind,
    /// Object namespace
    pub namespace: String,
    /// Object name
    pub name: String,
    /// All object annotations
    pub annotations: BTreeMap<String, String>,
    /// Declared ports in declaration order
    pub ports: Vec<i32>,
    /// First rule host for Ingresses
    pub hostname: Option<String>,
    /// `spec.type` for Services
    pub service_type: Option<String>,
}

impl WatchedResource {
    /// Queue key, `namespace/name`
    pub fn key(&self) -> String {
        object_key(&self.namespace, &self.name)
    }

    /// Enablement annotation present (any value)
    pub fn is_enabled(&self) -> bool {
        self.annotations.contains_key(ENABLED_ANNOTATION)
    }

    /// Enabled and, for Services, of type `LoadBalancer`
    pub fn is_managed(&self) -> bool {
        if !self.is_enabled() {
            return false;
        }
        match self.kind {
            ResourceKind::Ingress => true,
            ResourceKind::Service => self.service_type.as_deref() == Some(LOAD_BALANCER_TYPE),
        }
    }

    /// Previously provisioned tunnel id, empty values count as absent
    pub fn tunnel_id(&self) -> Option<&str> {
        self.annotations
            .get(TUNNEL_ID_ANNOTATION)
            .map(String::as_str)
            .filter(|id| !id.is_empty())
    }

    /// Request sent to the provisioning server for this resource
    pub fn tunnel_request(&self) -> TunnelRequest {
        TunnelRequest {
            ingress_name: self.name.clone(),
            ingress_namespace: self.namespace.clone(),
            hostname: self.hostname.clone().unwrap_or_default(),
            ports: self.ports.clone(),
            annotations: self.annotations.clone(),
        }
    }

    /// True when `other` is this resource with only the tunnel-id annotation
    /// changed (added, replaced or removed)
    pub fn differs_only_in_tunnel_id(&self, other: &WatchedResource) -> bool {
        if self == other || self.tunnel_id() == other.tunnel_id() {
            return false;
        }

        let without_id = |r: &WatchedResource| {
            let mut annotations = r.annotations.clone();
            annotations.remove(TUNNEL_ID_ANNOTATION);
            annotations
        };

        self.kind == other.kind
            && self.namespace == other.namespace
            && self.name == other.name
            && self.ports == other.ports
            && self.hostname == other.hostname
            && self.service_type == other.service_type
            && without_id(self) == without_id(other)
    }
}

/// Build a `namespace/name` key, or `name` for cluster-scoped objects
pub fn object_key(namespace: &str, name: &str) -> String {
    if namespace.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", namespace, name)
    }
}

/// Split a queue key into (namespace, name)
pub fn split_key(key: &str) -> anyhow::Result<(String, String)> {
    let parts: Vec<&str> = key.split('/').collect();
    match parts.as_slice() {
        [name] if !name.is_empty() => Ok((String::new(), name.to_string())),
        [namespace, name] if !name.is_empty() => Ok((namespace.to_string(), name.to_string())),
        _ => anyhow::bail!("unexpected key format: {:?}", key),
    }
}

/// Kubernetes objects that can be projected into a [`WatchedResource`]
pub trait Watchable {
    /// Kind the projection reports
    const KIND: ResourceKind;

    /// Project the object
    fn to_watched(&self) -> WatchedResource;
}

impl Watchable for Ingress {
    const KIND: ResourceKind = ResourceKind::Ingress;

    fn to_watched(&self) -> WatchedResource {
        let rules = self
            .spec
            .as_ref()
            .and_then(|s| s.rules.as_ref())
            .map(Vec::as_slice)
            .unwrap_or_default();

        let ports = rules
            .iter()
            .filter_map(|rule| rule.http.as_ref())
            .flat_map(|http| http.paths.iter())
            .filter_map(|path| path.backend.service.as_ref())
            .filter_map(|svc| svc.port.as_ref().and_then(|p| p.number))
            .filter(|port| *port > 0)
            .collect();

        let hostname = rules.first().and_then(|rule| rule.host.clone());

        WatchedResource {
            kind: ResourceKind::Ingress,
            namespace: self.namespace().unwrap_or_default(),
            name: self.name_any(),
            annotations: self.annotations().clone(),
            ports,
            hostname,
            service_type: None,
        }
    }
}

impl Watchable for Service {
    const KIND: ResourceKind = ResourceKind::Service;

    fn to_watched(&self) -> WatchedResource {
        let spec = self.spec.as_ref();

        let ports = spec
            .and_then(|s| s.ports.as_ref())
            .map(|ports| ports.iter().map(|p| p.port).collect())
            .unwrap_or_default();

        WatchedResource {
            kind: ResourceKind::Service,
            namespace: self.namespace().unwrap_or_default(),
            name: self.name_any(),
            annotations: self.annotations().clone(),
            ports,
            hostname: None,
            service_type: spec.and_then(|s| s.type_.clone()),
        }
    }
}
