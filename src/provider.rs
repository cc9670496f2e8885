//! Collaborators the stack is provisioned through.
//!
//! The orchestrator only knows these contracts. Backends own their own
//! retries, diffing and persistence across runs.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::LookupError;

/// Attributes observed on a provisioned resource.
pub type Attributes = serde_json::Map<String, Value>;

/// Desired state of a cloud resource, e.g. `aws:ec2/securityGroup`.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ResourceSpec {
    pub kind: String,
    pub name: String,
    #[serde(default)]
    pub properties: Value,
}

impl ResourceSpec {
    pub fn new(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            name: name.into(),
            properties: Value::Object(Default::default()),
        }
    }

    pub fn with_properties(mut self, properties: Value) -> Self {
        self.properties = properties;
        self
    }
}

/// Opaque reference to a resource created by a [`ProvisioningBackend`].
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResourceHandle {
    pub kind: String,
    pub name: String,
    pub id: String,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LoadBalancer {
    pub name: String,
    pub arn: String,
    pub dns_name: String,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Listener {
    pub arn: String,
    pub port: u16,
}

/// An untyped Kubernetes object.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterObject {
    pub api_version: String,
    pub kind: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    /// Everything besides the metadata, e.g. `spec` or `data`.
    #[serde(default)]
    pub body: Value,
}

impl ClusterObject {
    pub fn new(api_version: impl Into<String>, kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            api_version: api_version.into(),
            kind: kind.into(),
            name: name.into(),
            namespace: None,
            body: Value::Null,
        }
    }

    pub fn in_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    pub fn with_body(mut self, body: Value) -> Self {
        self.body = body;
        self
    }
}

/// Observed status of a [`ClusterObject`].
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct ObjectStatus(pub Value);

impl ObjectStatus {
    /// The hostname the platform assigned to an ingress or service, found at
    /// `status.loadBalancer.ingress[0].hostname`.
    pub fn load_balancer_hostname(&self) -> Option<&str> {
        self.0
            .pointer("/status/loadBalancer/ingress/0/hostname")
            .and_then(Value::as_str)
            .filter(|hostname| !hostname.is_empty())
    }
}

/// The IaC engine that creates cloud resources.
#[async_trait]
pub trait ProvisioningBackend: Send + Sync {
    async fn create(&self, spec: &ResourceSpec) -> anyhow::Result<ResourceHandle>;

    async fn observe(&self, handle: &ResourceHandle) -> anyhow::Result<Attributes>;
}

/// Read-only queries against the cloud provider.
#[async_trait]
pub trait PlatformQuery: Send + Sync {
    async fn find_load_balancer(&self, name: &str) -> Result<LoadBalancer, LookupError>;

    async fn find_listener(&self, load_balancer_arn: &str, port: u16) -> Result<Listener, LookupError>;
}

/// Access to the Kubernetes API of the provisioned cluster.
#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// Apply `object` and return its status right after the write.
    async fn apply(&self, object: &ClusterObject) -> anyhow::Result<ObjectStatus>;

    async fn observe(&self, object: &ClusterObject) -> anyhow::Result<ObjectStatus>;
}
