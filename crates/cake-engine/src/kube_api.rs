//! Kubernetes access for the engines
//!
//! Every call names the kubeconfig it runs against, since a run talks to the
//! bootstrap cluster and the permanent cluster interchangeably.

use std::path::Path;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Namespace, Secret};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, ApiResource, DynamicObject, ListParams, PostParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use cake_common::{Error, Result};

/// A kind of object to list
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceRef {
    /// `group/version`, or `v1` for the core group
    pub api_version: String,
    /// Kind, e.g. `Machine`
    pub kind: String,
    /// Namespace to list in; `None` for cluster-scoped kinds
    pub namespace: Option<String>,
}

impl ResourceRef {
    /// A namespaced kind
    pub fn namespaced(
        api_version: impl Into<String>,
        kind: impl Into<String>,
        namespace: impl Into<String>,
    ) -> Self {
        Self {
            api_version: api_version.into(),
            kind: kind.into(),
            namespace: Some(namespace.into()),
        }
    }

    /// A cluster-scoped kind
    pub fn cluster(api_version: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            api_version: api_version.into(),
            kind: kind.into(),
            namespace: None,
        }
    }

    /// Human readable name used in events and timeout errors
    pub fn display(&self) -> String {
        match &self.namespace {
            Some(ns) => format!("{}/{}", ns, self.kind),
            None => self.kind.clone(),
        }
    }

    fn api_resource(&self) -> ApiResource {
        let (group, version) = match self.api_version.split_once('/') {
            Some((group, version)) => (group.to_string(), version.to_string()),
            None => (String::new(), self.api_version.clone()),
        };
        ApiResource {
            group,
            version,
            kind: self.kind.clone(),
            api_version: self.api_version.clone(),
            plural: format!("{}s", self.kind.to_lowercase()),
        }
    }
}

/// Cluster API operations the engines need beyond `kubectl apply`
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// List objects as `{"items": [...]}`
    async fn list(&self, kubeconfig: &Path, resource: &ResourceRef) -> Result<serde_json::Value>;

    /// Read one key of a Secret's data
    async fn secret_data(
        &self,
        kubeconfig: &Path,
        namespace: &str,
        name: &str,
        key: &str,
    ) -> Result<Vec<u8>>;

    /// Create a namespace; an existing one surfaces as a benign duplicate
    async fn create_namespace(&self, kubeconfig: &Path, name: &str) -> Result<()>;
}

/// [`ClusterApi`] backed by kube-rs
#[derive(Debug, Clone, Copy, Default)]
pub struct KubeClusterApi;

impl KubeClusterApi {
    async fn client(kubeconfig: &Path) -> Result<Client> {
        let display = kubeconfig.display().to_string();
        let raw = Kubeconfig::read_from(kubeconfig)
            .map_err(|e| Error::config(&display, format!("failed to read kubeconfig: {e}")))?;
        let config = Config::from_custom_kubeconfig(raw, &KubeConfigOptions::default())
            .await
            .map_err(|e| Error::config(&display, e.to_string()))?;
        Ok(Client::try_from(config)?)
    }
}

#[async_trait]
impl ClusterApi for KubeClusterApi {
    async fn list(&self, kubeconfig: &Path, resource: &ResourceRef) -> Result<serde_json::Value> {
        let client = Self::client(kubeconfig).await?;
        let ar = resource.api_resource();
        let api: Api<DynamicObject> = match &resource.namespace {
            Some(ns) => Api::namespaced_with(client, ns, &ar),
            None => Api::all_with(client, &ar),
        };
        let list = api.list(&ListParams::default()).await?;
        debug!(resource = %resource.display(), count = list.items.len(), "listed objects");
        Ok(serde_json::json!({ "items": list.items }))
    }

    async fn secret_data(
        &self,
        kubeconfig: &Path,
        namespace: &str,
        name: &str,
        key: &str,
    ) -> Result<Vec<u8>> {
        let client = Self::client(kubeconfig).await?;
        let secrets: Api<Secret> = Api::namespaced(client, namespace);
        let secret = secrets.get(name).await?;
        secret
            .data
            .and_then(|mut data| data.remove(key))
            .map(|bytes| bytes.0)
            .ok_or_else(|| Error::not_found("secret key", format!("{namespace}/{name}[{key}]")))
    }

    async fn create_namespace(&self, kubeconfig: &Path, name: &str) -> Result<()> {
        let client = Self::client(kubeconfig).await?;
        let namespaces: Api<Namespace> = Api::all(client);
        let ns = Namespace {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        namespaces.create(&PostParams::default(), &ns).await?;
        debug!(namespace = %name, "created namespace");
        Ok(())
    }
}
