//! One authenticated connection plus the placement resolved for a run.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info};

use cake_common::config::VsphereSpec;
use cake_common::{Error, Result};

use crate::hypervisor::{Hypervisor, ObjectKind, Placement};

/// Bound on every inventory lookup
pub const LOOKUP_TIMEOUT: Duration = Duration::from_secs(2 * 60);

/// A VM folder
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Folder {
    /// Last path segment
    pub name: String,
    /// Full inventory path, e.g. `/DC0/vm/cake/templates`
    pub inventory_path: String,
}

/// A virtual machine or template
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VirtualMachine {
    /// VM name
    pub name: String,
    /// Full inventory path
    pub inventory_path: String,
}

impl VirtualMachine {
    /// Handle for `name` inside `folder`
    pub fn in_folder(folder: &Folder, name: &str) -> Self {
        Self {
            name: name.to_string(),
            inventory_path: format!("{}/{}", folder.inventory_path, name),
        }
    }
}

/// Connection to the virtualization control plane for one provisioning run.
///
/// Holds no "current folder"; folder-scoped operations take the folder as an
/// argument, so a `&Session` can be shared across concurrent clones.
#[derive(Clone)]
pub struct Session {
    hypervisor: Arc<dyn Hypervisor>,
    placement: Placement,
    lookup_timeout: Duration,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("placement", &self.placement)
            .field("lookup_timeout", &self.lookup_timeout)
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Authenticate and resolve datacenter, network, datastore and resource
    /// pool from `spec`
    pub async fn connect(hypervisor: Arc<dyn Hypervisor>, spec: &VsphereSpec) -> Result<Self> {
        let about = bounded(LOOKUP_TIMEOUT, &spec.url, "login", hypervisor.about()).await?;
        info!(url = %spec.url, server = %about.lines().next().unwrap_or_default(), "connected to vCenter");

        let datacenter = lookup(
            hypervisor.as_ref(),
            LOOKUP_TIMEOUT,
            "/",
            ObjectKind::Datacenter,
            &spec.datacenter,
        )
        .await?;
        let network = lookup(
            hypervisor.as_ref(),
            LOOKUP_TIMEOUT,
            &datacenter,
            ObjectKind::Network,
            &spec.management_network,
        )
        .await?;
        let datastore = lookup(
            hypervisor.as_ref(),
            LOOKUP_TIMEOUT,
            &datacenter,
            ObjectKind::Datastore,
            &spec.datastore,
        )
        .await?;
        let resource_pool = lookup(
            hypervisor.as_ref(),
            LOOKUP_TIMEOUT,
            &datacenter,
            ObjectKind::ResourcePool,
            &spec.resource_pool,
        )
        .await?;

        Ok(Self::with_placement(
            hypervisor,
            Placement {
                datacenter,
                datastore,
                resource_pool,
                network,
            },
        ))
    }

    /// Session over an already resolved placement
    pub fn with_placement(hypervisor: Arc<dyn Hypervisor>, placement: Placement) -> Self {
        Self {
            hypervisor,
            placement,
            lookup_timeout: LOOKUP_TIMEOUT,
        }
    }

    /// Override the lookup bound
    pub fn with_lookup_timeout(mut self, timeout: Duration) -> Self {
        self.lookup_timeout = timeout;
        self
    }

    /// The backend
    pub fn hypervisor(&self) -> &dyn Hypervisor {
        self.hypervisor.as_ref()
    }

    /// Resolved placement
    pub fn placement(&self) -> &Placement {
        &self.placement
    }

    /// Root VM folder, e.g. `/DC0/vm`
    pub fn vm_root(&self) -> String {
        self.placement.vm_root()
    }

    /// Run `fut` under the lookup bound, naming `resource` on timeout
    pub async fn bounded<T, F>(&self, resource: &str, condition: &str, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        bounded(self.lookup_timeout, resource, condition, fut).await
    }

    /// Find a datastore in the session's datacenter
    pub async fn get_datastore(&self, name: &str) -> Result<String> {
        self.lookup(ObjectKind::Datastore, name).await
    }

    /// Find a network in the session's datacenter
    pub async fn get_network(&self, name: &str) -> Result<String> {
        self.lookup(ObjectKind::Network, name).await
    }

    /// Find a resource pool in the session's datacenter
    pub async fn get_resource_pool(&self, name: &str) -> Result<String> {
        self.lookup(ObjectKind::ResourcePool, name).await
    }

    /// Find a VM anywhere in the session's datacenter
    pub async fn get_vm(&self, name: &str) -> Result<VirtualMachine> {
        let path = self.lookup(ObjectKind::VirtualMachine, name).await?;
        Ok(VirtualMachine {
            name: name.rsplit('/').next().unwrap_or(name).to_string(),
            inventory_path: path,
        })
    }

    async fn lookup(&self, kind: ObjectKind, name: &str) -> Result<String> {
        lookup(
            self.hypervisor.as_ref(),
            self.lookup_timeout,
            &self.placement.datacenter,
            kind,
            name,
        )
        .await
    }
}

async fn bounded<T, F>(timeout: Duration, resource: &str, condition: &str, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    let start = Instant::now();
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(Error::timeout(resource, condition, start.elapsed())),
    }
}

/// Resolve `name` (or an absolute inventory path) to a single inventory path
async fn lookup(
    hypervisor: &dyn Hypervisor,
    timeout: Duration,
    root: &str,
    kind: ObjectKind,
    name: &str,
) -> Result<String> {
    let key = if name.starts_with('/') {
        name.to_string()
    } else {
        format!("{}/{}", root.trim_end_matches('/'), name)
    };

    let found = bounded(timeout, &key, "lookup", async {
        if name.starts_with('/') {
            Ok(hypervisor.exists(name).await?.then(|| name.to_string()))
        } else {
            Ok(hypervisor.find(root, kind, name).await?.into_iter().next())
        }
    })
    .await?;

    match found {
        Some(path) => {
            debug!(kind = %kind, path = %path, "resolved");
            Ok(path)
        }
        None => Err(Error::not_found(kind.as_str(), key)),
    }
}
