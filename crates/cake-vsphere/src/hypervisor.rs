//! Façade over the virtualization control plane.
//!
//! Every operation the provisioning code performs against vSphere goes
//! through [`Hypervisor`]. Objects are addressed by inventory path
//! (`/DC0/vm/cake/templates/ubuntu`), never by implicit session state, so
//! concurrent callers cannot interfere through a shared "current folder".

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[cfg(test)]
use mockall::automock;

use cake_common::Result;

/// Inventory object types that can be searched for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectKind {
    /// Datacenter
    Datacenter,
    /// Datastore
    Datastore,
    /// Network or distributed port group
    Network,
    /// Resource pool
    ResourcePool,
    /// VM folder
    Folder,
    /// Virtual machine or template
    VirtualMachine,
}

impl ObjectKind {
    /// Human-readable name used in errors
    pub fn as_str(&self) -> &'static str {
        match self {
            ObjectKind::Datacenter => "datacenter",
            ObjectKind::Datastore => "datastore",
            ObjectKind::Network => "network",
            ObjectKind::ResourcePool => "resource pool",
            ObjectKind::Folder => "folder",
            ObjectKind::VirtualMachine => "virtual machine",
        }
    }
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Power state of a VM
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerState {
    /// Running
    PoweredOn,
    /// Stopped
    PoweredOff,
    /// Suspended
    Suspended,
}

/// A hypervisor task attached to a VM
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskInfo {
    /// Managed object reference, e.g. `Task:task-42`
    pub id: String,
    /// Operation identifier, e.g. `VirtualMachine.clone`
    pub description_id: String,
    /// `queued`, `running`, `success` or `error`
    pub state: String,
}

/// Operation id of a clone; the task is attached to the source template
pub const CLONE_TASK: &str = "VirtualMachine.clone";

/// Operations whose cancellation makes the target VM disappear on its own
const CREATION_TASKS: &[&str] = &[
    CLONE_TASK,
    "Folder.createVm",
    "ResourcePool.ImportVAppLRO",
    "VirtualApp.ImportVAppLRO",
];

impl TaskInfo {
    /// Task has not finished yet
    pub fn is_active(&self) -> bool {
        matches!(self.state.as_str(), "queued" | "running")
    }

    /// Task is a clone still in flight
    pub fn is_pending_clone(&self) -> bool {
        self.is_active() && self.description_id == CLONE_TASK
    }

    /// Task creates the VM it is attached to
    pub fn is_creation(&self) -> bool {
        CREATION_TASKS.contains(&self.description_id.as_str())
    }
}

/// Network mapping entry of an appliance import spec
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct NetworkMapping {
    /// Network name declared in the appliance descriptor
    pub name: String,
    /// Inventory network it is bound to
    pub network: String,
}

/// Options for importing an appliance, derived from its descriptor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "PascalCase")]
pub struct ImportSpec {
    /// `thin`, `thick`, ...
    #[serde(default)]
    pub disk_provisioning: String,
    /// `dhcpPolicy`, `fixedPolicy`, ...
    #[serde(rename = "IPAllocationPolicy", default)]
    pub ip_allocation_policy: String,
    /// `IPv4` or `IPv6`
    #[serde(rename = "IPProtocol", default)]
    pub ip_protocol: String,
    /// Descriptor networks and what they map to
    #[serde(default)]
    pub network_mapping: Vec<NetworkMapping>,
    /// Name of the resulting VM
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Power on after import
    #[serde(default)]
    pub power_on: bool,
    /// Mark as template after import
    #[serde(default)]
    pub mark_as_template: bool,
    /// Remaining descriptor options passed through untouched
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// Datacenter-scoped placement resolved once per session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Placement {
    /// Datacenter inventory path, e.g. `/DC0`
    pub datacenter: String,
    /// Datastore inventory path
    pub datastore: String,
    /// Resource pool inventory path
    pub resource_pool: String,
    /// Network inventory path
    pub network: String,
}

impl Placement {
    /// Root VM folder of the datacenter, e.g. `/DC0/vm`
    pub fn vm_root(&self) -> String {
        format!("{}/vm", self.datacenter.trim_end_matches('/'))
    }
}

/// Virtual hardware and guestinfo changes applied to a powered-off VM
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct VmChange {
    /// Memory size
    pub memory_mb: Option<u64>,
    /// `extraConfig` key/value pairs
    pub extra_config: BTreeMap<String, String>,
}

/// Virtualization control-plane operations
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Hypervisor: Send + Sync {
    /// Check the endpoint is reachable and the credentials are accepted
    async fn about(&self) -> Result<String>;

    /// Inventory paths of objects of `kind` named `name` under `root`
    async fn find(&self, root: &str, kind: ObjectKind, name: &str) -> Result<Vec<String>>;

    /// Whether an object exists at `path`
    async fn exists(&self, path: &str) -> Result<bool>;

    /// Create the folder at `path`; the parent must exist
    async fn create_folder(&self, path: &str) -> Result<()>;

    /// Destroy the object at `path`
    async fn destroy(&self, path: &str) -> Result<()>;

    /// Import options derived from the appliance descriptor at `source`
    async fn import_spec(&self, source: &str) -> Result<ImportSpec>;

    /// Import the appliance at `source` into `folder`
    async fn import_appliance(
        &self,
        source: &str,
        spec: &ImportSpec,
        placement: &Placement,
        folder: &str,
    ) -> Result<()>;

    /// Device names of a VM's network adapters (`ethernet-0`, ...)
    async fn list_nics(&self, vm: &str) -> Result<Vec<String>>;

    /// Remove one device from a VM
    async fn remove_device(&self, vm: &str, device: &str) -> Result<()>;

    /// Convert a VM into a template
    async fn mark_as_template(&self, vm: &str) -> Result<()>;

    /// Clone `template` into `folder/name`, leaving the clone powered off
    async fn clone_vm(
        &self,
        template: &str,
        name: &str,
        folder: &str,
        placement: &Placement,
    ) -> Result<()>;

    /// Reconfigure a VM
    async fn configure(&self, vm: &str, change: &VmChange) -> Result<()>;

    /// Attach a new network adapter bound to `network`
    async fn add_nic(&self, vm: &str, network: &str, adapter: &str) -> Result<()>;

    /// Power a VM on or off
    async fn set_power(&self, vm: &str, on: bool) -> Result<()>;

    /// Current power state
    async fn power_state(&self, vm: &str) -> Result<PowerState>;

    /// IPv4 address the guest reports on `nic`, if any yet
    async fn guest_ipv4(&self, vm: &str, nic: &str) -> Result<Option<String>>;

    /// Recent tasks attached to a VM
    async fn tasks(&self, vm: &str) -> Result<Vec<TaskInfo>>;

    /// Cancel one task
    async fn cancel_task(&self, task: &str) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn creation_tasks_are_recognised() {
        let task = |desc: &str, state: &str| TaskInfo {
            id: "Task:task-1".into(),
            description_id: desc.into(),
            state: state.into(),
        };
        assert!(task("VirtualMachine.clone", "running").is_creation());
        assert!(task("VirtualMachine.clone", "running").is_active());
        assert!(!task("VirtualMachine.powerOn", "running").is_creation());
        assert!(!task("VirtualMachine.clone", "success").is_active());
        assert!(task("VirtualMachine.clone", "queued").is_pending_clone());
        assert!(!task("VirtualMachine.clone", "error").is_pending_clone());
        assert!(!task("ResourcePool.ImportVAppLRO", "running").is_pending_clone());
    }

    #[test]
    fn import_spec_keeps_unknown_descriptor_options() {
        let json = r#"{
            "DiskProvisioning": "flat",
            "IPAllocationPolicy": "dhcpPolicy",
            "IPProtocol": "IPv4",
            "PropertyMapping": null,
            "NetworkMapping": [{"Name": "nic0", "Network": ""}],
            "PowerOn": false,
            "InjectOvfEnv": false,
            "WaitForIP": false,
            "Name": null
        }"#;
        let spec: ImportSpec = serde_json::from_str(json).unwrap();
        assert_eq!(spec.network_mapping[0].name, "nic0");
        assert!(spec.extra.contains_key("InjectOvfEnv"));

        let back = serde_json::to_value(&spec).unwrap();
        assert_eq!(back["WaitForIP"], false);
        assert_eq!(back["IPAllocationPolicy"], "dhcpPolicy");
    }

    #[test]
    fn vm_root_is_under_datacenter() {
        let placement = Placement {
            datacenter: "/DC0".into(),
            datastore: "/DC0/datastore/ds1".into(),
            resource_pool: "/DC0/host/cluster/Resources".into(),
            network: "/DC0/network/VM Network".into(),
        };
        assert_eq!(placement.vm_root(), "/DC0/vm");
    }
}
