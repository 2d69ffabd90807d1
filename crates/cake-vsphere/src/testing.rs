//! In-memory hypervisor for tests that exercise whole flows.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use cake_common::{Error, Result};

use crate::hypervisor::{
    Hypervisor, ImportSpec, NetworkMapping, ObjectKind, Placement, PowerState, TaskInfo, VmChange,
    CLONE_TASK,
};

#[derive(Debug, Default)]
pub(crate) struct FakeState {
    pub objects: BTreeMap<String, ObjectKind>,
    pub templates: BTreeSet<String>,
    pub nics: BTreeMap<String, Vec<String>>,
    pub power: BTreeMap<String, PowerState>,
    pub config: BTreeMap<String, VmChange>,
    pub ips: BTreeMap<String, String>,
    pub tasks: BTreeMap<String, Vec<TaskInfo>>,
    pub cancelled: Vec<String>,
    pub imports: Vec<(String, ImportSpec, String)>,
    pub folders_created: usize,
    pub clone_order: Vec<String>,
    pub fail_clone: BTreeSet<String>,
    pub slow_clone: Option<Duration>,
    pub fail_import: BTreeSet<String>,
    pub descriptor_networks: Vec<String>,
}

/// Hypervisor holding its inventory in memory.
#[derive(Debug, Default)]
pub(crate) struct FakeHypervisor {
    pub state: Mutex<FakeState>,
}

impl FakeHypervisor {
    /// Datacenter `/DC0` with its root VM folder
    pub fn new() -> Self {
        let fake = Self::default();
        {
            let mut state = fake.state.lock();
            state.objects.insert("/DC0".into(), ObjectKind::Datacenter);
            state.objects.insert("/DC0/vm".into(), ObjectKind::Folder);
            state.descriptor_networks = vec!["nic0".into()];
        }
        fake
    }

    pub fn placement() -> Placement {
        Placement {
            datacenter: "/DC0".into(),
            datastore: "/DC0/datastore/LocalDS_0".into(),
            resource_pool: "/DC0/host/DC0_C0/Resources".into(),
            network: "/DC0/network/VM Network".into(),
        }
    }

    pub fn add_vm(&self, path: &str) {
        self.state
            .lock()
            .objects
            .insert(path.to_string(), ObjectKind::VirtualMachine);
    }
}

fn parent(path: &str) -> &str {
    path.rsplit_once('/').map(|(p, _)| p).unwrap_or("")
}

fn missing(path: &str) -> Error {
    Error::external_tool("govc", "exit status: 1", format!("object '{path}' not found"))
}

#[async_trait]
impl Hypervisor for FakeHypervisor {
    async fn about(&self) -> Result<String> {
        Ok("fake vCenter".into())
    }

    async fn find(&self, root: &str, kind: ObjectKind, name: &str) -> Result<Vec<String>> {
        let state = self.state.lock();
        Ok(state
            .objects
            .iter()
            .filter(|(path, k)| {
                **k == kind && path.starts_with(root) && path.rsplit('/').next() == Some(name)
            })
            .map(|(path, _)| path.clone())
            .collect())
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        Ok(self.state.lock().objects.contains_key(path))
    }

    async fn create_folder(&self, path: &str) -> Result<()> {
        let mut state = self.state.lock();
        if !state.objects.contains_key(parent(path)) {
            return Err(missing(parent(path)));
        }
        if state.objects.contains_key(path) {
            return Err(Error::external_tool(
                "govc",
                "exit status: 1",
                format!("'{path}' already exists"),
            ));
        }
        state.objects.insert(path.to_string(), ObjectKind::Folder);
        state.folders_created += 1;
        Ok(())
    }

    async fn destroy(&self, path: &str) -> Result<()> {
        let mut state = self.state.lock();
        if state.objects.remove(path).is_none() {
            return Err(missing(path));
        }
        state.power.remove(path);
        Ok(())
    }

    async fn import_spec(&self, source: &str) -> Result<ImportSpec> {
        let state = self.state.lock();
        if state.fail_import.contains(source) {
            return Err(Error::serialization(format!("malformed descriptor in {source}")));
        }
        Ok(ImportSpec {
            disk_provisioning: "flat".into(),
            network_mapping: state
                .descriptor_networks
                .iter()
                .map(|n| NetworkMapping {
                    name: n.clone(),
                    network: String::new(),
                })
                .collect(),
            ..ImportSpec::default()
        })
    }

    async fn import_appliance(
        &self,
        source: &str,
        spec: &ImportSpec,
        _placement: &Placement,
        folder: &str,
    ) -> Result<()> {
        let mut state = self.state.lock();
        let name = spec.name.clone().unwrap_or_default();
        let path = format!("{folder}/{name}");
        state.objects.insert(path.clone(), ObjectKind::VirtualMachine);
        state.nics.insert(path.clone(), vec!["ethernet-0".into()]);
        state
            .imports
            .push((source.to_string(), spec.clone(), folder.to_string()));
        Ok(())
    }

    async fn list_nics(&self, vm: &str) -> Result<Vec<String>> {
        Ok(self.state.lock().nics.get(vm).cloned().unwrap_or_default())
    }

    async fn remove_device(&self, vm: &str, device: &str) -> Result<()> {
        if let Some(nics) = self.state.lock().nics.get_mut(vm) {
            nics.retain(|n| n != device);
        }
        Ok(())
    }

    async fn mark_as_template(&self, vm: &str) -> Result<()> {
        self.state.lock().templates.insert(vm.to_string());
        Ok(())
    }

    async fn clone_vm(
        &self,
        template: &str,
        name: &str,
        folder: &str,
        _placement: &Placement,
    ) -> Result<()> {
        let task_id = format!("Task:clone-{name}");
        let slow = {
            let mut state = self.state.lock();
            state.clone_order.push(name.to_string());
            if state.fail_clone.contains(name) {
                return Err(Error::external_tool(
                    "govc",
                    "exit status: 1",
                    format!("clone of {name} failed: insufficient resources"),
                ));
            }
            if !state.templates.contains(template) {
                return Err(missing(template));
            }
            state.tasks.entry(template.to_string()).or_default().push(TaskInfo {
                id: task_id.clone(),
                description_id: CLONE_TASK.into(),
                state: "running".into(),
            });
            state.slow_clone
        };
        // The copy lands only once the task completes; a dropped call leaves it running
        if let Some(delay) = slow {
            tokio::time::sleep(delay).await;
        }
        let mut state = self.state.lock();
        if let Some(task) = state
            .tasks
            .get_mut(template)
            .and_then(|tasks| tasks.iter_mut().find(|t| t.id == task_id))
        {
            task.state = "success".into();
        }
        let path = format!("{folder}/{name}");
        state.objects.insert(path.clone(), ObjectKind::VirtualMachine);
        state.power.insert(path.clone(), PowerState::PoweredOff);
        state.nics.insert(path, Vec::new());
        Ok(())
    }

    async fn configure(&self, vm: &str, change: &VmChange) -> Result<()> {
        let mut state = self.state.lock();
        if state.power.get(vm) == Some(&PowerState::PoweredOn) {
            return Err(Error::internal("fake: reconfigure while powered on"));
        }
        state.config.insert(vm.to_string(), change.clone());
        Ok(())
    }

    async fn add_nic(&self, vm: &str, _network: &str, adapter: &str) -> Result<()> {
        let mut state = self.state.lock();
        let nics = state.nics.entry(vm.to_string()).or_default();
        let name = format!("ethernet-{}", nics.len());
        nics.push(name);
        assert_eq!(adapter, "vmxnet3");
        Ok(())
    }

    async fn set_power(&self, vm: &str, on: bool) -> Result<()> {
        let mut state = self.state.lock();
        if !state.objects.contains_key(vm) {
            return Err(missing(vm));
        }
        state.power.insert(
            vm.to_string(),
            if on {
                PowerState::PoweredOn
            } else {
                PowerState::PoweredOff
            },
        );
        if let Some(tasks) = state.tasks.get_mut(vm) {
            for task in tasks.iter_mut() {
                task.state = "success".into();
            }
        }
        Ok(())
    }

    async fn power_state(&self, vm: &str) -> Result<PowerState> {
        self.state
            .lock()
            .power
            .get(vm)
            .copied()
            .ok_or_else(|| missing(vm))
    }

    async fn guest_ipv4(&self, vm: &str, _nic: &str) -> Result<Option<String>> {
        Ok(self.state.lock().ips.get(vm).cloned())
    }

    async fn tasks(&self, vm: &str) -> Result<Vec<TaskInfo>> {
        let state = self.state.lock();
        if !state.objects.contains_key(vm) {
            return Err(missing(vm));
        }
        Ok(state.tasks.get(vm).cloned().unwrap_or_default())
    }

    async fn cancel_task(&self, task: &str) -> Result<()> {
        self.state.lock().cancelled.push(task.to_string());
        Ok(())
    }
}
