//! Objects created or reused by a run, kept for cleanup.

use dashmap::DashMap;

use crate::session::{Folder, VirtualMachine};

/// Append-only record of folders and VMs a run created or reused.
///
/// Creating calls insert before they return, so a run that fails halfway
/// still knows every handle it would need to clean up.
#[derive(Debug, Default)]
pub struct TrackedResources {
    folders: DashMap<String, Folder>,
    vms: DashMap<String, VirtualMachine>,
}

impl TrackedResources {
    /// Empty record
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a folder under its name
    pub fn add_folder(&self, folder: Folder) {
        self.folders.insert(folder.name.clone(), folder);
    }

    /// Record a VM under its name
    pub fn add_vm(&self, vm: VirtualMachine) {
        self.vms.insert(vm.name.clone(), vm);
    }

    /// Folder recorded as `name`
    pub fn folder(&self, name: &str) -> Option<Folder> {
        self.folders.get(name).map(|f| f.value().clone())
    }

    /// VM recorded as `name`
    pub fn vm(&self, name: &str) -> Option<VirtualMachine> {
        self.vms.get(name).map(|v| v.value().clone())
    }

    /// All folders, sorted by inventory path
    pub fn folders(&self) -> Vec<Folder> {
        let mut folders: Vec<_> = self.folders.iter().map(|f| f.value().clone()).collect();
        folders.sort_by(|a, b| a.inventory_path.cmp(&b.inventory_path));
        folders
    }

    /// All VMs, sorted by name
    pub fn vms(&self) -> Vec<VirtualMachine> {
        let mut vms: Vec<_> = self.vms.iter().map(|v| v.value().clone()).collect();
        vms.sort_by(|a, b| a.name.cmp(&b.name));
        vms
    }
}
