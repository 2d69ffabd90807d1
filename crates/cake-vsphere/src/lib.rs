//! vSphere provisioning for cake.
//!
//! A [`Session`] wraps a [`Hypervisor`] backend (the `govc` CLI in
//! production) together with the placement resolved at login. Folder,
//! import, clone and delete operations take the target folder explicitly, so
//! one session can drive concurrent clones.

#![cfg_attr(not(test), deny(missing_docs))]

pub mod cloner;
pub mod cloudinit;
pub mod delete;
pub mod folders;
pub mod govc;
pub mod hypervisor;
pub mod importer;
pub mod ip;
pub mod keys;
pub mod provider;
pub mod session;
pub mod tracked;

#[cfg(test)]
mod testing;

pub use cloner::{clone_template, clone_templates, BatchOutcome, CloneOptions, CloneSpec};
pub use delete::delete_vm;
pub use folders::{create_folders, delete_folder, ensure_folder, get_folder};
pub use govc::GovcHypervisor;
pub use hypervisor::{Hypervisor, Placement};
pub use importer::{import_templates, ImportOutcome};
pub use ip::get_vm_ip;
pub use provider::{run_bootstrapper, Bootstrapper, ProviderOptions, VsphereProvider};
pub use session::{Folder, Session, VirtualMachine};
pub use tracked::TrackedResources;
