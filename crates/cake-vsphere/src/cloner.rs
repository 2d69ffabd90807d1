//! Template cloning.
//!
//! A clone is created powered off, has its adapters replaced and guestinfo
//! written, and only then is powered on, so the guest never boots with the
//! template's network or without its first-boot data.

use std::collections::{BTreeMap, BTreeSet};
use std::time::{Duration, Instant};

use futures::future::join_all;
use tracing::{debug, info, warn};

use cake_common::{Error, Result};

use crate::cloudinit;
use crate::hypervisor::{TaskInfo, VmChange};
use crate::session::{Folder, Session, VirtualMachine};
use crate::tracked::TrackedResources;

/// Overall deadline for one clone
pub const CLONE_DEADLINE: Duration = Duration::from_secs(10 * 60);

/// Clones started concurrently
pub const CLONE_BATCH_SIZE: usize = 3;

/// Memory given to every clone
pub const DEFAULT_MEMORY_MB: u64 = 8 * 1024;

/// Adapter type attached to clones
pub const NIC_ADAPTER: &str = "vmxnet3";

/// One VM to create from a template
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloneSpec {
    /// Source template
    pub template: VirtualMachine,
    /// Name of the new VM
    pub name: String,
    /// Script cloud-init runs on first boot
    pub boot_script: String,
    /// Public keys installed for `os_user`
    pub authorized_keys: Vec<String>,
    /// OS user created by cloud-init
    pub os_user: String,
}

/// Tunables for a cloning run
#[derive(Debug, Clone)]
pub struct CloneOptions {
    /// Per-clone deadline
    pub deadline: Duration,
    /// Clones per batch
    pub batch_size: usize,
    /// Memory given to each clone
    pub memory_mb: u64,
}

impl Default for CloneOptions {
    fn default() -> Self {
        Self {
            deadline: CLONE_DEADLINE,
            batch_size: CLONE_BATCH_SIZE,
            memory_mb: DEFAULT_MEMORY_MB,
        }
    }
}

/// Result of a batched clone.
///
/// `created` holds every VM that finished, including when `failure` is set;
/// callers must not assume all-or-nothing.
#[derive(Debug, Default)]
pub struct BatchOutcome {
    /// VMs created, by name
    pub created: BTreeMap<String, VirtualMachine>,
    /// First failure observed; later batches were not started
    pub failure: Option<Error>,
}

impl BatchOutcome {
    /// All VMs, or the failure
    pub fn into_result(self) -> Result<BTreeMap<String, VirtualMachine>> {
        match self.failure {
            Some(e) => Err(e),
            None => Ok(self.created),
        }
    }
}

/// Clone one VM into `folder` and power it on.
///
/// On deadline expiry the VM's in-flight tasks are cancelled before the
/// timeout is returned. While the copy is still running the target does not
/// exist yet and the clone task hangs off the template instead.
pub async fn clone_template(
    session: &Session,
    tracked: &TrackedResources,
    folder: &Folder,
    spec: &CloneSpec,
    options: &CloneOptions,
) -> Result<VirtualMachine> {
    let start = Instant::now();
    let vm = VirtualMachine::in_folder(folder, &spec.name);
    let earlier: BTreeSet<String> = pending_clones(session, &spec.template)
        .await
        .into_iter()
        .map(|t| t.id)
        .collect();

    match tokio::time::timeout(options.deadline, clone_steps(session, tracked, &vm, spec, options))
        .await
    {
        Ok(result) => {
            if result.is_ok() {
                info!(vm = %vm.inventory_path, elapsed_ms = start.elapsed().as_millis() as u64, "clone ready");
            }
            result
        }
        Err(_) => {
            cancel_clone(session, &vm, &spec.template, &earlier).await;
            Err(Error::timeout(
                &vm.inventory_path,
                "clone powered on",
                start.elapsed(),
            ))
        }
    }
}

async fn clone_steps(
    session: &Session,
    tracked: &TrackedResources,
    vm: &VirtualMachine,
    spec: &CloneSpec,
    options: &CloneOptions,
) -> Result<VirtualMachine> {
    let hv = session.hypervisor();
    let path = vm.inventory_path.as_str();
    let folder = path
        .rsplit_once('/')
        .map(|(parent, _)| parent)
        .unwrap_or_default();

    let extra_config = cloudinit::guestinfo(
        &spec.name,
        &spec.boot_script,
        &spec.authorized_keys,
        &spec.os_user,
    )?;

    debug!(template = %spec.template.inventory_path, vm = %path, "cloning");
    hv.clone_vm(
        &spec.template.inventory_path,
        &spec.name,
        folder,
        session.placement(),
    )
    .await?;
    tracked.add_vm(vm.clone());

    for nic in hv.list_nics(path).await? {
        debug!(vm = %path, nic = %nic, "removing inherited adapter");
        hv.remove_device(path, &nic).await?;
    }
    hv.add_nic(path, &session.placement().network, NIC_ADAPTER)
        .await?;
    hv.configure(
        path,
        &VmChange {
            memory_mb: Some(options.memory_mb),
            extra_config,
        },
    )
    .await?;

    debug!(vm = %path, "powering on");
    hv.set_power(path, true).await?;
    Ok(vm.clone())
}

/// Cancel whatever the hypervisor is still doing to `vm`; failures are logged
pub(crate) async fn cancel_tasks(session: &Session, vm: &VirtualMachine) -> bool {
    let tasks = match session.hypervisor().tasks(&vm.inventory_path).await {
        Ok(tasks) => tasks,
        Err(e) => {
            warn!(vm = %vm.inventory_path, error = %e, "could not list tasks to cancel");
            return false;
        }
    };
    let active: Vec<_> = tasks.into_iter().filter(TaskInfo::is_active).collect();
    cancel_each(session, &vm.inventory_path, &active).await;
    active.iter().any(TaskInfo::is_creation)
}

/// Cancel a clone that overran its deadline.
///
/// Tasks on the target win; with none there, the template's clone tasks that
/// were not already running when this clone started are cancelled. A sibling
/// started in the same batch can match too, which fails that sibling as well.
async fn cancel_clone(
    session: &Session,
    vm: &VirtualMachine,
    template: &VirtualMachine,
    earlier: &BTreeSet<String>,
) {
    let on_target: Vec<_> = match session.hypervisor().tasks(&vm.inventory_path).await {
        Ok(tasks) => tasks.into_iter().filter(TaskInfo::is_active).collect(),
        Err(e) => {
            debug!(vm = %vm.inventory_path, error = %e, "target not listable yet");
            Vec::new()
        }
    };
    if !on_target.is_empty() {
        cancel_each(session, &vm.inventory_path, &on_target).await;
        return;
    }

    let started: Vec<_> = pending_clones(session, template)
        .await
        .into_iter()
        .filter(|t| !earlier.contains(&t.id))
        .collect();
    if started.is_empty() {
        warn!(vm = %vm.inventory_path, template = %template.inventory_path, "no clone task left to cancel");
        return;
    }
    cancel_each(session, &template.inventory_path, &started).await;
}

async fn pending_clones(session: &Session, template: &VirtualMachine) -> Vec<TaskInfo> {
    match session.hypervisor().tasks(&template.inventory_path).await {
        Ok(tasks) => tasks
            .into_iter()
            .filter(TaskInfo::is_pending_clone)
            .collect(),
        Err(e) => {
            warn!(template = %template.inventory_path, error = %e, "could not list template tasks");
            Vec::new()
        }
    }
}

async fn cancel_each(session: &Session, owner: &str, tasks: &[TaskInfo]) {
    for task in tasks {
        match session.hypervisor().cancel_task(&task.id).await {
            Ok(()) => info!(vm = %owner, task = %task.id, "cancelled task"),
            Err(e) => warn!(vm = %owner, task = %task.id, error = %e, "failed to cancel task"),
        }
    }
}

/// Clone `specs` in batches; members of a batch run concurrently and batch
/// N+1 starts only after batch N has fully finished.
pub async fn clone_templates(
    session: &Session,
    tracked: &TrackedResources,
    folder: &Folder,
    specs: &[CloneSpec],
    options: &CloneOptions,
) -> BatchOutcome {
    let mut outcome = BatchOutcome::default();

    for (index, batch) in specs.chunks(options.batch_size.max(1)).enumerate() {
        debug!(batch = index, size = batch.len(), "starting clone batch");
        let results = join_all(
            batch
                .iter()
                .map(|spec| clone_template(session, tracked, folder, spec, options)),
        )
        .await;

        for (spec, result) in batch.iter().zip(results) {
            match result {
                Ok(vm) => {
                    outcome.created.insert(spec.name.clone(), vm);
                }
                Err(e) => {
                    warn!(vm = %spec.name, error = %e, "clone failed");
                    if outcome.failure.is_none() {
                        outcome.failure = Some(e);
                    }
                }
            }
        }
        if outcome.failure.is_some() {
            break;
        }
    }
    outcome
}
