//! Idempotent VM teardown.

use std::time::Duration;

use tracing::{debug, info};

use cake_common::poll::poll_until;
use cake_common::Result;

use crate::cloner::cancel_tasks;
use crate::hypervisor::PowerState;
use crate::session::{Session, VirtualMachine};

const DISAPPEAR_ATTEMPTS: u32 = 10;
const DISAPPEAR_INTERVAL: Duration = Duration::from_secs(2);

/// Delete `vm`; a VM that is already gone is not an error.
///
/// A VM still being created is left to the hypervisor to remove once its
/// creation task is cancelled; anything else is powered off and destroyed.
pub async fn delete_vm(session: &Session, vm: &VirtualMachine) -> Result<()> {
    delete_vm_with(session, vm, DISAPPEAR_ATTEMPTS, DISAPPEAR_INTERVAL).await
}

/// [`delete_vm`] with an explicit bound on waiting for a cancelled creation
pub async fn delete_vm_with(
    session: &Session,
    vm: &VirtualMachine,
    attempts: u32,
    interval: Duration,
) -> Result<()> {
    let hv = session.hypervisor();
    let path = vm.inventory_path.as_str();

    if !exists(session, path).await? {
        debug!(vm = %path, "vm already gone");
        return Ok(());
    }

    if cancel_tasks(session, vm).await {
        info!(vm = %path, "creation cancelled, waiting for vm to disappear");
        let gone = poll_until(
            interval * attempts,
            interval,
            path,
            "vm removed",
            || async { hv.exists(path).await.map(|present| !present) },
        )
        .await;
        if gone.is_ok() {
            return Ok(());
        }
        debug!(vm = %path, "vm outlived its cancelled creation, destroying");
    }

    if !exists(session, path).await? {
        return Ok(());
    }
    let state = session
        .bounded(path, "power state", hv.power_state(path))
        .await?;
    if state != PowerState::PoweredOff {
        session
            .bounded(path, "power off", hv.set_power(path, false))
            .await?;
    }
    session.bounded(path, "destroy", hv.destroy(path)).await?;
    info!(vm = %path, "deleted vm");
    Ok(())
}

async fn exists(session: &Session, path: &str) -> Result<bool> {
    session
        .bounded(path, "vm lookup", session.hypervisor().exists(path))
        .await
}
