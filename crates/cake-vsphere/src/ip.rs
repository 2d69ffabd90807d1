//! Guest address discovery.

use std::time::Duration;

use cake_common::poll::wait_with_timeout;
use cake_common::Result;

use crate::session::{Session, VirtualMachine};

/// Adapter whose address identifies a VM
pub const PRIMARY_NIC: &str = "ethernet-0";

/// How long a guest may take to report an address
pub const IP_TIMEOUT: Duration = Duration::from_secs(10 * 60);

const IP_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// First IPv4 address the guest reports on its primary adapter
pub async fn get_vm_ip(session: &Session, vm: &VirtualMachine) -> Result<String> {
    get_vm_ip_within(session, vm, IP_TIMEOUT, IP_POLL_INTERVAL).await
}

/// [`get_vm_ip`] with an explicit bound
pub async fn get_vm_ip_within(
    session: &Session,
    vm: &VirtualMachine,
    timeout: Duration,
    interval: Duration,
) -> Result<String> {
    let address = wait_with_timeout(
        timeout,
        interval,
        &vm.inventory_path,
        &format!("ipv4 on {PRIMARY_NIC}"),
        || session.hypervisor().guest_ipv4(&vm.inventory_path, PRIMARY_NIC),
    )
    .await?;
    tracing::info!(vm = %vm.name, address = %address, "guest reported address");
    Ok(address)
}
