//! OVA import into network-free templates.

use std::collections::{BTreeMap, BTreeSet};

use futures::future::join_all;
use tracing::{debug, info, warn};

use cake_common::{Error, Result};

use crate::hypervisor::{NetworkMapping, ObjectKind};
use crate::session::{Folder, Session, VirtualMachine};
use crate::tracked::TrackedResources;

/// Thin disks, DHCP, IPv4
const DISK_PROVISIONING: &str = "thin";
const IP_ALLOCATION_POLICY: &str = "dhcpPolicy";
const IP_PROTOCOL: &str = "IPv4";

/// Name of the template imported from `path`: its basename without `.ova`
pub fn template_name(path: &str) -> String {
    let base = path.rsplit(['/', '\\']).next().unwrap_or(path);
    base.strip_suffix(".ova").unwrap_or(base).to_string()
}

/// Results of a concurrent import.
///
/// One failed archive never hides the others' templates.
#[derive(Debug, Default)]
pub struct ImportOutcome {
    /// Templates by source path
    pub templates: BTreeMap<String, VirtualMachine>,
    /// Failures by source path
    pub failures: BTreeMap<String, Error>,
}

impl ImportOutcome {
    /// All templates, or the first failure in path order
    pub fn into_result(mut self) -> Result<BTreeMap<String, VirtualMachine>> {
        match self.failures.pop_first() {
            Some((_, e)) => Err(e),
            None => Ok(self.templates),
        }
    }
}

/// Import every distinct path concurrently into `folder`.
///
/// Distinct paths that would land on the same template name are not imported
/// at all; each is reported as a failure.
pub async fn import_templates(
    session: &Session,
    tracked: &TrackedResources,
    folder: &Folder,
    paths: &[String],
) -> ImportOutcome {
    let mut by_name: BTreeMap<String, BTreeSet<&str>> = BTreeMap::new();
    for path in paths.iter().map(String::as_str).filter(|p| !p.is_empty()) {
        by_name.entry(template_name(path)).or_default().insert(path);
    }

    let mut outcome = ImportOutcome::default();
    let mut distinct = Vec::with_capacity(by_name.len());
    for (name, sources) in by_name {
        if sources.len() == 1 {
            distinct.extend(sources);
            continue;
        }
        let listed = sources.iter().copied().collect::<Vec<_>>().join(", ");
        for path in sources {
            outcome.failures.insert(
                path.to_string(),
                Error::validation(format!("template name '{name}' is shared by {listed}")),
            );
        }
    }

    let results = join_all(distinct.iter().map(|path| async move {
        (
            path.to_string(),
            import_template(session, tracked, folder, path).await,
        )
    }))
    .await;

    for (path, result) in results {
        match result {
            Ok(template) => {
                outcome.templates.insert(path, template);
            }
            Err(e) => {
                warn!(ova = %path, error = %e, "template import failed");
                outcome.failures.insert(path, e);
            }
        }
    }
    outcome
}

/// Import one archive, or reuse a template of the same name already in `folder`
pub async fn import_template(
    session: &Session,
    tracked: &TrackedResources,
    folder: &Folder,
    path: &str,
) -> Result<VirtualMachine> {
    let hv = session.hypervisor();
    let name = template_name(path);
    let template = VirtualMachine::in_folder(folder, &name);

    let existing = session
        .bounded(
            &template.inventory_path,
            "template lookup",
            hv.find(&folder.inventory_path, ObjectKind::VirtualMachine, &name),
        )
        .await?;
    if existing.iter().any(|p| *p == template.inventory_path) {
        info!(template = %template.inventory_path, "reusing existing template");
        tracked.add_vm(template.clone());
        return Ok(template);
    }

    let mut spec = session
        .bounded(path, "read descriptor", hv.import_spec(path))
        .await?;
    spec.name = Some(name.clone());
    spec.disk_provisioning = DISK_PROVISIONING.into();
    spec.ip_allocation_policy = IP_ALLOCATION_POLICY.into();
    spec.ip_protocol = IP_PROTOCOL.into();
    spec.power_on = false;
    spec.mark_as_template = false;

    let network = session.placement().network.clone();
    if spec.network_mapping.is_empty() {
        spec.network_mapping.push(NetworkMapping {
            name: "nic0".into(),
            network,
        });
    } else {
        for mapping in &mut spec.network_mapping {
            mapping.network = network.clone();
        }
    }

    info!(ova = %path, template = %template.inventory_path, "importing template");
    hv.import_appliance(path, &spec, session.placement(), &folder.inventory_path)
        .await?;
    tracked.add_vm(template.clone());

    for nic in hv.list_nics(&template.inventory_path).await? {
        debug!(template = %template.inventory_path, nic = %nic, "removing adapter");
        hv.remove_device(&template.inventory_path, &nic).await?;
    }
    hv.mark_as_template(&template.inventory_path).await?;
    info!(template = %template.inventory_path, "template ready");
    Ok(template)
}
