//! [`Hypervisor`] backed by the `govc` CLI.
//!
//! Credentials travel in `GOVC_*` environment variables so they never show
//! up in argument lists or logs.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use cake_common::command::{CommandOutput, CommandRunner, Invocation};
use cake_common::config::VsphereSpec;
use cake_common::{Error, Result};

use crate::hypervisor::{
    Hypervisor, ImportSpec, ObjectKind, Placement, PowerState, TaskInfo, VmChange,
};

/// Program name
pub const GOVC: &str = "govc";

/// Deadline for a single govc call that does not move disk data
const CALL_TIMEOUT: Duration = Duration::from_secs(2 * 60);

/// Deadline for an appliance import
const IMPORT_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Deadline for a clone
const CLONE_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// `govc`-driven hypervisor
#[derive(Clone)]
pub struct GovcHypervisor {
    runner: Arc<dyn CommandRunner>,
    env: BTreeMap<String, String>,
}

impl GovcHypervisor {
    /// Backend for the vCenter described by `spec`
    pub fn new(runner: Arc<dyn CommandRunner>, spec: &VsphereSpec) -> Self {
        let mut env = BTreeMap::new();
        env.insert("GOVC_URL".to_string(), spec.url.clone());
        env.insert("GOVC_USERNAME".to_string(), spec.username.clone());
        env.insert("GOVC_PASSWORD".to_string(), spec.password.clone());
        env.insert("GOVC_INSECURE".to_string(), "1".to_string());
        env.insert("GOVC_DATACENTER".to_string(), spec.datacenter.clone());
        Self { runner, env }
    }

    fn invocation<I, S>(&self, args: I) -> Invocation
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Invocation::new(GOVC)
            .args(args)
            .envs(&self.env)
            .timeout(CALL_TIMEOUT)
    }

    async fn run<I, S>(&self, args: I) -> Result<CommandOutput>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.runner.run(&self.invocation(args)).await
    }

    async fn collect(&self, path: &str, property: &str) -> Result<String> {
        let out = self.run(["object.collect", "-s", path, property]).await?;
        Ok(out.stdout.trim().to_string())
    }
}

fn is_not_found(err: &Error) -> bool {
    matches!(err, Error::ExternalTool { stderr, .. } if stderr.contains("not found"))
}

fn type_flag(kind: ObjectKind) -> &'static str {
    match kind {
        ObjectKind::Datacenter => "d",
        ObjectKind::Datastore => "s",
        ObjectKind::Network => "n",
        ObjectKind::ResourcePool => "p",
        ObjectKind::Folder => "f",
        ObjectKind::VirtualMachine => "m",
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct GuestNic {
    #[serde(default)]
    device_config_id: i64,
    #[serde(default)]
    ip_address: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct CollectedProperty {
    #[serde(default)]
    val: serde_json::Value,
}

/// `ethernet-N` is the adapter with device key 4000 + N
fn nic_device_key(nic: &str) -> Option<i64> {
    nic.strip_prefix("ethernet-")?
        .parse::<i64>()
        .ok()
        .map(|n| 4000 + n)
}

fn first_ipv4(nics: &[GuestNic], nic: &str) -> Option<String> {
    let key = nic_device_key(nic);
    nics.iter()
        .filter(|n| key.map_or(true, |k| n.device_config_id == k))
        .flat_map(|n| n.ip_address.iter())
        .find(|ip| ip.parse::<std::net::Ipv4Addr>().is_ok())
        .cloned()
}

#[async_trait]
impl Hypervisor for GovcHypervisor {
    async fn about(&self) -> Result<String> {
        let out = self.run(["about"]).await.map_err(|e| match e {
            Error::ExternalTool { stderr, .. } => Error::connectivity(
                self.env.get("GOVC_URL").cloned().unwrap_or_default(),
                stderr,
            ),
            other => other,
        })?;
        Ok(out.stdout.trim().to_string())
    }

    async fn find(&self, root: &str, kind: ObjectKind, name: &str) -> Result<Vec<String>> {
        let out = self
            .run(["find", root, "-type", type_flag(kind), "-name", name])
            .await?;
        Ok(out
            .stdout
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect())
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        match self.collect(path, "name").await {
            Ok(_) => Ok(true),
            Err(e) if is_not_found(&e) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn create_folder(&self, path: &str) -> Result<()> {
        self.run(["folder.create", path]).await.map(|_| ())
    }

    async fn destroy(&self, path: &str) -> Result<()> {
        self.run(["object.destroy", path]).await.map(|_| ())
    }

    async fn import_spec(&self, source: &str) -> Result<ImportSpec> {
        let out = self.run(["import.spec", source]).await?;
        serde_json::from_str(&out.stdout)
            .map_err(|e| Error::serialization(format!("invalid import spec for {source}: {e}")))
    }

    async fn import_appliance(
        &self,
        source: &str,
        spec: &ImportSpec,
        placement: &Placement,
        folder: &str,
    ) -> Result<()> {
        let options = tempfile::Builder::new()
            .prefix("cake-import-")
            .suffix(".json")
            .tempfile()?;
        std::fs::write(options.path(), serde_json::to_vec(spec)?)?;

        let invocation = self
            .invocation([
                "import.ova".to_string(),
                format!("-options={}", options.path().display()),
                format!("-folder={}", folder),
                format!("-ds={}", placement.datastore),
                format!("-pool={}", placement.resource_pool),
                source.to_string(),
            ])
            .timeout(IMPORT_TIMEOUT);
        self.runner.run(&invocation).await.map(|_| ())
    }

    async fn list_nics(&self, vm: &str) -> Result<Vec<String>> {
        let out = self.run(["device.ls", "-vm", vm]).await?;
        Ok(out
            .stdout
            .lines()
            .filter_map(|line| line.split_whitespace().next())
            .filter(|name| name.starts_with("ethernet-"))
            .map(str::to_string)
            .collect())
    }

    async fn remove_device(&self, vm: &str, device: &str) -> Result<()> {
        self.run(["device.remove", "-vm", vm, device]).await.map(|_| ())
    }

    async fn mark_as_template(&self, vm: &str) -> Result<()> {
        self.run(["vm.markastemplate", vm]).await.map(|_| ())
    }

    async fn clone_vm(
        &self,
        template: &str,
        name: &str,
        folder: &str,
        placement: &Placement,
    ) -> Result<()> {
        let invocation = self
            .invocation([
                "vm.clone".to_string(),
                format!("-vm={}", template),
                "-on=false".to_string(),
                format!("-folder={}", folder),
                format!("-ds={}", placement.datastore),
                format!("-pool={}", placement.resource_pool),
                name.to_string(),
            ])
            .timeout(CLONE_TIMEOUT);
        self.runner.run(&invocation).await.map(|_| ())
    }

    async fn configure(&self, vm: &str, change: &VmChange) -> Result<()> {
        let mut args = vec!["vm.change".to_string(), "-vm".to_string(), vm.to_string()];
        if let Some(memory) = change.memory_mb {
            args.push(format!("-m={}", memory));
        }
        for (key, value) in &change.extra_config {
            args.push("-e".to_string());
            args.push(format!("{}={}", key, value));
        }
        self.run(args).await.map(|_| ())
    }

    async fn add_nic(&self, vm: &str, network: &str, adapter: &str) -> Result<()> {
        self.run([
            "vm.network.add",
            "-vm",
            vm,
            "-net",
            network,
            "-net.adapter",
            adapter,
        ])
        .await
        .map(|_| ())
    }

    async fn set_power(&self, vm: &str, on: bool) -> Result<()> {
        let args = if on {
            vec!["vm.power", "-on", vm]
        } else {
            vec!["vm.power", "-off", "-force", vm]
        };
        self.run(args).await.map(|_| ())
    }

    async fn power_state(&self, vm: &str) -> Result<PowerState> {
        match self.collect(vm, "runtime.powerState").await?.as_str() {
            "poweredOn" => Ok(PowerState::PoweredOn),
            "poweredOff" => Ok(PowerState::PoweredOff),
            "suspended" => Ok(PowerState::Suspended),
            other => Err(Error::serialization(format!(
                "unknown power state '{other}' for {vm}"
            ))),
        }
    }

    async fn guest_ipv4(&self, vm: &str, nic: &str) -> Result<Option<String>> {
        let out = self.run(["object.collect", "-json", vm, "guest.net"]).await?;
        let props: Vec<CollectedProperty> = serde_json::from_str(out.stdout.trim())
            .map_err(|e| Error::serialization(format!("invalid guest.net for {vm}: {e}")))?;
        let nics: Vec<GuestNic> = props
            .into_iter()
            .filter_map(|p| serde_json::from_value::<Vec<GuestNic>>(p.val).ok())
            .flatten()
            .collect();
        let ip = first_ipv4(&nics, nic);
        debug!(vm = %vm, nic = %nic, ip = ?ip, "guest network info");
        Ok(ip)
    }

    async fn tasks(&self, vm: &str) -> Result<Vec<TaskInfo>> {
        let refs = self.collect(vm, "recentTask").await?;
        let mut tasks = Vec::new();
        for id in refs.split([',', ' ', '\n']).map(str::trim).filter(|s| !s.is_empty()) {
            let out = self
                .run(["object.collect", "-s", id, "info.descriptionId", "info.state"])
                .await?;
            let mut lines = out.stdout.lines().map(str::trim);
            let description_id = lines.next().unwrap_or_default().to_string();
            let state = lines.next().unwrap_or_default().to_string();
            tasks.push(TaskInfo {
                id: id.to_string(),
                description_id,
                state,
            });
        }
        Ok(tasks)
    }

    async fn cancel_task(&self, task: &str) -> Result<()> {
        self.run(["task.cancel", task]).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cake_common::command::MockCommandRunner;
    use cake_common::config::OvaSpec;

    fn spec() -> VsphereSpec {
        VsphereSpec {
            url: "vcenter.example.com".into(),
            username: "administrator@vsphere.local".into(),
            password: "secret".into(),
            datacenter: "DC0".into(),
            resource_pool: "Resources".into(),
            datastore: "datastore1".into(),
            management_network: "VM Network".into(),
            storage_network: String::new(),
            folder: String::new(),
            ova: OvaSpec::default(),
        }
    }

    #[test]
    fn guest_ip_prefers_requested_adapter_and_ipv4() {
        let nics = vec![
            GuestNic {
                device_config_id: 4001,
                ip_address: vec!["192.168.1.9".into()],
            },
            GuestNic {
                device_config_id: 4000,
                ip_address: vec!["fe80::1".into(), "10.0.0.5".into()],
            },
        ];
        assert_eq!(first_ipv4(&nics, "ethernet-0"), Some("10.0.0.5".into()));
        assert_eq!(first_ipv4(&nics, "ethernet-1"), Some("192.168.1.9".into()));
        assert_eq!(first_ipv4(&nics[..1], "ethernet-0"), None);
    }

    #[tokio::test]
    async fn credentials_travel_in_environment() {
        let mut runner = MockCommandRunner::new();
        runner
            .expect_run()
            .withf(|inv| {
                inv.program == "govc"
                    && inv.args == ["find", "/DC0", "-type", "s", "-name", "datastore1"]
                    && inv.envs.get("GOVC_PASSWORD").map(String::as_str) == Some("secret")
                    && !inv.display().contains("secret")
            })
            .returning(|_| {
                Ok(CommandOutput {
                    stdout: "/DC0/datastore/datastore1\n".into(),
                    stderr: String::new(),
                })
            });

        let govc = GovcHypervisor::new(Arc::new(runner), &spec());
        let found = govc
            .find("/DC0", ObjectKind::Datastore, "datastore1")
            .await
            .unwrap();
        assert_eq!(found, vec!["/DC0/datastore/datastore1"]);
    }

    #[tokio::test]
    async fn missing_object_is_not_an_error_for_exists() {
        let mut runner = MockCommandRunner::new();
        runner.expect_run().returning(|_| {
            Err(Error::external_tool(
                "govc",
                "exit status: 1",
                "govc: object '/DC0/vm/cake' not found",
            ))
        });
        let govc = GovcHypervisor::new(Arc::new(runner), &spec());
        assert!(!govc.exists("/DC0/vm/cake").await.unwrap());
    }

    #[tokio::test]
    async fn device_listing_keeps_only_network_adapters() {
        let mut runner = MockCommandRunner::new();
        runner.expect_run().returning(|_| {
            Ok(CommandOutput {
                stdout: "ide-200     VirtualIDEController    IDE 200\n\
                         disk-1000-0 VirtualDisk             20,971,520 KB\n\
                         ethernet-0  VirtualVmxnet3          nic0\n\
                         ethernet-1  VirtualE1000            nic1\n"
                    .into(),
                stderr: String::new(),
            })
        });
        let govc = GovcHypervisor::new(Arc::new(runner), &spec());
        assert_eq!(
            govc.list_nics("/DC0/vm/cake/templates/ubuntu").await.unwrap(),
            vec!["ethernet-0", "ethernet-1"]
        );
    }

    #[tokio::test]
    async fn guestinfo_changes_become_extra_config_flags() {
        let mut runner = MockCommandRunner::new();
        runner
            .expect_run()
            .withf(|inv| {
                inv.args
                    == [
                        "vm.change",
                        "-vm",
                        "/DC0/vm/cake/bootstrap/BootstrapVM",
                        "-m=8192",
                        "-e",
                        "guestinfo.metadata.encoding=base64",
                    ]
            })
            .returning(|_| Ok(CommandOutput::default()));
        let govc = GovcHypervisor::new(Arc::new(runner), &spec());

        let mut change = VmChange {
            memory_mb: Some(8192),
            ..VmChange::default()
        };
        change
            .extra_config
            .insert("guestinfo.metadata.encoding".into(), "base64".into());
        govc.configure("/DC0/vm/cake/bootstrap/BootstrapVM", &change)
            .await
            .unwrap();
    }

    /// govc stand-in: `vm.clone` blocks, the target is unknown until it lands
    /// and the template reports the clone task.
    #[derive(Default)]
    struct StuckClone {
        cloning: std::sync::atomic::AtomicBool,
        calls: parking_lot::Mutex<Vec<String>>,
    }

    #[async_trait]
    impl CommandRunner for StuckClone {
        async fn run(&self, invocation: &Invocation) -> Result<CommandOutput> {
            use std::sync::atomic::Ordering;
            let line = invocation.args.join(" ");
            self.calls.lock().push(line.clone());
            let stdout = match line.as_str() {
                l if l.starts_with("vm.clone") => {
                    self.cloning.store(true, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_secs(30)).await;
                    String::new()
                }
                "object.collect -s /DC0/vm/cake/templates/ubuntu recentTask" => {
                    if self.cloning.load(Ordering::SeqCst) {
                        "Task:task-77".into()
                    } else {
                        String::new()
                    }
                }
                "object.collect -s Task:task-77 info.descriptionId info.state" => {
                    "VirtualMachine.clone\nrunning\n".into()
                }
                "object.collect -s /DC0/vm/cake/mgmt/node-1 recentTask" => {
                    return Err(Error::external_tool(
                        GOVC,
                        "exit status: 1",
                        "govc: object '/DC0/vm/cake/mgmt/node-1' not found",
                    ))
                }
                _ => String::new(),
            };
            Ok(CommandOutput {
                stdout,
                stderr: String::new(),
            })
        }
    }

    #[tokio::test]
    async fn story_overdue_clone_is_cancelled_through_the_template() {
        use crate::cloner::{clone_template, CloneOptions, CloneSpec};
        use crate::session::{Folder, Session, VirtualMachine};
        use crate::tracked::TrackedResources;

        let runner = Arc::new(StuckClone::default());
        let govc = GovcHypervisor::new(runner.clone(), &spec());
        let placement = Placement {
            datacenter: "/DC0".into(),
            datastore: "/DC0/datastore/datastore1".into(),
            resource_pool: "/DC0/host/cluster/Resources".into(),
            network: "/DC0/network/VM Network".into(),
        };
        let session = Session::with_placement(Arc::new(govc), placement);
        let folder = Folder {
            name: "mgmt".into(),
            inventory_path: "/DC0/vm/cake/mgmt".into(),
        };
        let spec = CloneSpec {
            template: VirtualMachine {
                name: "ubuntu".into(),
                inventory_path: "/DC0/vm/cake/templates/ubuntu".into(),
            },
            name: "node-1".into(),
            boot_script: "#!/bin/bash\n".into(),
            authorized_keys: vec![],
            os_user: "ubuntu".into(),
        };
        let options = CloneOptions {
            deadline: Duration::from_millis(100),
            ..CloneOptions::default()
        };

        let err = clone_template(&session, &TrackedResources::new(), &folder, &spec, &options)
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Timeout { .. }));
        let calls = runner.calls.lock();
        assert!(calls.iter().any(|c| c == "task.cancel Task:task-77"));
    }
}
