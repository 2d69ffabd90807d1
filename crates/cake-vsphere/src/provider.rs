//! The vSphere bootstrap provider.
//!
//! Runs on the operator's machine: creates folders and templates, clones the
//! VM(s) the engine will run on, ships the engine binary and spec over the
//! bootstrap channel, then follows the remote run until it finishes and
//! collects its log and deliverables.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{info, warn};

#[cfg(test)]
use mockall::automock;

use cake_bootstrap::firstboot::{
    helm_install, prerequisites_for, private_key_to_disk, RKE_BINARY_INSTALL,
};
use cake_bootstrap::{BootstrapPorts, BootstrapTarget, FirstBootScript};
use cake_common::command::CommandRunner;
use cake_common::config::{
    node_name, ClusterSpec, EngineType, NodeAddress, CONTROL_PLANE_NODE, WORKER_NODE,
};
use cake_common::events::{EventBus, StatusEvent};
use cake_common::retry::RetryConfig;
use cake_common::{
    Error, Result, PREREQUISITES_MARKER, REMOTE_CONFIG, REMOTE_EXECUTABLE, REMOTE_OUTPUT,
};
use cake_progress::ProgressClient;

use crate::cloner::{clone_template, clone_templates, CloneOptions, CloneSpec};
use crate::folders::{ensure_folder, BASE_FOLDER, BOOTSTRAP_FOLDER, MGMT_FOLDER, TEMPLATES_FOLDER};
use crate::govc::GovcHypervisor;
use crate::importer::import_templates;
use crate::ip::{get_vm_ip_within, IP_TIMEOUT};
use crate::keys::generate_key_pair;
use crate::session::{Folder, Session, VirtualMachine};
use crate::tracked::TrackedResources;

/// Name of the CAPV bootstrap VM
pub const BOOTSTRAP_VM_NAME: &str = "BootstrapVM";

/// Where the generated private key lands on the RKE bootstrap node
pub const RKE_KEY_PATH: &str = "/root/.ssh/id_rsa";

/// Infrastructure stages run before and around a remote engine run
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Bootstrapper: Send + Sync {
    /// Create folders, templates and VMs
    async fn prepare(&mut self) -> Result<()>;
    /// Ship the engine to its VM and start it
    async fn provision(&mut self) -> Result<()>;
    /// Follow the remote run until it finishes
    async fn progress(&mut self) -> Result<()>;
    /// Collect the log and deliverables
    async fn finalize(&mut self) -> Result<()>;
}

/// Run every stage in order, stopping at the first failure
pub async fn run_bootstrapper(bootstrapper: &mut dyn Bootstrapper, bus: &dyn EventBus) -> Result<()> {
    bus.publish(StatusEvent::checkpoint("prepare")).await?;
    bootstrapper.prepare().await?;
    bus.publish(StatusEvent::checkpoint("provision")).await?;
    bootstrapper.provision().await?;
    bus.publish(StatusEvent::checkpoint("progress")).await?;
    bootstrapper.progress().await?;
    bus.publish(StatusEvent::checkpoint("finalize")).await?;
    bootstrapper.finalize().await
}

/// Knobs for a provider run
#[derive(Debug, Clone)]
pub struct ProviderOptions {
    /// Engine binary uploaded to the bootstrap VM
    pub executable: PathBuf,
    /// Bootstrap listener ports
    pub ports: BootstrapPorts,
    /// Readiness probe for the listeners
    pub retry: RetryConfig,
    /// Wait for the first-boot script to finish installing prerequisites
    pub prerequisites: RetryConfig,
    /// Clone tunables
    pub clone: CloneOptions,
    /// Bound on address discovery per VM
    pub ip_timeout: Duration,
    /// Address poll interval
    pub ip_interval: Duration,
    /// Progress poll interval
    pub progress_interval: Duration,
    /// Bound on the whole remote run
    pub progress_timeout: Duration,
    /// Progress surface to follow instead of `http://<bootstrap ip>:<port>`
    pub progress_url: Option<String>,
}

impl ProviderOptions {
    /// Defaults for uploading `executable`
    pub fn new(executable: impl Into<PathBuf>) -> Self {
        Self {
            executable: executable.into(),
            ports: BootstrapPorts::default(),
            retry: RetryConfig::listener_probe(),
            prerequisites: RetryConfig::prerequisites_wait(),
            clone: CloneOptions::default(),
            ip_timeout: IP_TIMEOUT,
            ip_interval: Duration::from_secs(5),
            progress_interval: Duration::from_secs(1),
            progress_timeout: Duration::from_secs(3 * 60 * 60),
            progress_url: None,
        }
    }
}

/// The shell line that starts the engine on the bootstrap VM
pub fn remote_command(spec: &ClusterSpec) -> String {
    let cmd = format!(
        "{REMOTE_EXECUTABLE} deploy --local --deployment-type {} --spec-file {REMOTE_CONFIG} --progress > {REMOTE_OUTPUT}",
        spec.engine_type.as_flag()
    );
    match (&spec.engine_type, &spec.bootstrap_ip) {
        (EngineType::Rke, Some(ip)) => format!("CAKE_BOOTSTRAPIP={ip} {cmd}"),
        _ => cmd,
    }
}

/// Provider backed by a vSphere session
pub struct VsphereProvider {
    spec: ClusterSpec,
    session: Session,
    tracked: TrackedResources,
    runner: Arc<dyn CommandRunner>,
    bus: Arc<dyn EventBus>,
    options: ProviderOptions,
    /// VMs in clone order; the first runs the engine
    vms: Vec<VirtualMachine>,
    bootstrap_ip: Option<String>,
}

impl std::fmt::Debug for VsphereProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VsphereProvider")
            .field("cluster", &self.spec.cluster_name)
            .field("session", &self.session)
            .field("vms", &self.vms)
            .finish_non_exhaustive()
    }
}

impl VsphereProvider {
    /// Log in through `govc` and resolve the placement
    pub async fn connect(
        spec: ClusterSpec,
        runner: Arc<dyn CommandRunner>,
        bus: Arc<dyn EventBus>,
        options: ProviderOptions,
    ) -> Result<Self> {
        let hypervisor = Arc::new(GovcHypervisor::new(runner.clone(), &spec.provider));
        let session = Session::connect(hypervisor, &spec.provider).await?;
        bus.publish(StatusEvent::progress(format!(
            "connected to vCenter {}",
            spec.provider.url
        )))
        .await?;
        Ok(Self::with_session(spec, session, runner, bus, options))
    }

    /// Provider over an existing session
    pub fn with_session(
        spec: ClusterSpec,
        session: Session,
        runner: Arc<dyn CommandRunner>,
        bus: Arc<dyn EventBus>,
        options: ProviderOptions,
    ) -> Self {
        Self {
            spec,
            session,
            tracked: TrackedResources::new(),
            runner,
            bus,
            options,
            vms: Vec::new(),
            bootstrap_ip: None,
        }
    }

    /// Everything created or reused so far
    pub fn tracked(&self) -> &TrackedResources {
        &self.tracked
    }

    /// The spec as it will be uploaded
    pub fn spec(&self) -> &ClusterSpec {
        &self.spec
    }

    async fn publish(&self, msg: String) -> Result<()> {
        self.bus.publish(StatusEvent::progress(msg)).await
    }

    async fn create_folders(&self) -> Result<(Folder, Folder, Folder)> {
        let templates = ensure_folder(
            &self.session,
            &self.tracked,
            &format!("{BASE_FOLDER}/{TEMPLATES_FOLDER}"),
        )
        .await?;
        let bootstrap = ensure_folder(
            &self.session,
            &self.tracked,
            &format!("{BASE_FOLDER}/{BOOTSTRAP_FOLDER}"),
        )
        .await?;
        let mgmt_path = if self.spec.provider.folder.is_empty() {
            format!("{BASE_FOLDER}/{MGMT_FOLDER}")
        } else {
            self.spec.provider.folder.clone()
        };
        let mgmt = ensure_folder(&self.session, &self.tracked, &mgmt_path).await?;
        Ok((templates, bootstrap, mgmt))
    }

    fn clone_spec(&self, template: &VirtualMachine, name: String, script: String) -> CloneSpec {
        CloneSpec {
            template: template.clone(),
            name,
            boot_script: script,
            authorized_keys: self.spec.ssh.authorized_keys.clone(),
            os_user: self.spec.ssh.username.clone(),
        }
    }

    async fn prepare_capv(
        &mut self,
        templates: &BTreeMap<String, VirtualMachine>,
        folder: &Folder,
    ) -> Result<()> {
        let template = template_for(templates, &self.spec.provider.ova.bootstrap_template)?;
        let prereqs = prerequisites_for(EngineType::Capv, &self.spec.ssh.username);
        let script = FirstBootScript::bootstrap(prereqs).render()?;
        let spec = self.clone_spec(template, BOOTSTRAP_VM_NAME.to_string(), script);

        let vm = clone_template(&self.session, &self.tracked, folder, &spec, &self.options.clone)
            .await?;
        self.publish(format!("created {}", vm.inventory_path)).await?;
        self.vms = vec![vm];
        Ok(())
    }

    async fn prepare_rke(
        &mut self,
        templates: &BTreeMap<String, VirtualMachine>,
        folder: &Folder,
    ) -> Result<()> {
        let template = template_for(templates, &self.spec.provider.ova.node_template)?.clone();

        let keys = generate_key_pair(self.runner.as_ref()).await?;
        self.spec.ssh.authorized_keys.push(keys.public_key.clone());
        if self.spec.ssh.key_path.is_none() {
            self.spec.ssh.key_path = Some(RKE_KEY_PATH.to_string());
        }

        let user = self.spec.ssh.username.clone();
        let prereqs = prerequisites_for(EngineType::Rke, &user);
        let bootstrapper = FirstBootScript::bootstrap(prereqs.clone())
            .lines([
                helm_install(),
                RKE_BINARY_INSTALL.to_string(),
                private_key_to_disk(&keys.private_key),
            ])
            .render()?;
        let node = FirstBootScript::node(prereqs).render()?;

        let cluster = self.spec.cluster_name.clone();
        let mut specs = vec![self.clone_spec(
            &template,
            node_name(&cluster, CONTROL_PLANE_NODE, 1),
            bootstrapper,
        )];
        for i in 2..=self.spec.control_plane_count {
            specs.push(self.clone_spec(
                &template,
                node_name(&cluster, CONTROL_PLANE_NODE, i),
                node.clone(),
            ));
        }
        for i in 1..=self.spec.worker_count {
            specs.push(self.clone_spec(
                &template,
                node_name(&cluster, WORKER_NODE, i),
                node.clone(),
            ));
        }

        let mut created =
            clone_templates(&self.session, &self.tracked, folder, &specs, &self.options.clone)
                .await
                .into_result()?;
        self.vms = specs
            .iter()
            .filter_map(|s| created.remove(&s.name))
            .collect();
        self.publish(format!("created {} nodes in {}", self.vms.len(), folder.inventory_path))
            .await
    }

    fn bootstrap_ip(&self) -> Result<&str> {
        self.bootstrap_ip
            .as_deref()
            .ok_or_else(|| Error::internal_with_context("provider", "bootstrap VM has no address yet"))
    }

    fn progress_client(&self) -> Result<ProgressClient> {
        match &self.options.progress_url {
            Some(url) => ProgressClient::with_base_url(url.clone()),
            None => ProgressClient::new(self.bootstrap_ip()?, self.spec.progress_port),
        }
    }
}

fn template_for<'a>(
    templates: &'a BTreeMap<String, VirtualMachine>,
    path: &str,
) -> Result<&'a VirtualMachine> {
    templates
        .get(path)
        .ok_or_else(|| Error::not_found("template", path))
}

#[async_trait]
impl Bootstrapper for VsphereProvider {
    async fn prepare(&mut self) -> Result<()> {
        let (templates_folder, bootstrap_folder, mgmt_folder) = self.create_folders().await?;

        let paths = self.spec.provider.ova.paths();
        self.publish(format!("importing {} template(s)", paths.len()))
            .await?;
        let outcome = import_templates(&self.session, &self.tracked, &templates_folder, &paths).await;
        for (path, e) in &outcome.failures {
            self.bus
                .publish(StatusEvent::warning(format!("import of {path} failed: {e}")))
                .await?;
        }
        let templates = outcome.into_result()?;

        match self.spec.engine_type {
            EngineType::Capv => self.prepare_capv(&templates, &bootstrap_folder).await,
            EngineType::Rke => self.prepare_rke(&templates, &mgmt_folder).await,
        }
    }

    async fn provision(&mut self) -> Result<()> {
        let vms = self.vms.clone();
        let Some(first) = vms.first() else {
            return Err(Error::internal_with_context("provider", "provision called before prepare"));
        };

        let mut nodes = Vec::with_capacity(vms.len());
        for vm in &vms {
            let address = get_vm_ip_within(
                &self.session,
                vm,
                self.options.ip_timeout,
                self.options.ip_interval,
            )
            .await?;
            self.publish(format!("IP received for {}: {}", vm.name, address))
                .await?;
            nodes.push(NodeAddress {
                name: vm.name.clone(),
                address,
            });
        }
        let ip = nodes[0].address.clone();
        info!(vm = %first.name, address = %ip, "bootstrap address");
        self.bootstrap_ip = Some(ip.clone());

        if self.spec.engine_type == EngineType::Rke {
            self.spec.bootstrap_ip = Some(ip.clone());
            self.spec.nodes = nodes;
        }

        let target = BootstrapTarget::new(ip)
            .with_ports(self.options.ports)
            .with_retry(self.options.retry.clone());
        target.upload_executable(&self.options.executable).await?;
        target.upload_config(&self.spec.to_yaml()?).await?;
        self.publish("uploaded engine and spec to bootstrap VM".to_string())
            .await?;

        let mut channel = target.command_channel().await?;
        self.publish("waiting for bootstrap VM prerequisites".to_string())
            .await?;
        channel
            .wait_for_marker(PREREQUISITES_MARKER, &self.options.prerequisites)
            .await?;
        let command = remote_command(&self.spec);
        channel.run_async(&command).await?;
        self.publish(format!("started remote engine: {command}"))
            .await
    }

    async fn progress(&mut self) -> Result<()> {
        let client = self.progress_client()?;
        client
            .follow(
                self.bus.as_ref(),
                self.options.progress_interval,
                self.options.progress_timeout,
            )
            .await?;
        Ok(())
    }

    async fn finalize(&mut self) -> Result<()> {
        let client = self.progress_client()?;
        let dir = match &self.spec.log_dir {
            Some(dir) => dir.clone(),
            None => self.spec.work_dir()?,
        };
        tokio::fs::create_dir_all(&dir).await?;

        let log = dir.join(format!("{}.log", self.spec.cluster_name));
        match client.download_log(&log).await {
            Ok(()) => {}
            Err(Error::NotFound { .. }) => {
                warn!("remote run has no log file");
                self.bus
                    .publish(StatusEvent::warning("remote run did not keep a log file"))
                    .await?;
            }
            Err(e) => return Err(e),
        }

        let files = client.download_deliverables(&dir).await?;
        for file in &files {
            self.publish(format!("saved {}", file.display())).await?;
        }
        self.publish(format!(
            "all files from the cluster deployment can be found here: {}/",
            dir.display()
        ))
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeHypervisor;
    use cake_common::command::{CommandOutput, MockCommandRunner};
    use cake_common::events::LocalBus;
    use cake_progress::{serve_listener, ProgressState, StatusBoard};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
    use tokio::net::TcpListener;

    const SPEC: &str = r#"
EngineType: CAPV
ClusterName: capv-mgmt
ControlPlaneCount: 1
WorkerCount: 2
KubernetesVersion: v1.17.3
SSH:
  Username: ubuntu
  AuthorizedKeys:
    - ssh-rsa AAAA operator@cake
Provider:
  URL: vcenter.example.com
  Username: administrator@vsphere.local
  Password: secret
  Datacenter: DC0
  ResourcePool: Resources
  Datastore: LocalDS_0
  ManagementNetwork: VM Network
  OVA:
    BootstrapTemplate: /ovas/ubuntu-1804.ova
    NodeTemplate: /ovas/ubuntu-1804-kube.ova
"#;

    fn spec(engine: &str, workers: u32) -> ClusterSpec {
        let doc = SPEC
            .replace("EngineType: CAPV", &format!("EngineType: {engine}"))
            .replace("WorkerCount: 2", &format!("WorkerCount: {workers}"));
        ClusterSpec::from_yaml("cake.yaml", &doc).unwrap()
    }

    fn provider(
        fake: &Arc<FakeHypervisor>,
        spec: ClusterSpec,
        runner: MockCommandRunner,
        options: ProviderOptions,
    ) -> (VsphereProvider, LocalBus) {
        let bus = LocalBus::new();
        let session = Session::with_placement(fake.clone(), FakeHypervisor::placement());
        let provider = VsphereProvider::with_session(
            spec,
            session,
            Arc::new(runner),
            Arc::new(bus.clone()),
            options,
        );
        (provider, bus)
    }

    #[test]
    fn rke_command_carries_the_bootstrap_address() {
        let mut spec = spec("RKE", 1);
        assert_eq!(
            remote_command(&spec),
            "/tmp/cake deploy --local --deployment-type rke --spec-file /root/.cake.yaml --progress > /tmp/cake.out"
        );
        spec.bootstrap_ip = Some("10.0.0.5".into());
        assert!(remote_command(&spec).starts_with("CAKE_BOOTSTRAPIP=10.0.0.5 /tmp/cake deploy"));
    }

    #[tokio::test]
    async fn story_rke_prepare_clones_named_nodes_with_generated_key() {
        let fake = Arc::new(FakeHypervisor::new());
        let mut runner = MockCommandRunner::new();
        runner.expect_run().times(1).returning(|inv| {
            let path = PathBuf::from(inv.args.last().unwrap());
            std::fs::write(&path, "PRIVATE").unwrap();
            std::fs::write(path.with_extension("pub"), "ssh-rsa GENERATED cake").unwrap();
            Ok(CommandOutput::default())
        });

        let (mut provider, _bus) = provider(
            &fake,
            spec("RKE", 2),
            runner,
            ProviderOptions::new("/usr/local/bin/cake"),
        );
        provider.prepare().await.unwrap();

        let names: Vec<_> = provider.vms.iter().map(|vm| vm.name.clone()).collect();
        assert_eq!(
            names,
            vec!["capv-mgmt-controlplane-1", "capv-mgmt-worker-1", "capv-mgmt-worker-2"]
        );
        assert_eq!(
            provider.vms[0].inventory_path,
            "/DC0/vm/cake/mgmt/capv-mgmt-controlplane-1"
        );
        assert_eq!(provider.spec().ssh.authorized_keys.len(), 2);
        assert_eq!(provider.spec().ssh.key_path.as_deref(), Some(RKE_KEY_PATH));
        assert!(provider.tracked().folder("templates").is_some());
    }

    async fn accept_upload(listener: TcpListener) -> usize {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut buf = Vec::new();
        stream.read_to_end(&mut buf).await.unwrap();
        buf.len()
    }

    /// Story: a CAPV run from an empty datacenter to downloaded deliverables,
    /// with the remote engine played by a local progress server
    #[tokio::test]
    async fn story_capv_run_end_to_end() {
        let fake = Arc::new(FakeHypervisor::new());
        fake.state.lock().ips.insert(
            "/DC0/vm/cake/bootstrap/BootstrapVM".into(),
            "127.0.0.1".into(),
        );

        let workdir = tempfile::tempdir().unwrap();
        let binary = workdir.path().join("cake");
        std::fs::write(&binary, vec![7u8; 4096]).unwrap();

        let upload = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let config = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let command = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let ports = BootstrapPorts {
            upload: upload.local_addr().unwrap().port(),
            config: config.local_addr().unwrap().port(),
            command: command.local_addr().unwrap().port(),
        };
        let uploaded = tokio::spawn(accept_upload(upload));
        let configured = tokio::spawn(async move {
            let (mut stream, _) = config.accept().await.unwrap();
            let mut doc = String::new();
            stream.read_to_string(&mut doc).await.unwrap();
            doc
        });
        // Prerequisites are still installing on the first check
        let commanded = tokio::spawn(async move {
            let (stream, _) = command.accept().await.unwrap();
            let mut shell = BufReader::new(stream);
            let mut checks = Vec::new();
            loop {
                let mut line = String::new();
                shell.read_line(&mut line).await.unwrap();
                if !line.starts_with("if [ -e /tmp/cake-prerequisites-ready ]") {
                    return (checks, line);
                }
                let reply = if checks.is_empty() {
                    "cake-marker-absent\n"
                } else {
                    "cake-marker-present\n"
                };
                checks.push(line);
                shell.get_mut().write_all(reply.as_bytes()).await.unwrap();
            }
        });

        // The "remote" engine: finished, with a kubeconfig to hand over
        let board = StatusBoard::new();
        board.record(&StatusEvent::checkpoint("phase-end:install-addons"));
        board.finish(true);
        let kubeconfig = workdir.path().join("kubeconfig");
        std::fs::write(&kubeconfig, "apiVersion: v1\n").unwrap();
        let state = ProgressState::new(board, None);
        state.register_deliverable(&kubeconfig);
        let progress = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let progress_url = format!("http://{}", progress.local_addr().unwrap());
        serve_listener(progress, state);

        let mut spec = spec("CAPV", 2);
        let logs = workdir.path().join("logs");
        spec.log_dir = Some(logs.clone());
        let options = ProviderOptions {
            ports,
            retry: RetryConfig::attempts(5),
            prerequisites: RetryConfig {
                max_attempts: 3,
                initial_delay: Duration::from_millis(10),
                max_delay: Duration::from_millis(10),
                backoff_multiplier: 1.0,
            },
            ip_interval: Duration::from_millis(5),
            progress_interval: Duration::from_millis(10),
            progress_timeout: Duration::from_secs(10),
            progress_url: Some(progress_url),
            ..ProviderOptions::new(&binary)
        };
        let (mut provider, bus) = provider(&fake, spec, MockCommandRunner::new(), options);

        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        cake_common::events::subscribe_with(&bus, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .await
        .unwrap();

        let bus_handle = bus.clone();
        run_bootstrapper(&mut provider, &bus_handle).await.unwrap();

        assert_eq!(uploaded.await.unwrap(), 4096);
        let doc = configured.await.unwrap();
        assert!(doc.contains("ClusterName: capv-mgmt"));
        let (checks, line) = commanded.await.unwrap();
        assert_eq!(checks.len(), 2);
        assert_eq!(
            line.trim_end(),
            format!("{} & disown", remote_command(provider.spec()))
        );

        assert_eq!(
            std::fs::read_to_string(logs.join("kubeconfig")).unwrap(),
            "apiVersion: v1\n"
        );
        assert_eq!(fake.state.lock().imports.len(), 2);
        assert!(seen.load(Ordering::SeqCst) > 0);
    }

    #[tokio::test]
    async fn failed_prepare_stops_the_run() {
        let mut bootstrapper = MockBootstrapper::new();
        bootstrapper
            .expect_prepare()
            .returning(|| Err(Error::not_found("template", "/ovas/missing.ova")));
        bootstrapper.expect_provision().never();
        bootstrapper.expect_progress().never();
        bootstrapper.expect_finalize().never();

        let bus = LocalBus::new();
        let err = run_bootstrapper(&mut bootstrapper, &bus).await.unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));
    }
}
