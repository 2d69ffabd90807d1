//! Cluster API engine with the vSphere infrastructure provider (CAPV).
//!
//! A throwaway `kind` cluster hosts Cluster API long enough to create the
//! permanent cluster on vSphere, after which `clusterctl move` hands the
//! management objects over and the permanent cluster manages itself.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use minijinja::context;
use tracing::info;

use cake_common::command::{missing_tools, CommandRunner, Invocation};
use cake_common::config::ClusterSpec;
use cake_common::events::{EventBus, StatusEvent};
use cake_common::{Error, Result};

use crate::engine::ClusterEngine;
use crate::exec::{helm, kubectl, render, tolerate_duplicate, write_file};
use crate::kube_api::{ClusterApi, ResourceRef};
use crate::wait::{wait_for_condition, Condition, ListQuery, DEFAULT_POLL_INTERVAL};

const CREDENTIALS_TEMPLATE: &str = include_str!("../templates/vsphere-credentials.yaml");
const TRIDENT_BACKEND_TEMPLATE: &str = include_str!("../templates/trident-backend.json");
const TRIDENT_STORAGE_CLASS: &str = include_str!("../templates/trident-storageclass.yaml");

/// CNI applied to the permanent cluster
pub const CALICO_MANIFEST: &str = "https://docs.projectcalico.org/v3.12/manifests/calico.yaml";

const CAPI_API_VERSION: &str = "cluster.x-k8s.io/v1alpha3";
const KCP_API_VERSION: &str = "controlplane.cluster.x-k8s.io/v1alpha3";
const CAPV_NAMESPACE: &str = "capv-system";
const CAPV_CONTROLLER: &str = "deployment/capv-controller-manager";
const TRIDENT_NAMESPACE: &str = "trident";
const OBSERVABILITY_NAMESPACE: &str = "cake-observability";

/// Programs every CAPV run needs
pub const CAPV_TOOLS: [&str; 4] = ["kind", "clusterctl", "kubectl", "docker"];

/// Files a CAPV run writes under its working directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapvPaths {
    /// `~/.cake/<cluster>`
    pub work_dir: PathBuf,
    /// Kubeconfig of the kind cluster
    pub bootstrap_kubeconfig: PathBuf,
    /// Kubeconfig of the permanent cluster
    pub kubeconfig: PathBuf,
    /// Output of `clusterctl config cluster`
    pub base_manifest: PathBuf,
    /// vSphere credentials secret
    pub credentials: PathBuf,
    /// Trident backend definition
    pub trident_backend: PathBuf,
    /// Trident storage class
    pub storage_class: PathBuf,
}

impl CapvPaths {
    /// Lay out the files for `cluster` under `work_dir`
    pub fn new(work_dir: impl Into<PathBuf>, cluster: &str) -> Self {
        let work_dir = work_dir.into();
        Self {
            bootstrap_kubeconfig: work_dir.join("bootstrap-kubeconfig"),
            kubeconfig: work_dir.join("kubeconfig"),
            base_manifest: work_dir.join(format!("{cluster}-base.yaml")),
            credentials: work_dir.join("vsphere-credentials.yaml"),
            trident_backend: work_dir.join("trident-backend.json"),
            storage_class: work_dir.join("trident-storageclass.yaml"),
            work_dir,
        }
    }
}

/// Deadlines for the readiness waits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CapvWaits {
    /// Every Machine reaching `Running`
    pub machines: Duration,
    /// Every Node reporting `Ready=True`
    pub nodes: Duration,
    /// The KubeadmControlPlane reporting ready before the move
    pub control_plane: Duration,
    /// Time between polls
    pub interval: Duration,
}

impl Default for CapvWaits {
    fn default() -> Self {
        Self {
            machines: Duration::from_secs(15 * 60),
            nodes: Duration::from_secs(15 * 60),
            control_plane: Duration::from_secs(5 * 60),
            interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

/// The CAPV engine
pub struct CapvEngine {
    spec: ClusterSpec,
    runner: Arc<dyn CommandRunner>,
    api: Arc<dyn ClusterApi>,
    bus: Arc<dyn EventBus>,
    paths: CapvPaths,
    waits: CapvWaits,
    deliverables: Vec<PathBuf>,
}

impl CapvEngine {
    /// An engine writing into `~/.cake/<cluster>`
    pub fn new(
        spec: ClusterSpec,
        runner: Arc<dyn CommandRunner>,
        api: Arc<dyn ClusterApi>,
        bus: Arc<dyn EventBus>,
    ) -> Result<Self> {
        let paths = CapvPaths::new(spec.work_dir()?, &spec.cluster_name);
        Ok(Self {
            spec,
            runner,
            api,
            bus,
            paths,
            waits: CapvWaits::default(),
            deliverables: Vec::new(),
        })
    }

    /// Write into `work_dir` instead
    pub fn with_work_dir(mut self, work_dir: impl Into<PathBuf>) -> Self {
        self.paths = CapvPaths::new(work_dir, &self.spec.cluster_name);
        self
    }

    /// Override the wait deadlines
    pub fn with_waits(mut self, waits: CapvWaits) -> Self {
        self.waits = waits;
        self
    }

    /// Files this engine reads and writes
    pub fn paths(&self) -> &CapvPaths {
        &self.paths
    }

    /// Programs needed for this spec, addons included
    pub fn required_tools(&self) -> Vec<&'static str> {
        let mut tools = CAPV_TOOLS.to_vec();
        if self.spec.addons.observability.enable {
            tools.push("helm");
        }
        if self.spec.addons.solidfire.enable {
            tools.push("tridentctl");
        }
        tools
    }

    fn kind_cluster(&self) -> String {
        format!("{}-bootstrap", self.spec.cluster_name)
    }

    async fn progress(&self, msg: impl Into<String>) -> Result<()> {
        let msg = msg.into();
        info!(cluster = %self.spec.cluster_name, "{}", msg);
        self.bus.publish(StatusEvent::progress(msg)).await
    }

    /// `VSPHERE_*` variables `clusterctl` reads, plus `KUBECONFIG`
    fn clusterctl_env(&self, kubeconfig: &Path) -> Result<BTreeMap<String, String>> {
        let provider = &self.spec.provider;
        let ssh_key = self.spec.ssh.authorized_keys.first().ok_or_else(|| {
            Error::validation_for(
                &self.spec.cluster_name,
                "SSH.AuthorizedKeys needs at least one key for CAPV",
            )
        })?;

        let mut env = BTreeMap::new();
        let mut set = |k: &str, v: &str| {
            env.insert(k.to_string(), v.to_string());
        };
        set("VSPHERE_PASSWORD", &provider.password);
        set("VSPHERE_USERNAME", &provider.username);
        set("VSPHERE_SERVER", &provider.url);
        set("VSPHERE_DATACENTER", &provider.datacenter);
        set("VSPHERE_DATASTORE", &provider.datastore);
        set("VSPHERE_NETWORK", &provider.management_network);
        set("VSPHERE_RESOURCE_POOL", &provider.resource_pool);
        set("VSPHERE_FOLDER", &provider.folder);
        set("VSPHERE_TEMPLATE", &template_name(&provider.ova.node_template));
        set(
            "VSPHERE_HAPROXY_TEMPLATE",
            &template_name(&provider.ova.loadbalancer_template),
        );
        set("VSPHERE_SSH_AUTHORIZED_KEY", ssh_key);
        set("KUBECONFIG", &kubeconfig.display().to_string());
        Ok(env)
    }

    async fn write_credentials(&self) -> Result<()> {
        let provider = &self.spec.provider;
        let contents = render(
            "vsphere-credentials",
            CREDENTIALS_TEMPLATE,
            context! {
                username => STANDARD.encode(&provider.username),
                password => STANDARD.encode(&provider.password),
            },
        )?;
        write_file(&self.paths.credentials, contents).await
    }

    async fn apply(&self, kubeconfig: &Path, target: &str) -> Result<()> {
        let invocation = kubectl(kubeconfig).arg("apply").arg(format!("--filename={target}"));
        if let Err(e) = self.runner.run(&invocation).await {
            self.progress(format!("failed to execute {}: {e}", invocation.display()))
                .await?;
            return Err(e);
        }
        Ok(())
    }

    async fn wait(&self, kubeconfig: &Path, resource: ResourceRef, condition: Condition, timeout: Duration) -> Result<()> {
        let query = ListQuery::new(self.api.clone(), kubeconfig, resource);
        wait_for_condition(&query, &condition, timeout, self.waits.interval, self.bus.as_ref()).await
    }

    async fn install_observability(&self) -> Result<()> {
        self.progress("installing the observability addon").await?;
        let kubeconfig = &self.paths.kubeconfig;
        let archive = &self.spec.addons.observability.archive_location;
        let namespace = format!("--namespace={OBSERVABILITY_NAMESPACE}");

        if archive.is_empty() {
            self.runner
                .run(&helm(
                    kubeconfig,
                    [
                        "repo",
                        "add",
                        "prometheus-community",
                        "https://prometheus-community.github.io/helm-charts",
                    ],
                ))
                .await?;
            self.runner
                .run(&helm(
                    kubeconfig,
                    ["repo", "add", "grafana", "https://grafana.github.io/helm-charts"],
                ))
                .await?;
            for (release, chart) in [
                ("prometheus", "prometheus-community/prometheus"),
                ("loki", "grafana/loki-stack"),
            ] {
                self.runner
                    .run(&helm(
                        kubeconfig,
                        ["install", release, chart, namespace.as_str(), "--create-namespace"],
                    ))
                    .await?;
            }
        } else {
            self.runner
                .run(&helm(
                    kubeconfig,
                    ["install", "observability", archive.as_str(), namespace.as_str(), "--create-namespace"],
                ))
                .await?;
        }
        self.progress("observability addon install complete").await
    }

    async fn install_trident(&self) -> Result<()> {
        self.progress("installing the trident addon").await?;
        let kubeconfig = &self.paths.kubeconfig;
        let solidfire = &self.spec.addons.solidfire;
        let tridentctl = || {
            Invocation::new("tridentctl")
                .env("KUBECONFIG", kubeconfig.display().to_string())
                .arg(format!("--namespace={TRIDENT_NAMESPACE}"))
        };

        self.runner.run(&tridentctl().arg("install")).await?;

        let backend = render(
            "trident-backend",
            TRIDENT_BACKEND_TEMPLATE,
            context! {
                user => &solidfire.user,
                password => &solidfire.password,
                mvip => &solidfire.mvip,
                svip => &solidfire.svip,
                cluster => &self.spec.cluster_name,
            },
        )?;
        write_file(&self.paths.trident_backend, backend).await?;
        self.runner
            .run(&tridentctl().args([
                "create".to_string(),
                "backend".to_string(),
                format!("--filename={}", self.paths.trident_backend.display()),
            ]))
            .await?;

        write_file(&self.paths.storage_class, TRIDENT_STORAGE_CLASS).await?;
        self.apply(kubeconfig, &self.paths.storage_class.display().to_string())
            .await?;
        self.progress("trident addon install complete").await
    }
}

/// Template name clusterctl expects: the archive basename without `.ova`
fn template_name(path: &str) -> String {
    let base = path.rsplit('/').next().unwrap_or(path);
    base.strip_suffix(".ova").unwrap_or(base).to_string()
}

#[async_trait]
impl ClusterEngine for CapvEngine {
    fn name(&self) -> String {
        "capv".to_string()
    }

    fn missing_tools(&self) -> Vec<String> {
        missing_tools(&self.required_tools())
    }

    fn events(&self) -> Arc<dyn EventBus> {
        self.bus.clone()
    }

    fn deliverables(&self) -> Vec<PathBuf> {
        self.deliverables.clone()
    }

    async fn create_bootstrap(&mut self) -> Result<()> {
        self.progress("creating the bootstrap cluster").await?;
        tokio::fs::create_dir_all(&self.paths.work_dir).await?;

        let name = format!("--name={}", self.kind_cluster());
        self.runner
            .run(&Invocation::new("kind").args(["create", "cluster", name.as_str()]))
            .await?;
        let kubeconfig = self
            .runner
            .run(&Invocation::new("kind").args(["get", "kubeconfig", name.as_str()]))
            .await?;
        write_file(&self.paths.bootstrap_kubeconfig, kubeconfig.stdout).await?;
        self.progress("bootstrap cluster ready").await
    }

    async fn install_control_plane(&mut self) -> Result<()> {
        let bootstrap = self.paths.bootstrap_kubeconfig.clone();
        self.write_credentials().await?;
        self.apply(&bootstrap, &self.paths.credentials.display().to_string())
            .await?;

        self.progress("init capi in the bootstrap cluster").await?;
        let env = self.clusterctl_env(&bootstrap)?;
        self.runner
            .run(
                &Invocation::new("clusterctl")
                    .args(["init", "--infrastructure=vsphere"])
                    .envs(&env),
            )
            .await?;

        self.progress("waiting for the CAPV controller").await?;
        self.runner
            .run(
                &kubectl(&bootstrap)
                    .args(["wait", "--for=condition=Available", "--timeout=300s"])
                    .arg(format!("--namespace={CAPV_NAMESPACE}"))
                    .arg(CAPV_CONTROLLER),
            )
            .await?;

        self.progress("writing CAPV spec file out").await?;
        let manifest = self
            .runner
            .run(
                &Invocation::new("clusterctl")
                    .args([
                        "config".to_string(),
                        "cluster".to_string(),
                        self.spec.cluster_name.clone(),
                        "--infrastructure=vsphere".to_string(),
                        format!("--kubernetes-version={}", self.spec.kubernetes_version),
                        format!("--control-plane-machine-count={}", self.spec.control_plane_count),
                        format!("--worker-machine-count={}", self.spec.worker_count),
                    ])
                    .envs(&env),
            )
            .await?;
        write_file(&self.paths.base_manifest, manifest.stdout).await
    }

    async fn create_permanent(&mut self) -> Result<()> {
        let bootstrap = self.paths.bootstrap_kubeconfig.clone();
        let permanent = self.paths.kubeconfig.clone();
        let nodes = self.spec.node_count() as usize;
        let namespace = self.spec.namespace.clone();

        self.progress("creating the permanent cluster").await?;
        self.apply(&bootstrap, &self.paths.base_manifest.display().to_string())
            .await?;

        self.wait(
            &bootstrap,
            ResourceRef::namespaced(CAPI_API_VERSION, "Machine", &namespace),
            Condition::new("phase", "Running").times(nodes),
            self.waits.machines,
        )
        .await?;

        let secret = format!("{}-kubeconfig", self.spec.cluster_name);
        let kubeconfig = self
            .api
            .secret_data(&bootstrap, &namespace, &secret, "value")
            .await?;
        write_file(&permanent, kubeconfig).await?;
        if !self.deliverables.contains(&permanent) {
            self.deliverables.push(permanent.clone());
        }

        self.progress("applying the calico CNI").await?;
        self.apply(&permanent, CALICO_MANIFEST).await?;

        self.wait(
            &permanent,
            ResourceRef::cluster("v1", "Node"),
            Condition::new("Ready", "True").times(nodes),
            self.waits.nodes,
        )
        .await?;
        self.progress("permanent cluster nodes are ready").await
    }

    async fn pivot_control_plane(&mut self) -> Result<()> {
        let bootstrap = self.paths.bootstrap_kubeconfig.clone();
        let permanent = self.paths.kubeconfig.clone();
        let namespace = self.spec.namespace.clone();

        self.progress("preparing the permanent cluster for the move").await?;
        self.apply(&permanent, &self.paths.credentials.display().to_string())
            .await?;
        let created = self.api.create_namespace(&permanent, &namespace).await;
        tolerate_duplicate(self.bus.as_ref(), &format!("namespace {namespace}"), created).await?;

        self.progress("init capi in the permanent cluster").await?;
        let env = self.clusterctl_env(&permanent)?;
        self.runner
            .run(
                &Invocation::new("clusterctl")
                    .args(["init", "--infrastructure=vsphere"])
                    .envs(&env),
            )
            .await?;

        self.wait(
            &bootstrap,
            ResourceRef::namespaced(KCP_API_VERSION, "KubeadmControlPlane", &namespace),
            Condition::new("ready", "true"),
            self.waits.control_plane,
        )
        .await?;

        self.progress("moving cluster API objects to the permanent cluster").await?;
        self.runner
            .run(
                &Invocation::new("clusterctl")
                    .args([
                        "move".to_string(),
                        format!("--to-kubeconfig={}", permanent.display()),
                        format!("--namespace={namespace}"),
                    ])
                    .env("KUBECONFIG", bootstrap.display().to_string()),
            )
            .await?;
        self.progress("pivot complete").await
    }

    async fn install_addons(&mut self) -> Result<()> {
        let addons = &self.spec.addons;
        if !addons.observability.enable && !addons.solidfire.enable {
            return self.progress("no addons to install").await;
        }
        if addons.solidfire.enable {
            self.install_trident().await?;
        }
        if self.spec.addons.observability.enable {
            self.install_observability().await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kube_api::MockClusterApi;
    use crate::testing::{spec, RecordingRunner};
    use cake_common::events::LocalBus;
    use serde_json::json;

    fn fast_waits() -> CapvWaits {
        CapvWaits {
            machines: Duration::from_secs(2),
            nodes: Duration::from_secs(2),
            control_plane: Duration::from_secs(2),
            interval: Duration::from_millis(5),
        }
    }

    fn engine(
        runner: Arc<RecordingRunner>,
        api: MockClusterApi,
        dir: &Path,
    ) -> (CapvEngine, LocalBus) {
        let bus = LocalBus::new();
        let engine = CapvEngine::new(spec(), runner, Arc::new(api), Arc::new(bus.clone()))
            .unwrap()
            .with_work_dir(dir)
            .with_waits(fast_waits());
        (engine, bus)
    }

    #[test]
    fn template_names_drop_directory_and_extension() {
        assert_eq!(template_name("/ovas/ubuntu-1804-kube.ova"), "ubuntu-1804-kube");
        assert_eq!(template_name("capv-haproxy"), "capv-haproxy");
    }

    #[test]
    fn addons_add_their_tools() {
        let dir = tempfile::tempdir().unwrap();
        let mut s = spec();
        s.addons.solidfire.enable = true;
        let engine = CapvEngine::new(
            s,
            Arc::new(RecordingRunner::new()),
            Arc::new(MockClusterApi::new()),
            Arc::new(LocalBus::new()),
        )
        .unwrap()
        .with_work_dir(dir.path());
        assert_eq!(
            engine.required_tools(),
            vec!["kind", "clusterctl", "kubectl", "docker", "tridentctl"]
        );
    }

    #[tokio::test]
    async fn story_bootstrap_and_control_plane_install() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(
            RecordingRunner::new()
                .stdout("kind get kubeconfig", "apiVersion: v1\nkind: Config\n")
                .stdout("clusterctl config cluster", "kind: Cluster\n"),
        );
        let (mut engine, _bus) = engine(runner.clone(), MockClusterApi::new(), dir.path());

        engine.create_bootstrap().await.unwrap();
        engine.install_control_plane().await.unwrap();

        let paths = engine.paths().clone();
        assert_eq!(
            std::fs::read_to_string(&paths.bootstrap_kubeconfig).unwrap(),
            "apiVersion: v1\nkind: Config\n"
        );
        assert_eq!(
            std::fs::read_to_string(&paths.base_manifest).unwrap(),
            "kind: Cluster\n"
        );
        let secret = std::fs::read_to_string(&paths.credentials).unwrap();
        assert!(secret.contains(&format!("password: {}", STANDARD.encode("secret"))));

        let init = runner.find("clusterctl init").unwrap();
        assert_eq!(init.envs["VSPHERE_TEMPLATE"], "ubuntu-1804-kube");
        assert_eq!(init.envs["VSPHERE_HAPROXY_TEMPLATE"], "capv-haproxy");
        assert_eq!(init.envs["VSPHERE_SSH_AUTHORIZED_KEY"], "ssh-rsa AAAA operator@cake");
        assert_eq!(
            init.envs["KUBECONFIG"],
            paths.bootstrap_kubeconfig.display().to_string()
        );

        let lines = runner.lines();
        assert_eq!(lines[0], "kind create cluster --name=mgmt-bootstrap");
        assert!(lines.contains(
            &"clusterctl config cluster mgmt --infrastructure=vsphere --kubernetes-version=v1.17.3 \
              --control-plane-machine-count=1 --worker-machine-count=2"
                .to_string()
        ));
    }

    #[tokio::test]
    async fn story_permanent_cluster_waits_then_extracts_kubeconfig() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(RecordingRunner::new());
        let mut api = MockClusterApi::new();
        api.expect_list().returning(|_, resource| {
            Ok(match resource.kind.as_str() {
                "Machine" => json!({ "items": [
                    { "status": { "phase": "Running" } },
                    { "status": { "phase": "Running" } },
                    { "status": { "phase": "Running" } }
                ]}),
                _ => json!({ "items": [
                    { "status": { "conditions": [{ "type": "Ready", "status": "True" }] } },
                    { "status": { "conditions": [{ "type": "Ready", "status": "True" }] } },
                    { "status": { "conditions": [{ "type": "Ready", "status": "True" }] } }
                ]}),
            })
        });
        api.expect_secret_data()
            .withf(|_, ns, name, key| ns == "default" && name == "mgmt-kubeconfig" && key == "value")
            .times(1)
            .returning(|_, _, _, _| Ok(b"kind: Config\n".to_vec()));
        let (mut engine, _bus) = engine(runner.clone(), api, dir.path());

        engine.create_permanent().await.unwrap();

        let kubeconfig = dir.path().join("kubeconfig");
        assert_eq!(std::fs::read_to_string(&kubeconfig).unwrap(), "kind: Config\n");
        assert_eq!(engine.deliverables(), vec![kubeconfig]);
        assert!(runner
            .lines()
            .contains(&format!("kubectl apply --filename={CALICO_MANIFEST}")));
    }

    #[tokio::test]
    async fn machines_that_never_run_time_out() {
        let dir = tempfile::tempdir().unwrap();
        let mut api = MockClusterApi::new();
        api.expect_list()
            .returning(|_, _| Ok(json!({ "items": [{ "status": { "phase": "Provisioning" } }] })));
        api.expect_secret_data().never();
        let (engine, _bus) = engine(Arc::new(RecordingRunner::new()), api, dir.path());
        let mut engine = engine.with_waits(CapvWaits {
            machines: Duration::from_millis(30),
            ..fast_waits()
        });

        let err = engine.create_permanent().await.unwrap_err();
        assert!(matches!(err, Error::Timeout { .. }));
        assert!(err.to_string().contains("phase=Running"));
    }

    #[tokio::test]
    async fn pivot_tolerates_existing_namespace() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(RecordingRunner::new());
        let mut api = MockClusterApi::new();
        api.expect_create_namespace().returning(|_, _| {
            Err(Error::external_tool("kubectl", "exit status: 1", "namespaces \"default\" already exists"))
        });
        api.expect_list()
            .returning(|_, _| Ok(json!({ "items": [{ "status": { "ready": true } }] })));
        let (mut engine, bus) = engine(runner.clone(), api, dir.path());
        let mut rx = bus.subscribe().await.unwrap();

        engine.pivot_control_plane().await.unwrap();

        let lines = runner.lines();
        let last = lines.last().unwrap();
        assert!(last.starts_with("clusterctl move --to-kubeconfig="));
        let mut warned = false;
        while let Some(event) = rx.try_recv() {
            warned |= event.msg == "namespace default already exists, continuing";
        }
        assert!(warned);
    }

    #[tokio::test]
    async fn no_addons_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(RecordingRunner::new());
        let (mut engine, bus) = engine(runner.clone(), MockClusterApi::new(), dir.path());
        let mut rx = bus.subscribe().await.unwrap();

        engine.install_addons().await.unwrap();
        assert_eq!(rx.try_recv().unwrap().msg, "no addons to install");
        assert!(runner.lines().is_empty());
    }
}
