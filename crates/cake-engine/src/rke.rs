//! RKE engine driving the `rke` CLI.
//!
//! The provider has already cloned and addressed every node. `rke up` turns
//! them into a cluster, and the pivot installs Rancher on top so it can manage
//! the cluster from then on.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde_yaml::{Mapping, Value};
use tracing::info;

use cake_common::command::{missing_tools, CommandRunner, Invocation};
use cake_common::config::{ClusterSpec, CONTROL_PLANE_NODE};
use cake_common::events::{EventBus, StatusEvent};
use cake_common::{Error, Result};

use crate::engine::ClusterEngine;
use crate::exec::{helm, kubectl, tolerate_duplicate, tolerate_failure, write_file};
use crate::roles::{assign_roles, NodeRole, RoleAssignment};

const BASE_CLUSTER_YML: &str = include_str!("../templates/cluster.yml");

/// Where cluster.yml goes when the spec does not say
pub const DEFAULT_CONFIG_PATH: &str = "/rke-config.yml";
/// Rancher hostname when the spec does not say
pub const DEFAULT_HOSTNAME: &str = "my.rancher.org";
/// Private key the provider installs on the bootstrap node
pub const DEFAULT_SSH_KEY_PATH: &str = "/root/.ssh/id_rsa";

const CERT_MANAGER_CRDS: &str = "https://raw.githubusercontent.com/jetstack/cert-manager/release-0.12/deploy/manifests/00-crds.yaml";
const CERT_MANAGER_VERSION: &str = "v0.12.0";
const RANCHER_REPO: &str = "https://releases.rancher.com/server-charts/stable";
const JETSTACK_REPO: &str = "https://charts.jetstack.io";
const SSH_PORT: &str = "22";
const DOCKER_SOCKET: &str = "/var/run/docker.sock";
const RKE_UP_TIMEOUT: Duration = Duration::from_secs(45 * 60);

/// Programs every RKE run needs
pub const RKE_TOOLS: [&str; 3] = ["rke", "helm", "kubectl"];

/// One `nodes:` entry of cluster.yml
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RkeNode {
    /// SSH address
    pub address: String,
    /// SSH port
    pub port: String,
    /// Node name inside Kubernetes
    pub hostname_override: String,
    /// SSH user
    pub user: String,
    /// Roles on this node
    pub role: Vec<NodeRole>,
    /// Docker socket on the node
    pub docker_socket: String,
    /// Private key for `user`
    pub ssh_key_path: String,
}

/// Fill the base cluster.yml with `assignment` and the run's identity
pub fn render_cluster_yml(
    spec: &ClusterSpec,
    assignment: &RoleAssignment,
    ssh_key_path: &str,
) -> Result<String> {
    let mut doc: Mapping = serde_yaml::from_str(BASE_CLUSTER_YML)?;

    let nodes: Vec<RkeNode> = assignment
        .nodes
        .iter()
        .map(|assigned| RkeNode {
            address: assigned.node.address.clone(),
            port: SSH_PORT.to_string(),
            hostname_override: assigned.node.name.clone(),
            user: spec.ssh.username.clone(),
            role: assigned.roles.clone(),
            docker_socket: DOCKER_SOCKET.to_string(),
            ssh_key_path: ssh_key_path.to_string(),
        })
        .collect();

    doc.insert("nodes".into(), serde_yaml::to_value(nodes)?);
    doc.insert("ssh_key_path".into(), Value::from(ssh_key_path));
    doc.insert("cluster_name".into(), Value::from(spec.cluster_name.as_str()));
    Ok(serde_yaml::to_string(&doc)?)
}

/// Kubeconfig `rke up` writes next to `config`: `kube_config_<basename>`
pub fn kubeconfig_path(config: &Path) -> PathBuf {
    let name = config
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    config.with_file_name(format!("kube_config_{name}"))
}

/// The RKE engine
pub struct RkeEngine {
    spec: ClusterSpec,
    runner: Arc<dyn CommandRunner>,
    bus: Arc<dyn EventBus>,
    config_path: PathBuf,
    deliverables: Vec<PathBuf>,
}

impl RkeEngine {
    /// An engine for `spec`
    pub fn new(spec: ClusterSpec, runner: Arc<dyn CommandRunner>, bus: Arc<dyn EventBus>) -> Self {
        let config_path = spec
            .rke_config_path
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));
        Self {
            spec,
            runner,
            bus,
            config_path,
            deliverables: Vec::new(),
        }
    }

    /// Where cluster.yml is written
    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    fn hostname(&self) -> &str {
        self.spec.hostname.as_deref().unwrap_or(DEFAULT_HOSTNAME)
    }

    fn ssh_key_path(&self) -> &str {
        self.spec
            .ssh
            .key_path
            .as_deref()
            .unwrap_or(DEFAULT_SSH_KEY_PATH)
    }

    fn deliver(&mut self, path: PathBuf) {
        if !self.deliverables.contains(&path) {
            self.deliverables.push(path);
        }
    }

    async fn progress(&self, msg: impl Into<String>) -> Result<()> {
        let msg = msg.into();
        info!(cluster = %self.spec.cluster_name, "{}", msg);
        self.bus.publish(StatusEvent::progress(msg)).await
    }

    async fn rollout(&self, kubeconfig: &Path, namespace: &str, deployment: &str) -> Result<()> {
        self.runner
            .run(&kubectl(kubeconfig).args([
                "rollout".to_string(),
                "status".to_string(),
                format!("deploy/{deployment}"),
                format!("--namespace={namespace}"),
            ]))
            .await?;
        Ok(())
    }
}

#[async_trait]
impl ClusterEngine for RkeEngine {
    fn name(&self) -> String {
        "rke".to_string()
    }

    fn missing_tools(&self) -> Vec<String> {
        missing_tools(&RKE_TOOLS)
    }

    fn events(&self) -> Arc<dyn EventBus> {
        self.bus.clone()
    }

    fn deliverables(&self) -> Vec<PathBuf> {
        self.deliverables.clone()
    }

    async fn create_bootstrap(&mut self) -> Result<()> {
        self.progress("rke needs no bootstrap cluster").await
    }

    async fn install_control_plane(&mut self) -> Result<()> {
        self.progress("rke installs the control plane with the cluster").await
    }

    async fn create_permanent(&mut self) -> Result<()> {
        let cluster = self.spec.cluster_name.clone();
        if self.spec.nodes.is_empty() {
            return Err(Error::validation_for(
                &cluster,
                "Nodes inventory is empty; the provider must record every node address",
            ));
        }

        let prefix = format!("{cluster}-{CONTROL_PLANE_NODE}");
        let assignment = assign_roles(&self.spec.nodes, |name| name.starts_with(&prefix));
        for warning in &assignment.warnings {
            self.bus.publish(StatusEvent::warning(warning.clone())).await?;
        }

        let cluster_yml = render_cluster_yml(&self.spec, &assignment, self.ssh_key_path())?;
        write_file(&self.config_path, cluster_yml).await?;
        self.deliver(self.config_path.clone());

        self.progress(format!(
            "running rke up for {} nodes ({} etcd members)",
            assignment.nodes.len(),
            assignment.consensus_members()
        ))
        .await?;
        self.runner
            .run(
                &Invocation::new("rke")
                    .arg("up")
                    .arg(format!("--config={}", self.config_path.display()))
                    .timeout(RKE_UP_TIMEOUT),
            )
            .await?;
        self.progress("rke cluster is up").await
    }

    async fn pivot_control_plane(&mut self) -> Result<()> {
        let kubeconfig = kubeconfig_path(&self.config_path);
        let bus = self.bus.clone();

        self.progress("adding helm repositories").await?;
        self.runner
            .run(&helm(&kubeconfig, ["repo", "add", "rancher-stable", RANCHER_REPO]))
            .await?;
        self.runner
            .run(&helm(&kubeconfig, ["repo", "add", "jetstack", JETSTACK_REPO]))
            .await?;

        for namespace in ["cattle-system", "cert-manager"] {
            let created = self
                .runner
                .run(&kubectl(&kubeconfig).args(["create", "namespace", namespace]))
                .await;
            tolerate_duplicate(bus.as_ref(), &format!("namespace {namespace}"), created).await?;
        }

        self.progress("installing cert-manager").await?;
        self.runner
            .run(&kubectl(&kubeconfig).args(["apply", "-f", CERT_MANAGER_CRDS]))
            .await?;
        self.runner
            .run(&helm(&kubeconfig, ["repo", "update"]))
            .await?;
        self.runner
            .run(&helm(
                &kubeconfig,
                [
                    "install".to_string(),
                    "cert-manager".to_string(),
                    "jetstack/cert-manager".to_string(),
                    "--namespace=cert-manager".to_string(),
                    format!("--version={CERT_MANAGER_VERSION}"),
                ],
            ))
            .await?;
        self.rollout(&kubeconfig, "cert-manager", "cert-manager").await?;

        self.progress("installing rancher").await?;
        let installed = self
            .runner
            .run(&helm(
                &kubeconfig,
                [
                    "install".to_string(),
                    "rancher".to_string(),
                    "rancher-stable/rancher".to_string(),
                    "--namespace=cattle-system".to_string(),
                    "--set".to_string(),
                    format!("hostname={}", self.hostname()),
                ],
            ))
            .await;
        tolerate_failure(bus.as_ref(), "rancher install", installed).await?;

        self.rollout(&kubeconfig, "cattle-system", "rancher").await?;
        self.rollout(&kubeconfig, "ingress-nginx", "default-http-backend")
            .await?;

        self.deliver(kubeconfig);
        self.progress(format!("rancher is available at https://{}", self.hostname()))
            .await
    }

    async fn install_addons(&mut self) -> Result<()> {
        self.progress("no addons to install").await
    }
}
