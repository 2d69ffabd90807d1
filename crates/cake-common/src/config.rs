//! Cluster specification loaded from the YAML document produced by the
//! configuration wizard.
//!
//! Keys are PascalCase. Fields without a default are required; a document
//! missing one fails at load time rather than partway through a run.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Default location of the spec file, relative to the home directory
pub const DEFAULT_SPEC_FILE: &str = ".cake.yaml";

/// Default port of the HTTP progress surface
pub const DEFAULT_PROGRESS_PORT: u16 = 8081;

/// Name segment marking control plane nodes
pub const CONTROL_PLANE_NODE: &str = "controlplane";

/// Name segment marking worker nodes
pub const WORKER_NODE: &str = "worker";

/// `<cluster>-<role>-<index>`, e.g. `mgmt-controlplane-1`
pub fn node_name(cluster: &str, role: &str, index: u32) -> String {
    format!("{cluster}-{role}-{index}")
}

/// Which lifecycle engine builds the cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EngineType {
    /// Cluster API with the vSphere infrastructure provider
    #[serde(rename = "CAPV")]
    Capv,
    /// Rancher Kubernetes Engine driven through the `rke` CLI
    #[serde(rename = "RKE")]
    Rke,
}

impl EngineType {
    /// Value passed to `--deployment-type`
    pub fn as_flag(&self) -> &'static str {
        match self {
            EngineType::Capv => "capv",
            EngineType::Rke => "rke",
        }
    }
}

impl fmt::Display for EngineType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_flag())
    }
}

impl FromStr for EngineType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "capv" => Ok(EngineType::Capv),
            "rke" => Ok(EngineType::Rke),
            _ => Err(format!(
                "invalid deployment type '{}', must be 'capv' or 'rke'",
                s
            )),
        }
    }
}

/// Which virtualization platform hosts the VMs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ProviderType {
    /// VMware vSphere
    #[default]
    #[serde(rename = "VSPHERE")]
    Vsphere,
}

/// SSH identity installed on every VM
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SshSpec {
    /// OS user created by cloud-init
    pub username: String,
    /// Public keys authorized for that user
    #[serde(default)]
    pub authorized_keys: Vec<String>,
    /// Private key path used by engines that SSH into nodes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_path: Option<String>,
}

/// Template images imported before cloning
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "PascalCase")]
pub struct OvaSpec {
    /// Image for the bootstrap VM
    pub bootstrap_template: String,
    /// Image for cluster nodes
    #[serde(default)]
    pub node_template: String,
    /// Image for the API load balancer
    #[serde(default)]
    pub loadbalancer_template: String,
}

impl OvaSpec {
    /// Non-empty template paths, in declaration order
    pub fn paths(&self) -> Vec<String> {
        [
            &self.bootstrap_template,
            &self.node_template,
            &self.loadbalancer_template,
        ]
        .into_iter()
        .filter(|p| !p.is_empty())
        .cloned()
        .collect()
    }
}

/// vSphere connection and placement
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct VsphereSpec {
    /// vCenter endpoint
    #[serde(rename = "URL")]
    pub url: String,
    /// vCenter user
    pub username: String,
    /// vCenter password
    pub password: String,
    /// Datacenter name
    pub datacenter: String,
    /// Resource pool name or path
    pub resource_pool: String,
    /// Datastore name
    pub datastore: String,
    /// Network attached to every VM
    pub management_network: String,
    /// Optional second network for storage traffic
    #[serde(default)]
    pub storage_network: String,
    /// Folder for management cluster VMs; defaults to `cake/mgmt`
    #[serde(default)]
    pub folder: String,
    /// Template images
    #[serde(rename = "OVA")]
    pub ova: OvaSpec,
}

/// Observability addon
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "PascalCase", default)]
pub struct ObservabilitySpec {
    /// Install the addon
    pub enable: bool,
    /// Location of the chart archive
    pub archive_location: String,
}

/// SolidFire/Trident storage addon
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "PascalCase", default)]
pub struct SolidfireSpec {
    /// Install the addon
    pub enable: bool,
    /// Management virtual IP
    #[serde(rename = "MVIP")]
    pub mvip: String,
    /// Storage virtual IP
    #[serde(rename = "SVIP")]
    pub svip: String,
    /// Array user
    pub user: String,
    /// Array password
    pub password: String,
}

/// Optional addons installed in the last phase
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "PascalCase", default)]
pub struct AddonsSpec {
    /// Observability stack
    pub observability: ObservabilitySpec,
    /// SolidFire storage
    pub solidfire: SolidfireSpec,
}

/// Where progress events travel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "PascalCase", default)]
pub struct EventBusSpec {
    /// Connect to a broker at this address instead of an in-process bus
    pub address: Option<String>,
    /// Host a broker on this address for other processes
    pub serve: Option<String>,
}

/// One provisioned node and the address it reported
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct NodeAddress {
    /// VM name
    pub name: String,
    /// IPv4 address learned from the hypervisor
    pub address: String,
}

/// The full cluster specification
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ClusterSpec {
    /// Virtualization platform
    #[serde(default)]
    pub provider_type: ProviderType,
    /// Lifecycle engine
    pub engine_type: EngineType,
    /// Cluster name
    pub cluster_name: String,
    /// Number of control-plane nodes
    pub control_plane_count: u32,
    /// Number of worker nodes
    pub worker_count: u32,
    /// Kubernetes version, e.g. v1.17.3
    pub kubernetes_version: String,
    /// Pod network CIDR
    #[serde(default)]
    pub kubernetes_pod_cidr: String,
    /// Service network CIDR
    #[serde(default)]
    pub kubernetes_service_cidr: String,
    /// Namespace for CAPI objects
    #[serde(default = "default_namespace")]
    pub namespace: String,
    /// SSH identity
    #[serde(rename = "SSH")]
    pub ssh: SshSpec,
    /// vSphere connection and placement
    pub provider: VsphereSpec,
    /// Optional addons
    #[serde(default)]
    pub addons: AddonsSpec,
    /// File the run's log is written to and served from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_file: Option<PathBuf>,
    /// Directory the initiator downloads logs and deliverables into
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_dir: Option<PathBuf>,
    /// Event bus transport
    #[serde(default)]
    pub event_bus: EventBusSpec,
    /// Port of the HTTP progress surface
    #[serde(default = "default_progress_port")]
    pub progress_port: u16,
    /// Rancher hostname (RKE)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    /// Where the RKE cluster.yml is written (RKE)
    #[serde(
        default,
        rename = "RKEConfigPath",
        skip_serializing_if = "Option::is_none"
    )]
    pub rke_config_path: Option<PathBuf>,
    /// Ordered node inventory, filled in by the provider (RKE)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub nodes: Vec<NodeAddress>,
    /// Address of the node that runs the engine
    #[serde(default, rename = "BootstrapIP", skip_serializing_if = "Option::is_none")]
    pub bootstrap_ip: Option<String>,
}

fn default_namespace() -> String {
    "default".to_string()
}

fn default_progress_port() -> u16 {
    DEFAULT_PROGRESS_PORT
}

impl ClusterSpec {
    /// Parse and validate a spec document
    pub fn from_yaml(source_path: &str, contents: &str) -> Result<Self> {
        let spec: ClusterSpec = serde_yaml::from_str(contents)
            .map_err(|e| Error::config(source_path, e.to_string()))?;
        spec.validate()?;
        Ok(spec)
    }

    /// Read, parse and validate the spec file at `path`
    pub fn load(path: &Path) -> Result<Self> {
        let display = path.display().to_string();
        let contents = std::fs::read_to_string(path)
            .map_err(|e| Error::config(&display, format!("failed to read: {e}")))?;
        Self::from_yaml(&display, &contents)
    }

    /// Serialize for upload to the bootstrap VM
    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Reject values that parse but cannot produce a cluster
    pub fn validate(&self) -> Result<()> {
        let cluster = &self.cluster_name;
        if cluster.trim().is_empty() {
            return Err(Error::validation("ClusterName must not be empty"));
        }
        if self.control_plane_count == 0 {
            return Err(Error::validation_for(
                cluster,
                "ControlPlaneCount must be at least 1",
            ));
        }
        if self.ssh.username.trim().is_empty() {
            return Err(Error::validation_for(cluster, "SSH.Username must not be empty"));
        }
        if self.provider.ova.bootstrap_template.is_empty() {
            return Err(Error::validation_for(
                cluster,
                "Provider.OVA.BootstrapTemplate must be set",
            ));
        }
        if self.engine_type == EngineType::Rke && self.provider.ova.node_template.is_empty() {
            return Err(Error::validation_for(
                cluster,
                "Provider.OVA.NodeTemplate is required for RKE",
            ));
        }
        Ok(())
    }

    /// Total VMs in the permanent cluster
    pub fn node_count(&self) -> u32 {
        self.control_plane_count + self.worker_count
    }

    /// Per-cluster working directory, `~/.cake/<cluster>`
    pub fn work_dir(&self) -> Result<PathBuf> {
        let home = dirs::home_dir()
            .ok_or_else(|| Error::internal_with_context("config", "could not determine home directory"))?;
        Ok(home.join(".cake").join(&self.cluster_name))
    }
}

/// `~/.cake.yaml`
pub fn default_spec_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("/root"))
        .join(DEFAULT_SPEC_FILE)
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) const SAMPLE: &str = r#"
ProviderType: VSPHERE
EngineType: CAPV
ClusterName: capv-mgmt
ControlPlaneCount: 1
WorkerCount: 2
KubernetesVersion: v1.17.3
SSH:
  Username: ubuntu
  AuthorizedKeys:
    - ssh-rsa AAAA test@cake
Provider:
  URL: vcenter.example.com
  Username: administrator@vsphere.local
  Password: secret
  Datacenter: DC0
  ResourcePool: Resources
  Datastore: datastore1
  ManagementNetwork: VM Network
  OVA:
    BootstrapTemplate: /ovas/ubuntu-bootstrap.ova
    NodeTemplate: https://example.com/ubuntu-1804-kube-v1.17.3.ova
LogFile: /tmp/cake.log
"#;

    #[test]
    fn story_wizard_output_loads_with_defaults() {
        let spec = ClusterSpec::from_yaml("cake.yaml", SAMPLE).unwrap();
        assert_eq!(spec.engine_type, EngineType::Capv);
        assert_eq!(spec.provider_type, ProviderType::Vsphere);
        assert_eq!(spec.node_count(), 3);
        assert_eq!(spec.namespace, "default");
        assert_eq!(spec.progress_port, DEFAULT_PROGRESS_PORT);
        assert_eq!(spec.provider.url, "vcenter.example.com");
        assert_eq!(spec.provider.ova.paths().len(), 2);
        assert!(spec.nodes.is_empty());
        assert!(!spec.addons.solidfire.enable);
    }

    #[test]
    fn story_missing_required_field_fails_at_load() {
        let without_version = SAMPLE.replace("KubernetesVersion: v1.17.3\n", "");
        let err = ClusterSpec::from_yaml("cake.yaml", &without_version).unwrap_err();
        match err {
            Error::Config {
                source_path,
                message,
            } => {
                assert_eq!(source_path, "cake.yaml");
                assert!(message.contains("KubernetesVersion"));
            }
            other => panic!("expected config error, got {other:?}"),
        }
    }

    #[test]
    fn zero_control_plane_nodes_rejected() {
        let doc = SAMPLE.replace("ControlPlaneCount: 1", "ControlPlaneCount: 0");
        let err = ClusterSpec::from_yaml("cake.yaml", &doc).unwrap_err();
        assert!(err.to_string().contains("ControlPlaneCount"));
    }

    #[test]
    fn rke_requires_node_template() {
        let doc = SAMPLE
            .replace("EngineType: CAPV", "EngineType: RKE")
            .replace(
                "    NodeTemplate: https://example.com/ubuntu-1804-kube-v1.17.3.ova\n",
                "",
            );
        let err = ClusterSpec::from_yaml("cake.yaml", &doc).unwrap_err();
        assert!(err.to_string().contains("NodeTemplate"));
    }

    #[test]
    fn unknown_engine_type_is_a_load_error() {
        let doc = SAMPLE.replace("EngineType: CAPV", "EngineType: KVM");
        assert!(matches!(
            ClusterSpec::from_yaml("cake.yaml", &doc),
            Err(Error::Config { .. })
        ));
    }

    #[test]
    fn serialized_spec_round_trips_node_inventory() {
        let mut spec = ClusterSpec::from_yaml("cake.yaml", SAMPLE).unwrap();
        spec.nodes = vec![
            NodeAddress {
                name: "capv-mgmt-controlplane-1".into(),
                address: "10.0.0.10".into(),
            },
            NodeAddress {
                name: "capv-mgmt-worker-1".into(),
                address: "10.0.0.11".into(),
            },
        ];
        spec.bootstrap_ip = Some("10.0.0.10".into());

        let yaml = spec.to_yaml().unwrap();
        assert!(yaml.contains("BootstrapIP: 10.0.0.10"));
        let back = ClusterSpec::from_yaml("uploaded", &yaml).unwrap();
        assert_eq!(back.nodes, spec.nodes);
    }

    #[test]
    fn deployment_type_flag_parsing() {
        assert_eq!("CAPV".parse::<EngineType>().unwrap(), EngineType::Capv);
        assert_eq!("rke".parse::<EngineType>().unwrap(), EngineType::Rke);
        assert!("kvm".parse::<EngineType>().is_err());
        assert_eq!(EngineType::Rke.as_flag(), "rke");
    }
}
