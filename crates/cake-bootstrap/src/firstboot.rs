//! First-boot scripts injected through cloud-init.
//!
//! The bootstrap node's script starts the three socat listeners the control
//! channel talks to; every node's script installs the engine prerequisites.
//! The bootstrap node touches [`PREREQUISITES_MARKER`] once everything else
//! has run.

use minijinja::{context, Environment};

use cake_common::config::EngineType;
use cake_common::{
    Error, Result, COMMAND_PORT, CONFIG_UPLOAD_PORT, PREREQUISITES_MARKER, REMOTE_CONFIG,
    REMOTE_EXECUTABLE, UPLOAD_PORT,
};

const FIRSTBOOT_TEMPLATE: &str = include_str!("../templates/firstboot.sh");

/// clusterctl release installed for CAPV
pub const CLUSTERCTL_VERSION: &str = "v0.3.3";

/// kind release installed for CAPV
pub const KIND_VERSION: &str = "v0.7.0";

/// helm release installed on the RKE bootstrap node
pub const HELM_VERSION: &str = "v3.2.1";

/// rke binary install
pub const RKE_BINARY_INSTALL: &str = "wget -O /usr/local/bin/rke https://github.com/rancher/rke/releases/download/v1.1.0/rke_linux-amd64 && chmod +x /usr/local/bin/rke";

const RKE_KERNEL_MODULES: &str = "br_netfilter ip6_udp_tunnel ip_set ip_set_hash_ip ip_set_hash_net iptable_filter iptable_nat iptable_mangle iptable_raw nf_conntrack_netlink nf_conntrack nf_conntrack_ipv4 nf_defrag_ipv4 nf_nat nf_nat_ipv4 nf_nat_masquerade_ipv4 nfnetlink udp_tunnel veth vxlan x_tables xt_addrtype xt_conntrack xt_comment xt_mark xt_multiport xt_nat xt_recent xt_set xt_statistic xt_tcpudp";

/// Tools the CAPV engine needs on the bootstrap VM
pub fn capv_prerequisites() -> String {
    format!(
        r#"wget -O /usr/local/bin/clusterctl https://github.com/kubernetes-sigs/cluster-api/releases/download/{clusterctl}/clusterctl-$(uname | tr '[:upper:]' '[:lower:]')-amd64
chmod +x /usr/local/bin/clusterctl
wget -O /usr/local/bin/kind https://kind.sigs.k8s.io/dl/{kind}/kind-$(uname)-amd64
chmod +x /usr/local/bin/kind
curl https://get.docker.com/ | bash"#,
        clusterctl = CLUSTERCTL_VERSION,
        kind = KIND_VERSION,
    )
}

/// Docker and kernel modules every RKE node needs; `os_user` joins the
/// docker group so rke can reach the socket over SSH
pub fn rke_prerequisites(os_user: &str) -> String {
    format!(
        r#"curl https://releases.rancher.com/install-docker/18.09.2.sh | sh
for module in {modules};
do
	if ! lsmod | grep -q $module; then
		echo "module $module is not present, installing now...";
		modprobe $module
	fi;
done

echo "net.bridge.bridge-nf-call-iptables=1" >> /etc/sysctl.conf
usermod -aG docker {user}"#,
        modules = RKE_KERNEL_MODULES,
        user = os_user,
    )
}

/// Prerequisites for `engine`
pub fn prerequisites_for(engine: EngineType, os_user: &str) -> String {
    match engine {
        EngineType::Capv => capv_prerequisites(),
        EngineType::Rke => rke_prerequisites(os_user),
    }
}

/// Install helm 3 from the upstream script
pub fn helm_install() -> String {
    format!(
        "curl -fsSL -o get_helm.sh https://raw.githubusercontent.com/helm/helm/master/scripts/get-helm-3\nchmod 700 get_helm.sh\n./get_helm.sh --version {}",
        HELM_VERSION
    )
}

/// Write `private_key` to root's `~/.ssh/id_rsa` with owner-only permissions
pub fn private_key_to_disk(private_key: &str) -> String {
    format!(
        "umask 133; mkdir -p ~/.ssh && umask 177; touch ~/.ssh/id_rsa && cat <<'CAKEKEY' > ~/.ssh/id_rsa\n{}\nCAKEKEY",
        private_key.trim_end()
    )
}

/// A first-boot script under construction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirstBootScript {
    listeners: bool,
    prerequisites: String,
    extra_lines: Vec<String>,
}

impl FirstBootScript {
    /// Script for the node that receives the engine: starts the control
    /// channel listeners, then installs `prerequisites`
    pub fn bootstrap(prerequisites: impl Into<String>) -> Self {
        Self {
            listeners: true,
            prerequisites: prerequisites.into(),
            extra_lines: Vec::new(),
        }
    }

    /// Script for any other node: prerequisites only
    pub fn node(prerequisites: impl Into<String>) -> Self {
        Self {
            listeners: false,
            prerequisites: prerequisites.into(),
            extra_lines: Vec::new(),
        }
    }

    /// Append commands that run after the prerequisites
    pub fn lines<I, S>(mut self, lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.extra_lines.extend(lines.into_iter().map(Into::into));
        self
    }

    /// Whether this script starts the control channel listeners
    pub fn has_listeners(&self) -> bool {
        self.listeners
    }

    /// Render to shell text
    pub fn render(&self) -> Result<String> {
        let mut env = Environment::new();
        env.add_template("firstboot.sh", FIRSTBOOT_TEMPLATE)
            .map_err(|e| Error::internal_with_context("firstboot", e.to_string()))?;
        let template = env
            .get_template("firstboot.sh")
            .map_err(|e| Error::internal_with_context("firstboot", e.to_string()))?;
        template
            .render(context! {
                listeners => self.listeners,
                upload_port => UPLOAD_PORT,
                config_port => CONFIG_UPLOAD_PORT,
                command_port => COMMAND_PORT,
                executable => REMOTE_EXECUTABLE,
                config_path => REMOTE_CONFIG,
                prerequisites => &self.prerequisites,
                extra_lines => &self.extra_lines,
                ready_marker => PREREQUISITES_MARKER,
            })
            .map_err(|e| Error::internal_with_context("firstboot", e.to_string()))
    }
}
