//! Test doubles shared by the engine tests

use async_trait::async_trait;
use parking_lot::Mutex;

use cake_common::command::{CommandOutput, CommandRunner, Invocation};
use cake_common::config::ClusterSpec;
use cake_common::{Error, Result};

pub(crate) const SPEC: &str = r#"
EngineType: CAPV
ClusterName: mgmt
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
  Folder: cake/mgmt
  OVA:
    BootstrapTemplate: /ovas/ubuntu-1804.ova
    NodeTemplate: /ovas/ubuntu-1804-kube.ova
    LoadbalancerTemplate: /ovas/capv-haproxy.ova
"#;

pub(crate) fn spec() -> ClusterSpec {
    ClusterSpec::from_yaml("cake.yaml", SPEC).unwrap()
}

/// Records every invocation and answers from a script keyed by command-line
/// prefix
#[derive(Default)]
pub(crate) struct RecordingRunner {
    pub calls: Mutex<Vec<Invocation>>,
    stdout: Vec<(String, String)>,
    failures: Vec<(String, String)>,
}

impl RecordingRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer commands starting with `prefix` with `out`
    pub fn stdout(mut self, prefix: &str, out: &str) -> Self {
        self.stdout.push((prefix.to_string(), out.to_string()));
        self
    }

    /// Fail commands starting with `prefix` with `stderr`
    pub fn fail(mut self, prefix: &str, stderr: &str) -> Self {
        self.failures.push((prefix.to_string(), stderr.to_string()));
        self
    }

    /// Rendered command lines, in call order
    pub fn lines(&self) -> Vec<String> {
        self.calls.lock().iter().map(Invocation::display).collect()
    }

    pub fn find(&self, prefix: &str) -> Option<Invocation> {
        self.calls
            .lock()
            .iter()
            .find(|inv| inv.display().starts_with(prefix))
            .cloned()
    }
}

fn lookup<'a>(script: &'a [(String, String)], line: &str) -> Option<&'a str> {
    script
        .iter()
        .find(|(prefix, _)| line.starts_with(prefix.as_str()))
        .map(|(_, value)| value.as_str())
}

#[async_trait]
impl CommandRunner for RecordingRunner {
    async fn run(&self, invocation: &Invocation) -> Result<CommandOutput> {
        self.calls.lock().push(invocation.clone());
        let line = invocation.display();
        if let Some(stderr) = lookup(&self.failures, &line) {
            return Err(Error::external_tool(
                &invocation.program,
                "exit status: 1",
                stderr,
            ));
        }
        Ok(CommandOutput {
            stdout: lookup(&self.stdout, &line).unwrap_or_default().to_string(),
            stderr: String::new(),
        })
    }
}
