//! External program execution
//!
//! Cluster tools (kind, clusterctl, kubectl, helm, rke, govc) are driven as
//! subprocesses: pass env and args, capture stdout/stderr and exit status,
//! treat non-zero exit as an [`Error::ExternalTool`]. Every invocation has a
//! deadline and the child is killed if it is exceeded.

use std::collections::BTreeMap;
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info};

#[cfg(any(test, feature = "mock"))]
use mockall::automock;

use crate::{Error, Result};

/// Default deadline for a single external command
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(20 * 60);

/// One external program invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    /// Program name, resolved on PATH
    pub program: String,
    /// Arguments
    pub args: Vec<String>,
    /// Extra environment variables
    pub envs: BTreeMap<String, String>,
    /// Bytes written to stdin, if any
    pub stdin: Option<String>,
    /// Deadline for the whole invocation
    pub timeout: Duration,
}

impl Invocation {
    /// Start building an invocation of `program`
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            envs: BTreeMap::new(),
            stdin: None,
            timeout: DEFAULT_COMMAND_TIMEOUT,
        }
    }

    /// Append one argument
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Append several arguments
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Set one environment variable
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.insert(key.into(), value.into());
        self
    }

    /// Set several environment variables
    pub fn envs(mut self, envs: &BTreeMap<String, String>) -> Self {
        self.envs
            .extend(envs.iter().map(|(k, v)| (k.clone(), v.clone())));
        self
    }

    /// Feed `input` on stdin
    pub fn stdin(mut self, input: impl Into<String>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    /// Override the deadline
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// `program arg1 arg2 ...` for logs and error messages
    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Captured output of a successful invocation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Standard output
    pub stdout: String,
    /// Standard error (tools often print progress here even on success)
    pub stderr: String,
}

/// Runs external programs
#[cfg_attr(any(test, feature = "mock"), automock)]
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run to completion, failing on non-zero exit or deadline
    async fn run(&self, invocation: &Invocation) -> Result<CommandOutput>;
}

/// [`CommandRunner`] backed by `tokio::process`
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemRunner;

#[async_trait]
impl CommandRunner for SystemRunner {
    async fn run(&self, invocation: &Invocation) -> Result<CommandOutput> {
        let start = Instant::now();
        info!(command = %invocation.display(), "running external command");

        let mut command = Command::new(&invocation.program);
        command
            .args(&invocation.args)
            .envs(&invocation.envs)
            .stdin(if invocation.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Error::not_found("program", &invocation.program)
            } else {
                Error::from(e)
            }
        })?;

        // Stdin is fed while output is drained, both under the deadline
        let stdin = child.stdin.take();
        let feed = async move {
            if let (Some(input), Some(mut stdin)) = (&invocation.stdin, stdin) {
                match stdin.write_all(input.as_bytes()).await {
                    Ok(()) => {}
                    // Child exited without reading; its status is reported below
                    Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => {
                        debug!(program = %invocation.program, "child closed stdin early");
                    }
                    Err(e) => return Err(e),
                }
                // Close stdin so the child sees EOF
                drop(stdin);
            }
            Ok(())
        };
        let finished = async move {
            let (fed, output) = tokio::join!(feed, child.wait_with_output());
            fed.and(output)
        };

        let output = match tokio::time::timeout(invocation.timeout, finished).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(Error::timeout(
                    invocation.display(),
                    "process exit",
                    start.elapsed(),
                ))
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        for line in stdout.lines() {
            debug!(program = %invocation.program, "{}", line);
        }

        if !output.status.success() {
            return Err(Error::external_tool(
                &invocation.program,
                output.status.to_string(),
                stderr.trim(),
            ));
        }

        debug!(
            program = %invocation.program,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "external command finished"
        );
        Ok(CommandOutput { stdout, stderr })
    }
}

/// Names from `tools` that cannot be found on PATH
pub fn missing_tools<S: AsRef<str>>(tools: &[S]) -> Vec<String> {
    tools
        .iter()
        .map(AsRef::as_ref)
        .filter(|tool| which::which(tool).is_err())
        .map(str::to_string)
        .collect()
}
