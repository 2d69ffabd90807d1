//! Raw TCP control channel to a freshly booted VM.
//!
//! The VM's first-boot script starts socat listeners that redirect a TCP
//! stream into a file (upload and config-upload ports) or into a shell
//! (command port). Nothing is authenticated and nothing is acknowledged, so
//! the only integrity check available is comparing the bytes written against
//! the source size.

use std::path::Path;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::{debug, info};

use cake_common::retry::{retry_with_backoff, RetryConfig};
use cake_common::{Error, Result, COMMAND_PORT, CONFIG_UPLOAD_PORT, UPLOAD_PORT};

/// Deadline for a single connect attempt
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Deadline for a whole upload
const UPLOAD_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// Deadline for the reply to a synchronous command
pub const DEFAULT_REPLY_TIMEOUT: Duration = Duration::from_secs(60);

/// Replies to a marker check; distinct from the echoed command text
const MARKER_PRESENT: &str = "cake-marker-present";
const MARKER_ABSENT: &str = "cake-marker-absent";

/// Connect to `addr`, retrying until the listener is up or `retry` is
/// exhausted.
///
/// Nothing may be written to a bootstrap port before this returns; a write to
/// a port with no listener behind it is silently lost.
pub async fn wait_for_listener(addr: &str, retry: &RetryConfig) -> Result<TcpStream> {
    let stream = retry_with_backoff(retry, &format!("connect {}", addr), || async move {
        match tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(e)) => Err(Error::connectivity(addr, e.to_string())),
            Err(_) => Err(Error::connectivity(
                addr,
                format!("connect timed out after {:?}", CONNECT_TIMEOUT),
            )),
        }
    })
    .await
    .map_err(|e| {
        Error::connectivity(
            addr,
            format!("listener not ready after {} attempts: {}", retry.max_attempts, e),
        )
    })?;
    debug!(addr = %addr, "bootstrap listener is up");
    Ok(stream)
}

/// Copy `reader` into `writer` and check exactly `expected` bytes went out.
///
/// The writer is shut down afterwards so the far side sees EOF and closes the
/// destination file.
pub async fn copy_checked<R, W>(
    reader: &mut R,
    writer: &mut W,
    expected: u64,
    destination: &str,
) -> Result<u64>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let copy = async {
        let written = tokio::io::copy(reader, writer).await?;
        writer.shutdown().await?;
        Ok::<u64, std::io::Error>(written)
    };
    let written = match tokio::time::timeout(UPLOAD_TIMEOUT, copy).await {
        Ok(result) => result?,
        Err(_) => return Err(Error::timeout(destination, "upload complete", UPLOAD_TIMEOUT)),
    };
    if written != expected {
        return Err(Error::transfer(destination, expected, written));
    }
    Ok(written)
}

/// Stream the file at `src` over `stream`
pub async fn upload_file(stream: &mut TcpStream, src: &Path, destination: &str) -> Result<u64> {
    let metadata = tokio::fs::metadata(src)
        .await
        .map_err(|_| Error::not_found("file", src.display().to_string()))?;
    if metadata.is_dir() {
        return Err(Error::not_found("file", src.display().to_string()));
    }
    let mut file = tokio::fs::File::open(src).await?;
    copy_checked(&mut file, stream, metadata.len(), destination).await
}

/// Stream `contents` over `stream`
pub async fn upload_from_string(
    stream: &mut TcpStream,
    contents: &str,
    destination: &str,
) -> Result<u64> {
    let mut reader = contents.as_bytes();
    copy_checked(&mut reader, stream, contents.len() as u64, destination).await
}

/// Ports the first-boot script listens on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BootstrapPorts {
    /// Engine binary upload
    pub upload: u16,
    /// Spec document upload
    pub config: u16,
    /// Shell commands
    pub command: u16,
}

impl Default for BootstrapPorts {
    fn default() -> Self {
        Self {
            upload: UPLOAD_PORT,
            config: CONFIG_UPLOAD_PORT,
            command: COMMAND_PORT,
        }
    }
}

/// The three bootstrap listeners on one VM
#[derive(Debug, Clone)]
pub struct BootstrapTarget {
    host: String,
    ports: BootstrapPorts,
    retry: RetryConfig,
}

impl BootstrapTarget {
    /// Target `host` on the standard ports, probing with
    /// [`RetryConfig::listener_probe`]
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            ports: BootstrapPorts::default(),
            retry: RetryConfig::listener_probe(),
        }
    }

    /// Override the ports
    pub fn with_ports(mut self, ports: BootstrapPorts) -> Self {
        self.ports = ports;
        self
    }

    /// Override the readiness probe
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Host being targeted
    pub fn host(&self) -> &str {
        &self.host
    }

    fn addr(&self, port: u16) -> String {
        format!("{}:{}", self.host, port)
    }

    /// Upload the engine binary at `src`
    pub async fn upload_executable(&self, src: &Path) -> Result<u64> {
        let addr = self.addr(self.ports.upload);
        let mut stream = wait_for_listener(&addr, &self.retry).await?;
        let sent = upload_file(&mut stream, src, &addr).await?;
        info!(addr = %addr, bytes = sent, "uploaded engine binary");
        Ok(sent)
    }

    /// Upload the serialized spec document
    pub async fn upload_config(&self, contents: &str) -> Result<u64> {
        let addr = self.addr(self.ports.config);
        let mut stream = wait_for_listener(&addr, &self.retry).await?;
        let sent = upload_from_string(&mut stream, contents, &addr).await?;
        info!(addr = %addr, bytes = sent, "uploaded config");
        Ok(sent)
    }

    /// Open the command channel
    pub async fn command_channel(&self) -> Result<CommandChannel> {
        let addr = self.addr(self.ports.command);
        let stream = wait_for_listener(&addr, &self.retry).await?;
        Ok(CommandChannel::new(stream, addr))
    }
}

/// Line-oriented shell bridge on the command port
#[derive(Debug)]
pub struct CommandChannel {
    stream: BufReader<TcpStream>,
    addr: String,
    reply_timeout: Duration,
}

impl CommandChannel {
    /// Wrap a connected stream
    pub fn new(stream: TcpStream, addr: impl Into<String>) -> Self {
        Self {
            stream: BufReader::new(stream),
            addr: addr.into(),
            reply_timeout: DEFAULT_REPLY_TIMEOUT,
        }
    }

    /// Override how long [`run_sync`](Self::run_sync) waits for a reply
    pub fn with_reply_timeout(mut self, timeout: Duration) -> Self {
        self.reply_timeout = timeout;
        self
    }

    async fn send(&mut self, line: &str) -> Result<()> {
        let stream = self.stream.get_mut();
        stream
            .write_all(line.as_bytes())
            .await
            .map_err(|e| Error::connectivity(&self.addr, e.to_string()))?;
        stream
            .flush()
            .await
            .map_err(|e| Error::connectivity(&self.addr, e.to_string()))
    }

    /// Start `cmd` detached so it outlives this connection
    pub async fn run_async(&mut self, cmd: &str) -> Result<()> {
        info!(addr = %self.addr, command = %cmd, "starting remote command");
        self.send(&format!("{} & disown\n", cmd)).await
    }

    /// Run `cmd` and return the first line it prints, trimmed
    pub async fn run_sync(&mut self, cmd: &str) -> Result<String> {
        debug!(addr = %self.addr, command = %cmd, "running remote command");
        self.send(&format!("{}\n", cmd)).await?;

        let mut line = String::new();
        let read = tokio::time::timeout(self.reply_timeout, self.stream.read_line(&mut line))
            .await
            .map_err(|_| Error::timeout(&self.addr, format!("reply to '{}'", cmd), self.reply_timeout))?
            .map_err(|e| Error::connectivity(&self.addr, e.to_string()))?;
        if read == 0 {
            return Err(Error::connectivity(
                &self.addr,
                "command channel closed before replying",
            ));
        }
        Ok(line.trim().to_string())
    }

    /// Run `cmd` and return the first output line equal to one of `answers`.
    ///
    /// Other lines (the pty's echo of `cmd`, shell prompts) are skipped.
    pub async fn ask(&mut self, cmd: &str, answers: &[&str]) -> Result<String> {
        debug!(addr = %self.addr, command = %cmd, "asking remote shell");
        self.send(&format!("{}\n", cmd)).await?;
        let timeout = self.reply_timeout;
        tokio::time::timeout(timeout, read_answer(&mut self.stream, &self.addr, answers))
            .await
            .map_err(|_| Error::timeout(&self.addr, format!("reply to '{}'", cmd), timeout))?
    }

    /// Poll until `path` exists on the remote host, sleeping per `retry`
    /// between checks
    pub async fn wait_for_marker(&mut self, path: &str, retry: &RetryConfig) -> Result<()> {
        let cmd = format!(
            "if [ -e {path} ]; then echo {MARKER_PRESENT}; else echo {MARKER_ABSENT}; fi"
        );
        let mut sleeps = retry.schedule();
        let mut attempt = 1u32;
        loop {
            if self.ask(&cmd, &[MARKER_PRESENT, MARKER_ABSENT]).await? == MARKER_PRESENT {
                info!(addr = %self.addr, marker = %path, attempts = attempt, "remote marker present");
                return Ok(());
            }
            let Some(delay) = sleeps.next() else {
                return Err(Error::timeout(
                    &self.addr,
                    format!("{path} present"),
                    retry.nominal_budget(),
                ));
            };
            debug!(addr = %self.addr, marker = %path, attempt, "remote marker absent");
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}

async fn read_answer(
    stream: &mut BufReader<TcpStream>,
    addr: &str,
    answers: &[&str],
) -> Result<String> {
    let mut line = String::new();
    loop {
        line.clear();
        let read = stream
            .read_line(&mut line)
            .await
            .map_err(|e| Error::connectivity(addr, e.to_string()))?;
        if read == 0 {
            return Err(Error::connectivity(
                addr,
                "command channel closed before replying",
            ));
        }
        let reply = line.trim();
        if let Some(answer) = answers.iter().find(|a| **a == reply) {
            return Ok(answer.to_string());
        }
    }
}
