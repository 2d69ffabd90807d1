//! Client for a remote progress surface
//!
//! Used by the initiating process to watch an engine running on the
//! bootstrap VM and to collect its log and deliverables afterwards.

use std::path::{Component, Path, PathBuf};
use std::time::{Duration, Instant};

use tracing::{debug, info};

use cake_common::events::{EventBus, StatusEvent};
use cake_common::{Error, Result};

use crate::server::DeliverableInfo;
use crate::status::Status;

/// Per-request deadline
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// HTTP client bound to one progress server
#[derive(Debug, Clone)]
pub struct ProgressClient {
    base_url: String,
    client: reqwest::Client,
}

impl ProgressClient {
    /// Client for the server at `host:port`
    pub fn new(host: &str, port: u16) -> Result<Self> {
        Self::with_base_url(format!("http://{}:{}", host, port))
    }

    /// Client for an explicit base URL, e.g. `http://10.0.0.5:8081`
    pub fn with_base_url(base_url: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| Error::internal_with_context("progress-client", e.to_string()))?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
        })
    }

    /// Base URL requests are sent to
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn get(&self, path: &str) -> Result<reqwest::Response> {
        let url = format!("{}{}", self.base_url, path);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| Error::connectivity(&url, e.to_string()))?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(Error::not_found("progress resource", url));
        }
        response
            .error_for_status()
            .map_err(|e| Error::connectivity(&url, e.to_string()))
    }

    /// Current remote status
    pub async fn fetch_status(&self) -> Result<Status> {
        let response = self.get("/progress").await?;
        response
            .json::<Status>()
            .await
            .map_err(|e| Error::serialization(format!("invalid /progress response: {e}")))
    }

    /// Poll `/progress` until the remote run completes, republishing every
    /// new message on `bus`.
    ///
    /// Connection failures count as "not up yet" until `timeout` elapses.
    /// Returns the final status, or an error if the remote run failed.
    pub async fn follow(
        &self,
        bus: &dyn EventBus,
        interval: Duration,
        timeout: Duration,
    ) -> Result<Status> {
        let start = Instant::now();
        let mut seen = 0usize;

        loop {
            match self.fetch_status().await {
                Ok(status) => {
                    for msg in status.messages.iter().skip(seen) {
                        bus.publish(StatusEvent::progress(msg.clone())).await?;
                    }
                    seen = seen.max(status.messages.len());

                    if status.complete {
                        if status.completed_successfully {
                            info!(url = %self.base_url, "remote run completed");
                            return Ok(status);
                        }
                        return Err(Error::internal_with_context(
                            "remote-engine",
                            format!(
                                "run on {} finished unsuccessfully: {}",
                                self.base_url,
                                status.messages.last().map(String::as_str).unwrap_or("no messages")
                            ),
                        ));
                    }
                }
                Err(Error::Connectivity { message, .. }) => {
                    debug!(url = %self.base_url, error = %message, "progress server not reachable yet");
                }
                Err(e) => return Err(e),
            }

            let elapsed = start.elapsed();
            if elapsed >= timeout {
                return Err(Error::timeout(
                    format!("{}/progress", self.base_url),
                    "complete=true",
                    elapsed,
                ));
            }
            tokio::time::sleep(interval.min(timeout - elapsed)).await;
        }
    }

    /// Save the remote log to `dest`
    pub async fn download_log(&self, dest: &Path) -> Result<()> {
        let bytes = self.bytes("/log").await?;
        tokio::fs::write(dest, bytes).await?;
        info!(path = %dest.display(), "downloaded remote log");
        Ok(())
    }

    /// Save every listed deliverable into `dir` as `<name><ext>`.
    ///
    /// Returns the written paths in listing order.
    pub async fn download_deliverables(&self, dir: &Path) -> Result<Vec<PathBuf>> {
        let listing = self
            .get("/deliverable")
            .await?
            .json::<Vec<DeliverableInfo>>()
            .await
            .map_err(|e| Error::serialization(format!("invalid /deliverable response: {e}")))?;

        let files = listing
            .iter()
            .map(|item| local_file_name(item).map(|name| (item, dir.join(name))))
            .collect::<Result<Vec<_>>>()?;

        tokio::fs::create_dir_all(dir).await?;
        let mut written = Vec::with_capacity(files.len());
        for (item, dest) in files {
            let bytes = self.bytes(&item.url).await?;
            tokio::fs::write(&dest, bytes).await?;
            info!(path = %dest.display(), "downloaded deliverable");
            written.push(dest);
        }
        Ok(written)
    }

    async fn bytes(&self, path: &str) -> Result<Vec<u8>> {
        let response = self.get(path).await?;
        let url = response.url().to_string();
        Ok(response
            .bytes()
            .await
            .map_err(|e| Error::connectivity(url, e.to_string()))?
            .to_vec())
    }
}

/// File name a deliverable is saved under; must stay inside the target
/// directory
fn local_file_name(item: &DeliverableInfo) -> Result<String> {
    let base = item.url.rsplit('/').next().unwrap_or(&item.url);
    let name = format!("{}{}", base, item.file_extension);
    let mut components = Path::new(&name).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) if !name.contains('\\') => Ok(name),
        _ => Err(Error::validation(format!(
            "deliverable '{}' with extension '{}' does not name a plain file",
            item.url, item.file_extension
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::{serve_listener, ProgressState};
    use crate::status::StatusBoard;
    use cake_common::events::LocalBus;
    use tokio::net::TcpListener;

    async fn start(state: ProgressState) -> ProgressClient {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        serve_listener(listener, state);
        ProgressClient::new("127.0.0.1", port).unwrap()
    }

    /// Story: the initiator watches a remote run to completion and sees every
    /// remote message exactly once on its own bus
    #[tokio::test]
    async fn story_follow_republishes_remote_messages() {
        let board = StatusBoard::new();
        board.record(&StatusEvent::checkpoint("phase-start:create-bootstrap"));
        let client = start(ProgressState::new(board.clone(), None)).await;

        let local = LocalBus::new();
        let mut rx = local.subscribe().await.unwrap();

        let remote = board.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(60)).await;
            remote.record(&StatusEvent::checkpoint("phase-end:create-bootstrap"));
            remote.finish(true);
        });

        let status = client
            .follow(&local, Duration::from_millis(20), Duration::from_secs(5))
            .await
            .unwrap();
        assert!(status.completed_successfully);

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert!(first.msg.contains("phase-start:create-bootstrap"));
        assert!(second.msg.contains("phase-end:create-bootstrap"));
        assert!(rx.try_recv().is_none());
    }

    #[tokio::test]
    async fn follow_fails_when_remote_run_failed() {
        let board = StatusBoard::new();
        board.record(&StatusEvent::failure("clusterctl init failed"));
        board.finish(false);
        let client = start(ProgressState::new(board, None)).await;

        let err = client
            .follow(&LocalBus::new(), Duration::from_millis(10), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert_eq!(err.context(), Some("remote-engine"));
        assert!(err.to_string().contains("clusterctl init failed"));
    }

    #[tokio::test]
    async fn follow_times_out_against_absent_server() {
        // Bind then drop to find a port nothing listens on
        let port = {
            let l = TcpListener::bind("127.0.0.1:0").await.unwrap();
            l.local_addr().unwrap().port()
        };
        let client = ProgressClient::new("127.0.0.1", port).unwrap();

        let start = Instant::now();
        let err = client
            .follow(&LocalBus::new(), Duration::from_millis(10), Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout { .. }));
        assert!(start.elapsed() >= Duration::from_millis(100));
    }

    #[tokio::test]
    async fn story_finalize_downloads_log_and_deliverables() {
        let remote_dir = tempfile::tempdir().unwrap();
        let log = remote_dir.path().join("cake.log");
        let kubeconfig = remote_dir.path().join("kube_config_rke-config.yml");
        std::fs::write(&log, "remote log\n").unwrap();
        std::fs::write(&kubeconfig, "clusters: []\n").unwrap();

        let state = ProgressState::new(StatusBoard::new(), Some(log));
        state.register_deliverable(&kubeconfig);
        let client = start(state).await;

        let local_dir = tempfile::tempdir().unwrap();
        client
            .download_log(&local_dir.path().join("remote.log"))
            .await
            .unwrap();
        let written = client.download_deliverables(local_dir.path()).await.unwrap();

        assert_eq!(
            std::fs::read_to_string(local_dir.path().join("remote.log")).unwrap(),
            "remote log\n"
        );
        assert_eq!(written, vec![local_dir.path().join("kube_config_rke-config.yml")]);
        assert_eq!(std::fs::read_to_string(&written[0]).unwrap(), "clusters: []\n");
    }

    #[test]
    fn deliverable_names_stay_in_the_target_directory() {
        let item = |url: &str, ext: &str| DeliverableInfo {
            url: url.into(),
            file_extension: ext.into(),
        };
        assert_eq!(
            local_file_name(&item("/deliverable/kubeconfig", "")).unwrap(),
            "kubeconfig"
        );
        assert_eq!(
            local_file_name(&item("/deliverable/rke-config", ".yml")).unwrap(),
            "rke-config.yml"
        );
        for (url, ext) in [
            ("/deliverable/..", ""),
            ("/deliverable/.", ""),
            ("/deliverable/", ""),
            ("/deliverable/kubeconfig", "/../../.bashrc"),
            ("/deliverable/kubeconfig", "\\..\\evil"),
        ] {
            let err = local_file_name(&item(url, ext)).unwrap_err();
            assert!(matches!(err, Error::Validation { .. }), "{url}{ext}");
        }
    }

    #[tokio::test]
    async fn hostile_listing_writes_nothing() {
        use axum::{routing::get, Json, Router};

        let app = Router::new()
            .route(
                "/deliverable",
                get(|| async {
                    Json(vec![
                        DeliverableInfo {
                            url: "/deliverable/kubeconfig".into(),
                            file_extension: String::new(),
                        },
                        DeliverableInfo {
                            url: "/deliverable/..".into(),
                            file_extension: String::new(),
                        },
                    ])
                }),
            )
            .route("/deliverable/{name}", get(|| async { "payload" }));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move { axum::serve(listener, app).await });
        let client = ProgressClient::new("127.0.0.1", port).unwrap();

        let parent = tempfile::tempdir().unwrap();
        let dir = parent.path().join("deliverables");
        let err = client.download_deliverables(&dir).await.unwrap_err();

        assert!(matches!(err, Error::Validation { .. }));
        assert!(!dir.exists());
    }
}
