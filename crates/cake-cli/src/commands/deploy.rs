//! Deploy command - Build a management cluster
//!
//! Without `--local` this process is the initiator: the vSphere provider
//! creates the VMs, ships this binary and the spec to the bootstrap VM, and
//! follows the remote run. With `--local` this process is the engine: it runs
//! the five lifecycle phases and, with `--progress`, serves their status to
//! the initiator.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::Args;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use cake_common::command::SystemRunner;
use cake_common::config::{default_spec_path, ClusterSpec, EngineType, EventBusSpec};
use cake_common::events::{BusServer, EventBus, LocalBus, RemoteBus, StatusEvent};
use cake_engine::ClusterEngine;
use cake_progress::{mirror, spawn_progress_server, ProgressState, StatusBoard};
use cake_vsphere::{run_bootstrapper, Bootstrapper, ProviderOptions, VsphereProvider};

use crate::{LogArgs, Result};

/// How often the closing event is looked for in the status board
const SETTLE_INTERVAL: Duration = Duration::from_millis(20);
const SETTLE_POLLS: u32 = 100;

/// Build a management cluster
#[derive(Args, Debug)]
pub struct DeployArgs {
    /// Cluster spec file (defaults to ~/.cake.yaml)
    #[arg(long, env = "CAKE_SPEC_FILE")]
    pub spec_file: Option<PathBuf>,

    /// Run the lifecycle engine in this process instead of on a bootstrap VM
    #[arg(short, long)]
    pub local: bool,

    /// Engine to run: capv or rke (overrides EngineType in the spec)
    #[arg(short, long)]
    pub deployment_type: Option<EngineType>,

    /// Serve run status, log and deliverables over HTTP (with --local)
    #[arg(long)]
    pub progress: bool,

    /// Address of the bootstrap node (overrides BootstrapIP in the spec)
    #[arg(long, env = "CAKE_BOOTSTRAPIP")]
    pub bootstrap_ip: Option<String>,

    /// Seconds to keep serving progress after the engine stops
    #[arg(long, default_value = "86400")]
    pub grace_period_secs: u64,

    /// Engine binary to upload to the bootstrap VM (defaults to this executable)
    #[arg(long)]
    pub executable: Option<PathBuf>,
}

impl DeployArgs {
    /// Path of the spec file to read
    pub fn spec_path(&self) -> PathBuf {
        self.spec_file.clone().unwrap_or_else(default_spec_path)
    }

    /// Load the spec and apply flag overrides
    pub fn load_spec(&self) -> Result<ClusterSpec> {
        let mut spec = ClusterSpec::load(&self.spec_path())?;
        if let Some(engine_type) = self.deployment_type {
            spec.engine_type = engine_type;
            spec.validate()?;
        }
        if let Some(ip) = &self.bootstrap_ip {
            spec.bootstrap_ip = Some(ip.clone());
        }
        Ok(spec)
    }
}

/// Run the deploy command
pub async fn run(args: DeployArgs, logging: &LogArgs) -> Result<()> {
    let spec = args.load_spec()?;
    if args.local {
        logging.init(spec.log_file.clone())?;
        run_local(spec, &args).await
    } else {
        logging.init(None)?;
        run_provider(spec, &args).await
    }
}

/// The run's event bus, plus the broker task when this process embeds one
pub async fn connect_bus(
    spec: &EventBusSpec,
) -> Result<(Arc<dyn EventBus>, Option<JoinHandle<()>>)> {
    if let Some(addr) = &spec.serve {
        let server = BusServer::bind(addr).await?;
        let bus: Arc<dyn EventBus> = Arc::new(server.bus());
        return Ok((bus, Some(server.spawn())));
    }
    if let Some(addr) = &spec.address {
        let bus: Arc<dyn EventBus> = Arc::new(RemoteBus::connect(addr.clone()).await?);
        return Ok((bus, None));
    }
    let bus: Arc<dyn EventBus> = Arc::new(LocalBus::new());
    Ok((bus, None))
}

fn log_launch(spec: &ClusterSpec) {
    info!(
        cluster = %spec.cluster_name,
        engine = %spec.engine_type,
        control_plane = spec.control_plane_count,
        workers = spec.worker_count,
        "Launching cluster"
    );
}

async fn run_provider(spec: ClusterSpec, args: &DeployArgs) -> Result<()> {
    let start = Instant::now();
    log_launch(&spec);

    let (bus, _broker) = connect_bus(&spec.event_bus).await?;
    let board = StatusBoard::new();
    let _mirror = mirror(bus.as_ref(), board.clone()).await?;

    let executable = match &args.executable {
        Some(path) => path.clone(),
        None => std::env::current_exe()?,
    };
    let mut provider = VsphereProvider::connect(
        spec,
        Arc::new(SystemRunner),
        bus.clone(),
        ProviderOptions::new(executable),
    )
    .await?;

    let result = run_initiator(&mut provider, bus.as_ref(), &board).await;
    info!(
        duration = ?start.elapsed(),
        events = board.snapshot().messages.len(),
        success = result.is_ok(),
        "Mission complete"
    );
    result
}

/// Drive the provider stages, then publish the outcome and close the board
/// whether or not a stage failed.
pub async fn run_initiator(
    bootstrapper: &mut dyn Bootstrapper,
    bus: &dyn EventBus,
    board: &StatusBoard,
) -> Result<()> {
    let result = run_bootstrapper(bootstrapper, bus).await;
    close_run(bus, board, &result).await;
    Ok(result?)
}

async fn run_local(spec: ClusterSpec, args: &DeployArgs) -> Result<()> {
    let start = Instant::now();
    log_launch(&spec);

    let (bus, _broker) = connect_bus(&spec.event_bus).await?;
    let board = StatusBoard::new();
    let _mirror = mirror(bus.as_ref(), board.clone()).await?;
    let state = ProgressState::new(board, spec.log_file.clone());

    let server = if args.progress {
        let addr = SocketAddr::from(([0, 0, 0, 0], spec.progress_port));
        if let Some(ip) = &spec.bootstrap_ip {
            info!(url = %format!("http://{}:{}", ip, spec.progress_port), "Progress available");
        }
        Some(spawn_progress_server(addr, state.clone()).await?)
    } else {
        None
    };

    let mut engine = cake_engine::engine_for(spec, bus.clone())?;
    let result = run_engine(engine.as_mut(), bus.as_ref(), &state).await;
    info!(duration = ?start.elapsed(), success = result.is_ok(), "Engine stopped");

    // The initiator reads the final status and downloads deliverables from
    // this process, so the surface outlives the run.
    if let Some(server) = server {
        info!(seconds = args.grace_period_secs, "Serving final status");
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs(args.grace_period_secs)) => {}
            _ = tokio::signal::ctrl_c() => info!("interrupted"),
        }
        server.abort();
    }
    result
}

/// Drive `engine` through its phases, then publish the outcome so the
/// progress surface reports the run as complete.
///
/// Deliverables are registered whether or not the run succeeded; a failed
/// run still exposes whatever it produced.
pub async fn run_engine(
    engine: &mut dyn ClusterEngine,
    bus: &dyn EventBus,
    state: &ProgressState,
) -> Result<()> {
    let result = cake_engine::run(engine).await;

    for path in engine.deliverables() {
        let name = state.register_deliverable(path);
        debug!(name = %name, "Deliverable registered");
    }

    close_run(bus, state.board(), &result).await;
    Ok(result?)
}

/// Publish the closing event, wait for the board to record it and mark the
/// run complete.
async fn close_run(bus: &dyn EventBus, board: &StatusBoard, result: &cake_common::Result<()>) {
    let closing = match result {
        Ok(()) => StatusEvent::checkpoint("run-complete"),
        Err(e) => StatusEvent::failure(format!("run failed: {e}")),
    };
    let rendered = closing.to_string();
    match bus.publish(closing).await {
        Ok(()) => settle(board, &rendered).await,
        Err(e) => warn!(error = %e, "could not publish run outcome"),
    }
    board.finish(result.is_ok());
}

/// Wait for the mirror to record `last` so `complete` is never observed
/// ahead of the messages that preceded it.
async fn settle(board: &StatusBoard, last: &str) {
    for _ in 0..SETTLE_POLLS {
        if board.snapshot().messages.iter().any(|m| m == last) {
            return;
        }
        tokio::time::sleep(SETTLE_INTERVAL).await;
    }
    warn!("status mirror is lagging, marking the run complete anyway");
}
