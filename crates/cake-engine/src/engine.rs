//! The engine interface and the phase driver shared by every backend

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{error, info};

#[cfg(test)]
use mockall::automock;

use cake_common::events::{EventBus, StatusEvent};
use cake_common::{Error, Result};

/// A provisioning backend that builds a permanent cluster in five phases
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterEngine: Send {
    /// Short backend name for logs
    fn name(&self) -> String;

    /// External programs the backend needs that are not on PATH
    fn missing_tools(&self) -> Vec<String>;

    /// Bus the backend publishes on
    fn events(&self) -> Arc<dyn EventBus>;

    /// Artifacts produced so far, for the progress surface
    fn deliverables(&self) -> Vec<PathBuf>;

    /// Create the temporary bootstrap cluster
    async fn create_bootstrap(&mut self) -> Result<()>;

    /// Install cluster-management components into the bootstrap cluster
    async fn install_control_plane(&mut self) -> Result<()>;

    /// Create the permanent cluster
    async fn create_permanent(&mut self) -> Result<()>;

    /// Move management ownership onto the permanent cluster
    async fn pivot_control_plane(&mut self) -> Result<()>;

    /// Install optional addons
    async fn install_addons(&mut self) -> Result<()>;
}

/// Where a run stands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Nothing has run yet
    NotStarted,
    /// Bootstrap cluster exists
    BootstrapReady,
    /// Management components are installed in the bootstrap cluster
    ControlPlaneInstalled,
    /// Permanent cluster exists
    PermanentReady,
    /// The permanent cluster manages itself
    Pivoted,
    /// Addons are installed; the run succeeded
    AddonsInstalled,
    /// A phase failed; the run cannot resume
    Failed,
}

impl Phase {
    /// Whether no further transitions are possible
    pub fn is_terminal(&self) -> bool {
        matches!(self, Phase::AddonsInstalled | Phase::Failed)
    }
}

/// One of the five engine operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// [`ClusterEngine::create_bootstrap`]
    CreateBootstrap,
    /// [`ClusterEngine::install_control_plane`]
    InstallControlPlane,
    /// [`ClusterEngine::create_permanent`]
    CreatePermanent,
    /// [`ClusterEngine::pivot_control_plane`]
    PivotControlPlane,
    /// [`ClusterEngine::install_addons`]
    InstallAddons,
}

impl Step {
    /// Every step in run order
    pub const ALL: [Step; 5] = [
        Step::CreateBootstrap,
        Step::InstallControlPlane,
        Step::CreatePermanent,
        Step::PivotControlPlane,
        Step::InstallAddons,
    ];

    /// Phase reached when the step succeeds
    pub fn reaches(&self) -> Phase {
        match self {
            Step::CreateBootstrap => Phase::BootstrapReady,
            Step::InstallControlPlane => Phase::ControlPlaneInstalled,
            Step::CreatePermanent => Phase::PermanentReady,
            Step::PivotControlPlane => Phase::Pivoted,
            Step::InstallAddons => Phase::AddonsInstalled,
        }
    }

    /// Name used in checkpoint events
    pub fn as_str(&self) -> &'static str {
        match self {
            Step::CreateBootstrap => "create-bootstrap",
            Step::InstallControlPlane => "install-control-plane",
            Step::CreatePermanent => "create-permanent",
            Step::PivotControlPlane => "pivot-control-plane",
            Step::InstallAddons => "install-addons",
        }
    }

    async fn invoke(&self, engine: &mut dyn ClusterEngine) -> Result<()> {
        match self {
            Step::CreateBootstrap => engine.create_bootstrap().await,
            Step::InstallControlPlane => engine.install_control_plane().await,
            Step::CreatePermanent => engine.create_permanent().await,
            Step::PivotControlPlane => engine.pivot_control_plane().await,
            Step::InstallAddons => engine.install_addons().await,
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Drives a [`ClusterEngine`] through its phases and tracks the state machine
pub struct Driver<'a> {
    engine: &'a mut dyn ClusterEngine,
    phase: Phase,
}

impl<'a> Driver<'a> {
    /// A driver that has not started
    pub fn new(engine: &'a mut dyn ClusterEngine) -> Self {
        Self {
            engine,
            phase: Phase::NotStarted,
        }
    }

    /// Current phase
    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Check tools, then run every step in order, stopping at the first error.
    ///
    /// Nothing is rolled back on failure. The error is published as a failure
    /// event and returned.
    pub async fn run(&mut self) -> Result<()> {
        if self.phase != Phase::NotStarted {
            return Err(Error::internal_with_context(
                "driver",
                format!("run already finished in phase {:?}", self.phase),
            ));
        }
        let bus = self.engine.events();
        let name = self.engine.name();

        let missing = self.engine.missing_tools();
        if !missing.is_empty() {
            let err = Error::not_found("required external tools", missing.join(", "));
            return self.fail(bus.as_ref(), "check-tools", err).await;
        }

        for step in Step::ALL {
            info!(engine = %name, step = %step, "starting phase");
            bus.publish(StatusEvent::checkpoint(format!("phase-start:{step}")))
                .await?;

            if let Err(e) = step.invoke(&mut *self.engine).await {
                return self.fail(bus.as_ref(), step.as_str(), e).await;
            }

            self.phase = step.reaches();
            bus.publish(StatusEvent::checkpoint(format!("phase-end:{step}")))
                .await?;
        }
        info!(engine = %name, "all phases complete");
        Ok(())
    }

    async fn fail(&mut self, bus: &dyn EventBus, step: &str, err: Error) -> Result<()> {
        self.phase = Phase::Failed;
        error!(step, error = %err, "phase failed");
        // The phase error wins over a bus that has also gone away
        let _ = bus
            .publish(StatusEvent::failure(format!("phase-failed:{step}: {err}")))
            .await;
        Err(err)
    }
}

/// Run `engine` from start to finish
pub async fn run(engine: &mut dyn ClusterEngine) -> Result<()> {
    Driver::new(engine).run().await
}
