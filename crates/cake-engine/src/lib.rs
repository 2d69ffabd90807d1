//! Cluster lifecycle engines for cake.
//!
//! A [`ClusterEngine`] builds a permanent Kubernetes cluster in five phases;
//! [`run`] checks its tools and drives the phases in order. Two backends are
//! provided: [`CapvEngine`] (Cluster API on vSphere, pivoting from a `kind`
//! bootstrap cluster) and [`RkeEngine`] (the `rke` CLI plus Rancher).

#![cfg_attr(not(test), deny(missing_docs))]

use std::sync::Arc;

use cake_common::command::SystemRunner;
use cake_common::config::{ClusterSpec, EngineType};
use cake_common::events::EventBus;
use cake_common::Result;

pub mod capv;
pub mod engine;
mod exec;
pub mod kube_api;
pub mod rke;
pub mod roles;
pub mod wait;

#[cfg(test)]
mod testing;

pub use capv::CapvEngine;
pub use engine::{run, ClusterEngine, Driver, Phase, Step};
pub use kube_api::{ClusterApi, KubeClusterApi, ResourceRef};
pub use rke::RkeEngine;
pub use roles::{assign_roles, NodeRole, RoleAssignment};
pub use wait::{wait_for_condition, Condition, ResourceQuery};

/// Build the engine `spec` selects, backed by real tools and clusters
pub fn engine_for(spec: ClusterSpec, bus: Arc<dyn EventBus>) -> Result<Box<dyn ClusterEngine>> {
    let runner = Arc::new(SystemRunner);
    Ok(match spec.engine_type {
        EngineType::Capv => Box::new(CapvEngine::new(spec, runner, Arc::new(KubeClusterApi), bus)?),
        EngineType::Rke => Box::new(RkeEngine::new(spec, runner, bus)),
    })
}
