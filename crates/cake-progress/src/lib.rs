//! Progress reporting for cake runs.
//!
//! The engine process mirrors its event bus into a [`StatusBoard`] and serves
//! it over HTTP; the initiating process follows that surface with a
//! [`ProgressClient`].

#![cfg_attr(not(test), deny(missing_docs))]

pub mod client;
pub mod server;
pub mod status;

pub use client::ProgressClient;
pub use server::{
    progress_routes, serve_listener, spawn_progress_server, DeliverableInfo, ProgressState,
};
pub use status::{mirror, Status, StatusBoard};
