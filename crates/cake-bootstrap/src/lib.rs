//! Bootstrap control channel.
//!
//! Gets the engine binary, its spec document and a command line onto a VM
//! that has no SSH trust yet, using listeners its first-boot script started.

#![cfg_attr(not(test), deny(missing_docs))]

pub mod channel;
pub mod firstboot;

pub use channel::{
    copy_checked, upload_file, upload_from_string, wait_for_listener, BootstrapPorts,
    BootstrapTarget, CommandChannel,
};
pub use firstboot::FirstBootScript;
