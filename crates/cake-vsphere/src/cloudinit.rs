//! Cloud-init guestinfo injected into clones.
//!
//! The guest's cloud-init VMware datasource reads `guestinfo.metadata` and
//! `guestinfo.userdata` from the VM's extraConfig; both are base64 encoded.

use std::collections::BTreeMap;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use minijinja::{context, Environment};

use cake_common::{Error, Result};

const METADATA_TEMPLATE: &str = include_str!("../templates/metadata.yaml");
const USERDATA_TEMPLATE: &str = include_str!("../templates/userdata.yaml");

/// Where the first-boot script is written on the guest
pub const FIRSTBOOT_PATH: &str = "/var/lib/cake/firstboot.sh";

fn render(name: &str, source: &str, ctx: minijinja::Value) -> Result<String> {
    let mut env = Environment::new();
    env.add_template(name, source)
        .map_err(|e| Error::internal_with_context("cloudinit", e.to_string()))?;
    env.get_template(name)
        .and_then(|t| t.render(ctx))
        .map_err(|e| Error::internal_with_context("cloudinit", e.to_string()))
}

/// Instance metadata naming the guest after its VM
pub fn metadata(hostname: &str) -> Result<String> {
    render("metadata", METADATA_TEMPLATE, context! { hostname => hostname })
}

/// `#cloud-config` creating `user` with `keys` and running `script` once
pub fn userdata(script: &str, keys: &[String], user: &str) -> Result<String> {
    render(
        "userdata",
        USERDATA_TEMPLATE,
        context! {
            user => user,
            keys => keys,
            script_path => FIRSTBOOT_PATH,
            script => STANDARD.encode(script),
        },
    )
}

/// extraConfig entries carrying metadata and user data
pub fn guestinfo(
    hostname: &str,
    script: &str,
    keys: &[String],
    user: &str,
) -> Result<BTreeMap<String, String>> {
    let mut config = BTreeMap::new();
    config.insert(
        "guestinfo.metadata".to_string(),
        STANDARD.encode(metadata(hostname)?),
    );
    config.insert(
        "guestinfo.metadata.encoding".to_string(),
        "base64".to_string(),
    );
    config.insert(
        "guestinfo.userdata".to_string(),
        STANDARD.encode(userdata(script, keys, user)?),
    );
    config.insert(
        "guestinfo.userdata.encoding".to_string(),
        "base64".to_string(),
    );
    Ok(config)
}
