//! VM folder hierarchy management.

use std::collections::BTreeMap;

use tracing::{debug, info};

use cake_common::{Error, Result};

use crate::session::{Folder, Session};
use crate::tracked::TrackedResources;

/// Top-level folder every run works under
pub const BASE_FOLDER: &str = "cake";
/// Where imported templates live
pub const TEMPLATES_FOLDER: &str = "templates";
/// Where the bootstrap VM lives
pub const BOOTSTRAP_FOLDER: &str = "bootstrap";
/// Default folder for management cluster VMs
pub const MGMT_FOLDER: &str = "mgmt";

/// Segments of `path` relative to the datacenter's VM root.
///
/// Accepts both `/DC0/vm/a/b` and `a/b`, with or without a trailing slash.
pub fn relative_segments(vm_root: &str, path: &str) -> Vec<String> {
    let relative = match path.strip_prefix(vm_root) {
        Some(rest) if rest.is_empty() || rest.starts_with('/') => rest,
        _ => path,
    };
    relative
        .split('/')
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Create every missing folder along `path`.
///
/// Returns each segment's folder keyed by segment name. Segments that already
/// exist are reused, so calling this twice with the same path yields the same
/// inventory paths and creates nothing the second time.
pub async fn create_folders(
    session: &Session,
    tracked: &TrackedResources,
    path: &str,
) -> Result<BTreeMap<String, Folder>> {
    let root = session.vm_root();
    let segments = relative_segments(&root, path);
    if segments.is_empty() {
        return Err(Error::validation(format!("invalid folder path '{}'", path)));
    }

    let mut folders = BTreeMap::new();
    let mut parent = root;
    for segment in segments {
        let inventory_path = format!("{}/{}", parent, segment);
        let hypervisor = session.hypervisor();

        let exists = session
            .bounded(&inventory_path, "folder lookup", hypervisor.exists(&inventory_path))
            .await?;
        if exists {
            debug!(folder = %inventory_path, "folder exists");
        } else {
            let created = session
                .bounded(
                    &inventory_path,
                    "folder create",
                    hypervisor.create_folder(&inventory_path),
                )
                .await;
            match created {
                Ok(()) => info!(folder = %inventory_path, "created folder"),
                // Lost a race with another creator; the folder is there either way
                Err(e) if e.is_benign_duplicate() => {
                    debug!(folder = %inventory_path, "folder appeared concurrently")
                }
                Err(e) => return Err(e),
            }
        }

        let folder = Folder {
            name: segment.clone(),
            inventory_path: inventory_path.clone(),
        };
        tracked.add_folder(folder.clone());
        folders.insert(segment, folder);
        parent = inventory_path;
    }
    Ok(folders)
}

/// The deepest folder of `path`, creating the chain as needed
pub async fn ensure_folder(
    session: &Session,
    tracked: &TrackedResources,
    path: &str,
) -> Result<Folder> {
    let root = session.vm_root();
    let last = relative_segments(&root, path)
        .pop()
        .ok_or_else(|| Error::validation(format!("invalid folder path '{}'", path)))?;
    let mut folders = create_folders(session, tracked, path).await?;
    folders
        .remove(&last)
        .ok_or_else(|| Error::not_found("folder", path))
}

/// Look up an existing folder by absolute or root-relative path
pub async fn get_folder(session: &Session, path: &str) -> Result<Folder> {
    let root = session.vm_root();
    let segments = relative_segments(&root, path);
    let inventory_path = std::iter::once(root.as_str())
        .chain(segments.iter().map(String::as_str))
        .collect::<Vec<_>>()
        .join("/");

    let exists = session
        .bounded(
            &inventory_path,
            "folder lookup",
            session.hypervisor().exists(&inventory_path),
        )
        .await?;
    if !exists {
        return Err(Error::not_found("folder", inventory_path));
    }
    Ok(Folder {
        name: segments.last().cloned().unwrap_or_else(|| "vm".to_string()),
        inventory_path,
    })
}

/// Remove a folder; a folder that is already gone is not an error
pub async fn delete_folder(session: &Session, folder: &Folder) -> Result<()> {
    let path = &folder.inventory_path;
    let exists = session
        .bounded(path, "folder lookup", session.hypervisor().exists(path))
        .await?;
    if !exists {
        debug!(folder = %path, "folder already gone");
        return Ok(());
    }
    session
        .bounded(path, "folder destroy", session.hypervisor().destroy(path))
        .await?;
    info!(folder = %path, "deleted folder");
    Ok(())
}
