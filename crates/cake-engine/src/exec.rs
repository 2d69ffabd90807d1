//! Helpers shared by the engines for driving external tools

use std::path::Path;

use minijinja::Environment;
use tracing::warn;

use cake_common::command::{CommandOutput, Invocation};
use cake_common::events::{EventBus, StatusEvent};
use cake_common::{Error, Result};

/// `kubectl` pointed at `kubeconfig`
pub(crate) fn kubectl(kubeconfig: &Path) -> Invocation {
    Invocation::new("kubectl").env("KUBECONFIG", kubeconfig.display().to_string())
}

/// `helm <args>` pointed at `kubeconfig`
pub(crate) fn helm<I, S>(kubeconfig: &Path, args: I) -> Invocation
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    Invocation::new("helm")
        .args(args)
        .arg(format!("--kubeconfig={}", kubeconfig.display()))
}

/// Downgrade a duplicate-creation failure to a warning event
pub(crate) async fn tolerate_duplicate<T>(
    bus: &dyn EventBus,
    what: &str,
    result: Result<T>,
) -> Result<()> {
    match result {
        Ok(_) => Ok(()),
        Err(e) if e.is_benign_duplicate() => {
            warn!(what, error = %e, "already exists, continuing");
            bus.publish(StatusEvent::warning(format!("{what} already exists, continuing")))
                .await
        }
        Err(e) => Err(e),
    }
}

/// Downgrade any failure to a warning event
pub(crate) async fn tolerate_failure(
    bus: &dyn EventBus,
    what: &str,
    result: Result<CommandOutput>,
) -> Result<()> {
    if let Err(e) = result {
        warn!(what, error = %e, "failure suppressed");
        bus.publish(StatusEvent::warning(format!("{what} failed, continuing: {e}")))
            .await?;
    }
    Ok(())
}

/// Write `contents` to `path`, creating parent directories
pub(crate) async fn write_file(path: &Path, contents: impl AsRef<[u8]>) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(path, contents).await?;
    Ok(())
}

/// Render an embedded template
pub(crate) fn render(name: &str, source: &str, ctx: minijinja::Value) -> Result<String> {
    let mut env = Environment::new();
    env.add_template(name, source)
        .map_err(|e| Error::internal_with_context("template", e.to_string()))?;
    env.get_template(name)
        .and_then(|t| t.render(ctx))
        .map_err(|e| Error::internal_with_context("template", e.to_string()))
}
