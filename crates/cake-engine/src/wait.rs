//! Readiness polling against cluster resources.
//!
//! A [`ResourceQuery`] fetches a JSON document; [`wait_for_condition`] scans it
//! for a [`Condition`] until enough matches appear or the deadline passes.
//! Values seen along the way are published once each, so a watcher can tell
//! "still converging" from "stuck".

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, trace};

#[cfg(test)]
use mockall::automock;

use cake_common::events::{EventBus, StatusEvent};
use cake_common::{Error, Result};

use crate::kube_api::{ClusterApi, ResourceRef};

/// Default time between polls
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(30);

/// Something that can be fetched repeatedly and scanned for conditions
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ResourceQuery: Send + Sync {
    /// Name used in events and timeout errors
    fn resource(&self) -> String;

    /// Fetch the current state
    async fn fetch(&self) -> Result<Value>;
}

/// Lists one kind of object through a [`ClusterApi`]
pub struct ListQuery {
    api: Arc<dyn ClusterApi>,
    kubeconfig: PathBuf,
    resource: ResourceRef,
}

impl ListQuery {
    /// Query `resource` on the cluster reached through `kubeconfig`
    pub fn new(api: Arc<dyn ClusterApi>, kubeconfig: impl Into<PathBuf>, resource: ResourceRef) -> Self {
        Self {
            api,
            kubeconfig: kubeconfig.into(),
            resource,
        }
    }
}

#[async_trait]
impl ResourceQuery for ListQuery {
    fn resource(&self) -> String {
        self.resource.display()
    }

    async fn fetch(&self) -> Result<Value> {
        self.api.list(&self.kubeconfig, &self.resource).await
    }
}

/// `key=value`, satisfied once it appears at least `count` times
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Condition {
    /// Field name, or condition type for Kubernetes-style conditions
    pub key: String,
    /// Expected value, compared as a string
    pub value: String,
    /// Matches required
    pub count: usize,
}

impl Condition {
    /// A condition that must appear once
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            count: 1,
        }
    }

    /// Require `count` matches, e.g. one per machine
    pub fn times(mut self, count: usize) -> Self {
        self.count = count.max(1);
        self
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.key, self.value)
    }
}

/// Count the value each object in `doc` reports for `key`.
///
/// `doc` is a list (`items`) or a single object. Each object contributes at
/// most once: the `status` of the entry in `status.conditions` whose `type`
/// is `key`, else `status.<key>`, else a top-level `<key>`. Fields nested
/// anywhere else (spec, annotations, embedded templates) are ignored.
pub fn observed_values(doc: &Value, key: &str) -> BTreeMap<String, usize> {
    let objects: Vec<&Value> = match doc.get("items").and_then(Value::as_array) {
        Some(items) => items.iter().collect(),
        None => vec![doc],
    };
    let mut seen = BTreeMap::new();
    for value in objects.into_iter().filter_map(|object| reported(object, key)) {
        *seen.entry(value).or_default() += 1;
    }
    seen
}

fn reported(object: &Value, key: &str) -> Option<String> {
    let status = object.get("status");
    let condition = status
        .and_then(|s| s.get("conditions"))
        .and_then(Value::as_array)
        .and_then(|conditions| {
            conditions
                .iter()
                .find(|c| c.get("type").and_then(Value::as_str) == Some(key))
        })
        .and_then(|c| c.get("status"))
        .and_then(scalar);
    condition
        .or_else(|| status.and_then(|s| s.get(key)).and_then(scalar))
        .or_else(|| object.get(key).and_then(scalar))
}

fn scalar(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Poll `query` until `condition` holds.
///
/// The first fetch happens immediately, then every `interval`. Fetch errors
/// that are retryable keep polling; anything else stops the wait. On expiry the
/// error names the resource, the elapsed time and the condition.
pub async fn wait_for_condition(
    query: &dyn ResourceQuery,
    condition: &Condition,
    timeout: Duration,
    interval: Duration,
    bus: &dyn EventBus,
) -> Result<()> {
    let resource = query.resource();
    let start = Instant::now();
    let mut reported = BTreeSet::new();

    loop {
        match query.fetch().await {
            Ok(doc) => {
                let seen = observed_values(&doc, &condition.key);
                for value in seen.keys() {
                    let pair = format!("{}={}", condition.key, value);
                    if reported.insert(pair.clone()) {
                        bus.publish(StatusEvent::progress(format!("{resource}: observed {pair}")))
                            .await?;
                    }
                }
                let matched = seen.get(&condition.value).copied().unwrap_or(0);
                if matched >= condition.count {
                    debug!(resource = %resource, condition = %condition, "condition met");
                    return Ok(());
                }
                trace!(resource = %resource, matched, wanted = condition.count, "condition not met");
            }
            Err(e) if e.is_retryable() => {
                trace!(resource = %resource, error = %e, "fetch failed, polling again")
            }
            Err(e) => return Err(e),
        }

        let elapsed = start.elapsed();
        if elapsed >= timeout {
            return Err(Error::timeout(&resource, condition.to_string(), elapsed));
        }
        tokio::time::sleep(interval.min(timeout - elapsed)).await;
    }
}
