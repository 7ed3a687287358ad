//! Cluster API boundary.
//!
//! The engine only talks to the cluster through [`ClusterApi`]. The production
//! implementation is [`KubeCluster`]; [`InMemoryCluster`] emulates the
//! deletion semantics of an API server for tests.

pub mod kubernetes;
pub mod memory;

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::debug;

use crate::error::ClusterError;
use crate::resource::{ApiKind, ResourceRef};

pub use self::kubernetes::KubeCluster;
pub use self::memory::InMemoryCluster;

/// Deletion-relevant state of a live object.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObjectState {
    pub finalizers: Vec<String>,
    /// RFC 3339 timestamp when deletion was requested.
    pub deletion_timestamp: Option<String>,
    /// `status.phase`, when the kind reports one.
    pub phase: Option<String>,
}

impl fmt::Display for ObjectState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "finalizers=[{}]", self.finalizers.join(","))?;
        match &self.deletion_timestamp {
            Some(ts) => write!(f, ", terminating since {ts}")?,
            None => write!(f, ", not terminating")?,
        }
        if let Some(phase) = &self.phase {
            write!(f, ", phase={phase}")?;
        }
        Ok(())
    }
}

/// Listing entry for an object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectSummary {
    pub name: String,
    pub namespace: Option<String>,
    pub labels: BTreeMap<String, String>,
}

/// A custom resource definition as seen by the teardown.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrdInfo {
    /// `<plural>.<group>`.
    pub name: String,
    pub group: String,
    pub kind: String,
    pub plural: String,
    /// Storage version, or the first served version.
    pub version: String,
    pub namespaced: bool,
    pub labels: BTreeMap<String, String>,
}

impl CrdInfo {
    /// API kind of the custom resources this CRD defines.
    #[must_use]
    pub fn instance_kind(&self) -> ApiKind {
        ApiKind::new(
            &self.group,
            &self.version,
            &self.kind,
            &self.plural,
            self.namespaced,
        )
    }
}

/// Structured resource API consumed by the teardown engine.
///
/// Implementations must treat "not found" on mutating calls as
/// [`ClusterError::NotFound`] so callers can fold it into success.
#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// Fetch an object. `Ok(None)` when it does not exist.
    async fn get(&self, target: &ResourceRef) -> Result<Option<ObjectState>, ClusterError>;

    /// List objects of a kind, optionally scoped to a namespace and filtered
    /// by a label selector. `namespace = None` lists across all namespaces.
    async fn list(
        &self,
        kind: &ApiKind,
        namespace: Option<&str>,
        label_selector: Option<&str>,
    ) -> Result<Vec<ObjectSummary>, ClusterError>;

    /// Set the object's finalizer list to empty.
    async fn clear_finalizers(&self, target: &ResourceRef) -> Result<(), ClusterError>;

    /// Request deletion of one object.
    async fn delete(&self, target: &ResourceRef) -> Result<(), ClusterError>;

    /// Delete every object of a kind in a namespace (or cluster-wide).
    async fn delete_collection(
        &self,
        kind: &ApiKind,
        namespace: Option<&str>,
    ) -> Result<(), ClusterError>;

    /// Namespace-scoped kinds served by the cluster that support listing and
    /// collection deletion.
    async fn namespaced_kinds(&self) -> Result<Vec<ApiKind>, ClusterError>;

    /// All custom resource definitions in the cluster.
    async fn custom_resource_definitions(&self) -> Result<Vec<CrdInfo>, ClusterError>;

    /// Fetch one custom resource definition by name.
    async fn custom_resource_definition(
        &self,
        name: &str,
    ) -> Result<Option<CrdInfo>, ClusterError> {
        Ok(self
            .custom_resource_definitions()
            .await?
            .into_iter()
            .find(|crd| crd.name == name))
    }

    /// Block until the object is gone or `timeout` elapses. Returns whether
    /// absence was confirmed. Errors other than not-found never confirm
    /// absence.
    async fn wait_for_absence(
        &self,
        target: &ResourceRef,
        timeout: Duration,
        poll_interval: Duration,
    ) -> bool {
        poll_for_absence(self, target, timeout, poll_interval).await
    }
}

/// Poll `get` until the object is gone or `timeout` elapses.
pub(crate) async fn poll_for_absence<C: ClusterApi + ?Sized>(
    cluster: &C,
    target: &ResourceRef,
    timeout: Duration,
    poll_interval: Duration,
) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        match cluster.get(target).await {
            Ok(None) => return true,
            Err(err) if err.is_not_found() => return true,
            Ok(Some(_)) => {}
            Err(err) => debug!(resource = %target, error = %err, "Existence unknown while waiting"),
        }

        let now = Instant::now();
        if now >= deadline {
            return false;
        }
        tokio::time::sleep(poll_interval.min(deadline - now)).await;
    }
}
