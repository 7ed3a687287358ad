//! Dependency-ordered teardown engine.
//!
//! The engine walks a [`DeletionPlan`](crate::plan::DeletionPlan) rank by rank.
//! Every object deletion, whatever its kind, goes through the same
//! patient-delete-then-force state machine in [`delete`]. Namespaces are swept
//! of their contents first and CRDs are purged of instances first.

mod cluster_scoped;
mod crds;
mod delete;
mod driver;
mod namespace;
mod planner;
mod retry;

use std::future::Future;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::cluster::ClusterApi;
use crate::config::TeardownConfig;
use crate::error::TeardownError;
use crate::report::ResourceResult;
use crate::resource::{ManagedResource, ResourceKind};

pub use crds::CrdMatcher;
pub use delete::DeleteAttempt;
pub use namespace::well_known_namespaced_kinds;
pub use planner::TeardownScope;

/// Tears down platform resources against a cluster.
pub struct TeardownEngine {
    cluster: Arc<dyn ClusterApi>,
    config: TeardownConfig,
    crd_matcher: CrdMatcher,
    cancel: CancellationToken,
}

impl TeardownEngine {
    /// Create an engine, validating the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`TeardownError::Invalid`] if the configuration is invalid.
    pub fn new(cluster: Arc<dyn ClusterApi>, config: TeardownConfig) -> Result<Self, TeardownError> {
        config.validate()?;
        let crd_matcher = CrdMatcher::new(&config.crd_patterns, &config.crd_labels)?;

        Ok(Self {
            cluster,
            config,
            crd_matcher,
            cancel: CancellationToken::new(),
        })
    }

    /// Use an externally owned cancellation token (e.g. wired to Ctrl-C).
    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Token that stops the run from issuing new deletions.
    #[must_use]
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    #[must_use]
    pub fn config(&self) -> &TeardownConfig {
        &self.config
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Drive `fut` to completion unless the run is cancelled first.
    async fn until_cancelled<F: Future>(&self, fut: F) -> Option<F::Output> {
        tokio::select! {
            biased;
            output = fut => Some(output),
            () = self.cancel.cancelled() => None,
        }
    }

    /// Tear down one managed resource to a terminal outcome.
    pub async fn teardown_resource(&self, resource: &ManagedResource) -> ResourceResult {
        match resource.kind() {
            ResourceKind::Namespace => self.teardown_namespace(resource).await,
            ResourceKind::Crd => self.teardown_crd(resource).await,
            kind @ (ResourceKind::Application | ResourceKind::ClusterScoped(_)) => {
                let primary = self.config.timeouts.primary_for(kind);
                let attempt = self
                    .delete_with_escalation(&resource.resource_ref(), primary)
                    .await;
                ResourceResult {
                    resource: resource.clone(),
                    outcome: attempt.outcome,
                    escalated: attempt.escalated,
                    bulk_deletions: 0,
                }
            }
        }
    }
}
