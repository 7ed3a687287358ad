//! Plan execution: ranks run strictly in order, resources within a rank run
//! concurrently up to the configured limit.

use futures::stream::{self, StreamExt};
use tracing::{info, warn};

use super::{TeardownEngine, TeardownScope};
use crate::error::TeardownError;
use crate::plan::DeletionPlan;
use crate::report::{DeletionReport, ResourceResult};
use crate::resource::ManagedResource;

impl TeardownEngine {
    /// Execute a plan to completion. Failures never abort the run; each one
    /// is recorded and the remaining resources are still processed.
    ///
    /// Once the run is cancelled, or the configured deadline passes, no new
    /// deletion is started and unstarted resources are reported as skipped.
    pub async fn execute(&self, plan: &DeletionPlan) -> DeletionReport {
        let deadline_timer = self.config.deadline().map(|deadline| {
            let token = self.cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(deadline).await;
                warn!(deadline_secs = deadline.as_secs(), "Run deadline reached, cancelling");
                token.cancel();
            })
        });

        let mut report = DeletionReport::default();
        let concurrency = self.config.concurrency.max(1);

        for group in plan.groups() {
            if self.is_cancelled() {
                group.resources().iter().for_each(|r| report.record_skipped(r));
                continue;
            }

            info!(rank = group.rank(), resources = group.resources().len(), "Deleting rank");
            let results: Vec<(&ManagedResource, Option<ResourceResult>)> =
                stream::iter(group.resources())
                    .map(|resource| async move {
                        if self.is_cancelled() {
                            return (resource, None);
                        }
                        (resource, Some(self.teardown_resource(resource).await))
                    })
                    .buffered(concurrency)
                    .collect()
                    .await;

            for (resource, result) in results {
                match result {
                    Some(result) => {
                        if !result.outcome.is_success() {
                            warn!(resource = %resource, outcome = %result.outcome, "Resource not removed");
                        }
                        report.record(result);
                    }
                    None => report.record_skipped(resource),
                }
            }
        }

        if let Some(timer) = deadline_timer {
            timer.abort();
        }
        report.cancelled = self.is_cancelled();

        info!(
            deleted = report.deleted,
            not_found = report.not_found,
            timed_out = report.timed_out,
            failed = report.failed,
            skipped = report.skipped.len(),
            "Teardown finished"
        );
        report
    }

    /// Plan and execute `scope`.
    ///
    /// # Errors
    ///
    /// Returns an error only if planning fails, before anything is deleted.
    pub async fn run(&self, scope: &TeardownScope) -> Result<DeletionReport, TeardownError> {
        let plan = self.plan(scope).await?;
        Ok(self.execute(&plan).await)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::cluster::memory::Call;
    use crate::cluster::InMemoryCluster;
    use crate::config::TeardownConfig;
    use crate::report::DeletionOutcome;
    use crate::resource::{ApiKind, ResourceRef};

    fn app_ref(name: &str) -> ResourceRef {
        ResourceRef::namespaced(ApiKind::application(), "argocd", name)
    }

    fn app(name: &str, rank: u32) -> ManagedResource {
        ManagedResource::application("argocd", name, rank).unwrap()
    }

    fn delete_position(calls: &[Call], name: &str) -> usize {
        calls
            .iter()
            .position(|c| *c == Call::Delete(app_ref(name).to_string()))
            .unwrap_or_else(|| panic!("no delete for {name}"))
    }

    #[tokio::test(start_paused = true)]
    async fn test_ranks_run_in_order() {
        let cluster = Arc::new(InMemoryCluster::new());
        for name in ["a", "b", "c", "d"] {
            cluster.insert(&app_ref(name));
        }
        let engine = TeardownEngine::new(cluster.clone(), TeardownConfig::default()).unwrap();

        let plan =
            DeletionPlan::new(vec![app("d", 2), app("c", 1), app("a", 0), app("b", 0)]).unwrap();
        let report = engine.execute(&plan).await;

        assert!(report.all_succeeded());
        assert_eq!(report.deleted, 4);

        let calls = cluster.mutations();
        let c = delete_position(&calls, "c");
        assert!(delete_position(&calls, "a") < c);
        assert!(delete_position(&calls, "b") < c);
        assert!(c < delete_position(&calls, "d"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_does_not_abort_run() {
        let cluster = Arc::new(InMemoryCluster::new());
        cluster.insert(&app_ref("a"));
        cluster.insert_pinned(&app_ref("b"), "example.com/never");
        cluster.insert(&app_ref("c"));
        let engine = TeardownEngine::new(cluster.clone(), TeardownConfig::default()).unwrap();

        let plan = DeletionPlan::new(vec![app("a", 0), app("b", 1), app("c", 2)]).unwrap();
        let report = engine.execute(&plan).await;

        assert_eq!(report.deleted, 2);
        assert_eq!(report.failed, 1);
        assert_eq!(report.failures.len(), 1);
        assert!(report.failures[0].resource.contains("argocd/b"));
        assert!(matches!(report.failures[0].outcome, DeletionOutcome::Failed(_)));
        assert!(report.has_failures());
        assert!(!cluster.contains(&app_ref("c")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_run_issues_nothing() {
        let cluster = Arc::new(InMemoryCluster::new());
        cluster.insert(&app_ref("a"));
        let engine = TeardownEngine::new(cluster.clone(), TeardownConfig::default()).unwrap();
        engine.cancellation_token().cancel();

        let plan = DeletionPlan::new(vec![app("a", 0), app("b", 1)]).unwrap();
        let report = engine.execute(&plan).await;

        assert!(report.cancelled);
        assert_eq!(report.skipped.len(), 2);
        assert_eq!(report.total(), 0);
        assert!(cluster.mutations().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_stops_new_work() {
        let cluster = Arc::new(InMemoryCluster::new());
        cluster.insert_pinned(&app_ref("stuck"), "example.com/never");
        cluster.insert(&app_ref("later"));
        let config = TeardownConfig {
            deadline_secs: Some(10),
            ..TeardownConfig::default()
        };
        let engine = TeardownEngine::new(cluster.clone(), config).unwrap();

        let plan = DeletionPlan::new(vec![app("stuck", 0), app("later", 1)]).unwrap();
        let report = engine.execute(&plan).await;

        assert!(report.cancelled);
        assert_eq!(report.timed_out, 1);
        assert_eq!(report.skipped, vec![app("later", 1).to_string()]);
        assert!(cluster.contains(&app_ref("later")));
        assert!(!report.all_succeeded());
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_plans_and_executes() {
        let cluster = Arc::new(InMemoryCluster::new());
        cluster.insert(&ResourceRef::namespace("observability"));
        let engine = TeardownEngine::new(cluster.clone(), TeardownConfig::default()).unwrap();

        let report = engine
            .run(&TeardownScope::Namespace("observability".into()))
            .await
            .unwrap();
        assert_eq!(report.deleted, 1);
        assert!(!cluster.contains(&ResourceRef::namespace("observability")));
    }
}
