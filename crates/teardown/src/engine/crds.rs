//! CRD discovery and teardown.
//!
//! A CRD is only deleted once all of its instances are gone. Instances are
//! removed with collection deletes, cluster-wide for cluster-scoped kinds and
//! per namespace otherwise.

use std::collections::BTreeSet;
use std::time::Duration;

use regex::Regex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::retry::retry_transient;
use super::TeardownEngine;
use crate::cluster::{CrdInfo, ObjectSummary};
use crate::error::{ClusterError, TeardownError};
use crate::report::{DeletionOutcome, ResourceResult};
use crate::resource::{ApiKind, ManagedResource, ResourceKind, ResourceRef};

/// Selects platform-owned CRDs by API group domain or management label.
#[derive(Debug, Clone)]
pub struct CrdMatcher {
    patterns: Vec<Regex>,
    labels: Vec<(String, Option<String>)>,
}

impl CrdMatcher {
    /// Build a matcher. A pattern `istio.io` matches `gateways.networking.istio.io`
    /// and `istio.io` itself, but not `notistio.io`. Labels are `key=value` or a
    /// bare `key`.
    ///
    /// # Errors
    ///
    /// Returns [`TeardownError::Invalid`] for an empty pattern or label.
    pub fn new(patterns: &[String], labels: &[String]) -> Result<Self, TeardownError> {
        let patterns = patterns
            .iter()
            .map(|pattern| {
                let domain = pattern.trim().trim_start_matches('.');
                if domain.is_empty() {
                    return Err(TeardownError::Invalid(format!(
                        "CRD pattern '{pattern}' is empty"
                    )));
                }
                Regex::new(&format!(r"(^|\.){}$", regex::escape(domain)))
                    .map_err(|e| TeardownError::Invalid(format!("CRD pattern '{pattern}': {e}")))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let labels = labels
            .iter()
            .map(|label| {
                let label = label.trim();
                if label.is_empty() {
                    return Err(TeardownError::Invalid("empty CRD label".to_string()));
                }
                Ok(match label.split_once('=') {
                    Some((key, value)) => (key.trim().to_string(), Some(value.trim().to_string())),
                    None => (label.to_string(), None),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self { patterns, labels })
    }

    /// Whether the CRD belongs to the platform.
    #[must_use]
    pub fn matches(&self, crd: &CrdInfo) -> bool {
        self.patterns.iter().any(|re| re.is_match(&crd.name))
            || self.labels.iter().any(|(key, value)| match value {
                Some(value) => crd.labels.get(key) == Some(value),
                None => crd.labels.contains_key(key),
            })
    }
}

impl TeardownEngine {
    /// Platform CRDs currently in the cluster, sorted by name.
    ///
    /// # Errors
    ///
    /// Returns an error if CRDs cannot be listed.
    pub async fn discover_crds(&self) -> Result<Vec<CrdInfo>, TeardownError> {
        let mut seen = BTreeSet::new();
        let mut crds: Vec<CrdInfo> = self
            .cluster
            .custom_resource_definitions()
            .await?
            .into_iter()
            .filter(|crd| self.crd_matcher.matches(crd))
            .filter(|crd| seen.insert(crd.name.clone()))
            .collect();
        crds.sort_by(|a, b| a.name.cmp(&b.name));

        debug!(count = crds.len(), "Discovered platform CRDs");
        Ok(crds)
    }

    /// Purge a CRD's instances, then delete the definition.
    pub(super) async fn teardown_crd(&self, resource: &ManagedResource) -> ResourceResult {
        let mut result = ResourceResult {
            resource: resource.clone(),
            outcome: DeletionOutcome::Deleted,
            escalated: false,
            bulk_deletions: 0,
        };

        let crd = match self.cluster.custom_resource_definition(resource.name()).await {
            Ok(Some(crd)) => crd,
            Ok(None) => {
                debug!(crd = %resource.name(), "CRD already absent");
                return result;
            }
            Err(err) => {
                result.outcome = DeletionOutcome::Failed(format!("failed to read CRD: {err}"));
                return result;
            }
        };

        match self.purge_instances(&crd).await {
            Ok(bulk) => result.bulk_deletions = bulk,
            Err(outcome) => {
                warn!(crd = %crd.name, outcome = %outcome, "Instances remain, not deleting CRD");
                result.outcome = outcome;
                return result;
            }
        }

        let primary = self.config.timeouts.primary_for(ResourceKind::Crd);
        let attempt = self
            .delete_with_escalation(&resource.resource_ref(), primary)
            .await;
        result.outcome = attempt.outcome;
        result.escalated = attempt.escalated;
        result
    }

    /// Delete every instance of the CRD's kind and wait until none remain.
    /// Returns the number of collection deletions issued, or the outcome to
    /// report when instances survive.
    async fn purge_instances(&self, crd: &CrdInfo) -> Result<usize, DeletionOutcome> {
        let kind = crd.instance_kind();
        let instances = self.list_instances(&kind).await.map_err(|err| {
            DeletionOutcome::Failed(format!("failed to list {kind} instances: {err}"))
        })?;
        if instances.is_empty() {
            return Ok(0);
        }

        info!(crd = %crd.name, instances = instances.len(), "Deleting custom resources");
        let timeouts = &self.config.timeouts;
        let deadline = Instant::now() + timeouts.primary_for(ResourceKind::Crd);

        let scopes: BTreeSet<Option<String>> = if kind.namespaced {
            instances.iter().map(|i| i.namespace.clone()).collect()
        } else {
            BTreeSet::from([None])
        };

        let mut bulk = 0;
        for scope in &scopes {
            let namespace = scope.as_deref();
            let deleted = retry_transient("delete collection", deadline, || {
                self.cluster.delete_collection(&kind, namespace)
            })
            .await;
            match deleted {
                Ok(()) => bulk += 1,
                Err(err) if err.is_not_found() => {}
                Err(err) => {
                    warn!(kind = %kind, namespace = ?namespace, error = %err, "Failed to delete collection");
                }
            }
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        let wait = self.wait_for_no_instances(&kind, remaining);
        let survivors = match self.until_cancelled(wait).await {
            Some(InstanceWait::Gone) => return Ok(bulk),
            Some(InstanceWait::Remaining(survivors)) if !self.is_cancelled() => survivors,
            Some(InstanceWait::Unknown(err)) => return Err(unknown_instances(&kind, &err)),
            _ => return Err(DeletionOutcome::TimedOut),
        };

        warn!(
            crd = %crd.name,
            instances = survivors.len(),
            "Custom resources still present, removing finalizers"
        );
        let deadline = Instant::now() + timeouts.secondary();
        for instance in &survivors {
            let target = instance_ref(&kind, instance);
            self.strip_finalizers(&target, deadline).await;
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        match self.wait_for_no_instances(&kind, remaining).await {
            InstanceWait::Gone => Ok(bulk),
            InstanceWait::Remaining(survivors) => Err(DeletionOutcome::Failed(format!(
                "{} {kind} instance(s) still present after removing finalizers",
                survivors.len()
            ))),
            InstanceWait::Unknown(err) => Err(unknown_instances(&kind, &err)),
        }
    }

    async fn list_instances(&self, kind: &ApiKind) -> Result<Vec<ObjectSummary>, ClusterError> {
        let deadline = Instant::now() + self.config.timeouts.secondary();
        match retry_transient("list", deadline, || self.cluster.list(kind, None, None)).await {
            Err(err) if err.is_not_found() => Ok(Vec::new()),
            other => other,
        }
    }

    /// Poll until no instances remain or `timeout` elapses. The result
    /// reflects the latest listing; a failed listing never confirms absence.
    async fn wait_for_no_instances(&self, kind: &ApiKind, timeout: Duration) -> InstanceWait {
        let deadline = Instant::now() + timeout;
        let poll = self.config.timeouts.poll_interval();
        loop {
            let observed = match self.cluster.list(kind, None, None).await {
                Ok(items) if items.is_empty() => return InstanceWait::Gone,
                Ok(items) => InstanceWait::Remaining(items),
                Err(err) if err.is_not_found() => return InstanceWait::Gone,
                Err(err) => {
                    debug!(kind = %kind, error = %err, "Listing failed while waiting");
                    InstanceWait::Unknown(err.to_string())
                }
            };

            let now = Instant::now();
            if now >= deadline {
                return observed;
            }
            tokio::time::sleep(poll.min(deadline - now)).await;
        }
    }
}

/// What the last instance listing showed.
#[derive(Debug)]
enum InstanceWait {
    Gone,
    Remaining(Vec<ObjectSummary>),
    Unknown(String),
}

fn unknown_instances(kind: &ApiKind, err: &str) -> DeletionOutcome {
    DeletionOutcome::Failed(format!("could not confirm {kind} instances are gone: {err}"))
}

fn instance_ref(kind: &ApiKind, instance: &ObjectSummary) -> ResourceRef {
    match &instance.namespace {
        Some(ns) => ResourceRef::namespaced(kind.clone(), ns, &instance.name),
        None => ResourceRef::cluster(kind.clone(), &instance.name),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use async_trait::async_trait;

    use super::*;
    use crate::cluster::memory::Call;
    use crate::cluster::{ClusterApi, InMemoryCluster, ObjectState};
    use crate::config::TeardownConfig;

    fn crd(plural: &str, group: &str, kind: &str, namespaced: bool) -> CrdInfo {
        CrdInfo {
            name: format!("{plural}.{group}"),
            group: group.to_string(),
            kind: kind.to_string(),
            plural: plural.to_string(),
            version: "v1".to_string(),
            namespaced,
            labels: BTreeMap::new(),
        }
    }

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(ToString::to_string).collect()
    }

    #[test]
    fn test_matcher_suffix_match() {
        let matcher = CrdMatcher::new(&strings(&["istio.io", ".cert-manager.io"]), &[]).unwrap();

        assert!(matcher.matches(&crd("gateways", "networking.istio.io", "Gateway", true)));
        assert!(matcher.matches(&crd("certificates", "cert-manager.io", "Certificate", true)));
        assert!(!matcher.matches(&crd("widgets", "notistio.io", "Widget", true)));
        assert!(!matcher.matches(&crd("widgets", "istio.io.example.com", "Widget", true)));
    }

    #[test]
    fn test_matcher_label_match() {
        let matcher = CrdMatcher::new(
            &[],
            &strings(&["app.kubernetes.io/part-of=cto-platform", "platform.5dlabs.ai/managed"]),
        )
        .unwrap();

        let mut owned = crd("coderuns", "agents.platform", "CodeRun", true);
        owned
            .labels
            .insert("app.kubernetes.io/part-of".into(), "cto-platform".into());
        assert!(matcher.matches(&owned));

        let mut managed = crd("docsruns", "agents.platform", "DocsRun", true);
        managed
            .labels
            .insert("platform.5dlabs.ai/managed".into(), "true".into());
        assert!(matcher.matches(&managed));

        let mut other = crd("widgets", "example.com", "Widget", true);
        other
            .labels
            .insert("app.kubernetes.io/part-of".into(), "something-else".into());
        assert!(!matcher.matches(&other));
    }

    #[test]
    fn test_matcher_rejects_empty_pattern() {
        assert!(CrdMatcher::new(&strings(&["."]), &[]).is_err());
        assert!(CrdMatcher::new(&[], &strings(&[" "])).is_err());
    }

    #[tokio::test]
    async fn test_discover_crds_filters_and_sorts() {
        let cluster = Arc::new(InMemoryCluster::new());
        cluster.add_crd(crd("virtualservices", "networking.istio.io", "VirtualService", true));
        cluster.add_crd(crd("certificates", "cert-manager.io", "Certificate", true));
        cluster.add_crd(crd("widgets", "example.com", "Widget", true));
        let engine = TeardownEngine::new(cluster, TeardownConfig::default()).unwrap();

        let names: Vec<String> = engine
            .discover_crds()
            .await
            .unwrap()
            .into_iter()
            .map(|c| c.name)
            .collect();
        assert_eq!(
            names,
            vec![
                "certificates.cert-manager.io".to_string(),
                "virtualservices.networking.istio.io".to_string(),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_instances_deleted_before_definition() {
        let cluster = Arc::new(InMemoryCluster::new());
        let info = crd("coderuns", "agents.platform", "CodeRun", true);
        let kind = info.instance_kind();
        cluster.add_crd(info.clone());
        cluster.insert(&ResourceRef::namespaced(kind.clone(), "cto", "run-1"));
        cluster.insert_with_finalizers(
            &ResourceRef::namespaced(kind.clone(), "agents", "run-2"),
            &["agents.platform/cleanup"],
        );
        let engine = TeardownEngine::new(cluster.clone(), TeardownConfig::default()).unwrap();

        let resource = ManagedResource::crd(&info.name, 0).unwrap();
        let result = engine.teardown_crd(&resource).await;

        assert_eq!(result.outcome, DeletionOutcome::Deleted);
        assert_eq!(result.bulk_deletions, 2);
        assert_eq!(cluster.count(&kind, None), 0);

        let calls = cluster.mutations();
        let crd_delete = calls
            .iter()
            .position(|c| matches!(c, Call::Delete(target) if target.contains(&info.name)))
            .expect("CRD delete issued");
        let last_collection = calls
            .iter()
            .rposition(|c| matches!(c, Call::DeleteCollection { .. }))
            .expect("instances deleted");
        assert!(last_collection < crd_delete);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cluster_scoped_instances_use_one_collection_delete() {
        let cluster = Arc::new(InMemoryCluster::new());
        let info = crd("clusterissuers", "cert-manager.io", "ClusterIssuer", false);
        let kind = info.instance_kind();
        cluster.add_crd(info.clone());
        cluster.insert(&ResourceRef::cluster(kind.clone(), "letsencrypt"));
        cluster.insert(&ResourceRef::cluster(kind.clone(), "selfsigned"));
        let engine = TeardownEngine::new(cluster.clone(), TeardownConfig::default()).unwrap();

        let result = engine
            .teardown_crd(&ManagedResource::crd(&info.name, 0).unwrap())
            .await;
        assert_eq!(result.outcome, DeletionOutcome::Deleted);
        assert_eq!(result.bulk_deletions, 1);
        assert!(cluster.calls().contains(&Call::DeleteCollection {
            kind: kind.to_string(),
            namespace: None,
        }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_pinned_instance_blocks_crd_deletion() {
        let cluster = Arc::new(InMemoryCluster::new());
        let info = crd("gateways", "gateway.networking.k8s.io", "Gateway", true);
        let kind = info.instance_kind();
        cluster.add_crd(info.clone());
        cluster.insert_pinned(
            &ResourceRef::namespaced(kind, "istio-system", "ingress"),
            "gateway.istio.io/cleanup",
        );
        let engine = TeardownEngine::new(cluster.clone(), TeardownConfig::default()).unwrap();

        let resource = ManagedResource::crd(&info.name, 0).unwrap();
        let result = engine.teardown_crd(&resource).await;

        assert!(matches!(result.outcome, DeletionOutcome::Failed(_)));
        assert!(cluster.contains(&resource.resource_ref()));
        assert!(!cluster
            .mutations()
            .iter()
            .any(|c| matches!(c, Call::Delete(target) if target.contains(&info.name))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_absent_crd_is_deleted() {
        let cluster = Arc::new(InMemoryCluster::new());
        let engine = TeardownEngine::new(cluster.clone(), TeardownConfig::default()).unwrap();

        let result = engine
            .teardown_crd(&ManagedResource::crd("ghosts.agents.platform", 0).unwrap())
            .await;
        assert_eq!(result.outcome, DeletionOutcome::Deleted);
        assert!(cluster.mutations().is_empty());
    }

    /// Serves instance listings once, then fails every later listing.
    struct FailingListCluster {
        inner: Arc<InMemoryCluster>,
        lists: AtomicUsize,
    }

    #[async_trait]
    impl ClusterApi for FailingListCluster {
        async fn get(&self, target: &ResourceRef) -> Result<Option<ObjectState>, ClusterError> {
            self.inner.get(target).await
        }

        async fn list(
            &self,
            kind: &ApiKind,
            namespace: Option<&str>,
            label_selector: Option<&str>,
        ) -> Result<Vec<ObjectSummary>, ClusterError> {
            if self.lists.fetch_add(1, Ordering::SeqCst) > 0 {
                return Err(ClusterError::Transient("etcd leader changed".into()));
            }
            self.inner.list(kind, namespace, label_selector).await
        }

        async fn clear_finalizers(&self, target: &ResourceRef) -> Result<(), ClusterError> {
            self.inner.clear_finalizers(target).await
        }

        async fn delete(&self, target: &ResourceRef) -> Result<(), ClusterError> {
            self.inner.delete(target).await
        }

        async fn delete_collection(
            &self,
            kind: &ApiKind,
            namespace: Option<&str>,
        ) -> Result<(), ClusterError> {
            self.inner.delete_collection(kind, namespace).await
        }

        async fn namespaced_kinds(&self) -> Result<Vec<ApiKind>, ClusterError> {
            self.inner.namespaced_kinds().await
        }

        async fn custom_resource_definitions(&self) -> Result<Vec<CrdInfo>, ClusterError> {
            self.inner.custom_resource_definitions().await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_unconfirmed_instance_removal_keeps_crd() {
        let inner = Arc::new(InMemoryCluster::new());
        let info = crd("coderuns", "agents.platform", "CodeRun", true);
        let kind = info.instance_kind();
        inner.add_crd(info.clone());
        inner.insert_pinned(
            &ResourceRef::namespaced(kind.clone(), "cto", "run-1"),
            "agents.platform/cleanup",
        );
        let cluster = Arc::new(FailingListCluster {
            inner: inner.clone(),
            lists: AtomicUsize::new(0),
        });
        let engine = TeardownEngine::new(cluster, TeardownConfig::default()).unwrap();

        let resource = ManagedResource::crd(&info.name, 0).unwrap();
        let result = engine.teardown_crd(&resource).await;

        assert!(
            matches!(&result.outcome, DeletionOutcome::Failed(msg) if msg.contains("could not confirm")),
            "{:?}",
            result.outcome
        );
        assert!(inner.contains(&resource.resource_ref()));
        assert_eq!(inner.count(&kind, None), 1);
        assert!(!inner
            .mutations()
            .iter()
            .any(|c| matches!(c, Call::Delete(target) if target.contains(&info.name))));
    }
}
