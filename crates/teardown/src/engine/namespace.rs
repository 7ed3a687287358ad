//! Namespace teardown: sweep contents by kind, then delete the namespace.
//!
//! Some controllers let the namespace shell go before retracting what they
//! manage, which leaves deletion hung on content finalizers. Removing the
//! contents kind by kind first unblocks it.

use std::collections::{HashMap, HashSet};

use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::retry::retry_transient;
use super::TeardownEngine;
use crate::report::{DeletionOutcome, ResourceResult};
use crate::resource::{ApiKind, ManagedResource, ResourceKind};

/// (group, version, kind, plural). Controllers come before what they own so
/// swept pods are not recreated.
const WELL_KNOWN_KINDS: &[(&str, &str, &str, &str)] = &[
    // Workloads
    ("apps", "v1", "Deployment", "deployments"),
    ("apps", "v1", "StatefulSet", "statefulsets"),
    ("apps", "v1", "DaemonSet", "daemonsets"),
    ("apps", "v1", "ReplicaSet", "replicasets"),
    ("batch", "v1", "CronJob", "cronjobs"),
    ("batch", "v1", "Job", "jobs"),
    ("", "v1", "Pod", "pods"),
    // Autoscaling and disruption budgets
    ("autoscaling", "v2", "HorizontalPodAutoscaler", "horizontalpodautoscalers"),
    ("policy", "v1", "PodDisruptionBudget", "poddisruptionbudgets"),
    // Networking
    ("", "v1", "Service", "services"),
    ("networking.k8s.io", "v1", "Ingress", "ingresses"),
    ("networking.k8s.io", "v1", "NetworkPolicy", "networkpolicies"),
    ("gateway.networking.k8s.io", "v1", "HTTPRoute", "httproutes"),
    // Mesh traffic routing and policy
    ("networking.istio.io", "v1", "VirtualService", "virtualservices"),
    ("networking.istio.io", "v1", "DestinationRule", "destinationrules"),
    ("networking.istio.io", "v1", "Gateway", "gateways"),
    ("networking.istio.io", "v1", "ServiceEntry", "serviceentries"),
    ("networking.istio.io", "v1", "Sidecar", "sidecars"),
    ("security.istio.io", "v1", "AuthorizationPolicy", "authorizationpolicies"),
    ("security.istio.io", "v1", "PeerAuthentication", "peerauthentications"),
    ("security.istio.io", "v1", "RequestAuthentication", "requestauthentications"),
    // Config and storage
    ("", "v1", "ConfigMap", "configmaps"),
    ("", "v1", "Secret", "secrets"),
    ("", "v1", "PersistentVolumeClaim", "persistentvolumeclaims"),
    // RBAC
    ("rbac.authorization.k8s.io", "v1", "RoleBinding", "rolebindings"),
    ("rbac.authorization.k8s.io", "v1", "Role", "roles"),
    ("", "v1", "ServiceAccount", "serviceaccounts"),
];

/// Fixed allow-list of namespaced kinds swept before namespace deletion.
#[must_use]
pub fn well_known_namespaced_kinds() -> Vec<ApiKind> {
    WELL_KNOWN_KINDS
        .iter()
        .map(|(group, version, kind, plural)| ApiKind::new(group, version, kind, plural, true))
        .collect()
}

fn is_event_kind(kind: &ApiKind) -> bool {
    kind.kind == "Event"
}

impl TeardownEngine {
    /// Allow-list plus discovered namespaced kinds, deduplicated by group and
    /// kind, events excluded. Allow-listed kinds keep their sweep position but
    /// take the version the cluster serves.
    pub(super) async fn sweep_kinds(&self) -> Vec<ApiKind> {
        let discovered = match self.cluster.namespaced_kinds().await {
            Ok(discovered) => discovered,
            Err(err) => {
                warn!(error = %err, "Kind discovery failed, sweeping well-known kinds only");
                Vec::new()
            }
        };

        let mut served: HashMap<(String, String), ApiKind> = HashMap::new();
        for kind in &discovered {
            served
                .entry((kind.group.clone(), kind.kind.clone()))
                .or_insert_with(|| kind.clone());
        }

        let mut seen = HashSet::new();
        well_known_namespaced_kinds()
            .into_iter()
            .map(|known| {
                served
                    .get(&(known.group.clone(), known.kind.clone()))
                    .cloned()
                    .unwrap_or(known)
            })
            .chain(discovered)
            .filter(|kind| {
                !is_event_kind(kind) && seen.insert((kind.group.clone(), kind.kind.clone()))
            })
            .collect()
    }

    /// Sweep a namespace's contents, then delete it with the namespace budget.
    pub(super) async fn teardown_namespace(&self, resource: &ManagedResource) -> ResourceResult {
        let target = resource.resource_ref();
        let name = resource.name();

        let mut result = ResourceResult {
            resource: resource.clone(),
            outcome: DeletionOutcome::Deleted,
            escalated: false,
            bulk_deletions: 0,
        };

        if let Ok(None) = self.cluster.get(&target).await {
            debug!(namespace = %name, "Namespace already absent");
            return result;
        }

        result.bulk_deletions = self.sweep_namespace(name).await;
        if self.is_cancelled() {
            warn!(namespace = %name, "Run cancelled after sweep, leaving namespace in place");
            result.outcome = DeletionOutcome::TimedOut;
            return result;
        }

        let primary = self.config.timeouts.primary_for(ResourceKind::Namespace);
        let attempt = self.delete_with_escalation(&target, primary).await;
        result.outcome = attempt.outcome;
        result.escalated = attempt.escalated;
        result
    }

    /// Bulk-delete every kind present in the namespace. Returns the number of
    /// collection deletions issued. Errors are logged and skipped.
    async fn sweep_namespace(&self, namespace: &str) -> usize {
        let kinds = self.sweep_kinds().await;
        info!(namespace = %namespace, kinds = kinds.len(), "Sweeping namespace contents");

        let mut deletions = 0;
        for kind in &kinds {
            if self.is_cancelled() {
                warn!(namespace = %namespace, "Run cancelled, stopping namespace sweep");
                break;
            }

            let present = match self.cluster.list(kind, Some(namespace), None).await {
                Ok(items) => items.len(),
                Err(err) if err.is_not_found() => {
                    debug!(kind = %kind, "Kind not served");
                    continue;
                }
                Err(err) => {
                    warn!(namespace = %namespace, kind = %kind, error = %err, "Failed to list");
                    continue;
                }
            };
            if present == 0 {
                continue;
            }

            let deadline = Instant::now() + self.config.timeouts.secondary();
            let result = retry_transient("delete collection", deadline, || {
                self.cluster.delete_collection(kind, Some(namespace))
            })
            .await;

            match result {
                Ok(()) => {
                    debug!(namespace = %namespace, kind = %kind, count = present, "Deleted collection");
                    deletions += 1;
                }
                Err(err) if err.is_not_found() => {}
                Err(err) => {
                    warn!(namespace = %namespace, kind = %kind, error = %err, "Failed to delete collection");
                }
            }
        }
        deletions
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::cluster::memory::Call;
    use crate::cluster::InMemoryCluster;
    use crate::config::TeardownConfig;
    use crate::resource::ResourceRef;

    fn kind(group: &str, kind: &str, plural: &str) -> ApiKind {
        ApiKind::new(group, "v1", kind, plural, true)
    }

    fn engine(cluster: &Arc<InMemoryCluster>) -> TeardownEngine {
        TeardownEngine::new(cluster.clone(), TeardownConfig::default()).unwrap()
    }

    #[test]
    fn test_allow_list_has_no_duplicates_or_events() {
        let kinds = well_known_namespaced_kinds();
        let unique: HashSet<_> = kinds.iter().map(|k| (k.group.clone(), k.kind.clone())).collect();
        assert_eq!(unique.len(), kinds.len());
        assert!(kinds.iter().all(|k| k.namespaced && !is_event_kind(k)));
    }

    #[tokio::test]
    async fn test_sweep_kinds_merges_discovery() {
        let cluster = Arc::new(InMemoryCluster::new());
        cluster.add_namespaced_kind(kind("", "Event", "events"));
        cluster.add_namespaced_kind(kind("events.k8s.io", "Event", "events"));
        cluster.add_namespaced_kind(kind("apps", "Deployment", "deployments"));
        cluster.add_namespaced_kind(kind("agents.platform", "CodeRun", "coderuns"));
        let engine = TeardownEngine::new(cluster, TeardownConfig::default()).unwrap();

        let kinds = engine.sweep_kinds().await;
        assert_eq!(kinds.len(), well_known_namespaced_kinds().len() + 1);
        assert!(kinds.iter().any(|k| k.kind == "CodeRun"));
        assert!(!kinds.iter().any(is_event_kind));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failing_kind_does_not_stop_sweep() {
        let cluster = Arc::new(InMemoryCluster::new());
        let deployments = kind("apps", "Deployment", "deployments");
        let secrets = kind("", "Secret", "secrets");
        cluster.insert(&ResourceRef::namespace("cto"));
        cluster.insert(&ResourceRef::namespaced(deployments.clone(), "cto", "controller"));
        cluster.insert(&ResourceRef::namespaced(secrets.clone(), "cto", "token"));
        cluster.fail_delete_collection(&deployments);
        let engine = TeardownEngine::new(cluster.clone(), TeardownConfig::default()).unwrap();

        let resource = ManagedResource::namespace("cto", 0).unwrap();
        let result = engine.teardown_namespace(&resource).await;

        assert_eq!(result.outcome, DeletionOutcome::Deleted);
        assert_eq!(result.bulk_deletions, 1);
        assert!(cluster.calls().contains(&Call::DeleteCollection {
            kind: "Secret".into(),
            namespace: Some("cto".into()),
        }));
        assert!(!cluster.contains(&ResourceRef::namespace("cto")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_absent_namespace_skips_sweep() {
        let cluster = Arc::new(InMemoryCluster::new());
        let engine = TeardownEngine::new(cluster.clone(), TeardownConfig::default()).unwrap();

        let resource = ManagedResource::namespace("gone", 0).unwrap();
        let result = engine.teardown_namespace(&resource).await;
        assert_eq!(result.outcome, DeletionOutcome::Deleted);
        assert_eq!(result.bulk_deletions, 0);
        assert!(cluster.mutations().is_empty());
    }

    #[tokio::test]
    async fn test_sweep_kinds_prefers_served_version() {
        let cluster = Arc::new(InMemoryCluster::new());
        cluster.add_namespaced_kind(ApiKind::new(
            "networking.istio.io",
            "v1beta1",
            "VirtualService",
            "virtualservices",
            true,
        ));
        let engine = engine(&cluster);

        let kinds = engine.sweep_kinds().await;
        let allow_list = well_known_namespaced_kinds();
        assert_eq!(kinds.len(), allow_list.len());

        let position = allow_list
            .iter()
            .position(|k| k.kind == "VirtualService")
            .unwrap();
        assert_eq!(kinds[position].kind, "VirtualService");
        assert_eq!(kinds[position].api_version(), "networking.istio.io/v1beta1");
        assert!(!kinds
            .iter()
            .any(|k| k.kind == "VirtualService" && k.version == "v1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_namespace_deleted_without_escalation() {
        let cluster = Arc::new(InMemoryCluster::new());
        cluster.insert(&ResourceRef::namespace("empty"));
        let engine = engine(&cluster);

        let result = engine
            .teardown_namespace(&ManagedResource::namespace("empty", 0).unwrap())
            .await;

        assert_eq!(result.outcome, DeletionOutcome::Deleted);
        assert_eq!(result.bulk_deletions, 0);
        assert!(!result.escalated);
        assert!(!cluster
            .mutations()
            .iter()
            .any(|c| matches!(c, Call::DeleteCollection { .. })));
        assert!(!cluster.contains(&ResourceRef::namespace("empty")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stuck_namespace_escalates_within_budget() {
        let cluster = Arc::new(InMemoryCluster::new());
        cluster.insert_stuck_once_deleted(&ResourceRef::namespace("observability"), "kubernetes", 1);
        let engine = engine(&cluster);
        let primary = engine.config().timeouts.primary_for(ResourceKind::Namespace);
        let secondary = engine.config().timeouts.secondary();

        let start = Instant::now();
        let result = engine
            .teardown_namespace(&ManagedResource::namespace("observability", 0).unwrap())
            .await;

        assert_eq!(result.outcome, DeletionOutcome::Deleted);
        assert!(result.escalated);
        assert!(start.elapsed() >= primary);
        assert!(start.elapsed() < primary + secondary);
        assert!(!cluster.contains(&ResourceRef::namespace("observability")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_run_leaves_namespace() {
        let cluster = Arc::new(InMemoryCluster::new());
        cluster.insert(&ResourceRef::namespace("cto"));
        cluster.insert(&ResourceRef::namespaced(
            kind("apps", "Deployment", "deployments"),
            "cto",
            "controller",
        ));
        let engine = engine(&cluster);
        engine.cancellation_token().cancel();

        let result = engine
            .teardown_namespace(&ManagedResource::namespace("cto", 0).unwrap())
            .await;

        assert_eq!(result.outcome, DeletionOutcome::TimedOut);
        assert!(cluster.mutations().is_empty());
        assert!(cluster.contains(&ResourceRef::namespace("cto")));
    }
}
