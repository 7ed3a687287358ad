//! In-memory [`ClusterApi`] used by tests.
//!
//! Objects follow API server deletion semantics: a delete on an object with
//! finalizers only marks it terminating, and a terminating object disappears
//! once its finalizer list is empty. Deleting a namespace removes its
//! contents; deleting a CRD removes its instances. Every call is recorded.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::Utc;

use super::{ClusterApi, CrdInfo, ObjectState, ObjectSummary};
use crate::error::ClusterError;
use crate::resource::{ApiKind, ResourceRef};

/// A recorded cluster call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Get(String),
    List(String),
    ClearFinalizers(String),
    Delete(String),
    DeleteCollection { kind: String, namespace: Option<String> },
}

impl Call {
    /// Whether the call changes cluster state.
    #[must_use]
    pub fn is_mutation(&self) -> bool {
        matches!(
            self,
            Self::ClearFinalizers(_) | Self::Delete(_) | Self::DeleteCollection { .. }
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
struct ObjectKey {
    group: String,
    kind: String,
    namespace: Option<String>,
    name: String,
}

impl ObjectKey {
    fn of(target: &ResourceRef) -> Self {
        Self {
            group: target.kind.group.clone(),
            kind: target.kind.kind.clone(),
            namespace: target.namespace.clone(),
            name: target.name.clone(),
        }
    }

    fn is_kind(&self, kind: &ApiKind) -> bool {
        self.group == kind.group && self.kind == kind.kind
    }
}

#[derive(Debug, Clone, Default)]
struct FakeObject {
    finalizers: Vec<String>,
    deletion_timestamp: Option<String>,
    labels: BTreeMap<String, String>,
    /// Delete requests on which a controller re-adds `readd_finalizer`.
    readd_on_delete: u32,
    readd_finalizer: Option<String>,
    /// Finalizer restored immediately after every clear.
    pinned_finalizer: Option<String>,
}

#[derive(Default)]
struct State {
    objects: BTreeMap<ObjectKey, FakeObject>,
    namespaced_kinds: Vec<ApiKind>,
    crds: Vec<CrdInfo>,
    calls: Vec<Call>,
    failing_collections: HashSet<(String, String)>,
    transient_deletes: HashMap<ObjectKey, u32>,
}

/// In-memory cluster emulating deletion semantics.
#[derive(Default)]
pub struct InMemoryCluster {
    state: Mutex<State>,
}

impl InMemoryCluster {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn put(&self, target: &ResourceRef, object: FakeObject) {
        self.lock().objects.insert(ObjectKey::of(target), object);
    }

    /// Add an object without finalizers.
    pub fn insert(&self, target: &ResourceRef) {
        self.put(target, FakeObject::default());
    }

    /// Add an object carrying labels.
    pub fn insert_labeled(&self, target: &ResourceRef, labels: &[(&str, &str)]) {
        self.put(
            target,
            FakeObject {
                labels: labels
                    .iter()
                    .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
                    .collect(),
                ..FakeObject::default()
            },
        );
    }

    /// Add an object carrying finalizers.
    pub fn insert_with_finalizers(&self, target: &ResourceRef, finalizers: &[&str]) {
        self.put(
            target,
            FakeObject {
                finalizers: finalizers.iter().map(ToString::to_string).collect(),
                ..FakeObject::default()
            },
        );
    }

    /// Add an object whose controller re-adds `finalizer` on the next `times`
    /// delete requests, leaving it terminating until finalizers are cleared
    /// again.
    pub fn insert_stuck_once_deleted(&self, target: &ResourceRef, finalizer: &str, times: u32) {
        self.put(
            target,
            FakeObject {
                readd_on_delete: times,
                readd_finalizer: Some(finalizer.to_string()),
                ..FakeObject::default()
            },
        );
    }

    /// Add an object that can never be removed: its finalizer is restored
    /// after every clear.
    pub fn insert_pinned(&self, target: &ResourceRef, finalizer: &str) {
        self.put(
            target,
            FakeObject {
                finalizers: vec![finalizer.to_string()],
                pinned_finalizer: Some(finalizer.to_string()),
                ..FakeObject::default()
            },
        );
    }

    /// Register a namespaced kind returned by discovery.
    pub fn add_namespaced_kind(&self, kind: ApiKind) {
        self.lock().namespaced_kinds.push(kind);
    }

    /// Register a CRD and create its definition object.
    pub fn add_crd(&self, crd: CrdInfo) {
        let target = ResourceRef::cluster(ApiKind::custom_resource_definition(), &crd.name);
        let mut state = self.lock();
        state.objects.insert(ObjectKey::of(&target), FakeObject::default());
        state.crds.push(crd);
    }

    /// Make `delete_collection` fail for a kind.
    pub fn fail_delete_collection(&self, kind: &ApiKind) {
        self.lock()
            .failing_collections
            .insert((kind.group.clone(), kind.kind.clone()));
    }

    /// Make the next `times` delete requests for `target` fail transiently.
    pub fn fail_deletes_transiently(&self, target: &ResourceRef, times: u32) {
        self.lock()
            .transient_deletes
            .insert(ObjectKey::of(target), times);
    }

    /// Whether the object currently exists.
    #[must_use]
    pub fn contains(&self, target: &ResourceRef) -> bool {
        self.lock().objects.contains_key(&ObjectKey::of(target))
    }

    /// Number of objects of a kind, optionally within one namespace.
    #[must_use]
    pub fn count(&self, kind: &ApiKind, namespace: Option<&str>) -> usize {
        self.lock()
            .objects
            .keys()
            .filter(|k| k.is_kind(kind) && (namespace.is_none() || k.namespace.as_deref() == namespace))
            .count()
    }

    /// Every call made so far, in order.
    #[must_use]
    pub fn calls(&self) -> Vec<Call> {
        self.lock().calls.clone()
    }

    /// Only the calls that change state.
    #[must_use]
    pub fn mutations(&self) -> Vec<Call> {
        self.calls().into_iter().filter(Call::is_mutation).collect()
    }
}

impl State {
    fn record(&mut self, call: Call) {
        self.calls.push(call);
    }

    /// Apply a delete request to one object.
    fn request_delete(&mut self, key: &ObjectKey) {
        let Some(object) = self.objects.get_mut(key) else {
            return;
        };

        if object.readd_on_delete > 0 {
            object.readd_on_delete -= 1;
            if let Some(finalizer) = object.readd_finalizer.clone() {
                if !object.finalizers.contains(&finalizer) {
                    object.finalizers.push(finalizer);
                }
            }
        }

        if object.deletion_timestamp.is_none() {
            object.deletion_timestamp = Some(Utc::now().to_rfc3339());
        }

        if object.finalizers.is_empty() {
            self.remove(key);
        }
    }

    /// Remove an object and everything it owns.
    fn remove(&mut self, key: &ObjectKey) {
        self.objects.remove(key);

        if key.group.is_empty() && key.kind == "Namespace" {
            let name = key.name.clone();
            self.objects
                .retain(|k, _| k.namespace.as_deref() != Some(name.as_str()));
        }

        if key.kind == "CustomResourceDefinition" {
            if let Some(pos) = self.crds.iter().position(|c| c.name == key.name) {
                let crd = self.crds.remove(pos);
                self.objects
                    .retain(|k, _| !(k.group == crd.group && k.kind == crd.kind));
            }
        }
    }
}

fn matches_selector(labels: &BTreeMap<String, String>, selector: &str) -> bool {
    selector
        .split(',')
        .map(str::trim)
        .filter(|term| !term.is_empty())
        .all(|term| match term.split_once('=') {
            Some((key, value)) => labels.get(key.trim()).map(String::as_str) == Some(value.trim()),
            None => labels.contains_key(term),
        })
}

#[async_trait]
impl ClusterApi for InMemoryCluster {
    async fn get(&self, target: &ResourceRef) -> Result<Option<ObjectState>, ClusterError> {
        let mut state = self.lock();
        state.record(Call::Get(target.to_string()));
        Ok(state.objects.get(&ObjectKey::of(target)).map(|o| ObjectState {
            finalizers: o.finalizers.clone(),
            deletion_timestamp: o.deletion_timestamp.clone(),
            phase: o.deletion_timestamp.as_ref().map(|_| "Terminating".to_string()),
        }))
    }

    async fn list(
        &self,
        kind: &ApiKind,
        namespace: Option<&str>,
        label_selector: Option<&str>,
    ) -> Result<Vec<ObjectSummary>, ClusterError> {
        let mut state = self.lock();
        state.record(Call::List(kind.to_string()));
        Ok(state
            .objects
            .iter()
            .filter(|(k, _)| k.is_kind(kind))
            .filter(|(k, _)| namespace.is_none() || k.namespace.as_deref() == namespace)
            .filter(|(_, o)| label_selector.map_or(true, |s| matches_selector(&o.labels, s)))
            .map(|(k, o)| ObjectSummary {
                name: k.name.clone(),
                namespace: k.namespace.clone(),
                labels: o.labels.clone(),
            })
            .collect())
    }

    async fn clear_finalizers(&self, target: &ResourceRef) -> Result<(), ClusterError> {
        let mut state = self.lock();
        state.record(Call::ClearFinalizers(target.to_string()));

        let key = ObjectKey::of(target);
        let Some(object) = state.objects.get_mut(&key) else {
            return Err(ClusterError::NotFound(target.to_string()));
        };

        object.finalizers.clear();
        if let Some(pinned) = object.pinned_finalizer.clone() {
            object.finalizers.push(pinned);
        }

        if object.deletion_timestamp.is_some() && object.finalizers.is_empty() {
            state.remove(&key);
        }
        Ok(())
    }

    async fn delete(&self, target: &ResourceRef) -> Result<(), ClusterError> {
        let mut state = self.lock();
        state.record(Call::Delete(target.to_string()));

        let key = ObjectKey::of(target);
        if let Some(remaining) = state.transient_deletes.get_mut(&key) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(ClusterError::Transient("etcdserver: request timed out".into()));
            }
        }

        if !state.objects.contains_key(&key) {
            return Err(ClusterError::NotFound(target.to_string()));
        }
        state.request_delete(&key);
        Ok(())
    }

    async fn delete_collection(
        &self,
        kind: &ApiKind,
        namespace: Option<&str>,
    ) -> Result<(), ClusterError> {
        let mut state = self.lock();
        state.record(Call::DeleteCollection {
            kind: kind.to_string(),
            namespace: namespace.map(ToString::to_string),
        });

        if state
            .failing_collections
            .contains(&(kind.group.clone(), kind.kind.clone()))
        {
            return Err(ClusterError::Api {
                code: 403,
                message: format!("deletecollection on {kind} is forbidden"),
            });
        }

        let keys: Vec<ObjectKey> = state
            .objects
            .keys()
            .filter(|k| k.is_kind(kind))
            .filter(|k| namespace.is_none() || k.namespace.as_deref() == namespace)
            .cloned()
            .collect();
        for key in &keys {
            state.request_delete(key);
        }
        Ok(())
    }

    async fn namespaced_kinds(&self) -> Result<Vec<ApiKind>, ClusterError> {
        Ok(self.lock().namespaced_kinds.clone())
    }

    async fn custom_resource_definitions(&self) -> Result<Vec<CrdInfo>, ClusterError> {
        Ok(self.lock().crds.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn deployment(ns: &str, name: &str) -> ResourceRef {
        ResourceRef::namespaced(
            ApiKind::new("apps", "v1", "Deployment", "deployments", true),
            ns,
            name,
        )
    }

    #[tokio::test]
    async fn test_finalizers_block_removal() {
        let cluster = InMemoryCluster::new();
        let target = ResourceRef::namespace("cto");
        cluster.insert_with_finalizers(&target, &["kubernetes"]);

        cluster.delete(&target).await.unwrap();
        let state = cluster.get(&target).await.unwrap().unwrap();
        assert!(state.deletion_timestamp.is_some());

        cluster.clear_finalizers(&target).await.unwrap();
        assert!(!cluster.contains(&target));
        assert!(cluster.delete(&target).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_namespace_removal_cascades() {
        let cluster = InMemoryCluster::new();
        cluster.insert(&ResourceRef::namespace("cto"));
        cluster.insert(&deployment("cto", "api"));
        cluster.insert(&deployment("other", "api"));

        cluster.delete(&ResourceRef::namespace("cto")).await.unwrap();
        assert!(!cluster.contains(&deployment("cto", "api")));
        assert!(cluster.contains(&deployment("other", "api")));
    }

    #[tokio::test]
    async fn test_label_selector() {
        let cluster = InMemoryCluster::new();
        let kind = ApiKind::new("rbac.authorization.k8s.io", "v1", "ClusterRole", "clusterroles", false);
        cluster.insert_labeled(
            &ResourceRef::cluster(kind.clone(), "a"),
            &[("app.kubernetes.io/part-of", "cto-platform")],
        );
        cluster.insert(&ResourceRef::cluster(kind.clone(), "b"));

        let found = cluster
            .list(&kind, None, Some("app.kubernetes.io/part-of=cto-platform"))
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].name, "a");
        assert_eq!(cluster.list(&kind, None, None).await.unwrap().len(), 2);
    }

    #[test]
    fn test_matches_selector() {
        let labels: BTreeMap<String, String> = [("a".to_string(), "1".to_string())].into();
        assert!(matches_selector(&labels, "a=1"));
        assert!(matches_selector(&labels, "a"));
        assert!(!matches_selector(&labels, "a=2"));
        assert!(!matches_selector(&labels, "a=1,b"));
    }
}
