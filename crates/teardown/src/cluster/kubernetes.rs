//! [`ClusterApi`] backed by a Kubernetes API server.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{
    Api, ApiResource, DeleteParams, DynamicObject, ListParams, Patch, PatchParams, PostParams,
};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::core::GroupVersionKind;
use kube::discovery::{verbs, Discovery, Scope};
use kube::runtime::conditions::is_deleted;
use kube::runtime::wait::await_condition;
use kube::{Client, Config, ResourceExt};
use serde_json::json;
use tokio::time::Instant;
use tracing::debug;

use super::{poll_for_absence, ClusterApi, CrdInfo, ObjectState, ObjectSummary};
use crate::error::ClusterError;
use crate::resource::{ApiKind, ResourceRef};

/// Kubernetes cluster client.
#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
}

impl KubeCluster {
    /// Wrap an existing client.
    #[must_use]
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Connect using an explicit kubeconfig and/or context, falling back to
    /// the default client configuration (in-cluster or `~/.kube/config`).
    ///
    /// # Errors
    ///
    /// Returns an error if the kubeconfig cannot be read or the client cannot be created.
    pub async fn connect(kubeconfig: Option<&Path>, context: Option<&str>) -> Result<Self> {
        let options = KubeConfigOptions {
            context: context.map(ToString::to_string),
            ..KubeConfigOptions::default()
        };

        let config = match kubeconfig {
            Some(path) => {
                let kubeconfig = Kubeconfig::read_from(path)
                    .with_context(|| format!("Failed to read kubeconfig from {}", path.display()))?;
                Config::from_custom_kubeconfig(kubeconfig, &options)
                    .await
                    .context("Failed to create Kubernetes config from kubeconfig")?
            }
            None if context.is_some() => Config::from_kubeconfig(&options)
                .await
                .context("Failed to load kubeconfig context")?,
            None => Config::infer()
                .await
                .context("Failed to infer Kubernetes configuration")?,
        };

        let client = Client::try_from(config).context("Failed to create Kubernetes client")?;
        Ok(Self { client })
    }

    fn api(&self, kind: &ApiKind, namespace: Option<&str>) -> Api<DynamicObject> {
        let resource = api_resource(kind);
        match namespace {
            Some(ns) if kind.namespaced => Api::namespaced_with(self.client.clone(), ns, &resource),
            _ => Api::all_with(self.client.clone(), &resource),
        }
    }

    fn api_for(&self, target: &ResourceRef) -> Api<DynamicObject> {
        self.api(&target.kind, target.namespace.as_deref())
    }

    /// Empty `spec.finalizers` of a terminating namespace through the
    /// `finalize` subresource. Metadata finalizers do not cover these.
    async fn finalize_namespace(&self, target: &ResourceRef) -> Result<(), ClusterError> {
        let api = self.api_for(target);
        let Some(mut namespace) = api.get_opt(&target.name).await? else {
            return Ok(());
        };

        let terminating = namespace.metadata.deletion_timestamp.is_some();
        let has_spec_finalizers = namespace
            .data
            .pointer("/spec/finalizers")
            .and_then(|f| f.as_array())
            .is_some_and(|f| !f.is_empty());

        if terminating && has_spec_finalizers {
            debug!(namespace = %target.name, "Clearing namespace spec finalizers");
            namespace.data["spec"]["finalizers"] = json!([]);
            let body = serde_json::to_vec(&namespace)?;
            api.replace_subresource("finalize", &target.name, &PostParams::default(), body)
                .await?;
        }
        Ok(())
    }
}

#[async_trait]
impl ClusterApi for KubeCluster {
    async fn get(&self, target: &ResourceRef) -> Result<Option<ObjectState>, ClusterError> {
        let object = self.api_for(target).get_opt(&target.name).await?;
        Ok(object.as_ref().map(object_state))
    }

    async fn list(
        &self,
        kind: &ApiKind,
        namespace: Option<&str>,
        label_selector: Option<&str>,
    ) -> Result<Vec<ObjectSummary>, ClusterError> {
        let mut params = ListParams::default();
        if let Some(selector) = label_selector {
            params = params.labels(selector);
        }

        let list = self.api(kind, namespace).list(&params).await?;
        Ok(list
            .items
            .into_iter()
            .map(|obj| ObjectSummary {
                name: obj.metadata.name.unwrap_or_default(),
                namespace: obj.metadata.namespace,
                labels: obj.metadata.labels.unwrap_or_default(),
            })
            .collect())
    }

    async fn clear_finalizers(&self, target: &ResourceRef) -> Result<(), ClusterError> {
        let patch = json!({ "metadata": { "finalizers": null } });
        self.api_for(target)
            .patch(&target.name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;

        if target.kind == ApiKind::namespace() {
            self.finalize_namespace(target).await?;
        }
        Ok(())
    }

    async fn delete(&self, target: &ResourceRef) -> Result<(), ClusterError> {
        self.api_for(target)
            .delete(&target.name, &DeleteParams::background())
            .await?;
        Ok(())
    }

    async fn delete_collection(
        &self,
        kind: &ApiKind,
        namespace: Option<&str>,
    ) -> Result<(), ClusterError> {
        self.api(kind, namespace)
            .delete_collection(&DeleteParams::background(), &ListParams::default())
            .await?;
        Ok(())
    }

    async fn namespaced_kinds(&self) -> Result<Vec<ApiKind>, ClusterError> {
        let discovery = Discovery::new(self.client.clone())
            .exclude(&["events.k8s.io", "metrics.k8s.io"])
            .run()
            .await?;

        let mut kinds = Vec::new();
        for group in discovery.groups() {
            for (resource, caps) in group.recommended_resources() {
                if caps.scope != Scope::Namespaced || resource.kind == "Event" {
                    continue;
                }
                if !caps.supports_operation(verbs::LIST)
                    || !caps.supports_operation(verbs::DELETE_COLLECTION)
                {
                    continue;
                }
                kinds.push(ApiKind::new(
                    &resource.group,
                    &resource.version,
                    &resource.kind,
                    &resource.plural,
                    true,
                ));
            }
        }
        Ok(kinds)
    }

    async fn custom_resource_definitions(&self) -> Result<Vec<CrdInfo>, ClusterError> {
        let api: Api<CustomResourceDefinition> = Api::all(self.client.clone());
        let list = api.list(&ListParams::default()).await?;
        Ok(list.items.iter().filter_map(crd_info).collect())
    }

    async fn custom_resource_definition(
        &self,
        name: &str,
    ) -> Result<Option<CrdInfo>, ClusterError> {
        let api: Api<CustomResourceDefinition> = Api::all(self.client.clone());
        Ok(api.get_opt(name).await?.as_ref().and_then(crd_info))
    }

    /// Watches for the deletion of the object's current UID. Falls back to
    /// polling when the object cannot be read or the watch fails.
    async fn wait_for_absence(
        &self,
        target: &ResourceRef,
        timeout: Duration,
        poll_interval: Duration,
    ) -> bool {
        let deadline = Instant::now() + timeout;
        let api = self.api_for(target);
        let uid = match api.get_opt(&target.name).await {
            Ok(None) => return true,
            Ok(Some(object)) => object.uid(),
            Err(err) => {
                debug!(resource = %target, error = %err, "Existence unknown, polling instead");
                None
            }
        };
        let Some(uid) = uid else {
            let remaining = deadline.saturating_duration_since(Instant::now());
            return poll_for_absence(self, target, remaining, poll_interval).await;
        };

        let deleted = await_condition(api, &target.name, is_deleted(&uid));
        match tokio::time::timeout_at(deadline, deleted).await {
            Ok(Ok(_)) => true,
            Ok(Err(err)) => {
                debug!(resource = %target, error = %err, "Watch failed, polling instead");
                let remaining = deadline.saturating_duration_since(Instant::now());
                poll_for_absence(self, target, remaining, poll_interval).await
            }
            Err(_elapsed) => matches!(self.get(target).await, Ok(None)),
        }
    }
}

fn api_resource(kind: &ApiKind) -> ApiResource {
    let gvk = GroupVersionKind::gvk(&kind.group, &kind.version, &kind.kind);
    ApiResource::from_gvk_with_plural(&gvk, &kind.plural)
}

fn object_state(object: &DynamicObject) -> ObjectState {
    ObjectState {
        finalizers: object.metadata.finalizers.clone().unwrap_or_default(),
        deletion_timestamp: object
            .metadata
            .deletion_timestamp
            .as_ref()
            .map(|ts| ts.0.to_rfc3339()),
        phase: object
            .data
            .pointer("/status/phase")
            .and_then(|p| p.as_str())
            .map(ToString::to_string),
    }
}

fn crd_info(crd: &CustomResourceDefinition) -> Option<CrdInfo> {
    let spec = &crd.spec;
    let version = spec
        .versions
        .iter()
        .find(|v| v.storage)
        .or_else(|| spec.versions.iter().find(|v| v.served))?;

    Some(CrdInfo {
        name: crd.metadata.name.clone()?,
        group: spec.group.clone(),
        kind: spec.names.kind.clone(),
        plural: spec.names.plural.clone(),
        version: version.name.clone(),
        namespaced: spec.scope == "Namespaced",
        labels: crd.metadata.labels.clone().unwrap_or_default(),
    })
}
