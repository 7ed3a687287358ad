//! Turns a requested scope into a rank-ordered deletion plan.

use std::fmt;

use tracing::info;

use super::TeardownEngine;
use crate::error::TeardownError;
use crate::plan::DeletionPlan;
use crate::resource::ManagedResource;

/// What a run tears down.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TeardownScope {
    /// Applications, then namespaces, then cluster objects, then CRDs.
    All,
    /// One ArgoCD application.
    Application(String),
    /// One namespace, swept of its contents.
    Namespace(String),
    /// Every platform CRD and its instances.
    Crds,
}

impl fmt::Display for TeardownScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::All => write!(f, "all platform resources"),
            Self::Application(name) => write!(f, "application {name}"),
            Self::Namespace(name) => write!(f, "namespace {name}"),
            Self::Crds => write!(f, "platform CRDs"),
        }
    }
}

impl TeardownEngine {
    /// Build the deletion plan for `scope`. Read-only against the cluster.
    ///
    /// For a full teardown, applications keep their configured ranks and the
    /// later phases are ranked after the last application so that admission
    /// webhooks outlive the workloads they validate.
    ///
    /// # Errors
    ///
    /// Returns an error if a name is invalid or CRDs cannot be listed.
    pub async fn plan(&self, scope: &TeardownScope) -> Result<DeletionPlan, TeardownError> {
        let config = &self.config;
        let resources = match scope {
            TeardownScope::All => {
                let last_app = config.max_application_rank();
                let phase = |offset: u32| {
                    last_app.checked_add(offset).ok_or_else(|| {
                        TeardownError::Invalid(format!("application rank {last_app} is too large"))
                    })
                };
                let mut resources = config
                    .applications
                    .iter()
                    .map(|app| {
                        ManagedResource::application(&config.argocd_namespace, &app.name, app.rank)
                    })
                    .collect::<Result<Vec<_>, _>>()?;

                for namespace in &config.namespaces {
                    resources.push(ManagedResource::namespace(namespace, phase(1)?)?);
                }
                resources.extend(self.discover_cluster_objects(phase(2)?).await?);
                resources.extend(self.crd_resources(phase(3)?).await?);
                resources
            }
            TeardownScope::Application(name) => {
                vec![ManagedResource::application(&config.argocd_namespace, name, 0)?]
            }
            TeardownScope::Namespace(name) => vec![ManagedResource::namespace(name, 0)?],
            TeardownScope::Crds => self.crd_resources(0).await?,
        };

        let plan = DeletionPlan::new(resources)?;
        info!(scope = %scope, resources = plan.len(), ranks = plan.groups().len(), "Planned teardown");
        Ok(plan)
    }

    async fn crd_resources(&self, rank: u32) -> Result<Vec<ManagedResource>, TeardownError> {
        self.discover_crds()
            .await?
            .iter()
            .map(|crd| ManagedResource::crd(&crd.name, rank))
            .collect()
    }
}
