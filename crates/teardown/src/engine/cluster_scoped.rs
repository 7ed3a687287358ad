//! Cluster-scoped RBAC and admission objects owned by the platform.

use std::collections::BTreeSet;

use tracing::{debug, warn};

use super::TeardownEngine;
use crate::error::TeardownError;
use crate::resource::{ClusterObjectKind, ManagedResource};

impl TeardownEngine {
    /// Configured cluster objects plus every object of the managed kinds
    /// carrying a configured ownership label, at `rank`.
    ///
    /// Listing failures are logged; the named objects are still returned.
    ///
    /// # Errors
    ///
    /// Returns [`TeardownError::Invalid`] if a discovered name is malformed.
    pub async fn discover_cluster_objects(
        &self,
        rank: u32,
    ) -> Result<Vec<ManagedResource>, TeardownError> {
        let mut selected: BTreeSet<(ClusterObjectKind, String)> = self
            .config
            .cluster_objects
            .iter()
            .map(|entry| (entry.kind, entry.name.clone()))
            .collect();

        for selector in &self.config.cluster_object_labels {
            for kind in ClusterObjectKind::ALL {
                match self.cluster.list(&kind.api_kind(), None, Some(selector)).await {
                    Ok(objects) => {
                        debug!(kind = %kind, selector = %selector, count = objects.len(), "Listed labeled objects");
                        selected.extend(objects.into_iter().map(|o| (kind, o.name)));
                    }
                    Err(err) => {
                        warn!(kind = %kind, selector = %selector, error = %err, "Failed to list labeled objects");
                    }
                }
            }
        }

        selected
            .into_iter()
            .map(|(kind, name)| ManagedResource::cluster_object(kind, &name, rank))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::cluster::InMemoryCluster;
    use crate::config::{ClusterObjectEntry, TeardownConfig, PART_OF_LABEL};
    use crate::resource::ResourceRef;

    #[tokio::test]
    async fn test_names_and_labels_are_merged() {
        let cluster = Arc::new(InMemoryCluster::new());
        let roles = ClusterObjectKind::ClusterRole.api_kind();
        cluster.insert_labeled(
            &ResourceRef::cluster(roles.clone(), "controller"),
            &[("app.kubernetes.io/part-of", "cto-platform")],
        );
        cluster.insert_labeled(
            &ResourceRef::cluster(roles.clone(), "cto:agent-reader"),
            &[("app.kubernetes.io/part-of", "cto-platform")],
        );
        cluster.insert(&ResourceRef::cluster(roles, "cluster-admin"));

        let config = TeardownConfig {
            cluster_objects: vec![ClusterObjectEntry {
                kind: ClusterObjectKind::ClusterRole,
                name: "controller".to_string(),
            }],
            cluster_object_labels: vec![PART_OF_LABEL.to_string()],
            ..TeardownConfig::default()
        };
        let engine = TeardownEngine::new(cluster, config).unwrap();

        let objects = engine.discover_cluster_objects(9).await.unwrap();
        let names: Vec<&str> = objects.iter().map(ManagedResource::name).collect();
        assert_eq!(names, vec!["controller", "cto:agent-reader"]);
        assert!(objects.iter().all(|o| o.rank() == 9));
    }
}
