//! Teardown configuration.
//!
//! Defaults mirror the platform's GitOps layout: the app-of-apps goes first so
//! ArgoCD stops re-syncing children, then the platform services, then the
//! operators and mesh they depend on.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::TeardownError;
use crate::resource::{validate_name, validate_segment_name, ClusterObjectKind, ResourceKind};

/// Default label carried by every platform-owned object.
pub const PART_OF_LABEL: &str = "app.kubernetes.io/part-of=cto-platform";

/// Highest application rank; namespaces, cluster objects and CRDs are
/// planned in the three ranks after the last application.
pub const MAX_APPLICATION_RANK: u32 = u32::MAX - 3;

/// An ArgoCD application and the rank it is deleted at.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplicationEntry {
    pub name: String,
    #[serde(default)]
    pub rank: u32,
}

impl ApplicationEntry {
    fn new(name: &str, rank: u32) -> Self {
        Self {
            name: name.to_string(),
            rank,
        }
    }
}

/// A cluster-scoped object selected by name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterObjectEntry {
    pub kind: ClusterObjectKind,
    pub name: String,
}

impl ClusterObjectEntry {
    fn new(kind: ClusterObjectKind, name: &str) -> Self {
        Self {
            kind,
            name: name.to_string(),
        }
    }
}

/// Wait budgets, in seconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Timeouts {
    /// Primary wait for ArgoCD applications.
    pub application_secs: u64,
    /// Primary wait for namespaces (child cleanup behind finalizers is slow).
    pub namespace_secs: u64,
    /// Primary wait for CRDs and their instances.
    pub crd_secs: u64,
    /// Primary wait for cluster-scoped objects.
    pub cluster_object_secs: u64,
    /// Wait after the finalizer-clear + re-delete escalation.
    pub secondary_secs: u64,
    /// Interval between existence polls.
    pub poll_interval_secs: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            application_secs: 120,
            namespace_secs: 300,
            crd_secs: 120,
            cluster_object_secs: 120,
            secondary_secs: 30,
            poll_interval_secs: 2,
        }
    }
}

impl Timeouts {
    /// Primary wait budget for a resource kind.
    #[must_use]
    pub fn primary_for(&self, kind: ResourceKind) -> Duration {
        let secs = match kind {
            ResourceKind::Application => self.application_secs,
            ResourceKind::Namespace => self.namespace_secs,
            ResourceKind::Crd => self.crd_secs,
            ResourceKind::ClusterScoped(_) => self.cluster_object_secs,
        };
        Duration::from_secs(secs)
    }

    #[must_use]
    pub fn secondary(&self) -> Duration {
        Duration::from_secs(self.secondary_secs)
    }

    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    fn validate(&self) -> Result<(), TeardownError> {
        let primaries = [
            ("application", self.application_secs),
            ("namespace", self.namespace_secs),
            ("crd", self.crd_secs),
            ("cluster_object", self.cluster_object_secs),
        ];

        if self.secondary_secs == 0 {
            return Err(TeardownError::Invalid(
                "secondary timeout must be greater than zero".to_string(),
            ));
        }
        if self.poll_interval_secs == 0 {
            return Err(TeardownError::Invalid(
                "poll interval must be greater than zero".to_string(),
            ));
        }

        for (name, secs) in primaries {
            if secs <= self.secondary_secs {
                return Err(TeardownError::Invalid(format!(
                    "{name} timeout ({secs}s) must be longer than the secondary timeout ({}s)",
                    self.secondary_secs
                )));
            }
        }
        Ok(())
    }
}

/// Full teardown configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TeardownConfig {
    /// Namespace holding the ArgoCD `Application` objects.
    pub argocd_namespace: String,
    /// Applications in deletion order.
    pub applications: Vec<ApplicationEntry>,
    /// Namespaces swept and deleted after the applications.
    pub namespaces: Vec<String>,
    /// CRD ownership patterns (API group domains).
    pub crd_patterns: Vec<String>,
    /// CRD management labels (`key=value` or `key`).
    pub crd_labels: Vec<String>,
    /// Cluster-scoped objects selected by name.
    pub cluster_objects: Vec<ClusterObjectEntry>,
    /// Label selectors for cluster-scoped objects.
    pub cluster_object_labels: Vec<String>,
    pub timeouts: Timeouts,
    /// Resources of the same rank deleted in parallel.
    pub concurrency: usize,
    /// Overall run deadline in seconds.
    pub deadline_secs: Option<u64>,
}

impl Default for TeardownConfig {
    fn default() -> Self {
        Self {
            argocd_namespace: "argocd".to_string(),
            applications: vec![
                ApplicationEntry::new("platform-apps", 0),
                ApplicationEntry::new("controller", 1),
                ApplicationEntry::new("argo-workflows", 2),
                ApplicationEntry::new("argo-events", 2),
                ApplicationEntry::new("grafana", 3),
                ApplicationEntry::new("loki", 3),
                ApplicationEntry::new("alertmanager", 3),
                ApplicationEntry::new("prometheus", 3),
                ApplicationEntry::new("postgres-operator", 4),
                ApplicationEntry::new("redis-operator", 4),
                ApplicationEntry::new("questdb-operator", 4),
                ApplicationEntry::new("cert-manager", 5),
                ApplicationEntry::new("istiod", 5),
                ApplicationEntry::new("istio-base", 6),
            ],
            namespaces: [
                "cto",
                "argo",
                "observability",
                "postgres-operator",
                "redis-operator",
                "questdb-operator",
                "cert-manager",
                "istio-system",
            ]
            .iter()
            .map(ToString::to_string)
            .collect(),
            crd_patterns: [
                "agents.platform",
                "istio.io",
                "cert-manager.io",
                "gateway.networking.k8s.io",
                "monitoring.coreos.com",
            ]
            .iter()
            .map(ToString::to_string)
            .collect(),
            crd_labels: vec![PART_OF_LABEL.to_string()],
            cluster_objects: vec![
                ClusterObjectEntry::new(
                    ClusterObjectKind::ValidatingWebhookConfiguration,
                    "istio-validator-istio-system",
                ),
                ClusterObjectEntry::new(
                    ClusterObjectKind::ValidatingWebhookConfiguration,
                    "istiod-default-validator",
                ),
                ClusterObjectEntry::new(
                    ClusterObjectKind::MutatingWebhookConfiguration,
                    "istio-sidecar-injector",
                ),
                ClusterObjectEntry::new(
                    ClusterObjectKind::ValidatingWebhookConfiguration,
                    "cert-manager-webhook",
                ),
                ClusterObjectEntry::new(
                    ClusterObjectKind::MutatingWebhookConfiguration,
                    "cert-manager-webhook",
                ),
                ClusterObjectEntry::new(ClusterObjectKind::ClusterRoleBinding, "controller"),
                ClusterObjectEntry::new(ClusterObjectKind::ClusterRole, "controller"),
            ],
            cluster_object_labels: vec![PART_OF_LABEL.to_string()],
            timeouts: Timeouts::default(),
            concurrency: 4,
            deadline_secs: None,
        }
    }
}

impl TeardownConfig {
    /// Load configuration from a YAML file. Missing fields take defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> Result<Self, TeardownError> {
        let contents = std::fs::read_to_string(path).map_err(|source| TeardownError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_yaml(&contents)
    }

    /// Parse configuration from YAML text.
    ///
    /// # Errors
    ///
    /// Returns [`TeardownError::Parse`] on malformed YAML.
    pub fn from_yaml(contents: &str) -> Result<Self, TeardownError> {
        Ok(serde_yaml::from_str(contents)?)
    }

    /// Overall run deadline.
    #[must_use]
    pub fn deadline(&self) -> Option<Duration> {
        self.deadline_secs.map(Duration::from_secs)
    }

    /// Highest configured application rank.
    #[must_use]
    pub fn max_application_rank(&self) -> u32 {
        self.applications.iter().map(|a| a.rank).max().unwrap_or(0)
    }

    /// Check every identifier and numeric setting.
    ///
    /// # Errors
    ///
    /// Returns [`TeardownError::Invalid`] describing the first problem found.
    pub fn validate(&self) -> Result<(), TeardownError> {
        validate_name(&self.argocd_namespace)?;
        for app in &self.applications {
            validate_name(&app.name)?;
            if app.rank > MAX_APPLICATION_RANK {
                return Err(TeardownError::Invalid(format!(
                    "application '{}' rank {} exceeds {MAX_APPLICATION_RANK}",
                    app.name, app.rank
                )));
            }
        }
        for ns in &self.namespaces {
            validate_name(ns)?;
        }
        for object in &self.cluster_objects {
            validate_segment_name(&object.name)?;
        }
        for pattern in &self.crd_patterns {
            let trimmed = pattern.trim_start_matches('.');
            validate_name(trimmed).map_err(|_| {
                TeardownError::Invalid(format!("CRD pattern '{pattern}' is not a domain"))
            })?;
        }
        for label in self.crd_labels.iter().chain(&self.cluster_object_labels) {
            if label.trim().is_empty() {
                return Err(TeardownError::Invalid("empty label selector".to_string()));
            }
        }

        if self.concurrency == 0 {
            return Err(TeardownError::Invalid(
                "concurrency must be at least 1".to_string(),
            ));
        }
        if self.deadline_secs == Some(0) {
            return Err(TeardownError::Invalid(
                "deadline must be greater than zero".to_string(),
            ));
        }

        self.timeouts.validate()
    }
}
