//! Resource identifiers used by the teardown engine.
//!
//! [`ManagedResource`] is what configuration hands the engine: a platform
//! object with a kind and a rank. [`ResourceRef`] is what the cluster client
//! operates on: any API object, including the namespaced objects swept out of
//! a namespace and the custom resource instances purged before a CRD.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::TeardownError;

/// Group/version/kind of an API type together with its plural and scope.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ApiKind {
    /// API group, empty for the core group.
    pub group: String,
    /// API version within the group.
    pub version: String,
    /// Kind name (e.g. `Deployment`).
    pub kind: String,
    /// Plural resource name used in URLs (e.g. `deployments`).
    pub plural: String,
    /// Whether objects of this kind live inside a namespace.
    pub namespaced: bool,
}

impl ApiKind {
    /// Create a new API kind.
    #[must_use]
    pub fn new(group: &str, version: &str, kind: &str, plural: &str, namespaced: bool) -> Self {
        Self {
            group: group.to_string(),
            version: version.to_string(),
            kind: kind.to_string(),
            plural: plural.to_string(),
            namespaced,
        }
    }

    /// ArgoCD `Application`.
    #[must_use]
    pub fn application() -> Self {
        Self::new("argoproj.io", "v1alpha1", "Application", "applications", true)
    }

    /// Core `Namespace`.
    #[must_use]
    pub fn namespace() -> Self {
        Self::new("", "v1", "Namespace", "namespaces", false)
    }

    /// `CustomResourceDefinition`.
    #[must_use]
    pub fn custom_resource_definition() -> Self {
        Self::new(
            "apiextensions.k8s.io",
            "v1",
            "CustomResourceDefinition",
            "customresourcedefinitions",
            false,
        )
    }

    /// `apiVersion` string as it appears in manifests.
    #[must_use]
    pub fn api_version(&self) -> String {
        if self.group.is_empty() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }
}

impl fmt::Display for ApiKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.group.is_empty() {
            write!(f, "{}", self.kind)
        } else {
            write!(f, "{}.{}", self.kind, self.group)
        }
    }
}

/// Cluster-scoped RBAC and admission objects owned by the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ClusterObjectKind {
    ValidatingWebhookConfiguration,
    MutatingWebhookConfiguration,
    ClusterRoleBinding,
    ClusterRole,
    #[serde(rename = "APIService")]
    ApiService,
}

impl ClusterObjectKind {
    /// Every supported cluster-scoped kind.
    pub const ALL: [Self; 5] = [
        Self::ValidatingWebhookConfiguration,
        Self::MutatingWebhookConfiguration,
        Self::ClusterRoleBinding,
        Self::ClusterRole,
        Self::ApiService,
    ];

    /// API kind backing this object kind.
    #[must_use]
    pub fn api_kind(self) -> ApiKind {
        match self {
            Self::ValidatingWebhookConfiguration => ApiKind::new(
                "admissionregistration.k8s.io",
                "v1",
                "ValidatingWebhookConfiguration",
                "validatingwebhookconfigurations",
                false,
            ),
            Self::MutatingWebhookConfiguration => ApiKind::new(
                "admissionregistration.k8s.io",
                "v1",
                "MutatingWebhookConfiguration",
                "mutatingwebhookconfigurations",
                false,
            ),
            Self::ClusterRoleBinding => ApiKind::new(
                "rbac.authorization.k8s.io",
                "v1",
                "ClusterRoleBinding",
                "clusterrolebindings",
                false,
            ),
            Self::ClusterRole => ApiKind::new(
                "rbac.authorization.k8s.io",
                "v1",
                "ClusterRole",
                "clusterroles",
                false,
            ),
            Self::ApiService => ApiKind::new(
                "apiregistration.k8s.io",
                "v1",
                "APIService",
                "apiservices",
                false,
            ),
        }
    }
}

impl fmt::Display for ClusterObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.api_kind().kind)
    }
}

/// Kind of a platform object managed by the teardown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ResourceKind {
    /// ArgoCD application.
    Application,
    /// Namespace, swept of its contents before deletion.
    Namespace,
    /// Cluster-scoped RBAC or admission object.
    ClusterScoped(ClusterObjectKind),
    /// Custom resource definition, purged of instances before deletion.
    Crd,
}

impl ResourceKind {
    /// API kind backing this resource kind.
    #[must_use]
    pub fn api_kind(self) -> ApiKind {
        match self {
            Self::Application => ApiKind::application(),
            Self::Namespace => ApiKind::namespace(),
            Self::ClusterScoped(kind) => kind.api_kind(),
            Self::Crd => ApiKind::custom_resource_definition(),
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Application => write!(f, "Application"),
            Self::Namespace => write!(f, "Namespace"),
            Self::ClusterScoped(kind) => write!(f, "{kind}"),
            Self::Crd => write!(f, "CustomResourceDefinition"),
        }
    }
}

/// A single API object addressed by kind, name and optional namespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceRef {
    pub kind: ApiKind,
    pub name: String,
    pub namespace: Option<String>,
}

impl ResourceRef {
    /// Create a reference to a cluster-scoped object.
    #[must_use]
    pub fn cluster(kind: ApiKind, name: &str) -> Self {
        Self {
            kind,
            name: name.to_string(),
            namespace: None,
        }
    }

    /// Create a reference to a namespaced object.
    #[must_use]
    pub fn namespaced(kind: ApiKind, namespace: &str, name: &str) -> Self {
        Self {
            kind,
            name: name.to_string(),
            namespace: Some(namespace.to_string()),
        }
    }

    /// Reference to a namespace object.
    #[must_use]
    pub fn namespace(name: &str) -> Self {
        Self::cluster(ApiKind::namespace(), name)
    }
}

impl fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{} {ns}/{}", self.kind, self.name),
            None => write!(f, "{} {}", self.kind, self.name),
        }
    }
}

/// A platform object scheduled for deletion.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ManagedResource {
    kind: ResourceKind,
    name: String,
    namespace: Option<String>,
    rank: u32,
}

impl ManagedResource {
    /// Create a managed resource, validating its identifiers.
    ///
    /// # Errors
    ///
    /// Returns [`TeardownError::Invalid`] when the name or namespace is not a
    /// valid Kubernetes object name, or when the namespace presence does not
    /// match the kind's scope.
    pub fn new(
        kind: ResourceKind,
        name: &str,
        namespace: Option<&str>,
        rank: u32,
    ) -> Result<Self, TeardownError> {
        match kind {
            ResourceKind::ClusterScoped(_) => validate_segment_name(name)?,
            _ => validate_name(name)?,
        }
        if let Some(ns) = namespace {
            validate_name(ns)?;
        }

        match (kind.api_kind().namespaced, namespace) {
            (true, None) => {
                return Err(TeardownError::Invalid(format!(
                    "{kind} '{name}' requires a namespace"
                )));
            }
            (false, Some(ns)) => {
                return Err(TeardownError::Invalid(format!(
                    "{kind} '{name}' is cluster-scoped but namespace '{ns}' was given"
                )));
            }
            _ => {}
        }

        Ok(Self {
            kind,
            name: name.to_string(),
            namespace: namespace.map(ToString::to_string),
            rank,
        })
    }

    /// ArgoCD application in `namespace`.
    ///
    /// # Errors
    ///
    /// Returns [`TeardownError::Invalid`] for malformed names.
    pub fn application(namespace: &str, name: &str, rank: u32) -> Result<Self, TeardownError> {
        Self::new(ResourceKind::Application, name, Some(namespace), rank)
    }

    /// Namespace.
    ///
    /// # Errors
    ///
    /// Returns [`TeardownError::Invalid`] for malformed names.
    pub fn namespace(name: &str, rank: u32) -> Result<Self, TeardownError> {
        Self::new(ResourceKind::Namespace, name, None, rank)
    }

    /// Cluster-scoped RBAC or admission object.
    ///
    /// # Errors
    ///
    /// Returns [`TeardownError::Invalid`] for malformed names.
    pub fn cluster_object(
        kind: ClusterObjectKind,
        name: &str,
        rank: u32,
    ) -> Result<Self, TeardownError> {
        Self::new(ResourceKind::ClusterScoped(kind), name, None, rank)
    }

    /// Custom resource definition.
    ///
    /// # Errors
    ///
    /// Returns [`TeardownError::Invalid`] for malformed names.
    pub fn crd(name: &str, rank: u32) -> Result<Self, TeardownError> {
        Self::new(ResourceKind::Crd, name, None, rank)
    }

    #[must_use]
    pub fn kind(&self) -> ResourceKind {
        self.kind
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn namespace_name(&self) -> Option<&str> {
        self.namespace.as_deref()
    }

    #[must_use]
    pub fn rank(&self) -> u32 {
        self.rank
    }

    /// Cluster reference for this resource.
    #[must_use]
    pub fn resource_ref(&self) -> ResourceRef {
        ResourceRef {
            kind: self.kind.api_kind(),
            name: self.name.clone(),
            namespace: self.namespace.clone(),
        }
    }

    /// Identity used for duplicate detection (rank excluded).
    #[must_use]
    pub fn identity(&self) -> (ResourceKind, &str, Option<&str>) {
        (self.kind, &self.name, self.namespace.as_deref())
    }
}

impl fmt::Display for ManagedResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{} {ns}/{}", self.kind, self.name),
            None => write!(f, "{} {}", self.kind, self.name),
        }
    }
}

/// Validate a Kubernetes object name (RFC 1123 subdomain).
///
/// # Errors
///
/// Returns [`TeardownError::Invalid`] when the name is empty, too long, or
/// contains characters other than lowercase alphanumerics, `-` and `.`.
pub fn validate_name(name: &str) -> Result<(), TeardownError> {
    if name.is_empty() {
        return Err(TeardownError::Invalid("resource name is empty".to_string()));
    }
    if name.len() > 253 {
        return Err(TeardownError::Invalid(format!(
            "resource name '{name}' exceeds 253 characters"
        )));
    }

    let valid_chars = name
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '.');
    let valid_edges = name
        .chars()
        .next()
        .zip(name.chars().last())
        .is_some_and(|(first, last)| first.is_ascii_alphanumeric() && last.is_ascii_alphanumeric());

    if valid_chars && valid_edges {
        Ok(())
    } else {
        Err(TeardownError::Invalid(format!(
            "resource name '{name}' is not a valid Kubernetes object name"
        )))
    }
}

/// Validate a name used as a single URL path segment. RBAC and admission
/// objects allow any such name (e.g. `system:controller`).
///
/// # Errors
///
/// Returns [`TeardownError::Invalid`] when the name is empty, `.`/`..`, or
/// contains `/`, `%` or whitespace.
pub fn validate_segment_name(name: &str) -> Result<(), TeardownError> {
    let invalid = name.is_empty()
        || name == "."
        || name == ".."
        || name.len() > 253
        || name
            .chars()
            .any(|c| c == '/' || c == '%' || c.is_whitespace() || c.is_control());

    if invalid {
        Err(TeardownError::Invalid(format!(
            "resource name '{name}' is not a valid path segment"
        )))
    } else {
        Ok(())
    }
}
