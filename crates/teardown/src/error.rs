//! Error types for the teardown engine.

use thiserror::Error;

/// Errors returned by a [`ClusterApi`](crate::cluster::ClusterApi) implementation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClusterError {
    /// The object (or its kind) does not exist. Never a failure for teardown.
    #[error("not found: {0}")]
    NotFound(String),

    /// Network failure, throttling, conflict or server-side error.
    /// Retried inside the current timeout budget.
    #[error("transient API error: {0}")]
    Transient(String),

    /// API server rejected the request.
    #[error("API error: {code} - {message}")]
    Api { code: u16, message: String },

    /// Request or response body could not be (de)serialized.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl ClusterError {
    /// Whether the error means "already gone".
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// Whether the request may succeed if retried.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

impl From<kube::Error> for ClusterError {
    fn from(err: kube::Error) -> Self {
        match err {
            kube::Error::Api(response) => match response.code {
                404 => Self::NotFound(response.message),
                409 | 429 | 500..=599 => Self::Transient(format!(
                    "{} ({}): {}",
                    response.code, response.reason, response.message
                )),
                code => Self::Api {
                    code,
                    message: response.message,
                },
            },
            other => Self::Transient(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for ClusterError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Fatal errors that stop a teardown before any cluster mutation.
#[derive(Error, Debug)]
pub enum TeardownError {
    /// Malformed resource identifier or configuration value.
    #[error("invalid configuration: {0}")]
    Invalid(String),

    /// Configuration file could not be read.
    #[error("failed to read configuration {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Configuration file could not be parsed.
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] serde_yaml::Error),

    /// Cluster call needed to build the plan failed.
    #[error("cluster error while planning: {0}")]
    Cluster(#[from] ClusterError),
}
