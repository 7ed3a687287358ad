//! CTO Platform Teardown Library.
//!
//! Removes everything the platform's GitOps deployment created, in dependency
//! order: ArgoCD applications first (so nothing re-syncs), then namespaces,
//! then cluster-scoped RBAC and admission objects, then CRDs once their
//! instances are gone. Every object goes through the same patient delete and,
//! if it hangs on finalizers, a single forced retry.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use cto_teardown::{KubeCluster, TeardownConfig, TeardownEngine, TeardownScope};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let cluster = KubeCluster::connect(None, None).await?;
//!     let engine = TeardownEngine::new(Arc::new(cluster), TeardownConfig::default())?;
//!     let report = engine.run(&TeardownScope::All).await?;
//!     report.print_summary();
//!     Ok(())
//! }
//! ```

// Allow product names without backticks in doc comments
#![allow(clippy::doc_markdown)]

pub mod cluster;
pub mod config;
pub mod engine;
pub mod error;
pub mod plan;
pub mod report;
pub mod resource;
pub mod ui;

pub use cluster::{ClusterApi, InMemoryCluster, KubeCluster};
pub use config::TeardownConfig;
pub use engine::{TeardownEngine, TeardownScope};
pub use error::{ClusterError, TeardownError};
pub use plan::DeletionPlan;
pub use report::{DeletionOutcome, DeletionReport};
pub use resource::{ManagedResource, ResourceKind};
