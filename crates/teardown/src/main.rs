//! CTO Platform Teardown CLI.
//!
//! Removes the platform from a cluster in dependency order: ArgoCD
//! applications, namespaces, cluster-scoped objects, then CRDs.

// Allow product names without backticks in doc comments
#![allow(clippy::doc_markdown)]

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod commands;

use commands::teardown::TeardownArgs;
use cto_teardown::TeardownScope;

/// CTO Platform - GitOps Teardown.
#[derive(Parser)]
#[command(
    name = "cto-teardown",
    version,
    about = "Tear down the CTO Platform",
    long_about = "Remove the CTO Platform from a Kubernetes cluster.\n\n\
                  Resources are deleted in dependency order. Anything stuck on\n\
                  finalizers is forced once, and failures are reported at the end\n\
                  instead of aborting the run.\n\n\
                  All operations are idempotent - re-running a teardown only\n\
                  touches what is still present."
)]
#[command(propagate_version = true)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(flatten)]
    args: TeardownArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Tear down every platform application, namespace, cluster object and CRD.
    TeardownAll,

    /// Delete a single ArgoCD application.
    TeardownApplication {
        /// Application name.
        name: String,
    },

    /// Sweep and delete a single namespace.
    TeardownNamespace {
        /// Namespace name.
        name: String,
    },

    /// Delete platform CRDs after removing their instances.
    TeardownCrds,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize tracing; RUST_LOG takes precedence
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if cli.verbose {
            EnvFilter::new("info,cto_teardown=debug")
        } else {
            EnvFilter::new("warn,cto_teardown=info")
        }
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let scope = match cli.command {
        Commands::TeardownAll => TeardownScope::All,
        Commands::TeardownApplication { name } => TeardownScope::Application(name),
        Commands::TeardownNamespace { name } => TeardownScope::Namespace(name),
        Commands::TeardownCrds => TeardownScope::Crds,
    };

    cli.args.run(scope).await
}
