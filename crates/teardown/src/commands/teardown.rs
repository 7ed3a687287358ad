//! Teardown command - shared options and execution.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Args;
use dialoguer::{theme::ColorfulTheme, Confirm};
use tracing::{info, warn};

use cto_teardown::{ui, KubeCluster, TeardownConfig, TeardownEngine, TeardownScope};

/// Options shared by every teardown subcommand.
#[derive(Args, Debug)]
pub struct TeardownArgs {
    /// Teardown configuration file (YAML). Built-in defaults when omitted.
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Path to kubeconfig file.
    #[arg(long, env = "KUBECONFIG", global = true)]
    kubeconfig: Option<PathBuf>,

    /// Kubeconfig context to use.
    #[arg(long, global = true)]
    context: Option<String>,

    /// Seconds to wait for each ArgoCD application before forcing.
    #[arg(long, value_name = "SECS", global = true)]
    app_timeout: Option<u64>,

    /// Seconds to wait for each namespace before forcing.
    #[arg(long, value_name = "SECS", global = true)]
    namespace_timeout: Option<u64>,

    /// Seconds to wait for each CRD and its instances before forcing.
    #[arg(long, value_name = "SECS", global = true)]
    crd_timeout: Option<u64>,

    /// Seconds to wait after removing finalizers.
    #[arg(long, value_name = "SECS", global = true)]
    secondary_timeout: Option<u64>,

    /// Overall deadline in seconds; no new deletions start after it passes.
    #[arg(long, value_name = "SECS", global = true)]
    deadline: Option<u64>,

    /// Resources of the same rank deleted in parallel.
    #[arg(long, global = true)]
    concurrency: Option<usize>,

    /// CRD ownership pattern (API group domain). Repeatable; replaces the
    /// configured patterns.
    #[arg(long = "crd-pattern", value_name = "DOMAIN", global = true)]
    crd_patterns: Vec<String>,

    /// Skip the confirmation prompt.
    #[arg(short, long, visible_alias = "force", global = true)]
    yes: bool,

    /// Print the deletion plan without deleting anything.
    #[arg(long, visible_alias = "list-only", global = true)]
    dry_run: bool,

    /// Output report as JSON.
    #[arg(long, global = true)]
    json: bool,
}

impl TeardownArgs {
    /// Load the configuration file and apply command-line overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration file cannot be loaded.
    pub fn load_config(&self) -> Result<TeardownConfig> {
        let mut config = match &self.config {
            Some(path) => TeardownConfig::from_file(path)
                .with_context(|| format!("Failed to load config from {}", path.display()))?,
            None => TeardownConfig::default(),
        };

        let timeouts = &mut config.timeouts;
        if let Some(secs) = self.app_timeout {
            timeouts.application_secs = secs;
        }
        if let Some(secs) = self.namespace_timeout {
            timeouts.namespace_secs = secs;
        }
        if let Some(secs) = self.crd_timeout {
            timeouts.crd_secs = secs;
        }
        if let Some(secs) = self.secondary_timeout {
            timeouts.secondary_secs = secs;
        }
        if let Some(concurrency) = self.concurrency {
            config.concurrency = concurrency;
        }
        if self.deadline.is_some() {
            config.deadline_secs = self.deadline;
        }
        if !self.crd_patterns.is_empty() {
            config.crd_patterns.clone_from(&self.crd_patterns);
        }

        config.validate()?;
        Ok(config)
    }

    /// Run a teardown of `scope`.
    ///
    /// # Errors
    ///
    /// Returns an error if planning fails, the user declines, or any resource
    /// could not be removed.
    pub async fn run(&self, scope: TeardownScope) -> Result<()> {
        let config = self.load_config()?;

        if !self.json {
            ui::print_section(&format!("🧹 CTO Platform Teardown: {scope}"));
        }

        let cluster = KubeCluster::connect(self.kubeconfig.as_deref(), self.context.as_deref())
            .await
            .context("Failed to connect to cluster")?;
        let engine = TeardownEngine::new(Arc::new(cluster), config)?;

        let plan = engine.plan(&scope).await.context("Failed to plan teardown")?;
        if plan.is_empty() {
            if !self.json {
                ui::print_info("Nothing to delete");
            }
            return Ok(());
        }

        if !self.json {
            ui::print_plan(&plan);
        }

        if self.dry_run {
            if self.json {
                let names: Vec<String> = plan.resources().map(ToString::to_string).collect();
                println!("{}", serde_json::to_string_pretty(&names)?);
            } else {
                ui::print_info("Dry run, nothing deleted");
            }
            return Ok(());
        }

        if !self.yes {
            let proceed = Confirm::with_theme(&ColorfulTheme::default())
                .with_prompt(format!("Delete {} resource(s)?", plan.len()))
                .default(false)
                .interact()?;

            if !proceed {
                ui::print_warning("Teardown cancelled.");
                return Ok(());
            }
        }

        let token = engine.cancellation_token();
        let interrupt = tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupted, finishing in-flight deletions");
                token.cancel();
            }
        });

        info!(resources = plan.len(), "Starting teardown");
        let report = engine.execute(&plan).await;
        interrupt.abort();

        if self.json {
            println!("{}", serde_json::to_string_pretty(&report)?);
        } else {
            report.print_summary();
        }

        if report.has_failures() {
            if !self.json {
                ui::print_error("Some resources need manual inspection");
            }
            anyhow::bail!(
                "{} resource(s) could not be removed",
                report.failed + report.timed_out
            );
        }
        if !report.all_succeeded() {
            anyhow::bail!(
                "Teardown cancelled with {} resource(s) not attempted",
                report.skipped.len()
            );
        }

        if !self.json {
            ui::print_success("All platform resources removed");
        }
        Ok(())
    }
}
