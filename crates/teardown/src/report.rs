//! Deletion outcomes and the aggregated run report.

use std::fmt;

use colored::Colorize;
use serde::Serialize;

use crate::resource::ManagedResource;

/// Terminal result of tearing down one resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum DeletionOutcome {
    /// Resource is gone (or was never there).
    Deleted,
    /// API reported the resource already gone while it was being deleted.
    NotFound,
    /// Still present after the primary timeout and the run was cancelled
    /// before the escalation could be issued.
    TimedOut,
    /// Still present after escalation, or the API rejected the request.
    Failed(String),
}

impl DeletionOutcome {
    /// Whether the resource is confirmed removed.
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Deleted | Self::NotFound)
    }
}

impl fmt::Display for DeletionOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Deleted => write!(f, "deleted"),
            Self::NotFound => write!(f, "not found"),
            Self::TimedOut => write!(f, "timed out"),
            Self::Failed(reason) => write!(f, "failed: {reason}"),
        }
    }
}

/// Result of tearing down one managed resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceResult {
    pub resource: ManagedResource,
    pub outcome: DeletionOutcome,
    /// Whether the finalizer-clear + re-delete cycle ran.
    pub escalated: bool,
    /// Bulk per-kind deletions issued while sweeping or purging instances.
    pub bulk_deletions: usize,
}

/// A resource that needs manual inspection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailedResource {
    pub resource: String,
    pub outcome: DeletionOutcome,
}

/// Aggregated outcome of a teardown run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DeletionReport {
    pub deleted: usize,
    pub not_found: usize,
    pub timed_out: usize,
    pub failed: usize,
    /// Finalizer-clear + re-delete cycles performed.
    pub escalations: usize,
    /// Bulk per-kind deletions performed.
    pub bulk_deletions: usize,
    /// Resources confirmed removed.
    pub removed: Vec<String>,
    /// Resources that timed out or failed.
    pub failures: Vec<FailedResource>,
    /// Resources never started because the run was cancelled.
    pub skipped: Vec<String>,
    /// Whether the run was cancelled before completing.
    pub cancelled: bool,
}

impl DeletionReport {
    /// Fold one resource result into the report.
    pub fn record(&mut self, result: ResourceResult) {
        if result.escalated {
            self.escalations += 1;
        }
        self.bulk_deletions += result.bulk_deletions;

        let id = result.resource.to_string();
        match &result.outcome {
            DeletionOutcome::Deleted => self.deleted += 1,
            DeletionOutcome::NotFound => self.not_found += 1,
            DeletionOutcome::TimedOut => self.timed_out += 1,
            DeletionOutcome::Failed(_) => self.failed += 1,
        }

        if result.outcome.is_success() {
            self.removed.push(id);
        } else {
            self.failures.push(FailedResource {
                resource: id,
                outcome: result.outcome,
            });
        }
    }

    /// Record a resource that was never attempted.
    pub fn record_skipped(&mut self, resource: &ManagedResource) {
        self.skipped.push(resource.to_string());
    }

    /// Total resources with a terminal outcome.
    #[must_use]
    pub fn total(&self) -> usize {
        self.deleted + self.not_found + self.timed_out + self.failed
    }

    /// Whether any resource ended in `Failed` or `TimedOut`.
    #[must_use]
    pub fn has_failures(&self) -> bool {
        !self.failures.is_empty()
    }

    /// Whether every planned resource was confirmed removed.
    #[must_use]
    pub fn all_succeeded(&self) -> bool {
        !self.has_failures() && self.skipped.is_empty() && !self.cancelled
    }

    /// Print a summary of the run.
    pub fn print_summary(&self) {
        println!();
        println!("{}", "═".repeat(70).bright_black());
        println!("{}", "TEARDOWN REPORT".cyan().bold());
        println!("{}", "═".repeat(70).bright_black());
        println!(
            "  Deleted: {}   Not found: {}   Timed out: {}   Failed: {}",
            self.deleted.to_string().green(),
            self.not_found.to_string().green(),
            self.timed_out.to_string().yellow(),
            self.failed.to_string().red()
        );
        println!(
            "  Escalations: {}   Bulk deletions: {}",
            self.escalations, self.bulk_deletions
        );

        if !self.failures.is_empty() {
            println!();
            println!("{}", "Resources requiring manual inspection:".red().bold());
            for failure in &self.failures {
                println!("  {} {} - {}", "✗".red(), failure.resource, failure.outcome);
            }
        }

        if !self.skipped.is_empty() {
            println!();
            println!("{}", "Skipped (run cancelled):".yellow().bold());
            for resource in &self.skipped {
                println!("  {} {resource}", "⏭".yellow());
            }
        }

        println!();
        if self.all_succeeded() {
            println!("{} {}", "✓".green().bold(), "Teardown complete".green());
        } else {
            println!(
                "{} {}",
                "⚠".yellow().bold(),
                "Teardown finished with unresolved resources".yellow()
            );
        }
        println!();
    }
}
