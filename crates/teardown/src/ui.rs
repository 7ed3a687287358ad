//! UI helpers for the teardown CLI.
//!
//! Provides consistent formatting for console output during teardown.

use colored::Colorize;

use crate::plan::DeletionPlan;
use crate::resource::ResourceKind;

/// Print a section header.
pub fn print_section(title: &str) {
    println!();
    println!("{}", "═".repeat(70).bright_black());
    println!("{}", title.cyan().bold());
    println!("{}", "═".repeat(70).bright_black());
    println!();
}

/// Print a success message.
pub fn print_success(message: &str) {
    println!("{} {}", "✓".green().bold(), message.green());
}

/// Print a warning message.
pub fn print_warning(message: &str) {
    println!("{} {}", "⚠".yellow().bold(), message.yellow());
}

/// Print an error message.
pub fn print_error(message: &str) {
    println!("{} {}", "✗".red().bold(), message.red());
}

/// Print an info message.
pub fn print_info(message: &str) {
    println!("{} {}", "ℹ".blue().bold(), message);
}

fn kind_icon(kind: ResourceKind) -> &'static str {
    match kind {
        ResourceKind::Application => "📦",
        ResourceKind::Namespace => "📁",
        ResourceKind::ClusterScoped(_) => "🔐",
        ResourceKind::Crd => "🧩",
    }
}

/// Print a deletion plan, one block per rank.
pub fn print_plan(plan: &DeletionPlan) {
    print_section("🗑  Deletion Plan");

    for group in plan.groups() {
        println!(
            "{} {}",
            format!("[rank {}]", group.rank()).bright_black(),
            format!("{} resource(s)", group.resources().len()).bold()
        );
        for resource in group.resources() {
            println!("  {} {resource}", kind_icon(resource.kind()));
        }
    }

    println!();
    println!(
        "  {} {} resource(s) across {} rank(s)",
        "→".cyan(),
        plan.len(),
        plan.groups().len()
    );
}
