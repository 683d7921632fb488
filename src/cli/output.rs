//! Output formatting for CLI commands.
//!
//! This module provides formatting utilities for displaying
//! information to the user in various formats.

use colored::Colorize;
use std::fmt::Write;
use tabled::{Table, Tabled};

use crate::engine::{DriftReport, RunOutcome};
use crate::graph::DependencyGraph;
use crate::planner::{OpKind, OpStatus, Plan};
use crate::state::EngineState;

use super::commands::OutputFormat;

/// Output formatter for CLI.
#[derive(Debug)]
pub struct OutputFormatter {
    /// Output format.
    format: OutputFormat,
}

/// Plan operation row for table display.
#[derive(Tabled)]
struct PlanOpRow {
    #[tabled(rename = "#")]
    index: usize,
    #[tabled(rename = "Op")]
    op: String,
    #[tabled(rename = "Resource")]
    resource: String,
    #[tabled(rename = "Reason")]
    reason: String,
}

/// Record row for status display.
#[derive(Tabled)]
struct RecordRow {
    #[tabled(rename = "Resource")]
    resource: String,
    #[tabled(rename = "Created")]
    created: String,
    #[tabled(rename = "Updated")]
    updated: String,
    #[tabled(rename = "Declaration")]
    declaration: String,
}

impl OutputFormatter {
    /// Creates a new output formatter.
    #[must_use]
    pub const fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    /// Formats an execution plan for display.
    #[must_use]
    pub fn format_plan(&self, plan: &Plan) -> String {
        match self.format {
            OutputFormat::Json => {
                serde_json::to_string_pretty(&PlanJson::from(plan)).unwrap_or_default()
            }
            OutputFormat::Text => Self::format_plan_text(plan),
        }
    }

    /// Formats a plan as text.
    fn format_plan_text(plan: &Plan) -> String {
        if plan.is_empty() {
            return format!(
                "{} No changes required - topology is converged.\n",
                "✓".green()
            );
        }

        let mut output = String::new();

        let _ = write!(output, "\n📋 Execution plan\n");
        let _ = write!(
            output,
            "   Manifest hash: {}\n\n",
            short_hash(&plan.manifest_hash)
        );

        let rows: Vec<PlanOpRow> = plan
            .ops
            .iter()
            .enumerate()
            .map(|(i, op)| PlanOpRow {
                index: i + 1,
                op: Self::format_op_kind(op.kind),
                resource: op.id.to_string(),
                reason: Self::truncate(&op.reason, 40),
            })
            .collect();

        if !rows.is_empty() {
            let table = Table::new(rows).to_string();
            output.push_str(&table);
            output.push('\n');
        }

        let _ = write!(
            output,
            "\nPlan: {} to create, {} to update, {} to delete ({} unchanged)\n",
            plan.create_count().to_string().green(),
            plan.update_count().to_string().yellow(),
            plan.delete_count().to_string().red(),
            plan.unchanged.len()
        );

        output
    }

    /// Formats the outcome of an apply, reconcile, or destroy run.
    #[must_use]
    pub fn format_outcome(&self, outcome: &RunOutcome) -> String {
        match self.format {
            OutputFormat::Json => {
                serde_json::to_string_pretty(&OutcomeJson::from(outcome)).unwrap_or_default()
            }
            OutputFormat::Text => Self::format_outcome_text(outcome),
        }
    }

    /// Formats a run outcome as text.
    fn format_outcome_text(outcome: &RunOutcome) -> String {
        if outcome.attempts == 0 {
            return format!(
                "{} No changes required - topology is converged.\n",
                "✓".green()
            );
        }

        let status = if outcome.converged {
            format!("{} {} succeeded", "✓".green(), outcome.operation)
        } else if outcome.report.was_cancelled() {
            format!("{} {} cancelled", "⚠".yellow(), outcome.operation)
        } else {
            format!("{} {} did not converge", "✗".red(), outcome.operation)
        };

        let mut output = format!("{status}\n\n");
        let _ = writeln!(output, "   Applied: {}", outcome.report.applied);
        let _ = writeln!(output, "   Failed: {}", outcome.report.failed);
        let _ = writeln!(output, "   Blocked: {}", outcome.report.blocked);
        let _ = writeln!(output, "   Cancelled: {}", outcome.report.cancelled);
        let _ = writeln!(output, "   Unchanged: {}", outcome.report.unchanged.len());

        let problems: Vec<_> = outcome
            .report
            .results
            .iter()
            .filter(|r| r.status != OpStatus::Applied)
            .collect();

        if !problems.is_empty() {
            let _ = write!(output, "\n{} Not applied:\n", "⚠".yellow());
            for result in problems {
                let detail = result.error.as_deref().unwrap_or("no detail");
                let _ = writeln!(
                    output,
                    "   - {} ({}): {}",
                    result.id, result.status, detail
                );
            }
        }

        output
    }

    /// Formats a drift report.
    #[must_use]
    pub fn format_drift(&self, report: &DriftReport) -> String {
        match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(report).unwrap_or_default(),
            OutputFormat::Text => {
                if report.is_converged() {
                    format!("{} No drift detected - state is converged.\n", "✓".green())
                } else {
                    let mut output = format!("{} Drift detected:\n\n", "⚠".yellow());
                    for id in &report.missing {
                        let _ = writeln!(output, "   - {id}: missing from backend");
                    }
                    for id in &report.changed {
                        let _ = writeln!(output, "   - {id}: live attributes differ");
                    }
                    if report.pending_ops > 0 {
                        let _ = writeln!(
                            output,
                            "   {} declaration change(s) not yet applied",
                            report.pending_ops
                        );
                    }
                    let _ = write!(
                        output,
                        "\n{} remembered resource(s) checked.\n",
                        report.total_records
                    );
                    output
                }
            }
        }
    }

    /// Formats the dependency graph and apply order.
    #[must_use]
    pub fn format_graph(&self, graph: &DependencyGraph) -> String {
        match self.format {
            OutputFormat::Json => {
                serde_json::to_string_pretty(&GraphJson::from(graph)).unwrap_or_default()
            }
            OutputFormat::Text => Self::format_graph_text(graph),
        }
    }

    /// Formats the graph as text.
    fn format_graph_text(graph: &DependencyGraph) -> String {
        let mut output = String::new();

        let _ = write!(
            output,
            "\nDependency graph: {} resource(s), {} edge(s)\n\n",
            graph.len(),
            graph.edge_count()
        );

        output.push_str("Apply order:\n");
        for (i, id) in graph.apply_order().iter().enumerate() {
            let deps = graph.dependencies_of(id);
            if deps.is_empty() {
                let _ = writeln!(output, "  {:>2}. {id}", i + 1);
            } else {
                let names: Vec<String> = deps.iter().map(ToString::to_string).collect();
                let _ = writeln!(
                    output,
                    "  {:>2}. {id}  (after: {})",
                    i + 1,
                    names.join(", ")
                );
            }
        }

        output
    }

    /// Formats engine state for `state show`.
    #[must_use]
    pub fn format_state(&self, state: &EngineState) -> String {
        match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(state).unwrap_or_default(),
            OutputFormat::Text => {
                let mut output = String::new();

                let _ = write!(
                    output,
                    "\n💾 State: {}/{}\n\n",
                    state.project, state.environment
                );

                let _ = writeln!(output, "   Version: {}", state.version);
                let _ = writeln!(
                    output,
                    "   Manifest hash: {}",
                    short_hash(&state.manifest_hash)
                );
                let _ = writeln!(output, "   Last updated: {}", state.last_updated);
                let _ = writeln!(output, "   Records: {}", state.record_count());

                if !state.history.is_empty() {
                    let _ = writeln!(output, "\n   Recent history ({}):", state.history.len());
                    for entry in state.history.iter().rev().take(5) {
                        let status = if entry.success { "✓" } else { "✗" };
                        let _ = writeln!(
                            output,
                            "     {status} {} - {} ({} resource(s))",
                            entry.timestamp.format("%Y-%m-%d %H:%M"),
                            entry.operation,
                            entry.resources.len()
                        );
                    }
                }

                output
            }
        }
    }

    /// Formats the remembered records for `status`.
    #[must_use]
    pub fn format_status(&self, state: &EngineState, detailed: bool) -> String {
        match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(state).unwrap_or_default(),
            OutputFormat::Text => Self::format_status_text(state, detailed),
        }
    }

    /// Formats status as text.
    fn format_status_text(state: &EngineState, detailed: bool) -> String {
        let mut output = String::new();

        let _ = write!(
            output,
            "\n📦 Topology: {}/{}\n\n",
            state.project, state.environment
        );

        if state.record_count() == 0 {
            output.push_str("   No resources remembered.\n");
            return output;
        }

        let rows: Vec<RecordRow> = state
            .records
            .values()
            .map(|r| RecordRow {
                resource: r.id.to_string(),
                created: r.created_at.format("%Y-%m-%d %H:%M").to_string(),
                updated: r.updated_at.format("%Y-%m-%d %H:%M").to_string(),
                declaration: short_hash(&r.decl_hash).to_string(),
            })
            .collect();

        let table = Table::new(rows).to_string();
        output.push_str(&table);
        output.push('\n');

        if detailed {
            for record in state.records.values() {
                let attrs =
                    serde_json::to_string_pretty(&record.attributes).unwrap_or_default();
                let _ = write!(output, "\n{}:\n{attrs}\n", record.id);
            }
        }

        let _ = write!(
            output,
            "\n{} resource(s) remembered, last updated {}\n",
            state.record_count(),
            state.last_updated.format("%Y-%m-%d %H:%M")
        );

        output
    }

    /// Formats an operation kind with color.
    fn format_op_kind(kind: OpKind) -> String {
        match kind {
            OpKind::Create => "+create".green().to_string(),
            OpKind::Update => "~update".yellow().to_string(),
            OpKind::Delete => "-delete".red().to_string(),
        }
    }

    /// Truncates a string to a maximum length.
    fn truncate(s: &str, max_len: usize) -> String {
        if s.len() <= max_len {
            s.to_string()
        } else {
            format!("{}...", &s[..max_len - 3])
        }
    }
}

/// First eight characters of a hash, tolerating short and empty values.
fn short_hash(hash: &str) -> &str {
    &hash[..8.min(hash.len())]
}

// JSON serialization helpers

#[derive(serde::Serialize)]
struct PlanJson {
    manifest_hash: String,
    op_count: usize,
    creates: usize,
    updates: usize,
    deletes: usize,
    unchanged: usize,
    ops: Vec<OpJson>,
}

#[derive(serde::Serialize)]
struct OpJson {
    op: String,
    resource: String,
    reason: String,
    depends_on: Vec<String>,
}

impl From<&Plan> for PlanJson {
    fn from(plan: &Plan) -> Self {
        Self {
            manifest_hash: plan.manifest_hash.clone(),
            op_count: plan.op_count(),
            creates: plan.create_count(),
            updates: plan.update_count(),
            deletes: plan.delete_count(),
            unchanged: plan.unchanged.len(),
            ops: plan
                .ops
                .iter()
                .map(|op| OpJson {
                    op: op.kind.to_string(),
                    resource: op.id.to_string(),
                    reason: op.reason.clone(),
                    depends_on: op.depends_on.iter().map(ToString::to_string).collect(),
                })
                .collect(),
        }
    }
}

#[derive(serde::Serialize)]
struct OutcomeJson {
    operation: String,
    converged: bool,
    attempts: u32,
    applied: usize,
    failed: usize,
    blocked: usize,
    cancelled: usize,
    unchanged: usize,
    results: Vec<OpResultJson>,
}

#[derive(serde::Serialize)]
struct OpResultJson {
    op: String,
    resource: String,
    status: String,
    error: Option<String>,
}

impl From<&RunOutcome> for OutcomeJson {
    fn from(outcome: &RunOutcome) -> Self {
        Self {
            operation: outcome.operation.to_string(),
            converged: outcome.converged,
            attempts: outcome.attempts,
            applied: outcome.report.applied,
            failed: outcome.report.failed,
            blocked: outcome.report.blocked,
            cancelled: outcome.report.cancelled,
            unchanged: outcome.report.unchanged.len(),
            results: outcome
                .report
                .results
                .iter()
                .map(|r| OpResultJson {
                    op: r.kind.to_string(),
                    resource: r.id.to_string(),
                    status: r.status.to_string(),
                    error: r.error.clone(),
                })
                .collect(),
        }
    }
}

#[derive(serde::Serialize)]
struct GraphJson {
    resources: usize,
    edge_count: usize,
    apply_order: Vec<String>,
    edges: Vec<EdgeJson>,
}

#[derive(serde::Serialize)]
struct EdgeJson {
    from: String,
    to: String,
}

impl From<&DependencyGraph> for GraphJson {
    fn from(graph: &DependencyGraph) -> Self {
        Self {
            resources: graph.len(),
            edge_count: graph.edge_count(),
            apply_order: graph
                .apply_order()
                .iter()
                .map(ToString::to_string)
                .collect(),
            edges: graph
                .edges()
                .into_iter()
                .map(|(from, to)| EdgeJson {
                    from: from.to_string(),
                    to: to.to_string(),
                })
                .collect(),
        }
    }
}
