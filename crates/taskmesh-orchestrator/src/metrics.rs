//! Prometheus metrics collection and formatting.
//!
//! This module provides metrics in Prometheus text exposition format.

use std::fmt::Write;

use taskmesh_core::{FaultKind, WorkerState};

use crate::orchestrator::Orchestrator;

/// Collect all metrics from the orchestrator and format as Prometheus text.
pub fn collect_metrics(orchestrator: &Orchestrator) -> String {
    let mut output = String::new();

    collect_worker_metrics(orchestrator, &mut output);
    collect_task_metrics(orchestrator, &mut output);
    collect_aggregation_metrics(orchestrator, &mut output);
    collect_supervision_metrics(orchestrator, &mut output);

    output
}

/// Collect worker metrics by state.
fn collect_worker_metrics(orchestrator: &Orchestrator, output: &mut String) {
    let workers = orchestrator.list_workers();

    writeln!(
        output,
        "# HELP taskmesh_workers Number of live workers by state"
    )
    .ok();
    writeln!(output, "# TYPE taskmesh_workers gauge").ok();
    for state in WorkerState::ALL {
        let count = workers.iter().filter(|w| w.state == state).count();
        writeln!(
            output,
            "taskmesh_workers{{state=\"{}\"}} {count}",
            state.as_str()
        )
        .ok();
    }

    let load: u32 = workers.iter().map(|w| w.load).sum();
    writeln!(output).ok();
    writeln!(
        output,
        "# HELP taskmesh_worker_load Tasks currently assigned across all workers"
    )
    .ok();
    writeln!(output, "# TYPE taskmesh_worker_load gauge").ok();
    writeln!(output, "taskmesh_worker_load {load}").ok();
}

/// Collect task metrics by status.
fn collect_task_metrics(orchestrator: &Orchestrator, output: &mut String) {
    writeln!(output).ok();
    writeln!(
        output,
        "# HELP taskmesh_tasks_total Total number of tasks by status"
    )
    .ok();
    writeln!(output, "# TYPE taskmesh_tasks_total gauge").ok();
    for (status, count) in orchestrator.task_counts() {
        writeln!(
            output,
            "taskmesh_tasks_total{{status=\"{}\"}} {count}",
            status.as_str()
        )
        .ok();
    }
}

fn collect_aggregation_metrics(orchestrator: &Orchestrator, output: &mut String) {
    let backlog = orchestrator.backlog();

    writeln!(output).ok();
    writeln!(
        output,
        "# HELP taskmesh_aggregations Aggregations held in memory by phase"
    )
    .ok();
    writeln!(output, "# TYPE taskmesh_aggregations gauge").ok();
    writeln!(
        output,
        "taskmesh_aggregations{{phase=\"pending\"}} {}",
        backlog.pending
    )
    .ok();
    writeln!(
        output,
        "taskmesh_aggregations{{phase=\"completed\"}} {}",
        backlog.completed
    )
    .ok();
}

/// Collect fault and heal counters.
fn collect_supervision_metrics(orchestrator: &Orchestrator, output: &mut String) {
    let counts = orchestrator.audit_counts();

    writeln!(output).ok();
    writeln!(
        output,
        "# HELP taskmesh_faults_total Faults observed by supervision by kind"
    )
    .ok();
    writeln!(output, "# TYPE taskmesh_faults_total counter").ok();
    for kind in FaultKind::ALL {
        let count = counts.faults_by_kind.get(&kind).copied().unwrap_or(0);
        writeln!(
            output,
            "taskmesh_faults_total{{kind=\"{}\"}} {count}",
            kind.as_str()
        )
        .ok();
    }

    writeln!(output).ok();
    writeln!(
        output,
        "# HELP taskmesh_heals_total Heal attempts by outcome"
    )
    .ok();
    writeln!(output, "# TYPE taskmesh_heals_total counter").ok();
    writeln!(
        output,
        "taskmesh_heals_total{{outcome=\"healed\"}} {}",
        counts.healed
    )
    .ok();
    writeln!(
        output,
        "taskmesh_heals_total{{outcome=\"escalated\"}} {}",
        counts.escalated
    )
    .ok();

    writeln!(output).ok();
    writeln!(
        output,
        "# HELP taskmesh_pending_faults Faults waiting for the next supervision cycle"
    )
    .ok();
    writeln!(output, "# TYPE taskmesh_pending_faults gauge").ok();
    writeln!(
        output,
        "taskmesh_pending_faults {}",
        orchestrator.pending_faults()
    )
    .ok();
}
