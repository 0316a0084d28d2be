//! Prometheus text exposition of a scheduler snapshot.

use std::fmt::Write;

use keel_scheduler::SchedulerSnapshot;
use keel_state::SlotState;

/// Render `snapshot` in Prometheus text format.
pub fn render_prometheus(snapshot: &SchedulerSnapshot) -> String {
    let mut out = String::new();
    let framework = &snapshot.framework.name;

    out.push_str("# HELP keel_slots Executor slots by state.\n");
    out.push_str("# TYPE keel_slots gauge\n");
    for state in SlotState::ALL {
        let _ = writeln!(
            out,
            "keel_slots{{framework=\"{framework}\",state=\"{}\"}} {}",
            state.label(),
            snapshot.count_in(state)
        );
    }

    let gauges = [
        (
            "keel_desired_executors",
            "Desired executor count.",
            snapshot.desired.count as u64,
        ),
        (
            "keel_executor_deficit",
            "Desired executors not yet launched.",
            snapshot.deficit() as u64,
        ),
        (
            "keel_connected",
            "Whether the resource manager link is up.",
            snapshot.connected as u64,
        ),
        (
            "keel_store_healthy",
            "Whether the state store accepts writes.",
            snapshot.store_healthy as u64,
        ),
        (
            "keel_pending_kills",
            "Kills awaiting confirmation.",
            snapshot.pending_kills as u64,
        ),
        (
            "keel_last_sweep",
            "Number of the last applied reconciliation sweep.",
            snapshot.last_sweep,
        ),
    ];
    for (name, help, value) in gauges {
        metric(&mut out, name, help, "gauge", framework, value);
    }

    let counters = [
        ("keel_launches_total", "Executor launches issued.", snapshot.launches_total),
        ("keel_kills_total", "Executor kills issued.", snapshot.kills_total),
    ];
    for (name, help, value) in counters {
        metric(&mut out, name, help, "counter", framework, value);
    }

    out
}

fn metric(out: &mut String, name: &str, help: &str, kind: &str, framework: &str, value: u64) {
    let _ = writeln!(out, "# HELP {name} {help}");
    let _ = writeln!(out, "# TYPE {name} {kind}");
    let _ = writeln!(out, "{name}{{framework=\"{framework}\"}} {value}");
}
