use std::fmt::Write;

use chrono::{DateTime, Utc};

use crate::aggregation::{self, Dimension};
use crate::models::{self, AlertLevel, DefectRecord};

pub fn build_report(
    scope: Option<&str>,
    since: Option<DateTime<Utc>>,
    defects: &[DefectRecord],
) -> String {
    let operators = aggregation::per_operator(defects);
    let pareto = aggregation::pareto_by(defects, Dimension::DefectType);
    let lines = aggregation::breakdown(defects, Dimension::Line);
    let leaders = aggregation::breakdown(defects, Dimension::ShiftLeader);
    let workstations = aggregation::breakdown(defects, Dimension::Workstation);
    let major = aggregation::major_defects(defects, Dimension::DefectType, &[Dimension::Operator]);
    let wires = aggregation::inverted_wires(defects);
    let total = models::total_occurrences(defects);

    let mut output = String::new();
    let scope_label = scope.unwrap_or("all operators");
    let window = since
        .map(|date| format!("since {}", date.format("%Y-%m-%d")))
        .unwrap_or_else(|| "all time".to_string());

    let _ = writeln!(output, "# Quality Defect Report");
    let _ = writeln!(
        output,
        "Generated for {} ({}), {} occurrences across {} records",
        scope_label,
        window,
        total,
        defects.len()
    );
    let _ = writeln!(output);
    let _ = writeln!(output, "## Operators Under Alert");

    let flagged: Vec<_> = operators
        .iter()
        .filter(|stat| stat.alert_level != AlertLevel::None)
        .collect();
    if flagged.is_empty() {
        let _ = writeln!(output, "No operator has reached an alert threshold.");
    } else {
        for stat in flagged {
            let _ = writeln!(
                output,
                "- {}: {} defects ({})",
                stat.operator_name,
                stat.count,
                stat.alert_level.label()
            );
        }
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Pareto by Defect Type");
    if pareto.is_empty() {
        let _ = writeln!(output, "No defects recorded for this window.");
    } else {
        let _ = writeln!(output, "| Defect | Count | % | Cumulative % |");
        let _ = writeln!(output, "|---|---|---|---|");
        for point in pareto.iter() {
            let _ = writeln!(
                output,
                "| {} | {} | {} | {} |",
                point.label, point.count, point.percentage, point.cumulative_percentage
            );
        }
    }

    for (title, entries) in [
        ("By Line", &lines),
        ("By Shift Leader", &leaders),
        ("By Workstation", &workstations),
    ] {
        let _ = writeln!(output);
        let _ = writeln!(output, "## {}", title);
        if entries.is_empty() {
            let _ = writeln!(output, "No defects recorded for this window.");
        }
        for entry in entries.iter() {
            let _ = writeln!(output, "- {}: {}", entry.label, entry.count);
        }
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Major Defects");
    for group in major.iter() {
        let _ = writeln!(output, "- {} ({} total)", group.key, group.total);
        for (operator, count) in group.items.iter() {
            let _ = writeln!(output, "  - {}: {}", operator, count);
        }
    }

    if !wires.is_empty() {
        let _ = writeln!(output);
        let _ = writeln!(output, "## Inverted Wires");
        for stat in wires.iter() {
            let _ = writeln!(output, "- {} <-> {}: {}", stat.ref1, stat.ref2, stat.count);
        }
    }

    let mut recent = defects.to_vec();
    recent.sort_by(|a, b| b.detected_at.cmp(&a.detected_at));
    let _ = writeln!(output);
    let _ = writeln!(output, "## Recent Defects");

    if recent.is_empty() {
        let _ = writeln!(output, "No defects recorded for this window.");
    } else {
        for record in recent.iter().take(5) {
            let detected = record
                .detected_at
                .map(|at| at.format("%Y-%m-%d %H:%M").to_string())
                .unwrap_or_else(|| "unknown date".to_string());
            let _ = writeln!(
                output,
                "- {} ({}) on {}: {}",
                record.operator_name,
                record.defect_type(),
                detected,
                record.comment.as_deref().unwrap_or("-")
            );
        }
    }

    output
}
