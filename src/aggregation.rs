use std::collections::HashMap;

use crate::models::{
    AlertLevel, BreakdownEntry, DefectRecord, InvertedWireStat, NestedBreakdown, OperatorStat,
    ParetoPoint,
};

pub const PALETTE: &[&str] = &[
    "#3B82F6", "#EF4444", "#10B981", "#F59E0B", "#8B5CF6", "#EC4899", "#14B8A6", "#F97316",
    "#6366F1", "#84CC16",
];

pub const MAJOR_DEFECTS_TOP: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dimension {
    Operator,
    Category,
    Workstation,
    Line,
    ShiftLeader,
    DefectType,
    Project,
}

impl Dimension {
    pub fn name(self) -> &'static str {
        match self {
            Dimension::Operator => "operator",
            Dimension::Category => "category",
            Dimension::Workstation => "workstation",
            Dimension::Line => "line",
            Dimension::ShiftLeader => "shift leader",
            Dimension::DefectType => "defect type",
            Dimension::Project => "project",
        }
    }

    fn label(self, record: &DefectRecord) -> Option<String> {
        let text = |value: &Option<String>| {
            value
                .as_deref()
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(String::from)
        };
        let labelled = match self {
            Dimension::Operator => {
                return record
                    .has_operator()
                    .then(|| record.operator_name.trim().to_string())
            }
            Dimension::Category => text(&record.category),
            Dimension::Workstation => text(&record.workstation),
            Dimension::Line => record.production_line.map(|line| format!("Line {line}")),
            Dimension::ShiftLeader => text(&record.shift_leader_name),
            Dimension::DefectType => record.defect_name().or_else(|| text(&record.category)),
            Dimension::Project => text(&record.project),
        };
        Some(labelled.unwrap_or_else(|| format!("undefined {}", self.name())))
    }
}

fn group_sum<'a, I>(entries: I) -> Vec<(String, u32)>
where
    I: IntoIterator<Item = (String, &'a DefectRecord)>,
{
    let mut index: HashMap<String, usize> = HashMap::new();
    let mut sums: Vec<(String, u32)> = Vec::new();
    for (key, record) in entries {
        let slot = *index.entry(key.clone()).or_insert_with(|| {
            sums.push((key, 0));
            sums.len() - 1
        });
        sums[slot].1 = sums[slot].1.saturating_add(record.occurrences());
    }
    sums
}

fn sort_desc(sums: &mut [(String, u32)]) {
    sums.sort_by(|a, b| b.1.cmp(&a.1));
}

pub fn per_operator(defects: &[DefectRecord]) -> Vec<OperatorStat> {
    let mut sums = group_sum(
        defects
            .iter()
            .filter_map(|r| Dimension::Operator.label(r).map(|label| (label, r))),
    );
    sort_desc(&mut sums);
    sums.into_iter()
        .map(|(operator_name, count)| {
            let alert_level = AlertLevel::from_count(count);
            OperatorStat {
                operator_name,
                count,
                alert_level,
                color: alert_level.color(),
            }
        })
        .collect()
}

pub fn breakdown(defects: &[DefectRecord], dimension: Dimension) -> Vec<BreakdownEntry> {
    let mut sums = group_sum(
        defects
            .iter()
            .filter_map(|r| dimension.label(r).map(|label| (label, r))),
    );
    sort_desc(&mut sums);
    sums.into_iter()
        .enumerate()
        .map(|(rank, (label, count))| BreakdownEntry {
            label,
            count,
            color: PALETTE[rank % PALETTE.len()],
        })
        .collect()
}

/// Nested breakdown: for every outer key, the inner keys sorted by count.
///
/// Several inner dimensions are joined into one composite key (`"Line 2 / Karim"`).
pub fn cross_breakdown(
    defects: &[DefectRecord],
    outer: Dimension,
    inner: &[Dimension],
) -> Vec<NestedBreakdown> {
    let mut index: HashMap<String, usize> = HashMap::new();
    let mut groups: Vec<(String, Vec<&DefectRecord>)> = Vec::new();

    for record in defects {
        let Some(key) = outer.label(record) else {
            continue;
        };
        if inner.iter().any(|dim| dim.label(record).is_none()) {
            continue;
        }
        let slot = *index.entry(key.clone()).or_insert_with(|| {
            groups.push((key, Vec::new()));
            groups.len() - 1
        });
        groups[slot].1.push(record);
    }

    let mut nested: Vec<NestedBreakdown> = groups
        .into_iter()
        .map(|(key, records)| {
            let mut items = group_sum(records.into_iter().map(|r| {
                let composite = inner
                    .iter()
                    .filter_map(|dim| dim.label(r))
                    .collect::<Vec<_>>()
                    .join(" / ");
                (composite, r)
            }));
            sort_desc(&mut items);
            NestedBreakdown {
                key,
                total: items.iter().fold(0, |acc, (_, count)| acc.saturating_add(*count)),
                items,
            }
        })
        .collect();

    nested.sort_by(|a, b| b.total.cmp(&a.total));
    nested
}

pub fn major_defects(
    defects: &[DefectRecord],
    outer: Dimension,
    inner: &[Dimension],
) -> Vec<NestedBreakdown> {
    let mut nested = cross_breakdown(defects, outer, inner);
    nested.truncate(MAJOR_DEFECTS_TOP);
    nested
}

pub fn percent(part: u32, total: u32) -> u32 {
    if total == 0 {
        return 0;
    }
    (part as f64 / total as f64 * 100.0).round() as u32
}

pub fn pareto(counts: &[(String, u32)]) -> Vec<ParetoPoint> {
    let mut sorted = counts.to_vec();
    sort_desc(&mut sorted);
    let total = sorted.iter().fold(0u32, |acc, (_, count)| acc.saturating_add(*count));

    let mut running = 0u32;
    sorted
        .into_iter()
        .map(|(label, count)| {
            running = running.saturating_add(count);
            ParetoPoint {
                percentage: percent(count, total),
                cumulative_percentage: percent(running, total),
                label,
                count,
            }
        })
        .collect()
}

pub fn pareto_by(defects: &[DefectRecord], dimension: Dimension) -> Vec<ParetoPoint> {
    let counts: Vec<(String, u32)> = breakdown(defects, dimension)
        .into_iter()
        .map(|entry| (entry.label, entry.count))
        .collect();
    pareto(&counts)
}

pub fn inverted_wires(defects: &[DefectRecord]) -> Vec<InvertedWireStat> {
    let marker = |value: &Option<String>| {
        value
            .as_deref()
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .unwrap_or("undefined ref")
            .to_string()
    };

    let mut index: HashMap<(String, String), usize> = HashMap::new();
    let mut stats: Vec<InvertedWireStat> = Vec::new();
    for record in defects.iter().filter(|r| r.is_inverted_wires()) {
        let key = (marker(&record.ref1), marker(&record.ref2));
        let slot = *index.entry(key.clone()).or_insert_with(|| {
            stats.push(InvertedWireStat {
                ref1: key.0,
                ref2: key.1,
                count: 0,
            });
            stats.len() - 1
        });
        stats[slot].count = stats[slot].count.saturating_add(record.occurrences());
    }

    stats.sort_by(|a, b| b.count.cmp(&a.count));
    stats
}
