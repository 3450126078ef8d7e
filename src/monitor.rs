use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::aggregation;
use crate::error::StoreResult;
use crate::models::{DefectRecord, EscalationEvent};
use crate::notifier::{Notifier, NotifyOutcome};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ThresholdState {
    last_seen: HashMap<String, u32>,
}

impl ThresholdState {
    pub fn previous(&self, operator_name: &str) -> u32 {
        self.last_seen.get(operator_name).copied().unwrap_or(0)
    }

    /// Stores `count` and returns the value it replaced (0 when unseen).
    pub fn record(&mut self, operator_name: &str, count: u32) -> u32 {
        self.last_seen
            .insert(operator_name.to_string(), count)
            .unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.last_seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.last_seen.is_empty()
    }

    pub async fn load(path: &Path) -> StoreResult<Self> {
        match tokio::fs::read(path).await {
            Ok(raw) => Ok(serde_json::from_slice(&raw)?),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(err) => Err(err.into()),
        }
    }

    pub async fn save(&self, path: &Path) -> StoreResult<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(path, serde_json::to_vec_pretty(self)?).await?;
        Ok(())
    }
}

/// Highest threshold crossed between two observations, if any.
pub fn crossed_threshold(thresholds: &[u32], previous: u32, current: u32) -> Option<u32> {
    thresholds
        .iter()
        .copied()
        .filter(|&level| current >= level && previous < level)
        .max()
}

#[derive(Debug, Clone, Default)]
pub struct OperatorContext {
    pub defect_type: Option<String>,
    pub operator_id: Option<String>,
}

impl OperatorContext {
    fn from_record(record: &DefectRecord) -> Self {
        Self {
            defect_type: record.defect_name().or_else(|| Some(record.defect_type())),
            operator_id: record.matricule.clone(),
        }
    }

    pub fn latest_for(defects: &[DefectRecord], operator_name: &str) -> Self {
        latest_by_operator(defects)
            .get(operator_name.trim())
            .map(|record| Self::from_record(record))
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone)]
pub struct Escalation {
    pub event: EscalationEvent,
    pub outcome: NotifyOutcome,
}

pub struct ThresholdMonitor {
    state: ThresholdState,
    thresholds: Vec<u32>,
    notifier: Arc<dyn Notifier>,
}

impl ThresholdMonitor {
    pub fn new(state: ThresholdState, thresholds: Vec<u32>, notifier: Arc<dyn Notifier>) -> Self {
        Self {
            state,
            thresholds,
            notifier,
        }
    }

    pub fn state(&self) -> &ThresholdState {
        &self.state
    }

    pub fn into_state(self) -> ThresholdState {
        self.state
    }

    pub async fn observe(
        &mut self,
        operator_name: &str,
        current_count: u32,
        context: &OperatorContext,
    ) -> Option<Escalation> {
        let previous = self.state.record(operator_name, current_count);
        let level = crossed_threshold(&self.thresholds, previous, current_count)?;

        let event = EscalationEvent {
            operator_name: operator_name.to_string(),
            defect_count: current_count,
            previous_count: previous,
            threshold_level: level,
            defect_type: context.defect_type.clone(),
            occurred_at: Utc::now(),
            operator_id: context.operator_id.clone(),
        };
        info!(
            operator = operator_name,
            previous,
            current = current_count,
            level,
            "escalation threshold crossed"
        );
        Some(self.dispatch(event).await)
    }

    pub async fn monitor_all(&mut self, defects: &[DefectRecord]) -> Vec<Escalation> {
        let latest = latest_by_operator(defects);
        let stats = aggregation::per_operator(defects);

        let mut escalations = Vec::new();
        for stat in stats {
            let context = latest
                .get(stat.operator_name.as_str())
                .map(|record| OperatorContext::from_record(record))
                .unwrap_or_default();
            if let Some(escalation) = self.observe(&stat.operator_name, stat.count, &context).await {
                escalations.push(escalation);
            }
        }
        escalations
    }

    /// Manual escalation that ignores and leaves untouched the last-seen state.
    pub async fn escalate_now(
        &self,
        operator_name: &str,
        current_count: u32,
        level: u32,
        context: &OperatorContext,
    ) -> Escalation {
        let event = EscalationEvent {
            operator_name: operator_name.to_string(),
            defect_count: current_count,
            previous_count: self.state.previous(operator_name),
            threshold_level: level,
            defect_type: context.defect_type.clone(),
            occurred_at: Utc::now(),
            operator_id: context.operator_id.clone(),
        };
        warn!(operator = operator_name, level, "manual escalation requested");
        self.dispatch(event).await
    }

    async fn dispatch(&self, event: EscalationEvent) -> Escalation {
        let result = self.notifier.notify(&event).await;
        if let Err(err) = &result {
            error!(
                operator = %event.operator_name,
                level = event.threshold_level,
                error = %err,
                "escalation notification failed"
            );
        }
        Escalation {
            outcome: NotifyOutcome::from(&result),
            event,
        }
    }
}

fn latest_by_operator(defects: &[DefectRecord]) -> HashMap<&str, &DefectRecord> {
    let mut latest: HashMap<&str, &DefectRecord> = HashMap::new();
    for record in defects.iter().filter(|r| r.has_operator()) {
        let name = record.operator_name.trim();
        let is_newer = latest
            .get(name)
            .map_or(true, |current| record.detected_at >= current.detected_at);
        if is_newer {
            latest.insert(name, record);
        }
    }
    latest
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notifier::testing::RecordingNotifier;

    fn monitor(notifier: Arc<RecordingNotifier>) -> ThresholdMonitor {
        ThresholdMonitor::new(ThresholdState::default(), vec![3, 5, 7], notifier)
    }

    fn defect(operator: &str, count: u32) -> DefectRecord {
        DefectRecord {
            operator_name: operator.to_string(),
            occurrence_count: count,
            ..Default::default()
        }
    }

    #[test]
    fn highest_crossed_level_wins() {
        let thresholds = [3, 5, 7];
        assert_eq!(crossed_threshold(&thresholds, 2, 8), Some(7));
        assert_eq!(crossed_threshold(&thresholds, 0, 3), Some(3));
        assert_eq!(crossed_threshold(&thresholds, 3, 6), Some(5));
        assert_eq!(crossed_threshold(&thresholds, 7, 9), None);
        assert_eq!(crossed_threshold(&thresholds, 4, 4), None);
        assert_eq!(crossed_threshold(&[7, 3, 5], 0, 100), Some(7));
    }

    #[tokio::test]
    async fn jump_fires_single_level_seven() {
        let notifier = Arc::new(RecordingNotifier::default());
        let mut monitor = monitor(notifier.clone());
        let ctx = OperatorContext::default();

        assert!(monitor.observe("Ali", 2, &ctx).await.is_none());
        let escalation = monitor.observe("Ali", 8, &ctx).await.unwrap();

        assert_eq!(escalation.event.threshold_level, 7);
        assert_eq!(escalation.event.previous_count, 2);
        assert_eq!(notifier.levels(), vec![("Ali".to_string(), 7)]);
    }

    #[tokio::test]
    async fn same_count_does_not_refire() {
        let notifier = Arc::new(RecordingNotifier::default());
        let mut monitor = monitor(notifier.clone());
        let ctx = OperatorContext::default();

        assert!(monitor.observe("Ali", 3, &ctx).await.is_some());
        assert!(monitor.observe("Ali", 3, &ctx).await.is_none());
        assert!(monitor.observe("Ali", 4, &ctx).await.is_none());
        assert_eq!(monitor.observe("Ali", 5, &ctx).await.unwrap().event.threshold_level, 5);
        assert_eq!(notifier.levels().len(), 2);
    }

    #[tokio::test]
    async fn decreasing_counts_rearm_thresholds() {
        let notifier = Arc::new(RecordingNotifier::default());
        let mut monitor = monitor(notifier.clone());
        let ctx = OperatorContext::default();

        monitor.observe("Ali", 5, &ctx).await;
        assert!(monitor.observe("Ali", 1, &ctx).await.is_none());
        assert_eq!(monitor.observe("Ali", 3, &ctx).await.unwrap().event.threshold_level, 3);
    }

    #[tokio::test]
    async fn notifier_failure_still_consumes_crossing() {
        let notifier = Arc::new(RecordingNotifier::failing());
        let mut monitor = monitor(notifier.clone());
        let ctx = OperatorContext::default();

        let escalation = monitor.observe("Ali", 3, &ctx).await.unwrap();
        assert!(!escalation.outcome.success);
        assert!(escalation.outcome.error.is_some());
        assert_eq!(monitor.state().previous("Ali"), 3);
        assert!(monitor.observe("Ali", 3, &ctx).await.is_none());
        assert_eq!(notifier.levels().len(), 1);
    }

    #[tokio::test]
    async fn monitor_all_uses_occurrence_sums() {
        let notifier = Arc::new(RecordingNotifier::default());
        let mut monitor = monitor(notifier.clone());

        let mut first = vec![defect("A", 2), defect("B", 1)];
        assert!(monitor.monitor_all(&first).await.is_empty());

        first.push(defect("A", 4));
        first.push(defect("B", 2));
        let escalations = monitor.monitor_all(&first).await;
        let mut fired = notifier.levels();
        fired.sort();
        assert_eq!(escalations.len(), 2);
        assert_eq!(fired, vec![("A".to_string(), 5), ("B".to_string(), 3)]);
    }

    #[tokio::test]
    async fn monitor_all_carries_latest_defect_context() {
        use chrono::TimeZone;

        let notifier = Arc::new(RecordingNotifier::default());
        let mut monitor = monitor(notifier.clone());

        let mut older = defect("A", 2);
        older.defect_nature = Some("Clip manquant".into());
        older.detected_at = Some(Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap());
        let mut newer = defect("A", 1);
        newer.defect_code = Some("210".into());
        newer.matricule = Some("M-77".into());
        newer.detected_at = Some(Utc.with_ymd_and_hms(2025, 1, 2, 0, 0, 0).unwrap());

        let escalations = monitor.monitor_all(&[newer, older]).await;
        let event = &escalations[0].event;
        assert_eq!(event.defect_type.as_deref(), Some("Fils inversés"));
        assert_eq!(event.operator_id.as_deref(), Some("M-77"));
    }

    #[tokio::test]
    async fn manual_escalation_ignores_history() {
        let notifier = Arc::new(RecordingNotifier::default());
        let mut monitor = monitor(notifier.clone());
        let ctx = OperatorContext::default();
        monitor.observe("Ali", 7, &ctx).await;

        let escalation = monitor.escalate_now("Ali", 7, 7, &ctx).await;
        assert!(escalation.outcome.success);
        assert_eq!(notifier.levels().len(), 2);
        assert_eq!(monitor.state().previous("Ali"), 7);
    }

    #[tokio::test]
    async fn state_round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/threshold_state.json");

        let mut state = ThresholdState::load(&path).await.unwrap();
        assert!(state.is_empty());
        state.record("Ali", 4);
        state.save(&path).await.unwrap();

        let reloaded = ThresholdState::load(&path).await.unwrap();
        assert_eq!(reloaded.previous("Ali"), 4);
        assert_eq!(reloaded.len(), 1);
    }
}
