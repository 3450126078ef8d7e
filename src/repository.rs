use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use tracing::{error, warn};

use crate::config::FilterConfig;
use crate::error::{RepoResult, RepositoryError};
use crate::models::{AggregatedStat, DefectRecord};
use crate::store::{doc_id, Document, RecordStore};

#[derive(Debug, Clone, Default)]
pub struct DefectFilters {
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
    pub category: Option<String>,
    pub operator_name: Option<String>,
}

impl DefectFilters {
    fn matches(&self, record: &DefectRecord) -> bool {
        if self.start_date.is_some() || self.end_date.is_some() {
            let Some(detected) = record.detected_at else {
                return false;
            };
            if self.start_date.is_some_and(|start| detected < start) {
                return false;
            }
            if self.end_date.is_some_and(|end| detected > end) {
                return false;
            }
        }
        if let Some(category) = &self.category {
            if record.category.as_deref() != Some(category.as_str()) {
                return false;
            }
        }
        if let Some(operator) = &self.operator_name {
            if record.operator_name != *operator {
                return false;
            }
        }
        true
    }
}

#[derive(Clone)]
pub struct DefectRepository {
    store: RecordStore,
    filters: FilterConfig,
}

impl DefectRepository {
    pub fn new(store: RecordStore, filters: FilterConfig) -> Self {
        Self { store, filters }
    }

    /// Every stored defect, placeholders included.
    pub async fn all_defects(&self) -> RepoResult<Vec<DefectRecord>> {
        let docs = self.store.get_all().await.map_err(|err| {
            error!(collection = self.store.collection(), error = %err, "failed to read defects");
            RepositoryError::from(err)
        })?;
        Ok(docs.into_iter().filter_map(to_record).collect())
    }

    pub async fn get_defects(&self, filters: &DefectFilters) -> RepoResult<Vec<DefectRecord>> {
        let defects = self.all_defects().await?;
        Ok(defects
            .into_iter()
            .filter(|record| !self.filters.excludes(record))
            .filter(|record| filters.matches(record))
            .collect())
    }

    pub async fn get_aggregated_stats(&self, filters: &DefectFilters) -> RepoResult<Vec<AggregatedStat>> {
        let defects = self.get_defects(filters).await?;
        Ok(aggregate_by_operator_and_type(&defects))
    }

    pub async fn get_unique_operator_names(&self) -> RepoResult<Vec<String>> {
        let defects = self.all_defects().await?;
        let names: BTreeSet<String> = defects
            .into_iter()
            .filter(|record| !self.filters.excludes(record))
            .map(|record| record.operator_name.trim().to_string())
            .collect();
        Ok(names.into_iter().collect())
    }

    pub async fn get_unique_defect_types(&self) -> RepoResult<Vec<String>> {
        let defects = self.all_defects().await?;
        let types: BTreeSet<String> = defects
            .iter()
            .filter(|record| !self.filters.excludes(record))
            .map(DefectRecord::defect_type)
            .collect();
        Ok(types.into_iter().collect())
    }
}

fn to_record(doc: Document) -> Option<DefectRecord> {
    let id = doc_id(&doc).unwrap_or_default().to_string();
    match serde_json::from_value(serde_json::Value::Object(doc)) {
        Ok(record) => Some(record),
        Err(err) => {
            warn!(id = %id, error = %err, "skipping unreadable defect document");
            None
        }
    }
}

pub fn aggregate_by_operator_and_type(defects: &[DefectRecord]) -> Vec<AggregatedStat> {
    let mut index: HashMap<(String, String), usize> = HashMap::new();
    let mut stats: Vec<AggregatedStat> = Vec::new();

    for record in defects.iter().filter(|r| r.has_operator()) {
        let operator_name = record.operator_name.trim().to_string();
        let defect_type = record.defect_type();
        let key = (operator_name.clone(), defect_type.clone());
        let slot = *index.entry(key).or_insert_with(|| {
            stats.push(AggregatedStat {
                operator_name,
                defect_type,
                defect_count: 0,
                last_updated: None,
                project: record.project.clone(),
            });
            stats.len() - 1
        });

        let entry = &mut stats[slot];
        entry.defect_count = entry.defect_count.saturating_add(record.occurrences());
        if record.detected_at > entry.last_updated {
            entry.last_updated = record.detected_at;
        }
        if entry.project.is_none() {
            entry.project = record.project.clone();
        }
    }

    stats
}
