use serde::Serialize;
use tracing::{info, warn};

use crate::config::FilterConfig;
use crate::error::RepoResult;
use crate::models::DefectRecord;
use crate::store::{doc_id, RecordStore};

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanupReport {
    pub scanned: usize,
    pub matched: Vec<String>,
    pub deleted_count: usize,
    pub errors: Vec<String>,
    pub success: bool,
}

pub async fn cleanup_virtual_data(
    store: &RecordStore,
    filters: &FilterConfig,
    dry_run: bool,
) -> RepoResult<CleanupReport> {
    let docs = store.get_all().await?;
    let mut report = CleanupReport {
        scanned: docs.len(),
        ..Default::default()
    };

    for doc in docs {
        let Some(id) = doc_id(&doc).map(str::to_string) else {
            continue;
        };
        let record: DefectRecord = match serde_json::from_value(serde_json::Value::Object(doc)) {
            Ok(record) => record,
            Err(err) => {
                warn!(id = %id, error = %err, "skipping unreadable record during cleanup");
                continue;
            }
        };
        if !filters.is_virtual_record(&record) {
            continue;
        }

        report.matched.push(id.clone());
        if dry_run {
            continue;
        }
        match store.delete(&id).await {
            Ok(()) => report.deleted_count += 1,
            Err(err) => report.errors.push(format!("{id}: {err}")),
        }
    }

    report.success = report.errors.is_empty();
    info!(
        scanned = report.scanned,
        matched = report.matched.len(),
        deleted = report.deleted_count,
        failed = report.errors.len(),
        dry_run,
        "virtual data cleanup finished"
    );
    Ok(report)
}
