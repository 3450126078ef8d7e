use anyhow::Context;
use chrono::{DateTime, NaiveDate, Utc};
use serde_json::Value;
use sqlx::PgPool;

use crate::models::DefectRecord;
use crate::store::{Document, RecordStore};

pub async fn init_db(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

pub fn to_document(record: &DefectRecord) -> anyhow::Result<Document> {
    match serde_json::to_value(record)? {
        Value::Object(map) => Ok(map),
        other => anyhow::bail!("defect serialized to a non-object value: {other}"),
    }
}

fn at(date: NaiveDate, hour: u32) -> anyhow::Result<DateTime<Utc>> {
    Ok(date
        .and_hms_opt(hour, 0, 0)
        .context("invalid time")?
        .and_utc())
}

pub async fn seed(store: &RecordStore) -> anyhow::Result<usize> {
    let day = |d: u32| NaiveDate::from_ymd_opt(2025, 3, d).context("invalid date");

    #[allow(clippy::type_complexity)]
    let rows: Vec<(&str, &str, u32, &str, &str, &str, u32, Option<(&str, &str)>, NaiveDate)> = vec![
        ("Samira Benali", "M-1042", 1, "WS-03", "Karim Haddad", "101", 2, None, day(3)?),
        ("Samira Benali", "M-1042", 1, "WS-03", "Karim Haddad", "103", 1, None, day(4)?),
        ("Lucas Moreau", "M-1107", 2, "WS-11", "Nadia Ferhat", "210", 3, Some(("X12-4", "X12-7")), day(4)?),
        ("Lucas Moreau", "M-1107", 2, "WS-11", "Nadia Ferhat", "302", 1, None, day(5)?),
        ("Youssef El Idrissi", "M-0988", 1, "WS-05", "Karim Haddad", "201", 1, None, day(6)?),
        ("Lucas Moreau", "M-1107", 2, "WS-12", "Nadia Ferhat", "210", 2, Some(("X08-1", "X08-2")), day(7)?),
        ("Claire Dubois", "M-1213", 3, "WS-21", "Hugo Lefèvre", "401", 1, None, day(7)?),
    ];

    let mut inserted = 0usize;
    for (operator, matricule, line, workstation, leader, code, count, refs, date) in rows {
        let record = DefectRecord {
            operator_name: operator.to_string(),
            matricule: Some(matricule.to_string()),
            detected_at: Some(at(date, 9)?),
            production_line: Some(line),
            workstation: Some(workstation.to_string()),
            shift_leader_name: Some(leader.to_string()),
            project: Some("Faisceau moteur".to_string()),
            defect_code: Some(code.to_string()),
            category: crate::catalog::category_of(code).map(String::from),
            occurrence_count: count,
            ref1: refs.map(|(r, _)| r.to_string()),
            ref2: refs.map(|(_, r)| r.to_string()),
            ..Default::default()
        };
        store.create(to_document(&record)?).await?;
        inserted += 1;
    }

    Ok(inserted)
}

pub async fn import_csv(store: &RecordStore, csv_path: &std::path::Path) -> anyhow::Result<usize> {
    #[derive(serde::Deserialize)]
    struct CsvRow {
        operator_name: String,
        matricule: Option<String>,
        detected_at: String,
        workstation: Option<String>,
        production_line: Option<u32>,
        shift_leader_name: Option<String>,
        project: Option<String>,
        defect_code: Option<String>,
        defect_nature: Option<String>,
        category: Option<String>,
        occurrence_count: Option<u32>,
        ref1: Option<String>,
        ref2: Option<String>,
        comment: Option<String>,
    }

    let mut reader = csv::Reader::from_path(csv_path)
        .with_context(|| format!("failed to open {}", csv_path.display()))?;
    let mut inserted = 0usize;

    for (line, result) in reader.deserialize::<CsvRow>().enumerate() {
        let row = result.with_context(|| format!("invalid CSV row {}", line + 2))?;
        let detected_at = crate::timestamp::normalize_timestamp(&Value::String(row.detected_at.clone()))
            .with_context(|| format!("row {}: unreadable detected_at {:?}", line + 2, row.detected_at))?;
        let category = row
            .category
            .or_else(|| row.defect_code.as_deref().and_then(crate::catalog::category_of).map(String::from));

        let record = DefectRecord {
            operator_name: row.operator_name,
            matricule: row.matricule,
            detected_at: Some(detected_at),
            workstation: row.workstation,
            production_line: row.production_line,
            shift_leader_name: row.shift_leader_name,
            project: row.project,
            defect_code: row.defect_code,
            defect_nature: row.defect_nature,
            category,
            occurrence_count: row.occurrence_count.unwrap_or(1).max(1),
            ref1: row.ref1,
            ref2: row.ref2,
            comment: row.comment,
            ..Default::default()
        };
        store.create(to_document(&record)?).await?;
        inserted += 1;
    }

    Ok(inserted)
}
