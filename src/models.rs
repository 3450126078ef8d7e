use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::catalog;
use crate::timestamp::deserialize_opt_timestamp;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DefectRecord {
    #[serde(default, deserialize_with = "lenient_text", skip_serializing)]
    pub id: String,
    #[serde(default, deserialize_with = "lenient_string", skip_serializing_if = "Option::is_none")]
    pub matricule: Option<String>,
    #[serde(default, deserialize_with = "lenient_text")]
    pub operator_name: String,
    #[serde(default, deserialize_with = "lenient_string", skip_serializing_if = "Option::is_none")]
    pub supervisor_name: Option<String>,
    #[serde(default, deserialize_with = "deserialize_opt_timestamp", skip_serializing_if = "Option::is_none")]
    pub detected_at: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "lenient_string", skip_serializing_if = "Option::is_none")]
    pub workstation: Option<String>,
    #[serde(default, deserialize_with = "lenient_ordinal", skip_serializing_if = "Option::is_none")]
    pub production_line: Option<u32>,
    #[serde(default, deserialize_with = "lenient_string", skip_serializing_if = "Option::is_none")]
    pub shift_leader_name: Option<String>,
    #[serde(default, deserialize_with = "lenient_string", skip_serializing_if = "Option::is_none")]
    pub project: Option<String>,
    #[serde(default, deserialize_with = "lenient_string", skip_serializing_if = "Option::is_none")]
    pub section: Option<String>,
    #[serde(default, deserialize_with = "lenient_string", skip_serializing_if = "Option::is_none")]
    pub defect_code: Option<String>,
    #[serde(default, deserialize_with = "lenient_string", skip_serializing_if = "Option::is_none")]
    pub defect_nature: Option<String>,
    #[serde(default, deserialize_with = "lenient_string", skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default = "one", deserialize_with = "lenient_occurrences")]
    pub occurrence_count: u32,
    #[serde(default, deserialize_with = "lenient_string", skip_serializing_if = "Option::is_none")]
    pub ref1: Option<String>,
    #[serde(default, deserialize_with = "lenient_string", skip_serializing_if = "Option::is_none")]
    pub ref2: Option<String>,
    #[serde(default, deserialize_with = "lenient_string", skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    #[serde(default, deserialize_with = "lenient_string", skip_serializing_if = "Option::is_none")]
    pub photo_ref: Option<String>,
    #[serde(default, deserialize_with = "deserialize_opt_timestamp", skip_serializing)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "deserialize_opt_timestamp", skip_serializing)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl DefectRecord {
    pub fn has_operator(&self) -> bool {
        !self.operator_name.trim().is_empty()
    }

    pub fn occurrences(&self) -> u32 {
        self.occurrence_count.max(1)
    }

    pub fn defect_type(&self) -> String {
        non_blank(&self.defect_nature)
            .or_else(|| non_blank(&self.category))
            .unwrap_or("unknown")
            .to_string()
    }

    pub fn defect_name(&self) -> Option<String> {
        if let Some(nature) = non_blank(&self.defect_nature) {
            return Some(nature.to_string());
        }
        non_blank(&self.defect_code)
            .and_then(catalog::defect_name)
            .map(String::from)
    }

    pub fn is_inverted_wires(&self) -> bool {
        self.defect_code.as_deref().map(str::trim) == Some(catalog::INVERTED_WIRES_CODE)
    }
}

pub fn total_occurrences<'a>(records: impl IntoIterator<Item = &'a DefectRecord>) -> u32 {
    records
        .into_iter()
        .fold(0, |acc, record| acc.saturating_add(record.occurrences()))
}

fn non_blank(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

fn one() -> u32 {
    1
}

/// Any numeric occurrence count that is not a positive integer is read as 1.
pub fn parse_occurrences(value: &Value) -> u32 {
    let parsed = match value {
        Value::Number(number) => number
            .as_u64()
            .or_else(|| number.as_f64().filter(|f| f.fract() == 0.0 && *f >= 1.0).map(|f| f as u64)),
        Value::String(raw) => raw.trim().parse::<u64>().ok(),
        _ => None,
    };
    match parsed {
        Some(count) if count >= 1 => count.min(u32::MAX as u64) as u32,
        _ => 1,
    }
}

fn lenient_occurrences<'de, D>(deserializer: D) -> Result<u32, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value.as_ref().map(parse_occurrences).unwrap_or(1))
}

fn lenient_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(Value::String(raw)) => Some(raw),
        Some(Value::Number(number)) => Some(number.to_string()),
        _ => None,
    })
}

fn lenient_text<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(lenient_string(deserializer)?.unwrap_or_default())
}

fn lenient_ordinal<'de, D>(deserializer: D) -> Result<Option<u32>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(Value::Number(number)) => number.as_u64().and_then(|n| u32::try_from(n).ok()),
        Some(Value::String(raw)) => raw.trim().parse().ok(),
        _ => None,
    })
}

pub const WARNING_THRESHOLD: u32 = 3;
pub const DANGER_THRESHOLD: u32 = 5;
pub const CRITICAL_THRESHOLD: u32 = 7;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertLevel {
    None,
    Warning,
    Danger,
    Critical,
}

impl AlertLevel {
    pub fn from_count(count: u32) -> Self {
        match count {
            c if c >= CRITICAL_THRESHOLD => AlertLevel::Critical,
            c if c >= DANGER_THRESHOLD => AlertLevel::Danger,
            c if c >= WARNING_THRESHOLD => AlertLevel::Warning,
            _ => AlertLevel::None,
        }
    }

    pub fn color(self) -> &'static str {
        match self {
            AlertLevel::None => "#4CAF50",
            AlertLevel::Warning => "#FFC107",
            AlertLevel::Danger => "#FF9800",
            AlertLevel::Critical => "#F44336",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            AlertLevel::None => "none",
            AlertLevel::Warning => "warning",
            AlertLevel::Danger => "danger",
            AlertLevel::Critical => "critical",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OperatorStat {
    pub operator_name: String,
    pub count: u32,
    pub alert_level: AlertLevel,
    pub color: &'static str,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BreakdownEntry {
    pub label: String,
    pub count: u32,
    pub color: &'static str,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NestedBreakdown {
    pub key: String,
    pub total: u32,
    pub items: Vec<(String, u32)>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ParetoPoint {
    pub label: String,
    pub count: u32,
    pub percentage: u32,
    pub cumulative_percentage: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InvertedWireStat {
    pub ref1: String,
    pub ref2: String,
    pub count: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregatedStat {
    pub operator_name: String,
    pub defect_type: String,
    pub defect_count: u32,
    pub last_updated: Option<DateTime<Utc>>,
    pub project: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EscalationEvent {
    pub operator_name: String,
    pub defect_count: u32,
    pub previous_count: u32,
    pub threshold_level: u32,
    pub defect_type: Option<String>,
    pub occurred_at: DateTime<Utc>,
    pub operator_id: Option<String>,
}
