use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Deserializer};
use serde_json::Value;

/// Normalizes every timestamp shape a defect document can carry.
///
/// Accepted inputs: RFC 3339 strings, naive `YYYY-MM-DDTHH:MM:SS` or `YYYY-MM-DD` strings
/// (read as UTC), epoch-seconds wrappers (`{seconds, nanoseconds}` or
/// `{_seconds, _nanoseconds}`) and plain numbers read as epoch milliseconds.
pub fn normalize_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(raw) => parse_timestamp_str(raw),
        Value::Number(number) => {
            let millis = number.as_i64().or_else(|| number.as_f64().map(|f| f as i64))?;
            Utc.timestamp_millis_opt(millis).single()
        }
        Value::Object(map) => {
            let seconds = map
                .get("seconds")
                .or_else(|| map.get("_seconds"))
                .and_then(Value::as_i64)?;
            let nanos = map
                .get("nanoseconds")
                .or_else(|| map.get("_nanoseconds"))
                .and_then(Value::as_u64)
                .unwrap_or(0);
            Utc.timestamp_opt(seconds, nanos.min(999_999_999) as u32).single()
        }
        _ => None,
    }
}

fn parse_timestamp_str(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Some(parsed.with_timezone(&Utc));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f") {
        return Some(naive.and_utc());
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S") {
        return Some(naive.and_utc());
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

pub fn deserialize_opt_timestamp<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value.as_ref().and_then(normalize_timestamp))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_iso_strings_with_offset() {
        let parsed = normalize_timestamp(&json!("2025-03-04T10:15:00+01:00")).unwrap();
        assert_eq!(parsed.to_rfc3339(), "2025-03-04T09:15:00+00:00");
    }

    #[test]
    fn parses_plain_dates_as_midnight_utc() {
        let parsed = normalize_timestamp(&json!("2025-03-04")).unwrap();
        assert_eq!(parsed.to_rfc3339(), "2025-03-04T00:00:00+00:00");
    }

    #[test]
    fn parses_epoch_seconds_wrappers() {
        let wrapped = normalize_timestamp(&json!({"seconds": 1_700_000_000, "nanoseconds": 0}));
        let underscored = normalize_timestamp(&json!({"_seconds": 1_700_000_000}));
        assert_eq!(wrapped, underscored);
        assert_eq!(wrapped.unwrap().timestamp(), 1_700_000_000);
    }

    #[test]
    fn numbers_are_epoch_millis() {
        let parsed = normalize_timestamp(&json!(1_700_000_000_000i64)).unwrap();
        assert_eq!(parsed.timestamp(), 1_700_000_000);
    }

    #[test]
    fn rejects_garbage() {
        assert!(normalize_timestamp(&json!("yesterday")).is_none());
        assert!(normalize_timestamp(&json!(true)).is_none());
        assert!(normalize_timestamp(&json!({"minutes": 3})).is_none());
    }
}
