use chrono::{DateTime, NaiveDateTime, Utc};
use rusqlite::types::{Value as SqlValue, ValueRef};
use serde_json::Value;

use crate::error::RowPulseError;

pub struct Utils {}

impl Utils {
    pub const TIMESTAMP_FORMAT: &'static str = "%Y-%m-%d %H:%M:%S";

    /// Render a UTC instant the way the metadata store keeps it. Fixed width,
    /// so string comparison in SQL orders chronologically.
    pub fn to_sql_timestamp(dt: DateTime<Utc>) -> String {
        dt.format(Self::TIMESTAMP_FORMAT).to_string()
    }

    pub fn parse_sql_timestamp(s: &str) -> Result<DateTime<Utc>, RowPulseError> {
        NaiveDateTime::parse_from_str(s, Self::TIMESTAMP_FORMAT)
            .map(|naive| naive.and_utc())
            .map_err(|e| RowPulseError::Error(format!("Invalid timestamp '{}': {}", s, e)))
    }

    /// Convert a column value read from SQLite into JSON. Blobs become
    /// lowercase hex strings.
    pub fn sql_to_json(value: ValueRef<'_>) -> Value {
        match value {
            ValueRef::Null => Value::Null,
            ValueRef::Integer(i) => Value::from(i),
            ValueRef::Real(f) => serde_json::Number::from_f64(f)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            ValueRef::Text(t) => Value::String(String::from_utf8_lossy(t).into_owned()),
            ValueRef::Blob(b) => Value::String(b.iter().map(|byte| format!("{:02x}", byte)).collect()),
        }
    }

    /// Convert a JSON scalar into a bindable SQLite value. Arrays, objects and
    /// booleans are bound as their JSON text.
    pub fn json_to_sql(value: &Value) -> SqlValue {
        match value {
            Value::Null => SqlValue::Null,
            Value::Number(n) => match n.as_i64() {
                Some(i) => SqlValue::Integer(i),
                None => SqlValue::Real(n.as_f64().unwrap_or(0.0)),
            },
            Value::String(s) => SqlValue::Text(s.clone()),
            other => SqlValue::Text(other.to_string()),
        }
    }

    /// The textual form of an identifier handed to notifiers.
    pub fn json_to_id_string(value: &Value) -> String {
        match value {
            Value::String(s) => s.clone(),
            Value::Null => String::new(),
            other => other.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    #[test]
    fn test_timestamp_round_trip_is_second_precision() {
        let dt = Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap();
        let s = Utils::to_sql_timestamp(dt);
        assert_eq!(s, "2024-01-02 03:04:05");
        assert_eq!(Utils::parse_sql_timestamp(&s).unwrap(), dt);
        assert!(Utils::parse_sql_timestamp("yesterday").is_err());
    }

    #[test]
    fn test_json_sql_conversions() {
        assert_eq!(Utils::json_to_sql(&json!(5)), SqlValue::Integer(5));
        assert_eq!(Utils::json_to_sql(&json!(1.5)), SqlValue::Real(1.5));
        assert_eq!(
            Utils::json_to_sql(&json!("2024-01-01")),
            SqlValue::Text("2024-01-01".into())
        );
        assert_eq!(Utils::json_to_sql(&Value::Null), SqlValue::Null);

        assert_eq!(Utils::sql_to_json(ValueRef::Integer(7)), json!(7));
        assert_eq!(Utils::sql_to_json(ValueRef::Text(b"abc")), json!("abc"));
        assert_eq!(Utils::sql_to_json(ValueRef::Blob(&[0xde, 0xad])), json!("dead"));
    }

    #[test]
    fn test_json_to_id_string() {
        assert_eq!(Utils::json_to_id_string(&json!("x1")), "x1");
        assert_eq!(Utils::json_to_id_string(&json!(42)), "42");
        assert_eq!(Utils::json_to_id_string(&json!([1, "a"])), "[1,\"a\"]");
    }
}
