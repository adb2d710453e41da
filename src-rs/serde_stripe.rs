use chrono::{DateTime, Utc};
use serde::de::Deserializer;
use serde::{de, Deserialize};
use serde_json::Value;

use crate::format::from_unix;

/// Stripe sends unix seconds as integers, but fixtures and older API
/// versions occasionally carry them as strings or floats.
pub fn de_opt_timestamp<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(value) => {
            let seconds = value_to_i64(&value).map_err(de::Error::custom)?;
            from_unix(seconds)
                .map(Some)
                .ok_or_else(|| de::Error::custom(format!("timestamp out of range: {seconds}")))
        }
    }
}

pub fn de_i64_or_zero<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    match value {
        None | Some(Value::Null) => Ok(0),
        Some(value) => value_to_i64(&value).map_err(de::Error::custom),
    }
}

fn value_to_i64(value: &Value) -> Result<i64, String> {
    match value {
        Value::Number(number) => {
            if let Some(value) = number.as_i64() {
                return Ok(value);
            }
            if let Some(value) = number.as_f64() {
                if value.is_finite() && value.fract() == 0.0 {
                    return Ok(value as i64);
                }
            }
            Err(format!("unsupported JSON number: {number}"))
        }
        Value::String(text) => text
            .trim()
            .parse::<i64>()
            .map_err(|_| format!("invalid numeric string: {text}")),
        other => Err(format!("expected number, got {other}")),
    }
}
