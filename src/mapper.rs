//! Canonical JSON payloads for decoded events.
//!
//! Binary values become lowercase hex without a prefix, integers become JSON
//! numbers of any width, everything else is text.

use std::str::FromStr;

use serde_json::{json, Map, Number, Value};

use crate::decoder::{ArgValue, DecodedEvent};

/// `{"event_name": ..., "args": {...}}` for one decoded event.
pub fn map_event(event: &DecodedEvent) -> Value {
    json!({
        "event_name": event.event_name,
        "args": map_args(&event.args),
    })
}

pub fn map_args(args: &[(String, ArgValue)]) -> Value {
    let mapped: Map<String, Value> = args
        .iter()
        .map(|(name, value)| (name.clone(), map_value(value)))
        .collect();
    Value::Object(mapped)
}

pub fn map_value(value: &ArgValue) -> Value {
    match value {
        ArgValue::Binary(bytes) => Value::String(hex::encode(bytes)),
        ArgValue::Unsigned(u) => {
            if u.bit_len() <= 64 {
                Value::from(u.to::<u64>())
            } else {
                exact_number(u.to_string())
            }
        }
        ArgValue::Signed(i) => match i64::try_from(*i) {
            Ok(small) => Value::from(small),
            Err(_) => exact_number(i.to_string()),
        },
        ArgValue::Text(text) => Value::String(text.clone()),
    }
}

/// Full-width integer from its decimal form.
fn exact_number(decimal: String) -> Value {
    match Number::from_str(&decimal) {
        Ok(number) => Value::Number(number),
        Err(_) => Value::String(decimal),
    }
}
