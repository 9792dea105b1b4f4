use serde_json::Value;

/// A JSON patch field: absent, explicitly `null`, or set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NullableValue<T> {
    Omitted,
    Null,
    Value(T),
}

impl<T> NullableValue<T> {
    /// `None` leaves the column alone, `Some(None)` clears it.
    pub fn into_change(self) -> Option<Option<T>> {
        match self {
            NullableValue::Omitted => None,
            NullableValue::Null => Some(None),
            NullableValue::Value(value) => Some(Some(value)),
        }
    }
}

pub fn classify_nullable(optional_value: Option<&Value>) -> Result<NullableValue<String>, String> {
    match optional_value {
        None => Ok(NullableValue::Omitted),
        Some(Value::Null) => Ok(NullableValue::Null),
        Some(Value::String(s)) => Ok(NullableValue::Value(s.to_owned())),
        Some(other) => Err(format!("expected string or null, got {other}")),
    }
}

/// Ids arrive as JSON numbers from API clients and as strings from forms.
pub fn classify_nullable_id(optional_value: Option<&Value>) -> Result<NullableValue<i32>, String> {
    match optional_value {
        None => Ok(NullableValue::Omitted),
        Some(Value::Null) => Ok(NullableValue::Null),
        Some(Value::Number(number)) => number
            .as_i64()
            .and_then(|value| i32::try_from(value).ok())
            .map(NullableValue::Value)
            .ok_or_else(|| format!("expected an integer id, got {number}")),
        Some(Value::String(s)) if s.trim().is_empty() || s.trim() == "null" => {
            Ok(NullableValue::Null)
        }
        Some(Value::String(s)) => s
            .trim()
            .parse::<i32>()
            .map(NullableValue::Value)
            .map_err(|_| format!("expected an integer id, got {s:?}")),
        Some(other) => Err(format!("expected integer or null, got {other}")),
    }
}
