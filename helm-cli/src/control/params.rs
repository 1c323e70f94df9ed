use helm_core::{CommandError, CommandResultData, Params};
use serde::Serialize;
use serde_json::{Map, Value};

pub(crate) const STRATEGY_ID: &[&str] = &["id", "strategy_id"];
pub(crate) const CONNECTION_ID: &[&str] = &["id", "connection_id", "connection"];

pub(crate) fn strategy_id(params: &Params) -> Result<String, CommandError> {
    params.require_str(STRATEGY_ID)
}

/// Serialize a handler payload into result data.
pub(crate) fn to_data<T: Serialize>(value: &T) -> Result<CommandResultData, CommandError> {
    match serde_json::to_value(value) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(other) => {
            let mut map = Map::new();
            map.insert("value".into(), other);
            Ok(map)
        }
        Err(err) => Err(CommandError::Internal(format!(
            "failed to encode result: {err}"
        ))),
    }
}

pub(crate) fn to_json<T: Serialize>(value: &T) -> Result<Value, CommandError> {
    serde_json::to_value(value)
        .map_err(|err| CommandError::Internal(format!("failed to encode result: {err}")))
}

/// Build result data from `(key, value)` pairs.
pub(crate) fn data<const N: usize>(entries: [(&str, Value); N]) -> CommandResultData {
    entries
        .into_iter()
        .map(|(key, value)| (key.to_string(), value))
        .collect()
}
