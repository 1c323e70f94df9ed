//! Client commands and the single result each one produces.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::ser::{Serialize, SerializeMap, Serializer};
use serde_json::{Map, Value};
use thiserror::Error;

/// Failure returned to the client as `success = false`.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum CommandError {
    #[error("Unknown command: {0}")]
    UnknownCommand(String),
    #[error("{0}")]
    InvalidParams(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    InvalidState(String),
    /// An exchange or strategy collaborator rejected the call.
    #[error("{0}")]
    External(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl CommandError {
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::UnknownCommand(_) => "unknown_command",
            Self::InvalidParams(_) => "invalid_params",
            Self::NotFound(_) => "not_found",
            Self::InvalidState(_) => "invalid_state",
            Self::External(_) => "external",
            Self::Internal(_) => "internal",
        }
    }

    pub fn missing(param: &str) -> Self {
        Self::InvalidParams(format!("Missing required parameter: {param}"))
    }

    pub fn invalid(param: &str, reason: impl std::fmt::Display) -> Self {
        Self::InvalidParams(format!("Invalid parameter '{param}': {reason}"))
    }
}

pub type CommandResultData = Map<String, Value>;

/// Parameter bag with typed accessors.
///
/// Every accessor takes a list of accepted names so legacy aliases (`size`/`quantity`)
/// resolve in one place. The first present name wins.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Params(Map<String, Value>);

impl Params {
    #[must_use]
    pub fn new(map: Map<String, Value>) -> Self {
        Self(map)
    }

    #[must_use]
    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn insert(&mut self, key: impl Into<String>, value: Value) {
        self.0.insert(key.into(), value);
    }

    fn lookup<'a>(&'a self, names: &[&'a str]) -> Option<(&'a str, &'a Value)> {
        names.iter().find_map(|name| {
            self.0
                .get(*name)
                .filter(|value| !value.is_null())
                .map(|value| (*name, value))
        })
    }

    /// Non-empty string value. Numbers are accepted and rendered as text.
    pub fn str_opt(&self, names: &[&str]) -> Result<Option<String>, CommandError> {
        match self.lookup(names) {
            None => Ok(None),
            Some((_, Value::String(text))) => {
                let trimmed = text.trim();
                Ok((!trimmed.is_empty()).then(|| trimmed.to_string()))
            }
            Some((_, Value::Number(num))) => Ok(Some(num.to_string())),
            Some((name, other)) => Err(CommandError::invalid(
                name,
                format!("expected a string, got {}", type_name(other)),
            )),
        }
    }

    pub fn require_str(&self, names: &[&str]) -> Result<String, CommandError> {
        self.str_opt(names)?
            .ok_or_else(|| CommandError::missing(names.first().copied().unwrap_or("?")))
    }

    /// Decimal from a JSON number or a numeric string.
    pub fn decimal_opt(&self, names: &[&str]) -> Result<Option<Decimal>, CommandError> {
        let Some((name, value)) = self.lookup(names) else {
            return Ok(None);
        };
        let text = match value {
            Value::Number(num) => num.to_string(),
            Value::String(text) if !text.trim().is_empty() => text.trim().to_string(),
            Value::String(_) => return Ok(None),
            other => {
                return Err(CommandError::invalid(
                    name,
                    format!("expected a number, got {}", type_name(other)),
                ))
            }
        };
        Decimal::from_str(&text)
            .or_else(|_| Decimal::from_scientific(&text))
            .map(Some)
            .map_err(|err| CommandError::invalid(name, err))
    }

    pub fn require_decimal(&self, names: &[&str]) -> Result<Decimal, CommandError> {
        self.decimal_opt(names)?
            .ok_or_else(|| CommandError::missing(names.first().copied().unwrap_or("?")))
    }

    pub fn bool_opt(&self, names: &[&str]) -> Result<Option<bool>, CommandError> {
        match self.lookup(names) {
            None => Ok(None),
            Some((_, Value::Bool(flag))) => Ok(Some(*flag)),
            Some((name, Value::String(text))) => match text.to_lowercase().as_str() {
                "true" | "1" | "yes" => Ok(Some(true)),
                "false" | "0" | "no" => Ok(Some(false)),
                _ => Err(CommandError::invalid(name, "expected a boolean")),
            },
            Some((name, other)) => Err(CommandError::invalid(
                name,
                format!("expected a boolean, got {}", type_name(other)),
            )),
        }
    }

    pub fn usize_opt(&self, names: &[&str]) -> Result<Option<usize>, CommandError> {
        match self.lookup(names) {
            None => Ok(None),
            Some((name, Value::Number(num))) => num
                .as_u64()
                .map(|value| Some(value as usize))
                .ok_or_else(|| CommandError::invalid(name, "expected a non-negative integer")),
            Some((name, Value::String(text))) => text
                .trim()
                .parse::<usize>()
                .map(Some)
                .map_err(|err| CommandError::invalid(name, err)),
            Some((name, other)) => Err(CommandError::invalid(
                name,
                format!("expected an integer, got {}", type_name(other)),
            )),
        }
    }

    pub fn object_opt(&self, names: &[&str]) -> Result<Option<Map<String, Value>>, CommandError> {
        match self.lookup(names) {
            None => Ok(None),
            Some((_, Value::Object(map))) => Ok(Some(map.clone())),
            Some((name, other)) => Err(CommandError::invalid(
                name,
                format!("expected an object, got {}", type_name(other)),
            )),
        }
    }

    /// Parse a string parameter through [`FromStr`].
    pub fn parsed_opt<T>(&self, names: &[&str]) -> Result<Option<T>, CommandError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        let name = names.first().copied().unwrap_or("?");
        self.str_opt(names)?
            .map(|text| text.parse::<T>().map_err(|err| CommandError::invalid(name, err)))
            .transpose()
    }

    pub fn require_parsed<T>(&self, names: &[&str]) -> Result<T, CommandError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        self.parsed_opt(names)?
            .ok_or_else(|| CommandError::missing(names.first().copied().unwrap_or("?")))
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// A request produced by a client.
#[derive(Clone, Debug, PartialEq)]
pub struct Command {
    pub name: String,
    pub params: Params,
    /// Opaque client value echoed back on the result.
    pub correlation_id: Option<Value>,
}

impl Command {
    /// Build a command from a decoded frame.
    ///
    /// Parameters may be nested under `params` or spread at the top level; nested values
    /// win when a key appears in both places. A top-level `type` is a parameter (order or
    /// strategy type) unless it carries the frame kind `"command"`.
    pub fn from_object(mut frame: Map<String, Value>) -> Result<Self, CommandError> {
        let name = match frame.remove("cmd") {
            Some(Value::String(name)) if !name.trim().is_empty() => name.trim().to_string(),
            _ => {
                return Err(CommandError::InvalidParams(
                    "Missing 'cmd' field in command".into(),
                ))
            }
        };
        let correlation_id = frame.remove("correlation_id").filter(|v| !v.is_null());
        let nested = match frame.remove("params") {
            Some(Value::Object(map)) => map,
            Some(Value::Null) | None => Map::new(),
            Some(_) => return Err(CommandError::invalid("params", "expected an object")),
        };
        if frame.get("type").and_then(Value::as_str) == Some("command") {
            frame.remove("type");
        }
        frame.remove("timestamp");
        frame.extend(nested);
        Ok(Self {
            name,
            params: Params(frame),
            correlation_id,
        })
    }

    pub fn new(name: impl Into<String>, params: Map<String, Value>) -> Self {
        Self {
            name: name.into(),
            params: Params(params),
            correlation_id: None,
        }
    }
}

/// Exactly one result answers every command.
#[derive(Clone, Debug, PartialEq)]
pub struct CommandResult {
    pub cmd: String,
    pub timestamp: DateTime<Utc>,
    pub correlation_id: Option<Value>,
    pub outcome: Result<CommandResultData, CommandError>,
}

impl CommandResult {
    pub fn new(
        cmd: impl Into<String>,
        correlation_id: Option<Value>,
        outcome: Result<CommandResultData, CommandError>,
    ) -> Self {
        Self {
            cmd: cmd.into(),
            timestamp: Utc::now(),
            correlation_id,
            outcome,
        }
    }

    #[must_use]
    pub fn success(&self) -> bool {
        self.outcome.is_ok()
    }

    #[must_use]
    pub fn error(&self) -> Option<&CommandError> {
        self.outcome.as_ref().err()
    }

    #[must_use]
    pub fn data(&self) -> Option<&CommandResultData> {
        self.outcome.as_ref().ok()
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

impl Serialize for CommandResult {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(None)?;
        map.serialize_entry("type", "command_result")?;
        map.serialize_entry("success", &self.success())?;
        map.serialize_entry("cmd", &self.cmd)?;
        map.serialize_entry("timestamp", &self.timestamp)?;
        if let Some(correlation) = &self.correlation_id {
            map.serialize_entry("correlation_id", correlation)?;
        }
        match &self.outcome {
            Ok(data) => {
                for (key, value) in data {
                    if matches!(key.as_str(), "type" | "success" | "cmd" | "timestamp") {
                        continue;
                    }
                    map.serialize_entry(key, value)?;
                }
            }
            Err(err) => {
                map.serialize_entry("error", &err.to_string())?;
                map.serialize_entry("error_kind", err.kind())?;
            }
        }
        map.end()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn object(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    #[test]
    fn nested_params_override_top_level() {
        let command = Command::from_object(object(json!({
            "cmd": "place_order",
            "symbol": "ETH-USDT",
            "size": 1,
            "params": {"symbol": "BTC-USDT"},
            "correlation_id": "abc"
        })))
        .unwrap();
        assert_eq!(command.name, "place_order");
        assert_eq!(
            command.params.require_str(&["symbol"]).unwrap(),
            "BTC-USDT"
        );
        assert_eq!(
            command.params.require_decimal(&["size"]).unwrap(),
            Decimal::ONE
        );
        assert_eq!(command.correlation_id, Some(json!("abc")));
    }

    #[test]
    fn spread_type_is_kept_as_a_parameter() {
        let command = Command::from_object(object(json!({
            "cmd": "place_order",
            "symbol": "BTC-USDT",
            "side": "buy",
            "type": "limit",
            "size": 1,
            "price": 100
        })))
        .unwrap();
        assert_eq!(
            command.params.require_str(&["type", "order_type"]).unwrap(),
            "limit"
        );

        let framed = Command::from_object(object(json!({
            "type": "command",
            "cmd": "create_strategy",
            "params": {"type": "grid"}
        })))
        .unwrap();
        assert_eq!(framed.params.require_str(&["type"]).unwrap(), "grid");

        let envelope_only = Command::from_object(object(json!({
            "type": "command",
            "cmd": "get_state"
        })))
        .unwrap();
        assert!(envelope_only.params.as_map().get("type").is_none());
    }

    #[test]
    fn missing_cmd_is_rejected() {
        let err = Command::from_object(object(json!({"params": {}}))).unwrap_err();
        assert_eq!(err.kind(), "invalid_params");
    }

    #[test]
    fn decimals_accept_numbers_and_strings() {
        let params = Params::new(object(json!({"a": 1.25, "b": "0.5", "c": true})));
        assert_eq!(
            params.decimal_opt(&["a"]).unwrap(),
            Some(Decimal::new(125, 2))
        );
        assert_eq!(
            params.decimal_opt(&["missing", "b"]).unwrap(),
            Some(Decimal::new(5, 1))
        );
        assert!(params.decimal_opt(&["c"]).is_err());
        let err = params.require_decimal(&["size", "quantity"]).unwrap_err();
        assert!(err.to_string().contains("size"));
    }

    #[test]
    fn result_serializes_success_and_failure() {
        let mut data = Map::new();
        data.insert("stopped_count".into(), json!(3));
        let ok = CommandResult::new("kill_switch", Some(json!(9)), Ok(data));
        let value = serde_json::to_value(&ok).unwrap();
        assert_eq!(value["success"], true);
        assert_eq!(value["cmd"], "kill_switch");
        assert_eq!(value["stopped_count"], 3);
        assert_eq!(value["correlation_id"], 9);

        let failed = CommandResult::new(
            "frobnicate",
            None,
            Err(CommandError::UnknownCommand("frobnicate".into())),
        );
        let value = serde_json::to_value(&failed).unwrap();
        assert_eq!(value["success"], false);
        assert_eq!(value["error"], "Unknown command: frobnicate");
        assert_eq!(value["error_kind"], "unknown_command");
        assert!(value.get("correlation_id").is_none());
    }
}
