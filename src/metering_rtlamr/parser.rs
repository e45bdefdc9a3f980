use chrono::{DateTime, Utc};
use log::debug;
use serde_json::Value;
use std::collections::HashSet;
use thiserror::Error;

use crate::config::{normalize_meter_id, MeterConfig};
use crate::models::{MeterProtocol, RawReading};

#[derive(Error, Debug, PartialEq)]
pub enum LineParseError {
    #[error("Not a JSON object")]
    NotJson,
    #[error("Missing field {0}")]
    MissingField(String),
    #[error("Unknown protocol {0}")]
    UnknownProtocol(String),
    #[error("Invalid meter id {0}")]
    InvalidId(String),
    #[error("Consumption {0} is not a non-negative integer")]
    InvalidConsumption(String),
}

/// Parses one `rtlamr -format=json` line:
///
/// `{"Time":"...","Type":"SCM+","Message":{"EndpointID":7823010,"Consumption":12345678,...}}`
pub fn parse_line(line: &str) -> Result<RawReading, LineParseError> {
    let value: Value = serde_json::from_str(line.trim()).map_err(|_| LineParseError::NotJson)?;
    let object = value.as_object().ok_or(LineParseError::NotJson)?;

    let tag = object.get("Type")
        .and_then(Value::as_str)
        .ok_or(LineParseError::MissingField("Type".to_string()))?;
    let protocol = MeterProtocol::from_str(tag)
        .ok_or_else(|| LineParseError::UnknownProtocol(tag.to_string()))?;

    let message = object.get("Message")
        .and_then(Value::as_object)
        .ok_or(LineParseError::MissingField("Message".to_string()))?;

    let id = message.get(protocol.id_field())
        .ok_or_else(|| LineParseError::MissingField(protocol.id_field().to_string()))?;
    let meter_id = match id {
        Value::Number(n) => n.as_u64().map(|v| v.to_string()).ok_or_else(|| LineParseError::InvalidId(n.to_string()))?,
        Value::String(s) if !s.trim().is_empty() => normalize_meter_id(s),
        other => return Err(LineParseError::InvalidId(other.to_string())),
    };

    let consumption = message.get(protocol.consumption_field())
        .ok_or_else(|| LineParseError::MissingField(protocol.consumption_field().to_string()))?;
    let raw_value = parse_consumption(consumption)?;

    let received_at = object.get("Time")
        .and_then(Value::as_str)
        .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_else(Utc::now);

    return Ok(RawReading { meter_id, protocol, raw_value, received_at });
}

fn parse_consumption(value: &Value) -> Result<u64, LineParseError> {
    let parsed = match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse::<u64>().ok(),
        _ => None,
    };
    return parsed.ok_or_else(|| LineParseError::InvalidConsumption(value.to_string()));
}

/// Turns decoder lines into readings of the configured meters
pub struct LineParser {
    configured: HashSet<(MeterProtocol, String)>,
    listen_all: bool,
}

impl LineParser {
    pub fn new(meters: &[MeterConfig]) -> Self {
        return LineParser {
            configured: meters.iter().map(|m| (m.protocol, m.id.clone())).collect(),
            listen_all: false,
        }
    }

    /// Surfaces every parsable line, used for finding meter ids
    pub fn listen_all() -> Self {
        return LineParser {
            configured: HashSet::new(),
            listen_all: true,
        }
    }

    pub fn parse(&self, line: &str) -> Option<RawReading> {
        let reading = match parse_line(line) {
            Ok(r) => r,
            Err(e) => {
                debug!("Dropping decoder line ({e}): {line}");
                return None;
            }
        };

        if self.listen_all || self.configured.contains(&(reading.protocol, reading.meter_id.clone())) {
            return Some(reading);
        }
        return None;
    }
}
