//! Core data types shared by the transport, the devices and the HTTP layers.
//!
//! Readings are what devices produce; `GioDevice` and `Room` are the records
//! exchanged with the remote device service.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Opaque identifier of a radio peripheral, as supplied by the host stack.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeripheralId(String);

impl PeripheralId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeripheralId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeripheralId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Loosely typed reading value. Different characteristics encode different
/// physical quantities, so a reading is either a number or free text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ReadingValue {
    Number(f64),
    Text(String),
}

impl fmt::Display for ReadingValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReadingValue::Number(n) => write!(f, "{}", n),
            ReadingValue::Text(s) => f.write_str(s),
        }
    }
}

impl From<f64> for ReadingValue {
    fn from(value: f64) -> Self {
        ReadingValue::Number(value)
    }
}

impl From<String> for ReadingValue {
    fn from(value: String) -> Self {
        ReadingValue::Text(value)
    }
}

impl From<&str> for ReadingValue {
    fn from(value: &str) -> Self {
        ReadingValue::Text(value.to_string())
    }
}

/// A value produced by a device characteristic.
///
/// The creation timestamp is taken when the notification is decoded, not when
/// the reading is delivered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub name: String,
    pub value: ReadingValue,
    pub unit: String,
    #[serde(rename = "creation_timestamp")]
    pub created_at: DateTime<Utc>,
}

impl Reading {
    pub fn new(name: impl Into<String>, value: impl Into<ReadingValue>, unit: impl Into<String>) -> Self {
        Self {
            id: None,
            name: name.into(),
            value: value.into(),
            unit: unit.into(),
            created_at: Utc::now(),
        }
    }
}

impl fmt::Display for Reading {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "<Reading {}, {}, {}, {}, {}>",
            self.id.as_deref().unwrap_or(""),
            self.name,
            self.value,
            self.unit,
            self.created_at
        )
    }
}

/// Render raw characteristic bytes as a bracketed, space separated list of
/// decimal values, e.g. `[22 0]`.
pub fn format_bytes(bytes: &[u8]) -> String {
    let inner: Vec<String> = bytes.iter().map(|b| b.to_string()).collect();
    format!("[{}]", inner.join(" "))
}

/// Same as [`format_bytes`] without the outer brackets.
pub fn format_bytes_unbracketed(bytes: &[u8]) -> String {
    let formatted = format_bytes(bytes);
    formatted[1..formatted.len() - 1].to_string()
}

/// Payload of an action trigger request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionData {
    #[serde(default)]
    pub value: i64,
}

/// A device as registered on the remote device service.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct GioDevice {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub name: String,
    pub mac: String,
    #[serde(default)]
    pub room: String,
}

/// A virtual place that may contain devices.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Room {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    pub name: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(&[0x16, 0x00]), "[22 0]");
        assert_eq!(format_bytes(&[]), "[]");
        assert_eq!(format_bytes_unbracketed(&[0x16, 0x00]), "22 0");
        assert_eq!(format_bytes_unbracketed(&[]), "");
    }

    #[test]
    fn test_reading_json_shape() {
        let reading = Reading::new("temperature", "22 0", "C°");
        let json = serde_json::to_value(&reading).unwrap();

        assert_eq!(json["name"], "temperature");
        assert_eq!(json["value"], "22 0");
        assert_eq!(json["unit"], "C°");
        assert!(json.get("creation_timestamp").is_some());
        // No id until the device service assigns one.
        assert!(json.get("id").is_none());
    }

    #[test]
    fn test_reading_value_untagged() {
        let number: ReadingValue = serde_json::from_str("21.5").unwrap();
        assert_eq!(number, ReadingValue::Number(21.5));

        let text: ReadingValue = serde_json::from_str("\"22 0\"").unwrap();
        assert_eq!(text, ReadingValue::Text("22 0".into()));
    }

    #[test]
    fn test_peripheral_id_is_transparent() {
        let id = PeripheralId::new("AA:BB:CC:DD:EE:FF");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"AA:BB:CC:DD:EE:FF\"");
        assert_eq!(id.to_string(), "AA:BB:CC:DD:EE:FF");
    }

    #[test]
    fn test_room_omits_empty_id() {
        let room = Room { id: String::new(), name: "default".into() };
        assert_eq!(serde_json::to_string(&room).unwrap(), r#"{"name":"default"}"#);
    }
}
