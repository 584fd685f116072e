//! Table entities and their typed property values.
//!
//! An entity is identified by its partition key and row key; every other
//! property is opaque payload. Entities serialize to the JSON shape used by
//! the table service, where types that JSON cannot carry on its own are
//! annotated with a sibling `Name@odata.type` member.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::{Error, Result};

/// Partition key property name.
pub const PARTITION_KEY: &str = "PartitionKey";
/// Row key property name.
pub const ROW_KEY: &str = "RowKey";
/// Server-assigned modification time property name.
pub const TIMESTAMP: &str = "Timestamp";

const ODATA_TYPE_SUFFIX: &str = "@odata.type";
const ODATA_ETAG: &str = "odata.etag";

/// A typed entity property value.
#[derive(Debug, Clone, PartialEq)]
pub enum EdmValue {
    String(String),
    Int32(i32),
    Int64(i64),
    Double(f64),
    Boolean(bool),
    DateTime(DateTime<Utc>),
    Binary(Vec<u8>),
    Guid(Uuid),
}

impl EdmValue {
    /// The `Edm.*` type name that must accompany this value on the wire,
    /// or `None` when JSON carries the type on its own.
    pub fn odata_type(&self) -> Option<&'static str> {
        match self {
            EdmValue::String(_) | EdmValue::Int32(_) | EdmValue::Boolean(_) => None,
            EdmValue::Int64(_) => Some("Edm.Int64"),
            EdmValue::Double(_) => Some("Edm.Double"),
            EdmValue::DateTime(_) => Some("Edm.DateTime"),
            EdmValue::Binary(_) => Some("Edm.Binary"),
            EdmValue::Guid(_) => Some("Edm.Guid"),
        }
    }

    /// Encode as a JSON value (without the type annotation).
    pub fn to_json(&self) -> Value {
        match self {
            EdmValue::String(s) => Value::String(s.clone()),
            EdmValue::Int32(n) => Value::from(*n),
            EdmValue::Int64(n) => Value::String(n.to_string()),
            EdmValue::Double(d) => {
                if d.is_nan() {
                    Value::String("NaN".to_string())
                } else if d.is_infinite() {
                    let s = if *d > 0.0 { "Infinity" } else { "-Infinity" };
                    Value::String(s.to_string())
                } else {
                    Value::from(*d)
                }
            }
            EdmValue::Boolean(b) => Value::Bool(*b),
            EdmValue::DateTime(dt) => {
                Value::String(dt.to_rfc3339_opts(SecondsFormat::AutoSi, true))
            }
            EdmValue::Binary(bytes) => Value::String(STANDARD.encode(bytes)),
            EdmValue::Guid(id) => Value::String(id.to_string()),
        }
    }

    /// Decode a JSON value, using the `Edm.*` annotation when present.
    pub fn from_json(name: &str, value: &Value, odata_type: Option<&str>) -> Result<Self> {
        let invalid = || {
            Error::Serialization(format!(
                "Property '{}' is not a valid {}",
                name,
                odata_type.unwrap_or("value")
            ))
        };

        match odata_type {
            Some("Edm.String") => value.as_str().map(|s| EdmValue::String(s.to_string())).ok_or_else(invalid),
            Some("Edm.Int32") => value
                .as_i64()
                .and_then(|n| i32::try_from(n).ok())
                .map(EdmValue::Int32)
                .ok_or_else(invalid),
            Some("Edm.Int64") => match value {
                Value::String(s) => s.parse().map(EdmValue::Int64).map_err(|_| invalid()),
                Value::Number(n) => n.as_i64().map(EdmValue::Int64).ok_or_else(invalid),
                _ => Err(invalid()),
            },
            Some("Edm.Double") => match value {
                Value::String(s) => match s.as_str() {
                    "NaN" => Ok(EdmValue::Double(f64::NAN)),
                    "Infinity" => Ok(EdmValue::Double(f64::INFINITY)),
                    "-Infinity" => Ok(EdmValue::Double(f64::NEG_INFINITY)),
                    other => other.parse().map(EdmValue::Double).map_err(|_| invalid()),
                },
                Value::Number(n) => n.as_f64().map(EdmValue::Double).ok_or_else(invalid),
                _ => Err(invalid()),
            },
            Some("Edm.Boolean") => value.as_bool().map(EdmValue::Boolean).ok_or_else(invalid),
            Some("Edm.DateTime") => value
                .as_str()
                .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                .map(|dt| EdmValue::DateTime(dt.with_timezone(&Utc)))
                .ok_or_else(invalid),
            Some("Edm.Binary") => value
                .as_str()
                .and_then(|s| STANDARD.decode(s).ok())
                .map(EdmValue::Binary)
                .ok_or_else(invalid),
            Some("Edm.Guid") => value
                .as_str()
                .and_then(|s| Uuid::parse_str(s).ok())
                .map(EdmValue::Guid)
                .ok_or_else(invalid),
            Some(other) => Err(Error::Serialization(format!(
                "Property '{}' has unsupported type {}",
                name, other
            ))),
            None => match value {
                Value::String(s) => Ok(EdmValue::String(s.clone())),
                Value::Bool(b) => Ok(EdmValue::Boolean(*b)),
                Value::Number(n) => {
                    if let Some(small) = n.as_i64().and_then(|v| i32::try_from(v).ok()) {
                        Ok(EdmValue::Int32(small))
                    } else if let Some(big) = n.as_i64() {
                        Ok(EdmValue::Int64(big))
                    } else {
                        n.as_f64().map(EdmValue::Double).ok_or_else(invalid)
                    }
                }
                _ => Err(invalid()),
            },
        }
    }
}

impl From<&str> for EdmValue {
    fn from(v: &str) -> Self {
        EdmValue::String(v.to_string())
    }
}

impl From<String> for EdmValue {
    fn from(v: String) -> Self {
        EdmValue::String(v)
    }
}

impl From<i32> for EdmValue {
    fn from(v: i32) -> Self {
        EdmValue::Int32(v)
    }
}

impl From<i64> for EdmValue {
    fn from(v: i64) -> Self {
        EdmValue::Int64(v)
    }
}

impl From<f64> for EdmValue {
    fn from(v: f64) -> Self {
        EdmValue::Double(v)
    }
}

impl From<bool> for EdmValue {
    fn from(v: bool) -> Self {
        EdmValue::Boolean(v)
    }
}

impl From<DateTime<Utc>> for EdmValue {
    fn from(v: DateTime<Utc>) -> Self {
        EdmValue::DateTime(v)
    }
}

impl From<Vec<u8>> for EdmValue {
    fn from(v: Vec<u8>) -> Self {
        EdmValue::Binary(v)
    }
}

impl From<Uuid> for EdmValue {
    fn from(v: Uuid) -> Self {
        EdmValue::Guid(v)
    }
}

/// A keyed table record.
///
/// The key pair is required at construction, so an `Entity` can always be
/// addressed. `timestamp` and `etag` are assigned by the service and only
/// present on entities read back from a table.
#[derive(Debug, Clone, PartialEq)]
pub struct Entity {
    partition_key: String,
    row_key: String,
    timestamp: Option<DateTime<Utc>>,
    etag: Option<String>,
    properties: BTreeMap<String, EdmValue>,
}

impl Entity {
    /// Create an entity with no payload properties.
    pub fn new(partition_key: impl Into<String>, row_key: impl Into<String>) -> Self {
        Self {
            partition_key: partition_key.into(),
            row_key: row_key.into(),
            timestamp: None,
            etag: None,
            properties: BTreeMap::new(),
        }
    }

    /// Builder form of [`Entity::set`].
    pub fn with(mut self, name: impl Into<String>, value: impl Into<EdmValue>) -> Result<Self> {
        self.set(name, value)?;
        Ok(self)
    }

    /// Set a payload property, returning the previous value.
    ///
    /// # Errors
    /// - The name is one of the system properties (`PartitionKey`,
    ///   `RowKey`, `Timestamp`) or is empty
    pub fn set(
        &mut self,
        name: impl Into<String>,
        value: impl Into<EdmValue>,
    ) -> Result<Option<EdmValue>> {
        let name = name.into();
        if name.is_empty() || is_system_property(&name) {
            return Err(Error::InvalidInput(format!(
                "'{}' cannot be used as a property name",
                name
            )));
        }
        Ok(self.properties.insert(name, value.into()))
    }

    /// Remove a payload property.
    pub fn remove(&mut self, name: &str) -> Option<EdmValue> {
        self.properties.remove(name)
    }

    /// Get a payload property.
    pub fn get(&self, name: &str) -> Option<&EdmValue> {
        self.properties.get(name)
    }

    pub fn partition_key(&self) -> &str {
        &self.partition_key
    }

    pub fn row_key(&self) -> &str {
        &self.row_key
    }

    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        self.timestamp
    }

    pub fn etag(&self) -> Option<&str> {
        self.etag.as_deref()
    }

    /// Payload properties in name order.
    pub fn properties(&self) -> &BTreeMap<String, EdmValue> {
        &self.properties
    }

    /// Record the service-assigned modification time and ETag.
    pub fn set_system_properties(&mut self, timestamp: DateTime<Utc>, etag: impl Into<String>) {
        self.timestamp = Some(timestamp);
        self.etag = Some(etag.into());
    }

    /// Drop service-assigned fields, leaving keys and payload.
    pub fn without_system_properties(mut self) -> Self {
        self.timestamp = None;
        self.etag = None;
        self
    }

    /// Overlay `other`'s payload properties onto this entity.
    ///
    /// Properties absent from `other` are kept.
    pub fn merge_from(&mut self, other: &Entity) {
        for (name, value) in &other.properties {
            self.properties.insert(name.clone(), value.clone());
        }
    }

    /// Keep only the named payload properties.
    pub fn project(&mut self, names: &[String]) {
        self.properties.retain(|name, _| names.iter().any(|n| n == name));
    }

    /// Look up a property by wire name, including the system properties.
    pub fn property(&self, name: &str) -> Option<EdmValue> {
        match name {
            PARTITION_KEY => Some(EdmValue::String(self.partition_key.clone())),
            ROW_KEY => Some(EdmValue::String(self.row_key.clone())),
            TIMESTAMP => self.timestamp.map(EdmValue::DateTime),
            _ => self.properties.get(name).cloned(),
        }
    }

    /// Encode in the table service's JSON request shape.
    ///
    /// `Timestamp` and the ETag are never sent; the service owns them.
    pub fn to_json(&self) -> Map<String, Value> {
        let mut map = Map::new();
        map.insert(PARTITION_KEY.to_string(), Value::String(self.partition_key.clone()));
        map.insert(ROW_KEY.to_string(), Value::String(self.row_key.clone()));

        for (name, value) in &self.properties {
            if let Some(odata_type) = value.odata_type() {
                map.insert(
                    format!("{}{}", name, ODATA_TYPE_SUFFIX),
                    Value::String(odata_type.to_string()),
                );
            }
            map.insert(name.clone(), value.to_json());
        }

        map
    }

    /// Decode from the table service's JSON response shape.
    ///
    /// # Errors
    /// - Missing or non-string `PartitionKey` / `RowKey`
    /// - A property whose value does not match its annotation
    pub fn from_json(map: &Map<String, Value>) -> Result<Self> {
        let key = |name: &str| {
            map.get(name)
                .and_then(Value::as_str)
                .map(str::to_string)
                .ok_or_else(|| Error::Serialization(format!("Entity is missing {}", name)))
        };

        let mut entity = Entity::new(key(PARTITION_KEY)?, key(ROW_KEY)?);

        entity.etag = map.get(ODATA_ETAG).and_then(Value::as_str).map(str::to_string);
        entity.timestamp = map
            .get(TIMESTAMP)
            .and_then(Value::as_str)
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc));

        for (name, value) in map {
            if is_system_property(name) || name.contains('@') || name.starts_with("odata.") {
                continue;
            }
            let annotation = map
                .get(&format!("{}{}", name, ODATA_TYPE_SUFFIX))
                .and_then(Value::as_str);
            let value = EdmValue::from_json(name, value, annotation)?;
            entity.properties.insert(name.clone(), value);
        }

        Ok(entity)
    }
}

fn is_system_property(name: &str) -> bool {
    matches!(name, PARTITION_KEY | ROW_KEY | TIMESTAMP)
}

impl Serialize for Entity {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Entity {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let map = Map::<String, Value>::deserialize(deserializer)?;
        Entity::from_json(&map).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    #[test]
    fn test_system_property_names_rejected() {
        let mut entity = Entity::new("p", "r");
        assert!(entity.set("PartitionKey", "x").is_err());
        assert!(entity.set("Timestamp", 1).is_err());
        assert!(entity.set("", 1).is_err());
        assert!(entity.set("Score", 1).is_ok());
    }

    #[test]
    fn test_to_json_annotates_ambiguous_types() {
        let when = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        let entity = Entity::new("builds", "42")
            .with("Url", "https://example.com")
            .unwrap()
            .with("Score", 97)
            .unwrap()
            .with("Bytes", 5_000_000_000i64)
            .unwrap()
            .with("Finished", when)
            .unwrap();

        let json = Value::Object(entity.to_json());

        assert_eq!(json["PartitionKey"], "builds");
        assert_eq!(json["RowKey"], "42");
        assert_eq!(json["Score"], 97);
        assert!(json.get("Score@odata.type").is_none());
        assert_eq!(json["Bytes"], "5000000000");
        assert_eq!(json["Bytes@odata.type"], "Edm.Int64");
        assert_eq!(json["Finished"], "2024-03-01T12:00:00Z");
        assert_eq!(json["Finished@odata.type"], "Edm.DateTime");
        assert!(json.get("Timestamp").is_none());
    }

    #[test]
    fn test_from_json_reads_service_response() {
        let body = json!({
            "odata.etag": "W/\"datetime'2024-03-01T12%3A00%3A00.1Z'\"",
            "PartitionKey": "builds",
            "RowKey": "42",
            "Timestamp": "2024-03-01T12:00:00.1Z",
            "Passed": true,
            "Ratio": 0.5,
            "Payload@odata.type": "Edm.Binary",
            "Payload": "aGVsbG8=",
            "RunId@odata.type": "Edm.Guid",
            "RunId": "c9da6455-213d-42c9-9a79-3e9149a57833"
        });

        let entity = Entity::from_json(body.as_object().unwrap()).unwrap();

        assert_eq!(entity.partition_key(), "builds");
        assert_eq!(entity.row_key(), "42");
        assert!(entity.timestamp().is_some());
        assert!(entity.etag().unwrap().starts_with("W/"));
        assert_eq!(entity.get("Passed"), Some(&EdmValue::Boolean(true)));
        assert_eq!(entity.get("Ratio"), Some(&EdmValue::Double(0.5)));
        assert_eq!(entity.get("Payload"), Some(&EdmValue::Binary(b"hello".to_vec())));
        assert!(matches!(entity.get("RunId"), Some(EdmValue::Guid(_))));
        assert_eq!(entity.properties().len(), 4);
    }

    #[test]
    fn test_from_json_requires_keys() {
        let body = json!({ "RowKey": "1", "Name": "x" });
        assert!(Entity::from_json(body.as_object().unwrap()).is_err());
    }

    #[test]
    fn test_from_json_rejects_mismatched_annotation() {
        let body = json!({
            "PartitionKey": "p",
            "RowKey": "r",
            "When@odata.type": "Edm.DateTime",
            "When": "yesterday"
        });
        assert!(Entity::from_json(body.as_object().unwrap()).is_err());
    }

    #[test]
    fn test_merge_keeps_untouched_properties() {
        let mut stored = Entity::new("p", "r")
            .with("A", 1)
            .unwrap()
            .with("B", "old")
            .unwrap();
        let patch = Entity::new("p", "r").with("B", "new").unwrap();

        stored.merge_from(&patch);

        assert_eq!(stored.get("A"), Some(&EdmValue::Int32(1)));
        assert_eq!(stored.get("B"), Some(&EdmValue::String("new".to_string())));
    }

    #[test]
    fn test_serde_passes_through_json_shape() {
        let entity = Entity::new("p", "r").with("Big", 1i64 << 40).unwrap();
        let text = serde_json::to_string(&entity).unwrap();
        let back: Entity = serde_json::from_str(&text).unwrap();
        assert_eq!(back, entity);
    }
}
