//! Typed JSON-LD property and relationship primitives.
//!
//! Entities are opaque to the broker beyond the `{id, type, @context}`
//! envelope; these types exist so that sources and clients can produce
//! wire-correct attribute shapes without hand-rolling JSON.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

/// The required base properties every entity must carry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BaseEntity {
    pub id: String,
    #[serde(rename = "type")]
    pub entity_type: String,
    #[serde(rename = "@context", default)]
    pub context: Vec<String>,
}

/// A date-time valued property, serialised as the nested
/// `{"@type":"DateTime","@value":"..."}` shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateTimeProperty {
    #[serde(rename = "type")]
    property_type: String,
    pub value: DateTimeValue,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateTimeValue {
    #[serde(rename = "@type")]
    value_type: String,
    #[serde(rename = "@value")]
    pub value: String,
}

impl DateTimeProperty {
    /// Creates a property from an RFC 3339 timestamp string.
    pub fn new(value: impl Into<String>) -> Self {
        DateTimeProperty {
            property_type: "Property".to_string(),
            value: DateTimeValue {
                value_type: "DateTime".to_string(),
                value: value.into(),
            },
        }
    }

    pub fn from_datetime(timestamp: &DateTime<Utc>) -> Self {
        Self::new(timestamp.to_rfc3339_opts(SecondsFormat::Secs, true))
    }
}

/// A number valued property, optionally annotated with a UN/CEFACT unit code.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NumberProperty {
    #[serde(rename = "type")]
    property_type: String,
    pub value: f64,
    #[serde(rename = "unitCode", skip_serializing_if = "Option::is_none")]
    pub unit_code: Option<String>,
}

impl NumberProperty {
    pub fn new(value: f64) -> Self {
        NumberProperty {
            property_type: "Property".to_string(),
            value,
            unit_code: None,
        }
    }

    pub fn from_int(value: i64) -> Self {
        Self::new(value as f64)
    }

    /// Parses any syntactically valid decimal. A value that fails to parse
    /// yields 0 silently; existing clients depend on this.
    pub fn from_str(value: &str) -> Self {
        Self::new(value.parse::<f64>().unwrap_or(0.0))
    }

    pub fn with_unit_code(mut self, unit_code: impl Into<String>) -> Self {
        self.unit_code = Some(unit_code.into());
        self
    }
}

/// A text valued property.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextProperty {
    #[serde(rename = "type")]
    property_type: String,
    pub value: String,
}

impl TextProperty {
    pub fn new(value: impl Into<String>) -> Self {
        TextProperty {
            property_type: "Property".to_string(),
            value: value.into(),
        }
    }
}

/// A relationship to a single entity, identified by URN.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Relationship {
    #[serde(rename = "type")]
    relationship_type: String,
    pub object: String,
}

impl Relationship {
    pub fn new(object: impl Into<String>) -> Self {
        Relationship {
            relationship_type: "Relationship".to_string(),
            object: object.into(),
        }
    }
}

/// A relationship to several entities.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MultiObjectRelationship {
    #[serde(rename = "type")]
    relationship_type: String,
    pub object: Vec<String>,
}

impl MultiObjectRelationship {
    pub fn new(object: Vec<String>) -> Self {
        MultiObjectRelationship {
            relationship_type: "Relationship".to_string(),
            object,
        }
    }
}
