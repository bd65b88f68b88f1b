//! MISP wire types.
//!
//! MISP serializes most numbers as JSON strings and has shipped several
//! shapes for the same payload across versions, so the deserializers here
//! accept both forms and the collection walkers tolerate one level of
//! nesting. Entries that still fail to parse are skipped by the callers,
//! never fatal to a batch.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Deserializer};
use serde_json::Value;
use std::collections::HashSet;
use tracing::warn;

/// Header of a remote event as seen in the index.
#[derive(Debug, Clone, Deserialize)]
pub struct MispEventSummary {
    #[serde(deserialize_with = "string_or_number")]
    pub id: String,
    #[serde(default)]
    pub info: String,
    /// Publication time, seconds since epoch.
    #[serde(default, deserialize_with = "i64_or_string")]
    pub publish_timestamp: i64,
    /// Event date, `YYYY-MM-DD`.
    #[serde(default)]
    pub date: String,
    /// MISP threat level, 1 (high) to 4 (undefined).
    #[serde(default = "default_threat_level", deserialize_with = "u8_or_string")]
    pub threat_level_id: u8,
    #[serde(default, rename = "Tag", deserialize_with = "tag_names")]
    pub tags: Vec<String>,
}

fn default_threat_level() -> u8 {
    4
}

impl MispEventSummary {
    /// Platform severity for this event: MISP threat level 1..4 maps to
    /// severity 3/2/1/1.
    pub fn severity(&self) -> u8 {
        match self.threat_level_id {
            1 => 3,
            2 => 2,
            _ => 1,
        }
    }

    /// The event date at midnight UTC, falling back to the publication
    /// timestamp when the date string is absent or malformed.
    pub fn event_date(&self) -> DateTime<Utc> {
        NaiveDate::parse_from_str(&self.date, "%Y-%m-%d")
            .ok()
            .and_then(|d| d.and_hms_opt(0, 0, 0))
            .map(|dt| dt.and_utc())
            .or_else(|| DateTime::from_timestamp(self.publish_timestamp, 0))
            .unwrap_or_else(|| DateTime::from_timestamp(0, 0).unwrap_or_default())
    }
}

/// One attribute of a remote event.
#[derive(Debug, Clone, Deserialize)]
pub struct MispAttribute {
    #[serde(deserialize_with = "string_or_number")]
    pub id: String,
    #[serde(rename = "type")]
    pub attribute_type: String,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub value: String,
    #[serde(default)]
    pub comment: String,
    /// Attribute update time, seconds since epoch.
    #[serde(default, deserialize_with = "i64_or_string")]
    pub timestamp: i64,
    #[serde(default, deserialize_with = "bool_or_string")]
    pub deleted: bool,
    #[serde(default, rename = "Tag", deserialize_with = "tag_names")]
    pub tags: Vec<String>,
}

/// Parses an `events/index` response body into summaries, skipping entries
/// that fail to parse. Returns the parsed summaries and the raw entry count
/// so the caller can report a mismatch.
pub fn parse_event_summaries(body: &Value) -> (Vec<MispEventSummary>, usize) {
    let Some(entries) = body.as_array() else {
        return (Vec::new(), 0);
    };
    let mut summaries = Vec::with_capacity(entries.len());
    for entry in entries {
        // Index entries are flat, but some deployments wrap each in {"Event": ..}.
        let event = entry.get("Event").unwrap_or(entry);
        match serde_json::from_value::<MispEventSummary>(event.clone()) {
            Ok(summary) => summaries.push(summary),
            Err(err) => warn!(%err, "skipping unparsable event summary"),
        }
    }
    (summaries, entries.len())
}

/// Parses an `attributes/restSearch/json` response body, flattening the
/// `response.Attribute[*]` path across the shapes MISP has shipped.
pub fn parse_attributes(body: &Value) -> Vec<MispAttribute> {
    let mut attributes = Vec::new();
    let response = body.get("response").unwrap_or(body);
    collect_attributes(response, &mut attributes, 0);
    attributes
}

fn collect_attributes(node: &Value, out: &mut Vec<MispAttribute>, depth: u8) {
    if depth > 2 {
        return;
    }
    match node {
        Value::Array(items) => {
            for item in items {
                collect_attributes(item, out, depth + 1);
            }
        }
        Value::Object(map) => match map.get("Attribute") {
            Some(Value::Array(items)) => {
                for item in items {
                    push_attribute(item, out);
                }
            }
            Some(single @ Value::Object(_)) => push_attribute(single, out),
            _ => {}
        },
        _ => {}
    }
}

fn push_attribute(value: &Value, out: &mut Vec<MispAttribute>) {
    match serde_json::from_value::<MispAttribute>(value.clone()) {
        Ok(attribute) => out.push(attribute),
        Err(err) => warn!(%err, "skipping unparsable attribute"),
    }
}

/// Extracts the new event id from a `POST events` response
/// (`{"Event": {"id": ..}}`, or a flat `{"id": ..}`).
pub fn created_event_id(body: &Value) -> Option<String> {
    let event = body.get("Event").unwrap_or(body);
    match event.get("id") {
        Some(Value::String(id)) => Some(id.clone()),
        Some(Value::Number(id)) => Some(id.to_string()),
        _ => None,
    }
}

/// Indexes of attributes MISP rejected during event creation, read from
/// `errors.Attribute` as a map of decimal index to `{value: [msg]}`. Any
/// unexpected shape is treated as "no errors recorded".
pub fn rejected_attribute_indexes(body: &Value) -> HashSet<usize> {
    let mut rejected = HashSet::new();
    let Some(map) = body
        .get("errors")
        .and_then(|e| e.get("Attribute"))
        .and_then(Value::as_object)
    else {
        return rejected;
    };
    for key in map.keys() {
        if let Ok(index) = key.parse::<usize>() {
            rejected.insert(index);
        }
    }
    rejected
}

// Deserializer helpers for MISP's stringly-typed numbers.

fn string_or_number<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Str(String),
        Num(i64),
    }
    Ok(match Raw::deserialize(deserializer)? {
        Raw::Str(s) => s,
        Raw::Num(n) => n.to_string(),
    })
}

fn i64_or_string<'de, D: Deserializer<'de>>(deserializer: D) -> Result<i64, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Num(i64),
        Str(String),
    }
    Ok(match Raw::deserialize(deserializer)? {
        Raw::Num(n) => n,
        Raw::Str(s) => s.parse().unwrap_or(0),
    })
}

fn u8_or_string<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u8, D::Error> {
    i64_or_string(deserializer).map(|n| n.clamp(0, u8::MAX as i64) as u8)
}

fn bool_or_string<'de, D: Deserializer<'de>>(deserializer: D) -> Result<bool, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Bool(bool),
        Str(String),
        Num(i64),
    }
    Ok(match Raw::deserialize(deserializer)? {
        Raw::Bool(b) => b,
        Raw::Str(s) => s == "1" || s.eq_ignore_ascii_case("true"),
        Raw::Num(n) => n != 0,
    })
}

fn tag_names<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<String>, D::Error> {
    #[derive(Deserialize)]
    struct Tag {
        name: String,
    }
    let tags: Option<Vec<Tag>> = Option::deserialize(deserializer)?;
    Ok(tags
        .unwrap_or_default()
        .into_iter()
        .map(|t| t.name)
        .collect())
}
