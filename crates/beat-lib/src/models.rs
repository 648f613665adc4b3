//! Core data models for the beat
//!
//! Samples flow from collectors into the event builder, events flow into the
//! output pipeline, and batches are what the sinks actually see.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tokio::time::Instant;

/// Value read from a data source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SampleValue {
    Number(f64),
    Text(String),
    Structured(BTreeMap<String, SampleValue>),
}

impl SampleValue {
    /// Build a structured value from `(name, value)` pairs
    pub fn structured<I, K>(entries: I) -> Self
    where
        I: IntoIterator<Item = (K, SampleValue)>,
        K: Into<String>,
    {
        SampleValue::Structured(entries.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }
}

impl From<f64> for SampleValue {
    fn from(value: f64) -> Self {
        SampleValue::Number(value)
    }
}

impl From<u64> for SampleValue {
    fn from(value: u64) -> Self {
        SampleValue::Number(value as f64)
    }
}

impl From<&str> for SampleValue {
    fn from(value: &str) -> Self {
        SampleValue::Text(value.to_string())
    }
}

/// Raw reading taken from a source at a point in time
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    source: String,
    value: SampleValue,
    captured_at: DateTime<Utc>,
}

impl Sample {
    pub fn new(source: impl Into<String>, value: SampleValue, captured_at: DateTime<Utc>) -> Self {
        Self {
            source: source.into(),
            value,
            captured_at,
        }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn value(&self) -> &SampleValue {
        &self.value
    }

    pub fn captured_at(&self) -> DateTime<Utc> {
        self.captured_at
    }

    pub(crate) fn into_parts(self) -> (String, SampleValue, DateTime<Utc>) {
        (self.source, self.value, self.captured_at)
    }
}

/// Flattened event field value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Number(f64),
    Text(String),
}

/// Agent metadata attached to every event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventMetadata {
    pub name: String,
    pub host: String,
    pub version: String,
}

/// Canonical structured record shipped to the outputs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "@timestamp")]
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "type")]
    pub event_type: String,
    pub source: String,
    pub fields: BTreeMap<String, FieldValue>,
    #[serde(rename = "beat")]
    pub metadata: EventMetadata,
}

impl Event {
    /// Encode the event as a single JSON line (no trailing newline)
    pub fn to_json_line(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// Group of events sent to a sink in a single attempt
#[derive(Debug, Clone)]
pub struct Batch {
    sequence: u64,
    events: Vec<Event>,
    created_at: Instant,
    attempts: u32,
    size_bytes: usize,
}

impl Batch {
    pub fn new(sequence: u64, events: Vec<Event>, created_at: Instant) -> Self {
        let size_bytes = events
            .iter()
            .map(|e| e.to_json_line().map(|l| l.len() + 1).unwrap_or(0))
            .sum();
        Self {
            sequence,
            events,
            created_at,
            attempts: 0,
            size_bytes,
        }
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn events(&self) -> &[Event] {
        &self.events
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// Number of send attempts made so far
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Approximate encoded size, used for retry queue accounting
    pub fn size_bytes(&self) -> usize {
        self.size_bytes
    }

    /// Encode every event as newline-delimited JSON
    pub fn to_ndjson(&self) -> serde_json::Result<Vec<u8>> {
        let mut out = Vec::with_capacity(self.size_bytes);
        for event in &self.events {
            out.extend_from_slice(event.to_json_line()?.as_bytes());
            out.push(b'\n');
        }
        Ok(out)
    }

    pub(crate) fn record_attempt(&mut self) {
        self.attempts += 1;
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::event;
    use super::*;

    #[test]
    fn test_event_json_shape() {
        let json: serde_json::Value =
            serde_json::from_str(&event("cpu", 1.5).to_json_line().unwrap()).unwrap();

        assert_eq!(json["type"], "hwbeat");
        assert_eq!(json["source"], "cpu");
        assert_eq!(json["fields"]["cpu.value"], 1.5);
        assert_eq!(json["beat"]["host"], "test-host");
        assert!(json["@timestamp"].is_string());
    }

    #[test]
    fn test_batch_ndjson_has_one_line_per_event() {
        let batch = Batch::new(
            7,
            vec![event("cpu", 1.0), event("memory", 2.0)],
            Instant::now(),
        );

        let body = String::from_utf8(batch.to_ndjson().unwrap()).unwrap();
        assert_eq!(body.lines().count(), 2);
        assert_eq!(batch.size_bytes(), body.len());
        assert_eq!(batch.sequence(), 7);
        assert_eq!(batch.attempts(), 0);
    }

    #[test]
    fn test_structured_sample_value() {
        let value = SampleValue::structured([("user", 10u64.into()), ("label", "x".into())]);
        match value {
            SampleValue::Structured(map) => {
                assert_eq!(map["user"], SampleValue::Number(10.0));
                assert_eq!(map["label"], SampleValue::Text("x".to_string()));
            }
            other => panic!("unexpected value {:?}", other),
        }
    }
}
