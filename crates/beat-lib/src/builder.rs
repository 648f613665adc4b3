//! Event builder
//!
//! Turns raw samples into the flat, timestamped events the outputs ship.
//! Building is pure; the only outside input is the injected clock.

use crate::clock::Clock;
use crate::config::{ProcessingConfig, BEAT_NAME};
use crate::error::ValidationError;
use crate::models::{Event, EventMetadata, FieldValue, Sample, SampleValue};
use crate::observability::{drop_reasons, BeatMetrics};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Strip characters that are not allowed in field names
pub fn sanitize_field_name(name: &str) -> String {
    name.chars().filter(|c| *c != ' ' && *c != '#').collect()
}

/// Counters from one builder run
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BuildStats {
    pub built: u64,
    pub invalid: u64,
}

/// Converts samples to events
pub struct EventBuilder {
    metadata: EventMetadata,
    min_value: f64,
    max_value: f64,
    clock: Arc<dyn Clock>,
}

impl EventBuilder {
    pub fn new(config: &ProcessingConfig, host: impl Into<String>, clock: Arc<dyn Clock>) -> Self {
        Self {
            metadata: EventMetadata {
                name: BEAT_NAME.to_string(),
                host: host.into(),
                version: env!("CARGO_PKG_VERSION").to_string(),
            },
            min_value: config.min_value,
            max_value: config.max_value,
            clock,
        }
    }

    /// Build one event
    ///
    /// The event timestamp never precedes the sample's capture time, even if
    /// the wall clock stepped backwards in between.
    pub fn build(&self, sample: Sample) -> Result<Event, ValidationError> {
        let (source, value, captured_at) = sample.into_parts();
        let source = sanitize_field_name(&source);
        if source.is_empty() {
            return Err(ValidationError {
                source_name: source,
                field: String::new(),
                reason: "empty source name".to_string(),
            });
        }

        let mut fields = BTreeMap::new();
        self.flatten(&source, &source, value, &mut fields)?;

        Ok(Event {
            timestamp: self.clock.wall().max(captured_at),
            event_type: self.metadata.name.clone(),
            source,
            fields,
            metadata: self.metadata.clone(),
        })
    }

    fn flatten(
        &self,
        source: &str,
        prefix: &str,
        value: SampleValue,
        out: &mut BTreeMap<String, FieldValue>,
    ) -> Result<(), ValidationError> {
        match value {
            SampleValue::Number(n) => {
                self.check_number(source, prefix, n)?;
                insert_field(source, prefix, FieldValue::Number(n), out)?;
            }
            SampleValue::Text(text) => {
                insert_field(source, prefix, FieldValue::Text(text), out)?;
            }
            SampleValue::Structured(entries) => {
                for (key, nested) in entries {
                    let key = sanitize_field_name(&key);
                    if key.is_empty() {
                        return Err(ValidationError {
                            source_name: source.to_string(),
                            field: prefix.to_string(),
                            reason: "empty field name".to_string(),
                        });
                    }
                    self.flatten(source, &format!("{}.{}", prefix, key), nested, out)?;
                }
            }
        }
        Ok(())
    }

    fn check_number(&self, source: &str, field: &str, n: f64) -> Result<(), ValidationError> {
        let reason = if !n.is_finite() {
            format!("value {} is not finite", n)
        } else if n < self.min_value || n > self.max_value {
            format!(
                "value {} outside [{}, {}]",
                n, self.min_value, self.max_value
            )
        } else {
            return Ok(());
        };

        Err(ValidationError {
            source_name: source.to_string(),
            field: field.to_string(),
            reason,
        })
    }

    /// Build events until the sample channel closes or the pipeline goes away
    ///
    /// Invalid samples are dropped and counted; they never stop the loop.
    pub async fn run(
        self,
        mut samples_rx: mpsc::Receiver<Sample>,
        events_tx: mpsc::Sender<Event>,
    ) -> BuildStats {
        let metrics = BeatMetrics::new();
        let mut stats = BuildStats::default();

        while let Some(sample) = samples_rx.recv().await {
            match self.build(sample) {
                Ok(event) => {
                    stats.built += 1;
                    if events_tx.send(event).await.is_err() {
                        debug!("Event channel closed, stopping event builder");
                        break;
                    }
                }
                Err(err) => {
                    stats.invalid += 1;
                    metrics.add_events_dropped(drop_reasons::INVALID, 1);
                    warn!(error = %err, "Dropping invalid sample");
                }
            }
        }

        stats
    }
}

/// Insert a flattened field, rejecting names that already exist
///
/// Sanitizing can map distinct keys to the same name (`a b` and `ab`).
fn insert_field(
    source: &str,
    field: &str,
    value: FieldValue,
    out: &mut BTreeMap<String, FieldValue>,
) -> Result<(), ValidationError> {
    if out.contains_key(field) {
        return Err(ValidationError {
            source_name: source.to_string(),
            field: field.to_string(),
            reason: "duplicate field name".to_string(),
        });
    }
    out.insert(field.to_string(), value);
    Ok(())
}
