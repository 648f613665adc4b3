//! Metrics collection from the host
//!
//! Each [`Collector`] polls one data source and turns it into a [`Sample`].
//! The built-in collectors read the proc filesystem; the root is injectable so
//! tests can point them at a fixture tree.

mod r#loop;
mod procfs;

#[cfg(test)]
mod tests;

pub use procfs::{CpuCollector, CpuStat, CpuTimes, LoadCollector, MemoryCollector};
pub use r#loop::{CollectionConfig, CollectionLoop, CollectionLoopBuilder};

use crate::clock::Clock;
use crate::config::{CollectorConfig, CollectorKind};
use crate::error::CollectError;
use crate::models::{Sample, SampleValue};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

pub use async_trait::async_trait;

/// A data source polled on a fixed interval
#[async_trait]
pub trait Collector: Send + Sync {
    /// Source identifier, used for logging and field prefixes
    fn name(&self) -> &str;

    /// Take one reading
    async fn poll(&mut self) -> Result<Sample, CollectError>;
}

/// Build the collector for one configuration entry
pub fn create_collector(
    config: &CollectorConfig,
    proc_path: &Path,
    clock: Arc<dyn Clock>,
) -> Box<dyn Collector> {
    let filter = FieldFilter::new(config.fields.clone());
    match config.kind {
        CollectorKind::Cpu => Box::new(CpuCollector::new(
            proc_path,
            filter,
            clock,
            config.per_instance,
        )),
        CollectorKind::Memory => Box::new(MemoryCollector::new(proc_path, filter, clock)),
        CollectorKind::Load => Box::new(LoadCollector::new(proc_path, filter, clock)),
    }
}

/// Allow-list of field names a collector should emit
#[derive(Debug, Clone, Default)]
pub struct FieldFilter {
    fields: Vec<String>,
}

impl FieldFilter {
    pub fn new(fields: Vec<String>) -> Self {
        Self { fields }
    }

    /// Keep only the configured fields and report the ones the source lacked
    pub fn apply(
        &self,
        mut values: BTreeMap<String, SampleValue>,
    ) -> (BTreeMap<String, SampleValue>, Vec<String>) {
        if self.fields.is_empty() {
            return (values, Vec::new());
        }

        let mut kept = BTreeMap::new();
        let mut missing = Vec::new();
        for field in &self.fields {
            match values.remove(field) {
                Some(value) => {
                    kept.insert(field.clone(), value);
                }
                None => missing.push(field.clone()),
            }
        }
        (kept, missing)
    }
}
