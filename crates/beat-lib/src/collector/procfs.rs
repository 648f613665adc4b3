//! procfs metrics collection
//!
//! Reads host-wide counters:
//! - stat for aggregate and per-core CPU time
//! - meminfo for memory usage
//! - loadavg for run-queue load

use super::{Collector, FieldFilter};
use crate::clock::Clock;
use crate::error::CollectError;
use crate::models::{Sample, SampleValue};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tracing::warn;

/// Read a proc file, classifying failures for the collection loop
async fn read_source(name: &str, path: &Path) -> Result<String, CollectError> {
    fs::read_to_string(path)
        .await
        .map_err(|e| CollectError::from_io(name, &e))
}

/// Apply the field filter, warning about configured fields the source lacks
fn filter_fields(
    name: &str,
    filter: &FieldFilter,
    values: BTreeMap<String, SampleValue>,
) -> BTreeMap<String, SampleValue> {
    let (values, missing) = filter.apply(values);
    if !missing.is_empty() {
        warn!(
            collector = %name,
            missing = ?missing,
            "Configured fields not provided by source, skipping them"
        );
    }
    values
}

/// Apply the field filter and build the sample
fn finish_sample(
    name: &str,
    filter: &FieldFilter,
    values: BTreeMap<String, SampleValue>,
    clock: &dyn Clock,
) -> Sample {
    let values = filter_fields(name, filter, values);
    Sample::new(name, SampleValue::Structured(values), clock.wall())
}

/// CPU times in jiffies from one `cpu` line of `stat`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CpuTimes {
    pub user: u64,
    pub nice: u64,
    pub system: u64,
    pub idle: u64,
    pub iowait: u64,
    pub irq: u64,
    pub softirq: u64,
    pub steal: u64,
}

impl CpuTimes {
    fn counters(&self) -> [u64; 8] {
        [
            self.user,
            self.nice,
            self.system,
            self.idle,
            self.iowait,
            self.irq,
            self.softirq,
            self.steal,
        ]
    }

    /// Sum of all counters, saturating at `u64::MAX`
    pub fn total(&self) -> u64 {
        self.counters()
            .iter()
            .fold(0u64, |sum, v| sum.saturating_add(*v))
    }

    fn checked_total(&self) -> Option<u64> {
        self.counters()
            .iter()
            .try_fold(0u64, |sum, v| sum.checked_add(*v))
    }

    fn idle_all(&self) -> u64 {
        self.idle.saturating_add(self.iowait)
    }

    /// Busy percentage between two readings
    pub fn usage_percent_since(&self, previous: &CpuTimes) -> f64 {
        let total = self.total().saturating_sub(previous.total());
        if total == 0 {
            return 0.0;
        }
        let idle = self.idle_all().saturating_sub(previous.idle_all());
        (total.saturating_sub(idle)) as f64 / total as f64 * 100.0
    }

    /// Parse the counters after the title of a `cpu` line
    ///
    /// Needs at least user, nice, system and idle. Readings whose sum does not
    /// fit in a `u64` are rejected.
    fn parse<'a>(counters: impl Iterator<Item = &'a str>) -> Option<CpuTimes> {
        let values: Vec<u64> = counters
            .map(|v| v.parse())
            .collect::<Result<_, _>>()
            .ok()?;

        if values.len() < 4 {
            return None;
        }
        let at = |i: usize| values.get(i).copied().unwrap_or(0);

        let times = CpuTimes {
            user: at(0),
            nice: at(1),
            system: at(2),
            idle: at(3),
            iowait: at(4),
            irq: at(5),
            softirq: at(6),
            steal: at(7),
        };
        times.checked_total()?;
        Some(times)
    }

    fn to_values(self, usage_percent: f64) -> BTreeMap<String, SampleValue> {
        BTreeMap::from([
            ("user".to_string(), self.user.into()),
            ("nice".to_string(), self.nice.into()),
            ("system".to_string(), self.system.into()),
            ("idle".to_string(), self.idle.into()),
            ("iowait".to_string(), self.iowait.into()),
            ("irq".to_string(), self.irq.into()),
            ("softirq".to_string(), self.softirq.into()),
            ("steal".to_string(), self.steal.into()),
            ("usage_percent".to_string(), usage_percent.into()),
        ])
    }
}

/// One read of `stat`: the aggregate line plus each `cpuN` line
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CpuStat {
    pub all: CpuTimes,
    /// Per-core times keyed by line title, e.g. `cpu0`
    pub cores: BTreeMap<String, CpuTimes>,
}

fn is_core_title(title: &str) -> bool {
    title
        .strip_prefix("cpu")
        .map_or(false, |n| !n.is_empty() && n.bytes().all(|b| b.is_ascii_digit()))
}

/// Collector for CPU time, aggregate and optionally per core
pub struct CpuCollector {
    stat_path: PathBuf,
    filter: FieldFilter,
    clock: Arc<dyn Clock>,
    per_instance: bool,
    previous: Option<CpuTimes>,
    previous_cores: HashMap<String, CpuTimes>,
}

impl CpuCollector {
    pub fn new(
        proc_path: &Path,
        filter: FieldFilter,
        clock: Arc<dyn Clock>,
        per_instance: bool,
    ) -> Self {
        Self {
            stat_path: proc_path.join("stat"),
            filter,
            clock,
            per_instance,
            previous: None,
            previous_cores: HashMap::new(),
        }
    }

    /// Parse the `cpu` and `cpuN` lines of `stat`
    pub fn parse_stat(content: &str) -> Result<CpuStat, String> {
        let mut all = None;
        let mut cores = BTreeMap::new();

        for line in content.lines() {
            let mut parts = line.split_whitespace();
            let Some(title) = parts.next() else {
                continue;
            };
            if title != "cpu" && !is_core_title(title) {
                continue;
            }

            let times = CpuTimes::parse(parts)
                .ok_or_else(|| format!("malformed `{}` line in stat", title))?;
            if title == "cpu" {
                all = Some(times);
            } else {
                cores.insert(title.to_string(), times);
            }
        }

        let all = all.ok_or_else(|| "no aggregate cpu line in stat".to_string())?;
        Ok(CpuStat { all, cores })
    }
}

#[async_trait]
impl Collector for CpuCollector {
    fn name(&self) -> &str {
        "cpu"
    }

    async fn poll(&mut self) -> Result<Sample, CollectError> {
        let content = read_source(self.name(), &self.stat_path).await?;
        let stat =
            Self::parse_stat(&content).map_err(|reason| CollectError::transient("cpu", reason))?;

        let usage = self
            .previous
            .map(|prev| stat.all.usage_percent_since(&prev))
            .unwrap_or(0.0);
        self.previous = Some(stat.all);

        let mut values = filter_fields("cpu", &self.filter, stat.all.to_values(usage));

        if self.per_instance {
            let mut previous_cores = HashMap::with_capacity(stat.cores.len());
            for (title, times) in stat.cores {
                let usage = self
                    .previous_cores
                    .get(&title)
                    .map(|prev| times.usage_percent_since(prev))
                    .unwrap_or(0.0);
                // Missing fields were already reported for the aggregate
                let (core_values, _) = self.filter.apply(times.to_values(usage));
                values.insert(title.clone(), SampleValue::Structured(core_values));
                previous_cores.insert(title, times);
            }
            // Cores that went offline are forgotten
            self.previous_cores = previous_cores;
        }

        Ok(Sample::new(
            "cpu",
            SampleValue::Structured(values),
            self.clock.wall(),
        ))
    }
}

/// Collector for host memory usage
pub struct MemoryCollector {
    meminfo_path: PathBuf,
    filter: FieldFilter,
    clock: Arc<dyn Clock>,
}

impl MemoryCollector {
    pub fn new(proc_path: &Path, filter: FieldFilter, clock: Arc<dyn Clock>) -> Self {
        Self {
            meminfo_path: proc_path.join("meminfo"),
            filter,
            clock,
        }
    }

    /// Parse `meminfo` into a map of key to bytes
    ///
    /// Fails when a `kB` value does not fit in a `u64` once scaled to bytes.
    pub fn parse_meminfo(content: &str) -> Result<HashMap<String, u64>, String> {
        let mut stats = HashMap::new();

        for line in content.lines() {
            let Some((key, rest)) = line.split_once(':') else {
                continue;
            };
            let key = key.trim();
            let mut parts = rest.split_whitespace();
            let Some(Ok(value)) = parts.next().map(str::parse::<u64>) else {
                continue;
            };
            let bytes = match parts.next() {
                Some("kB") => value
                    .checked_mul(1024)
                    .ok_or_else(|| format!("`{}` out of range in meminfo", key))?,
                _ => value,
            };
            stats.insert(key.to_string(), bytes);
        }

        Ok(stats)
    }
}

#[async_trait]
impl Collector for MemoryCollector {
    fn name(&self) -> &str {
        "memory"
    }

    async fn poll(&mut self) -> Result<Sample, CollectError> {
        let content = read_source(self.name(), &self.meminfo_path).await?;
        let stats = Self::parse_meminfo(&content)
            .map_err(|reason| CollectError::transient("memory", reason))?;

        let total = *stats
            .get("MemTotal")
            .ok_or_else(|| CollectError::transient("memory", "MemTotal missing from meminfo"))?;
        let free = stats.get("MemFree").copied().unwrap_or(0);
        let buffers = stats.get("Buffers").copied().unwrap_or(0);
        let cached = stats.get("Cached").copied().unwrap_or(0);
        // Older kernels have no MemAvailable
        let available = match stats.get("MemAvailable") {
            Some(available) => *available,
            None => free
                .checked_add(buffers)
                .and_then(|sum| sum.checked_add(cached))
                .ok_or_else(|| {
                    CollectError::transient("memory", "available memory out of range")
                })?,
        };

        let used_percent = if total == 0 {
            0.0
        } else {
            total.saturating_sub(available) as f64 / total as f64 * 100.0
        };

        let values = BTreeMap::from([
            ("total_bytes".to_string(), total.into()),
            ("free_bytes".to_string(), free.into()),
            ("available_bytes".to_string(), available.into()),
            ("buffers_bytes".to_string(), buffers.into()),
            ("cached_bytes".to_string(), cached.into()),
            ("used_percent".to_string(), used_percent.into()),
        ]);

        Ok(finish_sample(
            "memory",
            &self.filter,
            values,
            self.clock.as_ref(),
        ))
    }
}

/// Collector for system load averages
pub struct LoadCollector {
    loadavg_path: PathBuf,
    filter: FieldFilter,
    clock: Arc<dyn Clock>,
}

/// Parsed `loadavg` contents
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LoadAverage {
    pub load1: f64,
    pub load5: f64,
    pub load15: f64,
    pub running: u64,
    pub total: u64,
}

impl LoadCollector {
    pub fn new(proc_path: &Path, filter: FieldFilter, clock: Arc<dyn Clock>) -> Self {
        Self {
            loadavg_path: proc_path.join("loadavg"),
            filter,
            clock,
        }
    }

    /// Parse `loadavg`, e.g. `0.50 0.40 0.30 2/345 12345`
    pub fn parse_loadavg(content: &str) -> Option<LoadAverage> {
        let mut parts = content.split_whitespace();
        let load1 = parts.next()?.parse().ok()?;
        let load5 = parts.next()?.parse().ok()?;
        let load15 = parts.next()?.parse().ok()?;
        let (running, total) = parts.next()?.split_once('/')?;

        Some(LoadAverage {
            load1,
            load5,
            load15,
            running: running.parse().ok()?,
            total: total.parse().ok()?,
        })
    }
}

#[async_trait]
impl Collector for LoadCollector {
    fn name(&self) -> &str {
        "load"
    }

    async fn poll(&mut self) -> Result<Sample, CollectError> {
        let content = read_source(self.name(), &self.loadavg_path).await?;
        let load = Self::parse_loadavg(&content)
            .ok_or_else(|| CollectError::transient("load", "malformed loadavg"))?;

        let values = BTreeMap::from([
            ("load1".to_string(), load.load1.into()),
            ("load5".to_string(), load.load5.into()),
            ("load15".to_string(), load.load15.into()),
            ("running".to_string(), load.running.into()),
            ("total".to_string(), load.total.into()),
        ]);

        Ok(finish_sample("load", &self.filter, values, self.clock.as_ref()))
    }
}
