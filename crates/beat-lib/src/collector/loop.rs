//! Collection loop
//!
//! Drives one collector on a fixed interval. Samples go down the shared sample
//! channel in the order they were taken; fatal errors go to the supervisor.
//! Each poll outcome is reported as the collector's health when a registry is
//! attached.

use super::Collector;
use crate::error::{AgentError, CollectError};
use crate::health::{components, HealthRegistry};
use crate::models::Sample;
use crate::observability::BeatMetrics;
use crate::state::{AgentState, AgentStateHandle};
use anyhow::Result;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Configuration for one collection loop
#[derive(Debug, Clone)]
pub struct CollectionConfig {
    /// Poll interval (default: 1 second)
    pub interval: Duration,
    /// Upper bound on a single poll (default: 5 seconds)
    pub timeout: Duration,
}

impl Default for CollectionConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            timeout: Duration::from_secs(5),
        }
    }
}

/// What a single poll produced
#[derive(Debug)]
enum PollOutcome {
    Sample(Sample),
    Skipped,
    Fatal(CollectError),
}

/// Periodically polls one collector
pub struct CollectionLoop {
    collector: Box<dyn Collector>,
    config: CollectionConfig,
    samples_tx: mpsc::Sender<Sample>,
    fatal_tx: mpsc::Sender<AgentError>,
    state: AgentStateHandle,
    metrics: BeatMetrics,
    health: Option<HealthRegistry>,
    /// Whether the last report marked the collector degraded
    degraded: bool,
}

impl CollectionLoop {
    pub fn new(
        collector: Box<dyn Collector>,
        config: CollectionConfig,
        samples_tx: mpsc::Sender<Sample>,
        fatal_tx: mpsc::Sender<AgentError>,
        state: AgentStateHandle,
    ) -> Self {
        Self {
            collector,
            config,
            samples_tx,
            fatal_tx,
            state,
            metrics: BeatMetrics::new(),
            health: None,
            degraded: false,
        }
    }

    /// Report poll outcomes as `collector.<name>` health
    pub fn with_health(mut self, health: HealthRegistry) -> Self {
        self.health = Some(health);
        self
    }

    /// Run until shutdown, a closed sample channel, or a fatal error
    ///
    /// The first poll happens only once the agent is `Running`.
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) {
        let state = tokio::select! {
            s = self.state.wait_for(AgentState::Running) => s,
            _ = shutdown.recv() => return,
        };
        if state != AgentState::Running {
            debug!(collector = %self.collector.name(), state = %state, "Agent not running, loop not started");
            return;
        }

        info!(
            collector = %self.collector.name(),
            interval_ms = self.config.interval.as_millis() as u64,
            "Starting collection loop"
        );

        let mut ticker = interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut poll_count = 0u64;

        loop {
            tokio::select! {
                biased;
                _ = shutdown.recv() => {
                    info!(collector = %self.collector.name(), polls = poll_count, "Shutting down collection loop");
                    break;
                }
                _ = ticker.tick() => {
                    poll_count += 1;
                    match self.poll_once().await {
                        PollOutcome::Sample(sample) => {
                            if self.samples_tx.send(sample).await.is_err() {
                                debug!(collector = %self.collector.name(), "Sample channel closed");
                                break;
                            }
                        }
                        PollOutcome::Skipped => {}
                        PollOutcome::Fatal(err) => {
                            let _ = self.fatal_tx.send(err.into()).await;
                            break;
                        }
                    }
                }
            }
        }
    }

    /// Poll once under the configured timeout and classify the result
    async fn poll_once(&mut self) -> PollOutcome {
        let start = Instant::now();
        let name = self.collector.name().to_string();

        let result = match tokio::time::timeout(self.config.timeout, self.collector.poll()).await {
            Ok(result) => result,
            Err(_) => Err(CollectError::transient(
                name.clone(),
                format!("poll exceeded {}ms", self.config.timeout.as_millis()),
            )),
        };
        self.metrics
            .observe_collection_latency(start.elapsed().as_secs_f64());

        match result {
            Ok(sample) => {
                if self.degraded {
                    self.degraded = false;
                    if let Some(health) = &self.health {
                        health.set_healthy(&components::collector(&name)).await;
                    }
                }
                PollOutcome::Sample(sample)
            }
            Err(err) if err.is_fatal() => {
                self.metrics.inc_collection_errors(&name, "fatal");
                warn!(collector = %name, error = %err, "Fatal collection error");
                if let Some(health) = &self.health {
                    health
                        .set_unhealthy(&components::collector(&name), err.to_string())
                        .await;
                }
                PollOutcome::Fatal(err)
            }
            Err(err) => {
                self.metrics.inc_collection_errors(&name, "transient");
                warn!(collector = %name, error = %err, "Collection failed, retrying next interval");
                self.degraded = true;
                if let Some(health) = &self.health {
                    health
                        .set_degraded(&components::collector(&name), err.to_string())
                        .await;
                }
                PollOutcome::Skipped
            }
        }
    }
}

/// Builder for creating a collection loop
pub struct CollectionLoopBuilder {
    collector: Option<Box<dyn Collector>>,
    samples_tx: Option<mpsc::Sender<Sample>>,
    fatal_tx: Option<mpsc::Sender<AgentError>>,
    state: Option<AgentStateHandle>,
    health: Option<HealthRegistry>,
    config: CollectionConfig,
}

impl CollectionLoopBuilder {
    /// Create a new builder with default configuration
    pub fn new() -> Self {
        Self {
            collector: None,
            samples_tx: None,
            fatal_tx: None,
            state: None,
            health: None,
            config: CollectionConfig::default(),
        }
    }

    pub fn collector(mut self, collector: Box<dyn Collector>) -> Self {
        self.collector = Some(collector);
        self
    }

    pub fn samples(mut self, tx: mpsc::Sender<Sample>) -> Self {
        self.samples_tx = Some(tx);
        self
    }

    pub fn fatal_errors(mut self, tx: mpsc::Sender<AgentError>) -> Self {
        self.fatal_tx = Some(tx);
        self
    }

    pub fn state(mut self, state: AgentStateHandle) -> Self {
        self.state = Some(state);
        self
    }

    pub fn health(mut self, health: HealthRegistry) -> Self {
        self.health = Some(health);
        self
    }

    pub fn interval(mut self, interval: Duration) -> Self {
        self.config.interval = interval;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.config.timeout = timeout;
        self
    }

    pub fn build(self) -> Result<CollectionLoop> {
        let collector = self
            .collector
            .ok_or_else(|| anyhow::anyhow!("Collector is required"))?;
        let samples_tx = self
            .samples_tx
            .ok_or_else(|| anyhow::anyhow!("Sample channel is required"))?;
        let fatal_tx = self
            .fatal_tx
            .ok_or_else(|| anyhow::anyhow!("Fatal error channel is required"))?;
        let state = self
            .state
            .ok_or_else(|| anyhow::anyhow!("Agent state handle is required"))?;

        let collection_loop =
            CollectionLoop::new(collector, self.config, samples_tx, fatal_tx, state);
        Ok(match self.health {
            Some(health) => collection_loop.with_health(health),
            None => collection_loop,
        })
    }
}

impl Default for CollectionLoopBuilder {
    fn default() -> Self {
        Self::new()
    }
}
