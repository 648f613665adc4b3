//! Output pipeline worker
//!
//! A single task owns the event buffer and the send queue. It batches incoming
//! events, keeps at most one send in flight, retries transient failures with
//! backoff and drains what it can once the input channel closes.

use super::retry::{BackoffPolicy, RetryQueue};
use super::Sink;
use crate::config::PipelineConfig;
use crate::error::{AgentError, DrainTimeout, ErrorKind, SendError};
use crate::health::{components, HealthRegistry};
use crate::models::{Batch, Event};
use crate::observability::{drop_reasons, BeatMetrics, StructuredLogger};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Tunables for the pipeline worker
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    /// Maximum events per batch
    pub batch_size: usize,
    /// Longest time an event waits in a partial batch
    pub flush_interval: Duration,
    /// Capacity of the event channel feeding the worker
    pub channel_capacity: usize,
    /// Retries after the first failed attempt
    pub max_retries: u32,
    /// Retry window, measured from batch creation
    pub max_retry_time: Duration,
    pub backoff: BackoffPolicy,
    /// Memory bound on queued batches
    pub max_retry_bytes: usize,
    pub drain_timeout: Duration,
}

impl From<&PipelineConfig> for PipelineSettings {
    fn from(config: &PipelineConfig) -> Self {
        Self {
            batch_size: config.batch_size,
            flush_interval: config.flush_interval(),
            channel_capacity: config.channel_capacity,
            max_retries: config.max_retries,
            max_retry_time: config.max_retry_time(),
            backoff: BackoffPolicy::new(config.initial_backoff(), config.max_backoff()),
            max_retry_bytes: config.max_retry_bytes,
            drain_timeout: config.drain_timeout(),
        }
    }
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self::from(&PipelineConfig::default())
    }
}

/// Statistics for pipeline operations
#[derive(Debug, Default, Clone)]
pub struct PipelineStats {
    pub events_received: u64,
    pub events_published: u64,
    pub batches_sent: u64,
    pub send_failures: u64,
    pub dropped_backpressure: u64,
    pub dropped_retries_exhausted: u64,
    pub dropped_drain: u64,
    pub dropped_fatal: u64,
    pub retry_queue_batches: usize,
    pub retry_queue_bytes: usize,
    pub last_error: Option<String>,
}

impl PipelineStats {
    /// Events lost for any reason
    pub fn events_dropped(&self) -> u64 {
        self.dropped_backpressure
            + self.dropped_retries_exhausted
            + self.dropped_drain
            + self.dropped_fatal
    }
}

/// How the worker finished
#[derive(Debug)]
pub enum PipelineOutcome {
    /// Input closed and every queued batch was delivered or accounted for
    Drained,
    /// The drain deadline passed with batches still pending
    DrainTimedOut(DrainTimeout),
    /// The sink reported an unrecoverable error
    Fatal(SendError),
}

type SendFuture = Pin<Box<dyn Future<Output = (Batch, Result<(), SendError>)> + Send>>;

/// Batching and delivery worker
pub struct OutputPipeline {
    settings: PipelineSettings,
    sink: Arc<dyn Sink>,
    receiver: mpsc::Receiver<Event>,
    stats: Arc<RwLock<PipelineStats>>,
    logger: StructuredLogger,
    metrics: BeatMetrics,
    health: Option<HealthRegistry>,
    fatal_tx: Option<mpsc::Sender<AgentError>>,
    buffer: Vec<Event>,
    buffer_started: Option<Instant>,
    next_sequence: u64,
    queue: RetryQueue,
    /// Sequence and event count of the batch currently being sent
    sending: Option<(u64, usize)>,
    draining: bool,
}

impl OutputPipeline {
    /// Create a pipeline and the sender producers use to feed it
    pub fn new(
        settings: PipelineSettings,
        sink: Arc<dyn Sink>,
        logger: StructuredLogger,
    ) -> (Self, mpsc::Sender<Event>) {
        let (sender, receiver) = mpsc::channel(settings.channel_capacity.max(1));
        let queue = RetryQueue::new(settings.max_retry_bytes);
        let pipeline = Self {
            buffer: Vec::with_capacity(settings.batch_size),
            settings,
            sink,
            receiver,
            stats: Arc::new(RwLock::new(PipelineStats::default())),
            logger,
            metrics: BeatMetrics::new(),
            health: None,
            fatal_tx: None,
            buffer_started: None,
            next_sequence: 0,
            queue,
            sending: None,
            draining: false,
        };
        (pipeline, sender)
    }

    /// Report fatal sink errors on this channel
    pub fn with_fatal_errors(mut self, fatal_tx: mpsc::Sender<AgentError>) -> Self {
        self.fatal_tx = Some(fatal_tx);
        self
    }

    /// Publish output and pipeline health to the registry
    pub fn with_health(mut self, health: HealthRegistry) -> Self {
        self.health = Some(health);
        self
    }

    /// Get a clone of the stats handle
    pub fn stats_handle(&self) -> Arc<RwLock<PipelineStats>> {
        Arc::clone(&self.stats)
    }

    /// Run until the input closes and the queue drains, the drain deadline
    /// passes, or the sink fails fatally
    pub async fn run(mut self) -> PipelineOutcome {
        info!(
            sink = %self.sink.name(),
            batch_size = self.settings.batch_size,
            flush_interval_ms = self.settings.flush_interval.as_millis() as u64,
            "Starting output pipeline"
        );

        let mut in_flight: Option<SendFuture> = None;
        let mut drain_deadline: Option<Instant> = None;

        let outcome = loop {
            if in_flight.is_none() {
                if let Some(batch) = self.queue.pop_ready(Instant::now()) {
                    in_flight = Some(self.start_send(batch));
                    self.report_queue().await;
                }
            }

            if self.draining && in_flight.is_none() && self.queue.is_empty() {
                break PipelineOutcome::Drained;
            }

            let flush_at = self
                .buffer_started
                .map(|started| started + self.settings.flush_interval);
            let retry_at = if in_flight.is_none() {
                self.queue.next_ready_at()
            } else {
                None
            };

            tokio::select! {
                biased;

                (batch, result) = wait_send(&mut in_flight), if in_flight.is_some() => {
                    in_flight = None;
                    self.sending = None;
                    if let Some(err) = self.handle_result(batch, result).await {
                        self.abandon_pending(drop_reasons::FATAL).await;
                        break PipelineOutcome::Fatal(err);
                    }
                }

                _ = sleep_until(drain_deadline), if drain_deadline.is_some() => {
                    // Cancels the send; its batch goes down with the future
                    drop(in_flight.take());
                    let mut dropped = 0;
                    if let Some((sequence, events)) = self.sending.take() {
                        dropped += self.count_drop(sequence, events, drop_reasons::DRAIN).await;
                    }
                    dropped += self.abandon_pending(drop_reasons::DRAIN).await;
                    break PipelineOutcome::DrainTimedOut(DrainTimeout { dropped_events: dropped });
                }

                received = self.receiver.recv(), if !self.draining => {
                    match received {
                        Some(event) => self.accept(event).await,
                        None => {
                            let now = Instant::now();
                            self.draining = true;
                            self.cut_batch().await;
                            self.queue.expedite(now);
                            drain_deadline = Some(now + self.settings.drain_timeout);
                            info!(
                                queued_batches = self.queue.len() + usize::from(in_flight.is_some()),
                                drain_timeout_ms = self.settings.drain_timeout.as_millis() as u64,
                                "Input closed, draining output pipeline"
                            );
                        }
                    }
                }

                _ = sleep_until(flush_at), if flush_at.is_some() => {
                    debug!(events = self.buffer.len(), "Flushing partial batch");
                    self.cut_batch().await;
                }

                _ = sleep_until(retry_at), if retry_at.is_some() => {}
            }
        };

        if let Err(e) = self.sink.close().await {
            warn!(sink = %self.sink.name(), error = %e, "Failed to close sink");
        }

        let stats = self.stats.read().await.clone();
        match &outcome {
            PipelineOutcome::Drained => {
                self.logger
                    .log_drain_complete(stats.events_published, stats.events_dropped(), false)
            }
            PipelineOutcome::DrainTimedOut(_) => {
                self.logger
                    .log_drain_complete(stats.events_published, stats.events_dropped(), true)
            }
            PipelineOutcome::Fatal(_) => {}
        }

        outcome
    }

    async fn accept(&mut self, event: Event) {
        if self.buffer.is_empty() {
            self.buffer_started = Some(Instant::now());
        }
        self.buffer.push(event);
        self.stats.write().await.events_received += 1;

        if self.buffer.len() >= self.settings.batch_size {
            self.cut_batch().await;
        }
    }

    /// Turn the buffer into a batch and queue it for sending
    async fn cut_batch(&mut self) {
        if self.buffer.is_empty() {
            return;
        }

        let events = std::mem::replace(
            &mut self.buffer,
            Vec::with_capacity(self.settings.batch_size),
        );
        self.buffer_started = None;
        self.next_sequence += 1;

        let now = Instant::now();
        let batch = Batch::new(self.next_sequence, events, now);
        debug!(
            sequence = batch.sequence(),
            events = batch.len(),
            "Batch created"
        );

        let evicted = self.queue.push(batch, now);
        self.drop_batches(evicted, drop_reasons::BACKPRESSURE).await;
        self.report_queue().await;
    }

    fn start_send(&mut self, mut batch: Batch) -> SendFuture {
        batch.record_attempt();
        self.sending = Some((batch.sequence(), batch.len()));
        let sink = Arc::clone(&self.sink);
        Box::pin(async move {
            let result = sink.send(&batch).await;
            (batch, result)
        })
    }

    /// Apply a send result; returns the error if the sink failed fatally
    async fn handle_result(
        &mut self,
        batch: Batch,
        result: Result<(), SendError>,
    ) -> Option<SendError> {
        match result {
            Ok(()) => {
                let events = batch.len() as u64;
                {
                    let mut stats = self.stats.write().await;
                    stats.events_published += events;
                    stats.batches_sent += 1;
                    stats.last_error = None;
                }
                self.metrics.add_events_published(events);
                self.metrics.inc_batches_sent();
                self.set_output_health(None).await;
                if self.queue.is_empty() {
                    self.set_pipeline_health(None).await;
                }
                debug!(
                    sequence = batch.sequence(),
                    events = events,
                    attempts = batch.attempts(),
                    "Batch published"
                );
                None
            }
            Err(err) => {
                self.record_failure(&err).await;
                match err.kind() {
                    ErrorKind::Transient => {
                        self.retry_later(batch, &err).await;
                        None
                    }
                    ErrorKind::Fatal => {
                        self.drop_batches(vec![batch], drop_reasons::FATAL).await;
                        if let Some(health) = &self.health {
                            health
                                .set_unhealthy(components::OUTPUT, err.to_string())
                                .await;
                        }
                        if let Some(fatal_tx) = &self.fatal_tx {
                            let _ = fatal_tx.send(AgentError::Send(err.clone())).await;
                        }
                        Some(err)
                    }
                }
            }
        }
    }

    async fn retry_later(&mut self, batch: Batch, err: &SendError) {
        let now = Instant::now();
        let attempts = batch.attempts();

        if attempts > self.settings.max_retries {
            warn!(
                sequence = batch.sequence(),
                attempts = attempts,
                error = %err,
                "Retries exhausted"
            );
            self.drop_batches(vec![batch], drop_reasons::RETRIES_EXHAUSTED)
                .await;
            return;
        }

        let delay = if self.draining {
            Duration::ZERO
        } else {
            self.settings.backoff.delay_for(attempts)
        };
        let ready_at = now + delay;
        if ready_at > batch.created_at() + self.settings.max_retry_time {
            warn!(
                sequence = batch.sequence(),
                attempts = attempts,
                error = %err,
                "Retry window exceeded"
            );
            self.drop_batches(vec![batch], drop_reasons::RETRIES_EXHAUSTED)
                .await;
            return;
        }

        warn!(
            sequence = batch.sequence(),
            attempts = attempts,
            retry_in_ms = delay.as_millis() as u64,
            error = %err,
            "Failed to send batch, retrying"
        );
        self.set_output_health(Some(err)).await;

        let evicted = self.queue.push(batch, ready_at);
        self.drop_batches(evicted, drop_reasons::BACKPRESSURE).await;
        self.report_queue().await;
    }

    async fn record_failure(&self, err: &SendError) {
        let mut stats = self.stats.write().await;
        stats.send_failures += 1;
        stats.last_error = Some(err.to_string());
        self.metrics.inc_send_errors(&err.kind().to_string());
    }

    /// Account for batches that will never be sent
    async fn drop_batches(&self, batches: Vec<Batch>, reason: &str) -> u64 {
        let mut total = 0;
        for batch in batches {
            total += self.count_drop(batch.sequence(), batch.len(), reason).await;
        }
        total
    }

    async fn count_drop(&self, sequence: u64, events: usize, reason: &str) -> u64 {
        let events = events as u64;
        self.logger
            .log_batch_dropped(sequence, events as usize, reason);
        self.metrics.add_events_dropped(reason, events);

        {
            let mut stats = self.stats.write().await;
            match reason {
                drop_reasons::BACKPRESSURE => stats.dropped_backpressure += events,
                drop_reasons::RETRIES_EXHAUSTED => stats.dropped_retries_exhausted += events,
                drop_reasons::DRAIN => stats.dropped_drain += events,
                _ => stats.dropped_fatal += events,
            }
        }
        if reason != drop_reasons::FATAL {
            self.set_pipeline_health(Some(format!("dropped {} events ({})", events, reason)))
                .await;
        }
        events
    }

    /// Drop the buffer and everything queued; returns the event count
    async fn abandon_pending(&mut self, reason: &str) -> u64 {
        let mut batches = self.queue.drain_all();
        if !self.buffer.is_empty() {
            self.next_sequence += 1;
            let events = std::mem::take(&mut self.buffer);
            batches.push(Batch::new(self.next_sequence, events, Instant::now()));
            self.buffer_started = None;
        }
        let dropped = self.drop_batches(batches, reason).await;
        self.report_queue().await;
        dropped
    }

    async fn report_queue(&self) {
        let batches = self.queue.len();
        let bytes = self.queue.bytes();
        self.metrics.set_retry_queue(batches, bytes);
        let mut stats = self.stats.write().await;
        stats.retry_queue_batches = batches;
        stats.retry_queue_bytes = bytes;
    }

    async fn set_output_health(&self, err: Option<&SendError>) {
        let Some(health) = &self.health else {
            return;
        };
        match err {
            None => health.set_healthy(components::OUTPUT).await,
            Some(err) => health.set_degraded(components::OUTPUT, err.to_string()).await,
        }
    }

    /// Degraded after losing events, healthy again once a send leaves nothing queued
    async fn set_pipeline_health(&self, dropped: Option<String>) {
        let Some(health) = &self.health else {
            return;
        };
        match dropped {
            None => health.set_healthy(components::PIPELINE).await,
            Some(message) => health.set_degraded(components::PIPELINE, message).await,
        }
    }
}

async fn wait_send(in_flight: &mut Option<SendFuture>) -> (Batch, Result<(), SendError>) {
    match in_flight.as_mut() {
        Some(send) => send.await,
        None => std::future::pending().await,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
