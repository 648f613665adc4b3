//! Agent supervisor
//!
//! Wires collectors, the event builder and the output pipeline together, owns
//! the lifecycle state and turns the way the run ended into an exit code.
//!
//! Shutdown is ordered: collection loops stop first, which closes the sample
//! channel, which stops the builder, which closes the event channel and lets
//! the pipeline drain.

use crate::builder::EventBuilder;
use crate::clock::{Clock, SystemClock};
use crate::collector::{create_collector, Collector, CollectionLoopBuilder};
use crate::config::{BeatConfig, BEAT_NAME};
use crate::error::{AgentError, CollectError, ConfigError, StateError};
use crate::health::{components, HealthRegistry};
use crate::observability::{BeatMetrics, StructuredLogger};
use crate::output::{create_sink, OutputPipeline, PipelineOutcome, PipelineSettings, Sink};
use crate::state::{AgentState, AgentStateHandle, ReadinessEvent};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

const AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Extra time granted to the pipeline task beyond its own drain deadline
const DRAIN_GRACE: Duration = Duration::from_secs(1);

/// How a run ended
#[derive(Debug)]
pub enum RunOutcome {
    /// Shutdown was requested and every pending event was delivered
    Clean,
    /// Shutdown was requested but the drain deadline passed
    DrainTimedOut { dropped_events: u64 },
    /// A component failed in a way that cannot be retried
    Fatal(AgentError),
}

impl RunOutcome {
    /// Process exit code for this outcome
    pub fn exit_code(&self) -> i32 {
        match self {
            RunOutcome::Clean => 0,
            RunOutcome::Fatal(_) => 1,
            RunOutcome::DrainTimedOut { .. } => 2,
        }
    }
}

/// Owns the agent lifecycle
pub struct Supervisor {
    config: BeatConfig,
    clock: Arc<dyn Clock>,
    state: AgentStateHandle,
    health: HealthRegistry,
    logger: StructuredLogger,
    metrics: BeatMetrics,
    sink: Option<Arc<dyn Sink>>,
    collectors: Option<Vec<Box<dyn Collector>>>,
}

impl Supervisor {
    pub fn new(config: BeatConfig) -> Self {
        let logger = StructuredLogger::new(BEAT_NAME, config.name.clone());
        Self {
            config,
            clock: Arc::new(SystemClock),
            state: AgentStateHandle::new(),
            health: HealthRegistry::new(),
            logger,
            metrics: BeatMetrics::new(),
            sink: None,
            collectors: None,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_health(mut self, health: HealthRegistry) -> Self {
        self.health = health;
        self
    }

    /// Use this sink instead of the one named by the output configuration
    pub fn with_sink(mut self, sink: Arc<dyn Sink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Use these collectors instead of the configured ones
    ///
    /// They all run at the default period.
    pub fn with_collectors(mut self, collectors: Vec<Box<dyn Collector>>) -> Self {
        self.collectors = Some(collectors);
        self
    }

    /// Read-only handle on the lifecycle state
    pub fn state(&self) -> AgentStateHandle {
        self.state.clone()
    }

    pub fn health(&self) -> HealthRegistry {
        self.health.clone()
    }

    /// Run until `shutdown` resolves or a fatal error occurs
    pub async fn run<F>(mut self, shutdown: F) -> RunOutcome
    where
        F: Future<Output = ()> + Send,
    {
        self.logger
            .log_startup(AGENT_VERSION, self.config.output.kind());
        self.metrics.set_agent_state(self.state.get());

        let sink = match self.prepare() {
            Ok(sink) => sink,
            Err(err) => return self.abort(err).await,
        };

        let collectors: Vec<(Box<dyn Collector>, Duration)> = match self.collectors.take() {
            Some(collectors) => collectors
                .into_iter()
                .map(|c| (c, self.config.period()))
                .collect(),
            None => self
                .config
                .collectors
                .iter()
                .map(|c| {
                    (
                        create_collector(c, &self.config.proc_path, Arc::clone(&self.clock)),
                        self.config.collector_period(c),
                    )
                })
                .collect(),
        };
        let names: Vec<String> = collectors.iter().map(|(c, _)| c.name().to_string()).collect();

        let pipeline_config = &self.config.pipeline;
        let (samples_tx, samples_rx) = mpsc::channel(pipeline_config.channel_capacity.max(1));
        // One report per collector, from its loop or its watcher, plus the pipeline
        let (fatal_tx, mut fatal_rx) = mpsc::channel::<AgentError>(names.len() + 1);
        let (shutdown_tx, _) = broadcast::channel::<()>(1);

        self.health.register(components::PIPELINE).await;
        self.health.register(components::OUTPUT).await;
        for name in &names {
            self.health.register(&components::collector(name)).await;
        }

        let (pipeline, events_tx) = OutputPipeline::new(
            PipelineSettings::from(pipeline_config),
            sink,
            self.logger.clone(),
        );
        let pipeline = pipeline
            .with_fatal_errors(fatal_tx.clone())
            .with_health(self.health.clone());
        let stats = pipeline.stats_handle();
        let pipeline_handle = tokio::spawn(pipeline.run());

        let builder = EventBuilder::new(
            &self.config.processing,
            self.config.name.clone(),
            Arc::clone(&self.clock),
        );
        let builder_handle = tokio::spawn(builder.run(samples_rx, events_tx));

        let mut loop_handles: Vec<JoinHandle<()>> = Vec::with_capacity(collectors.len());
        for (collector, period) in collectors {
            let name = collector.name().to_string();
            let built = CollectionLoopBuilder::new()
                .collector(collector)
                .samples(samples_tx.clone())
                .fatal_errors(fatal_tx.clone())
                .state(self.state.clone())
                .health(self.health.clone())
                .interval(period)
                .timeout(self.config.poll_timeout())
                .build();
            match built {
                Ok(collection_loop) => {
                    let task = tokio::spawn(collection_loop.run(shutdown_tx.subscribe()));
                    loop_handles.push(tokio::spawn(watch_loop(name, task, fatal_tx.clone())));
                }
                Err(e) => {
                    // Nothing has polled yet; unwind what was started
                    let _ = shutdown_tx.send(());
                    drop(samples_tx);
                    drop(fatal_tx);
                    let _ = self.state.transition(AgentState::Draining);
                    join_all(loop_handles).await;
                    let _ = builder_handle.await;
                    let _ = pipeline_handle.await;
                    return self
                        .finish(RunOutcome::Fatal(AgentError::Config(ConfigError(e.to_string()))))
                        .await;
                }
            }
        }
        // Loops hold the only sample senders from here on
        drop(samples_tx);
        drop(fatal_tx);

        // Readiness is published before any collector can take its first sample
        self.state.mark_ready(ReadinessEvent {
            beat: BEAT_NAME.to_string(),
            version: AGENT_VERSION.to_string(),
            collectors: names.clone(),
        });
        if let Err(err) = self.transition(AgentState::Running) {
            let _ = shutdown_tx.send(());
            return self.finish(RunOutcome::Fatal(err.into())).await;
        }
        self.health.set_ready(true).await;
        self.logger.log_ready(&names);

        tokio::pin!(shutdown);
        let fatal = tokio::select! {
            _ = &mut shutdown => {
                self.logger.log_shutdown("shutdown signal received");
                None
            }
            Some(err) = fatal_rx.recv() => {
                self.logger.log_fatal(&err.to_string());
                Some(err)
            }
        };

        self.health.set_ready(false).await;
        if let Err(err) = self.transition(AgentState::Draining) {
            warn!(error = %err, "Unexpected state while starting drain");
        }
        if let Some(err) = &fatal {
            self.mark_unhealthy(err).await;
        }
        let _ = shutdown_tx.send(());

        join_all(loop_handles).await;
        match builder_handle.await {
            Ok(stats) => debug!(built = stats.built, invalid = stats.invalid, "Event builder stopped"),
            Err(e) => error!(error = %e, "Event builder task failed"),
        }

        let drain_limit = self.config.pipeline.drain_timeout() + DRAIN_GRACE;
        let pipeline_outcome = match tokio::time::timeout(drain_limit, pipeline_handle).await {
            Ok(Ok(outcome)) => Some(outcome),
            Ok(Err(e)) => {
                error!(error = %e, "Output pipeline task failed");
                None
            }
            Err(_) => {
                warn!("Output pipeline did not finish draining in time");
                None
            }
        };

        let outcome = match (fatal, pipeline_outcome) {
            (Some(err), _) => RunOutcome::Fatal(err),
            (None, Some(PipelineOutcome::Drained)) => RunOutcome::Clean,
            (None, Some(PipelineOutcome::DrainTimedOut(timeout))) => RunOutcome::DrainTimedOut {
                dropped_events: timeout.dropped_events,
            },
            (None, Some(PipelineOutcome::Fatal(err))) => {
                self.logger.log_fatal(&err.to_string());
                RunOutcome::Fatal(err.into())
            }
            (None, None) => {
                let stats = stats.read().await;
                let pending = stats
                    .events_received
                    .saturating_sub(stats.events_published + stats.events_dropped());
                RunOutcome::DrainTimedOut {
                    dropped_events: pending,
                }
            }
        };

        self.finish(outcome).await
    }

    /// Validate settings and build the sink before anything is spawned
    fn prepare(&mut self) -> Result<Arc<dyn Sink>, AgentError> {
        self.config.validate()?;
        match self.sink.take() {
            Some(sink) => Ok(sink),
            None => Ok(create_sink(&self.config.output)?),
        }
    }

    /// Stop after a failure during initialization
    async fn abort(&self, err: AgentError) -> RunOutcome {
        self.logger.log_fatal(&err.to_string());
        if let Err(state_err) = self.transition(AgentState::Draining) {
            warn!(error = %state_err, "Unexpected state while aborting");
        }
        self.finish(RunOutcome::Fatal(err)).await
    }

    async fn finish(&self, outcome: RunOutcome) -> RunOutcome {
        if let Err(err) = self.transition(AgentState::Stopped) {
            warn!(error = %err, "Unexpected state while stopping");
        }
        self.logger.log_stopped(outcome.exit_code());
        outcome
    }

    fn transition(&self, next: AgentState) -> Result<AgentState, StateError> {
        let previous = self.state.transition(next)?;
        self.metrics.set_agent_state(next);
        debug!(from = %previous, to = %next, "Agent state changed");
        Ok(previous)
    }

    async fn mark_unhealthy(&self, err: &AgentError) {
        let component = match err {
            AgentError::Collect(e) => components::collector(&e.source_name),
            AgentError::Send(_) => components::OUTPUT.to_string(),
            _ => components::PIPELINE.to_string(),
        };
        self.health.set_unhealthy(&component, err.to_string()).await;
    }
}

/// Turn a collection loop that died by panicking into a fatal collect error
async fn watch_loop(name: String, task: JoinHandle<()>, fatal_tx: mpsc::Sender<AgentError>) {
    if let Err(e) = task.await {
        error!(collector = %name, error = %e, "Collection loop task failed");
        let err = CollectError::fatal(name, format!("collection loop stopped: {}", e));
        let _ = fatal_tx.send(err.into()).await;
    }
}

async fn join_all(handles: Vec<JoinHandle<()>>) {
    for handle in handles {
        if let Err(e) = handle.await {
            error!(error = %e, "Collection loop task failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::async_trait;
    use crate::config::OutputConfig;
    use crate::error::{CollectError, SendError};
    use crate::models::{Batch, Sample, SampleValue};
    use chrono::Utc;
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
    use tokio::sync::oneshot;

    struct CountingCollector {
        name: &'static str,
        polls: u64,
        fail_at: Option<u64>,
    }

    impl CountingCollector {
        fn boxed(name: &'static str) -> Box<dyn Collector> {
            Box::new(Self {
                name,
                polls: 0,
                fail_at: None,
            })
        }
    }

    #[async_trait]
    impl Collector for CountingCollector {
        fn name(&self) -> &str {
            self.name
        }

        async fn poll(&mut self) -> Result<Sample, CollectError> {
            self.polls += 1;
            if self.fail_at == Some(self.polls) {
                return Err(CollectError::fatal(self.name, "source disappeared"));
            }
            Ok(Sample::new(
                self.name,
                SampleValue::Number(self.polls as f64),
                Utc::now(),
            ))
        }
    }

    /// Collector whose poll panics on the given call
    struct PanickingCollector {
        polls: u64,
        panic_at: u64,
    }

    #[async_trait]
    impl Collector for PanickingCollector {
        fn name(&self) -> &str {
            "load"
        }

        async fn poll(&mut self) -> Result<Sample, CollectError> {
            self.polls += 1;
            if self.polls == self.panic_at {
                panic!("corrupt reading");
            }
            Ok(Sample::new("load", SampleValue::Number(1.0), Utc::now()))
        }
    }

    #[derive(Clone, Copy, PartialEq)]
    enum Mode {
        Accept,
        /// Fails the first send transiently, then accepts
        FlakyOnce,
        Fatal,
        Hang,
    }

    struct TestSink {
        mode: Mode,
        state: AgentStateHandle,
        events: AtomicU64,
        attempts: AtomicU64,
        sent_before_ready: AtomicBool,
    }

    impl TestSink {
        fn new(mode: Mode, state: AgentStateHandle) -> Arc<Self> {
            Arc::new(Self {
                mode,
                state,
                events: AtomicU64::new(0),
                attempts: AtomicU64::new(0),
                sent_before_ready: AtomicBool::new(false),
            })
        }
    }

    #[async_trait]
    impl Sink for TestSink {
        fn name(&self) -> &str {
            "test"
        }

        async fn send(&self, batch: &Batch) -> Result<(), SendError> {
            if self.state.readiness().is_none() {
                self.sent_before_ready.store(true, Ordering::SeqCst);
            }
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
            match self.mode {
                Mode::FlakyOnce if attempt == 0 => {
                    Err(SendError::Transient("connection reset".to_string()))
                }
                Mode::Accept | Mode::FlakyOnce => {
                    self.events.fetch_add(batch.len() as u64, Ordering::SeqCst);
                    Ok(())
                }
                Mode::Fatal => Err(SendError::Fatal("401 unauthorized".to_string())),
                Mode::Hang => std::future::pending().await,
            }
        }
    }

    fn test_config() -> BeatConfig {
        let mut config = BeatConfig::default();
        config.name = "test-host".to_string();
        config.output = OutputConfig::Console;
        config.pipeline.batch_size = 2;
        config
    }

    fn supervisor_with(
        config: BeatConfig,
        mode: Mode,
        collectors: Vec<Box<dyn Collector>>,
    ) -> (Supervisor, Arc<TestSink>) {
        let supervisor = Supervisor::new(config);
        let sink = TestSink::new(mode, supervisor.state());
        let supervisor = supervisor
            .with_sink(sink.clone())
            .with_collectors(collectors);
        (supervisor, sink)
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(RunOutcome::Clean.exit_code(), 0);
        assert_eq!(
            RunOutcome::Fatal(AgentError::Send(SendError::Fatal("x".into()))).exit_code(),
            1
        );
        assert_eq!(RunOutcome::DrainTimedOut { dropped_events: 3 }.exit_code(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_clean_shutdown_delivers_everything() {
        let (supervisor, sink) = supervisor_with(
            test_config(),
            Mode::Accept,
            vec![CountingCollector::boxed("cpu"), CountingCollector::boxed("load")],
        );
        let state = supervisor.state();
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let handle = tokio::spawn(supervisor.run(async move {
            let _ = shutdown_rx.await;
        }));

        let ready = state.wait_ready().await;
        assert_eq!(ready.beat, "hwbeat");
        assert_eq!(ready.collectors, vec!["cpu".to_string(), "load".to_string()]);
        assert_eq!(state.get(), AgentState::Running);

        tokio::time::sleep(Duration::from_millis(3500)).await;
        shutdown_tx.send(()).unwrap();

        let outcome = handle.await.unwrap();
        assert!(matches!(outcome, RunOutcome::Clean));
        assert_eq!(outcome.exit_code(), 0);
        assert_eq!(state.get(), AgentState::Stopped);

        // Two collectors polled at 0s, 1s, 2s and 3s
        assert_eq!(sink.events.load(Ordering::SeqCst), 8);
        assert!(!sink.sent_before_ready.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_sink_stops_without_signal() {
        let (supervisor, _sink) = supervisor_with(
            test_config(),
            Mode::Fatal,
            vec![CountingCollector::boxed("cpu")],
        );
        let state = supervisor.state();
        let health = supervisor.health();

        let outcome = tokio::time::timeout(
            Duration::from_secs(60),
            supervisor.run(std::future::pending()),
        )
        .await
        .expect("supervisor must stop on a fatal sink error");

        assert!(matches!(outcome, RunOutcome::Fatal(AgentError::Send(_))));
        assert_ne!(outcome.exit_code(), 0);
        assert_eq!(state.get(), AgentState::Stopped);
        assert!(health
            .unhealthy_components()
            .await
            .contains(&components::OUTPUT.to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_collector_stops_agent() {
        let collector: Box<dyn Collector> = Box::new(CountingCollector {
            name: "memory",
            polls: 0,
            fail_at: Some(2),
        });
        let (supervisor, _sink) = supervisor_with(test_config(), Mode::Accept, vec![collector]);
        let health = supervisor.health();

        let outcome = tokio::time::timeout(
            Duration::from_secs(60),
            supervisor.run(std::future::pending()),
        )
        .await
        .expect("supervisor must stop on a fatal collector error");

        match outcome {
            RunOutcome::Fatal(AgentError::Collect(err)) => assert_eq!(err.source_name, "memory"),
            other => panic!("unexpected outcome {:?}", other),
        }
        assert_eq!(
            health.unhealthy_components().await,
            vec!["collector.memory".to_string()]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_collector_is_fatal() {
        let collector: Box<dyn Collector> = Box::new(PanickingCollector {
            polls: 0,
            panic_at: 2,
        });
        let (supervisor, _sink) = supervisor_with(test_config(), Mode::Accept, vec![collector]);
        let health = supervisor.health();

        let outcome = tokio::time::timeout(
            Duration::from_secs(60),
            supervisor.run(std::future::pending()),
        )
        .await
        .expect("supervisor must stop when a collection loop dies");

        match &outcome {
            RunOutcome::Fatal(AgentError::Collect(err)) => {
                assert_eq!(err.source_name, "load");
                assert!(err.is_fatal());
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        assert_eq!(outcome.exit_code(), 1);
        assert_eq!(
            health.unhealthy_components().await,
            vec!["collector.load".to_string()]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_run_with_manual_wall_clock() {
        use crate::clock::ManualClock;
        use chrono::TimeZone;

        let mut config = test_config();
        config.pipeline.initial_backoff_ms = 500;
        config.pipeline.flush_interval_ms = 10_000;
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap());
        let (supervisor, sink) =
            supervisor_with(config, Mode::FlakyOnce, vec![CountingCollector::boxed("cpu")]);
        let supervisor = supervisor.with_clock(Arc::new(clock));
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let handle = tokio::spawn(supervisor.run(async move {
            let _ = shutdown_rx.await;
        }));

        // Polls at 0s..3s make two batches; the first fails once and is
        // retried 500ms later without waiting for shutdown
        tokio::time::sleep(Duration::from_millis(3500)).await;
        assert_eq!(sink.attempts.load(Ordering::SeqCst), 3);
        assert_eq!(sink.events.load(Ordering::SeqCst), 4);

        shutdown_tx.send(()).unwrap();
        assert!(matches!(handle.await.unwrap(), RunOutcome::Clean));
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_timeout_exits_non_zero() {
        let mut config = test_config();
        config.pipeline.drain_timeout_ms = 1000;
        let (supervisor, _sink) =
            supervisor_with(config, Mode::Hang, vec![CountingCollector::boxed("cpu")]);
        let state = supervisor.state();

        let handle = tokio::spawn(supervisor.run(tokio::time::sleep(Duration::from_secs(3))));

        match handle.await.unwrap() {
            RunOutcome::DrainTimedOut { dropped_events } => assert!(dropped_events > 0),
            other => panic!("unexpected outcome {:?}", other),
        }
        assert_eq!(state.get(), AgentState::Stopped);
    }

    #[tokio::test]
    async fn test_invalid_config_fails_before_running() {
        let mut config = test_config();
        config.pipeline.batch_size = 0;
        let (supervisor, _sink) =
            supervisor_with(config, Mode::Accept, vec![CountingCollector::boxed("cpu")]);
        let state = supervisor.state();

        let outcome = supervisor.run(std::future::pending()).await;

        assert!(matches!(outcome, RunOutcome::Fatal(AgentError::Config(_))));
        assert_eq!(outcome.exit_code(), 1);
        assert_eq!(state.get(), AgentState::Stopped);
        assert!(state.readiness().is_none());
    }

    #[tokio::test]
    async fn test_invalid_output_url_is_fatal() {
        let mut config = test_config();
        config.output = OutputConfig::Http {
            url: "not a url".to_string(),
            timeout_ms: 1000,
        };
        let supervisor = Supervisor::new(config);

        let outcome = supervisor.run(std::future::pending()).await;
        assert!(matches!(
            outcome,
            RunOutcome::Fatal(AgentError::Send(SendError::Fatal(_)))
        ));
    }
}
