//! Tests for the collectors and the collection loop
//!
//! procfs collectors run against a fixture tree in a temp dir; the loop runs
//! with scripted collectors on a paused clock.

#[cfg(test)]
mod procfs_fixture_tests {
    use crate::clock::{Clock, ManualClock};
    use crate::collector::{create_collector, Collector, CpuCollector, FieldFilter, LoadCollector};
    use crate::builder::EventBuilder;
    use crate::config::{CollectorConfig, CollectorKind, ProcessingConfig};
    use crate::models::{FieldValue, SampleValue};
    use chrono::{TimeZone, Utc};
    use std::path::Path;
    use std::sync::Arc;
    use tempfile::TempDir;
    use tokio::fs;

    async fn create_mock_proc(temp_dir: &TempDir) {
        let root = temp_dir.path();
        fs::write(root.join("stat"), "cpu  100 0 100 800 0 0 0 0 0 0\n")
            .await
            .unwrap();
        fs::write(
            root.join("meminfo"),
            "MemTotal:       1000 kB\nMemFree:         200 kB\nMemAvailable:    400 kB\nBuffers:          50 kB\nCached:          100 kB\n",
        )
        .await
        .unwrap();
        fs::write(root.join("loadavg"), "1.25 0.75 0.50 3/120 999\n")
            .await
            .unwrap();
    }

    fn clock() -> Arc<dyn Clock> {
        Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap(),
        ))
    }

    fn fields(value: &SampleValue) -> &std::collections::BTreeMap<String, SampleValue> {
        match value {
            SampleValue::Structured(map) => map,
            other => panic!("expected structured sample, got {:?}", other),
        }
    }

    fn collector_config(kind: CollectorKind, fields: &[&str]) -> CollectorConfig {
        CollectorConfig {
            kind,
            fields: fields.iter().map(|f| f.to_string()).collect(),
            period_ms: None,
            per_instance: false,
        }
    }

    #[tokio::test]
    async fn test_memory_collector_reads_meminfo() {
        let temp_dir = TempDir::new().unwrap();
        create_mock_proc(&temp_dir).await;

        let mut collector = create_collector(
            &collector_config(CollectorKind::Memory, &[]),
            temp_dir.path(),
            clock(),
        );
        let sample = collector.poll().await.unwrap();

        assert_eq!(sample.source(), "memory");
        assert_eq!(
            sample.captured_at(),
            Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
        );
        let values = fields(sample.value());
        assert_eq!(values["total_bytes"], SampleValue::Number(1000.0 * 1024.0));
        assert_eq!(values["available_bytes"], SampleValue::Number(400.0 * 1024.0));
        assert_eq!(values["used_percent"], SampleValue::Number(60.0));
    }

    #[tokio::test]
    async fn test_cpu_usage_from_consecutive_polls() {
        let temp_dir = TempDir::new().unwrap();
        create_mock_proc(&temp_dir).await;

        let mut collector =
            CpuCollector::new(temp_dir.path(), FieldFilter::default(), clock(), false);

        let first = collector.poll().await.unwrap();
        assert_eq!(fields(first.value())["usage_percent"], SampleValue::Number(0.0));

        // 100 busy jiffies and 100 idle jiffies later
        fs::write(
            temp_dir.path().join("stat"),
            "cpu  150 0 150 900 0 0 0 0 0 0\n",
        )
        .await
        .unwrap();

        let second = collector.poll().await.unwrap();
        assert_eq!(
            fields(second.value())["usage_percent"],
            SampleValue::Number(50.0)
        );
    }

    #[tokio::test]
    async fn test_field_filter_keeps_configured_fields() {
        let temp_dir = TempDir::new().unwrap();
        create_mock_proc(&temp_dir).await;

        let mut collector = create_collector(
            &collector_config(CollectorKind::Load, &["load1", "not_a_field"]),
            temp_dir.path(),
            clock(),
        );
        let sample = collector.poll().await.unwrap();

        let values = fields(sample.value());
        assert_eq!(values.len(), 1);
        assert_eq!(values["load1"], SampleValue::Number(1.25));
    }

    #[tokio::test]
    async fn test_missing_source_is_fatal() {
        let temp_dir = TempDir::new().unwrap();

        let mut collector =
            LoadCollector::new(temp_dir.path(), FieldFilter::default(), clock());
        let err = collector.poll().await.unwrap_err();

        assert!(err.is_fatal());
        assert_eq!(err.source_name, "load");
    }

    #[tokio::test]
    async fn test_malformed_source_is_transient() {
        let temp_dir = TempDir::new().unwrap();
        fs::write(temp_dir.path().join("loadavg"), "garbage\n")
            .await
            .unwrap();

        let mut collector =
            LoadCollector::new(temp_dir.path(), FieldFilter::default(), clock());
        let err = collector.poll().await.unwrap_err();

        assert!(!err.is_fatal());
    }

    #[tokio::test]
    async fn test_per_instance_cpu_keys_cores_by_title() {
        let temp_dir = TempDir::new().unwrap();
        create_mock_proc(&temp_dir).await;
        fs::write(
            temp_dir.path().join("stat"),
            "cpu  100 0 100 800 0 0 0 0 0 0\ncpu0 60 0 40 400 0 0 0 0 0 0\n\
             cpu1 40 0 60 400 0 0 0 0 0 0\nintr 12345\n",
        )
        .await
        .unwrap();

        let mut config = collector_config(CollectorKind::Cpu, &["user", "usage_percent"]);
        config.per_instance = true;
        let mut collector = create_collector(&config, temp_dir.path(), clock());
        collector.poll().await.unwrap();

        // cpu0 goes fully busy, cpu1 stays idle
        fs::write(
            temp_dir.path().join("stat"),
            "cpu  200 0 100 900 0 0 0 0 0 0\ncpu0 160 0 40 400 0 0 0 0 0 0\n\
             cpu1 40 0 60 500 0 0 0 0 0 0\n",
        )
        .await
        .unwrap();
        let sample = collector.poll().await.unwrap();

        let values = fields(sample.value());
        assert_eq!(values["user"], SampleValue::Number(200.0));
        let cpu0 = fields(&values["cpu0"]);
        assert_eq!(cpu0.len(), 2);
        assert_eq!(cpu0["usage_percent"], SampleValue::Number(100.0));
        assert_eq!(fields(&values["cpu1"])["usage_percent"], SampleValue::Number(0.0));

        let builder = EventBuilder::new(&ProcessingConfig::default(), "test-host", clock());
        let event = builder.build(sample).unwrap();
        assert_eq!(event.fields["cpu.cpu0.user"], FieldValue::Number(160.0));
        assert_eq!(event.fields["cpu.cpu1.user"], FieldValue::Number(40.0));
        assert_eq!(event.fields["cpu.usage_percent"], FieldValue::Number(50.0));
    }

    #[tokio::test]
    async fn test_cpu_cores_hidden_without_per_instance() {
        let temp_dir = TempDir::new().unwrap();
        fs::write(
            temp_dir.path().join("stat"),
            "cpu  100 0 100 800 0 0 0 0 0 0\ncpu0 100 0 100 800 0 0 0 0 0 0\n",
        )
        .await
        .unwrap();

        let mut collector = create_collector(
            &collector_config(CollectorKind::Cpu, &[]),
            temp_dir.path(),
            clock(),
        );
        let sample = collector.poll().await.unwrap();

        assert!(!fields(sample.value()).contains_key("cpu0"));
    }

    #[tokio::test]
    async fn test_out_of_range_meminfo_is_transient() {
        let temp_dir = TempDir::new().unwrap();
        fs::write(
            temp_dir.path().join("meminfo"),
            "MemTotal:       18446744073709551615 kB\nMemFree:         200 kB\n",
        )
        .await
        .unwrap();

        let mut collector = create_collector(
            &collector_config(CollectorKind::Memory, &[]),
            temp_dir.path(),
            clock(),
        );
        let err = collector.poll().await.unwrap_err();

        assert!(!err.is_fatal());
        assert_eq!(err.source_name, "memory");
    }

    #[tokio::test]
    async fn test_missing_mem_available_out_of_range_is_transient() {
        let temp_dir = TempDir::new().unwrap();
        fs::write(
            temp_dir.path().join("meminfo"),
            "MemTotal: 1000 kB\nMemFree: 18446744073709551615\nCached: 1\n",
        )
        .await
        .unwrap();

        let mut collector = create_collector(
            &collector_config(CollectorKind::Memory, &[]),
            temp_dir.path(),
            clock(),
        );
        assert!(!collector.poll().await.unwrap_err().is_fatal());
    }

    #[tokio::test]
    async fn test_overflowing_cpu_counters_are_transient() {
        let temp_dir = TempDir::new().unwrap();
        fs::write(
            temp_dir.path().join("stat"),
            "cpu 18446744073709551615 1 1 1\n",
        )
        .await
        .unwrap();

        let mut collector = create_collector(
            &collector_config(CollectorKind::Cpu, &[]),
            temp_dir.path(),
            clock(),
        );
        let err = collector.poll().await.unwrap_err();
        assert!(!err.is_fatal());
        assert_eq!(err.source_name, "cpu");
    }

    #[tokio::test]
    async fn test_default_proc_path_layout() {
        // Only checks construction; reading the real /proc is not portable
        let _ = create_collector(
            &collector_config(CollectorKind::Cpu, &[]),
            Path::new("/proc"),
            clock(),
        );
    }
}

#[cfg(test)]
mod collection_loop_tests {
    use crate::collector::{async_trait, Collector, CollectionLoopBuilder};
    use crate::error::{AgentError, CollectError};
    use crate::health::{components, ComponentStatus, HealthRegistry};
    use crate::models::{Sample, SampleValue};
    use crate::state::{AgentState, AgentStateHandle};
    use chrono::Utc;
    use std::collections::VecDeque;
    use std::time::Duration;
    use tokio::sync::{broadcast, mpsc};

    /// Collector that replays a script, then keeps returning samples
    struct ScriptedCollector {
        script: VecDeque<Result<f64, CollectError>>,
        counter: f64,
        delay: Option<Duration>,
    }

    impl ScriptedCollector {
        fn new(script: Vec<Result<f64, CollectError>>) -> Self {
            Self {
                script: script.into(),
                counter: 0.0,
                delay: None,
            }
        }

        fn slow(delay: Duration) -> Self {
            Self {
                script: VecDeque::new(),
                counter: 0.0,
                delay: Some(delay),
            }
        }
    }

    #[async_trait]
    impl Collector for ScriptedCollector {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn poll(&mut self) -> Result<Sample, CollectError> {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            let value = match self.script.pop_front() {
                Some(result) => result?,
                None => {
                    self.counter += 1.0;
                    1000.0 + self.counter
                }
            };
            Ok(Sample::new("scripted", SampleValue::Number(value), Utc::now()))
        }
    }

    struct Harness {
        state: AgentStateHandle,
        health: HealthRegistry,
        samples_rx: mpsc::Receiver<Sample>,
        fatal_rx: mpsc::Receiver<AgentError>,
        shutdown_tx: broadcast::Sender<()>,
        handle: tokio::task::JoinHandle<()>,
    }

    fn start(collector: ScriptedCollector, timeout: Duration) -> Harness {
        let state = AgentStateHandle::new();
        let health = HealthRegistry::new();
        let (samples_tx, samples_rx) = mpsc::channel(16);
        let (fatal_tx, fatal_rx) = mpsc::channel(4);
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

        let collection_loop = CollectionLoopBuilder::new()
            .collector(Box::new(collector))
            .samples(samples_tx)
            .fatal_errors(fatal_tx)
            .state(state.clone())
            .health(health.clone())
            .interval(Duration::from_secs(1))
            .timeout(timeout)
            .build()
            .unwrap();
        let handle = tokio::spawn(collection_loop.run(shutdown_rx));

        Harness {
            state,
            health,
            samples_rx,
            fatal_rx,
            shutdown_tx,
            handle,
        }
    }

    fn number(sample: &Sample) -> f64 {
        match sample.value() {
            SampleValue::Number(n) => *n,
            other => panic!("unexpected value {:?}", other),
        }
    }

    #[test]
    fn test_builder_requires_collector() {
        let (fatal_tx, _) = mpsc::channel(1);
        let (samples_tx, _) = mpsc::channel(1);
        let result = CollectionLoopBuilder::new()
            .samples(samples_tx)
            .fatal_errors(fatal_tx)
            .state(AgentStateHandle::new())
            .build();
        assert!(result.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_poll_before_running() {
        let mut h = start(ScriptedCollector::new(vec![Ok(1.0)]), Duration::from_secs(5));

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(h.samples_rx.try_recv().is_err());

        h.state.transition(AgentState::Running).unwrap();
        let sample = h.samples_rx.recv().await.unwrap();
        assert_eq!(number(&sample), 1.0);

        h.shutdown_tx.send(()).unwrap();
        h.handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_errors_are_skipped_in_order() {
        let mut h = start(
            ScriptedCollector::new(vec![
                Ok(1.0),
                Err(CollectError::transient("scripted", "busy")),
                Ok(2.0),
                Ok(3.0),
            ]),
            Duration::from_secs(5),
        );
        h.state.transition(AgentState::Running).unwrap();

        let mut seen = Vec::new();
        for _ in 0..3 {
            seen.push(number(&h.samples_rx.recv().await.unwrap()));
        }
        assert_eq!(seen, vec![1.0, 2.0, 3.0]);
        assert!(h.fatal_rx.try_recv().is_err());

        h.shutdown_tx.send(()).unwrap();
        h.handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_error_stops_loop_and_reports() {
        let mut h = start(
            ScriptedCollector::new(vec![
                Ok(1.0),
                Err(CollectError::fatal("scripted", "device gone")),
            ]),
            Duration::from_secs(5),
        );
        h.state.transition(AgentState::Running).unwrap();

        assert_eq!(number(&h.samples_rx.recv().await.unwrap()), 1.0);
        let err = h.fatal_rx.recv().await.unwrap();
        assert!(matches!(err, AgentError::Collect(e) if e.is_fatal()));

        // The loop exits on its own after a fatal error
        h.handle.await.unwrap();
        assert!(h.samples_rx.recv().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_outcomes_update_collector_health() {
        let mut h = start(
            ScriptedCollector::new(vec![
                Ok(1.0),
                Err(CollectError::transient("scripted", "busy")),
                Ok(2.0),
                Err(CollectError::fatal("scripted", "device gone")),
            ]),
            Duration::from_secs(5),
        );
        let component = components::collector("scripted");
        h.health.register(&component).await;
        h.state.transition(AgentState::Running).unwrap();

        assert_eq!(number(&h.samples_rx.recv().await.unwrap()), 1.0);
        tokio::time::sleep(Duration::from_millis(1500)).await;
        let reported = h.health.health().await.components[&component].clone();
        assert_eq!(reported.status, ComponentStatus::Degraded);
        assert!(reported.message.unwrap_or_default().contains("busy"));

        assert_eq!(number(&h.samples_rx.recv().await.unwrap()), 2.0);
        assert_eq!(
            h.health.health().await.components[&component].status,
            ComponentStatus::Healthy
        );

        assert!(h.fatal_rx.recv().await.is_some());
        h.handle.await.unwrap();
        assert_eq!(h.health.unhealthy_components().await, vec![component]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_poll_times_out_as_transient() {
        let mut h = start(
            ScriptedCollector::slow(Duration::from_secs(30)),
            Duration::from_secs(2),
        );
        h.state.transition(AgentState::Running).unwrap();

        tokio::time::sleep(Duration::from_secs(20)).await;
        assert!(h.samples_rx.try_recv().is_err());
        assert!(h.fatal_rx.try_recv().is_err());

        h.shutdown_tx.send(()).unwrap();
        h.handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_before_running_exits() {
        let h = start(ScriptedCollector::new(vec![]), Duration::from_secs(5));
        h.shutdown_tx.send(()).unwrap();
        h.handle.await.unwrap();
    }
}
