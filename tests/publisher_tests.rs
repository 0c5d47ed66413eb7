use busgps::broker::{BrokerClient, BrokerError};
use busgps::codec::RecordEncoder;
use busgps::config::BrokerConfig;
use busgps::publisher::*;
use busgps::schema::RecordSchema;
use busgps::source::{SourceError, TelemetrySource};
use busgps::telemetry::*;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;

/// Replays a fixed list of samples, then either closes or goes quiet.
struct ScriptedSource {
    samples: VecDeque<Result<RawSample, SourceError>>,
    close_when_done: bool,
}

impl ScriptedSource {
    fn closing(samples: Vec<RawSample>) -> Self {
        Self {
            samples: samples.into_iter().map(Ok).collect(),
            close_when_done: true,
        }
    }

    fn idling(samples: Vec<RawSample>) -> Self {
        Self {
            close_when_done: false,
            ..Self::closing(samples)
        }
    }
}

impl TelemetrySource for ScriptedSource {
    async fn next_sample(&mut self) -> Result<Option<RawSample>, SourceError> {
        match self.samples.pop_front() {
            Some(Ok(sample)) => Ok(Some(sample)),
            Some(Err(e)) => Err(e),
            None if self.close_when_done => Ok(None),
            None => std::future::pending().await,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum FlushBehavior {
    Succeed,
    Hang,
}

#[derive(Debug, Default)]
struct BrokerLog {
    sent: Vec<(String, Vec<u8>)>,
    flushes: usize,
    // Messages already submitted when each flush started
    sent_at_flush: Vec<usize>,
}

struct MockBroker {
    log: Arc<Mutex<BrokerLog>>,
    send_results: VecDeque<Result<(), BrokerError>>,
    flush: FlushBehavior,
}

impl MockBroker {
    fn new() -> (Self, Arc<Mutex<BrokerLog>>) {
        let log = Arc::new(Mutex::new(BrokerLog::default()));
        let broker = Self {
            log: Arc::clone(&log),
            send_results: VecDeque::new(),
            flush: FlushBehavior::Succeed,
        };
        (broker, log)
    }
}

impl BrokerClient for MockBroker {
    fn send(&mut self, topic: &str, payload: &[u8]) -> Result<(), BrokerError> {
        self.send_results.pop_front().unwrap_or(Ok(()))?;
        self.log.lock().unwrap().sent.push((topic.to_string(), payload.to_vec()));
        Ok(())
    }

    async fn flush(&mut self) -> Result<(), BrokerError> {
        {
            let mut log = self.log.lock().unwrap();
            log.flushes += 1;
            let submitted = log.sent.len();
            log.sent_at_flush.push(submitted);
        }
        if self.flush == FlushBehavior::Hang {
            std::future::pending::<()>().await;
        }
        Ok(())
    }
}

fn encoder() -> RecordEncoder {
    RecordEncoder::new(RecordSchema::builtin().unwrap())
}

fn config() -> BrokerConfig {
    BrokerConfig {
        topic: "gps".to_string(),
        flush_timeout_secs: Some(5),
        ..BrokerConfig::default()
    }
}

fn fix(second: u32, lat: f64) -> RawSample {
    RawSample::new()
        .with("class", "TPV")
        .with("time", format!("2024-01-01T00:00:{:02}.000000Z", second).as_str())
        .with("lat", lat)
        .with("lon", -86.9)
        .with("alt", UNAVAILABLE_MARKER)
}

fn decode_all(log: &BrokerLog) -> Vec<PositionRecord> {
    let encoder = encoder();
    log.sent.iter().map(|(_, bytes)| encoder.decode(bytes).unwrap()).collect()
}

#[tokio::test]
async fn test_five_samples_arrive_in_order() {
    let samples: Vec<RawSample> = (0..5).map(|i| fix(i, 40.0 + f64::from(i))).collect();
    let (broker, log) = MockBroker::new();

    let publisher = Publisher::new(config(), encoder(), ScriptedSource::closing(samples), broker);
    let stats = publisher.run(std::future::pending::<()>()).await.unwrap();

    assert_eq!(stats.samples_received, 5);
    assert_eq!(stats.records_published, 5);
    assert_eq!(stats.samples_dropped, 0);

    let log = log.lock().unwrap();
    assert!(log.sent.iter().all(|(topic, _)| topic == "gps"));
    let records = decode_all(&log);
    assert_eq!(records.len(), 5);
    for (i, record) in records.iter().enumerate() {
        assert_eq!(record.lat, Some(40.0 + i as f64));
        assert_eq!(record.time, Some(1_704_067_200.0 + i as f64));
        assert_eq!(record.alt, None);
    }
    assert_eq!(log.flushes, 1);
}

#[tokio::test]
async fn test_malformed_sample_is_dropped_and_loop_continues() {
    let samples = vec![
        fix(0, 40.0),
        fix(1, 41.0).with("time", "not a timestamp"),
        fix(2, 42.0),
        fix(3, 43.0).with("speed", "fast"),
        fix(4, 44.0),
    ];
    let (broker, log) = MockBroker::new();

    let publisher = Publisher::new(config(), encoder(), ScriptedSource::closing(samples), broker);
    let stats = publisher.run(std::future::pending::<()>()).await.unwrap();

    assert_eq!(stats.samples_received, 5);
    assert_eq!(stats.samples_dropped, 2);
    assert_eq!(stats.records_published, 3);

    let lats: Vec<Option<f64>> = decode_all(&log.lock().unwrap()).iter().map(|r| r.lat).collect();
    assert_eq!(lats, vec![Some(40.0), Some(42.0), Some(44.0)]);
}

#[tokio::test]
async fn test_process_sample_reports_outcome() {
    let (broker, log) = MockBroker::new();
    let mut publisher = Publisher::new(config(), encoder(), ScriptedSource::closing(vec![]), broker);

    assert_eq!(publisher.process_sample(&fix(0, 40.0)).unwrap(), SampleOutcome::Published);

    let outcome = publisher.process_sample(&fix(1, 40.0).with("time", "yesterday")).unwrap();
    assert!(matches!(outcome, SampleOutcome::Dropped(NormalizeError::InvalidTimestamp { .. })));

    assert_eq!(log.lock().unwrap().sent.len(), 1);
    assert_eq!(publisher.stats().samples_dropped, 1);
}

#[tokio::test]
async fn test_recoverable_send_failure_is_counted() {
    let (mut broker, log) = MockBroker::new();
    broker.send_results = VecDeque::from(vec![
        Ok(()),
        Err(BrokerError::QueueFull),
        Err(BrokerError::Send("record too large".to_string())),
        Ok(()),
    ]);
    let samples: Vec<RawSample> = (0..4).map(|i| fix(i, 40.0)).collect();

    let publisher = Publisher::new(config(), encoder(), ScriptedSource::closing(samples), broker);
    let stats = publisher.run(std::future::pending::<()>()).await.unwrap();

    assert_eq!(stats.send_failures, 2);
    assert_eq!(stats.records_published, 2);
    assert_eq!(log.lock().unwrap().flushes, 1);
}

#[tokio::test]
async fn test_unusable_broker_stops_the_loop() {
    let (mut broker, log) = MockBroker::new();
    broker.send_results = VecDeque::from(vec![
        Ok(()),
        Err(BrokerError::Unusable("connection reset".to_string())),
    ]);
    let samples: Vec<RawSample> = (0..5).map(|i| fix(i, 40.0)).collect();

    let publisher = Publisher::new(config(), encoder(), ScriptedSource::closing(samples), broker);
    let err = publisher.run(std::future::pending::<()>()).await.unwrap_err();

    assert!(matches!(err, PublisherError::Broker(BrokerError::Unusable(_))));
    let log = log.lock().unwrap();
    assert_eq!(log.sent.len(), 1);
    assert_eq!(log.flushes, 0);
}

#[tokio::test]
async fn test_source_error_still_flushes() {
    let (broker, log) = MockBroker::new();
    let source = ScriptedSource {
        samples: VecDeque::from(vec![
            Ok(fix(0, 40.0)),
            Err(SourceError::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionReset,
                "gpsd went away",
            ))),
        ]),
        close_when_done: true,
    };

    let err = Publisher::new(config(), encoder(), source, broker)
        .run(std::future::pending::<()>())
        .await
        .unwrap_err();

    assert!(matches!(err, PublisherError::Source(_)));
    let log = log.lock().unwrap();
    assert_eq!(log.flushes, 1);
    assert_eq!(log.sent_at_flush, vec![1]);
}

#[tokio::test]
async fn test_shutdown_flushes_everything_sent() {
    let samples: Vec<RawSample> = (0..3).map(|i| fix(i, 40.0)).collect();
    let (broker, log) = MockBroker::new();
    let (stop_tx, stop_rx) = oneshot::channel::<()>();

    let publisher = Publisher::new(config(), encoder(), ScriptedSource::idling(samples), broker);
    let running = tokio::spawn(publisher.run(async move {
        let _ = stop_rx.await;
    }));

    while log.lock().unwrap().sent.len() < 3 {
        tokio::task::yield_now().await;
    }
    stop_tx.send(()).unwrap();

    let stats = running.await.unwrap().unwrap();
    assert_eq!(stats.records_published, 3);
    let log = log.lock().unwrap();
    assert_eq!(log.flushes, 1);
    assert_eq!(log.sent_at_flush, vec![3]);
}

#[cfg(unix)]
#[tokio::test]
async fn test_sigterm_flushes_and_exits_cleanly() {
    let samples: Vec<RawSample> = (0..3).map(|i| fix(i, 40.0)).collect();
    let (broker, log) = MockBroker::new();

    let shutdown = busgps::shutdown::shutdown_signal();
    let publisher = Publisher::new(config(), encoder(), ScriptedSource::idling(samples), broker);
    let running = tokio::spawn(publisher.run(shutdown));

    while log.lock().unwrap().sent.len() < 3 {
        tokio::task::yield_now().await;
    }
    // SAFETY: raise only delivers a signal to this process
    assert_eq!(unsafe { libc::raise(libc::SIGTERM) }, 0);

    let stats = tokio::time::timeout(Duration::from_secs(5), running)
        .await
        .expect("publisher ignored SIGTERM")
        .unwrap()
        .unwrap();
    assert_eq!(stats.records_published, 3);
    let log = log.lock().unwrap();
    assert_eq!(log.flushes, 1);
    assert_eq!(log.sent_at_flush, vec![3]);
}

#[tokio::test]
async fn test_shutdown_stops_consuming_samples() {
    let samples: Vec<RawSample> = (0..3).map(|i| fix(i, 40.0)).collect();
    let (broker, log) = MockBroker::new();

    // Shutdown is already requested before the first read
    let publisher = Publisher::new(config(), encoder(), ScriptedSource::closing(samples), broker);
    let stats = publisher.run(async {}).await.unwrap();

    assert_eq!(stats.samples_received, 0);
    let log = log.lock().unwrap();
    assert!(log.sent.is_empty());
    assert_eq!(log.flushes, 1);
}

#[tokio::test(start_paused = true)]
async fn test_hung_flush_times_out() {
    let (mut broker, _log) = MockBroker::new();
    broker.flush = FlushBehavior::Hang;

    let publisher = Publisher::new(config(), encoder(), ScriptedSource::closing(vec![fix(0, 40.0)]), broker);
    let err = publisher.run(async {}).await.unwrap_err();

    assert!(matches!(err, PublisherError::FlushTimeout(limit) if limit == Duration::from_secs(5)));
}

#[tokio::test(start_paused = true)]
async fn test_without_flush_timeout_publisher_waits_for_flush() {
    let (mut broker, log) = MockBroker::new();
    broker.flush = FlushBehavior::Hang;
    let config = BrokerConfig {
        flush_timeout_secs: None,
        ..config()
    };

    let publisher = Publisher::new(config, encoder(), ScriptedSource::closing(vec![fix(0, 40.0)]), broker);
    let outcome = tokio::time::timeout(Duration::from_secs(24 * 3600), publisher.run(async {})).await;

    assert!(outcome.is_err(), "publisher exited before the flush completed");
    assert_eq!(log.lock().unwrap().flushes, 1);
}
