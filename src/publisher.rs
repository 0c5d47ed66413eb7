//! Publisher loop: read → normalize → encode → send, one sample at a time.
//!
//! The loop stops on a termination request or when the source closes, and
//! always flushes the broker client before returning.

use crate::broker::{BrokerClient, BrokerError};
use crate::codec::RecordEncoder;
use crate::config::BrokerConfig;
use crate::source::{SourceError, TelemetrySource};
use crate::telemetry::{normalize, NormalizeError, RawSample};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
pub enum PublisherError {
    #[error(transparent)]
    Source(#[from] SourceError),
    #[error(transparent)]
    Broker(BrokerError),
    #[error("broker flush did not complete within {0:?}")]
    FlushTimeout(Duration),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublisherStats {
    pub samples_received: u64,
    pub records_published: u64,
    /// Samples that failed normalization.
    pub samples_dropped: u64,
    /// Recoverable send rejections.
    pub send_failures: u64,
}

/// What happened to a single sample.
#[derive(Debug, Clone, PartialEq)]
pub enum SampleOutcome {
    Published,
    Dropped(NormalizeError),
    SendFailed(BrokerError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StopReason {
    Shutdown,
    SourceClosed,
}

pub struct Publisher<S, B> {
    config: BrokerConfig,
    encoder: RecordEncoder,
    source: S,
    broker: B,
    stats: PublisherStats,
}

impl<S, B> Publisher<S, B>
where
    S: TelemetrySource,
    B: BrokerClient,
{
    pub fn new(config: BrokerConfig, encoder: RecordEncoder, source: S, broker: B) -> Self {
        Self {
            config,
            encoder,
            source,
            broker,
            stats: PublisherStats::default(),
        }
    }

    pub fn stats(&self) -> PublisherStats {
        self.stats
    }

    pub fn broker(&self) -> &B {
        &self.broker
    }

    /// Normalize, encode and submit one sample.
    ///
    /// Malformed samples and recoverable send failures are reported in the
    /// outcome; only an unusable broker is an error.
    pub fn process_sample(&mut self, sample: &RawSample) -> Result<SampleOutcome, PublisherError> {
        self.stats.samples_received += 1;

        let record = match normalize(sample) {
            Ok(record) => record,
            Err(e) => {
                self.stats.samples_dropped += 1;
                warn!("Dropping malformed sample ({} dropped so far): {}", self.stats.samples_dropped, e);
                return Ok(SampleOutcome::Dropped(e));
            }
        };

        let bytes = self.encoder.encode(&record);
        match self.broker.send(&self.config.topic, &bytes) {
            Ok(()) => {
                self.stats.records_published += 1;
                debug!("Published {} byte record to {}", bytes.len(), self.config.topic);
                Ok(SampleOutcome::Published)
            }
            Err(e) if e.is_fatal() => {
                error!("Broker unusable, stopping publisher: {}", e);
                Err(PublisherError::Broker(e))
            }
            Err(e) => {
                self.stats.send_failures += 1;
                warn!("Send to {} failed: {}", self.config.topic, e);
                Ok(SampleOutcome::SendFailed(e))
            }
        }
    }

    /// Run until `shutdown` resolves or the source closes, then flush.
    pub async fn run<F>(mut self, shutdown: F) -> Result<PublisherStats, PublisherError>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        info!("🚀 Publishing telemetry to topic {}", self.config.topic);

        let stopped = loop {
            let next = tokio::select! {
                biased;
                () = &mut shutdown => break Ok(StopReason::Shutdown),
                next = self.source.next_sample() => next,
            };

            match next {
                Ok(Some(sample)) => {
                    self.process_sample(&sample)?;
                }
                Ok(None) => break Ok(StopReason::SourceClosed),
                Err(e) => break Err(e),
            }
        };

        match stopped {
            Ok(reason) => info!("🛑 Publisher stopping ({:?}), flushing broker", reason),
            Err(ref e) => error!("Telemetry source failed, flushing broker: {}", e),
        }
        self.flush().await?;
        info!(
            "✅ Flush complete: {} received, {} published, {} dropped, {} send failures",
            self.stats.samples_received,
            self.stats.records_published,
            self.stats.samples_dropped,
            self.stats.send_failures
        );

        stopped?;
        Ok(self.stats)
    }

    /// Block until the broker confirms every submitted send, bounded by the
    /// configured flush timeout.
    pub async fn flush(&mut self) -> Result<(), PublisherError> {
        let result = match self.config.flush_timeout() {
            Some(limit) => tokio::time::timeout(limit, self.broker.flush())
                .await
                .map_err(|_| PublisherError::FlushTimeout(limit))?,
            None => self.broker.flush().await,
        };
        result.map_err(PublisherError::Broker)
    }
}
