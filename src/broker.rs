//! Broker client.
//!
//! [`BrokerClient`] is the narrow interface the publisher uses: a
//! non-blocking `send` and a `flush` that waits for everything submitted so
//! far. [`TcpBroker`] implements it over a single TCP connection to a broker
//! gateway, a local relay that forwards records into the message broker.
//! Each message goes out as
//! `u16 BE topic length | topic | u32 BE payload length | payload`
//! and the gateway answers every frame, in order, with one status byte:
//! [`ACK_STORED`] once the record is stored, anything else if it rejected it.
//!
//! Messages are queued to a background writer task. A frame counts as
//! delivered only once its acknowledgement arrives. Frames still waiting for
//! one when the connection drops are replayed on the next connection, so
//! delivery is at-least-once. Reconnects use exponential backoff; once the
//! attempts are exhausted the waiting frames are counted as failed and the
//! client is unusable and reports so on every later call.

use crate::config::BrokerConfig;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

/// Longest topic name the gateway accepts.
pub const MAX_TOPIC_LEN: usize = 249;

/// Status byte the gateway returns for a stored frame.
pub const ACK_STORED: u8 = 0;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BrokerError {
    #[error("send queue full, message dropped")]
    QueueFull,
    #[error("send rejected: {0}")]
    Send(String),
    #[error("broker connection unusable: {0}")]
    Unusable(String),
}

impl BrokerError {
    /// Whether the client can no longer deliver anything.
    pub fn is_fatal(&self) -> bool {
        matches!(self, BrokerError::Unusable(_))
    }
}

pub trait BrokerClient {
    /// Submit a message without waiting for delivery.
    fn send(&mut self, topic: &str, payload: &[u8]) -> Result<(), BrokerError>;

    /// Wait until every previously submitted message is delivered or failed.
    fn flush(&mut self) -> impl Future<Output = Result<(), BrokerError>> + Send;
}

enum Outbound {
    Message(Vec<u8>),
    Flush(oneshot::Sender<Result<(), BrokerError>>),
}

#[derive(Debug, Default)]
struct Health {
    unusable: AtomicBool,
    failed_messages: AtomicU64,
    delivered_messages: AtomicU64,
}

#[derive(Debug, Clone)]
struct ReconnectPolicy {
    attempts: u32,
    backoff: Duration,
}

pub struct TcpBroker {
    address: String,
    queue: mpsc::Sender<Outbound>,
    health: Arc<Health>,
}

impl TcpBroker {
    /// Connect to the gateway and start the writer task.
    pub async fn connect(config: &BrokerConfig) -> Result<Self, BrokerError> {
        let link = Link::open(&config.address)
            .await
            .map_err(|e| BrokerError::Unusable(format!("connect {}: {}", config.address, e)))?;
        info!("📡 Connected to broker gateway at {}", config.address);

        let (queue, rx) = mpsc::channel(config.send_queue_capacity.max(1));
        let health = Arc::new(Health::default());
        let connection = Connection {
            address: config.address.clone(),
            policy: ReconnectPolicy {
                attempts: config.reconnect_attempts,
                backoff: Duration::from_millis(config.reconnect_backoff_ms),
            },
            health: Arc::clone(&health),
            link: Some(link),
            in_flight: VecDeque::new(),
            reconnects: 0,
            rejected_since_flush: 0,
        };
        tokio::spawn(writer_task(connection, rx));

        Ok(Self {
            address: config.address.clone(),
            queue,
            health,
        })
    }

    /// Messages that were accepted by `send` but never delivered.
    pub fn failed_messages(&self) -> u64 {
        self.health.failed_messages.load(Ordering::Relaxed)
    }

    /// Messages the gateway acknowledged as stored.
    pub fn delivered_messages(&self) -> u64 {
        self.health.delivered_messages.load(Ordering::Relaxed)
    }

    fn unusable(&self) -> BrokerError {
        BrokerError::Unusable(format!("connection to {} lost", self.address))
    }
}

pub fn encode_frame(topic: &str, payload: &[u8]) -> Result<Vec<u8>, BrokerError> {
    if topic.is_empty() || topic.len() > MAX_TOPIC_LEN {
        return Err(BrokerError::Send(format!("invalid topic length {}", topic.len())));
    }
    let payload_len = u32::try_from(payload.len())
        .map_err(|_| BrokerError::Send(format!("payload of {} bytes too large", payload.len())))?;

    let mut frame = Vec::with_capacity(2 + topic.len() + 4 + payload.len());
    frame.extend_from_slice(&(topic.len() as u16).to_be_bytes());
    frame.extend_from_slice(topic.as_bytes());
    frame.extend_from_slice(&payload_len.to_be_bytes());
    frame.extend_from_slice(payload);
    Ok(frame)
}

impl BrokerClient for TcpBroker {
    fn send(&mut self, topic: &str, payload: &[u8]) -> Result<(), BrokerError> {
        if self.health.unusable.load(Ordering::SeqCst) {
            return Err(self.unusable());
        }
        let frame = encode_frame(topic, payload)?;
        match self.queue.try_send(Outbound::Message(frame)) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => Err(BrokerError::QueueFull),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(self.unusable()),
        }
    }

    async fn flush(&mut self) -> Result<(), BrokerError> {
        let (done_tx, done_rx) = oneshot::channel();
        self.queue
            .send(Outbound::Flush(done_tx))
            .await
            .map_err(|_| self.unusable())?;
        done_rx.await.map_err(|_| self.unusable())?
    }
}

/// One TCP connection to the gateway.
struct Link {
    reader: BufReader<OwnedReadHalf>,
    writer: BufWriter<OwnedWriteHalf>,
}

impl Link {
    async fn open(address: &str) -> std::io::Result<Self> {
        let (reader, writer) = TcpStream::connect(address).await?.into_split();
        Ok(Self {
            reader: BufReader::new(reader),
            writer: BufWriter::new(writer),
        })
    }

    async fn write(&mut self, frame: &[u8], flush: bool) -> std::io::Result<()> {
        self.writer.write_all(frame).await?;
        if flush {
            self.writer.flush().await?;
        }
        Ok(())
    }

    async fn replay(&mut self, frames: &VecDeque<Vec<u8>>) -> std::io::Result<()> {
        for frame in frames {
            self.writer.write_all(frame).await?;
        }
        self.writer.flush().await
    }
}

/// Writer-side state: the live link and every frame not yet acknowledged.
struct Connection {
    address: String,
    policy: ReconnectPolicy,
    health: Arc<Health>,
    link: Option<Link>,
    in_flight: VecDeque<Vec<u8>>,
    // Reconnects since the last acknowledgement
    reconnects: u32,
    rejected_since_flush: u64,
}

impl Connection {
    fn is_unusable(&self) -> bool {
        self.health.unusable.load(Ordering::SeqCst)
    }

    fn awaiting_acks(&self) -> bool {
        self.link.is_some() && !self.in_flight.is_empty()
    }

    async fn submit(&mut self, frame: Vec<u8>, flush: bool) {
        if self.is_unusable() {
            self.health.failed_messages.fetch_add(1, Ordering::Relaxed);
            return;
        }
        self.in_flight.push_back(frame);

        let result = match (self.link.as_mut(), self.in_flight.back()) {
            (Some(link), Some(frame)) => link.write(frame, flush).await,
            _ => Err(std::io::ErrorKind::NotConnected.into()),
        };
        if let Err(e) = result {
            warn!("Write to broker gateway {} failed: {}", self.address, e);
            let _ = self.recover().await;
        }
    }

    async fn next_ack(&mut self) -> std::io::Result<u8> {
        match self.link.as_mut() {
            Some(link) => link.reader.read_u8().await,
            None => Err(std::io::ErrorKind::NotConnected.into()),
        }
    }

    async fn on_ack(&mut self, ack: std::io::Result<u8>) {
        match ack {
            Ok(status) => {
                self.reconnects = 0;
                if self.in_flight.pop_front().is_none() {
                    warn!("Unexpected acknowledgement from {}", self.address);
                } else if status == ACK_STORED {
                    self.health.delivered_messages.fetch_add(1, Ordering::Relaxed);
                } else {
                    warn!("Broker gateway {} rejected a message (status {})", self.address, status);
                    self.health.failed_messages.fetch_add(1, Ordering::Relaxed);
                    self.rejected_since_flush += 1;
                }
            }
            Err(e) => {
                warn!(
                    "Lost broker gateway {} with {} unacknowledged messages: {}",
                    self.address,
                    self.in_flight.len(),
                    e
                );
                let _ = self.recover().await;
            }
        }
    }

    /// Reconnect and replay every unacknowledged frame.
    async fn recover(&mut self) -> Result<(), BrokerError> {
        self.link = None;

        while self.reconnects < self.policy.attempts {
            self.reconnects += 1;
            let backoff = self
                .policy
                .backoff
                .saturating_mul(2u32.saturating_pow(self.reconnects - 1));
            tokio::time::sleep(backoff).await;

            let mut link = match Link::open(&self.address).await {
                Ok(link) => link,
                Err(e) => {
                    warn!("Reconnect {} to {} failed: {}", self.reconnects, self.address, e);
                    continue;
                }
            };
            match link.replay(&self.in_flight).await {
                Ok(()) => {
                    info!(
                        "🔁 Reconnected to broker gateway {} (attempt {}), replayed {} messages",
                        self.address,
                        self.reconnects,
                        self.in_flight.len()
                    );
                    self.link = Some(link);
                    return Ok(());
                }
                Err(e) => warn!("Replay to {} failed: {}", self.address, e),
            }
        }

        Err(self.give_up())
    }

    fn give_up(&mut self) -> BrokerError {
        let lost = self.in_flight.len() as u64;
        self.in_flight.clear();
        self.health.failed_messages.fetch_add(lost, Ordering::Relaxed);
        self.health.unusable.store(true, Ordering::SeqCst);
        error!(
            "Gave up on broker gateway {} after {} reconnect attempts, {} messages lost",
            self.address, self.reconnects, lost
        );
        BrokerError::Unusable(format!(
            "gave up on {} after {} reconnect attempts",
            self.address, self.reconnects
        ))
    }

    /// Push buffered frames out and wait for every acknowledgement.
    async fn drain(&mut self) -> Result<(), BrokerError> {
        if !self.is_unusable() {
            let flushed = match self.link.as_mut() {
                Some(link) => link.writer.flush().await,
                None => Err(std::io::ErrorKind::NotConnected.into()),
            };
            if let Err(e) = flushed {
                warn!("Flush to broker gateway {} failed: {}", self.address, e);
                let _ = self.recover().await;
            }
        }

        while self.awaiting_acks() {
            let ack = self.next_ack().await;
            self.on_ack(ack).await;
        }

        if self.is_unusable() {
            return Err(BrokerError::Unusable(format!("connection to {} lost", self.address)));
        }
        match std::mem::take(&mut self.rejected_since_flush) {
            0 => Ok(()),
            rejected => Err(BrokerError::Send(format!(
                "{} messages rejected by {}",
                rejected, self.address
            ))),
        }
    }
}

async fn writer_task(mut connection: Connection, mut rx: mpsc::Receiver<Outbound>) {
    loop {
        tokio::select! {
            outbound = rx.recv() => match outbound {
                Some(Outbound::Message(frame)) => {
                    // Push buffered frames out whenever the queue drains
                    let idle = rx.is_empty();
                    connection.submit(frame, idle).await;
                }
                Some(Outbound::Flush(done)) => {
                    let result = connection.drain().await;
                    if let Err(e) = &result {
                        warn!("Broker flush failed: {}", e);
                    }
                    // Flush caller may have given up waiting
                    let _ = done.send(result);
                }
                None => break,
            },
            ack = connection.next_ack(), if connection.awaiting_acks() => {
                connection.on_ack(ack).await;
            }
        }
    }
    debug!("Broker writer for {} exiting", connection.address);
}
