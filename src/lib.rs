//! # Vehicle Bus Watchdog & GPS Telemetry Publisher
//!
//! Two small services for a vehicle data logger:
//!
//! - An **inactivity watchdog** that fires when the vehicle bus goes quiet
//!   for longer than a timeout
//! - A **telemetry publisher** that reads GPS fixes, normalizes them into a
//!   canonical [`PositionRecord`], encodes them against a fixed Avro schema
//!   and streams them to a broker topic, flushing on termination
//!
//! ## Quick Start
//!
//! ```rust
//! use busgps::{normalize, RawSample, RecordEncoder, RecordSchema};
//!
//! let encoder = RecordEncoder::new(RecordSchema::builtin().unwrap());
//! let sample = RawSample::new()
//!     .with("time", "2024-01-01T00:00:00.000000Z")
//!     .with("lat", 40.4237)
//!     .with("lon", "n/a");
//!
//! let record = normalize(&sample).unwrap();
//! assert_eq!(record.time, Some(1_704_067_200.0));
//! assert_eq!(record.lon, None);
//!
//! let bytes = encoder.encode(&record);
//! assert_eq!(encoder.decode(&bytes).unwrap(), record);
//! ```
//!
//! ## Architecture
//!
//! - [`watchdog`] - Resettable one-shot inactivity alarm
//! - [`bus`] - Turns bus frame lines into watchdog liveness events
//! - [`telemetry`] - Raw samples, canonical records and normalization
//! - [`schema`] - Avro record schema loading and validation
//! - [`codec`] - Binary record encoding and decoding
//! - [`source`] - Telemetry source trait and the gpsd client
//! - [`broker`] - Broker client trait and the TCP gateway client
//! - [`publisher`] - Read/normalize/encode/send loop with flush-on-exit
//! - [`config`] - Startup configuration
//! - [`shutdown`] - Termination signal handling

#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::cast_precision_loss)]

pub mod broker;
pub mod bus;
pub mod codec;
pub mod config;
pub mod publisher;
pub mod schema;
pub mod shutdown;
pub mod source;
pub mod telemetry;
pub mod watchdog;

// Re-export main public types for convenience
pub use broker::{BrokerClient, BrokerError, TcpBroker};
pub use bus::BusMonitor;
pub use codec::{CodecError, EncodedRecord, RecordEncoder};
pub use config::Config;
pub use publisher::{Publisher, PublisherError, PublisherStats, SampleOutcome};
pub use schema::{RecordSchema, SchemaError};
pub use source::{GpsdSource, SourceError, TelemetrySource};
pub use telemetry::{normalize, FieldName, NormalizeError, PositionRecord, RawSample, RawValue};
pub use watchdog::{TrafficListener, Watchdog, WatchdogError, WatchdogExpired, WatchdogState};
