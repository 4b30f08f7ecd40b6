//! Vitalink Telemetry Gateway
//!
//! Ingestion gateway for the Vitalink respiratory care platform. The
//! gateway normalizes telemetry from heterogeneous respiratory devices
//! (CPAP/BIPAP hardware reporting over a managed IoT message bus, and ECG
//! software reporting bulk JSON+PDF artifacts) into a durable record
//! store, and opportunistically pushes pending configuration updates back
//! to devices on contact.
//!
//! ## Architecture
//!
//! ```text
//! IoT message bus                                      PostgreSQL
//! ┌──────────────┐    ┌────────────┐   ┌────────────┐  ┌───────────────┐
//! │ HTTPS rule   │───▶│ Envelope   │──▶│ Device     │  │ device_       │
//! │ action       │    │ normalizer │   │ classifier │  │ telemetry     │
//! └──────────────┘    └────────────┘   └─────┬──────┘  │ device_configs│
//!        ▲                                   │         │ ecg_records   │
//!        │ config push / ack                 ▼         └───────────────┘
//! ┌──────┴───────┐                     ┌────────────┐         ▲
//! │ Channel      │◀────────────────────│ Telemetry  │─────────┤
//! │ publisher    │                     │ ingestion  │         │
//! └──────────────┘                     └────────────┘         │
//!                                                             │
//! ECG software        ┌────────────┐   ┌────────────┐         │
//! ┌──────────────┐    │ ECG        │──▶│ S3 artifact│         │
//! │ JSON + PDF   │───▶│ ingestion  │   │ store      │─────────┘
//! └──────────────┘    └────────────┘   └────────────┘
//! ```
//!
//! Both ingestion paths are request-scoped: no background workers, no
//! cross-request shared mutable state beyond the pooled store clients.

pub mod artifact_store;
pub mod classifier;
pub mod config;
pub mod db;
pub mod decoder;
pub mod ecg_api;
pub mod ecg_store;
pub mod envelope;
pub mod error;
pub mod publisher;
pub mod server;
pub mod telemetry_store;
pub mod webhook_api;

pub use artifact_store::{artifact_key, ArtifactKind, ArtifactStore, S3ArtifactStore, StoredArtifact};
pub use classifier::{classify, Classification, DeviceFamily, ParsedTopic, TopicScheme};
pub use config::Config;
pub use decoder::{DeviceDecoder, SectionDecoder};
pub use ecg_store::{EcgQuery, EcgRecord, EcgStatus, EcgStore, PgEcgStore};
pub use envelope::{normalize, TelemetryEnvelope};
pub use error::GatewayError;
pub use publisher::{ChannelPublisher, KafkaChannelPublisher};
pub use server::{create_router, start_http_server, AppState};
pub use telemetry_store::{PgTelemetryStore, StoredTelemetryEvent, TelemetryStore};
