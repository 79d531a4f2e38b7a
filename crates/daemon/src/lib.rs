//! Conveyor
//!
//! Admission control and work dispatch for a video transcoding service:
//! requests are filtered through prioritized frequency queues, handed to a
//! coordinator that tracks every task through its lifecycle, and pulled by
//! capacity-aware workers that download, encode and upload each stream.

pub mod admission;
pub mod catalog;
pub mod channels;
pub mod concurrency;
pub mod context;
pub mod coordinator;
pub mod daemon;
pub mod encode;
pub mod frequency_queue;
pub mod gates;
pub mod http;
pub mod ledger;
pub mod metrics;
pub mod protocol;
pub mod startup;
pub mod transport;
pub mod worker;

pub use conveyor_config as config;
pub use conveyor_config::Config;
pub use admission::{AdmissionPool, AdmitOutcome, Admitted, Gatekeeper, Level};
pub use catalog::{Catalog, CatalogError, MemoryCatalog, StreamEntry};
pub use channels::{ChannelDirectory, ChannelPriority, ChannelSource, StaticChannels};
pub use concurrency::{derive_plan, SlotPlan};
pub use context::Context;
pub use coordinator::{AdmitResponse, CallbackAuth, Coordinator, CoordinatorError, RunningRequest};
pub use daemon::{Daemon, DaemonError};
pub use encode::{Av1anEncoder, EncodeError, Encoder};
pub use frequency_queue::{FrequencyQueue, ItemStatus, QueueItem};
pub use http::{create_router, run_server, ServerError};
pub use ledger::{JsonLedger, LedgerError, LedgerStatus, MemoryLedger, TaskLedger, TaskRecord};
pub use metrics::{new_shared_metrics, MetricsSnapshot, SharedMetrics};
pub use startup::{check_encoder_available, run_startup_checks, StartupError};
pub use transport::{MemoryBroker, Transport, TransportError};
pub use worker::{Pipeline, PipelineError, Worker, WorkerError, WorkerSettings};
