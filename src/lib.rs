//! exportkit - Incremental, rate-limit aware export pipeline.
//!
//! ## Architecture
//!
//! - **Requester**: nested general/throttle retries behind an admission gate
//! - **Paginators**: pull-style cursor (newer-than) and offset drivers
//! - **DedupStore**: (ref_type, id) → hashcode, suppresses unchanged records
//! - **IncrementalSender**: dedup, sink forwarding and per-collection watermarks
//! - **Orchestrator**: primary → linking → tasks → dependent exporters, fail fast
//! - **Supervisor**: restarts the child with backoff, captures crashes,
//!   serves cancel requests
//!
//! ## Epistemic Design
//!
//! - K_i (Knowledge): Compile-time enforced invariants (types, enums)
//! - B_i (Beliefs): Runtime fallible operations (Result, Option)
//! - I^R (Resolvable): User-configurable parameters
//! - I^B (Bounded): Network/API uncertainties (retry, backoff)

pub mod client;
pub mod models;
pub mod pagination;
pub mod pipeline;
pub mod sender;
pub mod source;
pub mod state;
pub mod supervisor;

// Re-exports for convenience
pub use client::{Requester, RetryPolicy, Transport};
pub use models::{Config, ExportError, Record, Result, RunSummary};
pub use pipeline::{ExportPlan, Orchestrator, RunOptions};
pub use sender::{IncrementalSender, JsonlSink, MemorySink, Sink};
pub use source::{RestSource, Source};
pub use state::{CheckpointStore, DedupStore, Watermark};
pub use supervisor::Supervisor;
