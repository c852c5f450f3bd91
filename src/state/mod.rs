//! Local state for resumable exports.
//!
//! Provides:
//! - `DedupStore`: (ref_type, id) → hashcode map suppressing unchanged records
//! - `CheckpointStore`: per-collection watermarks that never regress
//! - `write_atomic`: temp file + rename used by every persisted file

pub mod atomic;
mod checkpoint;
mod dedup;

pub use atomic::{write_atomic, write_json_atomic};
pub use checkpoint::*;
pub use dedup::*;
