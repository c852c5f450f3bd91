//! Export pipeline orchestration.

mod orchestrator;

pub use orchestrator::*;
