//! Core data models for exportkit.
//!
//! Epistemic mapping:
//! - K_i (Knowledge): Concrete types with compile-time guarantees
//! - B_i (Beliefs): Wrapped in Result/Option
//! - I^R (Resolvable): Config parameters
//! - I^B (Bounded): Error variants with retry strategies

mod agent;
mod config;
mod error;
mod locations;
mod record;

pub use agent::*;
pub use config::*;
pub use error::*;
pub use locations::*;
pub use record::*;
