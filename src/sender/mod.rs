//! Record senders and sinks.

mod incremental;
mod sink;

pub use incremental::*;
pub use sink::*;
