//! Pull-style paginators.
//!
//! Both drivers yield one page per `next_page().await` in request order and
//! are restartable only from a persisted checkpoint.

mod cursor;
mod offset;

pub use cursor::*;
pub use offset::*;
