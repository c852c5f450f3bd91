//! Request layer: transport seam, response classification, retrying requester.

mod requester;
mod throttle;
mod transport;

pub use requester::*;
pub use throttle::*;
pub use transport::*;
