//! Service client: per-endpoint instances and the fan-out handle.

mod handle;
mod instance;

pub use handle::{ResponseSink, ServiceClient};
pub use instance::ClientInstance;
