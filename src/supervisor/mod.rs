//! Process-level lifecycle: startup, reconnection of both links and shutdown

mod backoff;
mod service;

pub use backoff::Backoff;
pub use service::Supervisor;
