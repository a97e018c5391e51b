pub mod address;
pub mod audit;
pub mod config;
pub mod id;
pub mod logging;

pub use tracing;

/// Broadcast across the long-running tasks of the process (listener, queue
/// manager, health plane) to coordinate shutdown.
#[derive(Debug, Clone, Copy)]
pub enum Signal {
    Shutdown,
}
