pub mod logging;
pub mod reply;
pub mod status;

pub use tracing;

/// Broadcast from the controller to every listener and conversation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// Stop accepting and finish what is in flight
    Shutdown,
}
