//! Process-level plumbing: logging setup and shutdown fan-out.
pub(crate) mod logger;
mod shutdown;

pub use shutdown::{
    ShutdownReceiver, ShutdownSender, setup_signal_shutdown_handler, shutdown_channel,
};
