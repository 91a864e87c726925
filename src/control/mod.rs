//! Operator control plane: command endpoints, status, and metrics scrapes.
//!
//! Any agent accepts commands; followers forward them to the leader once.
mod client;
mod http;
mod server;


pub use client::{ControlClient, ControlReply};
pub use server::{ControlContext, ControlServer, StatusResponse};
