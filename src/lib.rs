//! Core library for the `benchmesh` CLI.
//!
//! A group of agents runs the same sysbench workload against a database.
//! The elected leader writes a single versioned target phase into a
//! replicated key/value store; every agent converges its own engine process
//! onto that target and publishes its status and metrics back. The primary
//! user-facing interface is the `benchmesh` command-line application.
pub mod agent;
pub mod args;
pub mod config;
pub mod control;
pub mod domain;
pub mod entry;
pub mod error;
pub mod leader;
pub mod membership;
pub mod metrics;
pub mod phase;
pub mod store;
pub mod supervisor;
pub mod system;
pub mod workload;

#[cfg(test)]
mod test_support;
