//! CLI argument types and parsing helpers.
mod cli;
mod parsers;

#[cfg(test)]
mod tests;

pub use cli::{AgentArgs, Cli, Command, ControlArgs, PrepareArgs};
