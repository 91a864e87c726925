use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};

use super::parsers::parse_duration_arg;

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Run a benchmark agent until SIGINT/SIGTERM
    Agent(AgentArgs),
    /// Prepare the database on every agent
    Prepare(PrepareArgs),
    /// Start the benchmark on every prepared agent
    Run(ControlArgs),
    /// Stop a running benchmark
    Stop(ControlArgs),
    /// Publish the final metrics of a stopped run
    Collect(ControlArgs),
    /// Remove benchmark data and return every agent to unset
    Clean(ControlArgs),
    /// Show agent status, and the cluster report when asking the leader
    Status(ControlArgs),
}

#[derive(Debug, Args, Clone)]
pub struct AgentArgs {
    /// Agent config file (.toml or .json); defaults to ./benchmesh.toml or ./benchmesh.json
    #[arg(long, short, env = "BENCHMESH_CONFIG")]
    pub config: Option<PathBuf>,

    /// Overrides `agent_id` from the config file
    #[arg(long = "agent-id", env = "BENCHMESH_AGENT_ID")]
    pub agent_id: Option<String>,
}

#[derive(Debug, Args, Clone)]
pub struct ControlArgs {
    /// Control address of any agent (host:port or http:// URL)
    #[arg(long, env = "BENCHMESH_CONTROL", default_value = "127.0.0.1:7400")]
    pub control: String,

    /// Request timeout (supports ms/s/m/h)
    #[arg(long, default_value = "10s", value_parser = parse_duration_arg)]
    pub timeout: Duration,
}

#[derive(Debug, Args, Clone)]
pub struct PrepareArgs {
    #[command(flatten)]
    pub control: ControlArgs,

    /// Benchmark config file (.toml or .json); without it the agent's configured benchmark is used
    #[arg(long = "config-file")]
    pub config_file: Option<PathBuf>,
}

#[derive(Debug, Parser, Clone)]
#[clap(
    version,
    about = "Distributed database benchmark orchestrator - leader-driven sysbench runs across a group of agents with Prometheus-ready metrics."
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Enable debug logging
    #[arg(long, short, global = true)]
    pub verbose: bool,

    /// Disable colored log output
    #[arg(long = "no-color", global = true, env = "NO_COLOR")]
    pub no_color: bool,
}
