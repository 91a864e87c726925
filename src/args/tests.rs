use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use super::{Cli, Command};
use crate::error::{AppError, AppResult};

#[test]
fn parse_agent_subcommand() -> AppResult<()> {
    let cli = Cli::try_parse_from([
        "benchmesh",
        "agent",
        "--config",
        "/etc/benchmesh/agent.toml",
        "--agent-id",
        "node-2",
        "--verbose",
    ])?;
    if !cli.verbose {
        return Err(AppError::validation("Expected verbose flag"));
    }
    let Command::Agent(args) = cli.command else {
        return Err(AppError::validation("Expected agent subcommand"));
    };
    if args.config != Some(PathBuf::from("/etc/benchmesh/agent.toml")) {
        return Err(AppError::validation("Unexpected config path"));
    }
    if args.agent_id.as_deref() != Some("node-2") {
        return Err(AppError::validation("Unexpected agent id"));
    }
    Ok(())
}

#[test]
fn parse_prepare_with_config_file() -> AppResult<()> {
    let cli = Cli::try_parse_from([
        "benchmesh",
        "prepare",
        "--control",
        "http://10.0.0.4:7400",
        "--config-file",
        "oltp.toml",
        "--timeout",
        "30s",
    ])?;
    let Command::Prepare(args) = cli.command else {
        return Err(AppError::validation("Expected prepare subcommand"));
    };
    if args.control.control != "http://10.0.0.4:7400" {
        return Err(AppError::validation("Unexpected control address"));
    }
    if args.control.timeout != Duration::from_secs(30) {
        return Err(AppError::validation("Unexpected timeout"));
    }
    if args.config_file != Some(PathBuf::from("oltp.toml")) {
        return Err(AppError::validation("Unexpected config file"));
    }
    Ok(())
}

#[test]
fn control_subcommands_share_defaults() -> AppResult<()> {
    let cli = Cli::try_parse_from(["benchmesh", "stop", "--control", "127.0.0.1:9000"])?;
    let Command::Stop(args) = cli.command else {
        return Err(AppError::validation("Expected stop subcommand"));
    };
    if args.control != "127.0.0.1:9000" || args.timeout != Duration::from_secs(10) {
        return Err(AppError::validation("Unexpected stop args"));
    }
    Ok(())
}

#[test]
fn zero_timeout_is_rejected() -> AppResult<()> {
    if Cli::try_parse_from(["benchmesh", "status", "--timeout", "0s"]).is_ok() {
        return Err(AppError::validation("Zero timeout must be rejected"));
    }
    Ok(())
}

#[test]
fn subcommand_is_required() -> AppResult<()> {
    if Cli::try_parse_from(["benchmesh"]).is_ok() {
        return Err(AppError::validation("Missing subcommand must be rejected"));
    }
    Ok(())
}
