use clap::Parser;
use tracing::info;

use crate::agent::Agent;
use crate::args::{AgentArgs, Cli, Command, ControlArgs, PrepareArgs};
use crate::config::{load_benchmark_config, load_config};
use crate::control::{ControlClient, ControlReply};
use crate::domain::{BenchmarkConfig, Command as LifecycleCommand};
use crate::error::{AppError, AppResult, LifecycleError};
use crate::leader::CommandAck;
use crate::system::logger::init_logging;
use crate::system::{setup_signal_shutdown_handler, shutdown_channel};

/// Parses the command line, sets up logging and runs the chosen subcommand
/// on a multi-threaded runtime.
///
/// # Errors
///
/// Returns an error when the runtime cannot be built or the subcommand fails.
pub fn run() -> AppResult<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.no_color);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(run_async(cli.command))
}

async fn run_async(command: Command) -> AppResult<()> {
    match command {
        Command::Agent(args) => run_agent(args).await,
        Command::Prepare(args) => run_prepare(&args).await,
        Command::Run(args) => send_command(&args, LifecycleCommand::Run, None).await,
        Command::Stop(args) => send_command(&args, LifecycleCommand::Stop, None).await,
        Command::Collect(args) => send_command(&args, LifecycleCommand::Collect, None).await,
        Command::Clean(args) => send_command(&args, LifecycleCommand::Clean, None).await,
        Command::Status(args) => show_status(&args).await,
    }
}

async fn run_agent(args: AgentArgs) -> AppResult<()> {
    let settings = load_config(args.config.as_deref())?.resolve(args.agent_id)?;
    info!(
        "Starting agent {} with data dir {}",
        settings.agent_id,
        settings.data_dir.display()
    );

    let (shutdown_tx, _) = shutdown_channel();
    let signals = setup_signal_shutdown_handler(&shutdown_tx);
    let agent = Agent::open(settings).await?;
    let result = agent.run(shutdown_tx.clone()).await;
    drop(shutdown_tx.send(()));
    signals.await?;
    result
}

async fn run_prepare(args: &PrepareArgs) -> AppResult<()> {
    let config = match args.config_file.as_deref() {
        Some(path) => Some(load_benchmark_config(path)?),
        None => None,
    };
    send_command(&args.control, LifecycleCommand::Prepare, config).await
}

async fn send_command(
    args: &ControlArgs,
    command: LifecycleCommand,
    config: Option<BenchmarkConfig>,
) -> AppResult<()> {
    let client = ControlClient::new(args.timeout)?;
    let reply = client
        .command(&args.control, command, config.as_ref(), false)
        .await?;
    print_reply(&reply);
    if reply.is_success() {
        return Ok(());
    }
    let reason = serde_json::from_str::<CommandAck>(&reply.body)
        .map(|ack| ack.reason)
        .unwrap_or_else(|_not_an_ack| reply.body.clone());
    Err(AppError::lifecycle(LifecycleError::Rejected { reason }))
}

async fn show_status(args: &ControlArgs) -> AppResult<()> {
    let client = ControlClient::new(args.timeout)?;
    let reply = client.status(&args.control).await?;
    print_reply(&reply);
    if reply.is_success() {
        Ok(())
    } else {
        Err(AppError::lifecycle(LifecycleError::Rejected {
            reason: reply.body,
        }))
    }
}

fn print_reply(reply: &ControlReply) {
    match serde_json::from_str::<serde_json::Value>(&reply.body)
        .and_then(|value| serde_json::to_string_pretty(&value))
    {
        Ok(pretty) => println!("{}", pretty),
        Err(_not_json) => println!("{}", reply.body),
    }
}
