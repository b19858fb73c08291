mod args;
mod transport;

use args::Args;
use clap::Parser;
use jobrunner::{Executor, ProtocolSession};
use std::error;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;
use transport::Transport;

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!(error = %err, "executor failed");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> Result<(), Box<dyn error::Error>> {
    let (session, outbox) = ProtocolSession::new();
    tracing::debug!(address = %args.miner_address, "connecting to dispatcher");
    let transport = Transport::connect(&args.dispatcher_url(), session.clone(), outbox).await?;
    tracing::debug!(address = %args.miner_address, "connected to dispatcher");

    let executor = Executor::with_docker(args.config(), session);
    let outcome = executor.run().await;
    // the writer drains the outbox until the last session handle is dropped
    drop(executor);
    let closed = transport.shutdown().await;

    outcome?;
    closed?;
    Ok(())
}
