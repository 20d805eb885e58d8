use appliance_agent::agent::run_agent;
use appliance_agent::config::{AgentConfig, DEFAULT_LISTEN_ADDRESS};
use clap::Parser;
use std::process::ExitCode;

/// Virtual appliance agent: answers ApplianceAgent.Ping calls.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Address to listen on
    #[arg(short, long, default_value = DEFAULT_LISTEN_ADDRESS)]
    listen: String,
}

#[tokio::main]
async fn main() -> ExitCode {
    appliance_agent::init_tracing();
    let args = Args::parse();
    let config = AgentConfig {
        listen_address: args.listen,
    };
    match run_agent(&config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{}", e);
            ExitCode::FAILURE
        }
    }
}
