use appliance_agent::config::{DEFAULT_AGENT_ADDRESS, DEFAULT_PING_MESSAGE, ProbeConfig};
use appliance_agent::probe::probe;
use clap::Parser;
use std::process::ExitCode;
use std::time::Duration;

/// Sends one ping to an appliance agent and prints the reply.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Message to send
    #[arg(default_value = DEFAULT_PING_MESSAGE)]
    message: String,

    /// Agent address (host:port)
    #[arg(short, long, default_value = DEFAULT_AGENT_ADDRESS)]
    address: String,

    /// How long to wait for the connection and the reply, in milliseconds
    #[arg(short, long, default_value_t = 1000)]
    timeout_ms: u64,
}

#[tokio::main]
async fn main() -> ExitCode {
    appliance_agent::init_tracing();
    let args = Args::parse();
    let config = ProbeConfig {
        address: args.address,
        message: args.message,
        timeout: Duration::from_millis(args.timeout_ms),
    };
    match probe(&config).await {
        Ok(response) => {
            println!("Pinging: {}", response.message);
            ExitCode::SUCCESS
        }
        Err(e) => {
            tracing::error!("Could not ping: {}", e);
            ExitCode::FAILURE
        }
    }
}
