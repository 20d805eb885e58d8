//! Virtual appliance agent.
//!
//! The agent answers a single `ApplianceAgent.Ping` call with `"Pong " + message`.
//! The probe dials an agent, issues one ping under a deadline and reports the
//! answer. Both sides share the wire types generated from
//! `schema/appliance_agent.yaml` and the defaults in [`config`].

use snafu::Snafu;

pub mod agent;
pub mod config;
pub mod probe;

agentrpc::rpc_gen!("schema/appliance_agent.yaml", module = "appliance_agent");

pub use self::appliance_agent::{
    ApplianceAgentClient, ApplianceAgentServer, ApplianceAgentService, PingRequest, PingResponse,
};

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    #[snafu(display("Agent failed to serve on {}: {}", address, source))]
    Serve {
        address: String,
        source: agentrpc::Error,
    },

    #[snafu(display("Agent address must not be empty"))]
    EmptyAddress,

    #[snafu(display("Could not connect to agent at {}: {}", address, source))]
    Connect {
        address: String,
        source: agentrpc::Error,
    },

    #[snafu(display("Could not ping agent at {}: {}", address, source))]
    Ping {
        address: String,
        source: agentrpc::Error,
    },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Installs the `tracing` subscriber used by both binaries.
///
/// `RUST_LOG` overrides the default `info` level.
pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}
