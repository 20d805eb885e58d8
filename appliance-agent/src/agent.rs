use crate::config::AgentConfig;
use crate::{
    ApplianceAgentServer, ApplianceAgentService, PingRequest, PingResponse, Result, ServeSnafu,
};
use agentrpc::server::{self, RPCServer};
use async_trait::async_trait;
use snafu::prelude::*;
use std::future::Future;
use tokio::net::TcpListener;

const PONG_PREFIX: &str = "Pong ";

/// The reply the agent gives to a ping carrying `message`.
pub fn pong(message: &str) -> String {
    format!("{}{}", PONG_PREFIX, message)
}

/// Stateless `ApplianceAgent` implementation.
#[derive(Debug, Clone, Copy, Default)]
pub struct ApplianceAgentHandler;

#[async_trait]
impl ApplianceAgentService for ApplianceAgentHandler {
    async fn ping(&self, request: PingRequest) -> agentrpc::Result<PingResponse> {
        tracing::info!("Received: {}", request.message);
        Ok(PingResponse {
            message: pong(&request.message),
        })
    }
}

pub fn build_server<S: ApplianceAgentService>(service: S) -> RPCServer {
    let mut server = RPCServer::new();
    ApplianceAgentServer::new(service).register(&mut server);
    server
}

/// Serves the agent on a bound listener until `shutdown` resolves.
pub async fn serve_agent<F>(listener: TcpListener, shutdown: F) -> Result<()>
where
    F: Future<Output = ()>,
{
    let address = listener
        .local_addr()
        .map(|addr| addr.to_string())
        .unwrap_or_default();
    build_server(ApplianceAgentHandler)
        .serve_with_shutdown(listener, shutdown)
        .await
        .context(ServeSnafu { address })
}

/// Binds `config.listen_address` and serves until ctrl-c.
///
/// A bind failure is returned to the caller; nothing here exits the process.
pub async fn run_agent(config: &AgentConfig) -> Result<()> {
    let listener = server::bind(&config.listen_address)
        .await
        .context(ServeSnafu {
            address: config.listen_address.as_str(),
        })?;
    tracing::info!("Appliance agent listening on {}", config.listen_address);

    serve_agent(listener, async {
        match tokio::signal::ctrl_c().await {
            Ok(()) => tracing::info!("Received ctrl-c, stopping agent"),
            Err(e) => {
                tracing::warn!("Cannot listen for ctrl-c, serving until killed: {}", e);
                std::future::pending::<()>().await
            }
        }
    })
    .await
}
