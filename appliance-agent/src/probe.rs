use crate::config::ProbeConfig;
use crate::{
    ApplianceAgentClient, ConnectSnafu, EmptyAddressSnafu, PingRequest, PingResponse, PingSnafu,
    Result,
};
use snafu::prelude::*;

/// Pings one agent and returns its reply.
///
/// The connect and the call are each bounded by `config.timeout`. The
/// connection is released before returning, on success and on failure.
/// Nothing is retried.
pub async fn probe(config: &ProbeConfig) -> Result<PingResponse> {
    ensure!(!config.address.trim().is_empty(), EmptyAddressSnafu);
    let address = config.address.as_str();

    tracing::debug!("Dialing {} with a {:?} deadline", address, config.timeout);
    let client = ApplianceAgentClient::connect(address.to_string(), config.timeout)
        .await
        .context(ConnectSnafu { address })?;

    let response = client
        .ping(PingRequest {
            message: config.message.clone(),
        })
        .await
        .context(PingSnafu { address })?;

    if let Err(e) = client.close().await {
        tracing::debug!("Closing connection to {}: {}", address, e);
    }
    Ok(response)
}
