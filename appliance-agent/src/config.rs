//! Defaults shared by the agent and the probe.
//!
//! The agent and every client use the same port. An earlier test client
//! defaulted to `localhost:50051`, which no agent ever listened on; that value
//! is kept only as [`LEGACY_PROBE_ADDRESS`].

use std::time::Duration;

/// TCP port the agent listens on.
pub const AGENT_PORT: u16 = 8200;

/// Agent listen address: every interface, [`AGENT_PORT`].
pub const DEFAULT_LISTEN_ADDRESS: &str = "0.0.0.0:8200";

/// Address the probe dials when none is given.
pub const DEFAULT_AGENT_ADDRESS: &str = "localhost:8200";

/// Address the first test client dialed by mistake. Never used as a default.
pub const LEGACY_PROBE_ADDRESS: &str = "localhost:50051";

pub const DEFAULT_PING_MESSAGE: &str = "client123";

/// How long the probe waits for the connection and for the ping reply.
pub const DEFAULT_PING_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentConfig {
    pub listen_address: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            listen_address: DEFAULT_LISTEN_ADDRESS.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeConfig {
    pub address: String,
    pub message: String,
    pub timeout: Duration,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            address: DEFAULT_AGENT_ADDRESS.to_string(),
            message: DEFAULT_PING_MESSAGE.to_string(),
            timeout: DEFAULT_PING_TIMEOUT,
        }
    }
}

impl ProbeConfig {
    /// Targets the agent on `host` at `port`, the way the management server
    /// reaches an appliance by its management IP.
    pub fn for_host(host: &str, port: u16) -> Self {
        let address = if host.is_empty() {
            String::new()
        } else if host.contains(':') && !host.starts_with('[') {
            format!("[{}]:{}", host, port)
        } else {
            format!("{}:{}", host, port)
        };
        Self {
            address,
            ..Self::default()
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}
