use crate::AcceptFailedSnafu;
use crate::BindFailedSnafu;
use crate::MethodName;
use crate::PROTOCOL_VERSION;
use crate::RPCEnvelope;
use crate::RPCStatus;
use crate::Result;
use crate::ServiceName;
use crate::StatusCode;
use crate::encode_frame;
use crate::read_frame;
use crate::write_raw_frame;
use snafu::prelude::*;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::io::WriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;

pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<Vec<u8>, RPCStatus>> + Send>>;

pub type Handler = Box<dyn Fn(Vec<u8>) -> HandlerFuture + Send + Sync>;

type HandlerMap = HashMap<(ServiceName, MethodName), Handler>;

pub struct RPCServer {
    handlers: HandlerMap,
}

impl Default for RPCServer {
    fn default() -> Self {
        Self::new()
    }
}

impl RPCServer {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    pub fn register_service(&mut self, service: ServiceName, method: MethodName, handler: Handler) {
        tracing::debug!("Registered handler {}.{}", service, method);
        self.handlers.insert((service, method), handler);
    }

    pub fn has_handler(&self, service: &str, method: &str) -> bool {
        self.handlers
            .contains_key(&(service.to_string(), method.to_string()))
    }

    /// Binds `address` and serves until the accept loop fails.
    pub async fn serve(self, address: &str) -> Result<()> {
        let listener = bind(address).await?;
        self.serve_with_listener(listener).await
    }

    pub async fn serve_with_listener(self, listener: TcpListener) -> Result<()> {
        self.serve_with_shutdown(listener, std::future::pending())
            .await
    }

    /// Serves on an already bound listener until `shutdown` resolves.
    ///
    /// Each connection runs on its own task, and so does each request on a
    /// connection. Connections still in flight when `shutdown` fires are left
    /// to finish on their own.
    pub async fn serve_with_shutdown<F>(self, listener: TcpListener, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let handlers = Arc::new(self.handlers);
        if let Ok(local) = listener.local_addr() {
            tracing::info!("Server is running on {}", local);
        }
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, peer) = accepted.context(AcceptFailedSnafu)?;
                    tracing::info!("Accepted connection from {}", peer);
                    if let Err(e) = stream.set_nodelay(true) {
                        tracing::warn!("Failed to set TCP_NODELAY for {}: {}", peer, e);
                    }
                    let handlers = handlers.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, handlers).await {
                            tracing::error!("Error handling connection from {}: {}", peer, e);
                        }
                    });
                }
                _ = &mut shutdown => {
                    tracing::info!("Server shutting down");
                    return Ok(());
                }
            }
        }
    }
}

pub async fn bind(address: &str) -> Result<TcpListener> {
    TcpListener::bind(address)
        .await
        .context(BindFailedSnafu { address })
}

async fn handle_connection(stream: TcpStream, handlers: Arc<HandlerMap>) -> Result<()> {
    let (mut read_half, write_half) = tokio::io::split(stream);
    let write_half = Arc::new(Mutex::new(write_half));
    while let Some(request) = read_frame(&mut read_half).await? {
        tracing::debug!(
            "Request frame: seq={}, service={}, method={}, payload_size={}",
            request.sequence_number,
            request.service_name,
            request.method_name,
            request.payload.len()
        );
        let handlers = handlers.clone();
        let write_half = write_half.clone();
        tokio::spawn(async move {
            let response = dispatch(&handlers, request).await;
            respond(&write_half, response).await;
        });
    }
    tracing::debug!("Connection closed by peer");
    Ok(())
}

async fn respond(write_half: &Mutex<WriteHalf<TcpStream>>, response: RPCEnvelope) {
    let sequence_number = response.sequence_number;
    let written = match encode_frame(&response) {
        Ok(frame) => write_raw_frame(&mut *write_half.lock().await, &frame).await,
        Err(e) => Err(e),
    };
    if let Err(e) = written {
        tracing::warn!("Failed to write response seq={}: {}", sequence_number, e);
    }
}

async fn dispatch(handlers: &HandlerMap, request: RPCEnvelope) -> RPCEnvelope {
    let RPCEnvelope {
        version,
        sequence_number,
        service_name,
        method_name,
        payload,
        ..
    } = request;

    let outcome = if version != PROTOCOL_VERSION {
        Err(RPCStatus::new(
            StatusCode::InvalidArgument,
            format!("Unsupported protocol version {}", version),
        ))
    } else {
        match handlers.get(&(service_name.clone(), method_name.clone())) {
            Some(handler) => handler(payload).await,
            None => Err(RPCStatus::new(
                StatusCode::NotFound,
                format!("Unknown method {}.{}", service_name, method_name),
            )),
        }
    };

    let (status, payload) = match outcome {
        Ok(payload) => (None, payload),
        Err(status) => {
            tracing::warn!(
                "Call seq={} to {}.{} failed: {:?} {}",
                sequence_number,
                service_name,
                method_name,
                status.code,
                status.message
            );
            (Some(status), Vec::new())
        }
    };

    RPCEnvelope {
        version: PROTOCOL_VERSION,
        sequence_number,
        service_name,
        method_name,
        status,
        payload,
    }
}
