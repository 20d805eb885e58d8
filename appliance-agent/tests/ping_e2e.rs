use appliance_agent::agent::{ApplianceAgentHandler, build_server, serve_agent};
use appliance_agent::config::ProbeConfig;
use appliance_agent::probe::probe;
use appliance_agent::{ApplianceAgentClient, ApplianceAgentService, PingRequest, PingResponse};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;

async fn start_agent() -> (String, oneshot::Sender<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    tokio::spawn(serve_agent(listener, async {
        let _ = stop_rx.await;
    }));
    (addr, stop_tx)
}

fn probe_config(address: &str, message: &str) -> ProbeConfig {
    ProbeConfig {
        address: address.to_string(),
        ..ProbeConfig::default()
    }
    .with_message(message)
}

#[tokio::test]
async fn test_probe_gets_pong() {
    let (addr, _stop) = start_agent().await;

    let response = probe(&probe_config(&addr, "client123")).await.unwrap();
    assert_eq!(response.message, "Pong client123");
}

#[tokio::test]
async fn test_probe_empty_message() {
    let (addr, _stop) = start_agent().await;

    let response = probe(&probe_config(&addr, "")).await.unwrap();
    assert_eq!(response.message, "Pong ");
}

#[tokio::test]
async fn test_echo_is_exact_over_the_wire() {
    let (addr, _stop) = start_agent().await;
    let client = ApplianceAgentClient::connect(addr, Duration::from_secs(1))
        .await
        .unwrap();

    let inputs = [
        " leading and trailing ",
        "UPPER lower",
        "line\nbreak\ttab",
        "ünïcødé ✓ 世界 🚀",
        "Pong already",
    ];
    for input in inputs {
        for _ in 0..3 {
            let response = client
                .ping(PingRequest {
                    message: input.to_string(),
                })
                .await
                .unwrap();
            assert_eq!(response.message, format!("Pong {}", input));
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_probes_are_independent() {
    let (addr, _stop) = start_agent().await;

    let mut handles = Vec::new();
    for i in 0..50 {
        let addr = addr.clone();
        handles.push(tokio::spawn(async move {
            let message = format!("probe-{}", i);
            let response = probe(&probe_config(&addr, &message)).await.unwrap();
            (message, response.message)
        }));
    }

    for handle in handles {
        let (sent, received) = handle.await.unwrap();
        assert_eq!(received, format!("Pong {}", sent));
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_calls_on_one_connection_are_paired() {
    let (addr, _stop) = start_agent().await;
    let client = Arc::new(
        ApplianceAgentClient::connect(addr, Duration::from_secs(1))
            .await
            .unwrap(),
    );

    let mut handles = Vec::new();
    for i in 0..100 {
        let client = client.clone();
        handles.push(tokio::spawn(async move {
            let message = format!("call-{}", i);
            let response = client
                .ping(PingRequest {
                    message: message.clone(),
                })
                .await
                .unwrap();
            assert_eq!(response.message, format!("Pong {}", message));
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }
}

struct StalledAgent {
    delay: Duration,
}

#[async_trait::async_trait]
impl ApplianceAgentService for StalledAgent {
    async fn ping(&self, request: PingRequest) -> agentrpc::Result<PingResponse> {
        tokio::time::sleep(self.delay).await;
        Ok(PingResponse {
            message: request.message,
        })
    }
}

#[tokio::test]
async fn test_probe_times_out_on_slow_agent() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let server = build_server(StalledAgent {
        delay: Duration::from_secs(5),
    });
    tokio::spawn(server.serve_with_listener(listener));

    let config = probe_config(&addr, "anyone there").with_timeout(Duration::from_millis(100));
    let started = Instant::now();
    let result = probe(&config).await;

    assert!(started.elapsed() < Duration::from_secs(2));
    match result {
        Err(appliance_agent::Error::Ping { source, .. }) => {
            assert!(matches!(source, agentrpc::Error::DeadlineExceeded { .. }))
        }
        other => panic!("Expected a ping deadline error, got {:?}", other),
    }
}

#[tokio::test]
async fn test_probe_times_out_on_silent_peer() {
    // Accepts connections and reads requests but never answers.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    tokio::spawn(async move {
        loop {
            let (mut stream, _) = listener.accept().await.unwrap();
            tokio::spawn(async move {
                let mut sink = Vec::new();
                let _ = stream.read_to_end(&mut sink).await;
            });
        }
    });

    let config = probe_config(&addr, "hello?").with_timeout(Duration::from_millis(100));
    let started = Instant::now();
    assert!(probe(&config).await.is_err());
    assert!(started.elapsed() < Duration::from_secs(2));
}

#[tokio::test]
async fn test_probe_fails_when_no_agent() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    drop(listener);

    match probe(&probe_config(&addr, "client123")).await {
        Err(appliance_agent::Error::Connect { .. }) => (),
        other => panic!("Expected Connect error, got {:?}", other),
    }
}

struct CountingRelay {
    address: String,
    accepted: Arc<AtomicUsize>,
    closed: Arc<AtomicUsize>,
}

impl CountingRelay {
    // Relays every connection to `target` and counts the ones the dialing
    // side has closed.
    async fn start(target: SocketAddr) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        let accepted = Arc::new(AtomicUsize::new(0));
        let closed = Arc::new(AtomicUsize::new(0));
        {
            let accepted = accepted.clone();
            let closed = closed.clone();
            tokio::spawn(async move {
                loop {
                    let (inbound, _) = listener.accept().await.unwrap();
                    accepted.fetch_add(1, Ordering::SeqCst);
                    let outbound = TcpStream::connect(target).await.unwrap();
                    let (mut inbound_read, mut inbound_write) = inbound.into_split();
                    let (mut outbound_read, mut outbound_write) = outbound.into_split();
                    tokio::spawn(async move {
                        let _ = tokio::io::copy(&mut outbound_read, &mut inbound_write).await;
                    });
                    let closed = closed.clone();
                    tokio::spawn(async move {
                        let _ = tokio::io::copy(&mut inbound_read, &mut outbound_write).await;
                        closed.fetch_add(1, Ordering::SeqCst);
                    });
                }
            });
        }
        Self {
            address,
            accepted,
            closed,
        }
    }

    async fn wait_for_closed(&self, expected: usize) -> usize {
        let deadline = Instant::now() + Duration::from_secs(2);
        while self.closed.load(Ordering::SeqCst) < expected && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        self.closed.load(Ordering::SeqCst)
    }
}

async fn start_server(server: agentrpc::server::RPCServer) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(server.serve_with_listener(listener));
    addr
}

#[tokio::test]
async fn test_sequential_probes_release_connections() {
    let agent = start_server(build_server(ApplianceAgentHandler)).await;
    let relay = CountingRelay::start(agent).await;

    const ROUNDS: usize = 10;
    for i in 0..ROUNDS {
        let message = format!("round-{}", i);
        let response = probe(&probe_config(&relay.address, &message)).await.unwrap();
        assert_eq!(response.message, format!("Pong {}", message));
    }

    assert_eq!(relay.wait_for_closed(ROUNDS).await, ROUNDS);
    assert_eq!(relay.accepted.load(Ordering::SeqCst), ROUNDS);
}

#[tokio::test]
async fn test_failed_probes_release_connections() {
    let agent = start_server(build_server(StalledAgent {
        delay: Duration::from_secs(5),
    }))
    .await;
    let relay = CountingRelay::start(agent).await;

    const ROUNDS: usize = 5;
    for i in 0..ROUNDS {
        let config = probe_config(&relay.address, &format!("late-{}", i))
            .with_timeout(Duration::from_millis(50));
        match probe(&config).await {
            Err(appliance_agent::Error::Ping { source, .. }) => {
                assert!(matches!(source, agentrpc::Error::DeadlineExceeded { .. }))
            }
            other => panic!("Expected a ping deadline error, got {:?}", other),
        }
    }

    assert_eq!(relay.wait_for_closed(ROUNDS).await, ROUNDS);
    assert_eq!(relay.accepted.load(Ordering::SeqCst), ROUNDS);
}

#[tokio::test]
async fn test_agent_stops_on_shutdown() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let handle = tokio::spawn(serve_agent(listener, async {
        let _ = stop_rx.await;
    }));

    stop_tx.send(()).unwrap();
    let result = tokio::time::timeout(Duration::from_secs(2), handle)
        .await
        .unwrap()
        .unwrap();
    assert!(result.is_ok());
}
