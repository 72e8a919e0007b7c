//! End-to-end tests for geerpc.
//!
//! These cover the full stack: unary calls over in-memory pipes, concurrent
//! multiplexing, the server handle timeout, call cancellation, the CONNECT
//! tunnel, cluster unicast/broadcast over real TCP, and the registry with
//! heartbeats and expiry.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use geerpc::testing::{connect_pair, spawn_tcp_server};
use geerpc::{
    start_heartbeat, Client, ClusterClient, CodecKind, ConnectOption, Context, Discovery, Error,
    MultiServerDiscovery, Registry, RegistryDiscovery, SelectMode, Server, Service,
};

/// Opt-in test logging: `RUST_LOG=geerpc=debug cargo test -- --nocapture`.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
struct Args {
    num1: i32,
    num2: i32,
}

/// Arithmetic fixture service used by most tests.
fn arith_service() -> Service {
    Service::new("Arith")
        .method("Sum", |args: Args| async move { Ok(args.num1 + args.num2) })
        .method("Swap", |args: Args| async move {
            Ok(Args {
                num1: args.num2,
                num2: args.num1,
            })
        })
}

/// Sleeps for the requested number of milliseconds, then echoes it back.
fn timer_service() -> Service {
    Service::new("Timer").method("Sleep", |millis: u64| async move {
        tokio::time::sleep(Duration::from_millis(millis)).await;
        Ok(millis)
    })
}

async fn arith_pair(option: ConnectOption) -> Client {
    init_tracing();
    let server = Arc::new(Server::new());
    server.register(arith_service()).unwrap();
    server.register(timer_service()).unwrap();
    let (client, _serve) = connect_pair(server, option).await.unwrap();
    client
}

// ============================================================================
// Single-connection behavior
// ============================================================================

#[tokio::test]
async fn test_unary_sum() {
    let client = arith_pair(ConnectOption::default()).await;

    let sum: i32 = client
        .call(&Context::new(), "Arith.Sum", &Args { num1: 1, num2: 2 })
        .await
        .expect("call failed");
    assert_eq!(sum, 3);
}

#[tokio::test]
async fn test_unary_sum_json_codec() {
    let client = arith_pair(ConnectOption::default().codec(CodecKind::Json)).await;

    let swapped: Args = client
        .call(&Context::new(), "Arith.Swap", &Args { num1: 1, num2: 2 })
        .await
        .expect("call failed");
    assert_eq!(swapped, Args { num1: 2, num2: 1 });
}

#[tokio::test(flavor = "multi_thread")]
async fn test_concurrent_calls_route_correctly() {
    let client = arith_pair(ConnectOption::default()).await;

    let mut tasks = Vec::new();
    for task_id in 0..2i32 {
        let client = client.clone();
        tasks.push(tokio::spawn(async move {
            for i in 0..100i32 {
                let args = Args {
                    num1: task_id * 1000,
                    num2: i,
                };
                let sum: i32 = client
                    .call(&Context::new(), "Arith.Sum", &args)
                    .await
                    .expect("call failed");
                assert_eq!(sum, task_id * 1000 + i);
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }
}

#[tokio::test]
async fn test_unknown_method_leaves_connection_usable() {
    let client = arith_pair(ConnectOption::default()).await;

    let err = client
        .call::<Args, i32>(&Context::new(), "Arith.Mul", &Args { num1: 1, num2: 2 })
        .await
        .unwrap_err();
    assert!(err.to_string().contains("can't find method"));

    let err = client
        .call::<Args, i32>(&Context::new(), "Nope.Sum", &Args { num1: 1, num2: 2 })
        .await
        .unwrap_err();
    assert!(err.to_string().contains("can't find service"));

    // Dispatch errors are per-request; the connection keeps working.
    let sum: i32 = client
        .call(&Context::new(), "Arith.Sum", &Args { num1: 3, num2: 4 })
        .await
        .unwrap();
    assert_eq!(sum, 7);
}

#[tokio::test]
async fn test_handle_timeout_reported_quickly() {
    let option = ConnectOption::default().handle_timeout(Duration::from_millis(200));
    let client = arith_pair(option).await;

    let started = Instant::now();
    let err = client
        .call::<u64, u64>(&Context::new(), "Timer.Sleep", &2_000)
        .await
        .unwrap_err();
    assert!(
        err.to_string().contains("request handle timeout"),
        "unexpected error: {err}"
    );
    assert!(
        started.elapsed() < Duration::from_secs(1),
        "timeout response took {:?}",
        started.elapsed()
    );
}

#[tokio::test]
async fn test_call_cancellation_leaves_client_usable() {
    let client = arith_pair(ConnectOption::default()).await;

    let ctx = Context::new();
    let canceller = ctx.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        canceller.cancel();
    });

    let started = Instant::now();
    let err = client
        .call::<u64, u64>(&ctx, "Timer.Sleep", &2_000)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::CallFailed(_)), "unexpected: {err}");
    assert!(started.elapsed() < Duration::from_millis(600));

    // The server's late response is discarded; new calls still work.
    let sum: i32 = client
        .call(&Context::new(), "Arith.Sum", &Args { num1: 2, num2: 2 })
        .await
        .unwrap();
    assert_eq!(sum, 4);
}

#[tokio::test]
async fn test_method_call_counter() {
    let server = Arc::new(Server::new());
    server.register(arith_service()).unwrap();
    let (client, _serve) = connect_pair(server.clone(), ConnectOption::default())
        .await
        .unwrap();

    for i in 0..3 {
        let _: i32 = client
            .call(&Context::new(), "Arith.Sum", &Args { num1: i, num2: i })
            .await
            .unwrap();
    }

    let service = server.service("Arith").unwrap();
    assert_eq!(service.lookup("Sum").unwrap().num_calls(), 3);
    assert_eq!(service.lookup("Swap").unwrap().num_calls(), 0);
}

// ============================================================================
// HTTP CONNECT tunnel
// ============================================================================

#[tokio::test]
async fn test_dial_http_through_tunnel() {
    let server = Arc::new(Server::new());
    server.register(arith_service()).unwrap();

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((conn, _)) = listener.accept().await else {
                return;
            };
            let server = server.clone();
            tokio::spawn(async move {
                let _ = server.serve_http(conn).await;
            });
        }
    });

    let client = Client::x_dial(&format!("http@{addr}"), ConnectOption::default())
        .await
        .expect("dial_http failed");
    let sum: i32 = client
        .call(&Context::new(), "Arith.Sum", &Args { num1: 5, num2: 6 })
        .await
        .unwrap();
    assert_eq!(sum, 11);
}

// ============================================================================
// Cluster: unicast and broadcast
// ============================================================================

#[tokio::test]
async fn test_cluster_round_robin_hits_both_servers() {
    let server_a = Arc::new(Server::new());
    server_a.register(arith_service()).unwrap();
    let server_b = Arc::new(Server::new());
    server_b.register(arith_service()).unwrap();

    let (addr_a, _h1) = spawn_tcp_server(server_a.clone()).await.unwrap();
    let (addr_b, _h2) = spawn_tcp_server(server_b.clone()).await.unwrap();

    let cluster = ClusterClient::new(
        MultiServerDiscovery::new(vec![addr_a, addr_b]),
        SelectMode::RoundRobin,
        ConnectOption::default(),
    );

    for i in 0..4 {
        let sum: i32 = cluster
            .call(&Context::new(), "Arith.Sum", &Args { num1: i, num2: 1 })
            .await
            .unwrap();
        assert_eq!(sum, i + 1);
    }

    let calls = |server: &Arc<Server>| {
        server
            .service("Arith")
            .unwrap()
            .lookup("Sum")
            .unwrap()
            .num_calls()
    };
    assert_eq!(calls(&server_a), 2);
    assert_eq!(calls(&server_b), 2);

    cluster.close().await;
}

#[tokio::test]
async fn test_broadcast_collects_first_reply() {
    let server_a = Arc::new(Server::new());
    server_a.register(arith_service()).unwrap();
    let server_b = Arc::new(Server::new());
    server_b.register(arith_service()).unwrap();

    let (addr_a, _h1) = spawn_tcp_server(server_a).await.unwrap();
    let (addr_b, _h2) = spawn_tcp_server(server_b).await.unwrap();

    let cluster = ClusterClient::new(
        MultiServerDiscovery::new(vec![addr_a, addr_b]),
        SelectMode::Random,
        ConnectOption::default(),
    );

    let reply: Option<i32> = cluster
        .broadcast(&Context::new(), "Arith.Sum", &Args { num1: 2, num2: 3 })
        .await
        .unwrap();
    assert_eq!(reply, Some(5));

    cluster.close().await;
}

#[tokio::test]
async fn test_broadcast_returns_first_error() {
    // One healthy-but-slow server and one that fails immediately.
    let slow = Arc::new(Server::new());
    slow.register(
        Service::new("Flaky").method("Probe", |_: Args| async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            Ok(1i32)
        }),
    )
    .unwrap();
    let failing = Arc::new(Server::new());
    failing
        .register(
            Service::new("Flaky")
                .method("Probe", |_: Args| async move { Err::<i32, _>(Error::remote("boom")) }),
        )
        .unwrap();

    let (addr_slow, _h1) = spawn_tcp_server(slow).await.unwrap();
    let (addr_failing, _h2) = spawn_tcp_server(failing).await.unwrap();

    let cluster = ClusterClient::new(
        MultiServerDiscovery::new(vec![addr_slow, addr_failing]),
        SelectMode::Random,
        ConnectOption::default(),
    );

    let err = cluster
        .broadcast::<Args, i32>(&Context::new(), "Flaky.Probe", &Args { num1: 0, num2: 0 })
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "boom");

    cluster.close().await;
}

// ============================================================================
// Registry and heartbeats
// ============================================================================

async fn spawn_registry(timeout: Duration) -> String {
    let registry = Arc::new(Registry::new(timeout));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(registry.serve(listener));
    format!("http://{addr}{}", geerpc::DEFAULT_REGISTRY_PATH)
}

#[tokio::test]
async fn test_registry_lists_heartbeating_servers_sorted() {
    let registry_url = spawn_registry(Duration::from_secs(60)).await;

    let _hb_b = start_heartbeat(&registry_url, "tcp@127.0.0.1:9002", None)
        .await
        .unwrap();
    let _hb_a = start_heartbeat(&registry_url, "tcp@127.0.0.1:9001", None)
        .await
        .unwrap();

    let discovery = RegistryDiscovery::new(&registry_url, Duration::from_millis(1));
    let servers = discovery.get_all().await.unwrap();
    assert_eq!(servers, vec!["tcp@127.0.0.1:9001", "tcp@127.0.0.1:9002"]);
}

#[tokio::test]
async fn test_registry_expires_silent_servers() {
    let registry_url = spawn_registry(Duration::from_millis(300)).await;

    let hb_live = start_heartbeat(&registry_url, "tcp@live", Some(Duration::from_millis(100)))
        .await
        .unwrap();
    let hb_dead = start_heartbeat(&registry_url, "tcp@dead", Some(Duration::from_millis(100)))
        .await
        .unwrap();

    let discovery = RegistryDiscovery::new(&registry_url, Duration::from_millis(1));
    let mut servers = discovery.get_all().await.unwrap();
    servers.sort();
    assert_eq!(servers, vec!["tcp@dead", "tcp@live"]);

    // Silence one server and wait past the registry timeout.
    hb_dead.abort();
    tokio::time::sleep(Duration::from_millis(500)).await;

    let servers = discovery.get_all().await.unwrap();
    assert_eq!(servers, vec!["tcp@live"]);

    hb_live.abort();
}

#[tokio::test]
async fn test_registry_rejects_heartbeat_without_address() {
    let registry_url = spawn_registry(Duration::from_secs(60)).await;

    let response = reqwest::Client::new()
        .post(&registry_url)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::INTERNAL_SERVER_ERROR);

    let response = reqwest::Client::new()
        .get(&registry_url)
        .send()
        .await
        .unwrap();
    let servers = response
        .headers()
        .get("X-Geerpc-Servers")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("missing");
    assert_eq!(servers, "");
}

// ============================================================================
// Shutdown
// ============================================================================

#[tokio::test]
async fn test_close_then_call_is_shutdown() {
    let client = arith_pair(ConnectOption::default()).await;

    let sum: i32 = client
        .call(&Context::new(), "Arith.Sum", &Args { num1: 1, num2: 1 })
        .await
        .unwrap();
    assert_eq!(sum, 2);

    client.close().await.unwrap();
    assert!(!client.is_available());

    let err = client
        .call::<Args, i32>(&Context::new(), "Arith.Sum", &Args { num1: 1, num2: 1 })
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Shutdown));
}
