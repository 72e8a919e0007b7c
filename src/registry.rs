//! Heartbeat registry: an HTTP endpoint that collects server heartbeats and
//! reports the live ones.
//!
//! Servers POST their address periodically; clients GET the sorted list of
//! addresses heard from within the registry timeout. Expired entries are
//! dropped during the GET scan.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::Result;

/// Path the registry endpoint is mounted at.
pub const DEFAULT_REGISTRY_PATH: &str = "/_geerpc_/registry";

/// How long a server stays listed without a heartbeat.
pub const DEFAULT_REGISTRY_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Response header carrying the comma-separated live server list.
pub const SERVERS_HEADER: &str = "x-geerpc-servers";

/// Request header carrying a heartbeating server's address.
pub const SERVER_HEADER: &str = "x-geerpc-server";

/// The registry state: address to last-heartbeat time.
pub struct Registry {
    timeout: Duration,
    servers: Mutex<HashMap<String, Instant>>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new(DEFAULT_REGISTRY_TIMEOUT)
    }
}

impl Registry {
    /// Creates a registry expiring servers after `timeout`. Zero disables
    /// expiry.
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            servers: Mutex::new(HashMap::new()),
        }
    }

    /// Inserts `addr` or refreshes its heartbeat time.
    pub fn put_server(&self, addr: &str) {
        self.servers
            .lock()
            .unwrap()
            .insert(addr.to_owned(), Instant::now());
    }

    /// Live addresses, sorted. Expired entries are dropped during the scan.
    pub fn alive_servers(&self) -> Vec<String> {
        let mut servers = self.servers.lock().unwrap();
        if !self.timeout.is_zero() {
            let timeout = self.timeout;
            servers.retain(|_, last_seen| last_seen.elapsed() < timeout);
        }
        let mut alive: Vec<String> = servers.keys().cloned().collect();
        alive.sort();
        alive
    }

    /// Router serving the registry endpoint at [`DEFAULT_REGISTRY_PATH`].
    /// Methods other than GET and POST get a 405.
    pub fn into_router(self: Arc<Self>) -> Router {
        Router::new()
            .route(
                DEFAULT_REGISTRY_PATH,
                get(list_servers).post(record_heartbeat),
            )
            .with_state(self)
    }

    /// Serves the registry on the given listener until the server fails.
    pub async fn serve(self: Arc<Self>, listener: tokio::net::TcpListener) -> Result<()> {
        info!(path = DEFAULT_REGISTRY_PATH, "registry listening");
        axum::serve(listener, self.into_router()).await?;
        Ok(())
    }
}

async fn list_servers(State(registry): State<Arc<Registry>>) -> impl IntoResponse {
    let alive = registry.alive_servers().join(",");
    ([(SERVERS_HEADER, alive)], ())
}

async fn record_heartbeat(State(registry): State<Arc<Registry>>, headers: HeaderMap) -> StatusCode {
    let addr = headers
        .get(SERVER_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|addr| !addr.is_empty());
    match addr {
        Some(addr) => {
            debug!(addr, "heartbeat");
            registry.put_server(addr);
            StatusCode::OK
        }
        None => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Announces `addr` to the registry now, then keeps heartbeating on a
/// background task until a heartbeat fails.
///
/// The first heartbeat is sent before this returns so a dead registry is
/// reported to the caller. `period` defaults to the registry timeout minus a
/// minute of margin.
pub async fn start_heartbeat(
    registry_url: impl Into<String>,
    addr: impl Into<String>,
    period: Option<Duration>,
) -> Result<JoinHandle<()>> {
    let registry_url = registry_url.into();
    let addr = addr.into();
    let period =
        period.unwrap_or_else(|| DEFAULT_REGISTRY_TIMEOUT.saturating_sub(Duration::from_secs(60)));

    let http = reqwest::Client::new();
    send_heartbeat(&http, &registry_url, &addr).await?;

    Ok(tokio::spawn(async move {
        loop {
            tokio::time::sleep(period).await;
            if let Err(e) = send_heartbeat(&http, &registry_url, &addr).await {
                warn!(error = %e, registry = %registry_url, "heartbeat failed, stopping");
                return;
            }
        }
    }))
}

async fn send_heartbeat(http: &reqwest::Client, registry_url: &str, addr: &str) -> Result<()> {
    debug!(addr, registry = %registry_url, "send heartbeat");
    http.post(registry_url)
        .header(SERVER_HEADER, addr)
        .send()
        .await?
        .error_for_status()?;
    Ok(())
}
