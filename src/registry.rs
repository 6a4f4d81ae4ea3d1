use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::error::{Result, RpcError};

/// Header carrying one server address on a heartbeat POST.
pub const SERVER_HEADER: &str = "X-Gingle-Rpc-Server";
/// Header carrying the comma-separated live server list on a GET.
pub const SERVERS_HEADER: &str = "X-Gingle-Rpc-Servers";

/// Default mount path for the registry endpoint.
pub const DEFAULT_REGISTRY_PATH: &str = "/gingle/registry";
/// Default interval between heartbeats.
pub const DEFAULT_HEARTBEAT_PERIOD: Duration = Duration::from_secs(60);

/// In-memory liveness registry. A server is alive while its latest
/// heartbeat is younger than the timeout; a zero timeout never expires.
pub struct Registry {
    timeout: Duration,
    servers: Mutex<HashMap<String, Instant>>,
}

impl Registry {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            servers: Mutex::new(HashMap::new()),
        }
    }

    /// Registers an address or refreshes its heartbeat.
    pub fn register_server(&self, addr: &str) {
        self.servers.lock().insert(addr.to_string(), Instant::now());
    }

    /// The sorted list of live addresses. Expired entries are evicted
    /// on the way.
    pub fn alive_servers(&self) -> Vec<String> {
        let mut servers = self.servers.lock();
        servers.retain(|_, start_at| self.timeout.is_zero() || start_at.elapsed() < self.timeout);

        let mut addrs: Vec<String> = servers.keys().cloned().collect();
        addrs.sort();
        addrs
    }

    /// The registry as an HTTP router mounted at
    /// [`DEFAULT_REGISTRY_PATH`]: GET lists live servers in the
    /// [`SERVERS_HEADER`] header, POST heartbeats the address in
    /// [`SERVER_HEADER`], anything else is 405.
    pub fn router(self: Arc<Self>) -> Router {
        Router::new()
            .route(DEFAULT_REGISTRY_PATH, get(list_servers).post(heartbeat))
            .with_state(self)
    }

    /// Serves the registry on a bound listener until the task is
    /// dropped.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        if let Ok(addr) = listener.local_addr() {
            info!(%addr, "registry listening");
        }
        axum::serve(listener, self.router()).await.map_err(RpcError::Io)
    }
}

async fn list_servers(State(registry): State<Arc<Registry>>) -> impl IntoResponse {
    let servers = registry.alive_servers().join(",");
    ([(SERVERS_HEADER, servers)], StatusCode::OK)
}

async fn heartbeat(State(registry): State<Arc<Registry>>, headers: HeaderMap) -> StatusCode {
    let addr = headers
        .get(SERVER_HEADER)
        .and_then(|value| value.to_str().ok())
        .filter(|addr| !addr.is_empty());

    match addr {
        Some(addr) => {
            registry.register_server(addr);
            StatusCode::OK
        }
        None => StatusCode::BAD_REQUEST,
    }
}

/// Sends one heartbeat POST for `addr` to the registry.
pub async fn heartbeat_once(registry_url: &str, addr: &str) -> Result<()> {
    let response = reqwest::Client::new()
        .post(registry_url)
        .header(SERVER_HEADER, addr)
        .send()
        .await
        .map_err(|e| RpcError::Registry(e.to_string()))?;

    if !response.status().is_success() {
        return Err(RpcError::Registry(format!(
            "heartbeat rejected with status {}",
            response.status()
        )));
    }
    Ok(())
}

/// Heartbeats immediately and then every `period` (zero selects
/// [`DEFAULT_HEARTBEAT_PERIOD`]) until a post fails, then stops.
pub fn start_heartbeat(
    registry_url: impl Into<String>,
    addr: impl Into<String>,
    period: Duration,
) -> JoinHandle<()> {
    let registry_url = registry_url.into();
    let addr = addr.into();
    let period = if period.is_zero() { DEFAULT_HEARTBEAT_PERIOD } else { period };

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        loop {
            // The first tick completes immediately, so the first POST
            // goes out right away.
            ticker.tick().await;
            if let Err(e) = heartbeat_once(&registry_url, &addr).await {
                warn!("heartbeat for {addr} failed, stopping: {e}");
                break;
            }
        }
    })
}
