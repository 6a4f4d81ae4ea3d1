use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::error::{Result, RpcError};
use crate::registry::SERVERS_HEADER;

/// Selection algorithm for [`LoadBalance::get_one`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Random,
    RoundRobin,
}

/// A server list with pluggable refresh and selection.
#[async_trait]
pub trait LoadBalance: Send + Sync {
    /// Pulls the server list from a remote source. A no-op for
    /// locally-managed lists.
    async fn refresh(&self) -> Result<()>;

    /// Replaces the full server list locally.
    fn update(&self, servers: Vec<String>);

    /// Selects one server, failing with `NoServers` when the list is
    /// empty.
    async fn get_one(&self, mode: Mode) -> Result<String>;

    /// Snapshot copy of the full list.
    async fn get_all(&self) -> Result<Vec<String>>;
}

struct Roster {
    servers: Vec<String>,
    index: usize,
    rng: StdRng,
}

/// Load balancer over a locally-maintained server list.
pub struct StaticLoadBalancer {
    roster: Mutex<Roster>,
}

impl StaticLoadBalancer {
    pub fn new(servers: Vec<String>) -> Self {
        Self {
            roster: Mutex::new(Roster {
                servers,
                index: 0,
                // Entropy seeding keeps instances from picking the same
                // random sequence.
                rng: StdRng::from_entropy(),
            }),
        }
    }

    fn pick(&self, mode: Mode) -> Result<String> {
        let mut roster = self.roster.lock();
        let count = roster.servers.len();
        if count == 0 {
            return Err(RpcError::NoServers);
        }

        match mode {
            Mode::Random => {
                let chosen = roster.rng.gen_range(0..count);
                Ok(roster.servers[chosen].clone())
            }
            Mode::RoundRobin => {
                let chosen = roster.index % count;
                roster.index = (roster.index + 1) % count;
                Ok(roster.servers[chosen].clone())
            }
        }
    }

    fn snapshot(&self) -> Vec<String> {
        self.roster.lock().servers.clone()
    }

    fn replace(&self, servers: Vec<String>) {
        self.roster.lock().servers = servers;
    }
}

#[async_trait]
impl LoadBalance for StaticLoadBalancer {
    async fn refresh(&self) -> Result<()> {
        Ok(())
    }

    fn update(&self, servers: Vec<String>) {
        self.replace(servers);
    }

    async fn get_one(&self, mode: Mode) -> Result<String> {
        self.pick(mode)
    }

    async fn get_all(&self) -> Result<Vec<String>> {
        Ok(self.snapshot())
    }
}

/// How long a fetched server list stays fresh before the next
/// `get_one`/`get_all` triggers another registry round trip.
pub const DEFAULT_REFRESH_TIMEOUT: Duration = Duration::from_secs(10);

/// Load balancer that discovers servers from a registry endpoint.
pub struct RegistryLoadBalancer {
    registry_url: String,
    refresh_timeout: Duration,
    http: reqwest::Client,
    servers: StaticLoadBalancer,
    last_update: Mutex<Option<Instant>>,
}

impl RegistryLoadBalancer {
    /// A zero `refresh_timeout` selects [`DEFAULT_REFRESH_TIMEOUT`].
    pub fn new(registry_url: impl Into<String>, refresh_timeout: Duration) -> Self {
        let refresh_timeout = if refresh_timeout.is_zero() {
            DEFAULT_REFRESH_TIMEOUT
        } else {
            refresh_timeout
        };
        Self {
            registry_url: registry_url.into(),
            refresh_timeout,
            http: reqwest::Client::new(),
            servers: StaticLoadBalancer::new(Vec::new()),
            last_update: Mutex::new(None),
        }
    }

    fn is_fresh(&self) -> bool {
        self.last_update
            .lock()
            .is_some_and(|at| at + self.refresh_timeout > Instant::now())
    }
}

#[async_trait]
impl LoadBalance for RegistryLoadBalancer {
    async fn refresh(&self) -> Result<()> {
        if self.is_fresh() {
            return Ok(());
        }

        let response = self
            .http
            .get(&self.registry_url)
            .send()
            .await
            .map_err(|e| RpcError::Registry(e.to_string()))?;

        let servers = response
            .headers()
            .get(SERVERS_HEADER)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|server| !server.is_empty())
            .map(str::to_string)
            .collect();

        self.servers.replace(servers);
        *self.last_update.lock() = Some(Instant::now());
        Ok(())
    }

    fn update(&self, servers: Vec<String>) {
        self.servers.replace(servers);
        *self.last_update.lock() = Some(Instant::now());
    }

    async fn get_one(&self, mode: Mode) -> Result<String> {
        self.refresh().await?;
        self.servers.pick(mode)
    }

    async fn get_all(&self) -> Result<Vec<String>> {
        self.refresh().await?;
        Ok(self.servers.snapshot())
    }
}
