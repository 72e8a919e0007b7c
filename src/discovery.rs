//! Service discovery: an address set plus a selection policy.
//!
//! Two variants share the [`Discovery`] contract: a static set maintained by
//! hand, and a registry-backed set that refreshes itself over HTTP when its
//! staleness window runs out.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::debug;

use crate::error::{Error, Result};
use crate::registry::SERVERS_HEADER;

/// Load-balancing policy for [`Discovery::get`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectMode {
    /// Uniform pick over the current set.
    Random,
    /// Monotonic cursor modulo the set size.
    RoundRobin,
}

/// Contract shared by all discovery variants.
#[async_trait]
pub trait Discovery: Send + Sync {
    /// Pulls fresh state from an external source; may be a no-op.
    async fn refresh(&self) -> Result<()>;

    /// Replaces the address set.
    async fn update(&self, servers: Vec<String>) -> Result<()>;

    /// Selects one address under the given policy.
    async fn get(&self, mode: SelectMode) -> Result<String>;

    /// Returns a snapshot copy of the current set; later updates do not
    /// affect it.
    async fn get_all(&self) -> Result<Vec<String>>;
}

struct AddrSet {
    servers: Vec<String>,
    index: usize,
}

/// Discovery over a hand-maintained server list.
pub struct MultiServerDiscovery {
    inner: Mutex<AddrSet>,
}

impl MultiServerDiscovery {
    pub fn new(servers: Vec<String>) -> Self {
        // Random initial cursor so processes don't walk the list in lockstep.
        let index = fastrand::usize(..usize::MAX / 2);
        Self {
            inner: Mutex::new(AddrSet { servers, index }),
        }
    }

    fn select(&self, mode: SelectMode) -> Result<String> {
        let mut set = self.inner.lock().unwrap();
        let n = set.servers.len();
        if n == 0 {
            return Err(Error::NoAvailableServers);
        }
        match mode {
            SelectMode::Random => Ok(set.servers[fastrand::usize(..n)].clone()),
            SelectMode::RoundRobin => {
                let addr = set.servers[set.index % n].clone();
                set.index = (set.index + 1) % n;
                Ok(addr)
            }
        }
    }

    fn snapshot(&self) -> Vec<String> {
        self.inner.lock().unwrap().servers.clone()
    }

    fn replace(&self, servers: Vec<String>) {
        self.inner.lock().unwrap().servers = servers;
    }
}

#[async_trait]
impl Discovery for MultiServerDiscovery {
    async fn refresh(&self) -> Result<()> {
        Ok(())
    }

    async fn update(&self, servers: Vec<String>) -> Result<()> {
        self.replace(servers);
        Ok(())
    }

    async fn get(&self, mode: SelectMode) -> Result<String> {
        self.select(mode)
    }

    async fn get_all(&self) -> Result<Vec<String>> {
        Ok(self.snapshot())
    }
}

/// How long a fetched server list stays fresh before the next refresh.
pub const DEFAULT_UPDATE_WINDOW: Duration = Duration::from_secs(10);

/// Discovery backed by a registry endpoint.
///
/// `get` and `get_all` refresh first; a refresh inside the staleness window
/// is a no-op.
pub struct RegistryDiscovery {
    servers: MultiServerDiscovery,
    registry: String,
    window: Duration,
    last_update: Mutex<Option<Instant>>,
    http: reqwest::Client,
}

impl RegistryDiscovery {
    /// Creates a discovery pulling from `registry`. A zero `window` selects
    /// [`DEFAULT_UPDATE_WINDOW`].
    pub fn new(registry: impl Into<String>, window: Duration) -> Self {
        let window = if window.is_zero() {
            DEFAULT_UPDATE_WINDOW
        } else {
            window
        };
        Self {
            servers: MultiServerDiscovery::new(Vec::new()),
            registry: registry.into(),
            window,
            last_update: Mutex::new(None),
            http: reqwest::Client::new(),
        }
    }

    async fn refresh_if_stale(&self) -> Result<()> {
        {
            let last_update = self.last_update.lock().unwrap();
            if let Some(at) = *last_update {
                if at.elapsed() < self.window {
                    return Ok(());
                }
            }
        }
        debug!(registry = %self.registry, "refreshing servers from registry");
        let response = self.http.get(&self.registry).send().await?;
        let servers: Vec<String> = response
            .headers()
            .get(SERVERS_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(|list| {
                list.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_owned)
                    .collect()
            })
            .unwrap_or_default();
        self.servers.replace(servers);
        *self.last_update.lock().unwrap() = Some(Instant::now());
        Ok(())
    }

    fn stamp(&self) {
        *self.last_update.lock().unwrap() = Some(Instant::now());
    }
}

#[async_trait]
impl Discovery for RegistryDiscovery {
    async fn refresh(&self) -> Result<()> {
        self.refresh_if_stale().await
    }

    async fn update(&self, servers: Vec<String>) -> Result<()> {
        self.servers.replace(servers);
        self.stamp();
        Ok(())
    }

    async fn get(&self, mode: SelectMode) -> Result<String> {
        self.refresh_if_stale().await?;
        self.servers.select(mode)
    }

    async fn get_all(&self) -> Result<Vec<String>> {
        self.refresh_if_stale().await?;
        Ok(self.servers.snapshot())
    }
}
