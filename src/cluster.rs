//! Cluster client: load-balanced unicast and broadcast over discovered
//! servers.
//!
//! Wraps a [`Discovery`] and a cache of one [`Client`] per address. Unicast
//! picks an address by policy and delegates; broadcast fans out to every
//! known address on a derived cancellable context.

use std::collections::HashMap;
use std::sync::Mutex as StdMutex;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::debug;

use crate::client::Client;
use crate::context::Context;
use crate::discovery::{Discovery, SelectMode};
use crate::error::Result;
use crate::message::ConnectOption;

/// Client over a whole cluster of servers.
pub struct ClusterClient<D: Discovery> {
    discovery: D,
    mode: SelectMode,
    option: ConnectOption,
    // Never held across dialing or calls; looked up, then released.
    clients: Mutex<HashMap<String, Client>>,
}

struct BroadcastOutcome<R> {
    error: Option<crate::error::Error>,
    reply: Option<R>,
}

impl<D: Discovery> ClusterClient<D> {
    pub fn new(discovery: D, mode: SelectMode, option: ConnectOption) -> Self {
        Self {
            discovery,
            mode,
            option,
            clients: Mutex::new(HashMap::new()),
        }
    }

    pub fn discovery(&self) -> &D {
        &self.discovery
    }

    /// Closes and evicts every cached client.
    pub async fn close(&self) {
        let drained: Vec<(String, Client)> = self.clients.lock().await.drain().collect();
        for (addr, client) in drained {
            debug!(%addr, "closing cached client");
            let _ = client.close().await;
        }
    }

    /// Returns the cached client for `addr`, evicting and redialing if the
    /// cached one went unavailable.
    async fn client_for(&self, addr: &str) -> Result<Client> {
        let stale = {
            let mut clients = self.clients.lock().await;
            match clients.get(addr) {
                Some(client) if client.is_available() => return Ok(client.clone()),
                Some(_) => clients.remove(addr),
                None => None,
            }
        };
        if let Some(client) = stale {
            let _ = client.close().await;
        }

        let dialed = Client::x_dial(addr, self.option.clone()).await?;

        let mut clients = self.clients.lock().await;
        let cached = clients
            .entry(addr.to_owned())
            .or_insert_with(|| dialed.clone())
            .clone();
        drop(clients);
        // A concurrent dial may have won the slot; ours is surplus then.
        if !Client::same_connection(&cached, &dialed) {
            let _ = dialed.close().await;
        }
        Ok(cached)
    }

    async fn call_addr<A, R>(
        &self,
        addr: &str,
        ctx: &Context,
        service_method: &str,
        args: &A,
    ) -> Result<R>
    where
        A: Serialize,
        R: DeserializeOwned,
    {
        let client = self.client_for(addr).await?;
        client.call(ctx, service_method, args).await
    }

    /// Calls one server chosen by the configured selection policy.
    pub async fn call<A, R>(&self, ctx: &Context, service_method: &str, args: &A) -> Result<R>
    where
        A: Serialize,
        R: DeserializeOwned,
    {
        let addr = self.discovery.get(self.mode).await?;
        self.call_addr(&addr, ctx, service_method, args).await
    }

    /// Calls every known server concurrently.
    ///
    /// The first error cancels the remaining in-flight calls through a
    /// derived context and is returned once every target has settled. The
    /// first successful reply is kept; `Ok(None)` means there was no target
    /// to produce one.
    pub async fn broadcast<A, R>(
        &self,
        ctx: &Context,
        service_method: &str,
        args: &A,
    ) -> Result<Option<R>>
    where
        A: Serialize,
        R: DeserializeOwned,
    {
        let servers = self.discovery.get_all().await?;
        let ctx = ctx.child();
        let outcome = StdMutex::new(BroadcastOutcome::<R> {
            error: None,
            reply: None,
        });

        futures::future::join_all(servers.iter().map(|addr| {
            let ctx = ctx.clone();
            let outcome = &outcome;
            async move {
                let result: Result<R> = self.call_addr(addr, &ctx, service_method, args).await;
                let mut outcome = outcome.lock().unwrap();
                match result {
                    Err(e) => {
                        if outcome.error.is_none() {
                            outcome.error = Some(e);
                            // Abort whatever is still in flight.
                            ctx.cancel();
                        }
                    }
                    Ok(reply) => {
                        if outcome.reply.is_none() {
                            outcome.reply = Some(reply);
                        }
                    }
                }
            }
        }))
        .await;

        let outcome = outcome.into_inner().unwrap();
        match outcome.error {
            Some(e) => Err(e),
            None => Ok(outcome.reply),
        }
    }
}
