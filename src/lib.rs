//! Geerpc - Clustered RPC Framework
//!
//! This crate provides a client/server RPC framework over byte-stream
//! transports, with bidirectional multiplexing of many outstanding calls on
//! a single connection, plus a registry and discovery layer that turn the
//! point-to-point RPC into a clustered service with load balancing and
//! broadcast.
//!
//! # Features
//!
//! - **Multiplexed calls**: many in-flight calls per connection, correlated
//!   by sequence number; responses may return in any order
//! - **Pluggable codecs**: binary by default, JSON by handshake name
//! - **Three timeout domains**: dial/handshake, per-call cancellation, and a
//!   server-side per-request handle timeout
//! - **Cluster layer**: registry heartbeats, pull-based discovery, random or
//!   round-robin selection, fan-out broadcast
//! - **Transport agnostic**: works with TCP, Unix sockets, or any
//!   AsyncRead/AsyncWrite pair
//!
//! # Quick Start
//!
//! ## Server
//!
//! ```rust,ignore
//! use geerpc::{Server, Service};
//! use std::sync::Arc;
//!
//! let server = Arc::new(Server::new());
//! server.register(
//!     Service::new("Arith")
//!         .method("Sum", |args: Args| async move { Ok(args.num1 + args.num2) }),
//! )?;
//!
//! let listener = tokio::net::TcpListener::bind("127.0.0.1:8080").await?;
//! server.accept(listener).await;
//! ```
//!
//! ## Client
//!
//! ```rust,ignore
//! use geerpc::{Client, ConnectOption, Context};
//!
//! let client = Client::dial("tcp", "127.0.0.1:8080", ConnectOption::default()).await?;
//! let sum: i32 = client
//!     .call(&Context::new(), "Arith.Sum", &Args { num1: 1, num2: 2 })
//!     .await?;
//! ```
//!
//! # Wire Format
//!
//! A connection opens with one JSON-encoded handshake value (magic number,
//! codec name, timeouts) with no length prefix. Everything after it is
//! `(Header, Body)` pairs in the negotiated codec, each value framed as a
//! 4-byte little-endian u32 length prefix plus payload; a pair is always
//! written as one atomic unit.

pub mod client;
pub mod cluster;
pub mod codec;
pub mod context;
pub mod discovery;
pub mod error;
pub mod message;
pub mod registry;
pub mod server;
pub mod service;
pub mod testing;

// Re-exports for convenience.
pub use client::{Call, Client};
pub use cluster::ClusterClient;
pub use codec::{CodecKind, CodecReader, CodecWriter, MAX_FRAME_SIZE};
pub use context::Context;
pub use discovery::{Discovery, MultiServerDiscovery, RegistryDiscovery, SelectMode};
pub use error::{Error, Result};
pub use message::{ConnectOption, Header, CONNECTED_STATUS, DEFAULT_RPC_PATH, MAGIC_NUMBER};
pub use registry::{start_heartbeat, Registry, DEFAULT_REGISTRY_PATH};
pub use server::Server;
pub use service::{MethodEntry, Service};

// Re-export async_trait for custom Discovery implementations.
pub use async_trait::async_trait;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::client::{Call, Client};
    pub use crate::cluster::ClusterClient;
    pub use crate::codec::CodecKind;
    pub use crate::context::Context;
    pub use crate::discovery::{Discovery, MultiServerDiscovery, RegistryDiscovery, SelectMode};
    pub use crate::error::{Error, Result};
    pub use crate::message::ConnectOption;
    pub use crate::server::Server;
    pub use crate::service::Service;

    pub use async_trait::async_trait;
}
