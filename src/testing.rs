//! Test helpers: wiring clients to servers without real networking, or over
//! ephemeral TCP ports when addresses matter.

use std::sync::Arc;

use tokio::io::{duplex, DuplexStream};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use crate::client::Client;
use crate::error::Result;
use crate::message::ConnectOption;
use crate::server::Server;

/// Creates a pair of connected in-memory streams.
pub fn create_pipe(buffer_size: usize) -> (DuplexStream, DuplexStream) {
    duplex(buffer_size)
}

/// Creates a pair of connected in-memory streams with a default buffer size.
pub fn create_pipe_default() -> (DuplexStream, DuplexStream) {
    create_pipe(64 * 1024)
}

/// Connects a client to `server` over an in-memory pipe.
///
/// Returns the client plus the handle of the connection-serving task.
pub async fn connect_pair(
    server: Arc<Server>,
    option: ConnectOption,
) -> Result<(Client, JoinHandle<()>)> {
    let (client_io, server_io) = create_pipe_default();
    let handle = tokio::spawn(async move {
        let _ = server.serve_conn(server_io).await;
    });
    let client = Client::with_transport(client_io, option).await?;
    Ok((client, handle))
}

/// Binds `server` to an ephemeral TCP port and starts its accept loop.
///
/// Returns the `tcp@host:port` address the server can be dialed at.
pub async fn spawn_tcp_server(server: Arc<Server>) -> Result<(String, JoinHandle<()>)> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let handle = tokio::spawn(server.accept(listener));
    Ok((format!("tcp@{addr}"), handle))
}
