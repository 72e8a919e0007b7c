//! RPC client: many concurrent calls multiplexed over one connection.
//!
//! A [`Client`] owns one connection. Calls are registered into a pending
//! table under a strictly increasing sequence number, written to the wire
//! under a sending lock so header and body frames never interleave, and
//! completed by a background receive task that routes each response to its
//! call by sequence number. Responses may come back in any order.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{self, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
#[cfg(unix)]
use tokio::net::UnixStream;
use tokio::sync::{oneshot, Mutex};
use tokio::time;
use tracing::debug;

use crate::codec::{CodecKind, CodecReader, CodecWriter};
use crate::context::Context;
use crate::error::{Error, Result};
use crate::message::{self, ConnectOption, Header, CONNECTED_STATUS, DEFAULT_RPC_PATH};

type ReplySender = oneshot::Sender<Result<Bytes>>;
type BoxWriter = CodecWriter<Box<dyn AsyncWrite + Send + Unpin>>;

/// One in-flight request. Produced by [`Client::go`]; resolve it with
/// [`Call::wait`].
pub struct Call {
    seq: u64,
    service_method: String,
    kind: CodecKind,
    rx: oneshot::Receiver<Result<Bytes>>,
}

impl Call {
    /// Sequence number this call went out under.
    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn service_method(&self) -> &str {
        &self.service_method
    }

    /// Waits for the response and decodes the reply.
    pub async fn wait<R: DeserializeOwned>(self) -> Result<R> {
        match self.rx.await {
            Ok(Ok(body)) => self.kind.decode(&body),
            Ok(Err(e)) => Err(e),
            // Completion sender dropped without firing: the call was evicted.
            Err(_) => Err(Error::Shutdown),
        }
    }
}

struct State {
    seq: u64,
    pending: HashMap<u64, ReplySender>,
    /// Set by `close`; no new calls, the connection is winding down.
    closing: bool,
    /// Set by the receive task when the connection is gone.
    shutdown: bool,
}

struct Inner {
    kind: CodecKind,
    state: StdMutex<State>,
    // Held across codec writes. When both locks are needed, sending comes
    // first; state is never held across IO.
    sending: Mutex<BoxWriter>,
}

impl Inner {
    fn register_call(&self, tx: ReplySender) -> Result<u64> {
        let mut state = self.state.lock().unwrap();
        if state.closing || state.shutdown {
            return Err(Error::Shutdown);
        }
        let seq = state.seq;
        state.seq += 1;
        state.pending.insert(seq, tx);
        Ok(seq)
    }

    fn remove_call(&self, seq: u64) -> Option<ReplySender> {
        self.state.lock().unwrap().pending.remove(&seq)
    }

    /// Fails every pending call and refuses new ones. `cause` is `None` for
    /// a clean end of stream.
    async fn terminate(&self, cause: Option<Error>) {
        let _sending = self.sending.lock().await;
        let mut state = self.state.lock().unwrap();
        state.shutdown = true;
        let message = match &cause {
            Some(e) => e.to_string(),
            None if state.closing => String::new(),
            None => "connection closed by peer".to_owned(),
        };
        for (_, tx) in state.pending.drain() {
            let err = if message.is_empty() {
                Error::Shutdown
            } else {
                Error::ConnectionLost(message.clone())
            };
            let _ = tx.send(Err(err));
        }
    }
}

/// Handle to one RPC connection. Cheap to clone; all clones share the
/// connection and its pending table.
#[derive(Clone)]
pub struct Client {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client").finish_non_exhaustive()
    }
}

impl Client {
    /// Dials `address` over the named network (`"tcp"`, or `"unix"` where
    /// available) and performs the handshake.
    ///
    /// The connect and handshake stages are each capped by the option's
    /// `connection_timeout`; zero disables the cap. The socket is dropped on
    /// any failure.
    pub async fn dial(network: &str, address: &str, option: ConnectOption) -> Result<Client> {
        let option = option.normalized();
        match network {
            "tcp" => {
                let stream = connect_timeout(TcpStream::connect(address), &option).await?;
                Self::with_transport(stream, option).await
            }
            #[cfg(unix)]
            "unix" => {
                let stream = connect_timeout(UnixStream::connect(address), &option).await?;
                Self::with_transport(stream, option).await
            }
            other => Err(Error::BadAddress(format!("unsupported network {other:?}"))),
        }
    }

    /// Dials through an HTTP CONNECT tunnel, then proceeds as [`Client::dial`].
    pub async fn dial_http(network: &str, address: &str, option: ConnectOption) -> Result<Client> {
        let option = option.normalized();
        match network {
            "tcp" => {
                let stream = connect_timeout(TcpStream::connect(address), &option).await?;
                Self::with_http_tunnel(stream, option).await
            }
            other => Err(Error::BadAddress(format!(
                "http tunnel requires tcp, got {other:?}"
            ))),
        }
    }

    /// Dials a `protocol@addr` style address: `http@host:port` goes through
    /// the CONNECT tunnel over TCP, anything else is used as the network name
    /// for a plain dial.
    pub async fn x_dial(rpc_addr: &str, option: ConnectOption) -> Result<Client> {
        let (protocol, addr) = rpc_addr
            .split_once('@')
            .ok_or_else(|| Error::BadAddress(rpc_addr.to_owned()))?;
        match protocol {
            "http" => Self::dial_http("tcp", addr, option).await,
            network => Self::dial(network, addr, option).await,
        }
    }

    /// Builds a client over an already-connected transport. The handshake is
    /// capped by the option's `connection_timeout`.
    pub async fn with_transport<T>(transport: T, option: ConnectOption) -> Result<Client>
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let option = option.normalized();
        let kind = CodecKind::from_name(&option.codec_type)
            .ok_or_else(|| Error::UnknownCodec(option.codec_type.clone()))?;
        let timeout = option.connection_timeout;
        let handshake = Self::handshake(transport, option, kind);
        if timeout.is_zero() {
            handshake.await
        } else {
            // If the timer wins, the handshake future is dropped and the
            // socket closes with it.
            match time::timeout(timeout, handshake).await {
                Ok(result) => result,
                Err(_) => Err(Error::ConnectTimeout(timeout)),
            }
        }
    }

    async fn handshake<T>(mut transport: T, option: ConnectOption, kind: CodecKind) -> Result<Client>
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        message::write_option(&mut transport, &option).await?;

        let (read_half, write_half) = io::split(transport);
        let writer: BoxWriter = CodecWriter::new(Box::new(write_half), kind);
        let inner = Arc::new(Inner {
            kind,
            state: StdMutex::new(State {
                seq: 1,
                pending: HashMap::new(),
                closing: false,
                shutdown: false,
            }),
            sending: Mutex::new(writer),
        });

        let reader = CodecReader::new(read_half, kind);
        tokio::spawn(receive_loop(inner.clone(), reader));

        Ok(Client { inner })
    }

    async fn with_http_tunnel<T>(mut transport: T, option: ConnectOption) -> Result<Client>
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let connect = format!("CONNECT {DEFAULT_RPC_PATH} HTTP/1.0\n\n");
        transport.write_all(connect.as_bytes()).await?;
        transport.flush().await?;

        let status = read_http_status(&mut transport).await?;
        if status != CONNECTED_STATUS {
            return Err(Error::UnexpectedHttpResponse(status));
        }
        Self::with_transport(transport, option).await
    }

    /// Starts a call without waiting for its reply.
    ///
    /// Fails with [`Error::Shutdown`] once the client is closing or the
    /// connection is gone; a write failure evicts the registered call and is
    /// returned directly.
    pub async fn go<A: Serialize>(&self, service_method: &str, args: &A) -> Result<Call> {
        let body = self.inner.kind.encode(args)?;
        self.send(service_method, body).await
    }

    async fn send(&self, service_method: &str, body: Bytes) -> Result<Call> {
        let inner = &self.inner;
        let mut writer = inner.sending.lock().await;

        let (tx, rx) = oneshot::channel();
        let seq = inner.register_call(tx)?;
        let header = Header {
            service_method: service_method.to_owned(),
            seq,
            error: String::new(),
        };
        if let Err(e) = writer.write(&header, &body).await {
            // The receive task may have taken the call already; that race is
            // benign, whichever side finds the entry completes it.
            let _ = inner.remove_call(seq);
            return Err(e);
        }
        Ok(Call {
            seq,
            service_method: header.service_method,
            kind: inner.kind,
            rx,
        })
    }

    /// Calls `service_method` and waits for the reply or for `ctx`.
    ///
    /// On cancellation the pending entry is evicted and the response, if the
    /// server sends one later, is discarded by the receive task.
    pub async fn call<A, R>(&self, ctx: &Context, service_method: &str, args: &A) -> Result<R>
    where
        A: Serialize,
        R: DeserializeOwned,
    {
        let call = self.go(service_method, args).await?;
        let seq = call.seq();
        tokio::select! {
            _ = ctx.cancelled() => {
                let _ = self.inner.remove_call(seq);
                Err(Error::CallFailed("context cancelled".into()))
            }
            result = call.wait::<R>() => result,
        }
    }

    /// Closes the write half of the connection. Calls still pending complete
    /// when their responses arrive or when the peer closes the other half.
    ///
    /// Returns [`Error::Shutdown`] if close was already requested.
    pub async fn close(&self) -> Result<()> {
        {
            let mut state = self.inner.state.lock().unwrap();
            if state.closing {
                return Err(Error::Shutdown);
            }
            state.closing = true;
        }
        let mut writer = self.inner.sending.lock().await;
        writer.close().await
    }

    /// True while the client can still take new calls.
    pub fn is_available(&self) -> bool {
        let state = self.inner.state.lock().unwrap();
        !state.closing && !state.shutdown
    }

    pub(crate) fn same_connection(a: &Client, b: &Client) -> bool {
        Arc::ptr_eq(&a.inner, &b.inner)
    }
}

async fn receive_loop<R>(inner: Arc<Inner>, mut reader: CodecReader<R>)
where
    R: AsyncRead + Send + Unpin,
{
    let cause = loop {
        let header = match reader.read_header().await {
            Ok(Some(header)) => header,
            Ok(None) => break None,
            Err(e) => break Some(e),
        };
        match inner.remove_call(header.seq) {
            // No pending call: cancelled, or the send never finished. The
            // body still has to come off the wire.
            None => {
                debug!(seq = header.seq, "discarding response with no pending call");
                if let Err(e) = reader.read_body().await {
                    break Some(e);
                }
            }
            Some(tx) if !header.error.is_empty() => match reader.read_body().await {
                Ok(_) => {
                    let _ = tx.send(Err(Error::Remote(header.error)));
                }
                Err(e) => {
                    let message = e.to_string();
                    let _ = tx.send(Err(e));
                    break Some(Error::ConnectionLost(message));
                }
            },
            Some(tx) => match reader.read_body().await {
                Ok(body) => {
                    let _ = tx.send(Ok(body));
                }
                Err(e) => {
                    let message = e.to_string();
                    let _ = tx.send(Err(e));
                    break Some(Error::ConnectionLost(message));
                }
            },
        }
    };
    inner.terminate(cause).await;
}

async fn connect_timeout<F, T>(connect: F, option: &ConnectOption) -> Result<T>
where
    F: std::future::Future<Output = io::Result<T>>,
{
    let timeout = option.connection_timeout;
    if timeout.is_zero() {
        Ok(connect.await?)
    } else {
        match time::timeout(timeout, connect).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(Error::ConnectTimeout(timeout)),
        }
    }
}

/// Reads the CONNECT response head and returns the status portion of its
/// first line. Reads one byte at a time so no tunnel bytes are consumed.
async fn read_http_status<T: AsyncRead + Unpin>(transport: &mut T) -> Result<String> {
    let mut head = Vec::with_capacity(128);
    loop {
        head.push(transport.read_u8().await?);
        if head.ends_with(b"\r\n\r\n") || head.ends_with(b"\n\n") {
            break;
        }
        if head.len() > 4096 {
            return Err(Error::UnexpectedHttpResponse("response head too large".into()));
        }
    }
    let text = String::from_utf8_lossy(&head);
    let status_line = text.lines().next().unwrap_or("").trim();
    let status = status_line
        .strip_prefix("HTTP/1.0 ")
        .or_else(|| status_line.strip_prefix("HTTP/1.1 "))
        .unwrap_or(status_line);
    Ok(status.to_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::CodecKind;
    use tokio::io::duplex;

    // Speaks the server side of the protocol by hand over a duplex pipe.
    async fn fake_peer(stream: tokio::io::DuplexStream, respond: bool) {
        let (mut read_half, write_half) = io::split(stream);
        let (option, leftover) = message::read_option(&mut read_half).await.unwrap();
        let kind = CodecKind::from_name(&option.codec_type).unwrap();
        let mut reader = CodecReader::with_initial(read_half, kind, &leftover);
        let mut writer = CodecWriter::new(write_half, kind);

        while let Ok(Some(header)) = reader.read_header().await {
            let body = reader.read_body().await.unwrap();
            if respond {
                writer.write(&header, &body).await.unwrap();
            }
        }
    }

    #[tokio::test]
    async fn test_sequence_numbers_are_contiguous() {
        let (client_io, server_io) = duplex(64 * 1024);
        tokio::spawn(fake_peer(server_io, true));

        let client = Client::with_transport(client_io, ConnectOption::default())
            .await
            .unwrap();

        for expect in 1u64..=5 {
            let call = client.go("Echo.Echo", &expect).await.unwrap();
            assert_eq!(call.seq(), expect);
            let echoed: u64 = call.wait().await.unwrap();
            assert_eq!(echoed, expect);
        }
    }

    #[tokio::test]
    async fn test_close_rejects_new_calls() {
        let (client_io, server_io) = duplex(64 * 1024);
        tokio::spawn(fake_peer(server_io, true));

        let client = Client::with_transport(client_io, ConnectOption::default())
            .await
            .unwrap();
        assert!(client.is_available());

        client.close().await.unwrap();
        assert!(!client.is_available());
        assert!(matches!(client.close().await, Err(Error::Shutdown)));
        assert!(matches!(
            client.go("Echo.Echo", &1u64).await,
            Err(Error::Shutdown)
        ));
    }

    #[tokio::test]
    async fn test_peer_close_drains_pending() {
        let (client_io, server_io) = duplex(64 * 1024);
        // Peer that reads one request and hangs up without responding.
        tokio::spawn(async move {
            let (mut read_half, _write_half) = io::split(server_io);
            let (option, leftover) = message::read_option(&mut read_half).await.unwrap();
            let kind = CodecKind::from_name(&option.codec_type).unwrap();
            let mut reader = CodecReader::with_initial(read_half, kind, &leftover);
            let _ = reader.read_header().await;
            let _ = reader.read_body().await;
            // Both halves drop here, closing the pipe.
        });

        let client = Client::with_transport(client_io, ConnectOption::default())
            .await
            .unwrap();
        let call = client.go("Echo.Echo", &7u64).await.unwrap();
        let err = call.wait::<u64>().await.unwrap_err();
        assert!(matches!(err, Error::ConnectionLost(_)));
        assert!(!client.is_available());
    }

    #[tokio::test]
    async fn test_remote_error_header_completes_call() {
        let (client_io, server_io) = duplex(64 * 1024);
        tokio::spawn(async move {
            let (mut read_half, write_half) = io::split(server_io);
            let (option, leftover) = message::read_option(&mut read_half).await.unwrap();
            let kind = CodecKind::from_name(&option.codec_type).unwrap();
            let mut reader = CodecReader::with_initial(read_half, kind, &leftover);
            let mut writer = CodecWriter::new(write_half, kind);

            let mut header = reader.read_header().await.unwrap().unwrap();
            let _ = reader.read_body().await.unwrap();
            header.error = "boom".into();
            let placeholder = kind.encode(&()).unwrap();
            writer.write(&header, &placeholder).await.unwrap();
        });

        let client = Client::with_transport(client_io, ConnectOption::default())
            .await
            .unwrap();
        let err = client
            .go("Echo.Echo", &1u64)
            .await
            .unwrap()
            .wait::<u64>()
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "boom");
    }

    #[tokio::test]
    async fn test_cancelled_call_leaves_client_usable() {
        let (client_io, server_io) = duplex(64 * 1024);
        tokio::spawn(fake_peer(server_io, true));

        let client = Client::with_transport(client_io, ConnectOption::default())
            .await
            .unwrap();

        let ctx = Context::new();
        ctx.cancel();
        let err = client
            .call::<u64, u64>(&ctx, "Echo.Echo", &1)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::CallFailed(_)));

        // The next call on the same client still works.
        let echoed: u64 = client
            .call(&Context::new(), "Echo.Echo", &2)
            .await
            .unwrap();
        assert_eq!(echoed, 2);
    }

    #[tokio::test]
    async fn test_x_dial_rejects_malformed_address() {
        let err = Client::x_dial("127.0.0.1:9999", ConnectOption::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::BadAddress(_)));
    }

    #[tokio::test]
    async fn test_unknown_codec_name_rejected_before_io() {
        let (client_io, _server_io) = duplex(1024);
        let option = ConnectOption {
            codec_type: "application/gob".into(),
            ..ConnectOption::default()
        };
        let err = Client::with_transport(client_io, option).await.unwrap_err();
        assert!(matches!(err, Error::UnknownCodec(_)));
    }

    #[tokio::test]
    async fn test_http_tunnel_bad_status() {
        let (client_io, server_io) = duplex(1024);
        tokio::spawn(async move {
            let mut server_io = server_io;
            let mut buf = [0u8; 64];
            let _ = server_io.read(&mut buf).await.unwrap();
            server_io
                .write_all(b"HTTP/1.0 404 Not Found\r\n\r\n")
                .await
                .unwrap();
        });

        let err = Client::with_http_tunnel(client_io, ConnectOption::default())
            .await
            .unwrap_err();
        match err {
            Error::UnexpectedHttpResponse(status) => assert_eq!(status, "404 Not Found"),
            other => panic!("unexpected error: {other}"),
        }
    }
}
