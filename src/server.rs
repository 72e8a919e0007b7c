//! RPC server: accept loop, handshake, concurrent dispatch.
//!
//! Each connection gets one reader task. Requests are dispatched onto their
//! own tasks; responses go out through a shared writer lock so frames never
//! interleave. Dispatch failures (unknown service or method) are reported in
//! the response header and leave the connection usable; anything that breaks
//! framing tears the connection down.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use bytes::Bytes;
use futures::future::BoxFuture;
use tokio::io::{self, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tokio::time;
use tracing::{debug, error, info, warn};

use crate::codec::{CodecKind, CodecReader, CodecWriter};
use crate::error::{Error, Result};
use crate::message::{self, Header, CONNECTED_STATUS, DEFAULT_RPC_PATH, MAGIC_NUMBER};
use crate::service::Service;

/// RPC server holding the registered service table.
#[derive(Default)]
pub struct Server {
    services: RwLock<HashMap<String, Arc<Service>>>,
}

impl Server {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a service. Service names must be exported (start with an
    /// uppercase letter) and unique.
    pub fn register(&self, service: Service) -> Result<()> {
        if !service
            .name()
            .chars()
            .next()
            .is_some_and(|c| c.is_uppercase())
        {
            return Err(Error::InvalidServiceName(service.name().to_owned()));
        }
        let mut services = self.services.write().unwrap();
        if services.contains_key(service.name()) {
            return Err(Error::ServiceAlreadyDefined(service.name().to_owned()));
        }
        info!(service = service.name(), "register service");
        services.insert(service.name().to_owned(), Arc::new(service));
        Ok(())
    }

    /// Looks up a registered service, mostly for introspection in tests and
    /// debug tooling.
    pub fn service(&self, name: &str) -> Option<Arc<Service>> {
        self.services.read().unwrap().get(name).cloned()
    }

    /// Splits `Service.Method` at the last dot and resolves both parts.
    fn resolve(&self, service_method: &str) -> Result<(Arc<Service>, String)> {
        let (service_name, method_name) = service_method
            .rsplit_once('.')
            .ok_or_else(|| Error::MalformedServiceMethod(service_method.to_owned()))?;
        let service = self
            .service(service_name)
            .ok_or_else(|| Error::ServiceNotFound(service_name.to_owned()))?;
        if service.lookup(method_name).is_none() {
            return Err(Error::MethodNotFound(method_name.to_owned()));
        }
        Ok((service, method_name.to_owned()))
    }

    /// Accepts connections until the listener fails, serving each on its own
    /// task.
    pub async fn accept(self: Arc<Self>, listener: TcpListener) {
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    debug!(%peer, "accepted connection");
                    let server = self.clone();
                    tokio::spawn(async move {
                        if let Err(e) = server.serve_conn(stream).await {
                            warn!(error = %e, %peer, "connection ended with error");
                        }
                    });
                }
                Err(e) => {
                    error!(error = %e, "accept failed");
                    return;
                }
            }
        }
    }

    /// Serves one connection: handshake, then the request loop.
    pub async fn serve_conn<T>(&self, mut conn: T) -> Result<()>
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (option, leftover) = message::read_option(&mut conn).await.map_err(|e| {
            warn!(error = %e, "handshake failed");
            e
        })?;
        if option.magic_number != MAGIC_NUMBER {
            warn!(magic = option.magic_number, "rejecting bad magic number");
            return Err(Error::InvalidOption(format!(
                "bad magic number {:#x}",
                option.magic_number
            )));
        }
        let Some(kind) = CodecKind::from_name(&option.codec_type) else {
            warn!(codec = %option.codec_type, "rejecting unknown codec");
            return Err(Error::UnknownCodec(option.codec_type));
        };
        debug!(codec = kind.name(), "connection negotiated");

        let handle_timeout = option.handle_timeout;
        let (read_half, write_half) = io::split(conn);
        let mut reader = CodecReader::with_initial(read_half, kind, &leftover);
        let writer = Arc::new(Mutex::new(CodecWriter::new(write_half, kind)));
        let mut handlers = JoinSet::new();

        loop {
            let header = match reader.read_header().await {
                Ok(Some(header)) => header,
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "reading request header failed");
                    break;
                }
            };
            // Resolve before the body read so an unknown method still drains
            // its body off the wire.
            let resolved = self.resolve(&header.service_method);
            let body = match reader.read_body().await {
                Ok(body) => body,
                Err(e) => {
                    warn!(error = %e, "reading request body failed");
                    break;
                }
            };
            match resolved {
                Ok((service, method)) => {
                    let invocation = match service.lookup(&method) {
                        Some(entry) => entry.invoke(body, kind),
                        // Unregistering is not a thing; resolve just checked.
                        None => continue,
                    };
                    handlers.spawn(handle_request(
                        header,
                        invocation,
                        writer.clone(),
                        kind,
                        handle_timeout,
                    ));
                }
                Err(e) => {
                    debug!(error = %e, service_method = %header.service_method, "dispatch failed");
                    let response = Header {
                        error: e.to_string(),
                        ..header
                    };
                    if let Err(e) = write_response(&writer, &response, &placeholder_body(kind)).await
                    {
                        warn!(error = %e, "writing dispatch error failed");
                        break;
                    }
                }
            }
        }

        // Let in-flight handlers finish and flush before the codec closes.
        while handlers.join_next().await.is_some() {}
        let mut writer = writer.lock().await;
        let _ = writer.close().await;
        Ok(())
    }

    /// Serves a connection that starts with an HTTP CONNECT tunnel request:
    /// answers the sentinel status for the RPC path and hands the hijacked
    /// socket to [`Server::serve_conn`].
    pub async fn serve_http<T>(&self, mut conn: T) -> Result<()>
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let request_line = read_http_request_head(&mut conn).await?;
        let mut parts = request_line.split_whitespace();
        let method = parts.next().unwrap_or("");
        let path = parts.next().unwrap_or("");
        if method != "CONNECT" || path != DEFAULT_RPC_PATH {
            conn.write_all(b"HTTP/1.0 405 Method Not Allowed\r\n\r\n")
                .await?;
            conn.flush().await?;
            return Err(Error::UnexpectedHttpResponse(request_line));
        }
        conn.write_all(format!("HTTP/1.0 {CONNECTED_STATUS}\r\n\r\n").as_bytes())
            .await?;
        conn.flush().await?;
        self.serve_conn(conn).await
    }
}

/// Supervises one request: races the invocation against the handle timeout
/// and writes exactly one response.
async fn handle_request<W>(
    header: Header,
    invocation: BoxFuture<'static, Result<Bytes>>,
    writer: Arc<Mutex<CodecWriter<W>>>,
    kind: CodecKind,
    handle_timeout: Duration,
) where
    W: AsyncWrite + Send + Unpin,
{
    // The invocation runs on its own task so a timeout does not abort it;
    // its late result simply has nobody left to write it.
    let invocation = tokio::spawn(invocation);
    let outcome = if handle_timeout.is_zero() {
        Some(invocation.await)
    } else {
        tokio::select! {
            result = invocation => Some(result),
            _ = time::sleep(handle_timeout) => None,
        }
    };

    let (response, body) = match outcome {
        Some(Ok(Ok(reply))) => (header, reply),
        Some(Ok(Err(e))) => (
            Header {
                error: e.to_string(),
                ..header
            },
            placeholder_body(kind),
        ),
        Some(Err(join_error)) => (
            Header {
                error: format!("handler panicked: {join_error}"),
                ..header
            },
            placeholder_body(kind),
        ),
        None => (
            Header {
                error: Error::HandleTimeout(handle_timeout).to_string(),
                ..header
            },
            placeholder_body(kind),
        ),
    };
    if let Err(e) = write_response(&writer, &response, &body).await {
        warn!(error = %e, seq = response.seq, "writing response failed");
    }
}

async fn write_response<W>(
    writer: &Mutex<CodecWriter<W>>,
    header: &Header,
    body: &[u8],
) -> Result<()>
where
    W: AsyncWrite + Send + Unpin,
{
    let mut writer = writer.lock().await;
    writer.write(header, body).await
}

/// Opaque body accompanying an error header.
fn placeholder_body(kind: CodecKind) -> Bytes {
    kind.encode(&()).unwrap_or_default()
}

/// Reads an HTTP request head byte by byte (so no tunnel bytes are consumed)
/// and returns its request line.
async fn read_http_request_head<T: AsyncRead + Unpin>(conn: &mut T) -> Result<String> {
    let mut head = Vec::with_capacity(128);
    loop {
        head.push(conn.read_u8().await?);
        if head.ends_with(b"\r\n\r\n") || head.ends_with(b"\n\n") {
            break;
        }
        if head.len() > 4096 {
            return Err(Error::InvalidOption("http request head too large".into()));
        }
    }
    let text = String::from_utf8_lossy(&head);
    Ok(text.lines().next().unwrap_or("").trim().to_owned())
}
