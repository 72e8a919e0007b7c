//! Error types for geerpc.
//!
//! One error enum covers the whole crate: connection-level failures that
//! poison a connection, per-request failures that travel back in a response
//! header, and discovery/registry failures returned straight to the caller.

use std::time::Duration;

use thiserror::Error;

/// Errors that can occur in geerpc operations.
#[derive(Error, Debug)]
pub enum Error {
    /// The connection handshake could not be decoded or carried a bad magic number.
    #[error("invalid connect option: {0}")]
    InvalidOption(String),

    /// The handshake named a codec nobody registered.
    #[error("invalid codec type {0:?}")]
    UnknownCodec(String),

    /// Dialing did not produce a ready client within the connection timeout.
    #[error("connect timeout: expect within {0:?}")]
    ConnectTimeout(Duration),

    /// The CONNECT tunnel handshake got something other than the expected status.
    #[error("unexpected HTTP response: {0}")]
    UnexpectedHttpResponse(String),

    /// An rpc address did not match the `protocol@addr` form.
    #[error("malformed rpc address {0:?}, expect protocol@addr")]
    BadAddress(String),

    /// The client is closing or already shut down.
    #[error("connection is shut down")]
    Shutdown,

    /// The connection died with in-flight calls; each pending call gets this.
    #[error("connection lost: {0}")]
    ConnectionLost(String),

    /// The caller's context was cancelled before the call completed.
    #[error("rpc call failed: {0}")]
    CallFailed(String),

    /// The server reported an error for this call in the response header.
    #[error("{0}")]
    Remote(String),

    /// A service with this name is already registered.
    #[error("service already defined: {0}")]
    ServiceAlreadyDefined(String),

    /// Service names must be exported (start with an uppercase letter).
    #[error("invalid service name {0:?}")]
    InvalidServiceName(String),

    /// The request named no `Service.Method` pair.
    #[error("service/method request ill-formed: {0}")]
    MalformedServiceMethod(String),

    /// No registered service matches the request.
    #[error("can't find service {0}")]
    ServiceNotFound(String),

    /// The service exists but has no such method.
    #[error("can't find method {0}")]
    MethodNotFound(String),

    /// The handler did not produce its reply within the server's handle timeout.
    #[error("request handle timeout: expect within {0:?}")]
    HandleTimeout(Duration),

    /// Discovery holds no addresses to select from.
    #[error("no available servers")]
    NoAvailableServers,

    /// Talking to the registry over HTTP failed.
    #[error("registry request failed: {0}")]
    Registry(#[from] reqwest::Error),

    /// A frame exceeded the maximum allowed size.
    #[error("frame size {0} exceeds maximum {1}")]
    FrameTooLarge(usize, usize),

    /// Binary (de)serialization failed.
    #[error("binary codec: {0}")]
    Bincode(#[from] bincode::Error),

    /// JSON (de)serialization failed.
    #[error("json codec: {0}")]
    Json(#[from] serde_json::Error),

    /// IO error during read/write operations.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Returns true if this error means the client cannot take new calls.
    pub fn is_shutdown(&self) -> bool {
        matches!(self, Error::Shutdown | Error::ConnectionLost(_))
    }

    /// Returns true if this error is one of the timeout kinds.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::ConnectTimeout(_) | Error::HandleTimeout(_))
    }

    /// Creates a remote error from a server-reported message.
    pub fn remote(msg: impl Into<String>) -> Self {
        Error::Remote(msg.into())
    }
}

/// Result type alias using geerpc's [`Error`].
pub type Result<T> = std::result::Result<T, Error>;
