//! Wire header and connection handshake.
//!
//! Every framed message in both directions is a `(Header, Body)` pair. A
//! connection starts with a single JSON-encoded [`ConnectOption`] sent by the
//! client; it carries no length prefix and ends wherever the JSON value ends,
//! so any bytes read past it belong to the codec stream that follows.

use std::time::Duration;

use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::codec::CodecKind;
use crate::error::{Error, Result};

/// Constant every handshake must carry; anything else is rejected outright.
pub const MAGIC_NUMBER: u32 = 0x3bef5c;

/// Path used by the HTTP CONNECT tunnel.
pub const DEFAULT_RPC_PATH: &str = "/_geerpc_";

/// Status the server answers on a successful CONNECT.
pub const CONNECTED_STATUS: &str = "200 Connected to GeeRPC";

/// Default cap on the dial + handshake stage.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Upper bound on the handshake value; anything bigger is not a handshake.
const MAX_OPTION_SIZE: usize = 4096;

/// Header preceding every body on the wire, in both directions.
///
/// `error` is empty on success; when non-empty it carries the server-side
/// error message and the body is an opaque placeholder.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    pub service_method: String,
    pub seq: u64,
    pub error: String,
}

/// Connection handshake, sent once client to server at connection open.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectOption {
    pub magic_number: u32,
    /// Name of the codec framing everything after the handshake.
    pub codec_type: String,
    /// Client-side cap on dial + handshake; zero disables the cap.
    #[serde(default)]
    pub connection_timeout: Duration,
    /// Server-side cap on a single method invocation; zero disables the cap.
    #[serde(default)]
    pub handle_timeout: Duration,
}

impl Default for ConnectOption {
    fn default() -> Self {
        Self {
            magic_number: MAGIC_NUMBER,
            codec_type: CodecKind::Bincode.name().to_owned(),
            connection_timeout: DEFAULT_CONNECT_TIMEOUT,
            handle_timeout: Duration::ZERO,
        }
    }
}

impl ConnectOption {
    /// Selects the codec by kind.
    pub fn codec(mut self, kind: CodecKind) -> Self {
        self.codec_type = kind.name().to_owned();
        self
    }

    /// Sets the dial + handshake cap; zero disables it.
    pub fn connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = timeout;
        self
    }

    /// Sets the server-side per-request cap; zero disables it.
    pub fn handle_timeout(mut self, timeout: Duration) -> Self {
        self.handle_timeout = timeout;
        self
    }

    /// Forces the magic number and fills an unset codec with the default.
    pub(crate) fn normalized(mut self) -> Self {
        self.magic_number = MAGIC_NUMBER;
        if self.codec_type.is_empty() {
            self.codec_type = CodecKind::Bincode.name().to_owned();
        }
        self
    }
}

/// Writes the handshake value and flushes it.
pub(crate) async fn write_option<W>(writer: &mut W, option: &ConnectOption) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let encoded = serde_json::to_vec(option)?;
    writer.write_all(&encoded).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads the single JSON handshake value off the front of a connection.
///
/// Returns the option together with any bytes that were read past the end of
/// the JSON value; those belong to the codec stream and must be replayed into
/// its read buffer.
pub(crate) async fn read_option<R>(reader: &mut R) -> Result<(ConnectOption, Bytes)>
where
    R: AsyncRead + Unpin,
{
    let mut buf = BytesMut::with_capacity(256);
    loop {
        let mut values = serde_json::Deserializer::from_slice(&buf).into_iter::<ConnectOption>();
        match values.next() {
            Some(Ok(option)) => {
                let consumed = values.byte_offset();
                let leftover = buf.split_off(consumed).freeze();
                return Ok((option, leftover));
            }
            // Incomplete value so far; keep reading.
            Some(Err(e)) if e.is_eof() => {}
            Some(Err(e)) => return Err(Error::InvalidOption(e.to_string())),
            None => {}
        }
        if buf.len() >= MAX_OPTION_SIZE {
            return Err(Error::InvalidOption("handshake too large".into()));
        }
        if reader.read_buf(&mut buf).await? == 0 {
            return Err(Error::InvalidOption(
                "connection closed during handshake".into(),
            ));
        }
    }
}
