//! Frame codec and the named serialization formats.
//!
//! After the handshake, every message on a connection is one frame: a 4-byte
//! little-endian u32 length prefix followed by the payload. Headers and
//! bodies are separate frames; a `(header, body)` pair is always written as
//! one atomic unit. The payload encoding is chosen per connection by the
//! `codec_type` name in the handshake.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use futures::StreamExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio_util::codec::{Decoder, Encoder, FramedRead};

use crate::error::{Error, Result};
use crate::message::Header;

/// Maximum frame payload size (10MB).
pub const MAX_FRAME_SIZE: usize = 10_000_000;

/// Length of the size prefix in bytes.
const SIZE_PREFIX_LEN: usize = 4;

/// Length-delimited framing: 4-byte little-endian u32 prefix + payload.
///
/// Zero-length frames are legal; the binary encoding of the placeholder body
/// accompanying an error header is empty.
#[derive(Debug, Default, Clone)]
pub struct FrameCodec;

impl Decoder for FrameCodec {
    type Item = Bytes;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>> {
        if src.len() < SIZE_PREFIX_LEN {
            return Ok(None);
        }

        let mut size_bytes = [0u8; SIZE_PREFIX_LEN];
        size_bytes.copy_from_slice(&src[..SIZE_PREFIX_LEN]);
        let frame_size = u32::from_le_bytes(size_bytes) as usize;

        if frame_size > MAX_FRAME_SIZE {
            return Err(Error::FrameTooLarge(frame_size, MAX_FRAME_SIZE));
        }

        let total_size = SIZE_PREFIX_LEN + frame_size;
        if src.len() < total_size {
            src.reserve(total_size - src.len());
            return Ok(None);
        }

        src.advance(SIZE_PREFIX_LEN);
        Ok(Some(src.split_to(frame_size).freeze()))
    }
}

impl<'a> Encoder<&'a [u8]> for FrameCodec {
    type Error = Error;

    fn encode(&mut self, item: &'a [u8], dst: &mut BytesMut) -> Result<()> {
        if item.len() > MAX_FRAME_SIZE {
            return Err(Error::FrameTooLarge(item.len(), MAX_FRAME_SIZE));
        }
        dst.reserve(SIZE_PREFIX_LEN + item.len());
        dst.put_u32_le(item.len() as u32);
        dst.put_slice(item);
        Ok(())
    }
}

/// Serialization formats selectable by name in the connection handshake.
///
/// The name appears literally in the handshake `codec_type`; names nobody
/// registered fail the connection with [`Error::UnknownCodec`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecKind {
    /// Self-describing binary encoding of any serde shape. The default.
    Bincode,
    /// JSON encoding, mostly useful for debugging with a packet dump.
    Json,
}

impl CodecKind {
    /// Resolves a handshake codec name.
    pub fn from_name(name: &str) -> Option<CodecKind> {
        match name {
            "application/bincode" => Some(CodecKind::Bincode),
            "application/json" => Some(CodecKind::Json),
            _ => None,
        }
    }

    /// The name this codec goes by in the handshake.
    pub const fn name(self) -> &'static str {
        match self {
            CodecKind::Bincode => "application/bincode",
            CodecKind::Json => "application/json",
        }
    }

    /// Encodes a value into frame payload bytes.
    pub fn encode<T: Serialize + ?Sized>(self, value: &T) -> Result<Bytes> {
        match self {
            CodecKind::Bincode => Ok(Bytes::from(bincode::serialize(value)?)),
            CodecKind::Json => Ok(Bytes::from(serde_json::to_vec(value)?)),
        }
    }

    /// Decodes a value out of frame payload bytes.
    pub fn decode<T: DeserializeOwned>(self, bytes: &[u8]) -> Result<T> {
        match self {
            CodecKind::Bincode => Ok(bincode::deserialize(bytes)?),
            CodecKind::Json => Ok(serde_json::from_slice(bytes)?),
        }
    }
}

/// Read half of a connection codec.
pub struct CodecReader<R> {
    framed: FramedRead<R, FrameCodec>,
    kind: CodecKind,
}

impl<R: AsyncRead + Unpin> CodecReader<R> {
    pub fn new(reader: R, kind: CodecKind) -> Self {
        Self::with_initial(reader, kind, &[])
    }

    /// Creates a reader seeded with bytes already pulled off the transport
    /// while locating the end of the handshake value.
    pub fn with_initial(reader: R, kind: CodecKind, initial: &[u8]) -> Self {
        let mut framed = FramedRead::new(reader, FrameCodec);
        if !initial.is_empty() {
            framed.read_buffer_mut().extend_from_slice(initial);
        }
        Self { framed, kind }
    }

    pub fn kind(&self) -> CodecKind {
        self.kind
    }

    /// Reads the next header. `Ok(None)` is a clean end of stream; a header
    /// that does not decode poisons the connection.
    pub async fn read_header(&mut self) -> Result<Option<Header>> {
        match self.framed.next().await {
            Some(Ok(frame)) => Ok(Some(self.kind.decode(&frame)?)),
            Some(Err(e)) => Err(e),
            None => Ok(None),
        }
    }

    /// Reads the body frame that must follow every header.
    ///
    /// Callers that have nowhere to put the body simply drop the returned
    /// bytes. End of stream between a header and its body is an error.
    pub async fn read_body(&mut self) -> Result<Bytes> {
        match self.framed.next().await {
            Some(Ok(frame)) => Ok(frame),
            Some(Err(e)) => Err(e),
            None => Err(Error::Io(std::io::ErrorKind::UnexpectedEof.into())),
        }
    }
}

/// Write half of a connection codec.
///
/// Lives behind a mutex on both client and server so that `(header, body)`
/// pairs from concurrent producers never interleave on the wire.
pub struct CodecWriter<W> {
    writer: W,
    kind: CodecKind,
    buf: BytesMut,
}

impl<W: AsyncWrite + Unpin> CodecWriter<W> {
    pub fn new(writer: W, kind: CodecKind) -> Self {
        Self {
            writer,
            kind,
            buf: BytesMut::new(),
        }
    }

    pub fn kind(&self) -> CodecKind {
        self.kind
    }

    /// Writes one `(header, body)` pair and flushes it as a single unit.
    pub async fn write(&mut self, header: &Header, body: &[u8]) -> Result<()> {
        let header_bytes = self.kind.encode(header)?;
        self.buf.clear();
        let mut framer = FrameCodec;
        framer.encode(&header_bytes[..], &mut self.buf)?;
        framer.encode(body, &mut self.buf)?;
        self.writer.write_all(&self.buf).await?;
        self.writer.flush().await?;
        Ok(())
    }

    /// Shuts the write half down; the peer sees a clean end of stream.
    pub async fn close(&mut self) -> Result<()> {
        self.writer.shutdown().await?;
        Ok(())
    }
}
