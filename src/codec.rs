use std::io;

use bytes::BytesMut;
use log::*;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader, BufWriter, ReadHalf, WriteHalf};

use crate::error::*;
use crate::net::Conn;

/// Per-frame header. Field names and declaration order are part of the wire
/// contract for both codecs.
#[derive(Debug, Default, Clone, PartialEq, serde_derive::Serialize, serde_derive::Deserialize)]
pub struct Header {
    /// format: "Service.Method"
    pub service_method: String,
    /// sequence number chosen by client
    pub seq: u64,
    /// error message, empty if no error
    pub error: String,
}

/// Body codec negotiated in the handshake option.
#[derive(
    Debug, Default, Clone, Copy, PartialEq, Eq, serde_derive::Serialize, serde_derive::Deserialize,
)]
pub enum CodecKind {
    #[default]
    #[serde(rename = "application/gob")]
    Gob,
    #[serde(rename = "application/json")]
    Json,
}

/// Value encoding strategy. The codec is immutable; if it needs changing
/// (like setting up a cipher) it should have inner mutability.
pub trait Codec {
    fn encode<T: Serialize>(&self, v: &T) -> Result<Vec<u8>, ()>;

    fn decode<'a, T: Deserialize<'a>>(&self, buf: &'a [u8]) -> Result<T, ()>;
}

/// Self-describing binary codec: msgpack with field names embedded in every
/// encoded value, so a reader needs no schema beyond the value itself.
#[derive(Default, Clone, Copy)]
pub struct GobCodec();

impl Codec for GobCodec {
    #[inline(always)]
    fn encode<T: Serialize>(&self, v: &T) -> Result<Vec<u8>, ()> {
        match rmp_serde::encode::to_vec_named(v) {
            Ok(buf) => return Ok(buf),
            Err(e) => {
                error!("gob codec encode error: {:?}", e);
                return Err(());
            }
        }
    }

    #[inline(always)]
    fn decode<'a, T: Deserialize<'a>>(&self, buf: &'a [u8]) -> Result<T, ()> {
        match rmp_serde::decode::from_slice::<T>(buf) {
            Err(e) => {
                warn!("gob codec decode error: {:?}", e);
                return Err(());
            }
            Ok(s) => return Ok(s),
        }
    }
}

/// Textual codec: one JSON value per chunk.
#[derive(Default, Clone, Copy)]
pub struct JsonCodec();

impl Codec for JsonCodec {
    #[inline(always)]
    fn encode<T: Serialize>(&self, v: &T) -> Result<Vec<u8>, ()> {
        match serde_json::to_vec(v) {
            Ok(buf) => return Ok(buf),
            Err(e) => {
                error!("json codec encode error: {:?}", e);
                return Err(());
            }
        }
    }

    #[inline(always)]
    fn decode<'a, T: Deserialize<'a>>(&self, buf: &'a [u8]) -> Result<T, ()> {
        match serde_json::from_slice::<T>(buf) {
            Err(e) => {
                warn!("json codec decode error: {:?}", e);
                return Err(());
            }
            Ok(s) => return Ok(s),
        }
    }
}

/// Runtime-selected codec, picked from the handshake option's kind.
#[derive(Clone, Copy)]
pub enum AnyCodec {
    Gob(GobCodec),
    Json(JsonCodec),
}

impl AnyCodec {
    #[inline]
    pub fn new(kind: CodecKind) -> Self {
        match kind {
            CodecKind::Gob => Self::Gob(GobCodec::default()),
            CodecKind::Json => Self::Json(JsonCodec::default()),
        }
    }
}

impl Codec for AnyCodec {
    #[inline(always)]
    fn encode<T: Serialize>(&self, v: &T) -> Result<Vec<u8>, ()> {
        match self {
            Self::Gob(c) => c.encode(v),
            Self::Json(c) => c.encode(v),
        }
    }

    #[inline(always)]
    fn decode<'a, T: Deserialize<'a>>(&self, buf: &'a [u8]) -> Result<T, ()> {
        match self {
            Self::Gob(c) => c.decode(buf),
            Self::Json(c) => c.decode(buf),
        }
    }
}

/// A chunk longer than this is treated as stream desync, not a real frame.
pub const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024;

/// Where a header read failed. `Transport` means nothing of the frame was
/// committed and the connection is simply gone; `Partial` means the length
/// prefix was already consumed but the header bytes were short or garbled,
/// so the peer is still there and may deserve a best-effort error reply.
#[derive(Debug)]
pub enum HeaderReadError {
    Transport(RpcError),
    Partial(RpcError),
}

impl HeaderReadError {
    #[inline]
    pub fn into_error(self) -> RpcError {
        match self {
            Self::Transport(e) => e,
            Self::Partial(e) => e,
        }
    }
}

type ConnReader = BufReader<ReadHalf<Box<dyn Conn>>>;
type ConnWriter = BufWriter<WriteHalf<Box<dyn Conn>>>;

/// Reading half of a connection's codec. Exactly one task owns this; all
/// frame reads of a connection are single-threaded through it.
pub struct CodecReader {
    codec: AnyCodec,
    r: ConnReader,
    head_buf: BytesMut,
}

impl CodecReader {
    pub fn new(r: ConnReader, codec: AnyCodec) -> Self {
        Self { codec, r, head_buf: BytesMut::with_capacity(256) }
    }

    #[inline]
    pub fn codec(&self) -> AnyCodec {
        self.codec
    }

    /// Read one chunk length, logging EOF at debug severity only.
    async fn read_chunk_len(&mut self) -> Result<usize, RpcError> {
        let mut len_buf = [0u8; 4];
        if let Err(e) = self.r.read_exact(&mut len_buf).await {
            if e.kind() == io::ErrorKind::UnexpectedEof {
                debug!("rpc codec: stream closed: {:?}", e);
            } else {
                warn!("rpc codec: read chunk len error: {:?}", e);
            }
            return Err(RPC_ERR_CLOSED);
        }
        let len = u32::from_be_bytes(len_buf);
        if len > MAX_FRAME_LEN {
            warn!("rpc codec: frame length {} exceeds limit", len);
            return Err(RPC_ERR_CLOSED);
        }
        Ok(len as usize)
    }

    pub async fn read_header(&mut self) -> Result<Header, HeaderReadError> {
        let len = match self.read_chunk_len().await {
            Ok(len) => len,
            Err(e) => return Err(HeaderReadError::Transport(e)),
        };
        self.head_buf.resize(len, 0);
        if let Err(e) = self.r.read_exact(&mut self.head_buf).await {
            debug!("rpc codec: read header chunk error: {:?}", e);
            return Err(HeaderReadError::Partial(RPC_ERR_CLOSED));
        }
        match self.codec.decode::<Header>(&self.head_buf) {
            Ok(h) => Ok(h),
            Err(()) => Err(HeaderReadError::Partial(RPC_ERR_BODY_DECODE)),
        }
    }

    /// Returns the raw body bytes; typed decoding happens at the call site
    /// because the reader does not know the reply type.
    pub async fn read_body(&mut self) -> Result<Vec<u8>, RpcError> {
        let len = self.read_chunk_len().await?;
        let mut buf = vec![0u8; len];
        if let Err(e) = self.r.read_exact(&mut buf).await {
            debug!("rpc codec: read body chunk error: {:?}", e);
            return Err(RPC_ERR_CLOSED);
        }
        Ok(buf)
    }
}

/// Writing half of a connection's codec. Callers serialize access with a
/// send lock; one `write` emits a full header+body frame and flushes.
pub struct CodecWriter {
    codec: AnyCodec,
    w: ConnWriter,
}

impl CodecWriter {
    pub fn new(w: ConnWriter, codec: AnyCodec) -> Self {
        Self { codec, w }
    }

    pub async fn write(&mut self, h: &Header, body: &[u8]) -> Result<(), RpcError> {
        let head = self.codec.encode(h).map_err(|_| RPC_ERR_ENCODE)?;
        if let Err(e) = self.write_frame(&head, body).await {
            warn!("rpc codec: write frame error: {:?}", e);
            let _ = self.w.shutdown().await;
            return Err(RPC_ERR_CLOSED);
        }
        Ok(())
    }

    async fn write_frame(&mut self, head: &[u8], body: &[u8]) -> io::Result<()> {
        self.w.write_all(&(head.len() as u32).to_be_bytes()).await?;
        self.w.write_all(head).await?;
        self.w.write_all(&(body.len() as u32).to_be_bytes()).await?;
        self.w.write_all(body).await?;
        self.w.flush().await
    }

    pub async fn close(&mut self) {
        let _ = self.w.shutdown().await;
    }
}

#[cfg(test)]
mod tests {

    use super::*;

    #[test]
    fn test_header_roundtrip() {
        let h = Header { service_method: "Foo.Sum".to_string(), seq: 7, error: String::new() };
        for codec in [AnyCodec::new(CodecKind::Gob), AnyCodec::new(CodecKind::Json)] {
            let buf = codec.encode(&h).expect("encode header");
            let back: Header = codec.decode(&buf).expect("decode header");
            assert_eq!(back, h);
        }
    }

    #[test]
    fn test_codec_kind_names() {
        assert_eq!(serde_json::to_string(&CodecKind::Gob).unwrap(), "\"application/gob\"");
        assert_eq!(serde_json::to_string(&CodecKind::Json).unwrap(), "\"application/json\"");
    }

    #[test]
    fn test_gob_self_describing() {
        #[derive(serde_derive::Serialize)]
        struct Named {
            inode: u64,
            offset: i64,
        }
        let buf = GobCodec::default().encode(&Named { inode: 3, offset: -1 }).unwrap();
        // field names must travel with the value
        let s = String::from_utf8_lossy(&buf);
        assert!(s.contains("inode"));
        assert!(s.contains("offset"));
    }
}
