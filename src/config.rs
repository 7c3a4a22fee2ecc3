use std::time::Duration;

use serde_derive::{Deserialize, Serialize};

use crate::codec::CodecKind;

/// Required sentinel of the handshake line. A mismatch closes the connection
/// without a reply.
pub const MAGIC_NUMBER: u32 = 0x3bef5c;

/// Path served by the HTTP hijack acceptor, see [crate::http].
pub const DEFAULT_RPC_PATH: &'static str = "/_gorpc_";
/// Path of the read-only service dump.
pub const DEFAULT_DEBUG_PATH: &'static str = "/debug/gorpc";
/// Path of the registry endpoint, see [crate::registry].
pub const DEFAULT_REGISTRY_PATH: &'static str = "/_gorpc_/registry";

/// Per-connection options, sent once by the client as a single JSON line
/// before any frame, regardless of the negotiated body codec.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RpcOption {
    pub magic: u32,
    pub codec_kind: CodecKind,
    /// Bounds dial setup (OS connect plus handshake). Zero means unbounded.
    pub connect_timeout: Duration,
    /// Server-side deadline for producing a reply. Zero means unbounded.
    pub handle_timeout: Duration,
}

impl Default for RpcOption {
    fn default() -> Self {
        Self {
            magic: MAGIC_NUMBER,
            codec_kind: CodecKind::Gob,
            connect_timeout: Duration::from_secs(10),
            handle_timeout: Duration::from_secs(0),
        }
    }
}

impl RpcOption {
    pub fn with_codec(kind: CodecKind) -> Self {
        Self { codec_kind: kind, ..Default::default() }
    }
}
