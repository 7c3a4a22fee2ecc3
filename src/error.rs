use std::fmt;

// All "rpc_" prefix tags are internal errors of RpcError::Rpc().
// The tag string is what travels in Header.error, so keep them stable.
pub const ERR_INVALID_HANDSHAKE: &'static str = "rpc_invalid_handshake";
pub const ERR_UNKNOWN_CODEC: &'static str = "rpc_unknown_codec";
pub const ERR_UNKNOWN_SERVICE: &'static str = "rpc_unknown_service";
pub const ERR_UNKNOWN_METHOD: &'static str = "rpc_unknown_method";
pub const ERR_ILL_SERVICE_METHOD: &'static str = "rpc_ill_formed_service_method";
pub const ERR_BODY_DECODE: &'static str = "rpc_body_decode_failed";
pub const ERR_ENCODE: &'static str = "rpc_encode_failed";
pub const ERR_HANDLER_TIMEOUT: &'static str = "rpc_handler_timeout";
pub const ERR_CLOSED: &'static str = "rpc_transport_closed";
pub const ERR_SHUTDOWN: &'static str = "rpc_client_shutdown";
pub const ERR_CONNECT_TIMEOUT: &'static str = "rpc_connect_timeout";
pub const ERR_CALL_CANCELLED: &'static str = "rpc_call_cancelled";
pub const ERR_DISCOVERY_EMPTY: &'static str = "rpc_discovery_empty";
pub const ERR_DISCOVERY_UNKNOWN_SERVER: &'static str = "rpc_discovery_unknown_server";
pub const ERR_DISCOVERY_SERVER_EXISTS: &'static str = "rpc_discovery_server_exists";
pub const ERR_DISCOVERY_INVALID_WEIGHT: &'static str = "rpc_discovery_invalid_weight";
pub const ERR_HTTP_HIJACK: &'static str = "rpc_http_hijack_failed";
pub const ERR_SERVICE_DUP: &'static str = "rpc_service_already_defined";
pub const ERR_BAD_ADDR: &'static str = "rpc_bad_address";

pub const RPC_ERR_CLOSED: RpcError = RpcError::Rpc(ERR_CLOSED);
pub const RPC_ERR_SHUTDOWN: RpcError = RpcError::Rpc(ERR_SHUTDOWN);
pub const RPC_ERR_ENCODE: RpcError = RpcError::Rpc(ERR_ENCODE);
pub const RPC_ERR_BODY_DECODE: RpcError = RpcError::Rpc(ERR_BODY_DECODE);
pub const RPC_ERR_CONNECT_TIMEOUT: RpcError = RpcError::Rpc(ERR_CONNECT_TIMEOUT);
pub const RPC_ERR_CALL_CANCELLED: RpcError = RpcError::Rpc(ERR_CALL_CANCELLED);
pub const RPC_ERR_HANDLER_TIMEOUT: RpcError = RpcError::Rpc(ERR_HANDLER_TIMEOUT);
pub const RPC_ERR_DISCOVERY_EMPTY: RpcError = RpcError::Rpc(ERR_DISCOVERY_EMPTY);

/// Error value observed by callers. `Rpc` carries a local tag from the
/// constants above, `Remote` carries whatever string arrived in a reply
/// header (a remote tag, or a handler's own message).
#[derive(Clone, Debug, PartialEq)]
pub enum RpcError {
    Rpc(&'static str),
    Remote(String),
}

impl RpcError {
    /// The string that goes into `Header.error` on the wire.
    #[inline]
    pub fn tag(&self) -> &str {
        match self {
            Self::Rpc(s) => s,
            Self::Remote(s) => s.as_str(),
        }
    }
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rpc(s) => write!(f, "error: {}", s),
            Self::Remote(s) => write!(f, "remote error: {}", s),
        }
    }
}

impl std::error::Error for RpcError {}
