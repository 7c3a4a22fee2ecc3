//! Cluster front-end: wraps a [Discovery] source with a selection policy,
//! caches one [Client] per endpoint and fans calls out to the pool.

mod discovery;
mod hash;

pub use discovery::{Discovery, GoRegistryDiscovery, MultiServerDiscovery, SelectMode};
pub use hash::ConsistentHash;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::*;
use serde::{de::DeserializeOwned, Serialize};
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tokio::time::{timeout, Duration};

use crate::client::Client;
use crate::codec::{AnyCodec, Codec};
use crate::config::RpcOption;
use crate::error::*;

/// Routes unary calls to one endpoint picked by the selection mode and
/// broadcasts to all endpoints with first-error / first-success semantics.
/// Dialed clients are cached per address and re-dialed when no longer
/// available; `close` closes the cache and makes the front-end unusable.
pub struct XClient<D: Discovery> {
    d: D,
    mode: SelectMode,
    opt: RpcOption,
    clients: Mutex<HashMap<String, Arc<Client>>>,
    closed: AtomicBool,
}

impl<D: Discovery> XClient<D> {
    pub fn new(d: D, mode: SelectMode, opt: RpcOption) -> Self {
        Self { d, mode, opt, clients: Mutex::new(HashMap::new()), closed: AtomicBool::new(false) }
    }

    #[inline]
    pub fn discovery(&self) -> &D {
        &self.d
    }

    /// Close every cached client and mark the front-end unusable.
    pub async fn close(&self) {
        self.closed.store(true, Ordering::Release);
        let mut cache = self.clients.lock().await;
        for (addr, client) in cache.drain() {
            trace!("xclient: closing cached client for {}", addr);
            let _ = client.close().await;
        }
    }

    async fn dial_cached(&self, rpc_addr: &str) -> Result<Arc<Client>, RpcError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(RPC_ERR_SHUTDOWN);
        }
        let mut cache = self.clients.lock().await;
        if let Some(client) = cache.get(rpc_addr) {
            if client.is_available() {
                return Ok(client.clone());
            }
            // present but dead; drop it and re-dial
            let client = cache.remove(rpc_addr).unwrap();
            let _ = client.close().await;
        }
        let client = Client::dial_any(rpc_addr, self.opt).await?;
        cache.insert(rpc_addr.to_string(), client.clone());
        Ok(client)
    }

    /// Unary call routed by the configured selection mode.
    pub async fn call<A, R>(&self, service_method: &str, args: &A) -> Result<R, RpcError>
    where
        A: Serialize,
        R: DeserializeOwned,
    {
        let addr = self.d.get(self.mode).await?;
        let client = self.dial_cached(&addr).await?;
        client.call(service_method, args).await
    }

    /// As [XClient::call], bounded by a deadline.
    pub async fn call_timeout<A, R>(
        &self, service_method: &str, args: &A, d: Duration,
    ) -> Result<R, RpcError>
    where
        A: Serialize,
        R: DeserializeOwned,
    {
        let addr = self.d.get(self.mode).await?;
        let client = self.dial_cached(&addr).await?;
        client.call_timeout(service_method, args, d).await
    }

    /// Invoke one method on every endpoint known to discovery.
    ///
    /// Children run in parallel; the first failure cancels the in-flight
    /// remainder. The first successful reply is kept, and the first error
    /// encountered (if any) is what the caller gets.
    pub async fn broadcast<A, R>(&self, service_method: &str, args: &A) -> Result<R, RpcError>
    where
        A: Serialize,
        R: DeserializeOwned,
    {
        let servers = self.d.get_all().await?;
        if servers.is_empty() {
            return Err(RPC_ERR_DISCOVERY_EMPTY);
        }
        let codec = AnyCodec::new(self.opt.codec_kind);
        let body = codec.encode(args).map_err(|_| RPC_ERR_ENCODE)?;
        let mut children: JoinSet<Result<Vec<u8>, RpcError>> = JoinSet::new();
        for addr in servers {
            match self.dial_cached(&addr).await {
                Ok(client) => {
                    let sm = service_method.to_string();
                    let body = body.clone();
                    children.spawn(async move { client.call_raw(&sm, body).await });
                }
                Err(e) => {
                    children.spawn(async move { Err(e) });
                }
            }
        }
        let mut first_err: Option<RpcError> = None;
        let mut reply: Option<Vec<u8>> = None;
        while let Some(joined) = children.join_next().await {
            match joined {
                Ok(Ok(bytes)) => {
                    if reply.is_none() {
                        reply = Some(bytes);
                    }
                }
                Ok(Err(e)) => {
                    if first_err.is_none() {
                        debug!("xclient: broadcast child failed: {}", e);
                        first_err = Some(e);
                        children.abort_all();
                    }
                }
                // aborted child
                Err(_) => {}
            }
        }
        if let Some(e) = first_err {
            return Err(e);
        }
        match reply {
            Some(bytes) => codec.decode::<R>(&bytes).map_err(|_| RPC_ERR_BODY_DECODE),
            None => Err(RPC_ERR_DISCOVERY_EMPTY),
        }
    }

    /// As [XClient::broadcast], bounded by a deadline. On expiry the
    /// in-flight children are cancelled promptly and the cancellation error
    /// is returned.
    pub async fn broadcast_timeout<A, R>(
        &self, service_method: &str, args: &A, d: Duration,
    ) -> Result<R, RpcError>
    where
        A: Serialize,
        R: DeserializeOwned,
    {
        match timeout(d, self.broadcast(service_method, args)).await {
            Ok(r) => r,
            // dropping the broadcast future aborts its JoinSet children
            Err(_) => Err(RPC_ERR_CALL_CANCELLED),
        }
    }
}
