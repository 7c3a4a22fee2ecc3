use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::Bytes;
use http_body_util::Full;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use log::*;
use tokio::net::TcpListener;
use tokio::time::interval;

use crate::error::*;

/// Response header listing live servers, comma-joined and sorted.
pub const X_GORPC_SERVERS: &'static str = "X-GoRPC-Servers";
/// Request header naming the server a heartbeat refreshes.
pub const X_GORPC_SERVER: &'static str = "X-GoRPC-Server";

/// Live-server TTL. A server whose last heartbeat is older is evicted.
pub const DEFAULT_REGISTRY_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// An HTTP endpoint aggregating live servers with TTL-based eviction.
///
/// GET answers an empty body with the [X_GORPC_SERVERS] header; POST with
/// the [X_GORPC_SERVER] header inserts or refreshes that address.
pub struct GoRegistry {
    timeout: Duration,
    servers: Mutex<HashMap<String, Instant>>,
}

impl GoRegistry {
    pub fn new(timeout: Duration) -> Arc<Self> {
        Arc::new(Self { timeout, servers: Mutex::new(HashMap::new()) })
    }

    pub fn default_instance() -> Arc<Self> {
        Self::new(DEFAULT_REGISTRY_TIMEOUT)
    }

    fn put_server(&self, addr: &str) {
        let mut servers = self.servers.lock().unwrap();
        servers.insert(addr.to_string(), Instant::now());
    }

    fn alive_servers(&self) -> Vec<String> {
        let mut servers = self.servers.lock().unwrap();
        let timeout = self.timeout;
        if !timeout.is_zero() {
            servers.retain(|_, start| start.elapsed() < timeout);
        }
        let mut alive: Vec<String> = servers.keys().cloned().collect();
        alive.sort();
        alive
    }

    async fn handle(
        self: Arc<Self>, req: Request<hyper::body::Incoming>,
    ) -> Result<Response<Full<Bytes>>, Infallible> {
        let resp = match req.method() {
            &Method::GET => Response::builder()
                .header(X_GORPC_SERVERS, self.alive_servers().join(","))
                .body(Full::default()),
            &Method::POST => match req.headers().get(X_GORPC_SERVER).and_then(|v| v.to_str().ok()) {
                Some(addr) if !addr.is_empty() => {
                    info!("registry: put server {}", addr);
                    self.put_server(addr);
                    Response::builder().body(Full::default())
                }
                _ => Response::builder()
                    .status(StatusCode::INTERNAL_SERVER_ERROR)
                    .body(Full::default()),
            },
            _ => Response::builder().status(StatusCode::METHOD_NOT_ALLOWED).body(Full::default()),
        };
        // builder with static parts cannot fail
        Ok(resp.unwrap())
    }

    /// Serve the registry endpoint on a TCP listener until accept fails.
    /// Requests on any path reach the same handler; mount the listener at
    /// [crate::config::DEFAULT_REGISTRY_PATH]'s host when composing urls.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) {
        if let Ok(addr) = listener.local_addr() {
            info!("registry: serving on {}", addr);
        }
        loop {
            let (stream, _) = match listener.accept().await {
                Ok(s) => s,
                Err(e) => {
                    error!("registry: accept error: {:?}", e);
                    return;
                }
            };
            let registry = self.clone();
            tokio::spawn(async move {
                let io = TokioIo::new(stream);
                let svc = service_fn(move |req| registry.clone().handle(req));
                if let Err(e) = http1::Builder::new().serve_connection(io, svc).await {
                    debug!("registry: connection error: {:?}", e);
                }
            });
        }
    }
}

/// Send one heartbeat immediately, then one per `period`, stopping on the
/// first error. A zero period defaults to the registry TTL minus a minute.
pub fn start_heartbeat(registry: &str, addr: &str, period: Duration) -> tokio::task::JoinHandle<()> {
    let period =
        if period.is_zero() { DEFAULT_REGISTRY_TIMEOUT - Duration::from_secs(60) } else { period };
    let registry = registry.to_string();
    let addr = addr.to_string();
    tokio::spawn(async move {
        let http = reqwest::Client::new();
        let mut tick = interval(period);
        loop {
            tick.tick().await;
            if send_heartbeat(&http, &registry, &addr).await.is_err() {
                return;
            }
        }
    })
}

async fn send_heartbeat(
    http: &reqwest::Client, registry: &str, addr: &str,
) -> Result<(), RpcError> {
    debug!("{} send heart beat to registry {}", addr, registry);
    match http.post(registry).header(X_GORPC_SERVER, addr).send().await {
        Ok(_) => Ok(()),
        Err(e) => {
            warn!("rpc server: heart beat error: {:?}", e);
            Err(RPC_ERR_CLOSED)
        }
    }
}

#[cfg(test)]
mod tests {

    use super::*;

    #[test]
    fn test_alive_eviction() {
        let registry = GoRegistry::new(Duration::from_millis(10));
        registry.put_server("tcp@127.0.0.1:1");
        registry.put_server("tcp@127.0.0.1:2");
        assert_eq!(registry.alive_servers().len(), 2);
        std::thread::sleep(Duration::from_millis(20));
        registry.put_server("tcp@127.0.0.1:2");
        assert_eq!(registry.alive_servers(), vec!["tcp@127.0.0.1:2".to_string()]);
    }

    #[test]
    fn test_alive_sorted() {
        let registry = GoRegistry::default_instance();
        registry.put_server("tcp@b");
        registry.put_server("tcp@a");
        assert_eq!(registry.alive_servers(), vec!["tcp@a".to_string(), "tcp@b".to_string()]);
    }
}
