use std::fmt::Write as _;
use std::sync::Arc;

use log::*;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::config::{DEFAULT_DEBUG_PATH, DEFAULT_RPC_PATH};
use crate::net::{Conn, UnifyListener};
use crate::server::Server;

/// Verbatim status a hijack client accepts; anything else is rejected.
pub const CONNECTED: &'static str = "200 Connected to Go RPC";

/// Serve RPC-over-HTTP on a listener: a CONNECT on [DEFAULT_RPC_PATH] is
/// hijacked into a raw RPC stream, a GET on [DEFAULT_DEBUG_PATH] renders the
/// registered services, anything else is answered 405.
///
/// The 200 reply is written byte-exact on the raw stream (status line, no
/// headers, blank line); after it the connection belongs to
/// [Server::serve_conn].
pub async fn serve_http(server: Arc<Server>, mut listener: UnifyListener) {
    info!("rpc server: serving http on {}", listener);
    loop {
        match listener.accept().await {
            Ok(stream) => {
                let server = server.clone();
                tokio::spawn(async move {
                    handle_http_conn(server, Box::new(stream)).await;
                });
            }
            Err(e) => {
                error!("rpc server: http accept error: {:?}", e);
                return;
            }
        }
    }
}

async fn handle_http_conn(server: Arc<Server>, mut conn: Box<dyn Conn>) {
    // a hijack client sends nothing after the blank line until it sees the
    // 200, so reading greedily cannot swallow RPC bytes
    let mut head: Vec<u8> = Vec::with_capacity(128);
    let mut chunk = [0u8; 512];
    loop {
        let n = match conn.read(&mut chunk).await {
            Ok(0) | Err(_) => return,
            Ok(n) => n,
        };
        head.extend_from_slice(&chunk[..n]);
        if head.windows(4).any(|w| w == b"\r\n\r\n") {
            break;
        }
        if head.len() > 8192 {
            debug!("rpc server: oversized http request head");
            return;
        }
    }
    let request_line = match head.split(|b| *b == b'\r').next() {
        Some(l) => String::from_utf8_lossy(l).to_string(),
        None => return,
    };
    let mut parts = request_line.split_whitespace();
    let (method, path) = match (parts.next(), parts.next()) {
        (Some(m), Some(p)) => (m, p),
        _ => {
            debug!("rpc server: malformed request line {:?}", request_line);
            return;
        }
    };
    match (method, path) {
        ("CONNECT", DEFAULT_RPC_PATH) => {
            let resp = format!("HTTP/1.0 {}\r\n\r\n", CONNECTED);
            if let Err(e) = conn.write_all(resp.as_bytes()).await {
                debug!("rpc server: hijack reply error: {:?}", e);
                return;
            }
            if conn.flush().await.is_err() {
                return;
            }
            server.serve_conn(conn).await;
        }
        ("GET", DEFAULT_DEBUG_PATH) => {
            let body = render_debug(&server);
            let resp = format!(
                "HTTP/1.0 200 OK\r\nContent-Type: text/html\r\nContent-Length: {}\r\n\r\n{}",
                body.len(),
                body
            );
            let _ = conn.write_all(resp.as_bytes()).await;
            let _ = conn.flush().await;
        }
        _ => {
            let _ = conn
                .write_all(b"HTTP/1.0 405 Method Not Allowed\r\nContent-Length: 0\r\n\r\n")
                .await;
            let _ = conn.flush().await;
        }
    }
}

fn render_debug(server: &Server) -> String {
    let mut body = String::new();
    body.push_str("<html><body><title>GoRPC Services</title>\n");
    for (service, methods) in server.dump_services() {
        let _ = write!(body, "<h3>Service {}</h3>\n<ul>\n", service);
        for m in methods {
            let _ = write!(body, "<li>{}.{}</li>\n", service, m);
        }
        body.push_str("</ul>\n");
    }
    body.push_str("</body></html>\n");
    body
}
