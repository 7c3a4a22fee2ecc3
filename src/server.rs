use std::collections::HashMap;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, RwLock,
};
use std::time::Duration;

use log::*;
use tokio::io::{AsyncBufReadExt, BufReader, BufWriter};
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tokio::time::sleep;

use crate::codec::{AnyCodec, CodecReader, CodecWriter, Header, HeaderReadError};
use crate::config::{RpcOption, MAGIC_NUMBER};
use crate::error::*;
use crate::net::{Conn, UnifyListener};
use crate::service::{split_service_method, MethodHandler, Service};

/// Accepts connections, negotiates options and dispatches requests against
/// the registered service catalog. All state is per-instance; clone the
/// `Arc` into every task that serves on it.
pub struct Server {
    services: RwLock<HashMap<String, Arc<Service>>>,
}

impl Server {
    pub fn new() -> Arc<Self> {
        Arc::new(Self { services: RwLock::new(HashMap::new()) })
    }

    /// Register a built service. A second registration under the same name
    /// fails and leaves the first entry untouched.
    pub fn register(&self, svc: Service) -> Result<(), RpcError> {
        let mut map = self.services.write().unwrap();
        if map.contains_key(svc.name()) {
            warn!("rpc server: service already defined: {}", svc.name());
            return Err(RpcError::Rpc(ERR_SERVICE_DUP));
        }
        map.insert(svc.name().to_string(), Arc::new(svc));
        Ok(())
    }

    fn find(&self, service_method: &str) -> Result<MethodHandler, RpcError> {
        let (sname, mname) = split_service_method(service_method)?;
        let svc = match self.services.read().unwrap().get(sname) {
            Some(svc) => svc.clone(),
            None => return Err(RpcError::Rpc(ERR_UNKNOWN_SERVICE)),
        };
        match svc.method(mname) {
            Some(handler) => Ok(handler),
            None => Err(RpcError::Rpc(ERR_UNKNOWN_METHOD)),
        }
    }

    /// Snapshot of `service -> methods` for the debug page.
    pub fn dump_services(&self) -> Vec<(String, Vec<String>)> {
        let map = self.services.read().unwrap();
        let mut out: Vec<(String, Vec<String>)> =
            map.values().map(|s| (s.name().to_string(), s.method_names())).collect();
        out.sort();
        out
    }

    /// Serve the listener indefinitely; one task per accepted connection.
    pub async fn accept(self: Arc<Self>, mut listener: UnifyListener) {
        info!("rpc server: serving on {}", listener);
        loop {
            match listener.accept().await {
                Ok(stream) => {
                    trace!("rpc server: accept {}", stream);
                    let server = self.clone();
                    tokio::spawn(async move {
                        server.serve_conn(Box::new(stream)).await;
                    });
                }
                Err(e) => {
                    error!("rpc server: accept error: {:?}", e);
                    return;
                }
            }
        }
    }

    /// Serve a single connection: read the JSON option line, validate the
    /// magic number, pick the body codec, then run the request loop.
    /// A malformed handshake closes the connection without a reply.
    pub async fn serve_conn(self: Arc<Self>, conn: Box<dyn Conn>) {
        let (r, w) = tokio::io::split(conn);
        let mut reader = BufReader::new(r);
        let mut line = String::new();
        match reader.read_line(&mut line).await {
            Ok(0) => return,
            Ok(_) => {}
            Err(e) => {
                debug!("rpc server: read option error: {:?}", e);
                return;
            }
        }
        let opt: RpcOption = match serde_json::from_str(line.trim_end()) {
            Ok(o) => o,
            Err(e) => {
                warn!("rpc server: option error: {:?}", e);
                return;
            }
        };
        if opt.magic != MAGIC_NUMBER {
            warn!("rpc server: invalid magic number {:x}", opt.magic);
            return;
        }
        let codec = AnyCodec::new(opt.codec_kind);
        let codec_reader = CodecReader::new(reader, codec);
        let codec_writer = CodecWriter::new(BufWriter::new(w), codec);
        self.serve_codec(codec_reader, codec_writer, opt).await;
    }

    async fn serve_codec(self: Arc<Self>, mut reader: CodecReader, writer: CodecWriter, opt: RpcOption) {
        let codec = reader.codec();
        let sending = Arc::new(Mutex::new(writer));
        let mut handlers: JoinSet<()> = JoinSet::new();
        loop {
            let mut h = match reader.read_header().await {
                Ok(h) => h,
                Err(HeaderReadError::Transport(_)) => break,
                Err(HeaderReadError::Partial(e)) => {
                    // the peer committed a frame it could not finish; answer
                    // best-effort with the empty sentinel, then drain the
                    // companion body chunk to stay aligned on the stream
                    let h = Header {
                        service_method: String::new(),
                        seq: 0,
                        error: e.tag().to_string(),
                    };
                    send_response(&sending, &h, &[]).await;
                    match reader.read_body().await {
                        Ok(_) => continue,
                        Err(_) => break,
                    }
                }
            };
            // the body chunk is consumed unconditionally so a resolution
            // failure cannot desync the stream
            let body = match reader.read_body().await {
                Ok(b) => b,
                Err(_) => break,
            };
            let handler = match self.find(&h.service_method) {
                Ok(handler) => handler,
                Err(e) => {
                    h.error = e.tag().to_string();
                    send_response(&sending, &h, &[]).await;
                    continue;
                }
            };
            while handlers.try_join_next().is_some() {}
            handlers.spawn(handle_request(
                codec,
                handler,
                h,
                body,
                sending.clone(),
                opt.handle_timeout,
            ));
        }
        // wait for in-flight handlers before closing the codec
        while handlers.join_next().await.is_some() {}
        sending.lock().await.close().await;
    }
}

/// Run one handler and send its response under the shared send lock.
///
/// With a nonzero handle timeout the handler races a timer; whichever path
/// signals first wins the `sent` flag under the send lock, so a seq never
/// sees a second response. An elapsed handler keeps running to completion,
/// its late result is discarded.
async fn handle_request(
    codec: AnyCodec, handler: MethodHandler, h: Header, body: Vec<u8>,
    sending: Arc<Mutex<CodecWriter>>, handle_timeout: Duration,
) {
    let sent = Arc::new(AtomicBool::new(false));
    let mut invoke = tokio::spawn({
        let sending = sending.clone();
        let sent = sent.clone();
        let mut h = h.clone();
        async move {
            match handler(codec, body).await {
                Ok(replyv) => send_response_once(&sending, &sent, &h, &replyv).await,
                Err(e) => {
                    h.error = e.tag().to_string();
                    send_response_once(&sending, &sent, &h, &[]).await;
                }
            }
        }
    });
    if handle_timeout.is_zero() {
        if let Err(e) = (&mut invoke).await {
            warn!("rpc server: handler for {} died: {:?}", h.service_method, e);
        }
        return;
    }
    tokio::select! {
        r = &mut invoke => {
            if let Err(e) = r {
                warn!("rpc server: handler for {} died: {:?}", h.service_method, e);
            }
        }
        _ = sleep(handle_timeout) => {
            let mut h = h;
            h.error = ERR_HANDLER_TIMEOUT.to_string();
            send_response_once(&sending, &sent, &h, &[]).await;
        }
    }
}

async fn send_response(sending: &Mutex<CodecWriter>, h: &Header, body: &[u8]) {
    let mut w = sending.lock().await;
    if let Err(e) = w.write(h, body).await {
        warn!("rpc server: write response error: {:?}", e);
    }
}

async fn send_response_once(sending: &Mutex<CodecWriter>, sent: &AtomicBool, h: &Header, body: &[u8]) {
    let mut w = sending.lock().await;
    if sent.swap(true, Ordering::SeqCst) {
        return;
    }
    if let Err(e) = w.write(h, body).await {
        warn!("rpc server: write response error: {:?}", e);
    }
}

#[cfg(test)]
mod tests {

    use super::*;

    struct Echo;

    impl Echo {
        async fn echo(&self, s: String) -> Result<String, RpcError> {
            Ok(format!("echo: {}", s))
        }
    }

    fn echo_service() -> Service {
        Service::builder(Echo)
            .method("Echo", |s: Arc<Echo>, v: String| async move { s.echo(v).await })
            .finish()
    }

    #[test]
    fn test_register_duplicate() {
        let server = Server::new();
        server.register(echo_service()).expect("first register");
        let err = server.register(echo_service()).unwrap_err();
        assert_eq!(err, RpcError::Rpc(ERR_SERVICE_DUP));
        // the first entry is still resolvable
        assert!(server.find("Echo.Echo").is_ok());
    }

    #[test]
    fn test_find_errors() {
        let server = Server::new();
        server.register(echo_service()).expect("register");
        assert!(matches!(server.find("NoDot"), Err(e) if e == RpcError::Rpc(ERR_ILL_SERVICE_METHOD)));
        assert!(matches!(server.find("Nope.Echo"), Err(e) if e == RpcError::Rpc(ERR_UNKNOWN_SERVICE)));
        assert!(matches!(server.find("Echo.Nope"), Err(e) if e == RpcError::Rpc(ERR_UNKNOWN_METHOD)));
    }
}
