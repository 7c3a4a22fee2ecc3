use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crossfire::{mpmc, MTx};
use log::*;
use serde::{de::DeserializeOwned, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::sync::Mutex;
use tokio::time::{sleep, timeout, Duration};

use crate::codec::{AnyCodec, Codec, CodecReader, CodecWriter, Header};
use crate::config::{RpcOption, DEFAULT_RPC_PATH};
use crate::error::*;
use crate::http::CONNECTED;
use crate::net::{Conn, UnifyAddr, UnifyStream};

/// A single outstanding request, identified by its sequence number.
///
/// Lifecycle: created by the caller, registered (seq assigned, inserted into
/// the pending map), serialized, awaited, removed on reply / cancellation /
/// shutdown. The `done` channel is signalled exactly once.
pub struct Call {
    pub seq: u64,
    /// format "Service.Method"
    pub service_method: String,
    /// request body, already encoded with the connection's codec
    pub args: Vec<u8>,
    /// raw reply body; decode it with [Call::reply] once completed
    pub reply_bytes: Option<Vec<u8>>,
    pub error: Option<RpcError>,
    done: Option<MTx<Call>>,
}

impl Call {
    /// Signal completion through the done channel. Must be called exactly
    /// once; the channel needs capacity so the receive loop never blocks.
    fn done(mut self) {
        if let Some(done) = self.done.take() {
            let _ = done.send(self);
        }
    }

    #[inline]
    pub fn into_result(self) -> Result<Vec<u8>, RpcError> {
        match self.error {
            Some(e) => Err(e),
            None => Ok(self.reply_bytes.unwrap_or_default()),
        }
    }

    /// Decode the reply with the codec of the client that carried this call.
    pub fn reply<R: DeserializeOwned>(&self, codec: &AnyCodec) -> Result<R, RpcError> {
        if let Some(e) = self.error.as_ref() {
            return Err(e.clone());
        }
        let buf = self.reply_bytes.as_deref().unwrap_or_default();
        codec.decode::<R>(buf).map_err(|_| RPC_ERR_BODY_DECODE)
    }
}

impl fmt::Debug for Call {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Call(seq={}, method={})", self.seq, self.service_method)
    }
}

struct SendHalf {
    writer: CodecWriter,
    // scratch header, reset on each send
    header: Header,
}

struct ClientState {
    seq: u64,
    pending: HashMap<u64, Call>,
    /// user has called close
    closing: bool,
    /// transport has failed
    shutdown: bool,
}

/// A client-side connection multiplexing concurrent calls by sequence
/// number. One receive task per connection demultiplexes replies into
/// per-call completion channels. Connection closes when dropped.
pub struct Client {
    codec: AnyCodec,
    sending: Mutex<SendHalf>,
    mu: std::sync::Mutex<ClientState>,
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "rpc client")
    }
}

impl Client {
    /// Perform the option handshake on an established stream and start the
    /// receive task. The stream speaks the negotiated codec afterwards.
    pub async fn new(conn: Box<dyn Conn>, opt: RpcOption) -> Result<Arc<Client>, RpcError> {
        let (r, w) = tokio::io::split(conn);
        let mut writer = BufWriter::new(w);
        let mut line = match serde_json::to_vec(&opt) {
            Ok(l) => l,
            Err(e) => {
                error!("rpc client: option encode error: {:?}", e);
                return Err(RPC_ERR_ENCODE);
            }
        };
        line.push(b'\n');
        if let Err(e) = writer.write_all(&line).await {
            warn!("rpc client: option write error: {:?}", e);
            return Err(RPC_ERR_CLOSED);
        }
        if let Err(e) = writer.flush().await {
            warn!("rpc client: option flush error: {:?}", e);
            return Err(RPC_ERR_CLOSED);
        }
        let codec = AnyCodec::new(opt.codec_kind);
        let reader = CodecReader::new(BufReader::new(r), codec);
        let client = Arc::new(Client {
            codec,
            sending: Mutex::new(SendHalf {
                writer: CodecWriter::new(writer, codec),
                header: Header::default(),
            }),
            mu: std::sync::Mutex::new(ClientState {
                seq: 1,
                pending: HashMap::new(),
                closing: false,
                shutdown: false,
            }),
        });
        let receiver = client.clone();
        tokio::spawn(async move {
            receiver.receive(reader).await;
        });
        Ok(client)
    }

    /// Dial `network` ("tcp" or "unix") with the option's connect timeout
    /// bounding both the OS connect and the handshake.
    pub async fn dial(network: &str, address: &str, opt: RpcOption) -> Result<Arc<Client>, RpcError> {
        Self::dial_inner(network, address, opt, false).await
    }

    /// Dial through an HTTP CONNECT handshake, then proceed as [Client::dial].
    pub async fn dial_http(
        network: &str, address: &str, opt: RpcOption,
    ) -> Result<Arc<Client>, RpcError> {
        Self::dial_inner(network, address, opt, true).await
    }

    /// Dial a `"<proto>@<addr>"` endpoint. `"http"` routes through
    /// [Client::dial_http], any other proto is the network name for
    /// [Client::dial].
    pub async fn dial_any(rpc_addr: &str, opt: RpcOption) -> Result<Arc<Client>, RpcError> {
        let mut parts = rpc_addr.splitn(2, '@');
        let (proto, addr) = match (parts.next(), parts.next()) {
            (Some(proto), Some(addr)) if !proto.is_empty() && !addr.contains('@') => (proto, addr),
            _ => {
                error!("rpc client: wrong format {:?}, expect protocol@addr", rpc_addr);
                return Err(RpcError::Rpc(ERR_BAD_ADDR));
            }
        };
        match proto {
            "http" => Self::dial_http("tcp", addr, opt).await,
            _ => Self::dial(proto, addr, opt).await,
        }
    }

    async fn dial_inner(
        network: &str, address: &str, opt: RpcOption, http: bool,
    ) -> Result<Arc<Client>, RpcError> {
        let addr = UnifyAddr::parse(network, address).map_err(|_| RpcError::Rpc(ERR_BAD_ADDR))?;
        let stream = match UnifyStream::connect_timeout(&addr, opt.connect_timeout).await {
            Ok(s) => s,
            Err(e) => {
                warn!("rpc client: connect {} error: {:?}", addr, e);
                if e.kind() == std::io::ErrorKind::TimedOut {
                    return Err(RPC_ERR_CONNECT_TIMEOUT);
                }
                return Err(RPC_ERR_CLOSED);
            }
        };
        let mut conn: Box<dyn Conn> = Box::new(stream);
        let setup = async move {
            if http {
                http_handshake(&mut conn).await?;
            }
            Client::new(conn, opt).await
        };
        if opt.connect_timeout.is_zero() {
            setup.await
        } else {
            match timeout(opt.connect_timeout, setup).await {
                Ok(r) => r,
                Err(_) => {
                    warn!("rpc client: connect timeout: expect within {:?}", opt.connect_timeout);
                    Err(RPC_ERR_CONNECT_TIMEOUT)
                }
            }
        }
    }

    #[inline]
    pub fn is_available(&self) -> bool {
        let state = self.mu.lock().unwrap();
        !state.closing && !state.shutdown
    }

    #[inline]
    pub fn codec(&self) -> AnyCodec {
        self.codec
    }

    /// Close the connection. The second close observes `closing` and
    /// returns the shutdown error.
    pub async fn close(&self) -> Result<(), RpcError> {
        {
            let mut state = self.mu.lock().unwrap();
            if state.closing {
                return Err(RPC_ERR_SHUTDOWN);
            }
            state.closing = true;
        }
        self.sending.lock().await.writer.close().await;
        Ok(())
    }

    fn register_call(&self, mut call: Call) -> Result<u64, Call> {
        let mut state = self.mu.lock().unwrap();
        if state.closing || state.shutdown {
            call.error = Some(RPC_ERR_SHUTDOWN);
            return Err(call);
        }
        let seq = state.seq;
        state.seq += 1;
        call.seq = seq;
        state.pending.insert(seq, call);
        Ok(seq)
    }

    fn remove_call(&self, seq: u64) -> Option<Call> {
        let mut state = self.mu.lock().unwrap();
        state.pending.remove(&seq)
    }

    /// Fail every pending call with `err` and mark the client shut down.
    /// Holds `sending` before the state lock so no send can interleave.
    async fn terminate_calls(&self, err: RpcError) {
        let _sending = self.sending.lock().await;
        let mut state = self.mu.lock().unwrap();
        state.shutdown = true;
        let pending = std::mem::take(&mut state.pending);
        drop(state);
        for (_, mut call) in pending {
            call.error = Some(err.clone());
            call.done();
        }
    }

    /// Asynchronous call: encode args, register the call and write the
    /// request frame. Completion is delivered through `done`, which the
    /// caller owns and which must have capacity.
    pub async fn go<A: Serialize>(&self, service_method: &str, args: &A, done: MTx<Call>) -> u64 {
        let body = match self.codec.encode(args) {
            Ok(b) => b,
            Err(()) => {
                let call = Call {
                    seq: 0,
                    service_method: service_method.to_string(),
                    args: Vec::new(),
                    reply_bytes: None,
                    error: Some(RPC_ERR_ENCODE),
                    done: Some(done),
                };
                call.done();
                return 0;
            }
        };
        self.go_raw(service_method, body, done).await
    }

    /// As [Client::go], with the request body already encoded.
    pub async fn go_raw(&self, service_method: &str, body: Vec<u8>, done: MTx<Call>) -> u64 {
        let wire = body.clone();
        let call = Call {
            seq: 0,
            service_method: service_method.to_string(),
            args: body,
            reply_bytes: None,
            error: None,
            done: Some(done),
        };
        // the send lock is held across register + write, so concurrent
        // sends cannot interleave frames
        let mut sending = self.sending.lock().await;
        let seq = match self.register_call(call) {
            Ok(seq) => seq,
            Err(call) => {
                call.done();
                return 0;
            }
        };
        let SendHalf { writer, header } = &mut *sending;
        header.service_method.clear();
        header.service_method.push_str(service_method);
        header.seq = seq;
        header.error.clear();
        if let Err(e) = writer.write(header, &wire).await {
            // a partial write may still produce a reply; the receive loop
            // discards bodies for seqs it no longer knows
            if let Some(mut call) = self.remove_call(seq) {
                call.error = Some(e);
                call.done();
            }
        }
        seq
    }

    /// Synchronous call with pre-encoded body, returning the raw reply.
    pub async fn call_raw(&self, service_method: &str, body: Vec<u8>) -> Result<Vec<u8>, RpcError> {
        let (tx, rx) = mpmc::bounded_async::<Call>(1);
        self.go_raw(service_method, body, tx.into()).await;
        match rx.recv().await {
            Ok(call) => call.into_result(),
            Err(_) => Err(RPC_ERR_SHUTDOWN),
        }
    }

    /// Synchronous call: blocks until the reply or a transport failure.
    pub async fn call<A, R>(&self, service_method: &str, args: &A) -> Result<R, RpcError>
    where
        A: Serialize,
        R: DeserializeOwned,
    {
        let body = self.codec.encode(args).map_err(|_| RPC_ERR_ENCODE)?;
        let reply = self.call_raw(service_method, body).await?;
        self.codec.decode::<R>(&reply).map_err(|_| RPC_ERR_BODY_DECODE)
    }

    /// [Client::call] bounded by a deadline. On expiry the call is removed
    /// from the pending map and the cancellation error returned; the server
    /// is not notified and may still execute the handler.
    pub async fn call_timeout<A, R>(
        &self, service_method: &str, args: &A, d: Duration,
    ) -> Result<R, RpcError>
    where
        A: Serialize,
        R: DeserializeOwned,
    {
        let body = self.codec.encode(args).map_err(|_| RPC_ERR_ENCODE)?;
        let (tx, rx) = mpmc::bounded_async::<Call>(1);
        let seq = self.go_raw(service_method, body, tx.into()).await;
        tokio::select! {
            r = rx.recv() => match r {
                Ok(call) => call.reply::<R>(&self.codec),
                Err(_) => Err(RPC_ERR_SHUTDOWN),
            },
            _ = sleep(d) => {
                self.remove_call(seq);
                Err(RPC_ERR_CALL_CANCELLED)
            }
        }
    }

    /// The single receive loop of this connection. Any read error
    /// terminates every pending call with the transport error.
    async fn receive(self: Arc<Self>, mut reader: CodecReader) {
        let err = loop {
            // on the client side a half-read header is as fatal as a dead
            // stream; either way every pending call fails
            let h = match reader.read_header().await {
                Ok(h) => h,
                Err(e) => break e.into_error(),
            };
            match self.remove_call(h.seq) {
                None => {
                    // send failed half way, or the call was cancelled;
                    // the body is read and dropped
                    if let Err(e) = reader.read_body().await {
                        break e;
                    }
                }
                Some(mut call) if !h.error.is_empty() => {
                    call.error = Some(RpcError::Remote(h.error));
                    let r = reader.read_body().await;
                    call.done();
                    if let Err(e) = r {
                        break e;
                    }
                }
                Some(mut call) => match reader.read_body().await {
                    Ok(body) => {
                        call.reply_bytes = Some(body);
                        call.done();
                    }
                    Err(e) => {
                        call.error = Some(e.clone());
                        call.done();
                        break e;
                    }
                },
            }
        };
        debug!("{:?} receive loop exit: {}", self, err);
        self.terminate_calls(err).await;
    }
}

/// Client half of the HTTP CONNECT hijack: only the verbatim success status
/// switches the stream over to RPC.
async fn http_handshake(conn: &mut Box<dyn Conn>) -> Result<(), RpcError> {
    let req = format!("CONNECT {} HTTP/1.0\r\n\r\n", DEFAULT_RPC_PATH);
    if let Err(e) = conn.write_all(req.as_bytes()).await {
        warn!("rpc client: CONNECT write error: {:?}", e);
        return Err(RpcError::Rpc(ERR_HTTP_HIJACK));
    }
    if let Err(e) = conn.flush().await {
        warn!("rpc client: CONNECT flush error: {:?}", e);
        return Err(RpcError::Rpc(ERR_HTTP_HIJACK));
    }
    // the server sends nothing but the status line and the blank line
    // before we speak again, so reading greedily cannot overshoot
    let mut head: Vec<u8> = Vec::with_capacity(64);
    let mut chunk = [0u8; 256];
    loop {
        let n = match conn.read(&mut chunk).await {
            Ok(0) | Err(_) => {
                warn!("rpc client: CONNECT response truncated");
                return Err(RpcError::Rpc(ERR_HTTP_HIJACK));
            }
            Ok(n) => n,
        };
        head.extend_from_slice(&chunk[..n]);
        if head.windows(4).any(|w| w == b"\r\n\r\n") {
            break;
        }
        if head.len() > 4096 {
            warn!("rpc client: CONNECT response too large");
            return Err(RpcError::Rpc(ERR_HTTP_HIJACK));
        }
    }
    let line = match head.split(|b| *b == b'\r').next() {
        Some(l) => String::from_utf8_lossy(l).to_string(),
        None => String::new(),
    };
    let status = line.splitn(2, ' ').nth(1).unwrap_or("");
    if status != CONNECTED {
        warn!("rpc client: unexpected HTTP response: {}", line);
        return Err(RpcError::Rpc(ERR_HTTP_HIJACK));
    }
    Ok(())
}
