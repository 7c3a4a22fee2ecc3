//! # gorpc
//!
//! A general-purpose RPC runtime over tcp or unix sockets: a
//! length-preserving message transport with call multiplexing on the client,
//! a registration-based service dispatcher on the server, a pluggable wire
//! codec layer, and a service-discovery / load-balancing front-end that fans
//! calls out to a pool of backends.
//!
//! ## Components
//!
//! - [codec]: frames `(Header, Body)` pairs on a byte stream; two body
//!   codecs, a self-describing binary one ([codec::GobCodec]) and a textual
//!   JSON one ([codec::JsonCodec]), negotiated per connection.
//! - [service]: reflects a user value into a table of
//!   `Service.Method -> handler` through a registration builder.
//! - [server]: accepts connections, performs the option handshake, reads
//!   requests and dispatches them concurrently with a bounded handler time.
//! - [client]: multiplexes concurrent calls by sequence number over one
//!   connection, with connect timeouts and per-call deadlines.
//! - [xclient]: caches one client per endpoint, routes by selection policy
//!   (random, round-robin, smooth weighted round-robin, consistent hashing)
//!   and broadcasts with first-error semantics.
//! - [http]: converts an HTTP `CONNECT` into a raw RPC stream, plus a debug
//!   page listing registered services.
//! - [registry]: an HTTP endpoint aggregating live servers with TTL-based
//!   eviction, and the heartbeat task that feeds it.
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use gorpc::{Client, RpcError, RpcOption, Server, Service};
//!
//! struct Foo;
//!
//! impl Foo {
//!     async fn sum(&self, args: (i64, i64)) -> Result<i64, RpcError> {
//!         Ok(args.0 + args.1)
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), RpcError> {
//!     let server = Server::new();
//!     let svc = Service::builder(Foo)
//!         .method("Sum", |s: Arc<Foo>, args: (i64, i64)| async move { s.sum(args).await })
//!         .finish();
//!     server.register(svc)?;
//!     let listener = gorpc::listen_on_addr("127.0.0.1:8972").await.unwrap();
//!     tokio::spawn({
//!         let server = server.clone();
//!         async move { server.accept(listener).await }
//!     });
//!
//!     let client = Client::dial("tcp", "127.0.0.1:8972", RpcOption::default()).await?;
//!     let reply: i64 = client.call("Foo.Sum", &(1i64, 2i64)).await?;
//!     assert_eq!(reply, 3);
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod codec;
pub mod config;
pub mod error;
pub mod http;
pub mod net;
pub mod registry;
pub mod server;
pub mod service;
pub mod xclient;

pub use client::{Call, Client};
pub use codec::{AnyCodec, Codec, CodecKind, GobCodec, Header, HeaderReadError, JsonCodec};
pub use config::{
    RpcOption, DEFAULT_DEBUG_PATH, DEFAULT_REGISTRY_PATH, DEFAULT_RPC_PATH, MAGIC_NUMBER,
};
pub use error::RpcError;
pub use http::serve_http;
pub use net::{listen_on_addr, Conn, UnifyAddr, UnifyListener, UnifyStream};
pub use registry::{start_heartbeat, GoRegistry};
pub use server::Server;
pub use service::{Service, ServiceBuilder};
pub use xclient::{
    ConsistentHash, Discovery, GoRegistryDiscovery, MultiServerDiscovery, SelectMode, XClient,
};
