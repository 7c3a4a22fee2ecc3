#![allow(dead_code)]

use captains_log::recipe;
use gorpc::*;
use log::*;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::{Builder, Runtime};

pub fn setup() -> Runtime {
    let _ = recipe::raw_file_logger("/tmp", Level::Trace).test().build();
    Builder::new_multi_thread().worker_threads(4).enable_all().build().unwrap()
}

pub struct Foo;

impl Foo {
    pub async fn sum(&self, args: (i64, i64)) -> Result<i64, RpcError> {
        Ok(args.0 + args.1)
    }

    pub async fn sleep(&self, args: (u64, i64)) -> Result<i64, RpcError> {
        tokio::time::sleep(Duration::from_secs(args.0)).await;
        Ok(args.1)
    }
}

pub fn foo_service() -> Service {
    Service::builder(Foo)
        .method("Sum", |s: Arc<Foo>, args: (i64, i64)| async move { s.sum(args).await })
        .method("Sleep", |s: Arc<Foo>, args: (u64, i64)| async move { s.sleep(args).await })
        .finish()
}

/// Start a server with the Foo service on an ephemeral tcp port.
pub async fn start_server() -> (Arc<Server>, String) {
    let server = Server::new();
    server.register(foo_service()).expect("register Foo");
    let listener = listen_on_addr("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    debug!("test server on {}", addr);
    let srv = server.clone();
    tokio::spawn(async move {
        srv.accept(listener).await;
    });
    (server, addr)
}
