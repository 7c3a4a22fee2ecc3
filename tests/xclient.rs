mod common;

use std::time::{Duration, Instant};

use common::*;
use gorpc::error::*;
use gorpc::*;

#[test]
fn test_xclient_call_modes() {
    let rt = setup();
    rt.block_on(async move {
        let (_s1, addr1) = start_server().await;
        let (_s2, addr2) = start_server().await;
        let servers = vec![format!("tcp@{}", addr1), format!("tcp@{}", addr2)];
        for mode in [
            SelectMode::Random,
            SelectMode::RoundRobin,
            SelectMode::WeightedRoundRobin,
            SelectMode::ConsistentHash,
        ] {
            let xc =
                XClient::new(MultiServerDiscovery::new(servers.clone()), mode, RpcOption::default());
            for i in 0i64..4 {
                let reply: i64 = xc.call("Foo.Sum", &(i, 1i64)).await.expect("call");
                assert_eq!(reply, i + 1);
            }
            xc.close().await;
        }
    });
}

#[test]
fn test_broadcast_all_success() {
    let rt = setup();
    rt.block_on(async move {
        let (_s1, addr1) = start_server().await;
        let (_s2, addr2) = start_server().await;
        let d =
            MultiServerDiscovery::new(vec![format!("tcp@{}", addr1), format!("tcp@{}", addr2)]);
        let xc = XClient::new(d, SelectMode::Random, RpcOption::default());
        let reply: i64 = xc.broadcast("Foo.Sum", &(20i64, 22i64)).await.expect("broadcast");
        assert_eq!(reply, 42);
    });
}

#[test]
fn test_broadcast_first_error() {
    let rt = setup();
    rt.block_on(async move {
        let (_s1, addr1) = start_server().await;
        // nothing listens on the second endpoint
        let d = MultiServerDiscovery::new(vec![
            format!("tcp@{}", addr1),
            "tcp@127.0.0.1:1".to_string(),
        ]);
        let xc = XClient::new(d, SelectMode::Random, RpcOption::default());
        assert!(xc.broadcast::<_, i64>("Foo.Sum", &(1i64, 2i64)).await.is_err());
    });
}

#[test]
fn test_broadcast_deadline() {
    let rt = setup();
    rt.block_on(async move {
        let (_s1, addr1) = start_server().await;
        let (_s2, addr2) = start_server().await;
        let d =
            MultiServerDiscovery::new(vec![format!("tcp@{}", addr1), format!("tcp@{}", addr2)]);
        let xc = XClient::new(d, SelectMode::Random, RpcOption::default());
        let begin = Instant::now();
        let err = xc
            .broadcast_timeout::<_, i64>("Foo.Sleep", &(2u64, 0i64), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert_eq!(err, RPC_ERR_CALL_CANCELLED);
        let elapsed = begin.elapsed();
        assert!(elapsed < Duration::from_millis(1800), "elapsed {:?}", elapsed);
    });
}

#[test]
fn test_xclient_close_is_terminal() {
    let rt = setup();
    rt.block_on(async move {
        let (_s1, addr1) = start_server().await;
        let d = MultiServerDiscovery::new(vec![format!("tcp@{}", addr1)]);
        let xc = XClient::new(d, SelectMode::RoundRobin, RpcOption::default());
        let reply: i64 = xc.call("Foo.Sum", &(1i64, 1i64)).await.expect("call");
        assert_eq!(reply, 2);
        xc.close().await;
        let err = xc.call::<_, i64>("Foo.Sum", &(2i64, 2i64)).await.unwrap_err();
        assert_eq!(err, RPC_ERR_SHUTDOWN);
    });
}

#[test]
fn test_registry_roundtrip() {
    let rt = setup();
    rt.block_on(async move {
        let (_s1, addr1) = start_server().await;
        let (_s2, addr2) = start_server().await;

        let registry = GoRegistry::default_instance();
        let reg_listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let reg_addr = reg_listener.local_addr().expect("local addr");
        tokio::spawn(registry.clone().serve(reg_listener));
        let registry_url = format!("http://{}{}", reg_addr, DEFAULT_REGISTRY_PATH);

        let ep1 = format!("tcp@{}", addr1);
        let ep2 = format!("tcp@{}", addr2);
        let _hb1 = start_heartbeat(&registry_url, &ep1, Duration::from_secs(1));
        let _hb2 = start_heartbeat(&registry_url, &ep2, Duration::from_secs(1));
        tokio::time::sleep(Duration::from_millis(300)).await;

        let d = GoRegistryDiscovery::new(&registry_url, Duration::from_millis(100));
        let mut all = d.get_all().await.expect("get_all");
        all.sort();
        let mut want = vec![ep1.clone(), ep2.clone()];
        want.sort();
        assert_eq!(all, want);

        let xc = XClient::new(d, SelectMode::RoundRobin, RpcOption::default());
        for _ in 0..3 {
            let reply: i64 = xc.call("Foo.Sum", &(3i64, 4i64)).await.expect("call");
            assert_eq!(reply, 7);
        }
    });
}
