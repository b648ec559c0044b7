//! End-to-end PING/ACK exchange between two checkers over loopback
//! UDP, with the topology fed through a real store.

use std::collections::HashMap;
use std::time::Duration;
use prost::Message;
use weft_health::{HealthCheckOption, HealthChecker, HealthCheckerConfig};
use weft_model::{Value, TTL_INFINITE};
use weft_net::MessageBus;
use weft_proto::{AdjacencyDatabase, PrefixDatabase, ADJACENCY_MARKER, PREFIX_MARKER};
use weft_store::{KvStore, KvStoreConfig, KvStoreHandle};

async fn announce(
    store: &KvStoreHandle,
    node: &str,
    neighbors: &[&str],
    prefixes: &[&str],
    version: u64,
) {
    let adj = AdjacencyDatabase {
        this_node_name: node.to_string(),
        neighbors: neighbors.iter().map(|n| n.to_string()).collect(),
    };
    let prefix_db = PrefixDatabase {
        this_node_name: node.to_string(),
        prefixes: prefixes.iter().map(|p| p.to_string()).collect(),
    };

    let mut key_vals = HashMap::new();
    key_vals.insert(
        format!("{ADJACENCY_MARKER}{node}"),
        Value::new(version, node, Some(adj.encode_to_vec()), TTL_INFINITE, 0),
    );
    key_vals.insert(
        format!("{PREFIX_MARKER}{node}"),
        Value::new(version, node, Some(prefix_db.encode_to_vec()), TTL_INFINITE, 0),
    );
    store.key_set(key_vals).await.unwrap();
}

fn checker_config(
    node: &str,
    store_node: &str,
    option: HealthCheckOption,
    target_port: u16,
) -> HealthCheckerConfig {
    let mut config = HealthCheckerConfig::for_node(node);
    config.option = option;
    config.udp_bind_port = 0;
    config.udp_ping_port = target_port;
    config.ping_interval = Duration::from_millis(200);
    config.store_cmd_url = format!("weft://{store_node}/local/cmd");
    config.store_pub_url = format!("weft://{store_node}/local/pub");
    config
}

#[tokio::test]
async fn ping_ack_exchange_over_loopback() {
    let bus = MessageBus::new();
    let mut store_config = KvStoreConfig::for_node("hub");
    store_config.db_sync_interval = Duration::from_secs(3_600);
    let store = KvStore::spawn(store_config, bus.clone()).await.unwrap();

    // node-b answers pings but selects no targets of its own: its only
    // neighbor-of-neighbor is itself.
    let b = HealthChecker::spawn(
        checker_config("node-b", "hub", HealthCheckOption::NeighborOfNeighbor, 1),
        bus.clone(),
    )
    .await
    .unwrap();
    let b_port = b.local_addr().port();

    // node-a pings the whole observed topology at node-b's port.
    let a = HealthChecker::spawn(
        checker_config("node-a", "hub", HealthCheckOption::Topology, b_port),
        bus.clone(),
    )
    .await
    .unwrap();

    announce(&store, "node-a", &["node-b"], &["::1/128"], 1).await;
    announce(&store, "node-b", &["node-a"], &["::1/128"], 1).await;

    tokio::time::sleep(Duration::from_millis(1_200)).await;

    let a_view = a.peek().await.unwrap();
    let to_b = &a_view["node-b"];
    assert!(
        to_b.last_ack_from_node >= 2,
        "expected at least two acks, got {}",
        to_b.last_ack_from_node
    );
    assert!(to_b.last_val_sent >= to_b.last_ack_from_node);

    let b_view = b.peek().await.unwrap();
    let from_a = &b_view["node-a"];
    assert!(
        from_a.last_ack_to_node >= 2,
        "expected node-b to have acked, got {}",
        from_a.last_ack_to_node
    );

    // The same counters are served over the wire endpoint.
    let peek_req = weft_proto::HealthCheckerRequest {
        cmd: weft_proto::HealthCheckerCmd::Peek as i32,
    }
    .encode_to_vec();
    let reply_bytes = bus
        .request("weft://node-a/health/cmd", peek_req, Duration::from_secs(1))
        .await
        .unwrap();
    let wire_view = weft_proto::HealthCheckerPeekReply::decode(reply_bytes.as_slice()).unwrap();
    assert!(wire_view.node_info.contains_key("node-b"));

    a.shutdown().await;
    b.shutdown().await;
    store.shutdown().await;
}

#[tokio::test]
async fn peek_omits_idle_nodes() {
    let bus = MessageBus::new();
    let mut store_config = KvStoreConfig::for_node("hub2");
    store_config.db_sync_interval = Duration::from_secs(3_600);
    let store = KvStore::spawn(store_config, bus.clone()).await.unwrap();

    let mut config = checker_config("node-a", "hub2", HealthCheckOption::Topology, 1);
    // Target selection happens, but the silent node never acks and we
    // never ping it (no address), so it stays idle.
    config.ping_interval = Duration::from_millis(100);
    let a = HealthChecker::spawn(config, bus.clone()).await.unwrap();

    announce(&store, "node-a", &["ghost"], &["::1/128"], 1).await;
    let adj = AdjacencyDatabase {
        this_node_name: "ghost".to_string(),
        neighbors: vec!["node-a".to_string()],
    };
    let mut key_vals = HashMap::new();
    key_vals.insert(
        format!("{ADJACENCY_MARKER}ghost"),
        Value::new(1, "ghost", Some(adj.encode_to_vec()), TTL_INFINITE, 0),
    );
    store.key_set(key_vals).await.unwrap();

    tokio::time::sleep(Duration::from_millis(400)).await;

    // ghost has no prefix announcement, so it was never pinged and
    // peek must not list it.
    let view = a.peek().await.unwrap();
    assert!(!view.contains_key("ghost"));

    a.shutdown().await;
    store.shutdown().await;
}

#[tokio::test]
async fn invalid_percentage_is_fatal_at_construction() {
    let bus = MessageBus::new();
    let mut config = HealthCheckerConfig::for_node("node-a");
    config.health_check_pct = 101;
    config.udp_bind_port = 0;

    let err = HealthChecker::spawn(config, bus).await.err().unwrap();
    assert!(matches!(err, weft_health::HealthError::Config(_)));
}

#[tokio::test]
async fn bind_conflict_is_fatal_at_construction() {
    let bus = MessageBus::new();

    let mut first = HealthCheckerConfig::for_node("node-a");
    first.udp_bind_port = 0;
    first.store_cmd_url = "weft://hub3/local/cmd".into();
    first.store_pub_url = "weft://hub3/local/pub".into();
    let a = HealthChecker::spawn(first, bus.clone()).await.unwrap();

    let mut second = HealthCheckerConfig::for_node("node-b");
    second.udp_bind_port = a.local_addr().port();
    second.store_cmd_url = "weft://hub3/local/cmd".into();
    second.store_pub_url = "weft://hub3/local/pub".into();

    let err = HealthChecker::spawn(second, bus).await.err().unwrap();
    assert!(matches!(err, weft_health::HealthError::Io(_)));
}
