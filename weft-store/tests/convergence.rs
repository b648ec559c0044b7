//! Replication compliance: flooding, conflict resolution, full sync,
//! anti-entropy and sealed domains.

mod common;

use common::{connect, peer_spec, quiet_config, spawn_node};
use std::collections::HashMap;
use std::time::Duration;
use weft_model::{Value, TTL_INFINITE};
use weft_net::{Keypair, MessageBus};
use weft_store::KvStore;

fn record(version: u64, originator: &str, payload: &[u8]) -> Value {
    Value::new(version, originator, Some(payload.to_vec()), TTL_INFINITE, 0)
}

fn entry(key: &str, val: Value) -> HashMap<String, Value> {
    HashMap::from([(key.to_string(), val)])
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(200)).await;
}

#[tokio::test(start_paused = true)]
async fn flooded_update_reaches_peer() {
    let bus = MessageBus::new();
    let a = spawn_node(&bus, "node-a").await;
    let b = spawn_node(&bus, "node-b").await;
    connect(&a, "node-a", &b, "node-b").await;

    a.key_set(entry("prefix:node-a", record(1, "node-a", b"route")))
        .await
        .unwrap();
    settle().await;

    let got = b.key_get(vec!["prefix:node-a".to_string()]).await.unwrap();
    assert_eq!(
        got["prefix:node-a"].value.as_deref(),
        Some(b"route".as_slice())
    );
}

#[tokio::test(start_paused = true)]
async fn update_floods_through_a_chain() {
    // a - b - c: c only hears about a's records via b's re-flood.
    let bus = MessageBus::new();
    let a = spawn_node(&bus, "node-a").await;
    let b = spawn_node(&bus, "node-b").await;
    let c = spawn_node(&bus, "node-c").await;
    connect(&a, "node-a", &b, "node-b").await;
    connect(&b, "node-b", &c, "node-c").await;

    a.key_set(entry("k", record(1, "node-a", b"v"))).await.unwrap();
    settle().await;

    let got = c.key_get(vec!["k".to_string()]).await.unwrap();
    assert_eq!(got["k"].value.as_deref(), Some(b"v".as_slice()));
}

#[tokio::test(start_paused = true)]
async fn conflicting_writes_converge_on_higher_originator() {
    let bus = MessageBus::new();
    let a = spawn_node(&bus, "node-a").await;
    let b = spawn_node(&bus, "node-b").await;
    connect(&a, "node-a", &b, "node-b").await;

    a.key_set(entry("k", record(1, "x", b"a"))).await.unwrap();
    b.key_set(entry("k", record(1, "y", b"b"))).await.unwrap();
    settle().await;

    for handle in [&a, &b] {
        let got = handle.key_get(vec!["k".to_string()]).await.unwrap();
        assert_eq!(got["k"].originator_id, "y");
        assert_eq!(got["k"].value.as_deref(), Some(b"b".as_slice()));
    }
}

#[tokio::test(start_paused = true)]
async fn full_sync_delivers_existing_records_to_new_peer() {
    let bus = MessageBus::new();
    let a = spawn_node(&bus, "node-a").await;
    a.key_set(entry("adj:node-a", record(3, "node-a", b"adjacencies")))
        .await
        .unwrap();

    // b shows up later and pulls a full dump from a.
    let b = spawn_node(&bus, "node-b").await;
    b.peer_add(HashMap::from([("node-a".to_string(), peer_spec("node-a"))]))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_secs(2)).await;

    let got = b.key_get(vec!["adj:node-a".to_string()]).await.unwrap();
    assert_eq!(got["adj:node-a"].version, 3);
}

#[tokio::test(start_paused = true)]
async fn full_sync_retries_until_peer_appears() {
    let bus = MessageBus::new();

    let mut config = quiet_config("node-a");
    config.initial_peers = HashMap::from([("node-b".to_string(), peer_spec("node-b"))]);
    let a = KvStore::spawn(config, bus.clone()).await.unwrap();

    // Let a burn a few failed attempts against the absent peer.
    tokio::time::sleep(Duration::from_secs(3)).await;

    let b = spawn_node(&bus, "node-b").await;
    // The flood list names node-a, so a ignores the flooded
    // publication and can only learn the record through full sync.
    b.key_set_with(
        entry("k", record(1, "node-b", b"late")),
        vec!["node-a".to_string()],
        false,
    )
    .await
    .unwrap();

    tokio::time::sleep(Duration::from_secs(20)).await;

    let got = a.key_get(vec!["k".to_string()]).await.unwrap();
    assert_eq!(got["k"].value.as_deref(), Some(b"late".as_slice()));
}

#[tokio::test(start_paused = true)]
async fn anti_entropy_closes_divergence_flooding_missed() {
    let bus = MessageBus::new();

    let mut config = quiet_config("node-a");
    config.db_sync_interval = Duration::from_secs(5);
    let a = KvStore::spawn(config, bus.clone()).await.unwrap();
    let b = spawn_node(&bus, "node-b").await;
    connect(&a, "node-a", &b, "node-b").await;

    // Let the on-add full sync finish first.
    tokio::time::sleep(Duration::from_secs(2)).await;

    // Suppressed flood: only the periodic hash-dump pull can close
    // this gap.
    b.key_set_with(
        entry("k", record(7, "node-b", b"divergent")),
        vec!["node-a".to_string()],
        false,
    )
    .await
    .unwrap();

    let missing = a.key_get(vec!["k".to_string()]).await.unwrap();
    assert!(missing.is_empty());

    tokio::time::sleep(Duration::from_secs(15)).await;

    let got = a.key_get(vec!["k".to_string()]).await.unwrap();
    assert_eq!(got["k"].version, 7);
}

#[tokio::test(start_paused = true)]
async fn own_publication_is_never_redelivered() {
    let bus = MessageBus::new();
    let a = spawn_node(&bus, "node-a").await;
    let b = spawn_node(&bus, "node-b").await;
    connect(&a, "node-a", &b, "node-b").await;

    let published = a
        .key_set(entry("k", record(1, "node-a", b"v")))
        .await
        .unwrap();
    assert_eq!(published.originator.as_deref(), Some("node-a"));
    assert!(published.node_ids.contains(&"node-a".to_string()));
    settle().await;

    // b re-flooded the delta tagged with a's originator id; a must not
    // have looped it back into another version.
    let got = a.key_get(vec!["k".to_string()]).await.unwrap();
    assert_eq!(got["k"], record(1, "node-a", b"v"));
}

#[tokio::test(start_paused = true)]
async fn sealed_domain_converges() {
    let bus = MessageBus::new();
    let keypair = Keypair::generate();

    let mut config_a = quiet_config("node-a");
    config_a.keypair = Some(keypair.clone());
    let mut config_b = quiet_config("node-b");
    config_b.keypair = Some(keypair);

    let a = KvStore::spawn(config_a, bus.clone()).await.unwrap();
    let b = KvStore::spawn(config_b, bus.clone()).await.unwrap();
    connect(&a, "node-a", &b, "node-b").await;

    a.key_set(entry("k", record(1, "node-a", b"secret")))
        .await
        .unwrap();
    settle().await;

    let got = b.key_get(vec!["k".to_string()]).await.unwrap();
    assert_eq!(got["k"].value.as_deref(), Some(b"secret".as_slice()));
}

#[tokio::test(start_paused = true)]
async fn node_outside_the_domain_learns_nothing() {
    let bus = MessageBus::new();

    let mut config_a = quiet_config("node-a");
    config_a.keypair = Some(Keypair::generate());
    let a = KvStore::spawn(config_a, bus.clone()).await.unwrap();
    // b has no keypair and cannot open a's sealed floods.
    let b = spawn_node(&bus, "node-b").await;
    connect(&a, "node-a", &b, "node-b").await;
    settle().await;

    a.key_set(entry("k", record(1, "node-a", b"secret")))
        .await
        .unwrap();
    settle().await;

    let got = b.key_get(vec!["k".to_string()]).await.unwrap();
    assert!(got.is_empty(), "unsealed node decoded sealed traffic");
}
