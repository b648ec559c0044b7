//! Shared harness: N store nodes wired together on one MessageBus.
#![allow(dead_code)] // not every test binary uses every helper

use std::collections::HashMap;
use std::time::Duration;
use weft_net::MessageBus;
use weft_proto::PeerSpec;
use weft_store::{KvStore, KvStoreConfig, KvStoreHandle};

/// Endpoints other nodes use to reach `name`, matching
/// `KvStoreConfig::for_node`.
pub fn peer_spec(name: &str) -> PeerSpec {
    PeerSpec {
        pub_url: format!("weft://{name}/global/pub"),
        cmd_url: format!("weft://{name}/global/cmd"),
    }
}

/// Config with anti-entropy pushed out of the way so tests exercise
/// one mechanism at a time.
pub fn quiet_config(name: &str) -> KvStoreConfig {
    let mut config = KvStoreConfig::for_node(name);
    config.db_sync_interval = Duration::from_secs(3_600);
    config.stats_submit_interval = Duration::from_secs(3_600);
    config
}

pub async fn spawn_node(bus: &MessageBus, name: &str) -> KvStoreHandle {
    KvStore::spawn(quiet_config(name), bus.clone())
        .await
        .expect("store failed to spawn")
}

/// Make `a` and `b` peers of each other.
pub async fn connect(a: &KvStoreHandle, a_name: &str, b: &KvStoreHandle, b_name: &str) {
    a.peer_add(HashMap::from([(b_name.to_string(), peer_spec(b_name))]))
        .await
        .expect("peer_add failed");
    b.peer_add(HashMap::from([(a_name.to_string(), peer_spec(a_name))]))
        .await
        .expect("peer_add failed");
}
