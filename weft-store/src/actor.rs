//! KvStore actor — the single event loop owning the replicated map.
//!
//! All mutable state (store map, peer table, TTL queue, backoff
//! controllers) lives inside the loop; every handler runs to
//! completion before the next event is taken, so invariants hold
//! between handler invocations by construction. Peer requests fan out
//! in spawned tasks that post their results back into the loop as
//! events.

use crate::backoff::ExponentialBackoff;
use crate::error::StoreError;
use crate::handle::{KvStoreHandle, StoreCmd};
use crate::ttl_queue::{TtlCountdownEntry, TtlCountdownQueue};
use metrics::{counter, gauge};
use prost::Message;
use rand::seq::IteratorRandom;
use rand::Rng;
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use weft_model::{merge_key_values, MergeDelta, SystemClock, Value};
use weft_net::{bus::validate_url, BusRequest, Keypair, MessageBus};
use weft_proto::convert::{to_model_map, to_wire_map};
use weft_proto::{request, ErrorCode, PeerSpec, Publication, Reply, Request};

/// How often due entries in the full-sync backoff set are retried.
const FULL_SYNC_TICK: Duration = Duration::from_secs(1);
/// Timeout for any single request to a peer.
const SYNC_REQUEST_TIMEOUT: Duration = Duration::from_secs(4);
/// Backoff bounds for peers owing a full sync.
const SYNC_BACKOFF_BASE: Duration = Duration::from_secs(4);
const SYNC_BACKOFF_MAX: Duration = Duration::from_secs(256);

pub const DEFAULT_DB_SYNC_INTERVAL: Duration = Duration::from_secs(60);
pub const DEFAULT_STATS_SUBMIT_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct KvStoreConfig {
    /// Unique within the routing domain.
    pub node_id: String,
    pub local_pub_url: String,
    pub global_pub_url: String,
    pub local_cmd_url: String,
    pub global_cmd_url: String,
    /// Base interval for the anti-entropy pull; jitter is added per
    /// round.
    pub db_sync_interval: Duration,
    pub stats_submit_interval: Duration,
    pub initial_peers: HashMap<String, PeerSpec>,
    /// When set, traffic on the global channels is sealed.
    pub keypair: Option<Keypair>,
}

impl KvStoreConfig {
    /// Config with conventional URLs derived from the node id.
    pub fn for_node(node_id: impl Into<String>) -> Self {
        let node_id = node_id.into();
        Self {
            local_pub_url: format!("weft://{node_id}/local/pub"),
            global_pub_url: format!("weft://{node_id}/global/pub"),
            local_cmd_url: format!("weft://{node_id}/local/cmd"),
            global_cmd_url: format!("weft://{node_id}/global/cmd"),
            db_sync_interval: DEFAULT_DB_SYNC_INTERVAL,
            stats_submit_interval: DEFAULT_STATS_SUBMIT_INTERVAL,
            initial_peers: HashMap::new(),
            keypair: None,
            node_id,
        }
    }

    fn validate(&self) -> Result<(), StoreError> {
        if self.node_id.is_empty() {
            return Err(StoreError::Config("node_id must not be empty".into()));
        }
        for url in [
            &self.local_pub_url,
            &self.global_pub_url,
            &self.local_cmd_url,
            &self.global_cmd_url,
        ] {
            validate_url(url).map_err(|e| StoreError::Config(e.to_string()))?;
        }
        if self.db_sync_interval.is_zero() || self.stats_submit_interval.is_zero() {
            return Err(StoreError::Config("intervals must be non-zero".into()));
        }
        if self.initial_peers.contains_key(&self.node_id) {
            return Err(StoreError::Config(format!(
                "initial peer set contains this node ({})",
                self.node_id
            )));
        }
        for (name, spec) in &self.initial_peers {
            validate_url(&spec.pub_url)
                .and_then(|_| validate_url(&spec.cmd_url))
                .map_err(|e| StoreError::Config(format!("peer {name}: {e}")))?;
        }
        Ok(())
    }
}

/// Spawner for the store actor.
pub struct KvStore;

impl KvStore {
    /// Validate the configuration, bind both command endpoints and
    /// start the event loop. Binding failures and invalid
    /// configuration are construction errors; everything after this
    /// point is logged and survived.
    pub async fn spawn(config: KvStoreConfig, bus: MessageBus) -> Result<KvStoreHandle, StoreError> {
        config.validate()?;

        let local_cmd_rx = bus.bind(&config.local_cmd_url).await?;
        let global_cmd_rx = bus.bind(&config.global_cmd_url).await?;

        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        let (event_tx, event_rx) = mpsc::channel(1024);

        let sealed_global = config.keypair.is_some();
        let endpoint_tasks = vec![
            tokio::spawn(serve_endpoint(local_cmd_rx, event_tx.clone(), false)),
            tokio::spawn(serve_endpoint(global_cmd_rx, event_tx.clone(), sealed_global)),
        ];

        let initial_peers = config.initial_peers.clone();
        let mut actor = KvStoreActor {
            config,
            bus,
            store: HashMap::new(),
            peers: HashMap::new(),
            peers_to_sync_with: HashMap::new(),
            sync_in_flight: HashSet::new(),
            ttl_queue: TtlCountdownQueue::new(),
            cmd_rx,
            event_rx,
            event_tx,
            peer_sub_tasks: HashMap::new(),
            endpoint_tasks,
        };
        actor.add_peers(initial_peers).await;

        tokio::spawn(async move {
            actor.run().await;
        });
        Ok(KvStoreHandle::new(cmd_tx))
    }
}

/// Results and inputs arriving from outside the loop.
enum Event {
    WireRequest {
        payload: Vec<u8>,
        reply: oneshot::Sender<Vec<u8>>,
        sealed: bool,
    },
    PeerPublication {
        peer: String,
        payload: Vec<u8>,
    },
    FullSyncDone {
        peer: String,
        result: Result<Publication, StoreError>,
    },
    HashDumpDone {
        peer: String,
        result: Result<HashMap<String, Value>, StoreError>,
    },
    DiffDone {
        peer: String,
        result: Result<Publication, StoreError>,
    },
}

struct KvStoreActor {
    config: KvStoreConfig,
    bus: MessageBus,
    store: HashMap<String, Value>,
    peers: HashMap<String, PeerSpec>,
    peers_to_sync_with: HashMap<String, ExponentialBackoff>,
    sync_in_flight: HashSet<String>,
    ttl_queue: TtlCountdownQueue,
    cmd_rx: mpsc::Receiver<StoreCmd>,
    event_rx: mpsc::Receiver<Event>,
    event_tx: mpsc::Sender<Event>,
    peer_sub_tasks: HashMap<String, JoinHandle<()>>,
    endpoint_tasks: Vec<JoinHandle<()>>,
}

impl KvStoreActor {
    async fn run(&mut self) {
        tracing::info!(node_id = %self.config.node_id, "kvstore started");
        let mut full_sync_tick = tokio::time::interval(FULL_SYNC_TICK);
        full_sync_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut stats_tick = tokio::time::interval(self.config.stats_submit_interval);
        stats_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut db_sync_deadline = Instant::now() + jittered(self.config.db_sync_interval);

        loop {
            let ttl_deadline = self.ttl_queue.next_expiry();
            tokio::select! {
                cmd = self.cmd_rx.recv() => match cmd {
                    None | Some(StoreCmd::Shutdown) => break,
                    Some(cmd) => self.handle_cmd(cmd).await,
                },
                Some(event) = self.event_rx.recv() => self.handle_event(event).await,
                _ = full_sync_tick.tick() => self.request_full_sync_from_peers(),
                _ = tokio::time::sleep_until(db_sync_deadline) => {
                    self.request_db_sync();
                    db_sync_deadline = Instant::now() + jittered(self.config.db_sync_interval);
                }
                _ = stats_tick.tick() => self.submit_stats(),
                _ = tokio::time::sleep_until(ttl_deadline.unwrap_or_else(Instant::now)),
                        if ttl_deadline.is_some() => {
                    self.countdown_ttl().await;
                }
            }
        }

        self.teardown();
        tracing::info!(node_id = %self.config.node_id, "kvstore stopped");
    }

    fn teardown(&mut self) {
        for task in self.endpoint_tasks.drain(..) {
            task.abort();
        }
        for (_, task) in self.peer_sub_tasks.drain() {
            task.abort();
        }
    }

    // ==================== Command dispatch ====================

    async fn handle_cmd(&mut self, cmd: StoreCmd) {
        match cmd {
            StoreCmd::KeySet {
                key_vals,
                node_ids,
                force,
                resp,
            } => {
                let publication = self.key_set(key_vals, node_ids, force).await;
                let _ = resp.send(publication);
            }
            StoreCmd::KeyGet { keys, resp } => {
                let _ = resp.send(self.get_key_vals(&keys));
            }
            StoreCmd::KeyDump { prefix, resp } => {
                let _ = resp.send(self.dump_all_with_prefix(&prefix));
            }
            StoreCmd::HashDump { prefix, resp } => {
                let _ = resp.send(self.dump_hash_with_prefix(&prefix));
            }
            StoreCmd::DumpDiff { summaries, resp } => {
                let _ = resp.send(self.dump_difference(&summaries));
            }
            StoreCmd::PeerAdd { peers, resp } => {
                self.add_peers(peers).await;
                let _ = resp.send(self.peers.clone());
            }
            StoreCmd::PeerDel { peer_names, resp } => {
                self.del_peers(&peer_names);
                let _ = resp.send(self.peers.clone());
            }
            StoreCmd::PeerDump { resp } => {
                let _ = resp.send(self.peers.clone());
            }
            StoreCmd::Shutdown => unreachable!("handled by the run loop"),
        }
    }

    async fn handle_event(&mut self, event: Event) {
        match event {
            Event::WireRequest {
                payload,
                reply,
                sealed,
            } => self.handle_wire_request(payload, reply, sealed).await,
            Event::PeerPublication { peer, payload } => {
                self.handle_peer_publication(&peer, payload).await;
            }
            Event::FullSyncDone { peer, result } => {
                self.handle_full_sync_done(peer, result).await;
            }
            Event::HashDumpDone { peer, result } => {
                self.handle_hash_dump_done(peer, result);
            }
            Event::DiffDone { peer, result } => {
                self.handle_diff_done(peer, result).await;
            }
        }
    }

    // ==================== Store operations ====================

    /// Merge (or force-install) records, arm TTL countdowns, and flood
    /// the resulting delta. Returns the accepted-delta publication.
    async fn key_set(
        &mut self,
        mut key_vals: HashMap<String, Value>,
        node_ids: Vec<String>,
        force: bool,
    ) -> Publication {
        // Originators may leave the hash to the store.
        for val in key_vals.values_mut() {
            if val.hash == 0 {
                val.rehash();
            }
        }

        let delta = if force {
            self.force_install(key_vals)
        } else {
            merge_key_values(&mut self.store, key_vals)
        };
        self.note_hash_conflicts(&delta);
        self.update_ttl_queue(&delta);

        let publication =
            self.make_publication(delta, node_ids, Some(self.config.node_id.clone()));
        if !publication.key_vals.is_empty() || !publication.expired_keys.is_empty() {
            self.publish_and_flood(&publication).await;
        }
        publication
    }

    /// Install records verbatim. The force path exists for originators
    /// re-announcing state after restart; it skips the merge
    /// comparison entirely.
    fn force_install(&mut self, key_vals: HashMap<String, Value>) -> MergeDelta {
        let mut delta = MergeDelta::default();
        for (key, val) in key_vals {
            if val.is_delete() {
                if self.store.remove(&key).is_some() {
                    delta.expired.push(key.clone());
                }
            } else {
                self.store.insert(key.clone(), val.clone());
            }
            delta.updates.insert(key, val);
        }
        delta
    }

    fn get_key_vals(&self, keys: &[String]) -> HashMap<String, Value> {
        keys.iter()
            .filter_map(|k| self.store.get(k).map(|v| (k.clone(), v.clone())))
            .collect()
    }

    fn dump_all_with_prefix(&self, prefix: &str) -> HashMap<String, Value> {
        self.store
            .iter()
            .filter(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    fn dump_hash_with_prefix(&self, prefix: &str) -> HashMap<String, Value> {
        self.store
            .iter()
            .filter(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.hash_summary()))
            .collect()
    }

    /// Records the owner of `summaries` is missing or holds with a
    /// different identity. The caller's merge engine decides
    /// direction.
    fn dump_difference(&self, summaries: &HashMap<String, Value>) -> HashMap<String, Value> {
        self.store
            .iter()
            .filter(|(key, val)| match summaries.get(*key) {
                None => true,
                Some(summary) => summary.identity() != val.identity(),
            })
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    fn note_hash_conflicts(&self, delta: &MergeDelta) {
        for key in &delta.hash_conflicts {
            tracing::error!(
                key = %key,
                "rejected record: same version and originator with differing hash"
            );
        }
        if !delta.hash_conflicts.is_empty() {
            counter!("kvstore.hash_conflicts").increment(delta.hash_conflicts.len() as u64);
        }
    }

    fn update_ttl_queue(&mut self, delta: &MergeDelta) {
        let now = Instant::now();
        for (key, val) in &delta.updates {
            if val.is_delete() || val.is_ttl_infinite() {
                continue;
            }
            self.ttl_queue.push(TtlCountdownEntry {
                expiry: now + Duration::from_millis(val.ttl_ms as u64),
                key: key.clone(),
                version: val.version,
                ttl_version: val.ttl_version,
            });
        }
    }

    async fn countdown_ttl(&mut self) {
        let now = Instant::now();
        let mut expired = Vec::new();
        while let Some(entry) = self.ttl_queue.pop_due(now) {
            let live = match self.store.get(&entry.key) {
                Some(val) => val,
                None => continue,
            };
            // Refreshed or replaced records leave stale queue entries
            // behind; they are discarded here.
            if live.is_ttl_infinite()
                || live.version != entry.version
                || live.ttl_version != entry.ttl_version
            {
                continue;
            }
            self.store.remove(&entry.key);
            expired.push(entry.key);
        }
        if expired.is_empty() {
            return;
        }

        counter!("kvstore.expired_keys").increment(expired.len() as u64);
        tracing::debug!(count = expired.len(), "purged expired keys");
        let publication = Publication {
            key_vals: HashMap::new(),
            expired_keys: expired,
            node_ids: vec![self.config.node_id.clone()],
            originator: Some(self.config.node_id.clone()),
        };
        self.publish_and_flood(&publication).await;
    }

    // ==================== Flooding ====================

    fn make_publication(
        &self,
        delta: MergeDelta,
        mut node_ids: Vec<String>,
        originator: Option<String>,
    ) -> Publication {
        if !node_ids.iter().any(|n| n == &self.config.node_id) {
            node_ids.push(self.config.node_id.clone());
        }
        Publication {
            key_vals: to_wire_map(delta.updates),
            expired_keys: delta.expired,
            node_ids,
            originator,
        }
    }

    async fn publish_and_flood(&self, publication: &Publication) {
        let bytes = publication.encode_to_vec();
        if let Err(e) = self.bus.publish(&self.config.local_pub_url, bytes.clone()).await {
            tracing::warn!(error = %e, "local publish failed");
        }

        let global = match &self.config.keypair {
            Some(keypair) => match weft_net::seal(keypair, &bytes) {
                Ok(sealed) => sealed,
                Err(e) => {
                    tracing::error!(error = %e, "sealing publication failed, not flooding");
                    return;
                }
            },
            None => bytes,
        };
        if let Err(e) = self.bus.publish(&self.config.global_pub_url, global).await {
            tracing::warn!(error = %e, "global publish failed");
        }
    }

    async fn handle_peer_publication(&mut self, peer: &str, payload: Vec<u8>) {
        let Some(plain) = self.open_payload(payload) else {
            return;
        };
        let publication = match Publication::decode(plain.as_slice()) {
            Ok(publication) => publication,
            Err(e) => {
                counter!("kvstore.undecodable_publications").increment(1);
                tracing::warn!(peer = %peer, error = %e, "dropping undecodable publication");
                return;
            }
        };

        // Loop suppression: never re-process our own floods.
        if publication.originator.as_deref() == Some(self.config.node_id.as_str()) {
            return;
        }
        if publication.node_ids.iter().any(|n| n == &self.config.node_id) {
            return;
        }

        let incoming = to_model_map(publication.key_vals);
        let delta = merge_key_values(&mut self.store, incoming);
        self.note_hash_conflicts(&delta);
        if delta.is_empty() {
            return;
        }
        self.update_ttl_queue(&delta);

        // Re-flood with the original originator tag so it never loops
        // back to its source; the records keep their own identities.
        let out = self.make_publication(delta, publication.node_ids, publication.originator);
        self.publish_and_flood(&out).await;
    }

    /// Merge records pulled via full sync or anti-entropy and flood
    /// whatever was new to us.
    async fn merge_sync_response(&mut self, publication: Publication) -> usize {
        let incoming = to_model_map(publication.key_vals);
        let delta = merge_key_values(&mut self.store, incoming);
        self.note_hash_conflicts(&delta);
        let changed = delta.updates.len() + delta.expired.len();
        if delta.is_empty() {
            return changed;
        }
        self.update_ttl_queue(&delta);
        let out = self.make_publication(delta, Vec::new(), Some(self.config.node_id.clone()));
        self.publish_and_flood(&out).await;
        changed
    }

    // ==================== Peer management ====================

    async fn add_peers(&mut self, peers: HashMap<String, PeerSpec>) {
        for (name, spec) in peers {
            if name == self.config.node_id {
                tracing::warn!("ignoring peer entry naming this node");
                continue;
            }
            if validate_url(&spec.pub_url)
                .and_then(|_| validate_url(&spec.cmd_url))
                .is_err()
            {
                tracing::warn!(peer = %name, "ignoring peer with invalid endpoints");
                continue;
            }

            // Subscribe before acking the add, so no publication
            // between the ack and the first poll can be missed.
            let rx = match self.bus.subscribe(&spec.pub_url).await {
                Ok(rx) => rx,
                Err(e) => {
                    tracing::warn!(peer = %name, error = %e, "peer subscription failed");
                    continue;
                }
            };
            if let Some(task) = self.peer_sub_tasks.remove(&name) {
                task.abort();
            }
            self.spawn_peer_subscription(name.clone(), rx);
            self.peers.insert(name.clone(), spec);
            self.peers_to_sync_with
                .insert(name.clone(), ExponentialBackoff::new(SYNC_BACKOFF_BASE, SYNC_BACKOFF_MAX));
            tracing::info!(peer = %name, "peer added, full sync scheduled");
        }
    }

    fn del_peers(&mut self, peer_names: &[String]) {
        for name in peer_names {
            if self.peers.remove(name).is_none() {
                continue;
            }
            if let Some(task) = self.peer_sub_tasks.remove(name) {
                task.abort();
            }
            self.peers_to_sync_with.remove(name);
            self.sync_in_flight.remove(name);
            tracing::info!(peer = %name, "peer removed");
        }
    }

    fn spawn_peer_subscription(&mut self, name: String, mut rx: broadcast::Receiver<Vec<u8>>) {
        let event_tx = self.event_tx.clone();
        let peer = name.clone();
        let task = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(payload) => {
                        let event = Event::PeerPublication {
                            peer: peer.clone(),
                            payload,
                        };
                        if event_tx.send(event).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        tracing::warn!(peer = %peer, missed, "publication subscription lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        self.peer_sub_tasks.insert(name, task);
    }

    // ==================== Full sync ====================

    fn request_full_sync_from_peers(&mut self) {
        let clock = SystemClock;
        let due: Vec<String> = self
            .peers_to_sync_with
            .iter()
            .filter(|(name, backoff)| {
                backoff.can_try_now(&clock) && !self.sync_in_flight.contains(*name)
            })
            .map(|(name, _)| name.clone())
            .collect();

        for name in due {
            let Some(spec) = self.peers.get(&name) else {
                self.peers_to_sync_with.remove(&name);
                continue;
            };
            self.sync_in_flight.insert(name.clone());
            tracing::debug!(peer = %name, "requesting full sync");

            let bus = self.bus.clone();
            let keypair = self.config.keypair.clone();
            let url = spec.cmd_url.clone();
            let event_tx = self.event_tx.clone();
            tokio::spawn(async move {
                let result =
                    peer_request(&bus, &keypair, &url, Request::key_dump(""), SYNC_REQUEST_TIMEOUT)
                        .await;
                let _ = event_tx.send(Event::FullSyncDone { peer: name, result }).await;
            });
        }
    }

    async fn handle_full_sync_done(
        &mut self,
        peer: String,
        result: Result<Publication, StoreError>,
    ) {
        self.sync_in_flight.remove(&peer);
        match result {
            Ok(publication) => {
                self.peers_to_sync_with.remove(&peer);
                counter!("kvstore.full_sync_success").increment(1);
                let merged = self.merge_sync_response(publication).await;
                tracing::info!(peer = %peer, merged, "full sync complete");
            }
            Err(e) => {
                counter!("kvstore.full_sync_failure").increment(1);
                if let Some(backoff) = self.peers_to_sync_with.get_mut(&peer) {
                    backoff.report_failure(&SystemClock);
                    tracing::warn!(
                        peer = %peer,
                        error = %e,
                        retry_in_ms = backoff.current_delay().as_millis() as u64,
                        "full sync failed"
                    );
                }
            }
        }
    }

    // ==================== Anti-entropy ====================

    /// One random connected peer per round: probe with a hash dump,
    /// pull the difference if the summaries diverge.
    fn request_db_sync(&mut self) {
        let Some(peer) = self.peers.keys().choose(&mut rand::thread_rng()).cloned() else {
            return;
        };
        let spec = self.peers[&peer].clone();
        tracing::debug!(peer = %peer, "anti-entropy probe");

        let bus = self.bus.clone();
        let keypair = self.config.keypair.clone();
        let event_tx = self.event_tx.clone();
        tokio::spawn(async move {
            let result = peer_request(
                &bus,
                &keypair,
                &spec.cmd_url,
                Request::hash_dump(""),
                SYNC_REQUEST_TIMEOUT,
            )
            .await
            .map(|publication| to_model_map(publication.key_vals));
            let _ = event_tx.send(Event::HashDumpDone { peer, result }).await;
        });
    }

    fn handle_hash_dump_done(
        &mut self,
        peer: String,
        result: Result<HashMap<String, Value>, StoreError>,
    ) {
        let theirs = match result {
            Ok(summaries) => summaries,
            Err(e) => {
                tracing::debug!(peer = %peer, error = %e, "anti-entropy probe failed");
                return;
            }
        };

        let divergent = theirs.len() != self.store.len()
            || theirs.iter().any(|(key, summary)| match self.store.get(key) {
                None => true,
                Some(val) => val.identity() != summary.identity(),
            });
        if !divergent {
            counter!("kvstore.anti_entropy_in_sync").increment(1);
            return;
        }

        let Some(spec) = self.peers.get(&peer).cloned() else {
            return;
        };
        let summaries = to_wire_map(self.dump_hash_with_prefix(""));
        tracing::debug!(peer = %peer, "anti-entropy divergence, pulling diff");

        let bus = self.bus.clone();
        let keypair = self.config.keypair.clone();
        let event_tx = self.event_tx.clone();
        tokio::spawn(async move {
            let result = peer_request(
                &bus,
                &keypair,
                &spec.cmd_url,
                Request::dump_diff(summaries),
                SYNC_REQUEST_TIMEOUT,
            )
            .await;
            let _ = event_tx.send(Event::DiffDone { peer, result }).await;
        });
    }

    async fn handle_diff_done(&mut self, peer: String, result: Result<Publication, StoreError>) {
        match result {
            Ok(publication) => {
                let merged = self.merge_sync_response(publication).await;
                counter!("kvstore.anti_entropy_pulls").increment(1);
                tracing::debug!(peer = %peer, merged, "anti-entropy pull complete");
            }
            Err(e) => {
                tracing::debug!(peer = %peer, error = %e, "anti-entropy pull failed");
            }
        }
    }

    // ==================== Wire command endpoint ====================

    async fn handle_wire_request(
        &mut self,
        payload: Vec<u8>,
        reply: oneshot::Sender<Vec<u8>>,
        sealed: bool,
    ) {
        let plain = if sealed {
            match self.open_payload(payload) {
                Some(plain) => plain,
                // Not decryptable for us: drop, let the caller time
                // out rather than answer in the clear.
                None => return,
            }
        } else {
            payload
        };

        let reply_msg = match Request::decode(plain.as_slice()) {
            Err(e) => {
                counter!("kvstore.bad_requests").increment(1);
                tracing::warn!(error = %e, "undecodable request");
                Reply::error(ErrorCode::BadRequest, e.to_string())
            }
            Ok(request) => match request.command {
                Some(request::Command::KeySet(req)) => {
                    let publication = self
                        .key_set(to_model_map(req.key_vals), req.node_ids, req.force)
                        .await;
                    Reply::publication(publication)
                }
                Some(request::Command::KeyGet(req)) => Reply::publication(Publication {
                    key_vals: to_wire_map(self.get_key_vals(&req.keys)),
                    ..Default::default()
                }),
                Some(request::Command::KeyDump(req)) => Reply::publication(Publication {
                    key_vals: to_wire_map(self.dump_all_with_prefix(&req.prefix)),
                    ..Default::default()
                }),
                Some(request::Command::HashDump(req)) => Reply::publication(Publication {
                    key_vals: to_wire_map(self.dump_hash_with_prefix(&req.prefix)),
                    ..Default::default()
                }),
                Some(request::Command::DumpDiff(req)) => Reply::publication(Publication {
                    key_vals: to_wire_map(
                        self.dump_difference(&to_model_map(req.summaries)),
                    ),
                    ..Default::default()
                }),
                Some(request::Command::PeerAdd(req)) => {
                    self.add_peers(req.peers).await;
                    Reply::peers(self.peers.clone())
                }
                Some(request::Command::PeerDel(req)) => {
                    self.del_peers(&req.peer_names);
                    Reply::peers(self.peers.clone())
                }
                Some(request::Command::PeerDump(_)) => Reply::peers(self.peers.clone()),
                None => Reply::error(ErrorCode::BadRequest, "missing command"),
            },
        };

        let mut bytes = reply_msg.encode_to_vec();
        if sealed {
            match &self.config.keypair {
                Some(keypair) => match weft_net::seal(keypair, &bytes) {
                    Ok(sealed_bytes) => bytes = sealed_bytes,
                    Err(e) => {
                        tracing::error!(error = %e, "sealing reply failed");
                        return;
                    }
                },
                None => return,
            }
        }
        let _ = reply.send(bytes);
    }

    /// Unseal inbound global-channel traffic when a keypair is
    /// configured. `None` means the message was foreign or forged.
    fn open_payload(&self, payload: Vec<u8>) -> Option<Vec<u8>> {
        match &self.config.keypair {
            Some(keypair) => match weft_net::open(keypair, &payload) {
                Ok(plain) => Some(plain),
                Err(e) => {
                    counter!("kvstore.unsealable_messages").increment(1);
                    tracing::warn!(error = %e, "dropping unsealable message");
                    None
                }
            },
            None => Some(payload),
        }
    }

    // ==================== Stats ====================

    fn submit_stats(&self) {
        let num_keys = self.store.len();
        let num_peers = self.peers.len();
        let pending_full_sync = self.peers_to_sync_with.len();
        gauge!("kvstore.num_keys").set(num_keys as f64);
        gauge!("kvstore.num_peers").set(num_peers as f64);
        gauge!("kvstore.pending_full_sync").set(pending_full_sync as f64);
        tracing::debug!(num_keys, num_peers, pending_full_sync, "store stats");
    }
}

/// Forward requests from a bound bus endpoint into the actor loop.
async fn serve_endpoint(
    mut rx: mpsc::Receiver<BusRequest>,
    event_tx: mpsc::Sender<Event>,
    sealed: bool,
) {
    while let Some(req) = rx.recv().await {
        let event = Event::WireRequest {
            payload: req.payload,
            reply: req.reply,
            sealed,
        };
        if event_tx.send(event).await.is_err() {
            break;
        }
    }
}

/// One request/reply round to a peer's command endpoint, sealed when a
/// keypair is configured.
async fn peer_request(
    bus: &MessageBus,
    keypair: &Option<Keypair>,
    url: &str,
    request: Request,
    timeout: Duration,
) -> Result<Publication, StoreError> {
    let mut bytes = request.encode_to_vec();
    if let Some(kp) = keypair {
        bytes = weft_net::seal(kp, &bytes)?;
    }

    let reply = bus.request(url, bytes, timeout).await?;
    let reply = match keypair {
        Some(kp) => weft_net::open(kp, &reply)?,
        None => reply,
    };

    let reply = Reply::decode(reply.as_slice())?;
    if !reply.is_ok() {
        return Err(StoreError::Remote(reply.message));
    }
    Ok(reply.publication.unwrap_or_default())
}

/// db-sync interval with ±20 % jitter, so a fabric of nodes does not
/// probe in lockstep.
fn jittered(interval: Duration) -> Duration {
    let base = interval.as_millis() as u64;
    let spread = base / 5;
    if spread == 0 {
        return interval;
    }
    let low = base - spread;
    Duration::from_millis(rand::thread_rng().gen_range(low..base + spread))
}
