//! HealthChecker actor — ping scheduling and the PING/ACK protocol.
//!
//! The actor owns the UDPv6 socket, the per-node info table and the
//! current ping set. It learns the topology passively from the
//! store's publish channel and never retries a lost ping: loss is
//! observable as the gap between `last_val_sent` and
//! `last_ack_from_node`.

use crate::error::HealthError;
use crate::handle::{HealthCheckerHandle, HealthCmd};
use metrics::{counter, gauge};
use prost::Message;
use rand::Rng;
use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, Ipv6Addr, SocketAddr, SocketAddrV6};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::{broadcast, mpsc};
use tokio::time::MissedTickBehavior;
use weft_model::Value;
use weft_net::{bus::validate_url, BusRequest, MessageBus};
use weft_proto::convert::to_model_map;
use weft_proto::{
    AdjacencyDatabase, HealthCheckerCmd, HealthCheckerMessage, HealthCheckerMessageType,
    HealthCheckerPeekReply, HealthCheckerRequest, NodeHealthInfo, PrefixDatabase, Publication,
    Reply, Request, ADJACENCY_MARKER, PREFIX_MARKER,
};

/// Largest health-check datagram accepted or produced.
const MAX_PING_PACKET_SIZE: usize = 1028;
const STORE_REQUEST_TIMEOUT: Duration = Duration::from_secs(2);

pub const DEFAULT_UDP_PING_PORT: u16 = 6666;
pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(3);

/// How ping targets are selected from the observed topology.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthCheckOption {
    /// The neighbors of this node's neighbors, minus this node and
    /// its direct neighbors.
    NeighborOfNeighbor,
    /// Every node in the observed topology except this one.
    Topology,
    /// Bernoulli sample over all known nodes at `health_check_pct`.
    Random,
}

#[derive(Debug, Clone)]
pub struct HealthCheckerConfig {
    pub node_name: String,
    pub option: HealthCheckOption,
    /// Sampling percentage for `Random`. Values above 100 are a fatal
    /// configuration error.
    pub health_check_pct: u32,
    /// Destination port pinged on remote nodes.
    pub udp_ping_port: u16,
    /// Local bind port; 0 binds an ephemeral port.
    pub udp_bind_port: u16,
    pub ping_interval: Duration,
    pub stats_submit_interval: Duration,
    /// DSCP value requested for ping traffic.
    pub ip_tos: Option<u8>,
    pub store_cmd_url: String,
    pub store_pub_url: String,
    /// Request/reply endpoint serving PEEK.
    pub cmd_url: String,
}

impl HealthCheckerConfig {
    /// Config wired to the conventional store URLs of `node_name`.
    pub fn for_node(node_name: impl Into<String>) -> Self {
        let node_name = node_name.into();
        Self {
            option: HealthCheckOption::Topology,
            health_check_pct: 50,
            udp_ping_port: DEFAULT_UDP_PING_PORT,
            udp_bind_port: DEFAULT_UDP_PING_PORT,
            ping_interval: DEFAULT_PING_INTERVAL,
            stats_submit_interval: Duration::from_secs(60),
            ip_tos: None,
            store_cmd_url: format!("weft://{node_name}/local/cmd"),
            store_pub_url: format!("weft://{node_name}/local/pub"),
            cmd_url: format!("weft://{node_name}/health/cmd"),
            node_name,
        }
    }

    fn validate(&self) -> Result<(), HealthError> {
        if self.node_name.is_empty() {
            return Err(HealthError::Config("node_name must not be empty".into()));
        }
        if self.health_check_pct > 100 {
            return Err(HealthError::Config(format!(
                "invalid health_check_pct value: {}",
                self.health_check_pct
            )));
        }
        validate_url(&self.store_cmd_url)
            .and_then(|_| validate_url(&self.store_pub_url))
            .and_then(|_| validate_url(&self.cmd_url))
            .map_err(|e| HealthError::Config(e.to_string()))
    }
}

/// Ping bookkeeping for one remote node.
#[derive(Debug, Default, Clone)]
struct NodeInfo {
    neighbors: Vec<String>,
    ip_address: Option<Ipv6Addr>,
    last_val_sent: i64,
    last_ack_from_node: i64,
    last_ack_to_node: i64,
}

impl NodeInfo {
    fn is_idle(&self) -> bool {
        self.last_val_sent == 0 && self.last_ack_from_node == 0 && self.last_ack_to_node == 0
    }

    fn to_proto(&self) -> NodeHealthInfo {
        NodeHealthInfo {
            neighbors: self.neighbors.clone(),
            ip_address: self
                .ip_address
                .map(|ip| ip.to_string())
                .unwrap_or_default(),
            last_val_sent: self.last_val_sent,
            last_ack_from_node: self.last_ack_from_node,
            last_ack_to_node: self.last_ack_to_node,
        }
    }
}

/// Spawner for the health-checker actor.
pub struct HealthChecker;

impl HealthChecker {
    /// Validate the configuration, bind the ping socket and start the
    /// loop. Configuration and bind failures are construction errors.
    pub async fn spawn(
        config: HealthCheckerConfig,
        bus: MessageBus,
    ) -> Result<HealthCheckerHandle, HealthError> {
        config.validate()?;

        let bind_addr = SocketAddrV6::new(Ipv6Addr::UNSPECIFIED, config.udp_bind_port, 0, 0);
        let socket = UdpSocket::bind(bind_addr).await?;
        let local_addr = socket.local_addr()?;
        if let Some(tos) = config.ip_tos {
            tracing::debug!(tos, "DSCP marking requested for ping traffic");
        }

        let store_rx = bus.subscribe(&config.store_pub_url).await?;
        let wire_rx = bus.bind(&config.cmd_url).await?;
        let (cmd_tx, cmd_rx) = mpsc::channel(16);

        let mut actor = HealthCheckerActor {
            config,
            bus,
            socket,
            store_rx,
            wire_rx,
            cmd_rx,
            node_info: HashMap::new(),
            nodes_to_ping: HashSet::new(),
            recv_buf: vec![0u8; MAX_PING_PACKET_SIZE],
        };
        actor.load_initial_dumps().await;

        tokio::spawn(async move {
            actor.run().await;
        });
        Ok(HealthCheckerHandle::new(cmd_tx, local_addr))
    }
}

struct HealthCheckerActor {
    config: HealthCheckerConfig,
    bus: MessageBus,
    socket: UdpSocket,
    store_rx: broadcast::Receiver<Vec<u8>>,
    wire_rx: mpsc::Receiver<BusRequest>,
    cmd_rx: mpsc::Receiver<HealthCmd>,
    node_info: HashMap<String, NodeInfo>,
    nodes_to_ping: HashSet<String>,
    recv_buf: Vec<u8>,
}

impl HealthCheckerActor {
    async fn run(&mut self) {
        tracing::info!(node = %self.config.node_name, "health checker started");
        let mut ping_tick = tokio::time::interval(self.config.ping_interval);
        ping_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut stats_tick = tokio::time::interval(self.config.stats_submit_interval);
        stats_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                cmd = self.cmd_rx.recv() => match cmd {
                    None | Some(HealthCmd::Shutdown) => break,
                    Some(HealthCmd::Peek { resp }) => {
                        let _ = resp.send(self.peek());
                    }
                },
                recv = self.socket.recv_from(&mut self.recv_buf) => match recv {
                    Ok((len, src)) => self.process_message(len, src).await,
                    Err(e) => {
                        counter!("health_checker.recv_errors").increment(1);
                        tracing::warn!(error = %e, "ping socket receive failed");
                    }
                },
                publication = self.store_rx.recv() => match publication {
                    Ok(payload) => self.process_store_publication(&payload),
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        tracing::warn!(missed, "store subscription lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => {}
                },
                wire = self.wire_rx.recv() => match wire {
                    Some(req) => self.process_request(req),
                    None => break,
                },
                _ = ping_tick.tick() => {
                    self.print_info();
                    self.ping_nodes().await;
                }
                _ = stats_tick.tick() => self.submit_stats(),
            }
        }
        tracing::info!(node = %self.config.node_name, "health checker stopped");
    }

    /// Seed the node table from the store before watching updates.
    async fn load_initial_dumps(&mut self) {
        for marker in [ADJACENCY_MARKER, PREFIX_MARKER] {
            let request = Request::key_dump(marker).encode_to_vec();
            let bytes = match self
                .bus
                .request(&self.config.store_cmd_url, request, STORE_REQUEST_TIMEOUT)
                .await
            {
                Ok(bytes) => bytes,
                Err(e) => {
                    tracing::error!(error = %e, marker, "initial kv store dump failed");
                    continue;
                }
            };
            match Reply::decode(bytes.as_slice()) {
                Ok(reply) if reply.is_ok() => {
                    if let Some(publication) = reply.publication {
                        for (key, val) in to_model_map(publication.key_vals) {
                            self.process_key_val(&key, &val);
                        }
                    }
                }
                Ok(reply) => {
                    tracing::error!(code = reply.code, marker, "initial kv store dump rejected");
                }
                Err(e) => {
                    tracing::error!(error = %e, marker, "initial kv store dump undecodable");
                }
            }
        }
    }

    // ==================== Store observation ====================

    fn process_store_publication(&mut self, payload: &[u8]) {
        let publication = match Publication::decode(payload) {
            Ok(publication) => publication,
            Err(e) => {
                tracing::warn!(error = %e, "dropping undecodable store publication");
                return;
            }
        };
        for (key, val) in to_model_map(publication.key_vals) {
            self.process_key_val(&key, &val);
        }
    }

    fn process_key_val(&mut self, key: &str, val: &Value) {
        let Some(payload) = &val.value else {
            return;
        };

        if let Some(node) = key.strip_prefix(ADJACENCY_MARKER) {
            match AdjacencyDatabase::decode(payload.as_slice()) {
                Ok(db) => {
                    if db.this_node_name != node {
                        tracing::warn!(
                            key,
                            announced = %db.this_node_name,
                            "adjacency announcement under a foreign key"
                        );
                        return;
                    }
                    self.process_adj_db(db);
                }
                Err(e) => tracing::warn!(key, error = %e, "undecodable adjacency database"),
            }
        } else if let Some(node) = key.strip_prefix(PREFIX_MARKER) {
            match PrefixDatabase::decode(payload.as_slice()) {
                Ok(db) => {
                    if db.this_node_name != node {
                        tracing::warn!(
                            key,
                            announced = %db.this_node_name,
                            "prefix announcement under a foreign key"
                        );
                        return;
                    }
                    self.process_prefix_db(db);
                }
                Err(e) => tracing::warn!(key, error = %e, "undecodable prefix database"),
            }
        }
    }

    fn process_adj_db(&mut self, db: AdjacencyDatabase) {
        let info = self.node_info.entry(db.this_node_name).or_default();
        info.neighbors = db.neighbors;
        self.nodes_to_ping = select_targets(
            self.config.option,
            self.config.health_check_pct,
            &self.config.node_name,
            &self.node_info,
        );
    }

    fn process_prefix_db(&mut self, db: PrefixDatabase) {
        let info = self.node_info.entry(db.this_node_name).or_default();
        info.ip_address = choose_ping_address(info.ip_address, &db.prefixes);
    }

    // ==================== Ping protocol ====================

    async fn ping_nodes(&mut self) {
        let targets: Vec<String> = self.nodes_to_ping.iter().cloned().collect();
        for node in targets {
            let Some(info) = self.node_info.get_mut(&node) else {
                continue;
            };
            let Some(ip) = info.ip_address else {
                continue;
            };
            info.last_val_sent += 1;
            let seq = info.last_val_sent;

            counter!("health_checker.ping_to", "node" => node.clone()).increment(1);
            let addr = SocketAddr::V6(SocketAddrV6::new(ip, self.config.udp_ping_port, 0, 0));
            self.send_datagram(&node, addr, HealthCheckerMessageType::Ping, seq)
                .await;
        }
    }

    async fn process_message(&mut self, len: usize, src: SocketAddr) {
        let message = match HealthCheckerMessage::decode(&self.recv_buf[..len]) {
            Ok(message) => message,
            Err(e) => {
                counter!("health_checker.undecodable_datagrams").increment(1);
                tracing::warn!(%src, error = %e, "dropping undecodable ping datagram");
                return;
            }
        };
        let from = message.from_node_name;

        match HealthCheckerMessageType::try_from(message.msg_type) {
            Ok(HealthCheckerMessageType::Ping) => {
                counter!("health_checker.ping_from", "node" => from.clone()).increment(1);
                let info = self.node_info.entry(from.clone()).or_default();
                info.last_ack_to_node = message.seq_num;
                // Ack straight back to the source address, mirroring
                // the sequence number.
                self.send_datagram(&from, src, HealthCheckerMessageType::Ack, message.seq_num)
                    .await;
            }
            Ok(HealthCheckerMessageType::Ack) => {
                let info = self.node_info.entry(from.clone()).or_default();
                info.last_ack_from_node = message.seq_num;
                let outstanding = info.last_val_sent - info.last_ack_from_node;
                counter!("health_checker.ack_from", "node" => from.clone()).increment(1);
                gauge!("health_checker.seq_num_diff", "node" => from).set(outstanding as f64);
            }
            _ => {
                tracing::warn!(node = %from, msg_type = message.msg_type, "unexpected message type");
            }
        }
    }

    async fn send_datagram(
        &self,
        node: &str,
        addr: SocketAddr,
        msg_type: HealthCheckerMessageType,
        seq_num: i64,
    ) {
        let message = HealthCheckerMessage {
            from_node_name: self.config.node_name.clone(),
            msg_type: msg_type as i32,
            seq_num,
        };
        let packet = message.encode_to_vec();
        if packet.len() > MAX_PING_PACKET_SIZE {
            tracing::error!(node, len = packet.len(), "oversized health-check datagram");
            return;
        }

        match self.socket.send_to(&packet, addr).await {
            Ok(sent) if sent == packet.len() => {}
            Ok(sent) => {
                counter!("health_checker.send_errors").increment(1);
                tracing::warn!(node, %addr, sent, "short health-check datagram send");
            }
            Err(e) => {
                counter!("health_checker.send_errors").increment(1);
                tracing::warn!(node, %addr, error = %e, "failed sending health-check datagram");
            }
        }
    }

    // ==================== Diagnostics ====================

    /// Serve the request/reply command endpoint. Unknown commands get
    /// no reply, like malformed datagrams.
    fn process_request(&self, req: BusRequest) {
        let request = match HealthCheckerRequest::decode(req.payload.as_slice()) {
            Ok(request) => request,
            Err(e) => {
                tracing::error!(error = %e, "undecodable health checker request");
                return;
            }
        };
        match HealthCheckerCmd::try_from(request.cmd) {
            Ok(HealthCheckerCmd::Peek) => {
                let reply = HealthCheckerPeekReply {
                    node_info: self.peek(),
                };
                let _ = req.reply.send(reply.encode_to_vec());
            }
            _ => {
                tracing::error!(cmd = request.cmd, "health checker received unknown command");
            }
        }
    }

    fn peek(&self) -> HashMap<String, NodeHealthInfo> {
        self.node_info
            .iter()
            .filter(|(_, info)| !info.is_idle())
            .map(|(name, info)| (name.clone(), info.to_proto()))
            .collect()
    }

    fn print_info(&self) {
        for (node, info) in &self.node_info {
            tracing::trace!(
                node = %node,
                sent = info.last_val_sent,
                ack_from = info.last_ack_from_node,
                ack_to = info.last_ack_to_node,
                "health checker info"
            );
        }
    }

    fn submit_stats(&self) {
        gauge!("health_checker.nodes_to_ping_size").set(self.nodes_to_ping.len() as f64);
        gauge!("health_checker.nodes_info_size").set(self.node_info.len() as f64);
        gauge!("health_checker.aliveness").set(1.0);
        tracing::debug!(
            nodes_to_ping = self.nodes_to_ping.len(),
            nodes_known = self.node_info.len(),
            "health checker stats"
        );
    }
}

/// Recompute the ping set from the current topology view.
fn select_targets(
    option: HealthCheckOption,
    pct: u32,
    me: &str,
    node_info: &HashMap<String, NodeInfo>,
) -> HashSet<String> {
    let mut targets = HashSet::new();
    match option {
        HealthCheckOption::NeighborOfNeighbor => {
            let my_neighbors = node_info
                .get(me)
                .map(|info| info.neighbors.clone())
                .unwrap_or_default();
            for neighbor in &my_neighbors {
                if let Some(info) = node_info.get(neighbor) {
                    targets.extend(info.neighbors.iter().cloned());
                }
            }
            targets.remove(me);
            for neighbor in &my_neighbors {
                targets.remove(neighbor);
            }
        }
        HealthCheckOption::Topology => {
            targets.extend(node_info.keys().cloned());
            targets.remove(me);
        }
        HealthCheckOption::Random => {
            let mut rng = rand::thread_rng();
            for node in node_info.keys() {
                if rng.gen_range(0..100u32) < pct {
                    targets.insert(node.clone());
                }
            }
            targets.remove(me);
        }
    }
    targets
}

/// Keep the current ping address while the node still announces it;
/// otherwise take the first announced IPv6 address. Announcements
/// with no IPv6 prefix leave the previous choice in place.
fn choose_ping_address(current: Option<Ipv6Addr>, prefixes: &[String]) -> Option<Ipv6Addr> {
    let announced: Vec<Ipv6Addr> = prefixes
        .iter()
        .filter_map(|prefix| parse_prefix_v6(prefix))
        .collect();

    match current {
        Some(addr) if announced.contains(&addr) => Some(addr),
        _ => announced.first().copied().or(current),
    }
}

fn parse_prefix_v6(prefix: &str) -> Option<Ipv6Addr> {
    let addr = prefix.split('/').next().unwrap_or(prefix);
    match addr.parse::<IpAddr>() {
        Ok(IpAddr::V6(v6)) => Some(v6),
        Ok(IpAddr::V4(_)) => None,
        Err(e) => {
            tracing::warn!(prefix, error = %e, "invalid prefix address");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(neighbors: &[&str]) -> NodeInfo {
        NodeInfo {
            neighbors: neighbors.iter().map(|n| n.to_string()).collect(),
            ..Default::default()
        }
    }

    fn topology(entries: &[(&str, &[&str])]) -> HashMap<String, NodeInfo> {
        entries
            .iter()
            .map(|(name, neighbors)| (name.to_string(), info(neighbors)))
            .collect()
    }

    #[test]
    fn neighbor_of_neighbor_excludes_self_and_directs() {
        // a - b - c - d: from a, the only neighbor-of-neighbor is c.
        let nodes = topology(&[
            ("a", &["b"][..]),
            ("b", &["a", "c"][..]),
            ("c", &["b", "d"][..]),
            ("d", &["c"][..]),
        ]);
        let targets = select_targets(HealthCheckOption::NeighborOfNeighbor, 100, "a", &nodes);
        assert_eq!(targets, HashSet::from(["c".to_string()]));
    }

    #[test]
    fn topology_option_pings_everyone_but_self() {
        let nodes = topology(&[("a", &[][..]), ("b", &[][..]), ("c", &[][..])]);
        let targets = select_targets(HealthCheckOption::Topology, 100, "a", &nodes);
        assert_eq!(
            targets,
            HashSet::from(["b".to_string(), "c".to_string()])
        );
    }

    #[test]
    fn random_option_honors_the_percentage_bounds() {
        let nodes = topology(&[("a", &[][..]), ("b", &[][..]), ("c", &[][..])]);

        let none = select_targets(HealthCheckOption::Random, 0, "a", &nodes);
        assert!(none.is_empty());

        let all = select_targets(HealthCheckOption::Random, 100, "a", &nodes);
        assert_eq!(all, HashSet::from(["b".to_string(), "c".to_string()]));
    }

    #[test]
    fn ping_address_sticks_while_still_announced() {
        let current: Ipv6Addr = "fc00::1".parse().unwrap();
        let kept = choose_ping_address(
            Some(current),
            &["fc00::2/128".to_string(), "fc00::1/128".to_string()],
        );
        assert_eq!(kept, Some(current));
    }

    #[test]
    fn ping_address_switches_when_withdrawn() {
        let current: Ipv6Addr = "fc00::1".parse().unwrap();
        let switched = choose_ping_address(Some(current), &["fc00::9/128".to_string()]);
        assert_eq!(switched, Some("fc00::9".parse().unwrap()));
    }

    #[test]
    fn first_v6_prefix_wins_and_v4_is_skipped() {
        let chosen = choose_ping_address(
            None,
            &[
                "10.0.0.1/32".to_string(),
                "fc00::7/128".to_string(),
                "fc00::8/128".to_string(),
            ],
        );
        assert_eq!(chosen, Some("fc00::7".parse().unwrap()));
    }

    #[test]
    fn empty_announcement_keeps_the_old_address() {
        let current: Ipv6Addr = "fc00::1".parse().unwrap();
        assert_eq!(
            choose_ping_address(Some(current), &["10.0.0.1/32".to_string()]),
            Some(current)
        );
        assert_eq!(choose_ping_address(None, &[]), None);
    }

    #[test]
    fn pct_over_100_is_a_config_error() {
        let mut config = HealthCheckerConfig::for_node("a");
        config.health_check_pct = 101;
        assert!(config.validate().is_err());
    }
}
