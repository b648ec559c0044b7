//! KvStoreHandle — command surface for callers in the same process.
//!
//! Wire clients use the bound command endpoints instead; both paths
//! funnel into the same actor.

use crate::error::StoreError;
use std::collections::HashMap;
use tokio::sync::{mpsc, oneshot};
use weft_model::Value;
use weft_proto::{PeerSpec, Publication};

/// Commands the store actor understands.
pub enum StoreCmd {
    KeySet {
        key_vals: HashMap<String, Value>,
        node_ids: Vec<String>,
        force: bool,
        resp: oneshot::Sender<Publication>,
    },
    KeyGet {
        keys: Vec<String>,
        resp: oneshot::Sender<HashMap<String, Value>>,
    },
    KeyDump {
        prefix: String,
        resp: oneshot::Sender<HashMap<String, Value>>,
    },
    HashDump {
        prefix: String,
        resp: oneshot::Sender<HashMap<String, Value>>,
    },
    DumpDiff {
        summaries: HashMap<String, Value>,
        resp: oneshot::Sender<HashMap<String, Value>>,
    },
    PeerAdd {
        peers: HashMap<String, PeerSpec>,
        resp: oneshot::Sender<HashMap<String, PeerSpec>>,
    },
    PeerDel {
        peer_names: Vec<String>,
        resp: oneshot::Sender<HashMap<String, PeerSpec>>,
    },
    PeerDump {
        resp: oneshot::Sender<HashMap<String, PeerSpec>>,
    },
    Shutdown,
}

/// Cloneable handle to a running store actor.
#[derive(Clone)]
pub struct KvStoreHandle {
    tx: mpsc::Sender<StoreCmd>,
}

impl KvStoreHandle {
    pub(crate) fn new(tx: mpsc::Sender<StoreCmd>) -> Self {
        Self { tx }
    }

    async fn roundtrip<T>(
        &self,
        cmd: StoreCmd,
        rx: oneshot::Receiver<T>,
    ) -> Result<T, StoreError> {
        self.tx.send(cmd).await.map_err(|_| StoreError::Shutdown)?;
        rx.await.map_err(|_| StoreError::Shutdown)
    }

    /// Merge records into the store, flood the resulting delta, and
    /// return it.
    pub async fn key_set(
        &self,
        key_vals: HashMap<String, Value>,
    ) -> Result<Publication, StoreError> {
        self.key_set_with(key_vals, Vec::new(), false).await
    }

    /// `key_set` with an explicit flood list seed and force flag.
    pub async fn key_set_with(
        &self,
        key_vals: HashMap<String, Value>,
        node_ids: Vec<String>,
        force: bool,
    ) -> Result<Publication, StoreError> {
        let (resp, rx) = oneshot::channel();
        self.roundtrip(
            StoreCmd::KeySet {
                key_vals,
                node_ids,
                force,
                resp,
            },
            rx,
        )
        .await
    }

    /// Fetch records for the given keys; missing keys are omitted.
    pub async fn key_get(
        &self,
        keys: Vec<String>,
    ) -> Result<HashMap<String, Value>, StoreError> {
        let (resp, rx) = oneshot::channel();
        self.roundtrip(StoreCmd::KeyGet { keys, resp }, rx).await
    }

    /// Snapshot of every record whose key starts with `prefix`.
    pub async fn key_dump(
        &self,
        prefix: impl Into<String>,
    ) -> Result<HashMap<String, Value>, StoreError> {
        let (resp, rx) = oneshot::channel();
        self.roundtrip(
            StoreCmd::KeyDump {
                prefix: prefix.into(),
                resp,
            },
            rx,
        )
        .await
    }

    /// Hash summaries (records with the payload stripped) by prefix.
    pub async fn hash_dump(
        &self,
        prefix: impl Into<String>,
    ) -> Result<HashMap<String, Value>, StoreError> {
        let (resp, rx) = oneshot::channel();
        self.roundtrip(
            StoreCmd::HashDump {
                prefix: prefix.into(),
                resp,
            },
            rx,
        )
        .await
    }

    /// Records the owner of `summaries` is missing or holds stale.
    pub async fn dump_diff(
        &self,
        summaries: HashMap<String, Value>,
    ) -> Result<HashMap<String, Value>, StoreError> {
        let (resp, rx) = oneshot::channel();
        self.roundtrip(StoreCmd::DumpDiff { summaries, resp }, rx)
            .await
    }

    /// Add peers, subscribe to their publications and schedule a full
    /// sync with each. Returns the updated peer table.
    pub async fn peer_add(
        &self,
        peers: HashMap<String, PeerSpec>,
    ) -> Result<HashMap<String, PeerSpec>, StoreError> {
        let (resp, rx) = oneshot::channel();
        self.roundtrip(StoreCmd::PeerAdd { peers, resp }, rx).await
    }

    /// Drop peers and their pending sync state. Returns the updated
    /// peer table.
    pub async fn peer_del(
        &self,
        peer_names: Vec<String>,
    ) -> Result<HashMap<String, PeerSpec>, StoreError> {
        let (resp, rx) = oneshot::channel();
        self.roundtrip(StoreCmd::PeerDel { peer_names, resp }, rx)
            .await
    }

    pub async fn peer_dump(&self) -> Result<HashMap<String, PeerSpec>, StoreError> {
        let (resp, rx) = oneshot::channel();
        self.roundtrip(StoreCmd::PeerDump { resp }, rx).await
    }

    /// Stop the actor. Idempotent; pending commands get `Shutdown`
    /// errors.
    pub async fn shutdown(&self) {
        let _ = self.tx.send(StoreCmd::Shutdown).await;
    }
}
