//! HealthCheckerHandle — request surface for in-process callers.

use crate::error::HealthError;
use std::collections::HashMap;
use std::net::SocketAddr;
use tokio::sync::{mpsc, oneshot};
use weft_proto::NodeHealthInfo;

pub enum HealthCmd {
    Peek {
        resp: oneshot::Sender<HashMap<String, NodeHealthInfo>>,
    },
    Shutdown,
}

#[derive(Clone)]
pub struct HealthCheckerHandle {
    tx: mpsc::Sender<HealthCmd>,
    local_addr: SocketAddr,
}

impl HealthCheckerHandle {
    pub(crate) fn new(tx: mpsc::Sender<HealthCmd>, local_addr: SocketAddr) -> Self {
        Self { tx, local_addr }
    }

    /// Address the ping socket is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Per-node counters for every node with observed activity.
    pub async fn peek(&self) -> Result<HashMap<String, NodeHealthInfo>, HealthError> {
        let (resp, rx) = oneshot::channel();
        self.tx
            .send(HealthCmd::Peek { resp })
            .await
            .map_err(|_| HealthError::Shutdown)?;
        rx.await.map_err(|_| HealthError::Shutdown)
    }

    pub async fn shutdown(&self) {
        let _ = self.tx.send(HealthCmd::Shutdown).await;
    }
}
