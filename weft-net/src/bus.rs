//! MessageBus — in-process pub/sub and request/reply fabric.
//!
//! A shared broker routes payloads between the nodes of one process.
//! Topics are `tokio::sync::broadcast` channels created lazily;
//! request endpoints are claimed exclusively by `bind` and served as a
//! stream of [`BusRequest`]s.

use crate::error::NetError;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, Mutex};

const TOPIC_CAPACITY: usize = 1024;
const ENDPOINT_CAPACITY: usize = 64;

/// One request in flight to a bound endpoint. The responder sends its
/// reply bytes through `reply`; dropping it fails the caller.
#[derive(Debug)]
pub struct BusRequest {
    pub payload: Vec<u8>,
    pub reply: oneshot::Sender<Vec<u8>>,
}

#[derive(Default)]
struct BusInner {
    topics: HashMap<String, broadcast::Sender<Vec<u8>>>,
    endpoints: HashMap<String, mpsc::Sender<BusRequest>>,
}

/// Shared broker — clone freely, all clones address the same fabric.
#[derive(Clone, Default)]
pub struct MessageBus {
    inner: Arc<Mutex<BusInner>>,
}

/// URLs must carry a scheme; everything after `://` is an opaque
/// address within the fabric.
pub fn validate_url(url: &str) -> Result<(), NetError> {
    let Some((scheme, rest)) = url.split_once("://") else {
        return Err(NetError::InvalidUrl(url.to_string()));
    };
    if scheme.is_empty() || rest.is_empty() {
        return Err(NetError::InvalidUrl(url.to_string()));
    }
    Ok(())
}

impl MessageBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to a topic, creating it if nobody published yet.
    pub async fn subscribe(&self, url: &str) -> Result<broadcast::Receiver<Vec<u8>>, NetError> {
        validate_url(url)?;
        let mut inner = self.inner.lock().await;
        let sender = inner
            .topics
            .entry(url.to_string())
            .or_insert_with(|| broadcast::channel(TOPIC_CAPACITY).0);
        Ok(sender.subscribe())
    }

    /// Fire-and-forget publish. Nobody listening is not an error; a
    /// lagging subscriber loses messages, and periodic sync is the
    /// backstop.
    pub async fn publish(&self, url: &str, payload: Vec<u8>) -> Result<(), NetError> {
        validate_url(url)?;
        let mut inner = self.inner.lock().await;
        let sender = inner
            .topics
            .entry(url.to_string())
            .or_insert_with(|| broadcast::channel(TOPIC_CAPACITY).0);
        let _ = sender.send(payload);
        Ok(())
    }

    /// Claim a request/reply endpoint. Fails with `AddrInUse` when the
    /// URL already has a live responder.
    pub async fn bind(&self, url: &str) -> Result<mpsc::Receiver<BusRequest>, NetError> {
        validate_url(url)?;
        let mut inner = self.inner.lock().await;
        if let Some(existing) = inner.endpoints.get(url) {
            if !existing.is_closed() {
                return Err(NetError::AddrInUse(url.to_string()));
            }
        }
        let (tx, rx) = mpsc::channel(ENDPOINT_CAPACITY);
        inner.endpoints.insert(url.to_string(), tx);
        Ok(rx)
    }

    /// Round-trip one payload to the endpoint bound at `url`.
    pub async fn request(
        &self,
        url: &str,
        payload: Vec<u8>,
        timeout: Duration,
    ) -> Result<Vec<u8>, NetError> {
        validate_url(url)?;
        let sender = {
            let inner = self.inner.lock().await;
            inner
                .endpoints
                .get(url)
                .cloned()
                .ok_or_else(|| NetError::NotFound(url.to_string()))?
        };

        let (reply_tx, reply_rx) = oneshot::channel();
        sender
            .send(BusRequest {
                payload,
                reply: reply_tx,
            })
            .await
            .map_err(|_| NetError::ConnectionClosed(url.to_string()))?;

        match tokio::time::timeout(timeout, reply_rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(NetError::ConnectionClosed(url.to_string())),
            Err(_) => Err(NetError::Timeout(url.to_string())),
        }
    }
}
