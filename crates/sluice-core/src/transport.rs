//! # Transport
//!
//! Moves staged batch payloads between nodes. The wire payload is the staged
//! stream itself; acknowledgments travel as JSON.
//!
//! Both directions are initiated by the local node: `push` sends outgoing
//! batches to a peer, `pull` fetches batches a peer holds for us. The
//! server side of both is [`SyncEndpoint`], implemented by the engine.

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use sluice_protocol::BatchAck;

use crate::config::TransportConfig;
use crate::error::{Result, SluiceError};

/// Server-side sync surface a peer exposes.
#[async_trait]
pub trait SyncEndpoint: Send + Sync {
    /// Accept a pushed wire stream; returns one ack per batch it carried.
    async fn receive_push(&self, from_node: &str, payload: Bytes) -> Result<Vec<BatchAck>>;

    /// Produce a wire stream of batches pending for `for_node`. Empty when
    /// the caller is caught up.
    async fn serve_pull(&self, for_node: &str) -> Result<Bytes>;

    /// Accept acks for batches `from_node` pulled earlier.
    async fn receive_ack(&self, from_node: &str, acks: Vec<BatchAck>) -> Result<()>;
}

/// Client-side transport seam.
#[async_trait]
pub trait BatchTransport: Send + Sync {
    async fn push(&self, node_id: &str, payload: Bytes) -> Result<Vec<BatchAck>>;
    async fn pull(&self, node_id: &str) -> Result<Bytes>;
    async fn send_ack(&self, node_id: &str, acks: Vec<BatchAck>) -> Result<()>;
}

/// HTTP transport over a peer's sync endpoint.
pub struct HttpTransport {
    client: reqwest::Client,
    local_node_id: String,
    peers: HashMap<String, String>,
}

impl HttpTransport {
    pub fn new(local_node_id: impl Into<String>, config: &TransportConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.read_timeout)
            .build()
            .map_err(|e| SluiceError::config(format!("http client: {e}")))?;
        Ok(Self {
            client,
            local_node_id: local_node_id.into(),
            peers: config.peers.clone(),
        })
    }

    fn base_url(&self, node_id: &str) -> Result<&str> {
        self.peers
            .get(node_id)
            .map(String::as_str)
            .ok_or_else(|| SluiceError::config(format!("no peer url configured for node {node_id}")))
    }

    fn classify(e: reqwest::Error) -> SluiceError {
        if e.is_timeout() {
            SluiceError::timeout(e.to_string())
        } else if e.is_connect() {
            SluiceError::ConnectionRefused(e.to_string())
        } else {
            SluiceError::transport(e.to_string())
        }
    }

    async fn check_status(response: reqwest::Response) -> Result<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            Ok(response)
        } else {
            let body = response.text().await.unwrap_or_default();
            Err(SluiceError::transport(format!("peer returned {status}: {body}")))
        }
    }
}

#[async_trait]
impl BatchTransport for HttpTransport {
    async fn push(&self, node_id: &str, payload: Bytes) -> Result<Vec<BatchAck>> {
        let url = format!("{}/push", self.base_url(node_id)?);
        debug!(node = node_id, bytes = payload.len(), "pushing batches");
        let response = self
            .client
            .post(&url)
            .query(&[("nodeId", self.local_node_id.as_str())])
            .body(payload)
            .send()
            .await
            .map_err(Self::classify)?;
        let response = Self::check_status(response).await?;
        let acks: Vec<BatchAck> = response.json().await.map_err(Self::classify)?;
        Ok(acks)
    }

    async fn pull(&self, node_id: &str) -> Result<Bytes> {
        let url = format!("{}/pull", self.base_url(node_id)?);
        let response = self
            .client
            .get(&url)
            .query(&[("nodeId", self.local_node_id.as_str())])
            .send()
            .await
            .map_err(Self::classify)?;
        let response = Self::check_status(response).await?;
        response.bytes().await.map_err(Self::classify)
    }

    async fn send_ack(&self, node_id: &str, acks: Vec<BatchAck>) -> Result<()> {
        let url = format!("{}/ack", self.base_url(node_id)?);
        let response = self
            .client
            .post(&url)
            .query(&[("nodeId", self.local_node_id.as_str())])
            .json(&acks)
            .send()
            .await
            .map_err(Self::classify)?;
        Self::check_status(response).await?;
        Ok(())
    }
}

/// Transport wired directly to peer [`SyncEndpoint`]s in-process, for tests
/// and embedded multi-node setups.
pub struct InMemoryTransport {
    local_node_id: String,
    endpoints: parking_lot::RwLock<HashMap<String, Arc<dyn SyncEndpoint>>>,
}

impl InMemoryTransport {
    pub fn new(local_node_id: impl Into<String>) -> Self {
        Self {
            local_node_id: local_node_id.into(),
            endpoints: parking_lot::RwLock::new(HashMap::new()),
        }
    }

    pub fn connect(&self, node_id: impl Into<String>, endpoint: Arc<dyn SyncEndpoint>) {
        self.endpoints.write().insert(node_id.into(), endpoint);
    }

    fn endpoint(&self, node_id: &str) -> Result<Arc<dyn SyncEndpoint>> {
        self.endpoints
            .read()
            .get(node_id)
            .cloned()
            .ok_or_else(|| SluiceError::ConnectionRefused(format!("no endpoint for node {node_id}")))
    }
}

#[async_trait]
impl BatchTransport for InMemoryTransport {
    async fn push(&self, node_id: &str, payload: Bytes) -> Result<Vec<BatchAck>> {
        self.endpoint(node_id)?
            .receive_push(&self.local_node_id, payload)
            .await
    }

    async fn pull(&self, node_id: &str) -> Result<Bytes> {
        self.endpoint(node_id)?
            .serve_pull(&self.local_node_id)
            .await
    }

    async fn send_ack(&self, node_id: &str, acks: Vec<BatchAck>) -> Result<()> {
        self.endpoint(node_id)?
            .receive_ack(&self.local_node_id, acks)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct StubEndpoint {
        pushed: Mutex<Vec<(String, Bytes)>>,
        acked: Mutex<Vec<(String, Vec<BatchAck>)>>,
        pull_body: Mutex<Bytes>,
    }

    #[async_trait]
    impl SyncEndpoint for StubEndpoint {
        async fn receive_push(&self, from_node: &str, payload: Bytes) -> Result<Vec<BatchAck>> {
            self.pushed.lock().push((from_node.to_string(), payload));
            Ok(vec![BatchAck::ok(1, from_node)])
        }

        async fn serve_pull(&self, _for_node: &str) -> Result<Bytes> {
            Ok(self.pull_body.lock().clone())
        }

        async fn receive_ack(&self, from_node: &str, acks: Vec<BatchAck>) -> Result<()> {
            self.acked.lock().push((from_node.to_string(), acks));
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_push_reaches_endpoint_and_returns_acks() {
        let endpoint = Arc::new(StubEndpoint::default());
        let transport = InMemoryTransport::new("001");
        transport.connect("002", endpoint.clone());

        let acks = transport
            .push("002", Bytes::from_static(b"batch,1\ncommit,1\n"))
            .await
            .unwrap();
        assert_eq!(acks.len(), 1);
        assert!(acks[0].is_ok());
        let pushed = endpoint.pushed.lock();
        assert_eq!(pushed[0].0, "001");
    }

    #[tokio::test]
    async fn test_pull_returns_peer_stream() {
        let endpoint = Arc::new(StubEndpoint::default());
        *endpoint.pull_body.lock() = Bytes::from_static(b"nodeid,002\n");
        let transport = InMemoryTransport::new("001");
        transport.connect("002", endpoint);

        let body = transport.pull("002").await.unwrap();
        assert_eq!(&body[..], b"nodeid,002\n");
    }

    #[tokio::test]
    async fn test_unknown_peer_is_connection_refused() {
        let transport = InMemoryTransport::new("001");
        let err = transport.pull("999").await.unwrap_err();
        assert!(matches!(err, SluiceError::ConnectionRefused(_)));
        assert!(err.is_retriable());
    }

    #[tokio::test]
    async fn test_ack_delivery() {
        let endpoint = Arc::new(StubEndpoint::default());
        let transport = InMemoryTransport::new("001");
        transport.connect("002", endpoint.clone());

        transport
            .send_ack("002", vec![BatchAck::error(3, "001", Some(12), "boom")])
            .await
            .unwrap();
        let acked = endpoint.acked.lock();
        assert_eq!(acked[0].1[0].batch_id, 3);
    }
}
