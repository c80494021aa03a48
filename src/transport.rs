use crate::chat::{ChatTurn, LifecycleMarker};
use crate::error::{ChatError, TransportError};
use async_trait::async_trait;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use serde_json::Value;
use std::sync::Mutex;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Timeout for keep-alive marker requests. Chat turns use the configured budget.
const MARKER_TIMEOUT: Duration = Duration::from_secs(10);

/// A successful (2xx) reply from the chat endpoint, not yet interpreted.
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    pub content_type: Option<String>,
    pub body: String,
}

impl Reply {
    pub fn json(value: &Value) -> Self {
        Self {
            content_type: Some("application/json".to_string()),
            body: value.to_string(),
        }
    }

    #[cfg(test)]
    pub fn text(body: impl Into<String>) -> Self {
        Self {
            content_type: Some("text/plain".to_string()),
            body: body.into(),
        }
    }

    /// JSON bodies are parsed; plain text becomes a string payload.
    pub fn payload(&self) -> Result<Value, ChatError> {
        let declared_json = self
            .content_type
            .as_deref()
            .map_or(false, |ct| ct.contains("json"));

        if declared_json {
            return serde_json::from_str(&self.body).map_err(|e| ChatError::Parse(e.to_string()));
        }

        if self.body.trim().is_empty() {
            return Err(ChatError::Parse("empty body".to_string()));
        }

        Ok(serde_json::from_str(&self.body).unwrap_or_else(|_| Value::String(self.body.clone())))
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Send one chat turn, bounded by the transport's timeout budget.
    async fn send_chat_turn(&self, turn: &ChatTurn) -> Result<Reply, TransportError>;

    /// Deliver a lifecycle marker with a regular request and wait for it.
    async fn send_marker(&self, marker: &LifecycleMarker) -> Result<(), TransportError>;

    /// Queue a marker for background delivery that outlives the caller.
    /// Returns `false` when beacons are unavailable.
    fn beacon(&self, marker: &LifecycleMarker) -> bool;
}

/// Best-effort marker delivery: beacon first, then a regular request.
/// Failures are logged and never reach the caller.
pub async fn deliver_marker(transport: &dyn Transport, marker: &LifecycleMarker) {
    if transport.beacon(marker) {
        debug!(
            "Queued {} beacon for {}",
            marker.kind(),
            marker.conversation_id()
        );
        return;
    }

    if let Err(e) = transport.send_marker(marker).await {
        warn!(
            "Failed to send {} marker for {}: {}",
            marker.kind(),
            marker.conversation_id(),
            e
        );
    }
}

pub struct HttpTransport {
    client: reqwest::Client,
    endpoint: String,
    timeout: Duration,
    beacons: Mutex<Vec<JoinHandle<()>>>,
}

impl HttpTransport {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into(),
            timeout,
            beacons: Mutex::new(Vec::new()),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Wait up to `grace` for queued beacons to go out.
    pub async fn flush_beacons(&self, grace: Duration) {
        let pending: Vec<JoinHandle<()>> = {
            let mut beacons = self.beacons.lock().unwrap_or_else(|p| p.into_inner());
            std::mem::take(&mut *beacons)
        };

        if pending.is_empty() {
            return;
        }

        let count = pending.len();
        let wait_all = async {
            for handle in pending {
                let _ = handle.await;
            }
        };

        if tokio::time::timeout(grace, wait_all).await.is_err() {
            warn!("{} beacon(s) still in flight after {:?}", count, grace);
        }
    }

    async fn post_turn(&self, turn: &ChatTurn) -> Result<Reply, TransportError> {
        let response = self
            .client
            .post(&self.endpoint)
            .header(ACCEPT, "application/json, text/plain, */*")
            .json(turn)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::Status(status.as_u16()));
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = response.text().await?;

        Ok(Reply { content_type, body })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send_chat_turn(&self, turn: &ChatTurn) -> Result<Reply, TransportError> {
        // Dropping the in-flight request on timeout aborts it.
        tokio::time::timeout(self.timeout, self.post_turn(turn))
            .await
            .map_err(|_| TransportError::Timeout(self.timeout))?
    }

    async fn send_marker(&self, marker: &LifecycleMarker) -> Result<(), TransportError> {
        let response = self
            .client
            .post(&self.endpoint)
            .timeout(MARKER_TIMEOUT)
            .json(marker)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(TransportError::Status(response.status().as_u16()));
        }
        Ok(())
    }

    fn beacon(&self, marker: &LifecycleMarker) -> bool {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return false;
        };
        let body = match serde_json::to_vec(marker) {
            Ok(body) => body,
            Err(e) => {
                warn!("Failed to encode {} beacon: {}", marker.kind(), e);
                return false;
            }
        };

        let request = self
            .client
            .post(&self.endpoint)
            .header(CONTENT_TYPE, "application/json")
            .timeout(MARKER_TIMEOUT)
            .body(body);
        let kind = marker.kind();

        let task = handle.spawn(async move {
            match request.send().await {
                Ok(response) if !response.status().is_success() => {
                    debug!("{} beacon answered {}", kind, response.status());
                }
                Ok(_) => {}
                Err(e) => debug!("{} beacon failed: {}", kind, e),
            }
        });

        let mut beacons = self.beacons.lock().unwrap_or_else(|p| p.into_inner());
        beacons.retain(|h| !h.is_finished());
        beacons.push(task);
        true
    }
}
