use std::time::Duration;

use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};
use uuid::Uuid;

use dere_core::config::PERMISSION_TIMEOUT_SECS;

/// Outcome of a tool permission request.
#[derive(Debug, Clone, PartialEq)]
pub enum PermissionDecision {
    Allow,
    Deny { message: String },
}

/// A permission request surfaced to the client while a query streams.
#[derive(Debug, Clone)]
pub struct PermissionRequest {
    pub request_id: String,
    pub tool_name: String,
    pub tool_input: Value,
}

/// Per-session broker between a runner's tool gate and the client.
///
/// The runner calls [`PermissionBroker::can_use_tool`]; the broker emits a
/// request onto the session's permission channel (merged into the event
/// stream by the service) and parks until the client resolves it or the
/// timeout fires. Timed-out requests deny with an explanatory message and
/// the stream continues.
pub struct PermissionBroker {
    auto_approve: bool,
    timeout: Duration,
    pending: DashMap<String, oneshot::Sender<PermissionDecision>>,
    request_tx: mpsc::UnboundedSender<PermissionRequest>,
}

impl PermissionBroker {
    pub fn new(auto_approve: bool) -> (Self, mpsc::UnboundedReceiver<PermissionRequest>) {
        let (request_tx, request_rx) = mpsc::unbounded_channel();
        (
            Self {
                auto_approve,
                timeout: Duration::from_secs(PERMISSION_TIMEOUT_SECS),
                pending: DashMap::new(),
                request_tx,
            },
            request_rx,
        )
    }

    #[cfg(test)]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Gate a tool invocation. Blocks until the client answers or the
    /// timeout elapses.
    pub async fn can_use_tool(&self, tool_name: &str, tool_input: Value) -> PermissionDecision {
        if self.auto_approve {
            debug!(tool = tool_name, "auto-approving tool for autonomous session");
            return PermissionDecision::Allow;
        }

        let request_id = Uuid::new_v4().to_string();
        info!(tool = tool_name, request_id = %request_id, "permission requested");

        let (tx, rx) = oneshot::channel();
        self.pending.insert(request_id.clone(), tx);

        // Client disconnects are fine here — the request sits in the ring
        // buffer and can still be resolved after a reconnect-and-replay.
        let _ = self.request_tx.send(PermissionRequest {
            request_id: request_id.clone(),
            tool_name: tool_name.to_string(),
            tool_input,
        });

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(decision)) => {
                info!(request_id = %request_id, ?decision, "permission resolved");
                decision
            }
            Ok(Err(_)) | Err(_) => {
                self.pending.remove(&request_id);
                warn!(request_id = %request_id, tool = tool_name, "permission timed out");
                PermissionDecision::Deny {
                    message: "Permission request timed out (no response from user)".to_string(),
                }
            }
        }
    }

    /// Resolve a pending request. Returns false when the request is unknown
    /// (already resolved or timed out).
    pub fn resolve(&self, request_id: &str, allowed: bool, deny_message: Option<String>) -> bool {
        let Some((_, tx)) = self.pending.remove(request_id) else {
            return false;
        };
        let decision = if allowed {
            PermissionDecision::Allow
        } else {
            PermissionDecision::Deny {
                message: deny_message.unwrap_or_else(|| "Permission denied by user".to_string()),
            }
        };
        tx.send(decision).is_ok()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn auto_approve_skips_the_client() {
        let (broker, mut rx) = PermissionBroker::new(true);
        let decision = broker.can_use_tool("Bash", serde_json::json!({})).await;
        assert_eq!(decision, PermissionDecision::Allow);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn resolve_allows_a_parked_request() {
        let (broker, mut rx) = PermissionBroker::new(false);
        let broker = std::sync::Arc::new(broker);

        let b = broker.clone();
        let handle =
            tokio::spawn(async move { b.can_use_tool("Bash", serde_json::json!({"cmd": "ls"})).await });

        let request = rx.recv().await.expect("request emitted");
        assert_eq!(request.tool_name, "Bash");
        assert!(broker.resolve(&request.request_id, true, None));

        assert_eq!(handle.await.unwrap(), PermissionDecision::Allow);
        assert_eq!(broker.pending_count(), 0);
    }

    #[tokio::test]
    async fn timeout_denies_with_explanation() {
        let (broker, mut rx) = PermissionBroker::new(false);
        let broker = broker.with_timeout(Duration::from_millis(20));

        let decision = broker.can_use_tool("Bash", serde_json::json!({})).await;
        match decision {
            PermissionDecision::Deny { message } => {
                assert!(message.contains("timed out"));
            }
            other => panic!("expected deny, got {other:?}"),
        }
        // The request was still surfaced to the client before timing out.
        assert!(rx.recv().await.is_some());
        assert_eq!(broker.pending_count(), 0);
    }

    #[tokio::test]
    async fn resolving_unknown_request_returns_false() {
        let (broker, _rx) = PermissionBroker::new(false);
        assert!(!broker.resolve("nope", true, None));
    }
}
