//! Event Bus: in-process publish/subscribe with bounded
//! per-subscriber buffers. Non-durable — the REST surface (an external
//! collaborator) is the thing that turns these into Server-Sent Events.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Why a mutation happened, carried on every [`ProxyEvent`] the manager
/// emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventReason {
    ServerAdded,
    ServerRemoved,
    ServerEnabled,
    ServerDisabled,
    ServerRestarted,
    OauthFlowStarted,
    OauthFlowCompleted,
    OauthTokenRefreshed,
    ToolsChanged,
    StateChanged,
    FlowAlert,
}

/// One change the control plane may care about. Every field beyond
/// `reason` is optional because not every reason populates every slot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyEvent {
    pub reason: EventReason,
    pub server: Option<String>,
    pub correlation_id: Option<String>,
    pub detail: Option<String>,
}

impl ProxyEvent {
    #[must_use]
    pub fn new(reason: EventReason) -> Self {
        Self { reason, server: None, correlation_id: None, detail: None }
    }

    #[must_use]
    pub fn for_server(reason: EventReason, server: impl Into<String>) -> Self {
        Self { reason, server: Some(server.into()), correlation_id: None, detail: None }
    }

    #[must_use]
    pub fn with_correlation(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    #[must_use]
    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// Bounded broadcast bus. Slow consumers drop the oldest events rather than
/// blocking a publisher or growing unbounded.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<ProxyEvent>,
}

impl EventBus {
    /// `capacity` is the per-subscriber buffer depth; once a lagging
    /// subscriber falls this far behind, `tokio::sync::broadcast` drops its
    /// oldest unread events on its behalf.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProxyEvent> {
        self.sender.subscribe()
    }

    /// Publish an event. Returns the number of live subscribers that
    /// received it; `0` just means nobody is currently listening, not an
    /// error — events are non-durable by design.
    pub fn publish(&self, event: ProxyEvent) -> usize {
        self.sender.send(event).unwrap_or(0)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscriber_receives_published_event() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();
        bus.publish(ProxyEvent::for_server(EventReason::ServerAdded, "acme"));
        let event = rx.recv().await.unwrap();
        assert_eq!(event.server.as_deref(), Some("acme"));
        assert_eq!(event.reason, EventReason::ServerAdded);
    }

    #[tokio::test]
    async fn publish_without_subscribers_does_not_error() {
        let bus = EventBus::new(8);
        assert_eq!(bus.publish(ProxyEvent::new(EventReason::ToolsChanged)), 0);
    }

    #[tokio::test]
    async fn lagging_subscriber_drops_oldest_rather_than_blocking_publisher() {
        let bus = EventBus::new(2);
        let mut rx = bus.subscribe();
        for _ in 0..5 {
            bus.publish(ProxyEvent::new(EventReason::StateChanged));
        }
        // The receiver lagged; it should report a Lagged error rather than
        // the publisher having blocked.
        let result = rx.recv().await;
        assert!(matches!(result, Err(broadcast::error::RecvError::Lagged(_)) | Ok(_)));
    }
}
