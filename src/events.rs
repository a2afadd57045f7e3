//! Typed event fan-out.
//!
//! Four channels (events, health, budget, cache), each a broadcast queue.
//! Every subscriber owns a bounded receiver; a slow subscriber loses the
//! oldest messages first and sees exactly how many were dropped through
//! [`ChannelSubscription::dropped`]. That is deliberate back-pressure, not
//! silent loss. JSON serialisation of payloads happens only at the
//! transport edge; inside the core everything is typed.

use crate::analytics::AnalyticsEvent;
use crate::artifacts::Artifact;
use crate::budget::{BudgetAlert, BudgetStatus};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Subscription channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    /// Routing artifacts and analytics events.
    Events,
    /// Provider health transitions.
    Health,
    /// Budget status updates and alerts.
    Budget,
    /// Cache hits, stores, and clears.
    Cache,
}

impl Channel {
    /// All channels, for default-subscribe-all semantics.
    pub const ALL: [Channel; 4] = [Channel::Events, Channel::Health, Channel::Budget, Channel::Cache];

    /// Canonical lowercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Events => "event",
            Self::Health => "health",
            Self::Budget => "budget",
            Self::Cache => "cache",
        }
    }

    /// Parse a client-supplied channel name.
    pub fn parse(s: &str) -> Option<Channel> {
        match s {
            "event" | "events" => Some(Self::Events),
            "health" => Some(Self::Health),
            "budget" => Some(Self::Budget),
            "cache" => Some(Self::Cache),
            _ => None,
        }
    }
}

/// Provider health transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthUpdate {
    /// Provider name.
    pub provider: String,
    /// Whether the provider is currently considered healthy.
    pub healthy: bool,
    /// Latency of the observation, when one was measured.
    pub latency_ms: Option<u64>,
}

/// Budget channel payload: a fresh status set, optionally the alert that
/// triggered it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetUpdate {
    /// Daily, weekly, monthly snapshots.
    pub statuses: Vec<BudgetStatus>,
    /// Whether emergency mode is latched.
    pub emergency_mode: bool,
    /// The alert that fired, if this update was alert-driven.
    pub alert: Option<BudgetAlert>,
}

/// Cache channel payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheNotice {
    /// `"hit"`, `"store"`, or `"clear"`.
    pub action: String,
    /// Entry key involved, when applicable.
    pub query_hash: Option<String>,
    /// Similarity of a hit.
    pub similarity: Option<f64>,
}

/// A message on any channel.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum GatewayEvent {
    /// A routing artifact was recorded or enriched.
    Artifact(Box<Artifact>),
    /// An analytics event was recorded.
    Analytics(Box<AnalyticsEvent>),
    /// Budget state changed.
    Budget(BudgetUpdate),
    /// Cache activity.
    Cache(CacheNotice),
    /// Provider health changed.
    Health(HealthUpdate),
}

/// The hub. Cheap to clone handles are not needed; share via `Arc`.
pub struct EventHub {
    events: broadcast::Sender<GatewayEvent>,
    health: broadcast::Sender<GatewayEvent>,
    budget: broadcast::Sender<GatewayEvent>,
    cache: broadcast::Sender<GatewayEvent>,
}

impl EventHub {
    /// Hub whose per-subscriber queues hold `capacity` messages.
    pub fn new(capacity: usize) -> Self {
        let (events, _) = broadcast::channel(capacity);
        let (health, _) = broadcast::channel(capacity);
        let (budget, _) = broadcast::channel(capacity);
        let (cache, _) = broadcast::channel(capacity);
        Self { events, health, budget, cache }
    }

    fn sender(&self, channel: Channel) -> &broadcast::Sender<GatewayEvent> {
        match channel {
            Channel::Events => &self.events,
            Channel::Health => &self.health,
            Channel::Budget => &self.budget,
            Channel::Cache => &self.cache,
        }
    }

    /// Publish onto one channel. With no subscribers this is a no-op.
    pub fn publish(&self, channel: Channel, event: GatewayEvent) {
        let _ = self.sender(channel).send(event);
    }

    /// Subscribe to one channel.
    pub fn subscribe(&self, channel: Channel) -> ChannelSubscription {
        ChannelSubscription { channel, rx: self.sender(channel).subscribe(), dropped: 0 }
    }

    /// Live subscriber count for a channel.
    pub fn subscriber_count(&self, channel: Channel) -> usize {
        self.sender(channel).receiver_count()
    }
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new(256)
    }
}

/// One subscriber's end of a channel.
pub struct ChannelSubscription {
    channel: Channel,
    rx: broadcast::Receiver<GatewayEvent>,
    dropped: u64,
}

impl ChannelSubscription {
    /// Which channel this subscription is on.
    pub fn channel(&self) -> Channel {
        self.channel
    }

    /// Messages lost to back-pressure so far.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Receive the next message, absorbing lag into the dropped counter.
    /// Returns `None` once the hub is gone.
    pub async fn recv(&mut self) -> Option<GatewayEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    self.dropped += n;
                    tracing::warn!(
                        channel = self.channel.as_str(),
                        lagged = n,
                        "subscriber lagged, dropping oldest"
                    );
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Non-blocking receive for polling contexts.
    pub fn try_recv(&mut self) -> Option<GatewayEvent> {
        loop {
            match self.rx.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(n)) => {
                    self.dropped += n;
                }
                Err(_) => return None,
            }
        }
    }
}

// ── Tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn cache_notice(action: &str) -> GatewayEvent {
        GatewayEvent::Cache(CacheNotice {
            action: action.to_string(),
            query_hash: None,
            similarity: None,
        })
    }

    #[tokio::test]
    async fn test_publish_reaches_subscriber_in_order() {
        let hub = EventHub::new(16);
        let mut sub = hub.subscribe(Channel::Cache);
        hub.publish(Channel::Cache, cache_notice("store"));
        hub.publish(Channel::Cache, cache_notice("hit"));

        let first = sub.recv().await.expect("first event");
        let second = sub.recv().await.expect("second event");
        match (first, second) {
            (GatewayEvent::Cache(a), GatewayEvent::Cache(b)) => {
                assert_eq!(a.action, "store");
                assert_eq!(b.action, "hit");
            }
            other => panic!("unexpected events: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_channels_are_isolated() {
        let hub = EventHub::new(16);
        let mut cache_sub = hub.subscribe(Channel::Cache);
        let _health_sub = hub.subscribe(Channel::Health);

        hub.publish(
            Channel::Health,
            GatewayEvent::Health(HealthUpdate {
                provider: "openai".into(),
                healthy: true,
                latency_ms: Some(12),
            }),
        );

        assert!(cache_sub.try_recv().is_none(), "cache channel must not see health events");
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_noop() {
        let hub = EventHub::new(4);
        hub.publish(Channel::Budget, cache_notice("x"));
        // No panic, nothing to assert beyond reaching here.
        assert_eq!(hub.subscriber_count(Channel::Budget), 0);
    }

    #[tokio::test]
    async fn test_slow_subscriber_drops_oldest_and_counts() {
        let hub = EventHub::new(2);
        let mut sub = hub.subscribe(Channel::Events);
        for i in 0..5 {
            hub.publish(Channel::Events, cache_notice(&format!("n{i}")));
        }

        // Only the newest two remain; three were dropped.
        let next = sub.recv().await.expect("event after lag");
        match next {
            GatewayEvent::Cache(n) => assert_eq!(n.action, "n3"),
            other => panic!("unexpected: {other:?}"),
        }
        assert_eq!(sub.dropped(), 3);
    }

    #[tokio::test]
    async fn test_subscriber_count_tracks_subscriptions() {
        let hub = EventHub::new(4);
        assert_eq!(hub.subscriber_count(Channel::Events), 0);
        let a = hub.subscribe(Channel::Events);
        let b = hub.subscribe(Channel::Events);
        assert_eq!(hub.subscriber_count(Channel::Events), 2);
        drop(a);
        drop(b);
        assert_eq!(hub.subscriber_count(Channel::Events), 0);
    }

    #[test]
    fn test_channel_parse_round_trip() {
        for ch in Channel::ALL {
            assert_eq!(Channel::parse(ch.as_str()), Some(ch));
        }
        assert_eq!(Channel::parse("events"), Some(Channel::Events));
        assert_eq!(Channel::parse("nope"), None);
    }
}
