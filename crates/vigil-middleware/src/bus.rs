//! Typed, topic-based publish/subscribe event bus.
//!
//! Uses [`tokio::sync::broadcast`] channels under the hood so that every
//! subscriber receives every message without any single subscriber blocking
//! the others. A slow subscriber observes `Lagged` and skips ahead.
//!
//! # Topics
//!
//! | Topic | Typical traffic |
//! |---|---|
//! | [`Topic::VerdictChanged`] | Safety verdict level changes |
//! | [`Topic::CommandVetoed`] | Commands refused by the interlock |
//! | [`Topic::EmergencyStage`] | Emergency stage transitions and failures |
//! | [`Topic::Commands`] | Command completion, cancellation and timeouts |
//! | [`Topic::ServiceHealth`] | Watchdog health changes |
//! | [`Topic::Alerts`] | Operator alerts |
//! | [`Topic::Session`] | Observing session start / end |
//!
//! Every event is also copied to a global channel (see
//! [`EventBus::subscribe_all`]) for the journal archiver and loggers.
//!
//! # Example
//!
//! ```
//! use vigil_middleware::{EventBus, Topic};
//! use vigil_types::{AlertSeverity, Event, EventPayload};
//!
//! # tokio_test_block_on(async {
//! let bus = EventBus::default();
//! let mut alerts = bus.subscribe_to(Topic::Alerts);
//!
//! bus.publish(Event::new(
//!     "doc",
//!     EventPayload::Alert { severity: AlertSeverity::Info, message: "hello".into() },
//! ));
//!
//! let event = alerts.recv().await.unwrap();
//! assert_eq!(event.source, "doc");
//! # });
//! # fn tokio_test_block_on<F: std::future::Future>(f: F) -> F::Output {
//! #     tokio::runtime::Runtime::new().unwrap().block_on(f)
//! # }
//! ```

use tokio::sync::broadcast;
use tracing::{debug, warn};
use vigil_types::{Event, EventPayload};

/// Default channel capacity (number of buffered events before old ones are
/// dropped for slow subscribers).
pub const DEFAULT_CAPACITY: usize = 256;

/// Routing lanes on the event bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    VerdictChanged,
    CommandVetoed,
    EmergencyStage,
    Commands,
    ServiceHealth,
    Alerts,
    Session,
}

impl Topic {
    /// The lane a payload is routed to.
    pub fn for_payload(payload: &EventPayload) -> Topic {
        match payload {
            EventPayload::VerdictChanged { .. } => Topic::VerdictChanged,
            EventPayload::CommandVetoed { .. } => Topic::CommandVetoed,
            EventPayload::CommandFinished { .. } => Topic::Commands,
            EventPayload::EmergencyStageChanged { .. } | EventPayload::EmergencyStageFailed { .. } => {
                Topic::EmergencyStage
            }
            EventPayload::ServiceHealthChanged { .. } => Topic::ServiceHealth,
            EventPayload::Alert { .. } => Topic::Alerts,
            EventPayload::SessionStarted { .. } | EventPayload::SessionEnded { .. } => {
                Topic::Session
            }
        }
    }
}

/// Shared event bus. Clone it cheaply – all clones share the same underlying
/// broadcast channels.
#[derive(Clone, Debug)]
pub struct EventBus {
    all: broadcast::Sender<Event>,
    verdict_changed: broadcast::Sender<Event>,
    command_vetoed: broadcast::Sender<Event>,
    emergency_stage: broadcast::Sender<Event>,
    commands: broadcast::Sender<Event>,
    service_health: broadcast::Sender<Event>,
    alerts: broadcast::Sender<Event>,
    session: broadcast::Sender<Event>,
}

impl EventBus {
    /// Create a new bus. `capacity` applies to every channel independently.
    pub fn new(capacity: usize) -> Self {
        Self {
            all: broadcast::channel(capacity).0,
            verdict_changed: broadcast::channel(capacity).0,
            command_vetoed: broadcast::channel(capacity).0,
            emergency_stage: broadcast::channel(capacity).0,
            commands: broadcast::channel(capacity).0,
            service_health: broadcast::channel(capacity).0,
            alerts: broadcast::channel(capacity).0,
            session: broadcast::channel(capacity).0,
        }
    }

    /// Publish `event` to the topic derived from its payload and to the global
    /// channel.
    ///
    /// Returns the number of topic subscribers that were handed the event.
    /// Zero subscribers is a normal condition, not an error.
    pub fn publish(&self, event: Event) -> usize {
        let topic = Topic::for_payload(&event.payload);
        // Global listeners are best effort.
        let _ = self.all.send(event.clone());
        match self.topic_sender(topic).send(event) {
            Ok(n) => n,
            Err(_) => {
                debug!(?topic, "no subscribers for topic");
                0
            }
        }
    }

    /// Subscribe to a single [`Topic`].
    pub fn subscribe_to(&self, topic: Topic) -> TopicReceiver {
        TopicReceiver {
            topic: Some(topic),
            receiver: self.topic_sender(topic).subscribe(),
        }
    }

    /// Subscribe to every event regardless of topic.
    pub fn subscribe_all(&self) -> TopicReceiver {
        TopicReceiver {
            topic: None,
            receiver: self.all.subscribe(),
        }
    }

    fn topic_sender(&self, topic: Topic) -> &broadcast::Sender<Event> {
        match topic {
            Topic::VerdictChanged => &self.verdict_changed,
            Topic::CommandVetoed => &self.command_vetoed,
            Topic::EmergencyStage => &self.emergency_stage,
            Topic::Commands => &self.commands,
            Topic::ServiceHealth => &self.service_health,
            Topic::Alerts => &self.alerts,
            Topic::Session => &self.session,
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

// ---------------------------------------------------------------------------
// Receiver
// ---------------------------------------------------------------------------

/// An async receiver bound to one topic, or to the global channel.
pub struct TopicReceiver {
    topic: Option<Topic>,
    receiver: broadcast::Receiver<Event>,
}

impl TopicReceiver {
    /// Wait for the next event.
    ///
    /// * `Err(RecvError::Lagged(n))` – the subscriber fell behind and `n`
    ///   messages were dropped.
    /// * `Err(RecvError::Closed)` – the bus has shut down.
    pub async fn recv(&mut self) -> Result<Event, broadcast::error::RecvError> {
        self.receiver.recv().await
    }

    /// Wait for the next event, skipping over lag. Returns `None` once the bus
    /// is closed.
    pub async fn next(&mut self) -> Option<Event> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(topic = ?self.topic, lagged_by = n, "subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// `None` for a global receiver.
    pub fn topic(&self) -> Option<Topic> {
        self.topic
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use vigil_types::{AlertSeverity, EmergencyStage, ServiceKind, ServiceState};

    fn alert(message: &str) -> Event {
        Event::new(
            "vigil-middleware::test",
            EventPayload::Alert {
                severity: AlertSeverity::Warning,
                message: message.to_string(),
            },
        )
    }

    fn stage_change() -> Event {
        Event::new(
            "vigil-middleware::test",
            EventPayload::EmergencyStageChanged {
                from: EmergencyStage::Warning,
                to: EmergencyStage::Park,
                reason: "test".into(),
            },
        )
    }

    #[tokio::test]
    async fn events_route_by_payload() -> Result<(), Box<dyn std::error::Error>> {
        let bus = EventBus::default();
        let mut stages = bus.subscribe_to(Topic::EmergencyStage);

        let event = stage_change();
        assert_eq!(bus.publish(event.clone()), 1);

        let received = stages.recv().await?;
        assert_eq!(received.id, event.id);
        Ok(())
    }

    #[tokio::test]
    async fn multiple_subscribers_receive_same_event() -> Result<(), Box<dyn std::error::Error>> {
        let bus = EventBus::default();
        let mut first = bus.subscribe_to(Topic::Alerts);
        let mut second = bus.subscribe_to(Topic::Alerts);

        let event = alert("wind rising");
        bus.publish(event.clone());

        assert_eq!(first.recv().await?.id, event.id);
        assert_eq!(second.recv().await?.id, event.id);
        Ok(())
    }

    #[tokio::test]
    async fn subscriber_does_not_receive_other_topics() {
        let bus = EventBus::default();
        let mut health = bus.subscribe_to(Topic::ServiceHealth);

        bus.publish(alert("not for health"));

        let result = tokio::time::timeout(Duration::from_millis(50), health.recv()).await;
        assert!(result.is_err(), "ServiceHealth must not see an Alert event");
    }

    #[tokio::test]
    async fn global_channel_sees_every_topic() -> Result<(), Box<dyn std::error::Error>> {
        let bus = EventBus::default();
        let mut all = bus.subscribe_all();

        bus.publish(alert("one"));
        bus.publish(Event::new(
            "test",
            EventPayload::ServiceHealthChanged {
                service: ServiceKind::Weather,
                state: ServiceState::Degraded,
                attempts: 1,
            },
        ));

        assert!(matches!(all.recv().await?.payload, EventPayload::Alert { .. }));
        assert!(matches!(
            all.recv().await?.payload,
            EventPayload::ServiceHealthChanged { .. }
        ));
        assert_eq!(all.topic(), None);
        Ok(())
    }

    #[test]
    fn publish_without_subscribers_is_not_an_error() {
        let bus = EventBus::default();
        assert_eq!(bus.publish(alert("nobody listening")), 0);
    }

    #[tokio::test]
    async fn slow_subscriber_observes_lag() {
        let bus = EventBus::new(16);
        let mut slow = bus.subscribe_to(Topic::Alerts);

        for i in 0..1_000 {
            bus.publish(alert(&format!("flood {i}")));
        }

        let result = slow.recv().await;
        assert!(
            matches!(result, Err(broadcast::error::RecvError::Lagged(_))),
            "expected Lagged, got: {result:?}"
        );
        // `next` skips past the lag and keeps delivering.
        assert!(slow.next().await.is_some());
    }
}
