//! Domain events and the in-process event bus.
//!
//! The bus decouples *receiving* a deployment change (a Postgres notification, or any
//! other transport) from *applying* it to process-local state. Publishers and
//! subscribers only share event types, never references to each other.

use crate::core::deployment::{Deployment, DeploymentName};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::{
    any::{Any, TypeId},
    fmt,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};
use tracing::trace;

/// Marker for values that travel over the [`EventBus`].
pub trait DomainEvent: Any + Send + Sync + fmt::Debug {
    /// Stable name used in logs.
    fn event_name(&self) -> &'static str;
}

/// A transition of the active slot, as observed by this process.
///
/// `previous_deployment` is reconstructed from whatever this process last saw, because the
/// notification only carries the new value. Treat it as a hint, never as the source of truth.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeploymentChanged {
    /// Best-effort reconstruction of the slot that was active before
    pub previous_deployment: Deployment,
    /// The slot that is active now
    pub new_deployment: Deployment,
    /// When this process observed the transition
    pub occurred_at: DateTime<Utc>,
}

impl DeploymentChanged {
    /// Builds an event for a transition from `previous` to `new`, stamped now.
    #[must_use]
    pub fn new(previous: DeploymentName, new: DeploymentName) -> Self {
        Self {
            previous_deployment: Deployment::create(previous),
            new_deployment: Deployment::create(new),
            occurred_at: Utc::now(),
        }
    }
}

impl DomainEvent for DeploymentChanged {
    fn event_name(&self) -> &'static str {
        "deployment_changed"
    }
}

/// Handle returned by [`EventBus::subscribe`], used to unsubscribe later.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type ErasedHandler = Arc<dyn Fn(&dyn Any) + Send + Sync>;

struct Registration {
    id: SubscriptionId,
    event_type: TypeId,
    handler: ErasedHandler,
}

/// Minimal typed publish/subscribe registry.
///
/// Handlers run synchronously on the publishing task, in subscription order. The registry
/// lock is released before any handler runs, so handlers may publish or (un)subscribe.
pub struct EventBus {
    next_id: AtomicU64,
    registrations: RwLock<Vec<Registration>>,
}

impl EventBus {
    /// Creates an empty bus.
    #[must_use]
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            registrations: RwLock::new(Vec::new()),
        }
    }

    /// Registers `handler` for every future event of type `E`.
    pub fn subscribe<E, F>(&self, handler: F) -> SubscriptionId
    where
        E: DomainEvent,
        F: Fn(&E) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let erased: ErasedHandler = Arc::new(move |event: &dyn Any| {
            if let Some(event) = event.downcast_ref::<E>() {
                handler(event);
            }
        });

        self.registrations.write().push(Registration {
            id,
            event_type: TypeId::of::<E>(),
            handler: erased,
        });
        id
    }

    /// Removes a subscription. Returns false if it was already gone.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut registrations = self.registrations.write();
        let before = registrations.len();
        registrations.retain(|registration| registration.id != id);
        registrations.len() != before
    }

    /// Delivers `event` to every handler subscribed to `E` and returns how many ran.
    pub fn publish<E: DomainEvent>(&self, event: &E) -> usize {
        let handlers: Vec<ErasedHandler> = self
            .registrations
            .read()
            .iter()
            .filter(|registration| registration.event_type == TypeId::of::<E>())
            .map(|registration| Arc::clone(&registration.handler))
            .collect();

        trace!(
            event = event.event_name(),
            handlers = handlers.len(),
            "Publishing domain event"
        );

        for handler in &handlers {
            handler(event);
        }
        handlers.len()
    }

    /// Number of live subscriptions for `E`.
    #[must_use]
    pub fn subscriber_count<E: DomainEvent>(&self) -> usize {
        self.registrations
            .read()
            .iter()
            .filter(|registration| registration.event_type == TypeId::of::<E>())
            .count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("subscriptions", &self.registrations.read().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Debug)]
    struct Unrelated;

    impl DomainEvent for Unrelated {
        fn event_name(&self) -> &'static str {
            "unrelated"
        }
    }

    #[test]
    fn test_publish_reaches_only_matching_subscribers() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let sink = Arc::clone(&seen);
        bus.subscribe(move |event: &DeploymentChanged| {
            sink.lock().push(event.new_deployment.name());
        });
        bus.subscribe(|_: &Unrelated| panic!("wrong event type delivered"));

        let delivered = bus.publish(&DeploymentChanged::new(
            DeploymentName::Blue,
            DeploymentName::Green,
        ));

        assert_eq!(delivered, 1);
        assert_eq!(*seen.lock(), vec![DeploymentName::Green]);
    }

    #[test]
    fn test_unsubscribe_stops_delivery() {
        let bus = EventBus::new();
        let count = Arc::new(Mutex::new(0_u32));

        let counter = Arc::clone(&count);
        let id = bus.subscribe(move |_: &DeploymentChanged| *counter.lock() += 1);
        assert_eq!(bus.subscriber_count::<DeploymentChanged>(), 1);

        bus.publish(&DeploymentChanged::new(DeploymentName::Blue, DeploymentName::Green));
        assert!(bus.unsubscribe(id));
        assert!(!bus.unsubscribe(id));
        bus.publish(&DeploymentChanged::new(DeploymentName::Green, DeploymentName::Blue));

        assert_eq!(*count.lock(), 1);
        assert_eq!(bus.subscriber_count::<DeploymentChanged>(), 0);
    }

    #[test]
    fn test_handlers_may_publish_reentrantly() {
        let bus = Arc::new(EventBus::new());
        let unrelated_seen = Arc::new(Mutex::new(false));

        let flag = Arc::clone(&unrelated_seen);
        bus.subscribe(move |_: &Unrelated| *flag.lock() = true);

        let inner = Arc::clone(&bus);
        bus.subscribe(move |_: &DeploymentChanged| {
            inner.publish(&Unrelated);
        });

        assert_eq!(
            bus.publish(&DeploymentChanged::new(DeploymentName::Blue, DeploymentName::Green)),
            1
        );
        assert!(*unrelated_seen.lock());
    }

    #[test]
    fn test_publish_without_subscribers_is_noop() {
        let bus = EventBus::default();
        assert_eq!(bus.publish(&Unrelated), 0);
    }
}
