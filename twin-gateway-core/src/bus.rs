//! Listener registry the gateway flushes notifications into.
//!
//! Listeners are invoked on the gateway worker, in record order, after the
//! command that produced the records has resolved its caller. They must not
//! block; `ChannelListener` hands notifications to another task.

use std::collections::BTreeMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, PoisonError, RwLock};

use tokio::sync::mpsc;
use tracing::{error, info};
use uuid::Uuid;

use crate::notification::{
    ActionNotification, DataNotification, LifecycleNotification, MetadataNotification, Notification,
};

pub trait NotificationListener: Send + Sync + 'static {
    /// Entry point used by the bus. The default dispatches on the kind.
    fn notify(&self, notification: &Notification) {
        match notification {
            Notification::Lifecycle(n) => self.on_lifecycle(n),
            Notification::Data(n) => self.on_data(n),
            Notification::Metadata(n) => self.on_metadata(n),
            Notification::Action(n) => self.on_action(n),
        }
    }

    fn on_lifecycle(&self, _notification: &LifecycleNotification) {}

    fn on_data(&self, _notification: &DataNotification) {}

    fn on_metadata(&self, _notification: &MetadataNotification) {}

    fn on_action(&self, _notification: &ActionNotification) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SubscriptionId(Uuid);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Wildcard,
}

/// `provider/service/resource` pattern.
///
/// `*` matches exactly one segment, except in last position where it matches
/// whatever remains, including nothing: `P1/*` matches `P1`, `P1/svc` and
/// `P1/svc/val`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicPattern {
    segments: Vec<Segment>,
}

impl TopicPattern {
    pub fn new(pattern: &str) -> Self {
        let segments = pattern
            .trim_matches('/')
            .split('/')
            .filter(|s| !s.is_empty())
            .map(|s| match s {
                "*" => Segment::Wildcard,
                literal => Segment::Literal(literal.to_string()),
            })
            .collect();
        Self { segments }
    }

    pub fn matches(&self, path: &[&str]) -> bool {
        let mut remaining = path.iter();
        let last = self.segments.len().saturating_sub(1);
        for (i, segment) in self.segments.iter().enumerate() {
            match segment {
                Segment::Wildcard if i == last => return true,
                Segment::Wildcard => {
                    if remaining.next().is_none() {
                        return false;
                    }
                }
                Segment::Literal(literal) => match remaining.next() {
                    Some(part) if *part == literal.as_str() => {}
                    _ => return false,
                },
            }
        }
        remaining.next().is_none()
    }
}

impl fmt::Display for TopicPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<&str> = self
            .segments
            .iter()
            .map(|s| match s {
                Segment::Literal(l) => l.as_str(),
                Segment::Wildcard => "*",
            })
            .collect();
        f.write_str(&parts.join("/"))
    }
}

struct Subscription {
    patterns: Vec<TopicPattern>,
    listener: Arc<dyn NotificationListener>,
}

impl Subscription {
    fn wants(&self, path: &[&str]) -> bool {
        self.patterns.iter().any(|p| p.matches(path))
    }
}

#[derive(Clone, Default)]
pub struct NotificationBus {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    listeners: RwLock<BTreeMap<SubscriptionId, Subscription>>,
}

impl NotificationBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `listener` for every path matching one of `patterns`. An
    /// empty pattern list matches nothing.
    pub fn add_listener<I, S>(&self, patterns: I, listener: Arc<dyn NotificationListener>) -> SubscriptionId
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let patterns: Vec<TopicPattern> = patterns.into_iter().map(|p| TopicPattern::new(p.as_ref())).collect();
        let id = SubscriptionId(Uuid::new_v4());
        info!(subscription = %id, patterns = ?patterns.iter().map(ToString::to_string).collect::<Vec<_>>(), "listener added");
        self.inner
            .listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, Subscription { patterns, listener });
        id
    }

    pub fn remove_listener(&self, id: SubscriptionId) -> bool {
        let removed = self
            .inner
            .listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id)
            .is_some();
        if removed {
            info!(subscription = %id, "listener removed");
        }
        removed
    }

    pub fn listener_count(&self) -> usize {
        self.inner.listeners.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Calls every matching listener. The registry lock is released before
    /// any listener runs, so listeners may add or remove subscriptions.
    pub fn deliver(&self, notification: &Notification) {
        let path = notification.segments();
        let targets: Vec<(SubscriptionId, Arc<dyn NotificationListener>)> = self
            .inner
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|(_, sub)| sub.wants(&path))
            .map(|(id, sub)| (*id, Arc::clone(&sub.listener)))
            .collect();

        for (id, listener) in targets {
            if catch_unwind(AssertUnwindSafe(|| listener.notify(notification))).is_err() {
                error!(subscription = %id, topic = %notification.topic(), "listener panicked");
            }
        }
    }
}

impl fmt::Debug for NotificationBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NotificationBus")
            .field("listeners", &self.listener_count())
            .finish()
    }
}

/// Forwards every notification into an unbounded channel.
pub struct ChannelListener {
    tx: mpsc::UnboundedSender<Notification>,
}

impl ChannelListener {
    pub fn channel() -> (Arc<Self>, mpsc::UnboundedReceiver<Notification>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { tx }), rx)
    }
}

impl NotificationListener for ChannelListener {
    fn notify(&self, notification: &Notification) {
        // A dropped receiver just means nobody is listening any more.
        let _ = self.tx.send(notification.clone());
    }
}

/// Logs every notification at `info`.
#[derive(Debug, Default)]
pub struct TracingListener;

impl NotificationListener for TracingListener {
    fn notify(&self, notification: &Notification) {
        match notification {
            Notification::Data(n) => {
                info!(topic = %notification.topic(), value = %n.new.value, "twin notification")
            }
            Notification::Metadata(n) => {
                info!(topic = %notification.topic(), key = %n.key, value = %n.new.value, "twin notification")
            }
            Notification::Lifecycle(n) => {
                info!(topic = %notification.topic(), status = ?n.status, "twin notification")
            }
            Notification::Action(_) => info!(topic = %notification.topic(), "twin notification"),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use chrono::Utc;
    use serde_json::json;

    use super::*;
    use crate::digital_twin::{DataType, ResourcePath, TimedValue};
    use crate::notification::{LifecycleStatus, NotificationAccumulator};

    #[derive(Default)]
    struct Recorder {
        data: Mutex<Vec<String>>,
        lifecycle: Mutex<Vec<LifecycleStatus>>,
    }

    impl NotificationListener for Recorder {
        fn on_lifecycle(&self, n: &LifecycleNotification) {
            self.lifecycle.lock().unwrap().push(n.status);
        }

        fn on_data(&self, n: &DataNotification) {
            self.data.lock().unwrap().push(n.path.to_string());
        }
    }

    fn data(provider: &str, resource: &str) -> Notification {
        let mut acc = NotificationAccumulator::new();
        acc.add_data_update(
            "m",
            None,
            &ResourcePath::new(provider, "svc", resource),
            DataType::Long,
            TimedValue::empty(),
            TimedValue::new(json!(1), Utc::now()),
        );
        acc.into_iter().next().unwrap()
    }

    #[test]
    fn trailing_wildcard_matches_any_depth() {
        let p = TopicPattern::new("P1/*");
        assert!(p.matches(&["P1"]));
        assert!(p.matches(&["P1", "svc"]));
        assert!(p.matches(&["P1", "svc", "val"]));
        assert!(!p.matches(&["P2", "svc", "val"]));
        assert!(TopicPattern::new("*").matches(&["any", "svc", "val"]));
    }

    #[test]
    fn inner_wildcard_matches_one_segment() {
        let p = TopicPattern::new("*/svc/val");
        assert!(p.matches(&["P1", "svc", "val"]));
        assert!(!p.matches(&["P1", "svc"]));
        assert!(!p.matches(&["P1", "other", "val"]));
        let exact = TopicPattern::new("P1/svc");
        assert!(exact.matches(&["P1", "svc"]));
        assert!(!exact.matches(&["P1", "svc", "val"]));
        assert_eq!(TopicPattern::new("/P1/*/").to_string(), "P1/*");
    }

    #[test]
    fn delivers_only_to_matching_listeners() {
        let bus = NotificationBus::new();
        let p1 = Arc::new(Recorder::default());
        let p2 = Arc::new(Recorder::default());
        bus.add_listener(["P1/*"], p1.clone());
        let id = bus.add_listener(vec!["P2/*".to_string(), "*/svc/special".to_string()], p2.clone());

        bus.deliver(&data("P1", "val"));
        bus.deliver(&data("P2", "val"));
        bus.deliver(&data("P1", "special"));

        assert_eq!(*p1.data.lock().unwrap(), ["P1/svc/val", "P1/svc/special"]);
        assert_eq!(*p2.data.lock().unwrap(), ["P2/svc/val", "P1/svc/special"]);

        assert!(bus.remove_listener(id));
        assert!(!bus.remove_listener(id));
        bus.deliver(&data("P2", "val"));
        assert_eq!(p2.data.lock().unwrap().len(), 2);
        assert!(p2.lifecycle.lock().unwrap().is_empty());
    }

    #[test]
    fn panicking_listener_does_not_stop_delivery() {
        struct Boom;
        impl NotificationListener for Boom {
            fn notify(&self, _: &Notification) {
                panic!("boom");
            }
        }

        let bus = NotificationBus::new();
        let recorder = Arc::new(Recorder::default());
        bus.add_listener(["*"], Arc::new(Boom));
        bus.add_listener(["*"], recorder.clone());
        bus.deliver(&data("P1", "val"));
        assert_eq!(recorder.data.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn channel_listener_forwards() {
        let bus = NotificationBus::new();
        let (listener, mut rx) = ChannelListener::channel();
        bus.add_listener(["P1/*"], listener);
        bus.deliver(&data("P1", "val"));
        let n = rx.recv().await.unwrap();
        assert_eq!(n.topic(), "DATA/P1/svc/val");
    }
}
