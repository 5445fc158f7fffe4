//! Topic-keyed publish/subscribe registry
//!
//! Topics must be registered with [`SubscriptionBus::add_topic`] before use;
//! touching an unknown topic is a programming error and panics.
//!
//! Consistency is relaxed: `publish` snapshots the subscriber list and calls
//! it with the lock released, so callbacks may subscribe, unsubscribe or
//! publish re-entrantly. A subscriber added while a publish is in flight may
//! or may not see that publish. Callbacks run on the publishing thread; the
//! bus does no marshaling.

use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::trace;

/// Subscriber callback, identified by its `Arc` allocation
pub type Subscriber<P> = Arc<dyn Fn(&P) + Send + Sync>;

/// Wrap a closure as a [`Subscriber`]; keep a clone to unsubscribe later
pub fn subscriber<P, F>(callback: F) -> Subscriber<P>
where
    F: Fn(&P) + Send + Sync + 'static,
{
    Arc::new(callback)
}

pub struct SubscriptionBus<K, P> {
    topics: RwLock<HashMap<K, Vec<Subscriber<P>>>>,
}

impl<K, P> SubscriptionBus<K, P>
where
    K: Eq + Hash + Copy + Debug,
{
    pub fn new() -> Self {
        Self {
            topics: RwLock::new(HashMap::new()),
        }
    }

    /// Bus with `topics` already registered
    pub fn with_topics(topics: impl IntoIterator<Item = K>) -> Self {
        let bus = Self::new();
        for topic in topics {
            bus.add_topic(topic);
        }
        bus
    }

    /// Register a topic; registering it again keeps existing subscribers
    pub fn add_topic(&self, topic: K) {
        self.topics.write().entry(topic).or_default();
    }

    /// Drop a topic and all its subscribers
    pub fn remove_topic(&self, topic: K) {
        self.topics.write().remove(&topic);
    }

    pub fn has_topic(&self, topic: K) -> bool {
        self.topics.read().contains_key(&topic)
    }

    /// Add `subscriber` to `topic`; subscribing the same callback again is a no-op
    ///
    /// # Panics
    /// If `topic` was never registered.
    pub fn subscribe(&self, topic: K, subscriber: Subscriber<P>) {
        let mut topics = self.topics.write();
        let subscribers = topics.get_mut(&topic).unwrap_or_else(|| unknown_topic(topic));
        if !subscribers.iter().any(|s| same_subscriber(s, &subscriber)) {
            subscribers.push(subscriber);
        }
    }

    /// Remove `subscriber` (by identity); unknown subscribers are ignored
    ///
    /// # Panics
    /// If `topic` was never registered.
    pub fn unsubscribe(&self, topic: K, subscriber: &Subscriber<P>) {
        let mut topics = self.topics.write();
        let subscribers = topics.get_mut(&topic).unwrap_or_else(|| unknown_topic(topic));
        subscribers.retain(|s| !same_subscriber(s, subscriber));
    }

    pub fn subscriber_count(&self, topic: K) -> usize {
        self.topics.read().get(&topic).map_or(0, Vec::len)
    }

    /// Deliver `payload` to every current subscriber of `topic`
    ///
    /// # Panics
    /// If `topic` was never registered.
    pub fn publish(&self, topic: K, payload: &P) {
        let snapshot: Vec<Subscriber<P>> = self
            .topics
            .read()
            .get(&topic)
            .unwrap_or_else(|| unknown_topic(topic))
            .clone();

        trace!("Publishing on {:?} to {} subscribers", topic, snapshot.len());
        for subscriber in snapshot {
            subscriber(payload);
        }
    }
}

impl<K, P> Default for SubscriptionBus<K, P>
where
    K: Eq + Hash + Copy + Debug,
{
    fn default() -> Self {
        Self::new()
    }
}

fn same_subscriber<P>(a: &Subscriber<P>, b: &Subscriber<P>) -> bool {
    std::ptr::eq(
        Arc::as_ptr(a) as *const (),
        Arc::as_ptr(b) as *const (),
    )
}

fn unknown_topic<K: Debug>(topic: K) -> ! {
    panic!("topic {:?} is not registered on this bus", topic)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    enum T {
        Loops,
        Mappings,
    }

    fn counter() -> (Arc<AtomicUsize>, Subscriber<(String, String)>) {
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        let sub = subscriber(move |_: &(String, String)| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        (count, sub)
    }

    #[test]
    fn test_publish_then_unsubscribe() {
        let bus = SubscriptionBus::with_topics([T::Loops, T::Mappings]);
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let s = Arc::clone(&seen);
        let sub = subscriber(move |p: &(String, String)| s.lock().push(p.clone()));

        bus.subscribe(T::Loops, Arc::clone(&sub));
        bus.publish(T::Loops, &("add".into(), "L1".into()));
        assert_eq!(*seen.lock(), vec![("add".to_string(), "L1".to_string())]);

        bus.unsubscribe(T::Loops, &sub);
        bus.publish(T::Loops, &("add".into(), "L2".into()));
        assert_eq!(seen.lock().len(), 1);
    }

    #[test]
    fn test_subscribing_twice_delivers_once() {
        let bus = SubscriptionBus::with_topics([T::Loops]);
        let (count, sub) = counter();
        bus.subscribe(T::Loops, Arc::clone(&sub));
        bus.subscribe(T::Loops, Arc::clone(&sub));
        assert_eq!(bus.subscriber_count(T::Loops), 1);

        bus.publish(T::Loops, &("add".into(), "L1".into()));
        assert_eq!(count.load(Ordering::SeqCst), 1);

        bus.unsubscribe(T::Loops, &sub);
        bus.publish(T::Loops, &("add".into(), "L2".into()));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_topics_are_isolated() {
        let bus = SubscriptionBus::with_topics([T::Loops, T::Mappings]);
        let (count, sub) = counter();
        bus.subscribe(T::Mappings, sub);
        bus.publish(T::Loops, &("add".into(), "L1".into()));
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_unsubscribe_is_by_identity() {
        let bus = SubscriptionBus::with_topics([T::Loops]);
        let (count_a, a) = counter();
        let (count_b, b) = counter();
        bus.subscribe(T::Loops, Arc::clone(&a));
        bus.subscribe(T::Loops, Arc::clone(&b));

        bus.unsubscribe(T::Loops, &a);
        bus.publish(T::Loops, &("add".into(), "L1".into()));

        assert_eq!(count_a.load(Ordering::SeqCst), 0);
        assert_eq!(count_b.load(Ordering::SeqCst), 1);
        assert_eq!(bus.subscriber_count(T::Loops), 1);
    }

    #[test]
    #[should_panic(expected = "not registered")]
    fn test_unknown_topic_panics() {
        let bus: SubscriptionBus<T, (String, String)> = SubscriptionBus::with_topics([T::Loops]);
        bus.publish(T::Mappings, &("add".into(), "x".into()));
    }

    #[test]
    #[should_panic(expected = "not registered")]
    fn test_removed_topic_panics() {
        let bus = SubscriptionBus::with_topics([T::Loops]);
        bus.remove_topic(T::Loops);
        let (_, sub) = counter();
        bus.subscribe(T::Loops, sub);
    }

    #[test]
    fn test_unsubscribe_from_within_callback() {
        let bus = Arc::new(SubscriptionBus::with_topics([T::Loops]));
        let count = Arc::new(AtomicUsize::new(0));
        let slot: Arc<parking_lot::Mutex<Option<Subscriber<(String, String)>>>> =
            Arc::new(parking_lot::Mutex::new(None));

        let (bus2, count2, slot2) = (Arc::clone(&bus), Arc::clone(&count), Arc::clone(&slot));
        let sub = subscriber(move |_: &(String, String)| {
            count2.fetch_add(1, Ordering::SeqCst);
            if let Some(me) = slot2.lock().take() {
                bus2.unsubscribe(T::Loops, &me);
            }
        });
        *slot.lock() = Some(Arc::clone(&sub));
        bus.subscribe(T::Loops, sub);

        bus.publish(T::Loops, &("add".into(), "L1".into()));
        bus.publish(T::Loops, &("add".into(), "L2".into()));
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(bus.subscriber_count(T::Loops), 0);
    }

    #[test]
    fn test_concurrent_subscribe_unsubscribe_publish() {
        let bus = Arc::new(SubscriptionBus::with_topics([T::Loops]));
        let mut handles = Vec::new();

        for _ in 0..100 {
            let bus = Arc::clone(&bus);
            handles.push(std::thread::spawn(move || {
                let (_, sub) = counter();
                bus.subscribe(T::Loops, Arc::clone(&sub));
                bus.unsubscribe(T::Loops, &sub);
            }));
        }
        for i in 0..100 {
            let bus = Arc::clone(&bus);
            handles.push(std::thread::spawn(move || {
                bus.publish(T::Loops, &("add".into(), format!("L{}", i)));
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(bus.subscriber_count(T::Loops), 0);
    }
}
