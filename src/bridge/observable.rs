//! Single-value publish/subscribe with replay on subscribe

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// Whether an observable has ever been assigned
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValueState<T> {
    Unset,
    Set(T),
}

struct Inner<T> {
    state: ValueState<T>,
    subscribers: Vec<(u64, Callback<T>)>,
    next_id: u64,
}

/// A value that changes over time.
///
/// Subscribers are called in subscription order. Once a value has been set,
/// new subscribers immediately receive it before `subscribe` returns.
pub struct ObservableValue<T> {
    inner: Arc<Mutex<Inner<T>>>,
}

impl<T: Clone + Send + 'static> ObservableValue<T> {
    /// Create an observable with an initial, immediately visible value
    pub fn with_value(value: T) -> Self {
        Self::from_state(ValueState::Set(value))
    }

    /// Create an observable whose subscribers hear nothing until the first
    /// `assign_and_signal`
    pub fn with_no_value() -> Self {
        Self::from_state(ValueState::Unset)
    }

    fn from_state(state: ValueState<T>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                state,
                subscribers: Vec::new(),
                next_id: 0,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner<T>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn has_value(&self) -> bool {
        matches!(self.lock().state, ValueState::Set(_))
    }

    /// Current value, if one has been set
    pub fn value(&self) -> Option<T> {
        match &self.lock().state {
            ValueState::Set(value) => Some(value.clone()),
            ValueState::Unset => None,
        }
    }

    pub fn state(&self) -> ValueState<T> {
        self.lock().state.clone()
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().subscribers.len()
    }

    /// Register `callback`, replaying the current value to it if there is one
    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let callback: Callback<T> = Arc::new(callback);
        let (id, current) = {
            let mut inner = self.lock();
            let id = inner.next_id;
            inner.next_id += 1;
            inner.subscribers.push((id, Arc::clone(&callback)));
            let current = match &inner.state {
                ValueState::Set(value) => Some(value.clone()),
                ValueState::Unset => None,
            };
            (id, current)
        };

        if let Some(value) = current {
            invoke(&callback, &value);
        }

        let weak: Weak<Mutex<Inner<T>>> = Arc::downgrade(&self.inner);
        Subscription {
            unsubscribe: Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    inner
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .subscribers
                        .retain(|(existing, _)| *existing != id);
                }
            }),
        }
    }

    /// Store `value` and notify every current subscriber.
    ///
    /// Iterates a snapshot taken before the first callback runs: subscribers
    /// added during the broadcast wait for the next one, and subscribers
    /// removed during it are skipped.
    pub fn assign_and_signal(&self, value: T) {
        let snapshot: Vec<(u64, Callback<T>)> = {
            let mut inner = self.lock();
            inner.state = ValueState::Set(value.clone());
            inner
                .subscribers
                .iter()
                .map(|(id, cb)| (*id, Arc::clone(cb)))
                .collect()
        };

        for (id, callback) in snapshot {
            if !self.is_subscribed(id) {
                continue;
            }
            invoke(&callback, &value);
        }
    }

    /// Drop every subscriber; used at endpoint teardown
    pub fn clear_subscribers(&self) {
        self.lock().subscribers.clear();
    }

    fn is_subscribed(&self, id: u64) -> bool {
        self.lock().subscribers.iter().any(|(existing, _)| *existing == id)
    }
}

fn invoke<T>(callback: &Callback<T>, value: &T) {
    if panic::catch_unwind(AssertUnwindSafe(|| callback(value))).is_err() {
        log::warn!("ObservableValue: subscriber panicked; continuing broadcast");
    }
}

impl<T> Clone for ObservableValue<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for ObservableValue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        f.debug_struct("ObservableValue")
            .field("state", &inner.state)
            .field("subscribers", &inner.subscribers.len())
            .finish()
    }
}

/// Handle for removing a subscriber.
///
/// Dropping the handle does not unsubscribe.
pub struct Subscription {
    unsubscribe: Box<dyn Fn() + Send + Sync>,
}

impl Subscription {
    pub fn unsubscribe(&self) {
        (self.unsubscribe)();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Subscription")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recorder() -> (Arc<Mutex<Vec<String>>>, impl Fn(&str) -> Box<dyn Fn(&i32) + Send + Sync>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let l = Arc::clone(&log);
        let make = move |name: &str| -> Box<dyn Fn(&i32) + Send + Sync> {
            let l = Arc::clone(&l);
            let name = name.to_string();
            Box::new(move |v: &i32| l.lock().unwrap().push(format!("{}:{}", name, v)))
        };
        (log, make)
    }

    #[test]
    fn test_no_value_defers_delivery() {
        let (log, make) = recorder();
        let obs = ObservableValue::<i32>::with_no_value();
        let cb = make("a");
        obs.subscribe(move |v| cb(v));
        assert!(log.lock().unwrap().is_empty());
        assert!(!obs.has_value());

        obs.assign_and_signal(1);
        assert_eq!(*log.lock().unwrap(), vec!["a:1"]);
        assert_eq!(obs.value(), Some(1));
    }

    #[test]
    fn test_replay_on_subscribe() {
        let (log, make) = recorder();
        let obs = ObservableValue::with_value(42);
        let cb = make("a");
        obs.subscribe(move |v| cb(v));
        assert_eq!(*log.lock().unwrap(), vec!["a:42"]);
    }

    #[test]
    fn test_broadcast_in_subscription_order() {
        let (log, make) = recorder();
        let obs = ObservableValue::with_no_value();
        for name in ["a", "b", "c"] {
            let cb = make(name);
            obs.subscribe(move |v| cb(v));
        }
        obs.assign_and_signal(7);
        assert_eq!(*log.lock().unwrap(), vec!["a:7", "b:7", "c:7"]);
    }

    #[test]
    fn test_panicking_subscriber_does_not_block_others() {
        let (log, make) = recorder();
        let obs = ObservableValue::with_no_value();
        let a = make("a");
        obs.subscribe(move |v| a(v));
        obs.subscribe(|_: &i32| panic!("subscriber failure"));
        let c = make("c");
        obs.subscribe(move |v| c(v));

        obs.assign_and_signal(3);
        assert_eq!(*log.lock().unwrap(), vec!["a:3", "c:3"]);
    }

    #[test]
    fn test_unsubscribe_during_broadcast_skips_removed() {
        let (log, make) = recorder();
        let obs = ObservableValue::with_no_value();
        let victim_slot: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));

        let slot = Arc::clone(&victim_slot);
        obs.subscribe(move |_: &i32| {
            if let Some(sub) = slot.lock().unwrap().as_ref() {
                sub.unsubscribe();
            }
        });
        let b = make("b");
        let victim = obs.subscribe(move |v| b(v));
        *victim_slot.lock().unwrap() = Some(victim);

        obs.assign_and_signal(1);
        obs.assign_and_signal(2);
        assert!(log.lock().unwrap().is_empty());
        assert_eq!(obs.subscriber_count(), 1);
    }

    #[test]
    fn test_self_unsubscribe_never_called_again() {
        let hits = Arc::new(Mutex::new(0));
        let obs = ObservableValue::with_no_value();
        let slot: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));

        let h = Arc::clone(&hits);
        let s = Arc::clone(&slot);
        let sub = obs.subscribe(move |_: &i32| {
            *h.lock().unwrap() += 1;
            if let Some(sub) = s.lock().unwrap().as_ref() {
                sub.unsubscribe();
            }
        });
        *slot.lock().unwrap() = Some(sub);

        obs.assign_and_signal(1);
        obs.assign_and_signal(2);
        assert_eq!(*hits.lock().unwrap(), 1);
    }

    #[test]
    fn test_subscriber_added_mid_broadcast_waits_for_next() {
        let (log, make) = recorder();
        let obs = ObservableValue::<i32>::with_no_value();
        let added = Arc::new(Mutex::new(false));

        let obs_clone = obs.clone();
        let late = Arc::new(make("late"));
        let flag = Arc::clone(&added);
        obs.subscribe(move |_| {
            let mut done = flag.lock().unwrap();
            if !*done {
                *done = true;
                let late = Arc::clone(&late);
                obs_clone.subscribe(move |v| late(v));
            }
        });

        obs.assign_and_signal(1);
        // Replay-on-subscribe delivers the value that was just set, once.
        assert_eq!(*log.lock().unwrap(), vec!["late:1"]);

        obs.assign_and_signal(2);
        assert_eq!(*log.lock().unwrap(), vec!["late:1", "late:2"]);
    }

    #[test]
    fn test_clear_subscribers() {
        let obs = ObservableValue::with_value(1);
        obs.subscribe(|_| {});
        obs.subscribe(|_| {});
        assert_eq!(obs.subscriber_count(), 2);
        obs.clear_subscribers();
        assert_eq!(obs.subscriber_count(), 0);
        assert_eq!(obs.state(), ValueState::Set(1));
    }
}
