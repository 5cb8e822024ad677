//! Named observable state mirrored from the host

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use serde_json::{Map, Value};

use crate::bridge::ObservableValue;

/// Observable values keyed by state name.
///
/// Looking up a name that has never been pushed yields an observable with no
/// value, so subscribers can attach before the host's first update.
#[derive(Debug, Default)]
pub struct StateStore {
    values: Mutex<HashMap<String, ObservableValue<Value>>>,
}

impl StateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Observable for `name`, created empty on first use
    pub fn observe(&self, name: &str) -> ObservableValue<Value> {
        self.values
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(name.to_string())
            .or_insert_with(ObservableValue::with_no_value)
            .clone()
    }

    /// Current value of `name`, if the host has sent one
    pub fn get(&self, name: &str) -> Option<Value> {
        self.values
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .and_then(ObservableValue::value)
    }

    /// Set `name` and notify its subscribers
    pub fn assign(&self, name: &str, value: Value) {
        // Subscribers run after the map lock is released.
        self.observe(name).assign_and_signal(value);
    }

    /// Assign every entry of an initial state snapshot
    pub fn apply_snapshot(&self, snapshot: Map<String, Value>) {
        for (name, value) in snapshot {
            self.assign(&name, value);
        }
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .values
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    /// Drop every subscriber of every value
    pub fn clear_subscribers(&self) {
        let values: Vec<ObservableValue<Value>> = self
            .values
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        for value in values {
            value.clear_subscribers();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;

    #[test]
    fn test_subscribe_before_first_push() {
        let store = StateStore::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        store.observe("panelState").subscribe(move |v| sink.lock().unwrap().push(v.clone()));

        assert!(store.get("panelState").is_none());
        store.assign("panelState", json!("open"));
        assert_eq!(*seen.lock().unwrap(), vec![json!("open")]);
        assert_eq!(store.get("panelState"), Some(json!("open")));
    }

    #[test]
    fn test_snapshot_assigns_each_entry() {
        let store = StateStore::new();
        let mut snapshot = Map::new();
        snapshot.insert("a".to_string(), json!(1));
        snapshot.insert("b".to_string(), json!({"nested": true}));
        store.apply_snapshot(snapshot);

        assert_eq!(store.names(), vec!["a", "b"]);
        assert_eq!(store.get("b").unwrap()["nested"], true);
    }

    #[test]
    fn test_subscriber_may_read_store_reentrantly() {
        let store = Arc::new(StateStore::new());
        let inner = Arc::clone(&store);
        let seen = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&seen);
        store.observe("x").subscribe(move |_| {
            *sink.lock().unwrap() = inner.get("x");
        });
        store.assign("x", json!(5));
        assert_eq!(*seen.lock().unwrap(), Some(json!(5)));
    }

    #[test]
    fn test_clear_subscribers_keeps_values() {
        let store = StateStore::new();
        store.observe("x").subscribe(|_| {});
        store.assign("x", json!(1));
        store.clear_subscribers();
        assert_eq!(store.observe("x").subscriber_count(), 0);
        assert_eq!(store.get("x"), Some(json!(1)));
    }
}
