use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;

use serde_json::Value;

pub const DEFAULT_MAX_LISTENERS: usize = 100;

pub type Listener = Arc<dyn Fn(&Value) + Send + Sync>;

#[derive(Default)]
struct Registry {
    listeners: HashMap<String, Vec<Listener>>,
    deferred: Vec<(String, Listener)>,
    warned: HashSet<String>,
}

/// Named-event listener registry for the provider's external surface.
///
/// Listeners registered through [`EventEmitter::defer`] are held back until
/// [`EventEmitter::attach_deferred`] runs.
pub struct EventEmitter {
    registry: StdMutex<Registry>,
    max_listeners: usize,
}

impl std::fmt::Debug for EventEmitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let registry = self.registry.lock().expect("emitter mutex poisoned");
        let mut events: Vec<_> = registry
            .listeners
            .iter()
            .map(|(name, list)| (name.clone(), list.len()))
            .collect();
        events.sort();
        f.debug_struct("EventEmitter")
            .field("events", &events)
            .field("deferred", &registry.deferred.len())
            .field("max_listeners", &self.max_listeners)
            .finish()
    }
}

impl Default for EventEmitter {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_LISTENERS)
    }
}

impl EventEmitter {
    #[must_use]
    pub fn new(max_listeners: usize) -> Self {
        Self {
            registry: StdMutex::new(Registry::default()),
            max_listeners,
        }
    }

    pub fn on(&self, event: &str, listener: Listener) {
        let mut registry = self.registry.lock().expect("emitter mutex poisoned");
        let list = registry.listeners.entry(event.to_string()).or_default();
        list.push(listener);
        let count = list.len();
        // 0 disables the limit.
        if self.max_listeners > 0
            && count > self.max_listeners
            && registry.warned.insert(event.to_string())
        {
            tracing::warn!(
                event,
                count,
                max = self.max_listeners,
                "possible listener leak: too many listeners for one event"
            );
        }
    }

    /// Holds `listener` until [`EventEmitter::attach_deferred`].
    pub fn defer(&self, event: &str, listener: Listener) {
        self.registry
            .lock()
            .expect("emitter mutex poisoned")
            .deferred
            .push((event.to_string(), listener));
    }

    /// Attaches every deferred listener in registration order.
    pub fn attach_deferred(&self) -> usize {
        let deferred = std::mem::take(
            &mut self
                .registry
                .lock()
                .expect("emitter mutex poisoned")
                .deferred,
        );
        let attached = deferred.len();
        for (event, listener) in deferred {
            self.on(&event, listener);
        }
        attached
    }

    /// Calls every listener for `event` in registration order. Returns
    /// whether any listener was registered.
    pub fn emit(&self, event: &str, payload: &Value) -> bool {
        let listeners = self
            .registry
            .lock()
            .expect("emitter mutex poisoned")
            .listeners
            .get(event)
            .cloned()
            .unwrap_or_default();
        for listener in &listeners {
            listener(payload);
        }
        !listeners.is_empty()
    }

    #[must_use]
    pub fn listener_count(&self, event: &str) -> usize {
        self.registry
            .lock()
            .expect("emitter mutex poisoned")
            .listeners
            .get(event)
            .map_or(0, Vec::len)
    }

    #[must_use]
    pub fn deferred_count(&self) -> usize {
        self.registry
            .lock()
            .expect("emitter mutex poisoned")
            .deferred
            .len()
    }

    pub fn remove_all_listeners(&self, event: &str) {
        let mut registry = self.registry.lock().expect("emitter mutex poisoned");
        registry.listeners.remove(event);
        registry.warned.remove(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::LogCapture;
    use serde_json::json;

    fn collecting(sink: &Arc<StdMutex<Vec<Value>>>) -> Listener {
        let sink = Arc::clone(sink);
        Arc::new(move |value: &Value| sink.lock().expect("sink").push(value.clone()))
    }

    #[test]
    fn emit_reaches_listeners_in_order() {
        let emitter = EventEmitter::default();
        let order = Arc::new(StdMutex::new(Vec::new()));
        for label in ["first", "second"] {
            let order = Arc::clone(&order);
            emitter.on(
                "chainChanged",
                Arc::new(move |_| order.lock().expect("order").push(label)),
            );
        }

        assert!(emitter.emit("chainChanged", &json!("0x1")));
        assert!(!emitter.emit("networkChanged", &json!("1")));
        assert_eq!(*order.lock().expect("order"), vec!["first", "second"]);
    }

    #[test]
    fn deferred_listeners_attach_on_demand() {
        let emitter = EventEmitter::default();
        let seen = Arc::new(StdMutex::new(Vec::new()));
        emitter.defer("connect", collecting(&seen));

        emitter.emit("connect", &json!({"chainId": "0x1"}));
        assert!(seen.lock().expect("seen").is_empty());

        assert_eq!(emitter.attach_deferred(), 1);
        emitter.emit("connect", &json!({"chainId": "0x1"}));
        assert_eq!(seen.lock().expect("seen").len(), 1);
        assert_eq!(emitter.deferred_count(), 0);
    }

    #[test]
    fn exceeding_max_listeners_warns_once() {
        let capture = LogCapture::new();
        let _guard = capture.set_default();
        let emitter = EventEmitter::new(2);
        let seen = Arc::new(StdMutex::new(Vec::new()));

        for _ in 0..4 {
            emitter.on("accountsChanged", collecting(&seen));
        }

        assert_eq!(emitter.listener_count("accountsChanged"), 4);
        assert_eq!(capture.count_containing("possible listener leak"), 1);
    }

    #[test]
    fn listener_may_register_another_listener() {
        let emitter = Arc::new(EventEmitter::default());
        let inner = Arc::clone(&emitter);
        emitter.on(
            "connect",
            Arc::new(move |_| inner.on("connect", Arc::new(|_| {}))),
        );

        emitter.emit("connect", &Value::Null);

        assert_eq!(emitter.listener_count("connect"), 2);
    }
}
