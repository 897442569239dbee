use std::sync::{Arc, RwLock};

use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    SettingSaved { key: String, value: String },
    ExtensionEnabled(String),
    ExtensionDisabled(String),
    CacheCleared,
}

type Listener = Arc<dyn Fn(&Event) + Send + Sync>;

/// Synchronous in-process event bus; listeners run in registration order.
#[derive(Default)]
pub struct Dispatcher {
    listeners: RwLock<Vec<Listener>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn listen<F>(&self, listener: F)
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        if let Ok(mut listeners) = self.listeners.write() {
            listeners.push(Arc::new(listener));
        }
    }

    pub fn dispatch(&self, event: &Event) {
        debug!(?event, "dispatching event");
        // clone out so listeners may register further listeners
        let listeners: Vec<Listener> = match self.listeners.read() {
            Ok(l) => l.clone(),
            Err(_) => return,
        };
        for listener in listeners {
            listener(event);
        }
    }
}
