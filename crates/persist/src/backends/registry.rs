use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::{info, warn};

use super::{ActionBackend, EventBackend, ObjectStorageBackend};
use crate::{Error, Result};

/// Named backends available to the process. Names are only checked on
/// lookup.
#[derive(Default)]
pub struct Registry {
    objects: Mutex<HashMap<String, Arc<dyn ObjectStorageBackend>>>,
    events: Mutex<HashMap<String, Arc<dyn EventBackend>>>,
    actions: Mutex<HashMap<String, Arc<dyn ActionBackend>>>,
}

type Named<T> = Mutex<HashMap<String, Arc<T>>>;

fn insert<T: ?Sized>(map: &Named<T>, kind: &str, name: &str, backend: Arc<T>) {
    let mut map = map.lock().unwrap_or_else(|e| e.into_inner());
    if map.insert(name.to_string(), backend).is_some() {
        warn!("Replacing {} backend {}", kind, name);
    } else {
        info!("Registered {} backend {}", kind, name);
    }
}

fn lookup<T: ?Sized>(map: &Named<T>, kind: &str, name: &str) -> Result<Arc<T>> {
    map.lock()
        .unwrap_or_else(|e| e.into_inner())
        .get(name)
        .cloned()
        .ok_or_else(|| Error::BackendNotRegistered(format!("{} backend {}", kind, name)))
}

fn remove<T: ?Sized>(map: &Named<T>, name: &str) -> Option<Arc<T>> {
    map.lock().unwrap_or_else(|e| e.into_inner()).remove(name)
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_object(&self, backend: Arc<dyn ObjectStorageBackend>) {
        let name = backend.name();
        insert(&self.objects, "object storage", name, backend);
    }

    pub fn register_event(&self, backend: Arc<dyn EventBackend>) {
        let name = backend.name();
        insert(&self.events, "event", name, backend);
    }

    pub fn register_action(&self, backend: Arc<dyn ActionBackend>) {
        let name = backend.name();
        insert(&self.actions, "action", name, backend);
    }

    pub fn object_backend(&self, name: &str) -> Result<Arc<dyn ObjectStorageBackend>> {
        lookup(&self.objects, "object storage", name)
    }

    pub fn event_backend(&self, name: &str) -> Result<Arc<dyn EventBackend>> {
        lookup(&self.events, "event", name)
    }

    pub fn action_backend(&self, name: &str) -> Result<Arc<dyn ActionBackend>> {
        lookup(&self.actions, "action", name)
    }

    pub fn remove_object(&self, name: &str) -> Option<Arc<dyn ObjectStorageBackend>> {
        remove(&self.objects, name)
    }

    pub fn remove_event(&self, name: &str) -> Option<Arc<dyn EventBackend>> {
        remove(&self.events, name)
    }

    pub fn remove_action(&self, name: &str) -> Option<Arc<dyn ActionBackend>> {
        remove(&self.actions, name)
    }
}
