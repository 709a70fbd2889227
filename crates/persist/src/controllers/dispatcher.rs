//! Watch-driven worker pool.
//!
//! Every watch notification becomes a [`Request`]. Workers re-fetch the live
//! object, so a request only says "look at this object again"; duplicate and
//! out-of-order requests are harmless. A key waiting in the queue is queued
//! only once.

use std::collections::HashSet;
use std::fmt::Debug;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::{FutureExt, StreamExt};
use k8s_openapi::NamespaceResourceScope;
use kube::api::Api;
use kube::runtime::watcher::{self, watcher};
use kube::runtime::WatchStreamExt;
use kube::{Client, Resource};
use serde::de::DeserializeOwned;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{debug, error, info, warn};

use crate::config::ControllerConfig;
use crate::{codec, metrics, Result};

/// Namespaced reference to an object, with the uid folded into the name for
/// kinds keyed by uid.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Request {
    pub namespace: String,
    pub name: String,
}

impl std::fmt::Display for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Decoded request. `uid` is empty for kinds keyed by plain name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
    pub uid: String,
}

pub fn request_for<K: Resource>(obj: &K, composite: bool) -> Request {
    let meta = obj.meta();
    Request {
        namespace: meta.namespace.clone().unwrap_or_default(),
        name: if composite {
            codec::encode_object(meta)
        } else {
            meta.name.clone().unwrap_or_default()
        },
    }
}

pub fn decode_request(request: &Request, composite: bool) -> Result<ObjectKey> {
    let (uid, name) = if composite {
        codec::decode(&request.name)?
    } else {
        (String::new(), request.name.clone())
    };
    Ok(ObjectKey {
        namespace: request.namespace.clone(),
        name,
        uid,
    })
}

/// Delay before the `attempt`-th retry, doubling from `base` up to `max`.
pub fn backoff(base: Duration, max: Duration, attempt: u32) -> Duration {
    base.checked_mul(1u32 << attempt.min(16)).unwrap_or(max).min(max)
}

/// Set of keys, used both for the keys waiting in the queue and for the
/// keys being processed.
#[derive(Debug, Default)]
pub struct KeySet {
    keys: Mutex<HashSet<Request>>,
}

impl KeySet {
    pub fn claim(&self, request: &Request) -> bool {
        self.keys
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(request.clone())
    }

    pub fn release(&self, request: &Request) {
        self.keys.lock().unwrap_or_else(|e| e.into_inner()).remove(request);
    }
}

/// Persistence logic for one object kind.
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    type Object: Resource<DynamicType = (), Scope = NamespaceResourceScope>
        + Clone
        + Debug
        + DeserializeOwned
        + Send
        + Sync
        + 'static;

    /// Label used in logs and metrics.
    fn kind(&self) -> &str;

    /// Whether requests carry the object uid.
    fn composite_keys(&self) -> bool {
        true
    }

    /// One watch per config. Objects matching several are still queued once.
    fn watcher_configs(&self) -> Vec<watcher::Config> {
        vec![watcher::Config::default()]
    }

    /// Brings the store in line with `live`, which is `None` when the object
    /// no longer exists.
    async fn sync(&self, key: &ObjectKey, live: Option<Self::Object>) -> Result<()>;
}

#[derive(Debug, Clone)]
struct Queued {
    request: Request,
    attempt: u32,
}

/// Work queue that holds each key at most once.
#[derive(Clone)]
struct Queue {
    tx: UnboundedSender<Queued>,
    pending: Arc<KeySet>,
}

impl Queue {
    fn new() -> (Self, UnboundedReceiver<Queued>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let queue = Self {
            tx,
            pending: Arc::new(KeySet::default()),
        };
        (queue, rx)
    }

    /// Returns false when the key is already waiting or the queue is closed.
    fn push(&self, queued: Queued) -> bool {
        if !self.pending.claim(&queued.request) {
            debug!("{} is already queued", queued.request);
            return false;
        }
        let request = queued.request.clone();
        if let Err(e) = self.tx.send(queued) {
            self.pending.release(&request);
            error!("Dropping {}: {}", request, e);
            return false;
        }
        true
    }

    fn push_after(&self, queued: Queued, delay: Duration) {
        let queue = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.push(queued);
        });
    }

    /// Marks a key taken off the queue, so later events queue it again.
    fn taken(&self, request: &Request) {
        self.pending.release(request);
    }
}

pub struct Dispatcher<H: Handler> {
    client: Client,
    handler: Arc<H>,
    workers: usize,
    requeue_base: Duration,
    requeue_max: Duration,
    in_flight: KeySet,
}

impl<H: Handler> Dispatcher<H> {
    pub fn new(client: Client, handler: H, workers: usize, config: &ControllerConfig) -> Self {
        Self {
            client,
            handler: Arc::new(handler),
            workers: workers.max(1),
            requeue_base: config.requeue_base(),
            requeue_max: config.requeue_max(),
            in_flight: KeySet::default(),
        }
    }

    pub async fn run(self) -> Result<()> {
        let kind = self.handler.kind().to_string();
        info!("Starting {} dispatcher with {} workers", kind, self.workers);

        let api: Api<H::Object> = Api::all(self.client.clone());
        let (queue, rx) = Queue::new();

        let composite = self.handler.composite_keys();
        let watch_queue = queue.clone();
        let watches = self
            .handler
            .watcher_configs()
            .into_iter()
            .map(|config| watcher(api.clone(), config).default_backoff().touched_objects().boxed());
        let producer = futures::stream::select_all(watches).for_each(|event| {
            match event {
                Ok(obj) => {
                    let request = request_for(&obj, composite);
                    debug!("{} event for {}", kind, request);
                    watch_queue.push(Queued { request, attempt: 0 });
                }
                Err(e) => warn!("{} watch error: {}", kind, e),
            }
            futures::future::ready(())
        });

        let received = futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|q| (q, rx))
        });
        let consumer = received.for_each_concurrent(self.workers, |queued| {
            self.process(queued, queue.clone())
        });

        futures::future::join(producer.boxed(), consumer.boxed()).await;
        info!("{} dispatcher stopped", kind);
        Ok(())
    }

    async fn process(&self, queued: Queued, queue: Queue) {
        let kind = self.handler.kind();
        queue.taken(&queued.request);
        if !self.in_flight.claim(&queued.request) {
            debug!("{} {} is busy, requeueing", kind, queued.request);
            queue.push_after(queued, self.requeue_base);
            return;
        }

        let result = self.reconcile(&queued.request).await;
        self.in_flight.release(&queued.request);

        match result {
            Ok(()) => metrics::record_reconcile(kind, "success"),
            Err(e) if e.is_transient() => {
                let delay = backoff(self.requeue_base, self.requeue_max, queued.attempt);
                warn!(
                    "Reconciling {} {} failed (attempt {}), retrying in {:?}: {}",
                    kind,
                    queued.request,
                    queued.attempt + 1,
                    delay,
                    e
                );
                metrics::record_reconcile(kind, "requeue");
                queue.push_after(
                    Queued {
                        attempt: queued.attempt + 1,
                        ..queued
                    },
                    delay,
                );
            }
            Err(e) => {
                error!("Dropping {} {}: {}", kind, queued.request, e);
                metrics::record_reconcile(kind, "dropped");
            }
        }
    }

    async fn reconcile(&self, request: &Request) -> Result<()> {
        let key = decode_request(request, self.handler.composite_keys())?;
        let api: Api<H::Object> = Api::namespaced(self.client.clone(), &key.namespace);

        // An object with the same name but another uid is a different object.
        let live = api
            .get_opt(&key.name)
            .await?
            .filter(|obj| {
                key.uid.is_empty() || obj.meta().uid.as_deref() == Some(key.uid.as_str())
            });

        self.handler.sync(&key, live).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::Pod;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn pod() -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some("mnist-worker-0".to_string()),
                namespace: Some("team-a".to_string()),
                uid: Some("uid-7".to_string()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_composite_request() {
        let request = request_for(&pod(), true);
        assert_eq!(request.namespace, "team-a");
        assert_eq!(request.name, "uid-7.mnist-worker-0");

        let key = decode_request(&request, true).unwrap();
        assert_eq!(key.name, "mnist-worker-0");
        assert_eq!(key.uid, "uid-7");
    }

    #[test]
    fn test_plain_request() {
        let request = request_for(&pod(), false);
        assert_eq!(request.name, "mnist-worker-0");

        let key = decode_request(&request, false).unwrap();
        assert_eq!(key.name, "mnist-worker-0");
        assert!(key.uid.is_empty());
    }

    #[test]
    fn test_malformed_request_is_permanent() {
        let request = Request {
            namespace: "team-a".to_string(),
            name: "no-separator".to_string(),
        };
        let err = decode_request(&request, true).unwrap_err();
        assert!(!err.is_transient());
    }

    #[test]
    fn test_backoff() {
        let base = Duration::from_secs(5);
        let max = Duration::from_secs(300);
        assert_eq!(backoff(base, max, 0), Duration::from_secs(5));
        assert_eq!(backoff(base, max, 1), Duration::from_secs(10));
        assert_eq!(backoff(base, max, 3), Duration::from_secs(40));
        assert_eq!(backoff(base, max, 6), max);
        assert_eq!(backoff(base, max, 100), max);
    }

    #[test]
    fn test_queue_holds_key_once() {
        let (queue, mut rx) = Queue::new();
        let request = request_for(&pod(), true);
        let queued = Queued {
            request: request.clone(),
            attempt: 0,
        };

        assert!(queue.push(queued.clone()));
        assert!(!queue.push(queued.clone()));
        let first = rx.try_recv().unwrap();
        assert_eq!(first.request, request);
        assert!(rx.try_recv().is_err());

        queue.taken(&first.request);
        assert!(queue.push(queued));
        assert!(rx.try_recv().is_ok());
    }

    #[test]
    fn test_closed_queue_releases_key() {
        let (queue, rx) = Queue::new();
        drop(rx);
        let queued = Queued {
            request: request_for(&pod(), true),
            attempt: 0,
        };

        assert!(!queue.push(queued.clone()));
        assert!(queue.pending.claim(&queued.request));
    }

    #[test]
    fn test_in_flight() {
        let in_flight = KeySet::default();
        let request = request_for(&pod(), true);

        assert!(in_flight.claim(&request));
        assert!(!in_flight.claim(&request));
        in_flight.release(&request);
        assert!(in_flight.claim(&request));
    }
}
