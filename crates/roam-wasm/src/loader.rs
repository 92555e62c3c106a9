//! Module resolution: cache, local directories, remote fetch.
//!
//! The remote path implements the bounded request/reply sub-protocol: a
//! GET_CLASS envelope goes out under a freshly generated correlation name,
//! and the caller blocks on a one-shot channel until the CLASS reply lands,
//! a delivery error is reported, or the deadline passes. The wait must
//! never run on a shared router path; it belongs on the dedicated worker
//! handling the arriving agent.

use crate::cache::CodeCache;
use crate::error::WasmError;
use crate::module::BehaviorModule;
use roam_net::{Delivery, DeliveryErrorCode};
use roam_proto::{kind, Address, Envelope};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};
use uuid::Uuid;
use wasmtime::Engine;

type ReplySender = oneshot::Sender<Result<Envelope, DeliveryErrorCode>>;

/// One-shot reply handlers keyed by correlation name.
///
/// This is the base's ad-hoc handler table: `route` delivers any envelope
/// whose recipient name matches a registered correlation, and the base's
/// delivery-error callback fails the matching wait by envelope id.
#[derive(Clone, Default)]
pub struct ReplyRegistry {
    inner: Arc<Mutex<RegistryInner>>,
}

#[derive(Default)]
struct RegistryInner {
    by_name: HashMap<String, ReplySender>,
    by_id: HashMap<u64, String>,
}

impl ReplyRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a one-shot wait under `name`, correlated with envelope `id`
    pub fn register(
        &self,
        name: String,
        id: u64,
    ) -> oneshot::Receiver<Result<Envelope, DeliveryErrorCode>> {
        let (tx, rx) = oneshot::channel();
        let mut inner = self.inner.lock().expect("reply registry lock poisoned");
        inner.by_id.insert(id, name.clone());
        inner.by_name.insert(name, tx);
        rx
    }

    /// Remove the wait registered under `name`, if it still exists
    pub fn unregister(&self, name: &str) {
        let mut inner = self.inner.lock().expect("reply registry lock poisoned");
        inner.by_name.remove(name);
        inner.by_id.retain(|_, n| n != name);
    }

    /// Complete the wait registered under `name` with an arrived envelope
    pub fn complete(&self, name: &str, envelope: Envelope) -> bool {
        let sender = {
            let mut inner = self.inner.lock().expect("reply registry lock poisoned");
            let sender = inner.by_name.remove(name);
            inner.by_id.retain(|_, n| n != name);
            sender
        };
        match sender {
            Some(tx) => tx.send(Ok(envelope)).is_ok(),
            None => false,
        }
    }

    /// Fail the wait whose request envelope carried `id`
    pub fn fail(&self, id: u64, code: DeliveryErrorCode) -> bool {
        let sender = {
            let mut inner = self.inner.lock().expect("reply registry lock poisoned");
            match inner.by_id.remove(&id) {
                Some(name) => inner.by_name.remove(&name),
                None => None,
            }
        };
        match sender {
            Some(tx) => tx.send(Err(code)).is_ok(),
            None => false,
        }
    }

    /// Whether a wait is registered under `name`
    pub fn is_registered(&self, name: &str) -> bool {
        self.inner
            .lock()
            .expect("reply registry lock poisoned")
            .by_name
            .contains_key(name)
    }
}

/// Resolves module names to loaded behavior modules: cache, then local
/// directories, then a synchronous remote fetch bounded by a timeout.
pub struct RemoteLoader {
    cache: CodeCache,
    delivery: Arc<Delivery>,
    replies: ReplyRegistry,
    timeout: Duration,
    ids: Arc<AtomicU64>,
}

impl RemoteLoader {
    /// Create a loader.
    ///
    /// `ids` is the envelope-id source shared with the owning base, so
    /// correlation ids never collide with other outbound traffic.
    pub fn new(
        cache: CodeCache,
        delivery: Arc<Delivery>,
        replies: ReplyRegistry,
        timeout: Duration,
        ids: Arc<AtomicU64>,
    ) -> Self {
        Self {
            cache,
            delivery,
            replies,
            timeout,
            ids,
        }
    }

    /// The cache this loader fills
    pub fn cache(&self) -> &CodeCache {
        &self.cache
    }

    /// The reply registry the owning base routes correlated envelopes into
    pub fn replies(&self) -> &ReplyRegistry {
        &self.replies
    }

    /// Resolve `name`, acquiring one cache reference.
    ///
    /// `local` is the address replies should come back to; `source` is the
    /// peer believed to hold the module code, absent for locally created
    /// agents. The remote path blocks the calling task up to the configured
    /// timeout.
    pub async fn resolve(
        &self,
        name: &str,
        local: &Address,
        source: Option<&Address>,
        engine: &Engine,
    ) -> Result<BehaviorModule, WasmError> {
        if let Some(module) = self.cache.resolve(name, engine)? {
            return Ok(module);
        }

        let source = match source {
            Some(source) => source,
            None => return Err(WasmError::ClassNotFound(name.to_string())),
        };

        let bytes = self.fetch(name, local, source).await?;
        info!(module = name, from = %source, "module fetched from peer");
        self.cache.define(name, bytes, engine)
    }

    /// Fetch module bytes from `source` with a bounded wait
    async fn fetch(
        &self,
        name: &str,
        local: &Address,
        source: &Address,
    ) -> Result<Vec<u8>, WasmError> {
        let correlation = format!("fetch-{}", Uuid::new_v4());
        let id = self.ids.fetch_add(1, Ordering::Relaxed);
        let rx = self.replies.register(correlation.clone(), id);

        let request =
            Envelope::get_class(local.named(&correlation), source.base_only(), name).with_id(id);
        debug!(module = name, correlation = %correlation, "requesting module from peer");
        self.delivery.post(request);

        let outcome = tokio::time::timeout(self.timeout, rx).await;

        // the one-shot handler never outlives the wait
        self.replies.unregister(&correlation);

        match outcome {
            Err(_) => Err(WasmError::FetchTimeout {
                class: name.to_string(),
                timeout: self.timeout,
            }),
            Ok(Err(_)) => Err(WasmError::FetchFailed {
                class: name.to_string(),
                reason: "reply channel closed".to_string(),
            }),
            Ok(Ok(Err(code))) => Err(WasmError::FetchFailed {
                class: name.to_string(),
                reason: format!("delivery failed: {:?}", code),
            }),
            Ok(Ok(Ok(envelope))) => {
                if envelope.is_kind(kind::CLASS) && !envelope.payload.is_empty() {
                    Ok(envelope.payload.to_vec())
                } else {
                    warn!(module = name, kind = %envelope.kind, "peer reply carries no module code");
                    Err(WasmError::ClassNotFound(name.to_string()))
                }
            }
        }
    }
}
