//! Cross-boundary message relay.
//!
//! The script side of a scope and its native host attach independently; either
//! may be missing when the other sends. Each direction has its own
//! [`MessageCache`]: undeliverable messages are buffered per scope, replayed in
//! enqueue order when the counterpart attaches, and dropped once they are older
//! than the TTL.
//!
//! ```text
//!   script ── send_to_host(payload, reply) ──► host.on_message(code, payload)
//!   host   ── send_to_script(code, payload) ─► code == 0: __onregistercallback
//!                                              code  > 0: reply callback for `code`
//! ```

use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::time::Instant;

use crate::callback::{DynCallback, PersistentCallbackRegistry};
use crate::config::{defaults, names};
use crate::pool::WorkerPool;
use crate::response::Response;
use crate::scope::ScopeId;
use crate::value::Value;

// ============================================================================
// Counterparts
// ============================================================================

/// Native host side of a scope.
pub trait HostCounterpart: Send + Sync {
    fn on_message(&self, code: i32, payload: String);
}

/// Script side of a scope: runs persistent callbacks by action.
pub trait ScriptCounterpart: Send + Sync {
    fn run_callback(&self, action: &str, what: i32, payload: &str);
}

/// Script counterpart backed by a [`PersistentCallbackRegistry`].
pub struct RegistryCounterpart {
    registry: Arc<PersistentCallbackRegistry>,
    scope: ScopeId,
}

impl RegistryCounterpart {
    pub fn new(registry: Arc<PersistentCallbackRegistry>, scope: ScopeId) -> Self {
        Self { registry, scope }
    }
}

impl ScriptCounterpart for RegistryCounterpart {
    fn run_callback(&self, action: &str, what: i32, payload: &str) {
        if !self
            .registry
            .run(self.scope, action, what, &Value::from(payload))
        {
            tracing::debug!(scope = %self.scope, action, "No callback context for relayed message");
        }
    }
}

/// What happened to a relayed message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayOutcome {
    Delivered,
    Buffered,
    Dropped,
}

// ============================================================================
// Message cache
// ============================================================================

/// A message waiting for its counterpart.
pub struct CachedMessage {
    pub payload: String,
    /// Message code; set for host-to-script messages.
    pub code: Option<i32>,
    /// Reply callback; set for script-to-host messages.
    pub reply: Option<DynCallback>,
    enqueued_at: Instant,
}

impl CachedMessage {
    pub fn enqueued_at(&self) -> Instant {
        self.enqueued_at
    }
}

/// Per-scope FIFO queues with TTL eviction.
///
/// The eviction task sleeps until just after the earliest buffered message
/// expires, evicts, and repeats. It exits when every queue is empty and is
/// started again by the next enqueue.
pub struct MessageCache {
    direction: &'static str,
    ttl: Duration,
    queues: DashMap<ScopeId, VecDeque<CachedMessage>>,
    timer_armed: Mutex<bool>,
    handle: Handle,
}

impl MessageCache {
    pub fn new(direction: &'static str, ttl: Duration, handle: Handle) -> Arc<Self> {
        Arc::new(Self {
            direction,
            ttl,
            queues: DashMap::new(),
            timer_armed: Mutex::new(false),
            handle,
        })
    }

    pub fn add(self: &Arc<Self>, scope: ScopeId, payload: String, code: Option<i32>, reply: Option<DynCallback>) {
        self.queues.entry(scope).or_default().push_back(CachedMessage {
            payload,
            code,
            reply,
            enqueued_at: Instant::now(),
        });
        tracing::debug!(direction = self.direction, scope = %scope, "Message buffered");
        self.arm_timer();
    }

    /// Remove and return the live messages of `scope` in enqueue order.
    pub fn take(&self, scope: &ScopeId) -> Vec<CachedMessage> {
        let now = Instant::now();
        let ttl = self.ttl;
        self.queues
            .remove(scope)
            .map(|(_, queue)| {
                queue
                    .into_iter()
                    .filter(|m| now.duration_since(m.enqueued_at) < ttl)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Discard the messages of `scope`.
    pub fn discard(&self, scope: &ScopeId) {
        self.queues.remove(scope);
    }

    pub fn clear(&self) {
        self.queues.clear();
    }

    pub fn len(&self, scope: &ScopeId) -> usize {
        self.queues.get(scope).map(|q| q.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.queues.iter().all(|q| q.is_empty())
    }

    pub fn is_timer_armed(&self) -> bool {
        *self.timer_armed.lock()
    }

    /// Drop every message enqueued at or before `now - ttl`.
    fn evict_expired(&self, now: Instant) {
        let ttl = self.ttl;
        let mut evicted = 0usize;
        self.queues.retain(|_, queue| {
            while let Some(front) = queue.front() {
                if now.duration_since(front.enqueued_at) >= ttl {
                    queue.pop_front();
                    evicted += 1;
                } else {
                    break;
                }
            }
            !queue.is_empty()
        });
        if evicted > 0 {
            tracing::debug!(direction = self.direction, evicted, "Expired relay messages evicted");
        }
    }

    fn earliest_expiry(&self) -> Option<Instant> {
        self.queues
            .iter()
            .filter_map(|q| q.front().map(|m| m.enqueued_at + self.ttl))
            .min()
    }

    fn arm_timer(self: &Arc<Self>) {
        let mut armed = self.timer_armed.lock();
        if *armed {
            return;
        }
        *armed = true;
        drop(armed);

        let cache = Arc::clone(self);
        self.handle.spawn(async move {
            let slack = Duration::from_millis(defaults::EVICTION_SLACK_MS);
            loop {
                match cache.earliest_expiry() {
                    Some(deadline) => {
                        tokio::time::sleep_until(deadline + slack).await;
                        cache.evict_expired(Instant::now());
                    }
                    None => {
                        let stopped = {
                            let mut armed = cache.timer_armed.lock();
                            if cache.is_empty() {
                                *armed = false;
                            }
                            !*armed
                        };
                        if stopped {
                            tracing::trace!(direction = cache.direction, "Eviction timer stopped");
                            return;
                        }
                    }
                }
            }
        });
    }
}

// ============================================================================
// Relay
// ============================================================================

struct Endpoint {
    host: Option<Arc<dyn HostCounterpart>>,
    next_code: i32,
    pending: HashMap<i32, DynCallback>,
    script: Option<Arc<dyn ScriptCounterpart>>,
}

impl Endpoint {
    fn new() -> Self {
        Self {
            host: None,
            next_code: 1,
            pending: HashMap::new(),
            script: None,
        }
    }
}

/// Host-to-script and script-to-host message relay.
///
/// Every decision about a scope (deliver or buffer, attach and replay) is made
/// while holding that scope's endpoint entry, so a message is never buffered
/// after its counterpart has already drained the backlog.
pub struct MessageRelay {
    endpoints: DashMap<ScopeId, Endpoint>,
    to_host: Arc<MessageCache>,
    to_script: Arc<MessageCache>,
    pool: WorkerPool,
}

impl MessageRelay {
    pub fn new(ttl: Duration, pool: WorkerPool, handle: Handle) -> Self {
        Self {
            endpoints: DashMap::new(),
            to_host: MessageCache::new("to_host", ttl, handle.clone()),
            to_script: MessageCache::new("to_script", ttl, handle),
            pool,
        }
    }

    /// Attach the host side of `scope` and replay its buffered messages.
    ///
    /// Reply codes restart at 1; replies pending from a previous host are lost.
    pub fn attach_host(&self, scope: ScopeId, host: Arc<dyn HostCounterpart>) {
        let batch = {
            let mut endpoint = self.endpoints.entry(scope).or_insert_with(Endpoint::new);
            endpoint.host = Some(Arc::clone(&host));
            endpoint.next_code = 1;
            endpoint.pending.clear();

            let replay = self.to_host.take(&scope);
            let mut batch = Vec::with_capacity(replay.len());
            for message in replay {
                let code = endpoint.next_code;
                endpoint.next_code += 1;
                if let Some(reply) = message.reply {
                    endpoint.pending.insert(code, reply);
                }
                batch.push((code, message.payload));
            }
            batch
        };
        tracing::debug!(scope = %scope, replayed = batch.len(), "Host attached");
        if !batch.is_empty() {
            self.pool.spawn(async move {
                for (code, payload) in batch {
                    host.on_message(code, payload);
                }
            });
        }
    }

    /// Detach the host side and discard what was buffered for it.
    pub fn detach_host(&self, scope: ScopeId) {
        let mut endpoint = self.endpoints.get_mut(&scope);
        if let Some(endpoint) = endpoint.as_mut() {
            endpoint.host = None;
        }
        self.to_host.discard(&scope);
    }

    /// Attach the script side of `scope` and replay its buffered messages.
    pub fn attach_script(&self, scope: ScopeId, script: Arc<dyn ScriptCounterpart>) {
        let replay = {
            let mut endpoint = self.endpoints.entry(scope).or_insert_with(Endpoint::new);
            endpoint.script = Some(Arc::clone(&script));
            self.to_script.take(&scope)
        };

        tracing::debug!(scope = %scope, replayed = replay.len(), "Script attached");
        let mut registrations = Vec::new();
        for message in replay {
            match message.code.unwrap_or(names::REGISTRATION_CODE) {
                names::REGISTRATION_CODE => registrations.push(message.payload),
                code => {
                    self.send_to_script(scope, code, message.payload);
                }
            }
        }
        if !registrations.is_empty() {
            self.pool.spawn(async move {
                for payload in registrations {
                    script.run_callback(
                        names::ACTION_REGISTER_CALLBACK,
                        names::REGISTRATION_CODE,
                        &payload,
                    );
                }
            });
        }
    }

    /// Detach the script side and discard what was buffered for it.
    pub fn detach_script(&self, scope: ScopeId) {
        let mut endpoint = self.endpoints.get_mut(&scope);
        if let Some(endpoint) = endpoint.as_mut() {
            endpoint.script = None;
        }
        self.to_script.discard(&scope);
    }

    /// Forget everything about `scope`.
    pub fn remove_scope(&self, scope: ScopeId) {
        self.endpoints.remove(&scope);
        self.to_host.discard(&scope);
        self.to_script.discard(&scope);
    }

    pub fn clear_all(&self) {
        self.endpoints.clear();
        self.to_host.clear();
        self.to_script.clear();
    }

    /// Script to host. The host's answer comes back through `reply`.
    pub fn send_to_host(&self, scope: ScopeId, payload: String, reply: Option<DynCallback>) -> RelayOutcome {
        let mut endpoint = self.endpoints.entry(scope).or_insert_with(Endpoint::new);
        let Some(host) = endpoint.host.clone() else {
            self.to_host.add(scope, payload, None, reply);
            return RelayOutcome::Buffered;
        };
        let code = endpoint.next_code;
        endpoint.next_code += 1;
        if let Some(reply) = reply {
            endpoint.pending.insert(code, reply);
        }
        drop(endpoint);

        self.pool.spawn(async move {
            host.on_message(code, payload);
        });
        RelayOutcome::Delivered
    }

    /// Host to script. Code 0 is the registration message; other codes answer
    /// an earlier [`MessageRelay::send_to_host`].
    pub fn send_to_script(&self, scope: ScopeId, code: i32, payload: String) -> RelayOutcome {
        if code == names::REGISTRATION_CODE {
            let endpoint = self.endpoints.entry(scope).or_insert_with(Endpoint::new);
            let Some(script) = endpoint.script.clone() else {
                self.to_script.add(scope, payload, Some(code), None);
                return RelayOutcome::Buffered;
            };
            drop(endpoint);

            self.pool.spawn(async move {
                script.run_callback(names::ACTION_REGISTER_CALLBACK, code, &payload);
            });
            return RelayOutcome::Delivered;
        }

        let reply = self
            .endpoints
            .get_mut(&scope)
            .and_then(|mut endpoint| endpoint.pending.remove(&code));
        match reply {
            Some(reply) => {
                reply.deliver(Response::ok(payload));
                RelayOutcome::Delivered
            }
            None => {
                tracing::warn!(scope = %scope, code, "No callback waiting for relayed reply");
                RelayOutcome::Dropped
            }
        }
    }

    /// Messages buffered for the host of `scope`.
    pub fn host_backlog(&self, scope: &ScopeId) -> usize {
        self.to_host.len(scope)
    }

    /// Messages buffered for the script side of `scope`.
    pub fn script_backlog(&self, scope: &ScopeId) -> usize {
        self.to_script.len(scope)
    }

    pub fn is_eviction_armed(&self) -> bool {
        self.to_host.is_timer_armed() || self.to_script.is_timer_armed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_cache_evicts_after_ttl_and_disarms() {
        let cache = MessageCache::new("test", Duration::from_millis(100), Handle::current());
        let scope = ScopeId::new();
        cache.add(scope, "a".to_string(), None, None);
        assert!(cache.is_timer_armed());

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(cache.len(&scope), 1);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(cache.len(&scope), 0);

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!cache.is_timer_armed());

        cache.add(scope, "b".to_string(), None, None);
        assert!(cache.is_timer_armed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_take_skips_expired() {
        let cache = MessageCache::new("test", Duration::from_millis(100), Handle::current());
        let scope = ScopeId::new();
        cache.add(scope, "old".to_string(), None, None);
        tokio::time::advance(Duration::from_millis(60)).await;
        cache.add(scope, "new".to_string(), None, None);
        tokio::time::advance(Duration::from_millis(50)).await;

        let live: Vec<String> = cache.take(&scope).into_iter().map(|m| m.payload).collect();
        assert_eq!(live, vec!["new".to_string()]);
    }
}
