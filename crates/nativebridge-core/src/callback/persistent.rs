//! Long-lived callbacks bound to an action and a scope.
//!
//! Extensions that push events (sensors, players, host messages) keep one
//! [`CallbackContext`] per `(scope, action)`. Registering a new context for the
//! same key replaces the old one. Page changes drop everything that is not
//! reserved; destroying the scope drops everything.

use dashmap::DashMap;
use std::sync::Arc;

use crate::scope::ScopeId;
use crate::value::Value;

/// Hooks of a persistent callback.
pub trait CallbackHandler: Send + Sync {
    /// Called once the context is installed.
    fn on_create(&self) {}

    /// Called once the context is removed, replaced, or disposed.
    fn on_destroy(&self) {}

    fn callback(&self, what: i32, payload: &Value);
}

#[derive(Clone)]
pub struct CallbackContext {
    action: String,
    scope: ScopeId,
    reserved: bool,
    handler: Arc<dyn CallbackHandler>,
}

impl CallbackContext {
    pub fn new(
        action: impl Into<String>,
        scope: ScopeId,
        reserved: bool,
        handler: Arc<dyn CallbackHandler>,
    ) -> Self {
        Self {
            action: action.into(),
            scope,
            reserved,
            handler,
        }
    }

    pub fn action(&self) -> &str {
        &self.action
    }

    pub fn scope(&self) -> ScopeId {
        self.scope
    }

    /// Reserved contexts survive non-forced disposal.
    pub fn is_reserved(&self) -> bool {
        self.reserved
    }
}

impl std::fmt::Debug for CallbackContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallbackContext")
            .field("action", &self.action)
            .field("scope", &self.scope)
            .field("reserved", &self.reserved)
            .finish()
    }
}

/// Per-owner registry of callback contexts.
///
/// Hooks always run after the map lock is released, so a handler may call
/// back into the registry.
pub struct PersistentCallbackRegistry {
    owner: String,
    contexts: DashMap<(ScopeId, String), CallbackContext>,
}

impl PersistentCallbackRegistry {
    pub fn new(owner: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            contexts: DashMap::new(),
        }
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Install `context`, destroying any context already bound to its key.
    pub fn put(&self, context: CallbackContext) {
        let key = (context.scope, context.action.clone());
        let handler = Arc::clone(&context.handler);
        let previous = self.contexts.insert(key, context);
        if let Some(previous) = previous {
            tracing::debug!(owner = %self.owner, action = %previous.action, "Replacing callback context");
            previous.handler.on_destroy();
        }
        handler.on_create();
    }

    /// Remove and destroy the context for `action`. Returns whether one existed.
    pub fn remove(&self, scope: ScopeId, action: &str) -> bool {
        let removed = self.contexts.remove(&(scope, action.to_string()));
        match removed {
            Some((_, context)) => {
                context.handler.on_destroy();
                true
            }
            None => false,
        }
    }

    /// Invoke the context for `action`. Silent no-op when none is registered.
    pub fn run(&self, scope: ScopeId, action: &str, what: i32, payload: &Value) -> bool {
        let handler = self
            .contexts
            .get(&(scope, action.to_string()))
            .map(|entry| Arc::clone(&entry.handler));
        match handler {
            Some(handler) => {
                handler.callback(what, payload);
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, scope: ScopeId, action: &str) -> bool {
        self.contexts.contains_key(&(scope, action.to_string()))
    }

    /// Drop the contexts of `scope`. Without `force`, reserved contexts stay.
    pub fn dispose_all(&self, scope: ScopeId, force: bool) {
        let doomed: Vec<(ScopeId, String)> = self
            .contexts
            .iter()
            .filter(|entry| entry.scope == scope && (force || !entry.reserved))
            .map(|entry| entry.key().clone())
            .collect();

        for key in doomed {
            if let Some((_, context)) = self.contexts.remove(&key) {
                context.handler.on_destroy();
            }
        }
        tracing::debug!(owner = %self.owner, scope = %scope, force, remaining = self.len(), "Callback contexts disposed");
    }

    pub fn len(&self) -> usize {
        self.contexts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contexts.is_empty()
    }
}
