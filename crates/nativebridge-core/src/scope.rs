//! Lifecycle scopes.
//!
//! A scope is one running script context (a page of an application). Components
//! that cache per-scope state key it by [`ScopeId`], which is a plain value and
//! never keeps the scope alive. Teardown is explicit: whoever owns the scope
//! calls [`ScopeRegistry::unregister`] and every cache drops its entries.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use uuid::Uuid;

/// Non-owning identity of a scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ScopeId(Uuid);

impl ScopeId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for ScopeId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ScopeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Manifest-derived facts about a scope.
#[derive(Debug)]
pub struct ScopeInfo {
    pub id: ScopeId,
    /// Owning application package.
    pub package: String,
    /// Features the application declares.
    pub features: BTreeSet<String>,
    /// Declared features that may run while the application is in the background.
    pub background_features: BTreeSet<String>,
    foreground: AtomicBool,
}

impl ScopeInfo {
    pub fn new(package: impl Into<String>) -> Self {
        Self {
            id: ScopeId::new(),
            package: package.into(),
            features: BTreeSet::new(),
            background_features: BTreeSet::new(),
            foreground: AtomicBool::new(true),
        }
    }

    pub fn with_features<I, S>(mut self, features: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.features.extend(features.into_iter().map(Into::into));
        self
    }

    pub fn with_background_features<I, S>(mut self, features: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.background_features
            .extend(features.into_iter().map(Into::into));
        self
    }

    pub fn declares(&self, feature: &str) -> bool {
        self.features.contains(feature)
    }

    pub fn is_foreground(&self) -> bool {
        self.foreground.load(Ordering::Acquire)
    }

    pub fn set_foreground(&self, foreground: bool) {
        self.foreground.store(foreground, Ordering::Release);
    }
}

/// Registry of live scopes.
pub struct ScopeRegistry {
    scopes: DashMap<ScopeId, Arc<ScopeInfo>>,
}

impl ScopeRegistry {
    pub fn new() -> Self {
        Self {
            scopes: DashMap::new(),
        }
    }

    /// Register a scope and return its id.
    pub fn register(&self, info: ScopeInfo) -> ScopeId {
        let id = info.id;
        tracing::debug!(scope = %id, package = %info.package, "Scope registered");
        self.scopes.insert(id, Arc::new(info));
        id
    }

    pub fn get(&self, id: &ScopeId) -> Option<Arc<ScopeInfo>> {
        self.scopes.get(id).map(|entry| Arc::clone(entry.value()))
    }

    pub fn unregister(&self, id: &ScopeId) -> Option<Arc<ScopeInfo>> {
        let removed = self.scopes.remove(id).map(|(_, info)| info);
        if removed.is_some() {
            tracing::debug!(scope = %id, "Scope unregistered");
        }
        removed
    }

    /// Flip the foreground flag. Returns false when the scope is unknown.
    pub fn set_foreground(&self, id: &ScopeId, foreground: bool) -> bool {
        match self.scopes.get(id) {
            Some(info) => {
                info.set_foreground(foreground);
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.scopes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scopes.is_empty()
    }
}

impl Default for ScopeRegistry {
    fn default() -> Self {
        Self::new()
    }
}
