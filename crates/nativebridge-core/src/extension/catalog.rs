//! Extension catalogs.
//!
//! A catalog maps extension names to a validated method table and a factory.
//! Instances are built lazily on first use and cached per requested name; a
//! per-name `OnceCell` guarantees one construction even when many callers race
//! on the first lookup. Names that miss are retried through the alias rules.

use dashmap::DashMap;
use once_cell::sync::OnceCell;
use std::sync::Arc;

use super::metadata::ExtensionMetadata;
use super::proxy::ProxyResolver;
use super::system::DynExtension;
use crate::error::{BridgeError, ExtensionResult, Result};
use crate::scope::ScopeId;

/// Independent lookup spaces, in dispatch priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Namespace {
    /// Platform features (`system.fetch`, ...). Subject to availability checks.
    Feature,
    /// Script-module extensions.
    Module,
    /// UI widget extensions.
    Widget,
}

impl Namespace {
    pub const ALL: [Namespace; 3] = [Self::Feature, Self::Module, Self::Widget];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Feature => "feature",
            Self::Module => "module",
            Self::Widget => "widget",
        }
    }
}

impl std::fmt::Display for Namespace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Builds an implementation instance.
pub type ExtensionFactory = Arc<dyn Fn() -> ExtensionResult<DynExtension> + Send + Sync>;

struct Registration {
    metadata: Arc<ExtensionMetadata>,
    factory: ExtensionFactory,
    built_in: bool,
}

/// A constructed extension together with the table it was built for.
pub struct LoadedExtension {
    namespace: Namespace,
    registered_name: String,
    metadata: Arc<ExtensionMetadata>,
    instance: DynExtension,
}

impl LoadedExtension {
    pub fn namespace(&self) -> Namespace {
        self.namespace
    }

    /// Name the implementation was registered under. Differs from
    /// `metadata().name()` when the lookup went through an alias.
    pub fn registered_name(&self) -> &str {
        &self.registered_name
    }

    pub fn metadata(&self) -> &ExtensionMetadata {
        &self.metadata
    }

    pub fn instance(&self) -> &DynExtension {
        &self.instance
    }
}

impl std::fmt::Debug for LoadedExtension {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadedExtension")
            .field("namespace", &self.namespace)
            .field("registered_name", &self.registered_name)
            .field("name", &self.metadata.name())
            .finish()
    }
}

pub struct ExtensionCatalog {
    namespace: Namespace,
    registrations: DashMap<String, Arc<Registration>>,
    instances: DashMap<String, Arc<OnceCell<Arc<LoadedExtension>>>>,
}

impl ExtensionCatalog {
    pub fn new(namespace: Namespace) -> Self {
        Self {
            namespace,
            registrations: DashMap::new(),
            instances: DashMap::new(),
        }
    }

    pub fn namespace(&self) -> Namespace {
        self.namespace
    }

    /// Register a validated table and its factory.
    pub fn register(
        &self,
        metadata: ExtensionMetadata,
        factory: ExtensionFactory,
        built_in: bool,
    ) -> Result<()> {
        metadata.validate()?;
        let name = metadata.name().to_string();
        match self.registrations.entry(name.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                Err(BridgeError::AlreadyRegistered(name))
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                tracing::debug!(namespace = %self.namespace, extension = %name, built_in, "Extension registered");
                slot.insert(Arc::new(Registration {
                    metadata: Arc::new(metadata),
                    factory,
                    built_in,
                }));
                Ok(())
            }
        }
    }

    /// Registered name that `name` resolves to, directly or through an alias.
    pub fn resolve_name(&self, name: &str, resolver: &ProxyResolver) -> Option<String> {
        if self.registrations.contains_key(name) {
            return Some(name.to_string());
        }
        resolver
            .resolve_alias(name)
            .filter(|target| self.registrations.contains_key(target))
    }

    pub fn contains(&self, name: &str, resolver: &ProxyResolver) -> bool {
        self.resolve_name(name, resolver).is_some()
    }

    pub fn is_built_in(&self, name: &str, resolver: &ProxyResolver) -> bool {
        self.resolve_name(name, resolver)
            .and_then(|target| self.registrations.get(&target).map(|r| r.built_in))
            .unwrap_or(false)
    }

    /// Table registered under `name` (no alias resolution).
    pub fn metadata(&self, name: &str) -> Option<Arc<ExtensionMetadata>> {
        self.registrations
            .get(name)
            .map(|r| Arc::clone(&r.metadata))
    }

    /// Look up and, on first use, construct the extension for `name`.
    ///
    /// `Ok(None)` when neither the name nor an alias of it is registered.
    pub fn get(
        &self,
        name: &str,
        resolver: &ProxyResolver,
    ) -> Result<Option<Arc<LoadedExtension>>> {
        if let Some(cell) = self.instances.get(name) {
            if let Some(loaded) = cell.value().get() {
                return Ok(Some(Arc::clone(loaded)));
            }
        }

        let Some(target) = self.resolve_name(name, resolver) else {
            return Ok(None);
        };
        let Some(registration) = self.registrations.get(&target).map(|r| Arc::clone(r.value()))
        else {
            return Ok(None);
        };

        let cell = Arc::clone(
            self.instances
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(OnceCell::new()))
                .value(),
        );

        let loaded = cell.get_or_try_init(|| {
            let instance = (registration.factory)().map_err(|err| {
                tracing::error!(namespace = %self.namespace, extension = %name, error = %err, "Extension construction failed");
                BridgeError::ConstructionFailed {
                    name: name.to_string(),
                    reason: err.to_string(),
                }
            })?;
            let metadata = if target == name {
                Arc::clone(&registration.metadata)
            } else {
                tracing::debug!(extension = %name, target = %target, "Extension resolved through alias");
                Arc::new(registration.metadata.alias(name))
            };
            tracing::debug!(namespace = %self.namespace, extension = %name, "Extension instantiated");
            Ok::<_, BridgeError>(Arc::new(LoadedExtension {
                namespace: self.namespace,
                registered_name: target.clone(),
                metadata,
                instance,
            }))
        })?;
        Ok(Some(Arc::clone(loaded)))
    }

    /// Instances constructed so far.
    pub fn loaded(&self) -> Vec<Arc<LoadedExtension>> {
        self.instances
            .iter()
            .filter_map(|cell| cell.value().get().cloned())
            .collect()
    }

    /// Forward scope disposal to every constructed instance.
    pub fn dispose(&self, scope: ScopeId, force: bool) {
        for loaded in self.loaded() {
            loaded.instance().dispose(scope, force);
        }
    }

    /// Registration tables of every extension, sorted by name.
    pub fn to_json(&self) -> serde_json::Value {
        let mut tables: Vec<Arc<ExtensionMetadata>> = self
            .registrations
            .iter()
            .map(|r| Arc::clone(&r.metadata))
            .collect();
        tables.sort_by(|a, b| a.name().cmp(b.name()));
        serde_json::Value::Array(tables.iter().map(|m| m.to_json()).collect())
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.registrations.iter().map(|r| r.key().clone()).collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.registrations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registrations.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ExtensionError, ExtensionResult};
    use crate::extension::metadata::{Method, Mode};
    use crate::extension::proxy::AliasRule;
    use crate::extension::system::{Extension, Request};
    use crate::response::Response;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Noop;

    #[async_trait]
    impl Extension for Noop {
        async fn invoke(&self, _request: Request) -> ExtensionResult<Response> {
            Ok(Response::success())
        }
    }

    fn table(name: &str) -> ExtensionMetadata {
        ExtensionMetadata::new(name, "test").with_method(Method::new("run", Mode::Sync).unwrap())
    }

    fn counting_factory(counter: Arc<AtomicUsize>) -> ExtensionFactory {
        Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(Noop) as DynExtension)
        })
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let catalog = ExtensionCatalog::new(Namespace::Feature);
        let counter = Arc::new(AtomicUsize::new(0));
        catalog
            .register(table("a"), counting_factory(counter.clone()), false)
            .unwrap();
        let err = catalog
            .register(table("a"), counting_factory(counter), false)
            .unwrap_err();
        assert!(matches!(err, BridgeError::AlreadyRegistered(_)));
    }

    #[test]
    fn test_lazy_construction_is_cached() {
        let catalog = ExtensionCatalog::new(Namespace::Feature);
        let resolver = ProxyResolver::new();
        let counter = Arc::new(AtomicUsize::new(0));
        catalog
            .register(table("a"), counting_factory(counter.clone()), false)
            .unwrap();

        assert_eq!(counter.load(Ordering::SeqCst), 0);
        let first = catalog.get("a", &resolver).unwrap().unwrap();
        let second = catalog.get("a", &resolver).unwrap().unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert!(catalog.get("missing", &resolver).unwrap().is_none());
    }

    #[test]
    fn test_alias_lookup_uses_aliased_table() {
        let catalog = ExtensionCatalog::new(Namespace::Module);
        let resolver = ProxyResolver::new();
        resolver.add_alias_rule(AliasRule::exact("legacy.a", "a"));
        catalog
            .register(table("a"), counting_factory(Arc::new(AtomicUsize::new(0))), false)
            .unwrap();

        let loaded = catalog.get("legacy.a", &resolver).unwrap().unwrap();
        assert_eq!(loaded.metadata().name(), "legacy.a");
        assert_eq!(loaded.registered_name(), "a");
        assert!(loaded.metadata().has_method("run"));
    }

    #[test]
    fn test_construction_failure_is_an_error_and_retried() {
        let catalog = ExtensionCatalog::new(Namespace::Feature);
        let resolver = ProxyResolver::new();
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = attempts.clone();
        catalog
            .register(
                table("broken"),
                Arc::new(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(ExtensionError::ServiceUnavailable("no device".to_string()))
                }),
                false,
            )
            .unwrap();

        assert!(matches!(
            catalog.get("broken", &resolver),
            Err(BridgeError::ConstructionFailed { .. })
        ));
        assert!(catalog.get("broken", &resolver).is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        assert!(catalog.loaded().is_empty());
    }

    #[test]
    fn test_to_json_sorted() {
        let catalog = ExtensionCatalog::new(Namespace::Widget);
        let counter = Arc::new(AtomicUsize::new(0));
        catalog
            .register(table("b"), counting_factory(counter.clone()), false)
            .unwrap();
        catalog
            .register(table("a"), counting_factory(counter), true)
            .unwrap();

        let json = catalog.to_json();
        assert_eq!(json[0]["name"], "a");
        assert_eq!(json[1]["name"], "b");
        assert!(catalog.is_built_in("a", &ProxyResolver::new()));
        assert!(!catalog.is_built_in("b", &ProxyResolver::new()));
    }
}
