//! The bridge context.
//!
//! Everything a dispatcher needs lives in one explicitly constructed
//! [`BridgeContext`]: the three catalogs, the proxy resolver, the permission
//! manager, the shared pools, the script delivery queue, the relay, and the
//! scope registry. Hosts build it once and hand `Arc` clones around.

use std::sync::Arc;
use tokio::runtime::Handle;

use crate::callback::{DeliveryQueue, ScriptEngine, TracingScriptEngine};
use crate::config::BridgeConfig;
use crate::dispatcher::InvocationDispatcher;
use crate::error::Result;
use crate::extension::{
    AliasRule, ExtensionCatalog, ExtensionFactory, ExtensionMetadata, Namespace, ProxyConfig,
    ProxyResolver,
};
use crate::permission::{AllowAllPermissions, PermissionManager};
use crate::pool::WorkerPool;
use crate::relay::MessageRelay;
use crate::scope::{ScopeId, ScopeInfo, ScopeRegistry};

pub struct BridgeContext {
    config: BridgeConfig,
    features: ExtensionCatalog,
    modules: ExtensionCatalog,
    widgets: ExtensionCatalog,
    proxies: ProxyResolver,
    permissions: Arc<dyn PermissionManager>,
    io_pool: WorkerPool,
    delivery: DeliveryQueue,
    relay: MessageRelay,
    scopes: ScopeRegistry,
}

impl BridgeContext {
    pub fn builder() -> BridgeContextBuilder {
        BridgeContextBuilder::new()
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn catalog(&self, namespace: Namespace) -> &ExtensionCatalog {
        match namespace {
            Namespace::Feature => &self.features,
            Namespace::Module => &self.modules,
            Namespace::Widget => &self.widgets,
        }
    }

    pub fn proxies(&self) -> &ProxyResolver {
        &self.proxies
    }

    pub fn permissions(&self) -> &Arc<dyn PermissionManager> {
        &self.permissions
    }

    pub fn io_pool(&self) -> &WorkerPool {
        &self.io_pool
    }

    pub fn delivery(&self) -> &DeliveryQueue {
        &self.delivery
    }

    pub fn relay(&self) -> &MessageRelay {
        &self.relay
    }

    pub fn scopes(&self) -> &ScopeRegistry {
        &self.scopes
    }

    pub fn create_scope(&self, info: ScopeInfo) -> ScopeId {
        self.scopes.register(info)
    }

    /// Dispatcher bound to `scope`.
    pub fn dispatcher(self: &Arc<Self>, scope: ScopeId) -> InvocationDispatcher {
        InvocationDispatcher::new(Arc::clone(self), scope)
    }

    /// The running page of `scope` changed: drop non-reserved extension state.
    pub fn page_change(&self, scope: ScopeId) {
        tracing::debug!(scope = %scope, "Page change");
        for namespace in Namespace::ALL {
            self.catalog(namespace).dispose(scope, false);
        }
    }

    /// End `scope`: dispose all extension state, forget relay traffic, and
    /// unregister it.
    pub fn destroy_scope(&self, scope: ScopeId) {
        for namespace in Namespace::ALL {
            self.catalog(namespace).dispose(scope, true);
        }
        self.relay.remove_scope(scope);
        self.scopes.unregister(&scope);
        tracing::info!(scope = %scope, "Scope destroyed");
    }

    /// Whether `feature` may be used by `scope` at all.
    ///
    /// Globally configured and built-in features are always available; other
    /// features must be declared by the scope.
    pub fn is_feature_available(&self, feature: &str, scope: ScopeId) -> bool {
        if self.config.configured_features.contains(feature) {
            return true;
        }
        if self.features.is_built_in(feature, &self.proxies) {
            return true;
        }
        self.scopes
            .get(&scope)
            .map(|info| info.declares(feature))
            .unwrap_or(false)
    }

    /// Whether `feature.action` may run given the scope's foreground state.
    pub fn is_allowed_to_invoke(&self, feature: &str, action: &str, scope: ScopeId) -> bool {
        let Some(info) = self.scopes.get(&scope) else {
            return true;
        };
        if info.is_foreground() {
            return true;
        }
        self.config.background_features.contains(feature)
            || info.background_features.contains(feature)
            || self
                .config
                .background_methods
                .contains(&BridgeConfig::background_method_key(feature, action))
    }

    /// Registration tables of all catalogs, keyed by namespace.
    pub fn publish_json(&self) -> serde_json::Value {
        let mut tables = serde_json::Map::new();
        for namespace in Namespace::ALL {
            tables.insert(
                namespace.as_str().to_string(),
                self.catalog(namespace).to_json(),
            );
        }
        serde_json::Value::Object(tables)
    }
}

struct PendingRegistration {
    namespace: Namespace,
    metadata: ExtensionMetadata,
    factory: ExtensionFactory,
    built_in: bool,
}

pub struct BridgeContextBuilder {
    config: BridgeConfig,
    registrations: Vec<PendingRegistration>,
    proxy_configs: Vec<ProxyConfig>,
    alias_rules: Vec<AliasRule>,
    permissions: Option<Arc<dyn PermissionManager>>,
    script_engine: Option<Arc<dyn ScriptEngine>>,
}

impl BridgeContextBuilder {
    pub fn new() -> Self {
        Self {
            config: BridgeConfig::default(),
            registrations: Vec::new(),
            proxy_configs: Vec::new(),
            alias_rules: Vec::new(),
            permissions: None,
            script_engine: None,
        }
    }

    pub fn config(mut self, config: BridgeConfig) -> Self {
        self.config = config;
        self
    }

    pub fn register(
        mut self,
        namespace: Namespace,
        metadata: ExtensionMetadata,
        factory: ExtensionFactory,
    ) -> Self {
        self.registrations.push(PendingRegistration {
            namespace,
            metadata,
            factory,
            built_in: false,
        });
        self
    }

    /// Register a feature that is available without being declared.
    pub fn register_built_in(mut self, metadata: ExtensionMetadata, factory: ExtensionFactory) -> Self {
        self.registrations.push(PendingRegistration {
            namespace: Namespace::Feature,
            metadata,
            factory,
            built_in: true,
        });
        self
    }

    pub fn proxy_config(mut self, config: ProxyConfig) -> Self {
        self.proxy_configs.push(config);
        self
    }

    pub fn alias_rule(mut self, rule: AliasRule) -> Self {
        self.alias_rules.push(rule);
        self
    }

    pub fn permission_manager(mut self, manager: Arc<dyn PermissionManager>) -> Self {
        self.permissions = Some(manager);
        self
    }

    pub fn script_engine(mut self, engine: Arc<dyn ScriptEngine>) -> Self {
        self.script_engine = Some(engine);
        self
    }

    /// Validate everything and start the background tasks.
    ///
    /// Must be called inside a tokio runtime.
    pub fn build(self) -> Result<Arc<BridgeContext>> {
        self.config.validate()?;
        let handle = Handle::try_current()?;

        let proxies = ProxyResolver::new();
        for rule in self.alias_rules {
            proxies.add_alias_rule(rule);
        }
        for config in &self.proxy_configs {
            proxies.load_config(config);
        }

        let features = ExtensionCatalog::new(Namespace::Feature);
        let modules = ExtensionCatalog::new(Namespace::Module);
        let widgets = ExtensionCatalog::new(Namespace::Widget);

        for mut pending in self.registrations {
            if let Some(blacklist) = self.config.blacklisted_methods.get(pending.metadata.name()) {
                tracing::debug!(extension = %pending.metadata.name(), methods = ?blacklist, "Removing blacklisted methods");
                pending.metadata.remove_methods(blacklist.as_slice());
            }
            proxies.apply_to(&mut pending.metadata)?;
            let catalog = match pending.namespace {
                Namespace::Feature => &features,
                Namespace::Module => &modules,
                Namespace::Widget => &widgets,
            };
            catalog.register(pending.metadata, pending.factory, pending.built_in)?;
        }

        let io_pool = WorkerPool::with_handle("io", self.config.io_pool_size, handle.clone());
        let relay_pool =
            WorkerPool::with_handle("relay", self.config.relay_pool_size, handle.clone());
        let engine = self
            .script_engine
            .unwrap_or_else(|| Arc::new(TracingScriptEngine));
        let delivery =
            DeliveryQueue::spawn_on(engine, self.config.max_callback_payload_bytes, &handle);
        let relay = MessageRelay::new(self.config.relay_ttl(), relay_pool, handle);

        tracing::info!(
            features = features.len(),
            modules = modules.len(),
            widgets = widgets.len(),
            io_pool = io_pool.size(),
            "Bridge context ready"
        );

        Ok(Arc::new(BridgeContext {
            config: self.config,
            features,
            modules,
            widgets,
            proxies,
            permissions: self
                .permissions
                .unwrap_or_else(|| Arc::new(AllowAllPermissions)),
            io_pool,
            delivery,
            relay,
            scopes: ScopeRegistry::new(),
        }))
    }
}

impl Default for BridgeContextBuilder {
    fn default() -> Self {
        Self::new()
    }
}
