//! Native extension bridge.
//!
//! Script code running in an embedded interpreter calls native extensions
//! through a metadata-declared method surface. This crate provides the method
//! tables and their validation, name aliasing and proxying, lazily constructed
//! extension catalogs, the invocation dispatcher with its permission gate and
//! mode handling, callback channels, persistent callbacks, and the relay for
//! messages crossing to a host that may not be attached yet.
//!
//! # Usage
//!
//! ```rust,ignore
//! use nativebridge_core::prelude::*;
//!
//! let ctx = BridgeContext::builder()
//!     .register_built_in(clock_metadata(), clock_factory())
//!     .build()?;
//! let scope = ctx.create_scope(ScopeInfo::new("com.example.app"));
//! let response = ctx.dispatcher(scope).invoke("system.clock", "now", Value::Null, "1", -1).await;
//! ```

pub mod callback;
pub mod config;
pub mod context;
pub mod dispatcher;
pub mod error;
pub mod extension;
pub mod permission;
pub mod pool;
pub mod relay;
pub mod response;
pub mod scope;
pub mod value;

pub use context::{BridgeContext, BridgeContextBuilder};
pub use dispatcher::InvocationDispatcher;
pub use error::{BridgeError, ExtensionError, ExtensionResult, Result};
pub use response::Response;
pub use value::Value;

/// Re-exports commonly used types.
pub mod prelude {
    // Configuration
    pub use crate::config::{BridgeConfig, defaults, env_vars, names};

    // Error handling
    pub use crate::error::{BridgeError, ExtensionError, ExtensionResult, Result};

    // Core runtime
    pub use crate::context::{BridgeContext, BridgeContextBuilder};
    pub use crate::dispatcher::InvocationDispatcher;
    pub use crate::pool::WorkerPool;
    pub use crate::response::{Response, code};
    pub use crate::scope::{ScopeId, ScopeInfo, ScopeRegistry};
    pub use crate::value::Value;

    // Extensions
    pub use crate::extension::{
        Access, AliasRule, AliasRules, DynExtension, Extension, ExtensionCatalog,
        ExtensionFactory, ExtensionMetadata, LoadedExtension, Method, MethodBuilder, MethodType,
        Mode, Multiple, Namespace, Normalize, ProxyConfig, ProxyResolver, Request,
    };

    // Callbacks
    pub use crate::callback::{
        BlockingCallback, CallbackChannel, CallbackContext, CallbackHandler, DeliveryQueue,
        DynCallback, FnCallback, LoggingCallback, PersistentCallbackRegistry, ScriptCallback,
        ScriptEngine, TracingScriptEngine,
    };

    // Permissions
    pub use crate::permission::{
        AllowAllPermissions, DenialReason, PermissionManager, PermissionOutcome,
        StaticPermissionManager,
    };

    // Relay
    pub use crate::relay::{
        HostCounterpart, MessageRelay, RegistryCounterpart, RelayOutcome, ScriptCounterpart,
    };
}
