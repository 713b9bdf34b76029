//! Extension system.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │                  ExtensionCatalog × 3                 │
//! │  feature ─► module ─► widget   (lookup priority)      │
//! │  - validated method tables + factories               │
//! │  - lazy, single construction per name                │
//! └──────────────────────────────────────────────────────┘
//!                          │ alias / proxy
//!                          ▼
//!                   ┌─────────────┐
//!                   │ProxyResolver│
//!                   └─────────────┘
//! ```

pub mod catalog;
pub mod metadata;
pub mod proxy;
pub mod system;

pub use catalog::{ExtensionCatalog, ExtensionFactory, LoadedExtension, Namespace};
pub use metadata::{
    Access, ExtensionMetadata, Method, MethodBuilder, MethodType, Mode, Multiple, Normalize,
};
pub use proxy::{AliasRule, AliasRules, ProxyConfig, ProxyResolver, ProxyTarget};
pub use system::{DynExtension, Extension, Request};
