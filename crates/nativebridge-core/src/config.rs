//! Bridge configuration.
//!
//! Reserved names and defaults live in small constant modules so every crate
//! in the workspace reads them from one place. [`BridgeConfig`] carries the
//! tunables that a host may override from JSON or the environment.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use crate::error::{BridgeError, Result};

/// Reserved method names, prefixes and tokens.
pub mod names {
    /// Constructor of an instantiable extension.
    pub const ACTION_INIT: &str = "__init__";
    /// Every EVENT method name starts with this.
    pub const EVENT_PREFIX: &str = "__on";
    /// Every EVENT alias starts with this.
    pub const EVENT_ALIAS_PREFIX: &str = "on";
    /// READ attribute methods start with this.
    pub const GETTER_PREFIX: &str = "__get";
    /// WRITE attribute methods start with this.
    pub const SETTER_PREFIX: &str = "__set";
    /// Callback token sent by the script side when an event is unset.
    pub const UNSET_CALLBACK: &str = "-1";
    /// Persistent callback action that receives relay registration messages.
    pub const ACTION_REGISTER_CALLBACK: &str = "__onregistercallback";
    /// Cross-boundary message code of the registration handshake.
    pub const REGISTRATION_CODE: i32 = 0;
}

/// Default values.
pub mod defaults {
    /// Buffered cross-boundary messages are dropped after this long.
    pub const RELAY_TTL_MS: u64 = 10_000;
    /// Concurrent tasks on the shared I/O pool.
    pub const IO_POOL_SIZE: usize = 16;
    /// Concurrent tasks on the relay delivery pool.
    pub const RELAY_POOL_SIZE: usize = 4;
    /// Serialized callback payloads above this size are replaced by an OOM response.
    pub const MAX_CALLBACK_PAYLOAD_BYTES: usize = 32 * 1024 * 1024;
    /// Delay added after the earliest expiry before the eviction timer fires.
    pub const EVICTION_SLACK_MS: u64 = 5;
}

/// Environment variable names.
pub mod env_vars {
    pub const RELAY_TTL_MS: &str = "NATIVEBRIDGE_RELAY_TTL_MS";
    pub const IO_POOL_SIZE: &str = "NATIVEBRIDGE_IO_POOL_SIZE";
    pub const MAX_CALLBACK_PAYLOAD_BYTES: &str = "NATIVEBRIDGE_MAX_CALLBACK_PAYLOAD_BYTES";
    pub const LOG_JSON: &str = "NATIVEBRIDGE_LOG_JSON";

    fn parsed<T: std::str::FromStr>(name: &str) -> Option<T> {
        std::env::var(name).ok().and_then(|s| s.trim().parse().ok())
    }

    /// Relay TTL override in milliseconds.
    pub fn relay_ttl_ms() -> Option<u64> {
        parsed(RELAY_TTL_MS)
    }

    /// I/O pool size override.
    pub fn io_pool_size() -> Option<usize> {
        parsed(IO_POOL_SIZE)
    }

    /// Payload limit override.
    pub fn max_callback_payload_bytes() -> Option<usize> {
        parsed(MAX_CALLBACK_PAYLOAD_BYTES)
    }

    /// Whether JSON log output is requested.
    pub fn log_json() -> bool {
        parsed(LOG_JSON).unwrap_or(false)
    }
}

/// Runtime configuration of a bridge context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct BridgeConfig {
    /// TTL for buffered relay messages, in milliseconds.
    pub relay_ttl_ms: u64,
    /// Maximum concurrent tasks on the shared I/O pool.
    pub io_pool_size: usize,
    /// Maximum concurrent tasks on the relay delivery pool.
    pub relay_pool_size: usize,
    /// Maximum size of a serialized callback payload.
    pub max_callback_payload_bytes: usize,
    /// Features available to every scope regardless of its manifest.
    pub configured_features: BTreeSet<String>,
    /// Features allowed while a scope is in the background.
    pub background_features: BTreeSet<String>,
    /// `feature_action` pairs allowed while a scope is in the background.
    pub background_methods: BTreeSet<String>,
    /// Methods removed from an extension's table (restricted profile).
    pub blacklisted_methods: BTreeMap<String, Vec<String>>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            relay_ttl_ms: defaults::RELAY_TTL_MS,
            io_pool_size: defaults::IO_POOL_SIZE,
            relay_pool_size: defaults::RELAY_POOL_SIZE,
            max_callback_payload_bytes: defaults::MAX_CALLBACK_PAYLOAD_BYTES,
            configured_features: BTreeSet::new(),
            background_features: BTreeSet::new(),
            background_methods: BTreeSet::new(),
            blacklisted_methods: BTreeMap::new(),
        }
    }
}

impl BridgeConfig {
    /// Parse a JSON configuration document. Missing fields take defaults.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Apply environment overrides on top of this configuration.
    pub fn with_env_overrides(mut self) -> Self {
        if let Some(ttl) = env_vars::relay_ttl_ms() {
            self.relay_ttl_ms = ttl;
        }
        if let Some(size) = env_vars::io_pool_size() {
            self.io_pool_size = size;
        }
        if let Some(limit) = env_vars::max_callback_payload_bytes() {
            self.max_callback_payload_bytes = limit;
        }
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.io_pool_size == 0 {
            return Err(BridgeError::Config("ioPoolSize must be > 0".to_string()));
        }
        if self.relay_pool_size == 0 {
            return Err(BridgeError::Config(
                "relayPoolSize must be > 0".to_string(),
            ));
        }
        if self.relay_ttl_ms == 0 {
            return Err(BridgeError::Config("relayTtlMs must be > 0".to_string()));
        }
        Ok(())
    }

    pub fn relay_ttl(&self) -> Duration {
        Duration::from_millis(self.relay_ttl_ms)
    }

    /// Key used in [`BridgeConfig::background_methods`].
    pub fn background_method_key(feature: &str, action: &str) -> String {
        format!("{feature}_{action}")
    }
}
