//! Method tables.
//!
//! Every extension publishes an [`ExtensionMetadata`]: its name, the module it
//! belongs to, and one [`Method`] descriptor per action. Descriptors are
//! validated when they are built, and the table as a whole is validated before
//! the catalog accepts it, so a malformed extension never becomes invokable.

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;

use crate::config::names;
use crate::error::{BridgeError, Result};

// ============================================================================
// Descriptor enums
// ============================================================================

/// Enums that cross the script boundary as ordinals.
///
/// Serialized as the ordinal; deserialized from either the ordinal or the
/// case-insensitive name.
macro_rules! ordinal_enum {
    (
        $(#[$meta:meta])*
        $name:ident {
            $( $(#[$vmeta:meta])* $variant:ident = $ord:literal => $label:literal ),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum $name {
            $( $(#[$vmeta])* $variant ),+
        }

        impl $name {
            pub fn ordinal(self) -> u8 {
                match self {
                    $( Self::$variant => $ord ),+
                }
            }

            pub fn from_ordinal(ordinal: u64) -> Option<Self> {
                match ordinal {
                    $( $ord => Some(Self::$variant), )+
                    _ => None,
                }
            }

            pub fn as_str(self) -> &'static str {
                match self {
                    $( Self::$variant => $label ),+
                }
            }

            pub fn from_name(name: &str) -> Option<Self> {
                $(
                    if name.eq_ignore_ascii_case($label) {
                        return Some(Self::$variant);
                    }
                )+
                None
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
                serializer.serialize_u8(self.ordinal())
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
                #[derive(Deserialize)]
                #[serde(untagged)]
                enum Repr {
                    Ordinal(u64),
                    Name(String),
                }

                match Repr::deserialize(deserializer)? {
                    Repr::Ordinal(n) => Self::from_ordinal(n).ok_or_else(|| {
                        D::Error::custom(format!("invalid {} ordinal: {}", stringify!($name), n))
                    }),
                    Repr::Name(s) => Self::from_name(&s).ok_or_else(|| {
                        D::Error::custom(format!("invalid {} name: {}", stringify!($name), s))
                    }),
                }
            }
        }
    };
}

ordinal_enum! {
    /// How an action delivers its result.
    Mode {
        /// The caller gets the result directly.
        Sync = 0 => "SYNC",
        /// The caller gets a placeholder; the result arrives once on the callback.
        Async = 1 => "ASYNC",
        /// The caller gets a placeholder; the callback may be notified repeatedly.
        Callback = 2 => "CALLBACK",
        /// The callback is attached, then the body runs on the calling context.
        SyncCallback = 3 => "SYNC_CALLBACK",
    }
}

impl Mode {
    /// Whether the dispatcher defers the body to a background pool.
    pub fn is_deferred(self) -> bool {
        matches!(self, Self::Async | Self::Callback)
    }
}

ordinal_enum! {
    MethodType {
        Function = 0 => "FUNCTION",
        Attribute = 1 => "ATTRIBUTE",
        Event = 2 => "EVENT",
    }
}

ordinal_enum! {
    Access {
        None = 0 => "NONE",
        Read = 1 => "READ",
        Write = 2 => "WRITE",
    }
}

ordinal_enum! {
    /// How the script side prepares parameters.
    Normalize {
        Raw = 0 => "RAW",
        Json = 1 => "JSON",
    }
}

ordinal_enum! {
    /// Whether an event accepts one or many listeners.
    Multiple {
        Single = 0 => "SINGLE",
        Multi = 1 => "MULTI",
    }
}

impl Default for MethodType {
    fn default() -> Self {
        Self::Function
    }
}

impl Default for Access {
    fn default() -> Self {
        Self::None
    }
}

impl Default for Normalize {
    fn default() -> Self {
        Self::Json
    }
}

impl Default for Multiple {
    fn default() -> Self {
        Self::Single
    }
}

// ============================================================================
// Method
// ============================================================================

/// A validated method descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Method {
    name: String,
    mode: Mode,
    #[serde(skip_serializing_if = "is_false")]
    instance_method: bool,
    #[serde(rename = "type", skip_serializing_if = "is_default")]
    method_type: MethodType,
    #[serde(skip_serializing_if = "is_default")]
    access: Access,
    #[serde(skip_serializing_if = "is_default")]
    normalize: Normalize,
    #[serde(skip_serializing_if = "is_default")]
    multiple: Multiple,
    #[serde(skip_serializing_if = "Option::is_none")]
    alias: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    permissions: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    sub_attrs: Vec<String>,
}

fn is_false(value: &bool) -> bool {
    !*value
}

fn is_default<T: Default + PartialEq>(value: &T) -> bool {
    *value == T::default()
}

impl Method {
    /// Plain FUNCTION with no permissions.
    pub fn new(name: impl Into<String>, mode: Mode) -> Result<Self> {
        Self::builder(name, mode).build()
    }

    pub fn builder(name: impl Into<String>, mode: Mode) -> MethodBuilder {
        MethodBuilder::new(name, mode)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn is_instance_method(&self) -> bool {
        self.instance_method
    }

    pub fn method_type(&self) -> MethodType {
        self.method_type
    }

    pub fn access(&self) -> Access {
        self.access
    }

    pub fn normalize(&self) -> Normalize {
        self.normalize
    }

    pub fn multiple(&self) -> Multiple {
        self.multiple
    }

    pub fn alias(&self) -> Option<&str> {
        self.alias.as_deref()
    }

    pub fn permissions(&self) -> &[String] {
        &self.permissions
    }

    pub fn sub_attrs(&self) -> &[String] {
        &self.sub_attrs
    }

    /// Same descriptor registered under another name with another mode.
    fn proxied(&self, name: &str, mode: Mode) -> MethodBuilder {
        MethodBuilder {
            name: name.to_string(),
            mode,
            instance_method: self.instance_method,
            method_type: self.method_type,
            access: self.access,
            normalize: self.normalize,
            multiple: self.multiple,
            alias: self.alias.clone(),
            permissions: self.permissions.clone(),
            sub_attrs: self.sub_attrs.clone(),
        }
    }

    fn check(&self) -> std::result::Result<(), &'static str> {
        if self.name.is_empty() {
            return Err("the name of method must not be empty");
        }

        let has_permissions = !self.permissions.is_empty();
        match self.method_type {
            MethodType::Function => {
                if self.access != Access::None {
                    return Err("the access of function must be none");
                }
                if self.mode == Mode::Sync && has_permissions {
                    return Err("the permissions of sync function must be empty");
                }
            }
            MethodType::Event => {
                if !self.name.starts_with(names::EVENT_PREFIX) {
                    return Err("the name of event must start with '__on'");
                }
                if self.mode != Mode::Callback {
                    return Err("the mode of event must be callback");
                }
                if self.access != Access::None {
                    return Err("the access of event must be none");
                }
                let alias = self.alias.as_deref().unwrap_or_default();
                if !alias.starts_with(names::EVENT_ALIAS_PREFIX) {
                    return Err("the alias of event must start with 'on'");
                }
                if alias != alias.to_lowercase() {
                    return Err("the alias of event must be all lower case characters");
                }
            }
            MethodType::Attribute => {
                if self.mode != Mode::Sync {
                    return Err("the mode of attribute must be sync");
                }
                if self.alias.as_deref().map_or(true, str::is_empty) {
                    return Err("the alias of attribute must not be empty");
                }
                if has_permissions {
                    return Err("the permissions of attribute must be empty");
                }
                match self.access {
                    Access::None => return Err("the access of attribute must not be none"),
                    Access::Read if !self.name.starts_with(names::GETTER_PREFIX) => {
                        return Err("the name of attribute must start with '__get'");
                    }
                    Access::Write if !self.name.starts_with(names::SETTER_PREFIX) => {
                        return Err("the name of attribute must start with '__set'");
                    }
                    _ => {}
                }
            }
        }

        if self.name == names::ACTION_INIT {
            if self.instance_method {
                return Err("constructor must NOT be instanceMethod");
            }
            if self.mode != Mode::Sync {
                return Err("constructor must be SYNC");
            }
            if self.method_type != MethodType::Function {
                return Err("constructor must be FUNCTION");
            }
        }
        Ok(())
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Method(name={}, instanceMethod={}, mode={}, type={}, access={}, normalize={}, multiple={}, alias={}, permissions={:?}, subAttrs={:?})",
            self.name,
            self.instance_method,
            self.mode,
            self.method_type,
            self.access,
            self.normalize,
            self.multiple,
            self.alias.as_deref().unwrap_or("null"),
            self.permissions,
            self.sub_attrs,
        )
    }
}

/// Unvalidated descriptor. Also the deserialization form of a table entry.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MethodBuilder {
    name: String,
    mode: Mode,
    #[serde(default)]
    instance_method: bool,
    #[serde(default, rename = "type")]
    method_type: MethodType,
    #[serde(default)]
    access: Access,
    #[serde(default)]
    normalize: Normalize,
    #[serde(default)]
    multiple: Multiple,
    #[serde(default)]
    alias: Option<String>,
    #[serde(default)]
    permissions: Vec<String>,
    #[serde(default)]
    sub_attrs: Vec<String>,
}

impl MethodBuilder {
    pub fn new(name: impl Into<String>, mode: Mode) -> Self {
        Self {
            name: name.into(),
            mode,
            instance_method: false,
            method_type: MethodType::default(),
            access: Access::default(),
            normalize: Normalize::default(),
            multiple: Multiple::default(),
            alias: None,
            permissions: Vec::new(),
            sub_attrs: Vec::new(),
        }
    }

    pub fn instance_method(mut self, instance_method: bool) -> Self {
        self.instance_method = instance_method;
        self
    }

    pub fn method_type(mut self, method_type: MethodType) -> Self {
        self.method_type = method_type;
        self
    }

    pub fn access(mut self, access: Access) -> Self {
        self.access = access;
        self
    }

    pub fn normalize(mut self, normalize: Normalize) -> Self {
        self.normalize = normalize;
        self
    }

    pub fn multiple(mut self, multiple: Multiple) -> Self {
        self.multiple = multiple;
        self
    }

    pub fn alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }

    pub fn permission(mut self, permission: impl Into<String>) -> Self {
        self.permissions.push(permission.into());
        self
    }

    pub fn permissions<I, S>(mut self, permissions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.permissions
            .extend(permissions.into_iter().map(Into::into));
        self
    }

    pub fn sub_attrs<I, S>(mut self, sub_attrs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.sub_attrs.extend(sub_attrs.into_iter().map(Into::into));
        self
    }

    /// Validate and freeze the descriptor.
    pub fn build(self) -> Result<Method> {
        let method = Method {
            name: self.name,
            mode: self.mode,
            instance_method: self.instance_method,
            method_type: self.method_type,
            access: self.access,
            normalize: self.normalize,
            multiple: self.multiple,
            alias: self.alias.filter(|a| !a.is_empty()),
            permissions: self.permissions,
            sub_attrs: self.sub_attrs,
        };
        match method.check() {
            Ok(()) => Ok(method),
            Err(reason) => Err(BridgeError::InvalidMethod {
                method: method.to_string(),
                reason: reason.to_string(),
            }),
        }
    }
}

// ============================================================================
// Extension metadata
// ============================================================================

/// Registration form of a method table.
#[derive(Debug, Deserialize)]
struct RegistrationTable {
    name: String,
    #[serde(default)]
    methods: Vec<MethodBuilder>,
}

/// Method table of one extension.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtensionMetadata {
    name: String,
    module: String,
    methods: BTreeMap<String, Method>,
}

impl ExtensionMetadata {
    pub fn new(name: impl Into<String>, module: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            module: module.into(),
            methods: BTreeMap::new(),
        }
    }

    /// Build from the registration schema, validating every descriptor and the
    /// table as a whole.
    pub fn from_json(json: &serde_json::Value, module: impl Into<String>) -> Result<Self> {
        let table = RegistrationTable::deserialize(json)?;
        let mut metadata = Self::new(table.name, module);
        for builder in table.methods {
            metadata.add_method(builder.build()?);
        }
        metadata.validate()?;
        Ok(metadata)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn module(&self) -> &str {
        &self.module
    }

    /// Store a descriptor, replacing any previous one with the same name.
    pub fn add_method(&mut self, method: Method) {
        self.methods.insert(method.name.clone(), method);
    }

    /// Chaining form of [`ExtensionMetadata::add_method`].
    pub fn with_method(mut self, method: Method) -> Self {
        self.add_method(method);
        self
    }

    /// Register `name` as a copy of `target`'s descriptor with `mode`
    /// substituted. Returns `Ok(false)` when `target` is not in the table.
    pub fn add_proxy_method(&mut self, name: &str, target: &str, mode: Mode) -> Result<bool> {
        let Some(target_method) = self.methods.get(target) else {
            return Ok(false);
        };
        let method = target_method.proxied(name, mode).build()?;
        self.add_method(method);
        Ok(true)
    }

    /// Remove descriptors by name. Unknown names are ignored.
    pub fn remove_methods<S: AsRef<str>>(&mut self, names: &[S]) {
        for name in names {
            self.methods.remove(name.as_ref());
        }
    }

    pub fn has_method(&self, name: &str) -> bool {
        self.methods.contains_key(name)
    }

    pub fn method(&self, name: &str) -> Option<&Method> {
        self.methods.get(name)
    }

    pub fn mode(&self, name: &str) -> Option<Mode> {
        self.methods.get(name).map(Method::mode)
    }

    pub fn permissions(&self, name: &str) -> Option<&[String]> {
        self.methods.get(name).map(Method::permissions)
    }

    pub fn methods(&self) -> impl Iterator<Item = &Method> {
        self.methods.values()
    }

    pub fn method_names(&self) -> Vec<&str> {
        self.methods.keys().map(String::as_str).collect()
    }

    /// An extension is instantiable when it registers the constructor.
    pub fn is_instantiable(&self) -> bool {
        self.methods.contains_key(names::ACTION_INIT)
    }

    /// Table-level invariants.
    pub fn validate(&self) -> Result<()> {
        let has_instance_method = self.methods.values().any(|m| m.instance_method);
        if has_instance_method && !self.is_instantiable() {
            return Err(BridgeError::InvalidExtension {
                name: self.name.clone(),
                reason: "feature is not instantiable but has instanceMethod".to_string(),
                table: self.to_json().to_string(),
            });
        }
        Ok(())
    }

    /// Registration JSON under the extension's own name.
    pub fn to_json(&self) -> serde_json::Value {
        self.to_json_named(&self.name)
    }

    /// Registration JSON published under `name`.
    pub fn to_json_named(&self, name: &str) -> serde_json::Value {
        let methods: Vec<serde_json::Value> = self
            .methods
            .values()
            .filter_map(|m| serde_json::to_value(m).ok())
            .collect();
        serde_json::json!({
            "name": name,
            "methods": methods,
            "instantiable": self.is_instantiable(),
        })
    }

    /// Same table under another name.
    pub fn alias(&self, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            module: self.module.clone(),
            methods: self.methods.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn reason(err: BridgeError) -> String {
        match err {
            BridgeError::InvalidMethod { reason, .. } => reason,
            BridgeError::InvalidExtension { reason, .. } => reason,
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_mode_ordinals() {
        assert_eq!(Mode::Sync.ordinal(), 0);
        assert_eq!(Mode::SyncCallback.ordinal(), 3);
        assert_eq!(Mode::from_name("sync_callback"), Some(Mode::SyncCallback));
        assert_eq!(Mode::from_ordinal(9), None);
        assert!(Mode::Async.is_deferred());
        assert!(!Mode::SyncCallback.is_deferred());
    }

    #[test]
    fn test_mode_deserializes_from_ordinal_or_name() {
        let mode: Mode = serde_json::from_value(json!(1)).unwrap();
        assert_eq!(mode, Mode::Async);
        let mode: Mode = serde_json::from_value(json!("CALLBACK")).unwrap();
        assert_eq!(mode, Mode::Callback);
        assert!(serde_json::from_value::<Mode>(json!(7)).is_err());
    }

    #[test]
    fn test_sync_function_permissions_rejected() {
        let err = Method::builder("now", Mode::Sync)
            .permission("network")
            .build()
            .unwrap_err();
        assert_eq!(reason(err), "the permissions of sync function must be empty");

        assert!(Method::builder("send", Mode::Async)
            .permission("network")
            .build()
            .is_ok());
    }

    #[test]
    fn test_function_access_must_be_none() {
        let err = Method::builder("now", Mode::Sync)
            .access(Access::Read)
            .build()
            .unwrap_err();
        assert_eq!(reason(err), "the access of function must be none");
    }

    #[test]
    fn test_event_rules() {
        let event = |name: &str, mode: Mode, alias: &str| {
            Method::builder(name, mode)
                .method_type(MethodType::Event)
                .alias(alias)
                .build()
        };

        assert!(event("__onchange", Mode::Callback, "onchange").is_ok());
        assert_eq!(
            reason(event("change", Mode::Callback, "onchange").unwrap_err()),
            "the name of event must start with '__on'"
        );
        assert_eq!(
            reason(event("__onchange", Mode::Async, "onchange").unwrap_err()),
            "the mode of event must be callback"
        );
        assert_eq!(
            reason(event("__onchange", Mode::Callback, "change").unwrap_err()),
            "the alias of event must start with 'on'"
        );
        assert_eq!(
            reason(event("__onchange", Mode::Callback, "onChange").unwrap_err()),
            "the alias of event must be all lower case characters"
        );
    }

    #[test]
    fn test_attribute_rules() {
        let attr = |name: &str, access: Access| {
            Method::builder(name, Mode::Sync)
                .method_type(MethodType::Attribute)
                .access(access)
                .alias("volume")
        };

        assert!(attr("__getVolume", Access::Read).build().is_ok());
        assert!(attr("__setVolume", Access::Write).build().is_ok());
        assert_eq!(
            reason(attr("__setVolume", Access::Read).build().unwrap_err()),
            "the name of attribute must start with '__get'"
        );
        assert_eq!(
            reason(attr("__getVolume", Access::None).build().unwrap_err()),
            "the access of attribute must not be none"
        );
        assert_eq!(
            reason(
                attr("__getVolume", Access::Read)
                    .permission("audio")
                    .build()
                    .unwrap_err()
            ),
            "the permissions of attribute must be empty"
        );
        let err = Method::builder("__getVolume", Mode::Sync)
            .method_type(MethodType::Attribute)
            .access(Access::Read)
            .build()
            .unwrap_err();
        assert_eq!(reason(err), "the alias of attribute must not be empty");
    }

    #[test]
    fn test_constructor_rules() {
        assert!(Method::new(names::ACTION_INIT, Mode::Sync).is_ok());
        assert_eq!(
            reason(Method::new(names::ACTION_INIT, Mode::Async).unwrap_err()),
            "constructor must be SYNC"
        );
        assert_eq!(
            reason(
                Method::builder(names::ACTION_INIT, Mode::Sync)
                    .instance_method(true)
                    .build()
                    .unwrap_err()
            ),
            "constructor must NOT be instanceMethod"
        );
    }

    #[test]
    fn test_empty_name_rejected() {
        assert_eq!(
            reason(Method::new("", Mode::Sync).unwrap_err()),
            "the name of method must not be empty"
        );
    }

    #[test]
    fn test_instance_method_requires_constructor() {
        let mut metadata = ExtensionMetadata::new("system.player", "system").with_method(
            Method::builder("play", Mode::Async)
                .instance_method(true)
                .build()
                .unwrap(),
        );
        let err = metadata.validate().unwrap_err();
        let message = err.to_string();
        assert!(message.starts_with("feature is not instantiable but has instanceMethod: "));
        assert!(message.contains("\"play\""));

        metadata.add_method(Method::new(names::ACTION_INIT, Mode::Sync).unwrap());
        assert!(metadata.validate().is_ok());
        assert!(metadata.is_instantiable());
    }

    #[test]
    fn test_proxy_method_copies_descriptor() {
        let mut metadata = ExtensionMetadata::new("system.fetch", "system").with_method(
            Method::builder("fetch", Mode::Async)
                .permission("network")
                .build()
                .unwrap(),
        );

        assert!(metadata
            .add_proxy_method("fetchAsync", "fetch", Mode::Async)
            .unwrap());
        let proxy = metadata.method("fetchAsync").unwrap();
        assert_eq!(proxy.mode(), Mode::Async);
        assert_eq!(proxy.permissions(), ["network".to_string()]);

        assert!(!metadata
            .add_proxy_method("other", "missing", Mode::Sync)
            .unwrap());
        assert!(!metadata.has_method("other"));
    }

    #[test]
    fn test_remove_methods() {
        let mut metadata = ExtensionMetadata::new("system.fetch", "system")
            .with_method(Method::new("a", Mode::Sync).unwrap())
            .with_method(Method::new("b", Mode::Sync).unwrap());
        metadata.remove_methods(&["a", "missing"]);
        assert_eq!(metadata.method_names(), vec!["b"]);
    }

    #[test]
    fn test_to_json_omits_defaults() {
        let metadata = ExtensionMetadata::new("system.audio", "system")
            .with_method(Method::new("play", Mode::Async).unwrap())
            .with_method(
                Method::builder("__onended", Mode::Callback)
                    .method_type(MethodType::Event)
                    .alias("onended")
                    .build()
                    .unwrap(),
            );

        let json = metadata.to_json();
        assert_eq!(json["name"], "system.audio");
        assert_eq!(json["instantiable"], false);
        let methods = json["methods"].as_array().unwrap();
        assert_eq!(methods.len(), 2);
        assert_eq!(methods[0], json!({"name": "__onended", "mode": 2, "type": 2, "alias": "onended"}));
        assert_eq!(methods[1], json!({"name": "play", "mode": 1}));
    }

    #[test]
    fn test_from_json_accepts_names_and_ordinals() {
        let json = json!({
            "name": "system.clock",
            "methods": [
                {"name": "now", "mode": "SYNC"},
                {"name": "__init__", "mode": 0},
                {"name": "tick", "mode": 2, "instanceMethod": true}
            ],
            "instantiable": false
        });
        let metadata = ExtensionMetadata::from_json(&json, "system").unwrap();
        assert_eq!(metadata.mode("now"), Some(Mode::Sync));
        assert_eq!(metadata.mode("tick"), Some(Mode::Callback));
        assert!(metadata.is_instantiable());
    }

    #[test]
    fn test_alias_shares_table() {
        let metadata = ExtensionMetadata::new("system.clock", "system")
            .with_method(Method::new("now", Mode::Sync).unwrap());
        let aliased = metadata.alias("service.clock");
        assert_eq!(aliased.name(), "service.clock");
        assert_eq!(aliased.module(), "system");
        assert!(aliased.has_method("now"));
    }
}
