//! Name redirection: alias rules and proxy methods.
//!
//! Alias rules map an extension name the catalog does not know to one it does.
//! Exact rules are tried before regex rules, each group in registration order,
//! and the first match wins. Regex rules must match the whole name; the target
//! is a replacement template (`$1`, `${name}`).
//!
//! Proxy entries rewrite `(extension, action)` to another action of the same
//! extension, optionally under a different invocation mode.

use dashmap::DashMap;
use parking_lot::RwLock;
use regex::Regex;
use serde::Deserialize;

use super::metadata::{ExtensionMetadata, Mode};
use crate::error::{BridgeError, Result};

// ============================================================================
// Alias rules
// ============================================================================

#[derive(Debug, Clone)]
pub struct AliasRule {
    pattern: String,
    target: String,
    regex: Option<Regex>,
}

impl AliasRule {
    pub fn exact(pattern: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
            target: target.into(),
            regex: None,
        }
    }

    pub fn regex(pattern: impl Into<String>, target: impl Into<String>) -> Result<Self> {
        let pattern = pattern.into();
        let regex = Regex::new(&format!("^(?:{pattern})$")).map_err(|source| {
            BridgeError::InvalidAliasPattern {
                pattern: pattern.clone(),
                source,
            }
        })?;
        Ok(Self {
            pattern,
            target: target.into(),
            regex: Some(regex),
        })
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn is_regex(&self) -> bool {
        self.regex.is_some()
    }

    /// Target name if this rule matches `name`.
    pub fn apply(&self, name: &str) -> Option<String> {
        match &self.regex {
            None => (self.pattern == name).then(|| self.target.clone()),
            Some(regex) => {
                let captures = regex.captures(name)?;
                let mut target = String::new();
                captures.expand(&self.target, &mut target);
                Some(target)
            }
        }
    }
}

/// Serialized form: `{"pattern": "...", "target": "...", "regex": false}`.
#[derive(Debug, Deserialize)]
struct AliasRuleSpec {
    pattern: String,
    target: String,
    #[serde(default)]
    regex: bool,
}

/// Ordered alias rules.
#[derive(Debug, Clone, Default)]
pub struct AliasRules {
    exact: Vec<AliasRule>,
    patterns: Vec<AliasRule>,
}

impl AliasRules {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, rule: AliasRule) {
        if rule.is_regex() {
            self.patterns.push(rule);
        } else {
            self.exact.push(rule);
        }
    }

    /// Parse a JSON array of rules.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let specs: Vec<AliasRuleSpec> = serde_json::from_str(json)?;
        let mut rules = Self::new();
        for spec in specs {
            let rule = if spec.regex {
                AliasRule::regex(spec.pattern, spec.target)?
            } else {
                AliasRule::exact(spec.pattern, spec.target)
            };
            rules.push(rule);
        }
        Ok(rules)
    }

    pub fn resolve(&self, name: &str) -> Option<String> {
        self.exact
            .iter()
            .chain(self.patterns.iter())
            .find_map(|rule| rule.apply(name))
    }

    pub fn len(&self) -> usize {
        self.exact.len() + self.patterns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ============================================================================
// Proxy configuration
// ============================================================================

fn default_proxy_mode() -> Mode {
    Mode::Sync
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProxyMethodConfig {
    /// Action the script calls.
    pub name: String,
    /// Action that actually runs.
    pub proxy: String,
    /// Mode the caller sees for `name`.
    #[serde(default = "default_proxy_mode")]
    pub mode: Mode,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProxyFeatureConfig {
    pub name: String,
    #[serde(default)]
    pub methods: Vec<ProxyMethodConfig>,
}

/// `{"features": [{"name": .., "methods": [{"name": .., "proxy": .., "mode": ..}]}]}`
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProxyConfig {
    #[serde(default)]
    pub features: Vec<ProxyFeatureConfig>,
}

impl ProxyConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

/// Where a proxied action really goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyTarget {
    pub action: String,
    pub mode: Mode,
}

// ============================================================================
// Resolver
// ============================================================================

pub struct ProxyResolver {
    aliases: RwLock<AliasRules>,
    proxies: DashMap<(String, String), ProxyTarget>,
}

impl ProxyResolver {
    pub fn new() -> Self {
        Self {
            aliases: RwLock::new(AliasRules::new()),
            proxies: DashMap::new(),
        }
    }

    pub fn add_alias_rule(&self, rule: AliasRule) {
        tracing::debug!(pattern = %rule.pattern(), target = %rule.target(), regex = rule.is_regex(), "Alias rule added");
        self.aliases.write().push(rule);
    }

    pub fn add_alias_rules(&self, rules: AliasRules) {
        let mut aliases = self.aliases.write();
        for rule in rules.exact.into_iter().chain(rules.patterns) {
            aliases.push(rule);
        }
    }

    /// Alias target for an extension name, if any rule matches.
    pub fn resolve_alias(&self, name: &str) -> Option<String> {
        self.aliases.read().resolve(name)
    }

    pub fn add_proxy(&self, extension: &str, action: &str, target: &str, mode: Mode) {
        self.proxies.insert(
            (extension.to_string(), action.to_string()),
            ProxyTarget {
                action: target.to_string(),
                mode,
            },
        );
    }

    pub fn load_config(&self, config: &ProxyConfig) {
        for feature in &config.features {
            for method in &feature.methods {
                self.add_proxy(&feature.name, &method.name, &method.proxy, method.mode);
            }
        }
    }

    pub fn proxy_for(&self, extension: &str, action: &str) -> Option<ProxyTarget> {
        self.proxies
            .get(&(extension.to_string(), action.to_string()))
            .map(|entry| entry.value().clone())
    }

    /// Register every proxy action configured for `metadata` as a proxy method.
    ///
    /// Entries whose target is not in the table are skipped with a warning.
    pub fn apply_to(&self, metadata: &mut ExtensionMetadata) -> Result<usize> {
        let entries: Vec<(String, ProxyTarget)> = self
            .proxies
            .iter()
            .filter(|entry| entry.key().0 == metadata.name())
            .map(|entry| (entry.key().1.clone(), entry.value().clone()))
            .collect();

        let mut applied = 0;
        for (action, target) in entries {
            if metadata.add_proxy_method(&action, &target.action, target.mode)? {
                applied += 1;
            } else {
                tracing::warn!(
                    extension = %metadata.name(),
                    action = %action,
                    target = %target.action,
                    "Proxy target not found"
                );
            }
        }
        Ok(applied)
    }
}

impl Default for ProxyResolver {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extension::metadata::Method;

    #[test]
    fn test_regex_matches_whole_name() {
        let rule = AliasRule::regex("f.o", "bar").unwrap();
        assert_eq!(rule.apply("foo").as_deref(), Some("bar"));
        assert_eq!(rule.apply("food"), None);
    }

    #[test]
    fn test_regex_template() {
        let rule = AliasRule::regex(r"service\.(\w+)", "system.$1").unwrap();
        assert_eq!(rule.apply("service.clock").as_deref(), Some("system.clock"));
    }

    #[test]
    fn test_invalid_pattern() {
        let err = AliasRule::regex("(", "x").unwrap_err();
        assert!(matches!(err, BridgeError::InvalidAliasPattern { .. }));
    }

    #[test]
    fn test_rules_from_json() {
        let rules = AliasRules::from_json_str(
            r#"[{"pattern": "f.*", "target": "baz", "regex": true},
                {"pattern": "foo", "target": "bar"}]"#,
        )
        .unwrap();
        assert_eq!(rules.len(), 2);
        assert_eq!(rules.resolve("foo").as_deref(), Some("bar"));
        assert_eq!(rules.resolve("fig").as_deref(), Some("baz"));
        assert_eq!(rules.resolve("other"), None);
    }

    #[test]
    fn test_proxy_config_default_mode() {
        let config = ProxyConfig::from_json_str(
            r#"{"features": [{"name": "system.fetch", "methods": [
                {"name": "fetchSync", "proxy": "fetch"},
                {"name": "nowAsync", "proxy": "now", "mode": "ASYNC"}
            ]}]}"#,
        )
        .unwrap();

        let resolver = ProxyResolver::new();
        resolver.load_config(&config);
        assert_eq!(
            resolver.proxy_for("system.fetch", "fetchSync"),
            Some(ProxyTarget {
                action: "fetch".to_string(),
                mode: Mode::Sync
            })
        );
        assert_eq!(
            resolver.proxy_for("system.fetch", "nowAsync").map(|t| t.mode),
            Some(Mode::Async)
        );
        assert!(resolver.proxy_for("system.fetch", "fetch").is_none());
    }

    #[test]
    fn test_apply_to_registers_proxy_methods() {
        let resolver = ProxyResolver::new();
        resolver.add_proxy("system.fetch", "fetchSync", "fetch", Mode::Sync);
        resolver.add_proxy("system.fetch", "ghost", "missing", Mode::Sync);

        let mut metadata = ExtensionMetadata::new("system.fetch", "system")
            .with_method(Method::new("fetch", Mode::Async).unwrap());
        assert_eq!(resolver.apply_to(&mut metadata).unwrap(), 1);
        assert_eq!(metadata.mode("fetchSync"), Some(Mode::Sync));
        assert!(!metadata.has_method("ghost"));
    }
}
