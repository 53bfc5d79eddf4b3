//! Route rules: which policy applies to which request path.
//!
//! Each rule names a path prefix and either a policy or an exemption.
//! The longest matching prefix wins; paths no rule matches fall through to
//! the default policy. Rule names namespace counters, so the same caller
//! has an independent quota per rule.

use std::collections::HashSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::info;

use super::policy::{Policy, PolicyConfig, ScopedPolicy};
use crate::error::{Result, TollgateError};

/// Name of the policy applied when no rule matches.
pub const DEFAULT_RULE: &str = "default";

/// A rule as written in configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleConfig {
    /// Unique rule name
    pub name: String,
    /// Request path prefix this rule applies to
    pub path_prefix: String,
    /// Optional description for logs
    #[serde(default)]
    pub description: Option<String>,
    /// Policy to apply; required unless the rule is exempt
    #[serde(default)]
    pub policy: Option<PolicyConfig>,
    /// Skip rate limiting entirely for matching paths
    #[serde(default)]
    pub exempt: bool,
}

/// The outcome of matching a path against the rules.
#[derive(Debug, Clone)]
pub enum RouteMatch {
    /// Apply this policy
    Limit(Arc<ScopedPolicy>),
    /// The path is exempt under the named rule
    Exempt(String),
}

#[derive(Debug)]
struct CompiledRule {
    name: String,
    path_prefix: String,
    action: RouteMatch,
}

impl CompiledRule {
    fn matches(&self, path: &str) -> bool {
        match path.strip_prefix(self.path_prefix.as_str()) {
            Some(rest) => rest.is_empty() || self.path_prefix.ends_with('/') || rest.starts_with('/'),
            None => false,
        }
    }
}

/// Compiled route rules.
#[derive(Debug)]
pub struct RouteRules {
    default: Arc<ScopedPolicy>,
    /// Sorted by descending prefix length
    rules: Vec<CompiledRule>,
}

impl RouteRules {
    /// Rules that apply `default` to every path.
    pub fn new(default: Policy) -> Self {
        Self {
            default: Arc::new(ScopedPolicy::new(DEFAULT_RULE, default)),
            rules: Vec::new(),
        }
    }

    /// Validate and compile configured rules.
    pub fn from_config(default: &PolicyConfig, rules: &[RuleConfig]) -> Result<Self> {
        let mut compiled = Vec::with_capacity(rules.len());
        let mut names = HashSet::new();

        for rule in rules {
            if rule.name.trim().is_empty() {
                return Err(TollgateError::config("rule name must not be empty"));
            }
            // Store keys are `{rule}:{algorithm}:{key}`, so the rule name
            // must end at the first ':'.
            if rule.name.contains(':') {
                return Err(TollgateError::config(format!(
                    "rule name '{}' must not contain ':'",
                    rule.name
                )));
            }
            if rule.name == DEFAULT_RULE {
                return Err(TollgateError::config(format!(
                    "rule name '{}' is reserved",
                    DEFAULT_RULE
                )));
            }
            if !names.insert(rule.name.as_str()) {
                return Err(TollgateError::config(format!("duplicate rule name '{}'", rule.name)));
            }
            if !rule.path_prefix.starts_with('/') {
                return Err(TollgateError::config(format!(
                    "rule '{}': path_prefix must start with '/'",
                    rule.name
                )));
            }

            let action = if rule.exempt {
                RouteMatch::Exempt(rule.name.clone())
            } else {
                let policy = rule.policy.as_ref().ok_or_else(|| {
                    TollgateError::config(format!(
                        "rule '{}' needs a policy unless it is exempt",
                        rule.name
                    ))
                })?;
                let policy = policy
                    .build()
                    .map_err(|e| TollgateError::config(format!("rule '{}': {}", rule.name, e)))?;
                RouteMatch::Limit(Arc::new(ScopedPolicy::new(rule.name.clone(), policy)))
            };

            info!(
                rule = %rule.name,
                path_prefix = %rule.path_prefix,
                description = rule.description.as_deref().unwrap_or(""),
                exempt = rule.exempt,
                "Loaded rate limit rule"
            );

            compiled.push(CompiledRule {
                name: rule.name.clone(),
                path_prefix: rule.path_prefix.clone(),
                action,
            });
        }

        compiled.sort_by(|a, b| b.path_prefix.len().cmp(&a.path_prefix.len()));

        Ok(Self {
            default: Arc::new(ScopedPolicy::new(DEFAULT_RULE, default.build()?)),
            rules: compiled,
        })
    }

    /// Find what applies to `path`.
    pub fn match_path(&self, path: &str) -> RouteMatch {
        self.rules
            .iter()
            .find(|rule| rule.matches(path))
            .map(|rule| rule.action.clone())
            .unwrap_or_else(|| RouteMatch::Limit(self.default.clone()))
    }

    /// The default policy.
    pub fn default_policy(&self) -> &Arc<ScopedPolicy> {
        &self.default
    }

    /// Names of the configured rules, most specific first.
    pub fn rule_names(&self) -> impl Iterator<Item = &str> {
        self.rules.iter().map(|rule| rule.name.as_str())
    }

    /// Number of configured rules, excluding the default.
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// Whether only the default policy is configured.
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}
