//! Per-trigger argument resolution and the built-in `{placeholder}` engine.

use std::collections::BTreeMap;

const ENV_PLACEHOLDER_PREFIX: &str = "env.";

/// Trait contract for `ArgumentResolver` behavior.
///
/// Implementations are built per trigger; resolved values must never be cached
/// across triggers.
pub trait ArgumentResolver: Send + Sync {
    fn resolve(&self, template: &str) -> String;
}

/// Resolves every template exactly once, preserving order.
pub fn resolve_arguments(templates: &[String], resolver: &dyn ArgumentResolver) -> Vec<String> {
    templates
        .iter()
        .map(|template| resolver.resolve(template))
        .collect()
}

#[derive(Clone, Copy, Debug, Default)]
/// Public struct `IdentityArgumentResolver` used across Tau exec components.
pub struct IdentityArgumentResolver;

impl ArgumentResolver for IdentityArgumentResolver {
    fn resolve(&self, template: &str) -> String {
        template.to_string()
    }
}

#[derive(Clone, Debug, Default)]
/// Replaces `{key}` tokens from a per-request value map.
///
/// Lookups retry with the ASCII-lowercased key, so header names match
/// case-insensitively. Unknown keys resolve to the empty string. `{env.NAME}`
/// reads the process environment. Braces that do not enclose a valid key are copied verbatim.
pub struct PlaceholderResolver {
    values: BTreeMap<String, String>,
}

impl PlaceholderResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.values.insert(key.into(), value.into());
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    fn lookup(&self, key: &str) -> String {
        if let Some(value) = self
            .values
            .get(key)
            .or_else(|| self.values.get(&key.to_ascii_lowercase()))
        {
            return value.clone();
        }
        if let Some(name) = key.strip_prefix(ENV_PLACEHOLDER_PREFIX) {
            return std::env::var(name).unwrap_or_default();
        }
        String::new()
    }
}

impl ArgumentResolver for PlaceholderResolver {
    fn resolve(&self, template: &str) -> String {
        let mut output = String::with_capacity(template.len());
        let mut rest = template;
        while let Some(open) = rest.find('{') {
            output.push_str(&rest[..open]);
            let candidate = &rest[open + 1..];
            match candidate.find('}') {
                Some(close) if is_placeholder_key(&candidate[..close]) => {
                    output.push_str(&self.lookup(&candidate[..close]));
                    rest = &candidate[close + 1..];
                }
                _ => {
                    output.push('{');
                    rest = candidate;
                }
            }
        }
        output.push_str(rest);
        output
    }
}

fn is_placeholder_key(key: &str) -> bool {
    !key.is_empty()
        && key
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '.' | '_' | '-'))
}
