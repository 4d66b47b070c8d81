//! Worker configuration.

use std::str::FromStr;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::cookies::CookieSubscription;
use crate::ServiceWorkerError;

/// Origin the worker is served from when none is configured.
pub const DEFAULT_ORIGIN: &str = "http://localhost:8080/";

/// The two shipped worker configurations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WorkerVariant {
    /// Worker served at the site root: `v1`, prefix cookie filter, no claim.
    Root,
    /// Worker served from `/static`: `v0`, exact cookie filter, claims clients.
    #[default]
    Static,
}

impl FromStr for WorkerVariant {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "root" => Ok(Self::Root),
            "static" => Ok(Self::Static),
            other => Err(format!("unknown worker variant '{other}' (expected root|static)")),
        }
    }
}

/// Everything the worker needs to know at construction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Origin that relative URLs (precache list) resolve against.
    pub origin: Url,

    /// Name of the current cache generation.
    pub cache_name: String,

    /// Paths warmed into the cache on install.
    pub precache_urls: Vec<String>,

    /// Whether install warms the cache at all.
    pub precache_on_install: bool,

    /// Cookie the bridge reads and writes.
    pub cookie_name: String,

    /// Value written by the set-cookie operation.
    pub cookie_set_value: String,

    /// Change-subscription filter registered on install.
    pub cookie_subscriptions: Vec<CookieSubscription>,

    /// Take control of already-open pages on activation.
    pub claim_clients: bool,
}

impl WorkerConfig {
    pub fn for_variant(variant: WorkerVariant) -> Self {
        match variant {
            WorkerVariant::Root => Self::root_variant(),
            WorkerVariant::Static => Self::static_variant(),
        }
    }

    pub fn static_variant() -> Self {
        Self {
            origin: Url::parse(DEFAULT_ORIGIN).expect("DEFAULT_ORIGIN is a valid URL"),
            cache_name: "v0".to_string(),
            precache_urls: vec![
                "/".to_string(),
                "/bootstrap.min.css".to_string(),
                "/app.js".to_string(),
            ],
            precache_on_install: false,
            cookie_name: "session".to_string(),
            cookie_set_value: "set-by-sw".to_string(),
            cookie_subscriptions: vec![CookieSubscription::equals("session")],
            claim_clients: true,
        }
    }

    pub fn root_variant() -> Self {
        Self {
            cache_name: "v1".to_string(),
            cookie_subscriptions: vec![CookieSubscription::starts_with("session")],
            claim_clients: false,
            ..Self::static_variant()
        }
    }

    /// Resolve a configured path against the origin.
    pub fn resolve(&self, path: &str) -> Result<Url, ServiceWorkerError> {
        Ok(self.origin.join(path)?)
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self::static_variant()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cookies::MatchType;

    #[test]
    fn test_variants_differ_in_filter() {
        let root = WorkerConfig::root_variant();
        let stat = WorkerConfig::static_variant();

        assert_eq!(root.cache_name, "v1");
        assert_eq!(stat.cache_name, "v0");
        assert_eq!(root.cookie_subscriptions[0].match_type, MatchType::StartsWith);
        assert_eq!(stat.cookie_subscriptions[0].match_type, MatchType::Equals);
        assert!(stat.claim_clients);
        assert!(!root.claim_clients);
        assert!(!root.precache_on_install && !stat.precache_on_install);
    }

    #[test]
    fn test_variant_parse() {
        assert_eq!("root".parse::<WorkerVariant>().unwrap(), WorkerVariant::Root);
        assert_eq!(
            WorkerConfig::for_variant("static".parse().unwrap()),
            WorkerConfig::default()
        );
        assert!("other".parse::<WorkerVariant>().is_err());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: WorkerConfig = serde_json::from_str(
            r#"{
                "cache_name": "v7",
                "origin": "https://demo.example/",
                "cookie_subscriptions": [{"name": "sess", "matchType": "starts-with"}]
            }"#,
        )
        .unwrap();

        assert_eq!(config.cache_name, "v7");
        assert_eq!(config.origin.as_str(), "https://demo.example/");
        assert_eq!(config.cookie_subscriptions, vec![CookieSubscription::starts_with("sess")]);
        assert_eq!(config.cookie_name, "session");
    }

    #[test]
    fn test_resolve_against_origin() {
        let config = WorkerConfig::default();
        assert_eq!(config.origin.as_str(), DEFAULT_ORIGIN);
        assert_eq!(
            config.resolve("/app.js").unwrap().as_str(),
            "http://localhost:8080/app.js"
        );
    }
}
