//! Hot-swappable cache configuration.
//!
//! Regexes for path TTLs and exclude patterns are recompiled once per
//! configuration generation and installed behind an [`arc_swap::ArcSwap`]
//! pointer swap: readers capture the pointer once per operation and always
//! see either the old or the new complete configuration, never a partial
//! one. An invalid regex is logged and the offending rule is skipped, never
//! fatal.

use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// First-match-wins path -> TTL rule.
pub struct TimeoutRule {
    pub path: Regex,
    pub ttl: Duration,
}

/// A request header/value pair that excludes a request from caching.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ExcludeHeaderRule {
    pub name: String,
    pub value: String,
}

/// A response `Content-Type` pattern, optionally bounded by `Content-Length`.
pub struct ExcludeContentRule {
    pub content_type: Regex,
    pub size: Option<u64>,
}

/// Compiled, immutable configuration generation. Never mutated in place;
/// `KacheConfig::update` swaps in a brand new one.
pub struct CompiledConfig {
    pub cluster_label: String,
    pub x_header: bool,
    pub x_header_name: String,
    /// `None` means TTL eviction is disabled in the in-memory tier
    /// (YAML `default_ttl: "-1"`).
    pub default_ttl: Option<Duration>,
    pub timeouts: Vec<TimeoutRule>,
    pub exclude_paths: Vec<Regex>,
    pub exclude_headers: Vec<ExcludeHeaderRule>,
    pub exclude_content: Vec<ExcludeContentRule>,
    /// Header names allowed to appear in a response's `Vary` list; anything
    /// else makes the response uncacheable by Vary policy.
    pub vary_allow_list: Vec<String>,
}

impl Default for CompiledConfig {
    fn default() -> Self {
        Self {
            cluster_label: "kache-".to_string(),
            x_header: true,
            x_header_name: "X-Kache".to_string(),
            default_ttl: Some(Duration::from_secs(120)),
            timeouts: Vec::new(),
            exclude_paths: Vec::new(),
            exclude_headers: Vec::new(),
            exclude_content: Vec::new(),
            vary_allow_list: Vec::new(),
        }
    }
}

impl CompiledConfig {
    /// First regex in `timeouts` whose pattern matches `path` wins;
    /// otherwise `default_ttl`, falling back to the compiled-in 120s
    /// default.
    pub fn resolve_ttl(&self, path: &str) -> Duration {
        for rule in &self.timeouts {
            if rule.path.is_match(path) {
                return rule.ttl;
            }
        }
        self.default_ttl.unwrap_or(Duration::from_secs(120))
    }

    pub fn ttl_eviction_enabled(&self) -> bool {
        self.default_ttl.is_some()
    }
}

/// Wire-format (deserializable) rule, before regex compilation.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RawTimeoutRule {
    pub path: String,
    pub ttl_secs: u64,
}

/// Wire-format (deserializable) content-exclusion rule, before compilation.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RawExcludeContentRule {
    pub content_type: String,
    pub size: Option<u64>,
}

/// The YAML-shaped `cache.*` config surface. The YAML schema and its
/// process-level loading are an out-of-scope collaborator concern; this
/// struct is what a collaborator hands the engine after parsing.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RawConfig {
    pub cluster_label: Option<String>,
    pub x_header: Option<bool>,
    pub x_header_name: Option<String>,
    /// Duration string; `"-1"` disables TTL eviction.
    pub default_ttl: Option<String>,
    #[serde(default)]
    pub timeouts: Vec<RawTimeoutRule>,
    #[serde(default)]
    pub exclude_paths: Vec<String>,
    #[serde(default)]
    pub exclude_headers: Vec<ExcludeHeaderRule>,
    #[serde(default)]
    pub exclude_content: Vec<RawExcludeContentRule>,
    #[serde(default)]
    pub vary_allow_list: Vec<String>,
}

impl RawConfig {
    /// Compile every regex once; an invalid pattern is logged at error level
    /// and dropped rather than failing the whole configuration load.
    pub fn compile(&self) -> CompiledConfig {
        let mut timeouts = Vec::with_capacity(self.timeouts.len());
        for rule in &self.timeouts {
            match Regex::new(&rule.path) {
                Ok(path) => timeouts.push(TimeoutRule { path, ttl: Duration::from_secs(rule.ttl_secs) }),
                Err(err) => tracing::error!(pattern = %rule.path, error = %err, "skipping invalid timeout pattern"),
            }
        }

        let mut exclude_paths = Vec::with_capacity(self.exclude_paths.len());
        for pattern in &self.exclude_paths {
            match Regex::new(pattern) {
                Ok(re) => exclude_paths.push(re),
                Err(err) => tracing::error!(pattern, error = %err, "skipping invalid exclude-path pattern"),
            }
        }

        let mut exclude_content = Vec::with_capacity(self.exclude_content.len());
        for rule in &self.exclude_content {
            match Regex::new(&rule.content_type) {
                Ok(content_type) => {
                    exclude_content.push(ExcludeContentRule { content_type, size: rule.size })
                }
                Err(err) => tracing::error!(
                    pattern = %rule.content_type,
                    error = %err,
                    "skipping invalid exclude-content pattern"
                ),
            }
        }

        let default_ttl = match self.default_ttl.as_deref() {
            Some("-1") => None,
            Some(s) => s.parse::<u64>().ok().map(Duration::from_secs).or(Some(Duration::from_secs(120))),
            None => Some(Duration::from_secs(120)),
        };

        CompiledConfig {
            cluster_label: self.cluster_label.clone().unwrap_or_else(|| "kache-".to_string()),
            x_header: self.x_header.unwrap_or(true),
            x_header_name: self.x_header_name.clone().unwrap_or_else(|| "X-Kache".to_string()),
            default_ttl,
            timeouts,
            exclude_paths,
            exclude_headers: self.exclude_headers.clone(),
            exclude_content,
            vary_allow_list: self.vary_allow_list.clone(),
        }
    }
}

/// Atomically-swappable holder for a [`CompiledConfig`] generation.
pub struct KacheConfig {
    current: ArcSwap<CompiledConfig>,
}

impl KacheConfig {
    pub fn new(config: CompiledConfig) -> Self {
        Self { current: ArcSwap::from_pointee(config) }
    }

    /// The pointer readers should capture once per operation.
    pub fn current(&self) -> Arc<CompiledConfig> {
        self.current.load_full()
    }

    /// Sequentially-consistent swap: once this returns, every subsequent
    /// `current()` observes the new configuration.
    pub fn update(&self, config: CompiledConfig) {
        self.current.store(Arc::new(config));
    }
}

impl Default for KacheConfig {
    fn default() -> Self {
        Self::new(CompiledConfig::default())
    }
}
