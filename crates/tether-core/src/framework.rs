//! Registered runner frameworks.
//!
//! A framework is a class of runner workload: an image, a launch contract,
//! resource ceilings, and a default deadline. Sessions select one by
//! `spec.framework.{type,version}`; admission rejects unregistered types.
//!
//! Framework config is opaque JSON on the Session but is parsed through a
//! strict per-framework schema at workload build time; unknown keys are
//! retained verbatim and never interpreted.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

/// Default wall-clock deadline when neither the session config nor the
/// framework entry supplies one.
pub const DEFAULT_SESSION_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Container resource requests/limits for a framework.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceProfile {
    /// CPU request in millicores.
    pub cpu_request_millis: u32,
    /// CPU limit in millicores.
    pub cpu_limit_millis: u32,
    /// Memory request in mebibytes.
    pub memory_request_mib: u32,
    /// Memory limit in mebibytes.
    pub memory_limit_mib: u32,
}

impl Default for ResourceProfile {
    fn default() -> Self {
        Self {
            cpu_request_millis: 500,
            cpu_limit_millis: 2000,
            memory_request_mib: 512,
            memory_limit_mib: 2048,
        }
    }
}

/// One registered framework.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FrameworkEntry {
    /// Framework type id, e.g. `claude-code`.
    pub framework_type: String,
    /// Image repository without tag; the session's version becomes the tag.
    pub image: String,
    /// Resource ceilings.
    #[serde(default)]
    pub resources: ResourceProfile,
    /// Default deadline in seconds when the session config has none.
    pub default_timeout_secs: u64,
    /// Whether the runner needs a writable root filesystem.
    #[serde(default)]
    pub writable_rootfs: bool,
    /// Seconds the finished workload is retained before orchestrator TTL
    /// cleanup.
    #[serde(default = "default_ttl_after_finished")]
    pub ttl_after_finished_secs: u64,
}

const fn default_ttl_after_finished() -> u64 {
    3600
}

impl FrameworkEntry {
    /// Full image reference for a version tag.
    #[must_use]
    pub fn image_for(&self, version: &str) -> String {
        format!("{}:{}", self.image, version)
    }
}

/// Framework config fields the control plane understands.
///
/// Parsed strictly from the opaque session config; fields outside this
/// schema are retained on the session but ignored here.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParsedFrameworkConfig {
    /// Model the agent should use.
    #[serde(default)]
    pub model: Option<String>,
    /// Wall-clock deadline in seconds.
    #[serde(default)]
    pub timeout: Option<u64>,
    /// Maximum agent turns.
    #[serde(default)]
    pub max_turns: Option<u32>,
}

impl ParsedFrameworkConfig {
    /// Parses the understood subset out of an opaque config value.
    ///
    /// # Errors
    ///
    /// Returns `ShapeInvalid` when a known field has the wrong type; an
    /// absent or null config parses to defaults.
    pub fn from_value(config: &Value) -> Result<Self> {
        if config.is_null() {
            return Ok(Self::default());
        }
        serde_json::from_value(pick_known(config))
            .map_err(|e| Error::shape("FrameworkConfig", e.to_string()))
    }
}

fn pick_known(config: &Value) -> Value {
    let Value::Object(map) = config else {
        return Value::Object(serde_json::Map::new());
    };
    let mut known = serde_json::Map::new();
    for key in ["model", "timeout", "maxTurns"] {
        if let Some(v) = map.get(key) {
            known.insert(key.to_string(), v.clone());
        }
    }
    Value::Object(known)
}

/// The set of frameworks sessions may select.
#[derive(Debug, Clone, Default)]
pub struct FrameworkRegistry {
    entries: HashMap<String, FrameworkEntry>,
}

impl FrameworkRegistry {
    /// An empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The built-in registry shipped with the control plane.
    #[must_use]
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry.register(FrameworkEntry {
            framework_type: "claude-code".into(),
            image: "tether-platform/claude-code-runner".into(),
            resources: ResourceProfile::default(),
            default_timeout_secs: 30 * 60,
            writable_rootfs: true,
            ttl_after_finished_secs: 3600,
        });
        registry.register(FrameworkEntry {
            framework_type: "custom-python".into(),
            image: "tether-platform/python-runner".into(),
            resources: ResourceProfile::default(),
            default_timeout_secs: 15 * 60,
            writable_rootfs: false,
            ttl_after_finished_secs: 3600,
        });
        registry.register(FrameworkEntry {
            framework_type: "bash-runner".into(),
            image: "tether-platform/bash-runner".into(),
            resources: ResourceProfile {
                cpu_request_millis: 250,
                cpu_limit_millis: 1000,
                memory_request_mib: 256,
                memory_limit_mib: 1024,
            },
            default_timeout_secs: 10 * 60,
            writable_rootfs: false,
            ttl_after_finished_secs: 1800,
        });
        registry
    }

    /// Registers or replaces a framework entry.
    pub fn register(&mut self, entry: FrameworkEntry) {
        self.entries.insert(entry.framework_type.clone(), entry);
    }

    /// Looks up a framework by type id.
    #[must_use]
    pub fn get(&self, framework_type: &str) -> Option<&FrameworkEntry> {
        self.entries.get(framework_type)
    }

    /// Whether a type id is registered.
    #[must_use]
    pub fn contains(&self, framework_type: &str) -> bool {
        self.entries.contains_key(framework_type)
    }

    /// Registered type ids, sorted for stable error messages.
    #[must_use]
    pub fn type_ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.entries.keys().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }

    /// Effective deadline for a session config against an entry.
    #[must_use]
    pub fn effective_timeout(entry: &FrameworkEntry, config: &ParsedFrameworkConfig) -> Duration {
        config
            .timeout
            .map(Duration::from_secs)
            .unwrap_or_else(|| Duration::from_secs(entry.default_timeout_secs))
    }
}
