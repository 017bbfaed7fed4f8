//! Config Store: loads the allowlist rule file and publishes immutable
//! snapshots that in-flight requests hold onto across reloads.

use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read rules file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse rules file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid mode {0:?}, expected \"monitor\", \"enforce\", or \"allow-all\"")]
    InvalidMode(String),
    #[error("rule {index} has an empty host")]
    EmptyHost { index: usize },
    #[error("rule {index} path {path:?} does not start with '/'")]
    InvalidPath { index: usize, path: String },
}

/// Proxy mode. `AllowAll` is a fixed alias: no rules are consulted and
/// nothing is ever blocked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Monitor,
    Enforce,
    AllowAll,
}

impl Mode {
    fn parse(raw: &str) -> Result<Self, ConfigError> {
        match raw {
            "monitor" => Ok(Mode::Monitor),
            "enforce" => Ok(Mode::Enforce),
            "allow-all" => Ok(Mode::AllowAll),
            other => Err(ConfigError::InvalidMode(other.to_string())),
        }
    }
}

/// One allowlist entry. Matches a request host `H` when `H == host` or `H`
/// ends with `"." + host` (suffix on a DNS label boundary).
#[derive(Debug, Clone)]
pub struct HostRule {
    pub host: String,
    pub allowed_paths: Vec<String>,
}

impl HostRule {
    pub fn matches_host(&self, host: &str) -> bool {
        let host = host.to_ascii_lowercase();
        let rule_host = self.host.to_ascii_lowercase();
        host == rule_host || host.ends_with(&format!(".{rule_host}"))
    }

    pub fn matches_path(&self, path: &str) -> Option<&str> {
        self.allowed_paths
            .iter()
            .find(|prefix| path.starts_with(prefix.as_str()))
            .map(|s| s.as_str())
    }
}

/// An immutable snapshot of the active rule set. Cloning is cheap (`Arc`
/// internally via [`ConfigStore::current`]); readers never observe a torn
/// read across a reload.
#[derive(Debug, Clone)]
pub struct RuleSet {
    pub mode: Mode,
    pub rules: Vec<HostRule>,
}

impl RuleSet {
    pub fn default_monitor() -> Self {
        Self {
            mode: Mode::Monitor,
            rules: Vec::new(),
        }
    }

    fn find_rule(&self, host: &str) -> Option<&HostRule> {
        self.rules.iter().find(|rule| rule.matches_host(host))
    }
}

#[derive(Debug, Deserialize)]
struct RawRuleSet {
    mode: String,
    #[serde(default)]
    allowed_rules: Vec<RawHostRule>,
}

#[derive(Debug, Deserialize)]
struct RawHostRule {
    host: String,
    #[serde(default)]
    allowed_paths: Vec<String>,
}

fn validate(raw: RawRuleSet) -> Result<RuleSet, ConfigError> {
    let mode = Mode::parse(&raw.mode)?;
    let mut rules = Vec::with_capacity(raw.allowed_rules.len());
    for (index, rule) in raw.allowed_rules.into_iter().enumerate() {
        if rule.host.is_empty() {
            return Err(ConfigError::EmptyHost { index });
        }
        for path in &rule.allowed_paths {
            if !path.starts_with('/') {
                return Err(ConfigError::InvalidPath {
                    index,
                    path: path.clone(),
                });
            }
        }
        rules.push(HostRule {
            host: rule.host,
            allowed_paths: rule.allowed_paths,
        });
    }
    Ok(RuleSet { mode, rules })
}

/// Holds the active [`RuleSet`] behind an atomically-swapped `Arc`. `load`
/// is blocking (startup + reload signal); `current` is a cheap, lock-free
/// (well, read-lock) snapshot read used by every request.
pub struct ConfigStore {
    path: PathBuf,
    snapshot: RwLock<Arc<RuleSet>>,
}

impl ConfigStore {
    /// Loads `path` for the first time. A missing or invalid file on first
    /// load yields the built-in default (Monitor, no rules) rather than
    /// failing startup — config errors are never fatal.
    pub fn load_initial(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().to_path_buf();
        let snapshot = match Self::read(&path) {
            Ok(rules) => {
                tracing::info!(mode = ?rules.mode, rule_count = rules.rules.len(), "loaded rules");
                rules
            }
            Err(err) => {
                tracing::warn!(%err, "failed to load rules on first start, using Monitor/empty default");
                RuleSet::default_monitor()
            }
        };
        Self {
            path,
            snapshot: RwLock::new(Arc::new(snapshot)),
        }
    }

    /// Re-reads the rules file and swaps the snapshot atomically. On
    /// failure the previous snapshot is retained — a reload never leaves
    /// the store in a partial state.
    pub fn reload(&self) -> Result<(), ConfigError> {
        match Self::read(&self.path) {
            Ok(rules) => {
                tracing::info!(mode = ?rules.mode, rule_count = rules.rules.len(), "reloaded rules");
                let mut guard = self.snapshot.write().unwrap();
                *guard = Arc::new(rules);
                Ok(())
            }
            Err(err) => {
                tracing::warn!(%err, "rule reload failed, keeping previous snapshot");
                Err(err)
            }
        }
    }

    /// Non-blocking snapshot read. The returned `Arc` is stable for the
    /// lifetime of the request even if a reload completes concurrently.
    pub fn current(&self) -> Arc<RuleSet> {
        self.snapshot.read().unwrap().clone()
    }

    fn read(path: &Path) -> Result<RuleSet, ConfigError> {
        let data = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let raw: RawRuleSet = serde_json::from_str(&data).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        validate(raw)
    }
}

/// Outcome of rule evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Allow { reason: String },
    Block { reason: String },
}

impl Decision {
    pub fn is_allow(&self) -> bool {
        matches!(self, Decision::Allow { .. })
    }

    pub fn reason(&self) -> &str {
        match self {
            Decision::Allow { reason } | Decision::Block { reason } => reason,
        }
    }
}

/// Given `(host, path, snapshot)`, decide whether the request is allowed.
/// Matching is deterministic: first rule (by declaration order) wins.
pub fn evaluate(host: &str, path: &str, snapshot: &RuleSet) -> Decision {
    if snapshot.mode == Mode::Monitor || snapshot.mode == Mode::AllowAll {
        return Decision::Allow {
            reason: "Monitor Mode".to_string(),
        };
    }

    let Some(rule) = snapshot.find_rule(host) else {
        return Decision::Block {
            reason: "Host Not Allowed".to_string(),
        };
    };

    if rule.allowed_paths.is_empty() {
        return Decision::Allow {
            reason: "Host Match".to_string(),
        };
    }

    if rule.matches_path(path).is_some() {
        return Decision::Allow {
            reason: "Path Match".to_string(),
        };
    }

    Decision::Block {
        reason: format!(
            "Path Not Allowed: [{}]",
            rule.allowed_paths
                .iter()
                .map(|p| format!("\"{p}\""))
                .collect::<Vec<_>>()
                .join(",")
        ),
    }
}
