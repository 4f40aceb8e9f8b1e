//! Configuration resolution for ccfleet.
//!
//! Implements hierarchical config resolution:
//! 1. Built-in defaults
//! 2. Global config (~/.config/ccfleet/settings.json)
//! 3. Project config (.ccfleet/settings.json)
//! 4. Environment variables
//! 5. CLI arguments (highest priority, applied by the daemon binary)

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};

use crate::classify::ClassifierRule;
use crate::error::{Error, Result};

/// Complete ccfleet configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub daemon: DaemonConfig,
    #[serde(default)]
    pub monitor: MonitorSettings,
    #[serde(default)]
    pub worktree: WorktreeSettings,
    #[serde(default)]
    pub registry: RegistrySettings,
}

/// Daemon-specific configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    pub addr: String,
    pub database_path: Option<PathBuf>,
    pub log_level: String,
    /// Agent executable started inside every instance's terminal.
    pub agent_bin: PathBuf,
    /// Extra arguments passed before the instruction of a child instance.
    pub agent_args: Vec<String>,
    /// Shell for operator terminals; `$SHELL` when unset.
    pub shell: Option<String>,
    /// Quota applied to projects created without an explicit limit.
    pub default_max_parallelism: u32,
    pub terminate_timeout_secs: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:4870".to_string(),
            database_path: None,
            log_level: "info".to_string(),
            agent_bin: PathBuf::from("claude"),
            agent_args: Vec::new(),
            shell: None,
            default_max_parallelism: 3,
            terminate_timeout_secs: 5,
        }
    }
}

/// Output monitor tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorSettings {
    pub check_interval_ms: u64,
    pub idle_threshold_ms: u64,
    /// Characters of cleaned output retained per instance.
    pub buffer_chars: usize,
    pub history_limit: usize,
    /// Rules evaluated before the built-in ones.
    pub rules: Vec<ClassifierRule>,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            check_interval_ms: 500,
            idle_threshold_ms: 3000,
            buffer_chars: 10_000,
            history_limit: 100,
            rules: Vec::new(),
        }
    }
}

/// Where worktrees are placed on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum WorktreeLayoutKind {
    /// `<base_dir>/<repo_name>/<name>`
    #[default]
    Global,
    /// `<repo>/<local_subfolder>/<name>`
    Local,
}

/// Worktree placement and provisioning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorktreeSettings {
    pub layout: WorktreeLayoutKind,
    pub base_dir: Option<PathBuf>,
    pub local_subfolder: PathBuf,
    /// Shell command run inside each new worktree. Must come from trusted config.
    pub setup_script: Option<String>,
}

impl Default for WorktreeSettings {
    fn default() -> Self {
        Self {
            layout: WorktreeLayoutKind::Global,
            base_dir: None,
            local_subfolder: PathBuf::from(".worktrees"),
            setup_script: None,
        }
    }
}

/// Registry maintenance.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistrySettings {
    pub stale_after_minutes: u64,
    pub cleanup_after_hours: u64,
    pub maintenance_interval_secs: u64,
    /// Force-terminate stale instances instead of only reporting them.
    pub reap_stale: bool,
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self {
            stale_after_minutes: 30,
            cleanup_after_hours: 24,
            maintenance_interval_secs: 300,
            reap_stale: false,
        }
    }
}

/// Load configuration with hierarchical resolution.
///
/// Each file is a partial layer: only the keys it sets replace the layers
/// below it.
pub fn load_config(project_dir: Option<&Path>) -> Result<Config> {
    let mut layers = Value::Object(Map::new());

    if let Some(global_path) = global_config_path()
        && global_path.exists()
    {
        merge_layer(&mut layers, read_layer(&global_path)?);
    }

    if let Some(dir) = project_dir {
        let project_path = dir.join(".ccfleet").join("settings.json");
        if project_path.exists() {
            merge_layer(&mut layers, read_layer(&project_path)?);
        }
    }

    let mut config: Config = serde_json::from_value(layers)
        .map_err(|e| Error::Config(format!("Invalid settings: {e}")))?;
    apply_env_overrides(&mut config, |key| std::env::var(key).ok());

    Ok(config)
}

/// Get the global config file path.
pub fn global_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("ccfleet").join("settings.json"))
}

fn read_layer(path: &Path) -> Result<Value> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
    })?;
    let layer: Value = serde_json::from_str(&content)
        .map_err(|e| Error::Config(format!("Failed to parse config file {}: {e}", path.display())))?;
    if !layer.is_object() {
        return Err(Error::Config(format!(
            "Config file {} must contain a JSON object",
            path.display()
        )));
    }
    Ok(layer)
}

/// Parse a settings document; missing sections and fields take defaults.
pub fn parse_config(content: &str) -> Result<Config> {
    Ok(serde_json::from_str(content)?)
}

/// Deep-merge `overlay` into `base`. Objects merge key by key, scalars and
/// arrays replace, except classifier `rules`, where the overlay's rules go
/// in front of the base's.
fn merge_layer(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Object(base), Value::Object(overlay)) => {
            for (key, value) in overlay {
                match (base.get_mut(&key), value) {
                    (Some(Value::Array(existing)), Value::Array(mut rules)) if key == "rules" => {
                        rules.append(existing);
                        *existing = rules;
                    }
                    (Some(existing), value) => merge_layer(existing, value),
                    (None, value) => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}

fn apply_env_overrides(config: &mut Config, var: impl Fn(&str) -> Option<String>) {
    if let Some(val) = var("CCFLEET_ADDR") {
        config.daemon.addr = val;
    }
    if let Some(val) = var("CCFLEET_LOG_LEVEL") {
        config.daemon.log_level = val;
    }
    if let Some(val) = var("CCFLEET_AGENT_BIN") {
        config.daemon.agent_bin = PathBuf::from(val);
    }
    if let Some(val) = var("CCFLEET_SHELL") {
        config.daemon.shell = Some(val);
    }
    if let Some(n) = var("CCFLEET_MAX_PARALLELISM").and_then(|v| v.parse().ok()) {
        config.daemon.default_max_parallelism = n;
    }
    if let Some(n) = var("CCFLEET_IDLE_THRESHOLD_MS").and_then(|v| v.parse().ok()) {
        config.monitor.idle_threshold_ms = n;
    }
    if let Some(val) = var("CCFLEET_WORKTREE_DIR") {
        config.worktree.base_dir = Some(PathBuf::from(val));
    }
    if let Some(n) = var("CCFLEET_STALE_AFTER_MINUTES").and_then(|v| v.parse().ok()) {
        config.registry.stale_after_minutes = n;
    }
}
