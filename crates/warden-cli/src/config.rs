//! Config file management for warden.
//!
//! Provides a TOML-based config file at `~/.config/warden/config.toml` and a
//! resolution chain: CLI flag > env var > config file > default. The file
//! mirrors the run command: a `[worker]` section saying what to launch,
//! `[node]` for the config forwarded to the node, `[supervisor]` for timing.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use warden_core::{NodeConfig, SupervisorSettings};

// -----------------------------------------------------------------------
// Config file types
// -----------------------------------------------------------------------

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigFile {
    pub worker: WorkerSection,
    pub node: NodeConfig,
    pub supervisor: SupervisorSettings,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerSection {
    /// Worker binary. Required here, on the command line, or via
    /// the WARDEN_WORKER env var.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub program: Option<PathBuf>,
    pub args: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<PathBuf>,
    pub env: HashMap<String, String>,
    pub mode: WorkerMode,
    /// Raw mode only: stdout line that marks the node ready.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ready_marker: Option<String>,
}

/// How the worker binary is driven.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum WorkerMode {
    /// JSON line protocol over stdin/stdout.
    #[default]
    Ipc,
    /// Plain node binary; readiness comes from a stdout marker.
    Raw,
}

// -----------------------------------------------------------------------
// Paths
// -----------------------------------------------------------------------

/// Return the warden config directory.
///
/// Always uses XDG layout: `$XDG_CONFIG_HOME/warden` or `~/.config/warden`.
/// We intentionally ignore the platform-specific `dirs::config_dir()`
/// (which returns `~/Library/Application Support` on macOS).
pub fn config_dir() -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        return PathBuf::from(xdg).join("warden");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config")
        .join("warden")
}

/// Return the default path to the warden config file.
pub fn default_config_path() -> PathBuf {
    config_dir().join("config.toml")
}

// -----------------------------------------------------------------------
// Read / write
// -----------------------------------------------------------------------

/// Load and parse a config file. Returns an error if it does not exist.
pub fn load_file(path: &Path) -> Result<ConfigFile> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file at {}", path.display()))?;
    let config: ConfigFile = toml::from_str(&contents)
        .with_context(|| format!("failed to parse config file at {}", path.display()))?;
    Ok(config)
}

/// Resolve which config file to use and load it. An explicitly named file
/// (flag or WARDEN_CONFIG) must exist; the default location is optional.
pub fn load_or_default(flag: Option<&Path>) -> Result<ConfigFile> {
    if let Some(path) = flag {
        return load_file(path);
    }
    if let Ok(path) = std::env::var("WARDEN_CONFIG") {
        return load_file(Path::new(&path));
    }

    let path = default_config_path();
    if path.exists() {
        load_file(&path)
    } else {
        Ok(ConfigFile::default())
    }
}

/// Serialize and write a config file, creating parent dirs as needed.
pub fn save_config(path: &Path, config: &ConfigFile) -> Result<()> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create config directory {}", dir.display()))?;
    }

    let contents = toml::to_string_pretty(config).context("failed to serialize config")?;
    std::fs::write(path, &contents)
        .with_context(|| format!("failed to write config file at {}", path.display()))?;
    Ok(())
}

// -----------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------
