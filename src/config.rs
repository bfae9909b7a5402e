//! Configuration
//!
//! CLI argument parsing with environment variable support, plus the persisted
//! `config.json`. User config is merged against the built-in schema: missing
//! keys get schema defaults, unrecognised keys are moved under a `deprecated`
//! bucket and kept across saves so nothing the operator wrote is ever lost.

use anyhow::{anyhow, Result};
use clap::Parser;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fs;
use std::path::{Path, PathBuf};

use crate::logger::log;
use crate::store::restrict_file_mode;

/// Placeholder values shipped in the example config. Running with these is a
/// misconfiguration worth shouting about.
pub const INSECURE_AUTH_TOKEN: &str = "CHANGE_ME_TOKEN";
pub const INSECURE_ADMIN_PASSWORD: &str = "CHANGE_ME_ADMIN";

/// CLI arguments for the FireFrp management server
///
/// Supports environment variables with FIREFRP_ prefix
#[derive(Parser, Debug, Clone)]
#[command(author, version, about = "FireFrp tunnel management server")]
pub struct CliArgs {
    /// Root directory holding config.json, data/ and bin/
    #[arg(long, env = "FIREFRP_ROOT_DIR", default_value = ".")]
    pub root_dir: PathBuf,

    /// Log mode: trace, debug, info, warn, error
    #[arg(long, env = "FIREFRP_LOG_MODE", default_value = "info")]
    pub log_mode: String,

    /// Run the self-update flow and exit
    #[arg(long, default_value_t = false)]
    pub update: bool,
}

impl CliArgs {
    pub fn parse_args() -> Self {
        Self::parse()
    }

    pub fn config_path(&self) -> PathBuf {
        self.root_dir.join("config.json")
    }

    pub fn data_dir(&self) -> PathBuf {
        self.root_dir.join("data")
    }

    pub fn bin_dir(&self) -> PathBuf {
        self.root_dir.join("bin")
    }
}

/// Node identity returned by server-info.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerIdentity {
    pub id: String,
    pub name: String,
    pub public_addr: String,
    pub description: String,
}

impl Default for ServerIdentity {
    fn default() -> Self {
        Self {
            id: "firefrp-1".to_string(),
            name: "FireFrp Node".to_string(),
            public_addr: "127.0.0.1".to_string(),
            description: String::new(),
        }
    }
}

/// Tunables for the supervised frps subprocess.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct FrpsConfig {
    pub bind_addr: String,
    pub bind_port: u16,
    pub auth_token: String,
    pub admin_addr: String,
    pub admin_port: u16,
    pub admin_user: String,
    pub admin_password: String,
}

impl Default for FrpsConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0".to_string(),
            bind_port: 7000,
            auth_token: INSECURE_AUTH_TOKEN.to_string(),
            admin_addr: "127.0.0.1".to_string(),
            admin_port: 7500,
            admin_user: "admin".to_string(),
            admin_password: INSECURE_ADMIN_PASSWORD.to_string(),
        }
    }
}

/// Update channel selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum UpdateChannel {
    #[default]
    Auto,
    Dev,
    Stable,
}

impl UpdateChannel {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "auto" => Some(UpdateChannel::Auto),
            "dev" => Some(UpdateChannel::Dev),
            "stable" => Some(UpdateChannel::Stable),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            UpdateChannel::Auto => "auto",
            UpdateChannel::Dev => "dev",
            UpdateChannel::Stable => "stable",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct UpdatesConfig {
    pub channel: UpdateChannel,
    pub github_token: String,
}

/// Chat transport settings and the command ACL.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct BotConfig {
    pub ws_url: String,
    pub token: String,
    pub self_id: Option<String>,
    pub broadcast_groups: Vec<String>,
    pub admin_users: Vec<String>,
    pub allowed_groups: Vec<String>,
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            ws_url: "ws://127.0.0.1:6700".to_string(),
            token: String::new(),
            self_id: None,
            broadcast_groups: Vec::new(),
            admin_users: Vec::new(),
            allowed_groups: Vec::new(),
        }
    }
}

/// Full configuration schema, shape of `config.json`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    pub server_port: u16,
    pub frp_version: String,
    pub server: ServerIdentity,
    pub frps: FrpsConfig,
    pub port_range_start: u16,
    pub port_range_end: u16,
    pub key_ttl_minutes: i64,
    pub key_prefix: String,
    pub updates: UpdatesConfig,
    pub bot: BotConfig,
    /// Keys the schema no longer recognises, preserved verbatim.
    #[serde(skip_serializing_if = "Map::is_empty")]
    pub deprecated: Map<String, Value>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_port: 9001,
            frp_version: "0.67.0".to_string(),
            server: ServerIdentity::default(),
            frps: FrpsConfig::default(),
            port_range_start: 20000,
            port_range_end: 25000,
            key_ttl_minutes: 120,
            key_prefix: "ff-".to_string(),
            updates: UpdatesConfig::default(),
            bot: BotConfig::default(),
            deprecated: Map::new(),
        }
    }
}

impl Config {
    /// Load config from `path`, merging against the schema. Creates the file
    /// with defaults if it is missing.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            let config = Config::default();
            config.save(path)?;
            log::info!(path = %path.display(), "Config created with defaults");
            return Ok(config);
        }

        let content = fs::read_to_string(path)
            .map_err(|e| anyhow!("read {}: {}", path.display(), e))?;
        let raw: Value = serde_json::from_str(&content)
            .map_err(|e| anyhow!("parse {}: {}", path.display(), e))?;

        let (known, unknown) = split_unknown_keys(raw);
        let mut config: Config = serde_json::from_value(Value::Object(known))
            .map_err(|e| anyhow!("config shape: {}", e))?;

        if !unknown.is_empty() {
            log::warn!(
                keys = %unknown.keys().cloned().collect::<Vec<_>>().join(", "),
                "Unrecognised config keys moved to 'deprecated'"
            );
            config.deprecated.extend(unknown);
            config.save(path)?;
        }

        config.warn_insecure_defaults();
        Ok(config)
    }

    /// Persist the config, preserving the deprecated bucket. Atomic write.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let tmp = path.with_extension("json.tmp");
        let content = serde_json::to_string_pretty(self)?;
        fs::write(&tmp, content)?;
        restrict_file_mode(&tmp).map_err(|e| anyhow!("chmod {}: {}", tmp.display(), e))?;
        if let Err(e) = fs::rename(&tmp, path) {
            let _ = fs::remove_file(&tmp);
            return Err(anyhow!("rename {} -> {}: {}", tmp.display(), path.display(), e));
        }
        Ok(())
    }

    /// Emit warnings when security-sensitive values are still placeholders.
    pub fn warn_insecure_defaults(&self) {
        if self.frps.auth_token == INSECURE_AUTH_TOKEN {
            log::warn!("frps.authToken is the insecure placeholder, set a real token");
        }
        if self.frps.admin_password == INSECURE_ADMIN_PASSWORD {
            log::warn!("frps.adminPassword is the insecure placeholder, set a real password");
        }
    }

    /// Number of ports in the inclusive pool.
    pub fn port_range_size(&self) -> usize {
        if self.port_range_end < self.port_range_start {
            return 0;
        }
        (self.port_range_end - self.port_range_start) as usize + 1
    }

    pub fn validate(&self) -> Result<()> {
        if self.port_range_size() == 0 {
            return Err(anyhow!(
                "portRangeEnd ({}) must be >= portRangeStart ({})",
                self.port_range_end,
                self.port_range_start
            ));
        }
        if self.key_ttl_minutes < 5 {
            return Err(anyhow!("keyTtlMinutes must be at least 5"));
        }
        if self.frp_version.is_empty() {
            return Err(anyhow!("frpVersion is required"));
        }
        Ok(())
    }
}

/// Split a raw config object into schema-known keys and unknown keys.
/// Unknown keys inside known sub-objects are collected with a dotted path.
fn split_unknown_keys(raw: Value) -> (Map<String, Value>, Map<String, Value>) {
    const TOP_LEVEL: &[&str] = &[
        "serverPort",
        "frpVersion",
        "server",
        "frps",
        "portRangeStart",
        "portRangeEnd",
        "keyTtlMinutes",
        "keyPrefix",
        "updates",
        "bot",
        "deprecated",
    ];
    const NESTED: &[(&str, &[&str])] = &[
        ("server", &["id", "name", "publicAddr", "description"]),
        (
            "frps",
            &[
                "bindAddr",
                "bindPort",
                "authToken",
                "adminAddr",
                "adminPort",
                "adminUser",
                "adminPassword",
            ],
        ),
        ("updates", &["channel", "githubToken"]),
        (
            "bot",
            &[
                "wsUrl",
                "token",
                "selfId",
                "broadcastGroups",
                "adminUsers",
                "allowedGroups",
            ],
        ),
    ];

    let Value::Object(raw) = raw else {
        return (Map::new(), Map::new());
    };

    let mut known = Map::new();
    let mut unknown = Map::new();

    for (key, value) in raw {
        if !TOP_LEVEL.contains(&key.as_str()) {
            unknown.insert(key, value);
            continue;
        }
        if let Some((_, fields)) = NESTED.iter().find(|(name, _)| *name == key) {
            if let Value::Object(nested) = value {
                let mut kept = Map::new();
                for (sub_key, sub_value) in nested {
                    if fields.contains(&sub_key.as_str()) {
                        kept.insert(sub_key, sub_value);
                    } else {
                        unknown.insert(format!("{}.{}", key, sub_key), sub_value);
                    }
                }
                known.insert(key, Value::Object(kept));
            } else {
                // wrong shape, let serde defaults take over
                unknown.insert(key, value);
            }
            continue;
        }
        known.insert(key, value);
    }

    (known, unknown)
}
