//! Composite single-writer state and side-effect hooks
//!
//! All mutable control-plane state lives in [`CoreState`], guarded by one
//! `tokio::sync::Mutex` at the application root. Handlers take the lock for
//! state decisions, release it, and only then perform network side effects
//! through the [`Notifier`] seam — which also keeps the plugin handler from
//! depending on the bot transport directly.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::path::PathBuf;

use crate::config::Config;
use crate::core::allocator::PortAllocator;
use crate::core::credential::{AuditEntry, Credential};
use crate::core::reject::RejectSet;
use crate::error::Result;
use crate::store::Collection;

/// Payload for tunnel lifecycle group notifications.
#[derive(Debug, Clone)]
pub struct TunnelNotice {
    pub tunnel_id: String,
    pub group_id: String,
    pub user_id: String,
    pub user_name: String,
    /// `publicAddr:remotePort`
    pub endpoint: String,
    pub game_name: String,
}

/// Side-effect sink for tunnel lifecycle events.
///
/// The plugin handler and expiry scheduler enqueue through this trait after
/// releasing the state lock; the bot transport is the production impl.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn tunnel_connected(&self, notice: TunnelNotice);
    async fn tunnel_disconnected(&self, notice: TunnelNotice);
    /// Free-form group message (MOTD probe results and the like).
    async fn group_message(&self, group_id: &str, text: &str);
}

/// Notifier that drops everything. Used when the bot is not configured and in
/// tests.
pub struct NoopNotifier;

#[async_trait]
impl Notifier for NoopNotifier {
    async fn tunnel_connected(&self, _notice: TunnelNotice) {}
    async fn tunnel_disconnected(&self, _notice: TunnelNotice) {}
    async fn group_message(&self, _group_id: &str, _text: &str) {}
}

/// Everything the single state mutex guards.
pub struct CoreState {
    pub keys: Collection<Credential>,
    pub audit: Collection<AuditEntry>,
    pub config: Config,
    pub config_path: PathBuf,
    pub reject: RejectSet,
    pub allocator: PortAllocator,
    /// Rolling log of successful `open` commands per group, for the
    /// per-group hourly rate cap.
    pub group_open_log: HashMap<String, Vec<DateTime<Utc>>>,
}

impl CoreState {
    /// Load stores from the data directory and assemble the state.
    pub fn load(config: Config, config_path: PathBuf, data_dir: &std::path::Path) -> Result<Self> {
        let keys = Collection::load(data_dir.join("access_keys.json"))?;
        let audit = Collection::load(data_dir.join("audit_log.json"))?;
        let allocator = PortAllocator::new(config.port_range_start, config.port_range_end);
        Ok(Self {
            keys,
            audit,
            config,
            config_path,
            reject: RejectSet::new(),
            allocator,
            group_open_log: HashMap::new(),
        })
    }

    #[cfg(test)]
    pub fn for_tests(config: Config, dir: &std::path::Path) -> Self {
        let keys = Collection::load(dir.join("access_keys.json")).unwrap();
        let audit = Collection::load(dir.join("audit_log.json")).unwrap();
        let allocator = PortAllocator::new(config.port_range_start, config.port_range_end);
        Self {
            keys,
            audit,
            config,
            config_path: dir.join("config.json"),
            reject: RejectSet::new(),
            allocator,
            group_open_log: HashMap::new(),
        }
    }

    /// Persist the current config, used by admin commands that mutate it.
    pub fn save_config(&self) -> anyhow::Result<()> {
        self.config.save(&self.config_path)
    }

    /// The address clients should dial, `publicAddr:port`.
    pub fn public_endpoint(&self, port: u16) -> String {
        format!("{}:{}", self.config.server.public_addr, port)
    }
}
