use std::path::PathBuf;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::info;

use crate::engine::Engine;
use crate::limits::*;
use crate::model::Ms;
use crate::notify::NotifyHub;
use crate::sweeper::{self, SweepConfig};

#[derive(Debug, Clone, Copy)]
pub struct TenantConfig {
    pub compact_threshold: u64,
    pub sweep: SweepConfig,
    pub reservation_grace_ms: Ms,
}

impl Default for TenantConfig {
    fn default() -> Self {
        Self {
            compact_threshold: 1000,
            sweep: SweepConfig::default(),
            reservation_grace_ms: DEFAULT_RESERVATION_GRACE_MS,
        }
    }
}

/// Per-operator engines. Each tenant gets its own Engine, WAL, sweeper and
/// compactor, created on first use.
pub struct TenantManager {
    engines: DashMap<String, Arc<Engine>>,
    data_dir: PathBuf,
    config: TenantConfig,
}

impl TenantManager {
    pub fn new(data_dir: PathBuf, config: TenantConfig) -> Self {
        Self {
            engines: DashMap::new(),
            data_dir,
            config,
        }
    }

    pub fn get_or_create(&self, tenant: &str) -> std::io::Result<Arc<Engine>> {
        if let Some(engine) = self.engines.get(tenant) {
            return Ok(engine.value().clone());
        }
        if tenant.len() > MAX_TENANT_NAME_LEN {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "tenant name too long",
            ));
        }
        if self.engines.len() >= MAX_TENANTS {
            return Err(std::io::Error::other("too many tenants"));
        }

        // The name becomes a file name.
        let safe_name: String = tenant
            .chars()
            .filter(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '-')
            .collect();
        if safe_name.is_empty() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "empty tenant name",
            ));
        }

        // Two connections may race to create the same tenant; the entry lock
        // makes sure only one engine (and one WAL writer) is ever built.
        let entry = self.engines.entry(tenant.to_string());
        let engine = match entry {
            Entry::Occupied(e) => return Ok(e.get().clone()),
            Entry::Vacant(v) => {
                let wal_path = self.data_dir.join(format!("{safe_name}.wal"));
                let notify = Arc::new(NotifyHub::new());
                let engine = Arc::new(Engine::new(wal_path, notify, self.config.reservation_grace_ms)?);
                v.insert(engine.clone());
                engine
            }
        };

        tokio::spawn(sweeper::run_sweeper(engine.clone(), self.config.sweep));
        tokio::spawn(sweeper::run_compactor(engine.clone(), self.config.compact_threshold));

        info!(tenant = %safe_name, "tenant loaded");
        metrics::gauge!(crate::observability::TENANTS_ACTIVE).set(self.engines.len() as f64);
        Ok(engine)
    }
}
