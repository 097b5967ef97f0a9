use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tracing::info;

use crate::compactor;
use crate::engine::Engine;
use crate::limits::*;
use crate::notify::NotifyHub;
use crate::observability;

/// Per-tenant engines, created lazily. Each tenant has its own Engine, WAL
/// and compactor task. Tenant = database name from the pgwire connection.
pub struct TenantManager {
    engines: DashMap<String, Arc<Engine>>,
    data_dir: PathBuf,
    compact_threshold: u64,
    lock_timeout: Duration,
}

impl TenantManager {
    pub fn new(data_dir: PathBuf, compact_threshold: u64, lock_timeout: Duration) -> Self {
        Self {
            engines: DashMap::new(),
            data_dir,
            compact_threshold,
            lock_timeout,
        }
    }

    /// Get or lazily create the engine for `tenant`, replaying its WAL.
    pub fn get_or_create(&self, tenant: &str) -> io::Result<Arc<Engine>> {
        if let Some(engine) = self.engines.get(tenant) {
            return Ok(engine.value().clone());
        }
        if tenant.len() > MAX_TENANT_NAME_LEN {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "tenant name too long",
            ));
        }
        if self.engines.len() >= MAX_TENANTS {
            return Err(io::Error::other("too many tenants"));
        }

        // Only a safe subset of characters reaches the filesystem.
        let safe_name: String = tenant
            .chars()
            .filter(|c| c.is_alphanumeric() || *c == '_' || *c == '-')
            .collect();
        if safe_name.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "empty tenant name",
            ));
        }

        // Two first connections may race here; the entry API keeps exactly
        // one engine per tenant.
        let entry = self.engines.entry(tenant.to_string()).or_try_insert_with(|| {
            let wal_path = self.data_dir.join(format!("{safe_name}.wal"));
            let engine = Arc::new(
                Engine::new(wal_path, Arc::new(NotifyHub::new()))?
                    .with_lock_timeout(self.lock_timeout),
            );
            let compactor_engine = engine.clone();
            let threshold = self.compact_threshold;
            tokio::spawn(async move {
                compactor::run_compactor(compactor_engine, threshold).await;
            });
            info!(tenant, "tenant loaded");
            Ok::<_, io::Error>(engine)
        })?;
        let engine = entry.value().clone();
        drop(entry);

        metrics::gauge!(observability::TENANTS_ACTIVE).set(self.engines.len() as f64);
        Ok(engine)
    }
}
