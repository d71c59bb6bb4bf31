use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::engine::Engine;
use crate::limits::*;
use crate::notify::NotifyHub;
use crate::reaper;
use crate::service::BookingService;

pub type TenantService = BookingService<Engine>;

/// Manages per-tenant booking services. Each tenant gets its own Engine + WAL
/// + compactor. Tenant = database name from the pgwire connection.
pub struct TenantManager {
    services: DashMap<String, Arc<TenantService>>,
    data_dir: PathBuf,
    compact_threshold: u64,
    shutdown: CancellationToken,
}

impl TenantManager {
    pub fn new(data_dir: PathBuf, compact_threshold: u64) -> Self {
        Self {
            services: DashMap::new(),
            data_dir,
            compact_threshold,
            shutdown: CancellationToken::new(),
        }
    }

    /// Get or lazily create the booking service for the given tenant.
    pub fn get_or_create(&self, tenant: &str) -> std::io::Result<Arc<TenantService>> {
        if let Some(service) = self.services.get(tenant) {
            return Ok(service.value().clone());
        }
        if tenant.len() > MAX_TENANT_NAME_LEN {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "tenant name too long",
            ));
        }
        if self.services.len() >= MAX_TENANTS {
            return Err(std::io::Error::other("too many tenants"));
        }

        // Sanitize tenant name to prevent path traversal
        let safe_name: String = tenant
            .chars()
            .filter(|c| c.is_alphanumeric() || *c == '_' || *c == '-')
            .collect();
        if safe_name.is_empty() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "empty tenant name",
            ));
        }

        // Two connections may race to create the same tenant; the entry API
        // makes sure only one engine ever opens the WAL.
        let entry = self.services.entry(tenant.to_string());
        if let dashmap::Entry::Occupied(existing) = &entry {
            return Ok(existing.get().clone());
        }
        let wal_path = self.data_dir.join(format!("{safe_name}.wal"));
        let engine = Arc::new(Engine::new(wal_path, Arc::new(NotifyHub::new()))?);

        tokio::spawn(reaper::run_compactor(
            engine.clone(),
            self.compact_threshold,
            self.shutdown.child_token(),
        ));

        let service = Arc::new(BookingService::new(engine));
        entry.insert(service.clone());
        metrics::gauge!(crate::observability::TENANTS_ACTIVE).set(self.services.len() as f64);
        info!("tenant {safe_name} loaded");
        Ok(service)
    }

    pub fn tenant_count(&self) -> usize {
        self.services.len()
    }

    /// Stop every tenant's background tasks.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}
