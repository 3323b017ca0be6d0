use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio_util::sync::CancellationToken;

use crate::engine::Engine;
use crate::limits::*;
use crate::notify::NotifyHub;
use crate::policy::Policy;
use crate::reaper;

/// One engine per club location. Site = database name from the pgwire
/// connection; each gets its own WAL, reaper and compactor.
pub struct SiteManager {
    engines: DashMap<String, Arc<Engine>>,
    data_dir: PathBuf,
    compact_threshold: u64,
    policy: Policy,
    shutdown: CancellationToken,
}

impl SiteManager {
    pub fn new(
        data_dir: PathBuf,
        compact_threshold: u64,
        policy: Policy,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            engines: DashMap::new(),
            data_dir,
            compact_threshold,
            policy,
            shutdown,
        }
    }

    /// Get or lazily create the engine for `site`.
    pub fn get_or_create(&self, site: &str) -> std::io::Result<Arc<Engine>> {
        if let Some(engine) = self.engines.get(site) {
            return Ok(engine.value().clone());
        }
        if site.len() > MAX_SITE_NAME_LEN {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "site name too long",
            ));
        }
        let safe_name = sanitize_site_name(site);
        if safe_name.is_empty() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "empty site name",
            ));
        }
        if self.engines.len() >= MAX_SITES {
            return Err(std::io::Error::other("too many sites"));
        }

        // Holding the entry serializes two first connections to the same site.
        let engine = match self.engines.entry(site.to_string()) {
            Entry::Occupied(e) => return Ok(e.get().clone()),
            Entry::Vacant(slot) => {
                let wal_path = self.data_dir.join(format!("{safe_name}.wal"));
                let notify = Arc::new(NotifyHub::new());
                let engine = Arc::new(Engine::new(wal_path, notify, self.policy.clone())?);
                slot.insert(engine.clone());
                engine
            }
        };

        tokio::spawn(reaper::run_reaper(engine.clone(), self.shutdown.child_token()));
        tokio::spawn(reaper::run_compactor(
            engine.clone(),
            self.compact_threshold,
            self.shutdown.child_token(),
        ));

        tracing::info!("opened site {safe_name}");
        metrics::gauge!(crate::observability::SITES_ACTIVE).set(self.engines.len() as f64);
        Ok(engine)
    }
}

/// Keep only `[A-Za-z0-9_-]` so a site name can never escape the data dir.
fn sanitize_site_name(site: &str) -> String {
    site.chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '-')
        .collect()
}
