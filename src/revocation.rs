//! Revocation log and CRL publishing
//!
//! The log is append-only; the CRL is rebuilt wholesale from the complete
//! log every time it is published.

use chrono::Utc;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use crate::error::GateResult;
use crate::model::RevokedEntry;
use crate::pki::PkiEngine;
use crate::settings::SettingsStore;
use crate::store::StateStore;

/// Interval between two scheduled CRL publications
pub const PUBLISH_INTERVAL: Duration = Duration::from_secs(60 * 60);

pub struct RevocationLog {
    store: Arc<StateStore>,
}

impl RevocationLog {
    pub fn new(store: Arc<StateStore>) -> Self {
        Self { store }
    }

    /// Record a revoked serial; an already revoked serial keeps its entry
    pub fn append(&self, serial: &str) -> GateResult<RevokedEntry> {
        self.store.update(|state| Ok(append_entry(&mut state.revoked, serial)))
    }

    pub fn entries(&self) -> GateResult<Vec<RevokedEntry>> {
        Ok(self.store.load()?.revoked)
    }

    pub fn serials(&self) -> GateResult<Vec<String>> {
        Ok(self.entries()?.into_iter().map(|e| e.serial).collect())
    }
}

/// Append to an in-memory log, used inside larger store transactions
pub fn append_entry(log: &mut Vec<RevokedEntry>, serial: &str) -> RevokedEntry {
    if let Some(existing) = log.iter().find(|e| e.serial == serial) {
        return existing.clone();
    }

    let entry = RevokedEntry {
        serial: serial.to_string(),
        revoked_at: Utc::now(),
    };
    log.push(entry.clone());
    info!("Revoked certificate serial {}", serial);
    entry
}

/// Writes the CRL built from the full log to a fixed path
pub struct CrlPublisher {
    pki: PkiEngine,
    log: RevocationLog,
    path: PathBuf,
}

impl CrlPublisher {
    pub fn new(pki: PkiEngine, log: RevocationLog, path: &Path) -> Self {
        Self {
            pki,
            log,
            path: path.to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Rebuild and write the CRL, returning the number of revoked entries
    pub fn publish(&self) -> GateResult<usize> {
        let serials = self.log.serials()?;
        let crl = self.pki.create_crl(&serials)?;

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("pem.tmp");
        std::fs::write(&tmp, crl)?;
        std::fs::rename(&tmp, &self.path)?;

        info!("Published CRL with {} entries to {:?}", serials.len(), self.path);
        Ok(serials.len())
    }

    /// Reload settings and publish, logging instead of failing
    pub fn refresh(&self, settings: &dyn SettingsStore) -> bool {
        // the CA may have been created since the last publication
        if let Err(e) = settings.reload() {
            warn!("Failed to reload settings: {}", e);
        }
        match self.publish() {
            Ok(_) => true,
            Err(e) => {
                error!("Failed to publish CRL: {}", e);
                false
            }
        }
    }

    /// Publish at once and then every `period` while `running` is set
    ///
    /// Returns the number of successful publications.
    pub async fn run(&self, settings: &dyn SettingsStore, period: Duration, running: &RwLock<bool>) -> usize {
        let mut interval = tokio::time::interval(period);
        let mut published = 0;

        while *running.read().await {
            tokio::select! {
                // the first tick completes immediately
                _ = interval.tick() => {
                    if self.refresh(settings) {
                        published += 1;
                    }
                }
                _ = tokio::time::sleep(Duration::from_secs(1)) => {}
            }
        }
        published
    }
}

/// Make sure a CRL file exists so the daemon can start before the first
/// publication; returns whether the file had to be created
pub fn ensure_placeholder(path: &Path) -> GateResult<bool> {
    if path.exists() {
        return Ok(false);
    }

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::OpenOptions::new().create(true).append(true).open(path)?;
    debug!("Created placeholder CRL at {:?}", path);
    Ok(true)
}
