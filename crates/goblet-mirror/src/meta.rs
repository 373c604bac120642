//! Per-mirror metadata record, persisted at `.goblet/meta.json`.

use crate::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::Write;
use std::path::Path;
use std::time::Duration;

/// How many recently seen request fingerprints to retain for debugging.
const FINGERPRINT_RING: usize = 32;

/// Mirror metadata: when the mirror was last updated from upstream, what the
/// upstream said, and which request fingerprints were recently served.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MirrorMeta {
    /// Wall-clock time of the last successful upstream refresh.
    pub last_update_utc: Option<DateTime<Utc>>,
    /// HTTP status of the last upstream conversation (success or failure).
    pub last_upstream_status: Option<u16>,
    /// Recently served fingerprints, newest first.
    #[serde(default)]
    pub last_fingerprints: Vec<String>,
}

impl MirrorMeta {
    /// Loads metadata from a mirror's git dir; a missing file yields defaults.
    pub fn load(git_dir: &Path) -> Result<Self> {
        let path = git_dir.join(".goblet").join("meta.json");
        match fs::read(&path) {
            Ok(data) => Ok(serde_json::from_slice(&data)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e.into()),
        }
    }

    /// Persists metadata via write-then-rename.
    pub fn store(&self, git_dir: &Path) -> Result<()> {
        let dir = git_dir.join(".goblet");
        fs::create_dir_all(&dir)?;
        let path = dir.join("meta.json");
        let tmp = dir.join("meta.json.tmp");
        let data = serde_json::to_vec_pretty(self)?;
        let mut file = File::create(&tmp)?;
        file.write_all(&data)?;
        file.sync_all()?;
        drop(file);
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    /// Records a served fingerprint in the bounded newest-first ring.
    pub fn record_fingerprint(&mut self, fingerprint: &str) {
        self.last_fingerprints.retain(|f| f != fingerprint);
        self.last_fingerprints.insert(0, fingerprint.to_string());
        self.last_fingerprints.truncate(FINGERPRINT_RING);
    }

    /// Wall-clock age of the mirror relative to `now`, if ever updated.
    pub fn age(&self, now: DateTime<Utc>) -> Option<Duration> {
        self.last_update_utc
            .map(|t| (now - t).to_std().unwrap_or(Duration::ZERO))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_load_missing_is_default() {
        let dir = TempDir::new().unwrap();
        let meta = MirrorMeta::load(dir.path()).unwrap();
        assert!(meta.last_update_utc.is_none());
        assert!(meta.last_fingerprints.is_empty());
    }

    #[test]
    fn test_store_load_roundtrip() {
        let dir = TempDir::new().unwrap();
        let mut meta = MirrorMeta::default();
        meta.last_update_utc = Some(Utc::now());
        meta.last_upstream_status = Some(200);
        meta.record_fingerprint("abc123");
        meta.store(dir.path()).unwrap();

        let loaded = MirrorMeta::load(dir.path()).unwrap();
        assert_eq!(loaded.last_upstream_status, Some(200));
        assert_eq!(loaded.last_fingerprints, vec!["abc123"]);
    }

    #[test]
    fn test_fingerprint_ring_dedups_and_caps() {
        let mut meta = MirrorMeta::default();
        for i in 0..40 {
            meta.record_fingerprint(&format!("fp{}", i));
        }
        meta.record_fingerprint("fp39");
        assert_eq!(meta.last_fingerprints.len(), FINGERPRINT_RING);
        assert_eq!(meta.last_fingerprints[0], "fp39");
        assert_eq!(meta.last_fingerprints.iter().filter(|f| *f == "fp39").count(), 1);
    }

    #[test]
    fn test_age() {
        let mut meta = MirrorMeta::default();
        assert!(meta.age(Utc::now()).is_none());
        meta.last_update_utc = Some(Utc::now() - chrono::Duration::seconds(120));
        let age = meta.age(Utc::now()).unwrap();
        assert!(age >= Duration::from_secs(119) && age <= Duration::from_secs(121));
    }
}
