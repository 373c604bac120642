//! Mirror registry and the per-repository mirror handle.

use crate::meta::MirrorMeta;
use crate::odb::ObjectDb;
use crate::refs::{RefDb, RefUpdate};
use crate::{GitObject, MirrorError, ObjectId, ObjectType, Result};
use chrono::Utc;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Canonical upstream repository identity: the cache key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RemoteUrl {
    /// URL scheme (`https`).
    pub scheme: String,
    /// Upstream host.
    pub host: String,
    /// Repository path, no leading slash, always ending in `.git`.
    pub path: String,
}

impl RemoteUrl {
    /// Builds a canonical identity, normalizing the path.
    pub fn new(scheme: &str, host: &str, path: &str) -> Self {
        let mut path = path.trim_matches('/').to_string();
        if !path.ends_with(".git") {
            path.push_str(".git");
        }
        Self {
            scheme: scheme.to_ascii_lowercase(),
            host: host.to_ascii_lowercase(),
            path,
        }
    }

    /// Stable key for registries and events.
    pub fn cache_key(&self) -> String {
        format!("{}/{}/{}", self.scheme, self.host, self.path)
    }

    /// Full upstream URL string.
    pub fn as_url(&self) -> String {
        format!("{}://{}/{}", self.scheme, self.host, self.path)
    }

    fn cache_dir(&self, root: &Path) -> PathBuf {
        root.join(&self.scheme).join(&self.host).join(&self.path)
    }
}

impl std::fmt::Display for RemoteUrl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_url())
    }
}

/// A ref as served to clients: name, target, optional peeled target for
/// annotated tags, optional symref target (HEAD).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefEntry {
    /// Full ref name, or `HEAD`.
    pub name: String,
    /// Direct target oid.
    pub target: ObjectId,
    /// Fully-peeled oid for annotated tags.
    pub peeled: Option<ObjectId>,
    /// Symref target for symbolic refs.
    pub symref_target: Option<String>,
}

/// A local mirror of one upstream repository.
pub struct Mirror {
    url: RemoteUrl,
    dir: PathBuf,
    odb: ObjectDb,
    refs: RefDb,
    meta: RwLock<MirrorMeta>,
    /// Monotonic instant of the last successful refresh in this process.
    refreshed_at: RwLock<Option<Instant>>,
    update_lock: Arc<Mutex<()>>,
}

impl Mirror {
    fn open(root: &Path, url: RemoteUrl) -> Result<Arc<Self>> {
        let dir = url.cache_dir(root);
        fs::create_dir_all(&dir)?;
        let config = dir.join("config");
        if !config.exists() {
            fs::write(
                &config,
                "[core]\n\trepositoryformatversion = 0\n\tbare = true\n",
            )?;
        }
        let odb = ObjectDb::open(&dir.join("objects"))?;
        let refs = RefDb::open(&dir)?;
        let meta = MirrorMeta::load(&dir)?;
        Ok(Arc::new(Self {
            url,
            dir,
            odb,
            refs,
            meta: RwLock::new(meta),
            refreshed_at: RwLock::new(None),
            update_lock: Arc::new(Mutex::new(())),
        }))
    }

    /// The mirror's canonical upstream identity.
    pub fn url(&self) -> &RemoteUrl {
        &self.url
    }

    /// Filesystem directory of the mirror.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Acquires the exclusive update lease for this repository. The guard is
    /// owned so an updater can hand it to a detached task that outlives the
    /// request. Readers do not take this lock; the object DB is additive and
    /// ref reads are individually consistent.
    pub async fn acquire_update(&self) -> OwnedMutexGuard<()> {
        self.update_lock.clone().lock_owned().await
    }

    /// Returns true if the object is present in the mirror.
    pub fn has_object(&self, id: &ObjectId) -> bool {
        self.odb.contains(id)
    }

    /// Reads an object from the mirror.
    pub fn object(&self, id: &ObjectId) -> Result<GitObject> {
        self.odb.get(id)
    }

    /// Writes a loose object (used by tests and repair tooling).
    pub fn put_object(&self, object: &GitObject) -> Result<()> {
        self.odb.put_loose(object)
    }

    /// Installs a pack stream atomically (see [`ObjectDb::install_pack`]).
    pub fn write_pack<R: Read>(&self, reader: R) -> Result<Vec<ObjectId>> {
        self.odb.install_pack(reader)
    }

    /// Applies ref updates after checking the connectivity invariant: every
    /// new target must already be present in the object DB.
    pub fn update_refs(&self, updates: &[RefUpdate]) -> Result<()> {
        for update in updates {
            if let Some(target) = update.target {
                if !self.odb.contains(&target) {
                    return Err(MirrorError::Corrupt(format!(
                        "ref {} would point at missing object {}",
                        update.name, target
                    )));
                }
            }
        }
        self.refs.apply(updates)
    }

    /// Points HEAD at a branch.
    pub fn set_head(&self, target: &str) -> Result<()> {
        self.refs.set_head_symbolic(target)
    }

    /// Snapshot of all refs, HEAD first, then sorted by name, with annotated
    /// tags peeled. Refs that point at missing objects fail the snapshot
    /// (connectivity is an invariant, not a best effort).
    pub fn refs_snapshot(&self) -> Result<Vec<RefEntry>> {
        let mut out = Vec::new();
        if let Some(symref) = self.refs.head_symref()? {
            if let Some(target) = self.refs.resolve("HEAD")? {
                out.push(RefEntry {
                    name: "HEAD".to_string(),
                    target,
                    peeled: None,
                    symref_target: Some(symref),
                });
            }
        }
        for (name, target) in self.refs.list()? {
            if !self.odb.contains(&target) {
                return Err(MirrorError::Corrupt(format!(
                    "ref {} points at missing object {}",
                    name, target
                )));
            }
            let peeled = self.peel(&target)?;
            out.push(RefEntry {
                name,
                target,
                peeled,
                symref_target: None,
            });
        }
        Ok(out)
    }

    /// Chases a tag chain to the first non-tag object, if `id` is a tag.
    fn peel(&self, id: &ObjectId) -> Result<Option<ObjectId>> {
        let mut current = *id;
        let mut peeled = None;
        for _ in 0..10 {
            let object = self.odb.get(&current)?;
            if object.object_type != ObjectType::Tag {
                return Ok(peeled);
            }
            let (target, _) = object.tag_target()?;
            peeled = Some(target);
            current = target;
        }
        Err(MirrorError::Corrupt(format!("tag chain too deep at {}", id)))
    }

    /// Current metadata snapshot.
    pub fn metadata(&self) -> MirrorMeta {
        self.meta.read().clone()
    }

    /// Mutates and persists metadata.
    pub fn set_metadata<F: FnOnce(&mut MirrorMeta)>(&self, mutate: F) -> Result<()> {
        let mut meta = self.meta.write();
        mutate(&mut meta);
        meta.store(&self.dir)
    }

    /// Marks a successful refresh: monotonic clock for freshness decisions,
    /// wall clock for the persisted record.
    pub fn mark_refreshed(&self, upstream_status: u16) -> Result<()> {
        *self.refreshed_at.write() = Some(Instant::now());
        self.set_metadata(|meta| {
            meta.last_update_utc = Some(Utc::now());
            meta.last_upstream_status = Some(upstream_status);
        })
    }

    /// Monotonic age since the last refresh in this process. Falls back to
    /// the persisted wall-clock age after a restart.
    pub fn refresh_age(&self) -> Option<Duration> {
        if let Some(at) = *self.refreshed_at.read() {
            return Some(at.elapsed());
        }
        self.meta.read().age(Utc::now())
    }

    /// A warm mirror has completed at least one upstream refresh.
    pub fn is_warm(&self) -> bool {
        self.meta.read().last_update_utc.is_some()
    }
}

/// Process-wide registry of open mirrors under one cache root.
pub struct MirrorStore {
    root: PathBuf,
    mirrors: RwLock<HashMap<String, Arc<Mirror>>>,
}

impl MirrorStore {
    /// Opens the store, creating the cache root and probing writability.
    pub fn open(root: &Path) -> Result<Self> {
        fs::create_dir_all(root)?;
        let probe = root.join(".goblet-write-probe");
        fs::write(&probe, b"ok")?;
        fs::remove_file(&probe)?;
        Ok(Self {
            root: root.to_path_buf(),
            mirrors: RwLock::new(HashMap::new()),
        })
    }

    /// The cache root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Opens (creating on first request) the mirror for an upstream URL.
    /// Mirrors are never silently destroyed.
    pub fn open_or_create(&self, url: &RemoteUrl) -> Result<Arc<Mirror>> {
        let key = url.cache_key();
        if let Some(mirror) = self.mirrors.read().get(&key) {
            return Ok(mirror.clone());
        }
        let mut mirrors = self.mirrors.write();
        // Re-check under the write lock.
        if let Some(mirror) = mirrors.get(&key) {
            return Ok(mirror.clone());
        }
        let mirror = Mirror::open(&self.root, url.clone())?;
        tracing::info!(repo = %url, dir = %mirror.dir().display(), "Opened mirror");
        mirrors.insert(key, mirror.clone());
        Ok(mirror)
    }

    /// Number of open mirrors.
    pub fn len(&self) -> usize {
        self.mirrors.read().len()
    }

    /// Returns true if no mirrors are open.
    pub fn is_empty(&self) -> bool {
        self.mirrors.read().is_empty()
    }

    /// All open mirrors (used at drain time).
    pub fn list(&self) -> Vec<Arc<Mirror>> {
        self.mirrors.read().values().cloned().collect()
    }

    /// Waits out every open mirror's in-flight update lease. Called at
    /// shutdown so a pack install or ref update is never cut off mid-write.
    pub async fn drain(&self) {
        for mirror in self.list() {
            drop(mirror.acquire_update().await);
        }
        tracing::info!(mirrors = self.len(), "Mirror store drained");
    }
}
