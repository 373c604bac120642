//! On-disk reference storage for a mirror.
//!
//! Refs are stored loose (one file per ref under `refs/`), HEAD as a
//! symbolic ref file. Every write goes through a temp file and rename, and
//! updates are compare-and-set against the previously observed oid.

use crate::{MirrorError, ObjectId, Result};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

static TMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// A git reference (direct or symbolic).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reference {
    /// Direct reference to an object.
    Direct(ObjectId),
    /// Symbolic reference (e.g. HEAD -> refs/heads/main).
    Symbolic(String),
}

/// A single compare-and-set ref update. `target: None` deletes the ref.
#[derive(Debug, Clone)]
pub struct RefUpdate {
    /// Full ref name (`refs/heads/main`).
    pub name: String,
    /// Oid the caller observed, or `None` when the ref must be absent.
    pub expected: Option<ObjectId>,
    /// New target, or `None` to delete.
    pub target: Option<ObjectId>,
}

/// Reference database rooted at a mirror's git directory.
pub struct RefDb {
    git_dir: PathBuf,
}

impl RefDb {
    /// Opens the ref DB, initializing `refs/` and a default HEAD on first use.
    pub fn open(git_dir: &Path) -> Result<Self> {
        fs::create_dir_all(git_dir.join("refs"))?;
        let db = Self {
            git_dir: git_dir.to_path_buf(),
        };
        if !git_dir.join("HEAD").exists() {
            db.set_head_symbolic("refs/heads/main")?;
        }
        Ok(db)
    }

    fn ref_path(&self, name: &str) -> Result<PathBuf> {
        // Refuse names that would escape the git dir.
        if name.split('/').any(|c| c == ".." || c.is_empty()) || !name.starts_with("refs/") {
            return Err(MirrorError::RefNotFound(format!("invalid ref name: {}", name)));
        }
        Ok(self.git_dir.join(name))
    }

    /// Reads a single ref by full name.
    pub fn get(&self, name: &str) -> Result<Option<Reference>> {
        let path = if name == "HEAD" {
            self.git_dir.join("HEAD")
        } else {
            self.ref_path(name)?
        };
        read_ref_file(&path)
    }

    /// Resolves a ref (following symrefs) to an oid.
    pub fn resolve(&self, name: &str) -> Result<Option<ObjectId>> {
        let mut current = name.to_string();
        for _ in 0..5 {
            match self.get(&current)? {
                Some(Reference::Direct(id)) => return Ok(Some(id)),
                Some(Reference::Symbolic(target)) => current = target,
                None => return Ok(None),
            }
        }
        Err(MirrorError::Corrupt(format!(
            "symbolic ref chain too deep at {}",
            name
        )))
    }

    /// Returns the symref target of HEAD, if HEAD is symbolic.
    pub fn head_symref(&self) -> Result<Option<String>> {
        match self.get("HEAD")? {
            Some(Reference::Symbolic(target)) => Ok(Some(target)),
            _ => Ok(None),
        }
    }

    /// Points HEAD at a branch symbolically.
    pub fn set_head_symbolic(&self, target: &str) -> Result<()> {
        write_atomic(&self.git_dir.join("HEAD"), format!("ref: {}\n", target).as_bytes())
    }

    /// Lists all refs under `refs/`, sorted by name.
    pub fn list(&self) -> Result<Vec<(String, ObjectId)>> {
        let mut out = Vec::new();
        let root = self.git_dir.join("refs");
        collect_refs(&root, &self.git_dir, &mut out)?;
        out.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(out)
    }

    /// Applies a batch of compare-and-set updates, one ref at a time. The
    /// caller is expected to hold the mirror's update lock; this method only
    /// guarantees per-ref atomicity and CAS semantics.
    pub fn apply(&self, updates: &[RefUpdate]) -> Result<()> {
        for update in updates {
            let path = self.ref_path(&update.name)?;
            let current = match read_ref_file(&path)? {
                Some(Reference::Direct(id)) => Some(id),
                Some(Reference::Symbolic(_)) => {
                    return Err(MirrorError::Corrupt(format!(
                        "unexpected symbolic ref at {}",
                        update.name
                    )))
                }
                None => None,
            };
            if current != update.expected {
                return Err(MirrorError::RefConflict {
                    name: update.name.clone(),
                    expected: describe(&update.expected),
                    found: describe(&current),
                });
            }
            match update.target {
                Some(target) => {
                    fs::create_dir_all(path.parent().expect("ref path has a parent"))?;
                    write_atomic(&path, format!("{}\n", target).as_bytes())?;
                }
                None => {
                    if path.exists() {
                        fs::remove_file(&path)?;
                    }
                }
            }
        }
        Ok(())
    }
}

fn describe(oid: &Option<ObjectId>) -> String {
    match oid {
        Some(id) => id.to_hex(),
        None => "absent".to_string(),
    }
}

fn read_ref_file(path: &Path) -> Result<Option<Reference>> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let line = content.trim();
    if let Some(target) = line.strip_prefix("ref: ") {
        Ok(Some(Reference::Symbolic(target.to_string())))
    } else {
        Ok(Some(Reference::Direct(ObjectId::from_hex(line)?)))
    }
}

fn write_atomic(path: &Path, content: &[u8]) -> Result<()> {
    // Append rather than replace any extension: ref names may contain dots.
    let tmp = PathBuf::from(format!(
        "{}.lock{}",
        path.display(),
        TMP_COUNTER.fetch_add(1, Ordering::SeqCst)
    ));
    let mut file = File::create(&tmp)?;
    file.write_all(content)?;
    file.sync_all()?;
    drop(file);
    fs::rename(&tmp, path)?;
    Ok(())
}

fn collect_refs(dir: &Path, git_dir: &Path, out: &mut Vec<(String, ObjectId)>) -> Result<()> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };
    for entry in entries {
        let entry = entry?;
        let path = entry.path();
        if path.is_dir() {
            collect_refs(&path, git_dir, out)?;
        } else if let Some(Reference::Direct(id)) = read_ref_file(&path)? {
            let name = path
                .strip_prefix(git_dir)
                .expect("ref path is under git dir")
                .to_string_lossy()
                .replace('\\', "/");
            out.push((name, id));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn oid(byte: u8) -> ObjectId {
        ObjectId::from_bytes([byte; 20])
    }

    fn set(db: &RefDb, name: &str, expected: Option<ObjectId>, target: ObjectId) {
        db.apply(&[RefUpdate {
            name: name.to_string(),
            expected,
            target: Some(target),
        }])
        .unwrap();
    }

    #[test]
    fn test_head_defaults_to_main() {
        let dir = TempDir::new().unwrap();
        let db = RefDb::open(dir.path()).unwrap();
        assert_eq!(db.head_symref().unwrap().unwrap(), "refs/heads/main");
    }

    #[test]
    fn test_create_and_resolve() {
        let dir = TempDir::new().unwrap();
        let db = RefDb::open(dir.path()).unwrap();

        set(&db, "refs/heads/main", None, oid(1));
        assert_eq!(db.resolve("refs/heads/main").unwrap(), Some(oid(1)));
        // HEAD resolves through the symref
        assert_eq!(db.resolve("HEAD").unwrap(), Some(oid(1)));
    }

    #[test]
    fn test_cas_conflict() {
        let dir = TempDir::new().unwrap();
        let db = RefDb::open(dir.path()).unwrap();

        set(&db, "refs/heads/main", None, oid(1));
        let result = db.apply(&[RefUpdate {
            name: "refs/heads/main".into(),
            expected: Some(oid(9)),
            target: Some(oid(2)),
        }]);
        assert!(matches!(result, Err(MirrorError::RefConflict { .. })));
        // unchanged
        assert_eq!(db.resolve("refs/heads/main").unwrap(), Some(oid(1)));
    }

    #[test]
    fn test_cas_requires_absence_for_create() {
        let dir = TempDir::new().unwrap();
        let db = RefDb::open(dir.path()).unwrap();

        set(&db, "refs/heads/main", None, oid(1));
        let result = db.apply(&[RefUpdate {
            name: "refs/heads/main".into(),
            expected: None,
            target: Some(oid(2)),
        }]);
        assert!(matches!(result, Err(MirrorError::RefConflict { .. })));
    }

    #[test]
    fn test_delete() {
        let dir = TempDir::new().unwrap();
        let db = RefDb::open(dir.path()).unwrap();

        set(&db, "refs/heads/gone", None, oid(1));
        db.apply(&[RefUpdate {
            name: "refs/heads/gone".into(),
            expected: Some(oid(1)),
            target: None,
        }])
        .unwrap();
        assert_eq!(db.get("refs/heads/gone").unwrap(), None);
    }

    #[test]
    fn test_list_sorted() {
        let dir = TempDir::new().unwrap();
        let db = RefDb::open(dir.path()).unwrap();

        set(&db, "refs/tags/v2", None, oid(3));
        set(&db, "refs/heads/main", None, oid(1));
        set(&db, "refs/heads/dev", None, oid(2));

        let names: Vec<String> = db.list().unwrap().into_iter().map(|(n, _)| n).collect();
        assert_eq!(
            names,
            vec!["refs/heads/dev", "refs/heads/main", "refs/tags/v2"]
        );
    }

    #[test]
    fn test_rejects_escaping_names() {
        let dir = TempDir::new().unwrap();
        let db = RefDb::open(dir.path()).unwrap();

        let result = db.apply(&[RefUpdate {
            name: "refs/../../etc/passwd".into(),
            expected: None,
            target: Some(oid(1)),
        }]);
        assert!(result.is_err());
        assert!(db.get("objects").is_err());
    }

    #[test]
    fn test_update_existing_with_correct_expected() {
        let dir = TempDir::new().unwrap();
        let db = RefDb::open(dir.path()).unwrap();

        set(&db, "refs/heads/main", None, oid(1));
        set(&db, "refs/heads/main", Some(oid(1)), oid(2));
        assert_eq!(db.resolve("refs/heads/main").unwrap(), Some(oid(2)));
    }
}
