//! On-disk object database: loose objects plus installed packs.
//!
//! The DB is additive-only. Loose objects are written via temp-file rename;
//! packs land in `objects/pack/` only after the pack has been parsed,
//! verified, and indexed, so a half-written pack is never observable.

use crate::pack::{write_idx, IdxEntry, PackFile, PackParser};
use crate::{GitObject, MirrorError, ObjectId, ObjectType, Result};
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use parking_lot::RwLock;
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

static TMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Object database rooted at a mirror's `objects/` directory.
pub struct ObjectDb {
    objects_dir: PathBuf,
    packs: RwLock<Vec<Arc<PackFile>>>,
}

impl ObjectDb {
    /// Opens (creating if needed) the object DB under `objects_dir`.
    pub fn open(objects_dir: &Path) -> Result<Self> {
        fs::create_dir_all(objects_dir.join("pack"))?;
        fs::create_dir_all(objects_dir.join("info"))?;
        let db = Self {
            objects_dir: objects_dir.to_path_buf(),
            packs: RwLock::new(Vec::new()),
        };
        db.scan_packs()?;
        Ok(db)
    }

    /// Loads every complete pack/idx pair under `objects/pack/`.
    fn scan_packs(&self) -> Result<()> {
        let pack_dir = self.objects_dir.join("pack");
        let mut packs = Vec::new();
        for entry in fs::read_dir(&pack_dir)? {
            let entry = entry?;
            let path = entry.path();
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if let Some(stem) = name.strip_suffix(".idx") {
                let pack_path = pack_dir.join(format!("{}.pack", stem));
                if pack_path.exists() {
                    packs.push(Arc::new(PackFile::open(&pack_path, &path)?));
                }
            }
        }
        *self.packs.write() = packs;
        Ok(())
    }

    fn loose_path(&self, id: &ObjectId) -> PathBuf {
        let hex = id.to_hex();
        self.objects_dir.join(&hex[..2]).join(&hex[2..])
    }

    /// Returns true if the object is present, loose or packed.
    pub fn contains(&self, id: &ObjectId) -> bool {
        if self.loose_path(id).exists() {
            return true;
        }
        self.packs.read().iter().any(|p| p.contains(id))
    }

    /// Reads an object, loose store first, then installed packs.
    pub fn get(&self, id: &ObjectId) -> Result<GitObject> {
        self.get_opt(id)?
            .ok_or_else(|| MirrorError::ObjectNotFound(id.to_hex()))
    }

    /// Reads an object, returning `None` when absent.
    pub fn get_opt(&self, id: &ObjectId) -> Result<Option<GitObject>> {
        if let Some(object) = self.read_loose(id)? {
            return Ok(Some(object));
        }
        // Snapshot the pack list so delta-base lookups never re-enter the lock.
        let packs: Vec<Arc<PackFile>> = self.packs.read().clone();
        let lookup = |base: &ObjectId| -> Option<GitObject> {
            if let Ok(Some(object)) = self.read_loose(base) {
                return Some(object);
            }
            for pack in &packs {
                if let Ok(Some(object)) = pack.get(base, &|_| None) {
                    return Some(object);
                }
            }
            None
        };
        for pack in &packs {
            if let Some(object) = pack.get(id, &lookup)? {
                return Ok(Some(object));
            }
        }
        Ok(None)
    }

    fn read_loose(&self, id: &ObjectId) -> Result<Option<GitObject>> {
        let path = self.loose_path(id);
        let compressed = match fs::read(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let mut decoder = ZlibDecoder::new(compressed.as_slice());
        let mut decompressed = Vec::new();
        decoder
            .read_to_end(&mut decompressed)
            .map_err(|e| MirrorError::Compression(e.to_string()))?;

        // Header: "type size\0data".
        let null_pos = decompressed
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| MirrorError::InvalidObject("missing header NUL".to_string()))?;
        let header = String::from_utf8_lossy(&decompressed[..null_pos]).to_string();
        let (type_str, size_str) = header
            .split_once(' ')
            .ok_or_else(|| MirrorError::InvalidObject(format!("invalid header: {}", header)))?;
        let object_type = ObjectType::parse(type_str)?;
        let _size: usize = size_str
            .parse()
            .map_err(|_| MirrorError::InvalidObject("invalid size".to_string()))?;

        let object = GitObject::new(object_type, decompressed[null_pos + 1..].to_vec());
        if object.id != *id {
            return Err(MirrorError::Corrupt(format!(
                "loose object {} hashes to {}",
                id, object.id
            )));
        }
        Ok(Some(object))
    }

    /// Writes a loose object. Existing objects are left untouched (the DB is
    /// content-addressed, so a rewrite would be a no-op).
    pub fn put_loose(&self, object: &GitObject) -> Result<()> {
        let path = self.loose_path(&object.id);
        if path.exists() {
            return Ok(());
        }
        fs::create_dir_all(path.parent().expect("loose path has a fanout parent"))?;

        let header = format!("{} {}\0", object.object_type.as_str(), object.data.len());
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder
            .write_all(header.as_bytes())
            .map_err(|e| MirrorError::Compression(e.to_string()))?;
        encoder
            .write_all(&object.data)
            .map_err(|e| MirrorError::Compression(e.to_string()))?;
        let compressed = encoder
            .finish()
            .map_err(|e| MirrorError::Compression(e.to_string()))?;

        let tmp = path.with_extension(format!("tmp{}", TMP_COUNTER.fetch_add(1, Ordering::SeqCst)));
        let mut file = File::create(&tmp)?;
        file.write_all(&compressed)?;
        file.sync_all()?;
        drop(file);
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    /// Streams a pack into the DB atomically: the bytes go to a temp file,
    /// the pack is parsed and verified, the idx is generated, both files are
    /// fsynced, and only then renamed into `objects/pack/`. Any failure
    /// removes the partial files.
    ///
    /// Returns the ids of all objects the pack contributed.
    pub fn install_pack<R: Read>(&self, mut reader: R) -> Result<Vec<ObjectId>> {
        let pack_dir = self.objects_dir.join("pack");
        let serial = TMP_COUNTER.fetch_add(1, Ordering::SeqCst);
        let tmp_pack = pack_dir.join(format!("tmp_{}_{}.pack", std::process::id(), serial));
        let tmp_idx = pack_dir.join(format!("tmp_{}_{}.idx", std::process::id(), serial));

        let result = self.install_pack_inner(&mut reader, &tmp_pack, &tmp_idx);
        if result.is_err() {
            let _ = fs::remove_file(&tmp_pack);
            let _ = fs::remove_file(&tmp_idx);
        }
        result
    }

    fn install_pack_inner<R: Read>(
        &self,
        reader: &mut R,
        tmp_pack: &Path,
        tmp_idx: &Path,
    ) -> Result<Vec<ObjectId>> {
        let mut file = File::create(tmp_pack)?;
        let mut data = Vec::new();
        let mut buf = [0u8; 64 * 1024];
        loop {
            let n = reader.read(&mut buf)?;
            if n == 0 {
                break;
            }
            file.write_all(&buf[..n])?;
            data.extend_from_slice(&buf[..n]);
        }
        file.sync_all()?;
        drop(file);

        let mut parser = PackParser::new(&data);
        let (objects, pack_sha) = parser.parse_with(|id| self.get_opt(id).ok().flatten())?;

        let entries: Vec<IdxEntry> = objects
            .iter()
            .map(|o| IdxEntry {
                id: o.object.id,
                crc32: o.crc32,
                offset: o.offset,
            })
            .collect();
        let idx = write_idx(entries, &pack_sha);
        let mut idx_file = File::create(tmp_idx)?;
        idx_file.write_all(&idx)?;
        idx_file.sync_all()?;
        drop(idx_file);

        let name = format!("pack-{}", hex::encode(pack_sha));
        let pack_dir = self.objects_dir.join("pack");
        let final_pack = pack_dir.join(format!("{}.pack", name));
        let final_idx = pack_dir.join(format!("{}.idx", name));
        // Pack first: a pack without its idx is not yet a pair and is
        // ignored by the scanner.
        fs::rename(tmp_pack, &final_pack)?;
        fs::rename(tmp_idx, &final_idx)?;

        let pack_file = Arc::new(PackFile::open(&final_pack, &final_idx)?);
        let ids: Vec<ObjectId> = pack_file.ids().copied().collect();
        self.packs.write().push(pack_file);
        self.write_info_packs()?;
        Ok(ids)
    }

    /// Regenerates `objects/info/packs` after an install.
    fn write_info_packs(&self) -> Result<()> {
        let pack_dir = self.objects_dir.join("pack");
        let mut lines = Vec::new();
        for entry in fs::read_dir(&pack_dir)? {
            let name = entry?.file_name();
            let name = name.to_string_lossy().to_string();
            if name.starts_with("pack-") && name.ends_with(".pack") {
                lines.push(format!("P {}\n", name));
            }
        }
        lines.sort();
        let mut content: String = lines.concat();
        content.push('\n');
        fs::write(self.objects_dir.join("info").join("packs"), content)?;
        Ok(())
    }

    /// Number of installed packs.
    pub fn pack_count(&self) -> usize {
        self.packs.read().len()
    }
}
