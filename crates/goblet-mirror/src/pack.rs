//! Git pack file format: building, parsing, delta resolution, and the
//! pack-index (idx v2) used to read installed packs in place.
//!
//! See: https://git-scm.com/docs/pack-format

use crate::{GitObject, MirrorError, ObjectId, ObjectType, Result};
use bytes::Bytes;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::{Compression, Crc};
use sha1::{Digest, Sha1};
use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::Path;

/// Magic bytes at the start of a pack file.
const PACK_SIGNATURE: &[u8; 4] = b"PACK";
/// Pack file version we support.
const PACK_VERSION: u32 = 2;
/// Magic bytes at the start of an idx v2 file.
const IDX_SIGNATURE: &[u8; 4] = &[0xff, 0x74, 0x4f, 0x63];

/// Pack entry type code for an offset delta.
const TYPE_OFS_DELTA: u8 = 6;
/// Pack entry type code for a ref delta.
const TYPE_REF_DELTA: u8 = 7;

/// Builds a pack file from a set of objects.
pub struct PackBuilder {
    objects: Vec<GitObject>,
}

impl PackBuilder {
    /// Creates a new pack builder.
    pub fn new() -> Self {
        Self {
            objects: Vec::new(),
        }
    }

    /// Adds an object to the pack.
    pub fn add(&mut self, object: GitObject) {
        self.objects.push(object);
    }

    /// Number of objects queued.
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    /// Returns true if no objects have been added.
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Builds the pack file. All objects are written whole (no deltas),
    /// which every git client accepts.
    pub fn build(self) -> Result<Vec<u8>> {
        let mut pack = Vec::new();

        pack.extend_from_slice(PACK_SIGNATURE);
        pack.extend_from_slice(&PACK_VERSION.to_be_bytes());
        pack.extend_from_slice(&(self.objects.len() as u32).to_be_bytes());

        for object in &self.objects {
            Self::write_object(&mut pack, object)?;
        }

        let mut hasher = Sha1::new();
        hasher.update(&pack);
        let checksum = hasher.finalize();
        pack.extend_from_slice(&checksum);

        Ok(pack)
    }

    /// Writes a single object entry: varint type+size header, then zlib data.
    fn write_object(pack: &mut Vec<u8>, object: &GitObject) -> Result<()> {
        let obj_type = object.object_type.pack_type();
        let size = object.data.len();

        // First byte: (MSB=more bytes) (3 bits type) (4 bits size).
        let mut first_byte = (obj_type << 4) | ((size & 0x0F) as u8);
        let mut remaining_size = size >> 4;

        if remaining_size > 0 {
            first_byte |= 0x80;
        }
        pack.push(first_byte);

        while remaining_size > 0 {
            let mut byte = (remaining_size & 0x7F) as u8;
            remaining_size >>= 7;
            if remaining_size > 0 {
                byte |= 0x80;
            }
            pack.push(byte);
        }

        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder
            .write_all(&object.data)
            .map_err(|e| MirrorError::InvalidPack(e.to_string()))?;
        let compressed = encoder
            .finish()
            .map_err(|e| MirrorError::InvalidPack(e.to_string()))?;
        pack.extend_from_slice(&compressed);

        Ok(())
    }
}

impl Default for PackBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Streams a pack to `out` without materializing it: header, one zlib entry
/// per object as it arrives, then the SHA-1 trailer. `count` must equal the
/// number of objects the iterator yields. Objects are read lazily, so a
/// source error aborts the stream mid-pack.
///
/// Returns the total pack size in bytes.
pub fn stream_pack<I, W>(objects: I, count: usize, out: &mut W) -> Result<u64>
where
    I: IntoIterator<Item = Result<GitObject>>,
    W: Write + ?Sized,
{
    let mut hasher = Sha1::new();
    let mut written: u64 = 0;
    let mut emit = |bytes: &[u8], out: &mut W| -> Result<()> {
        hasher.update(bytes);
        out.write_all(bytes)?;
        written += bytes.len() as u64;
        Ok(())
    };

    let mut header = Vec::with_capacity(12);
    header.extend_from_slice(PACK_SIGNATURE);
    header.extend_from_slice(&PACK_VERSION.to_be_bytes());
    header.extend_from_slice(&(count as u32).to_be_bytes());
    emit(&header, out)?;

    let mut seen = 0usize;
    for object in objects {
        let mut entry = Vec::new();
        PackBuilder::write_object(&mut entry, &object?)?;
        emit(&entry, out)?;
        seen += 1;
    }
    if seen != count {
        return Err(MirrorError::InvalidPack(format!(
            "pack header declared {} objects, wrote {}",
            count, seen
        )));
    }

    let checksum = hasher.finalize();
    out.write_all(&checksum)?;
    Ok(written + 20)
}

/// A fully resolved object parsed out of a pack, with its entry location
/// for index generation.
#[derive(Debug, Clone)]
pub struct PackedObject {
    /// The resolved object.
    pub object: GitObject,
    /// Byte offset of the entry header within the pack.
    pub offset: u64,
    /// CRC-32 of the raw (still-compressed) entry bytes.
    pub crc32: u32,
}

/// Base reference of a pack entry.
#[derive(Debug, Clone)]
enum BaseRef {
    None(ObjectType),
    Offset(u64),
    Id(ObjectId),
}

#[derive(Debug)]
struct RawEntry {
    offset: u64,
    end: u64,
    base: BaseRef,
    data: Vec<u8>,
}

/// Parses a pack file and resolves all deltas.
pub struct PackParser<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> PackParser<'a> {
    /// Creates a new pack parser over a complete pack byte buffer.
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// Parses the pack, verifying the trailer checksum and resolving every
    /// delta entry. Ref-delta bases not present in the pack are looked up
    /// through `lookup` (the surrounding object DB).
    ///
    /// Returns the resolved objects plus the pack's trailer SHA-1.
    pub fn parse_with<F>(&mut self, lookup: F) -> Result<(Vec<PackedObject>, [u8; 20])>
    where
        F: Fn(&ObjectId) -> Option<GitObject>,
    {
        if self.data.len() < 32 {
            return Err(MirrorError::InvalidPack("pack too small".to_string()));
        }
        if &self.data[0..4] != PACK_SIGNATURE {
            return Err(MirrorError::InvalidPack("invalid signature".to_string()));
        }
        let version = u32::from_be_bytes(self.data[4..8].try_into().unwrap());
        if version != PACK_VERSION {
            return Err(MirrorError::InvalidPack(format!(
                "unsupported version: {}",
                version
            )));
        }
        let object_count = u32::from_be_bytes(self.data[8..12].try_into().unwrap()) as usize;

        // Verify trailer before trusting any entry.
        let checksum_start = self.data.len() - 20;
        let mut hasher = Sha1::new();
        hasher.update(&self.data[..checksum_start]);
        let computed = hasher.finalize();
        if computed.as_slice() != &self.data[checksum_start..] {
            return Err(MirrorError::InvalidPack("checksum mismatch".to_string()));
        }
        let mut pack_sha = [0u8; 20];
        pack_sha.copy_from_slice(&self.data[checksum_start..]);

        self.pos = 12;
        let mut raw = Vec::with_capacity(object_count);
        for _ in 0..object_count {
            raw.push(self.read_raw_entry()?);
        }

        // Resolve deltas. Offset bases always precede their entry; ref-delta
        // bases may be anywhere in the pack or in the surrounding DB, so
        // iterate until a pass makes no progress.
        let mut by_offset: HashMap<u64, GitObject> = HashMap::new();
        let mut by_id: HashMap<ObjectId, GitObject> = HashMap::new();
        let mut resolved: Vec<Option<GitObject>> = vec![None; raw.len()];
        let mut remaining = raw.len();

        while remaining > 0 {
            let mut progressed = false;
            for (i, entry) in raw.iter().enumerate() {
                if resolved[i].is_some() {
                    continue;
                }
                let object = match &entry.base {
                    BaseRef::None(object_type) => {
                        Some(Ok(GitObject::new(*object_type, entry.data.clone())))
                    }
                    BaseRef::Offset(base_offset) => by_offset
                        .get(base_offset)
                        .map(|base| apply_delta_object(base, &entry.data)),
                    BaseRef::Id(base_id) => by_id
                        .get(base_id)
                        .cloned()
                        .or_else(|| lookup(base_id))
                        .map(|base| apply_delta_object(&base, &entry.data)),
                };
                if let Some(object) = object {
                    let object = object?;
                    by_offset.insert(entry.offset, object.clone());
                    by_id.insert(object.id, object.clone());
                    resolved[i] = Some(object);
                    remaining -= 1;
                    progressed = true;
                }
            }
            if !progressed {
                return Err(MirrorError::InvalidPack(
                    "unresolvable delta base".to_string(),
                ));
            }
        }

        let mut out = Vec::with_capacity(raw.len());
        for (entry, object) in raw.iter().zip(resolved.into_iter()) {
            let mut crc = Crc::new();
            crc.update(&self.data[entry.offset as usize..entry.end as usize]);
            out.push(PackedObject {
                object: object.expect("all entries resolved"),
                offset: entry.offset,
                crc32: crc.sum(),
            });
        }
        Ok((out, pack_sha))
    }

    fn read_raw_entry(&mut self) -> Result<RawEntry> {
        let offset = self.pos as u64;
        let (type_code, size) = self.read_entry_header()?;

        let base = match type_code {
            TYPE_OFS_DELTA => {
                let rel = self.read_ofs_delta_distance()?;
                let base_offset = offset.checked_sub(rel).ok_or_else(|| {
                    MirrorError::InvalidPack("ofs-delta before pack start".to_string())
                })?;
                BaseRef::Offset(base_offset)
            }
            TYPE_REF_DELTA => {
                if self.pos + 20 > self.data.len() {
                    return Err(MirrorError::InvalidPack(
                        "truncated ref-delta base".to_string(),
                    ));
                }
                let mut id = [0u8; 20];
                id.copy_from_slice(&self.data[self.pos..self.pos + 20]);
                self.pos += 20;
                BaseRef::Id(ObjectId::from_bytes(id))
            }
            code => BaseRef::None(ObjectType::from_pack_type(code)?),
        };

        let data = self.read_zlib(size)?;
        Ok(RawEntry {
            offset,
            end: self.pos as u64,
            base,
            data,
        })
    }

    /// Reads the entry header: 3-bit type and varint size.
    fn read_entry_header(&mut self) -> Result<(u8, usize)> {
        let first_byte = self.next_byte()?;
        let type_code = (first_byte >> 4) & 0x07;
        let mut size = (first_byte & 0x0F) as usize;
        let mut shift = 4;
        let mut byte = first_byte;
        while byte & 0x80 != 0 {
            byte = self.next_byte()?;
            size |= ((byte & 0x7F) as usize) << shift;
            shift += 7;
        }
        Ok((type_code, size))
    }

    /// Reads the ofs-delta base distance (big-endian 7-bit groups with
    /// +1 bias per continuation, per the pack format).
    fn read_ofs_delta_distance(&mut self) -> Result<u64> {
        let mut byte = self.next_byte()?;
        let mut value = (byte & 0x7F) as u64;
        while byte & 0x80 != 0 {
            byte = self.next_byte()?;
            value = ((value + 1) << 7) | (byte & 0x7F) as u64;
        }
        Ok(value)
    }

    fn read_zlib(&mut self, expected_size: usize) -> Result<Vec<u8>> {
        let checksum_start = self.data.len() - 20;
        if self.pos >= checksum_start {
            return Err(MirrorError::InvalidPack(
                "unexpected end of pack".to_string(),
            ));
        }
        let remaining = &self.data[self.pos..checksum_start];
        let mut decoder = ZlibDecoder::new(remaining);
        let mut decompressed = vec![0u8; expected_size];
        decoder
            .read_exact(&mut decompressed)
            .map_err(|e| MirrorError::InvalidPack(format!("decompression failed: {}", e)))?;
        // Drain the zlib trailer so total_in covers the whole stream.
        let mut sink = [0u8; 1];
        if decoder.read(&mut sink).unwrap_or(0) != 0 {
            return Err(MirrorError::InvalidPack(
                "entry larger than declared size".to_string(),
            ));
        }
        self.pos += decoder.total_in() as usize;
        Ok(decompressed)
    }

    fn next_byte(&mut self) -> Result<u8> {
        if self.pos >= self.data.len() {
            return Err(MirrorError::InvalidPack(
                "unexpected end of pack".to_string(),
            ));
        }
        let b = self.data[self.pos];
        self.pos += 1;
        Ok(b)
    }
}

fn apply_delta_object(base: &GitObject, delta: &[u8]) -> Result<GitObject> {
    let data = apply_delta(&base.data, delta)?;
    Ok(GitObject::new(base.object_type, data))
}

/// Applies a git delta (copy/insert instruction stream) to a base buffer.
pub fn apply_delta(base: &[u8], delta: &[u8]) -> Result<Vec<u8>> {
    let mut pos = 0;
    let base_size = read_delta_size(delta, &mut pos)?;
    if base_size != base.len() as u64 {
        return Err(MirrorError::InvalidPack(format!(
            "delta base size mismatch: expected {}, have {}",
            base_size,
            base.len()
        )));
    }
    let result_size = read_delta_size(delta, &mut pos)?;
    let mut result = Vec::with_capacity(result_size as usize);

    while pos < delta.len() {
        let opcode = delta[pos];
        pos += 1;
        if opcode & 0x80 != 0 {
            // Copy from base: bits 0-3 select offset bytes, bits 4-6 size bytes.
            let mut offset: u64 = 0;
            for bit in 0..4 {
                if opcode & (1 << bit) != 0 {
                    let byte = *delta.get(pos).ok_or_else(truncated_delta)?;
                    pos += 1;
                    offset |= (byte as u64) << (8 * bit);
                }
            }
            let mut size: u64 = 0;
            for bit in 0..3 {
                if opcode & (1 << (4 + bit)) != 0 {
                    let byte = *delta.get(pos).ok_or_else(truncated_delta)?;
                    pos += 1;
                    size |= (byte as u64) << (8 * bit);
                }
            }
            if size == 0 {
                size = 0x10000;
            }
            let start = offset as usize;
            let end = start + size as usize;
            if end > base.len() {
                return Err(MirrorError::InvalidPack(
                    "delta copy out of range".to_string(),
                ));
            }
            result.extend_from_slice(&base[start..end]);
        } else if opcode != 0 {
            // Insert literal bytes.
            let len = opcode as usize;
            if pos + len > delta.len() {
                return Err(truncated_delta());
            }
            result.extend_from_slice(&delta[pos..pos + len]);
            pos += len;
        } else {
            return Err(MirrorError::InvalidPack(
                "delta opcode 0 is reserved".to_string(),
            ));
        }
    }

    if result.len() as u64 != result_size {
        return Err(MirrorError::InvalidPack(format!(
            "delta result size mismatch: expected {}, produced {}",
            result_size,
            result.len()
        )));
    }
    Ok(result)
}

fn read_delta_size(delta: &[u8], pos: &mut usize) -> Result<u64> {
    let mut size: u64 = 0;
    let mut shift = 0;
    loop {
        let byte = *delta.get(*pos).ok_or_else(truncated_delta)?;
        *pos += 1;
        size |= ((byte & 0x7F) as u64) << shift;
        shift += 7;
        if byte & 0x80 == 0 {
            return Ok(size);
        }
    }
}

fn truncated_delta() -> MirrorError {
    MirrorError::InvalidPack("truncated delta".to_string())
}

/// One row of a pack index.
#[derive(Debug, Clone)]
pub struct IdxEntry {
    /// Object id.
    pub id: ObjectId,
    /// CRC-32 of the raw entry bytes.
    pub crc32: u32,
    /// Entry offset within the pack.
    pub offset: u64,
}

/// Serializes an idx v2 file for the given entries and pack checksum.
/// Entries are sorted by oid as the format requires.
pub fn write_idx(mut entries: Vec<IdxEntry>, pack_sha: &[u8; 20]) -> Vec<u8> {
    entries.sort_by(|a, b| a.id.as_bytes().cmp(b.id.as_bytes()));

    let mut out = Vec::new();
    out.extend_from_slice(IDX_SIGNATURE);
    out.extend_from_slice(&2u32.to_be_bytes());

    let mut fanout = [0u32; 256];
    for entry in &entries {
        fanout[entry.id.as_bytes()[0] as usize] += 1;
    }
    let mut cumulative = 0u32;
    for count in fanout.iter_mut() {
        cumulative += *count;
        *count = cumulative;
    }
    for count in &fanout {
        out.extend_from_slice(&count.to_be_bytes());
    }

    for entry in &entries {
        out.extend_from_slice(entry.id.as_bytes());
    }
    for entry in &entries {
        out.extend_from_slice(&entry.crc32.to_be_bytes());
    }

    let mut large = Vec::new();
    for entry in &entries {
        if entry.offset < 0x8000_0000 {
            out.extend_from_slice(&(entry.offset as u32).to_be_bytes());
        } else {
            let index = large.len() as u32;
            out.extend_from_slice(&(0x8000_0000u32 | index).to_be_bytes());
            large.push(entry.offset);
        }
    }
    for offset in &large {
        out.extend_from_slice(&offset.to_be_bytes());
    }

    out.extend_from_slice(pack_sha);
    let mut hasher = Sha1::new();
    hasher.update(&out);
    let idx_sha = hasher.finalize();
    out.extend_from_slice(&idx_sha);
    out
}

/// Parses an idx v2 file into its entries.
pub fn parse_idx(data: &[u8]) -> Result<Vec<IdxEntry>> {
    if data.len() < 8 + 256 * 4 + 40 || &data[0..4] != IDX_SIGNATURE {
        return Err(MirrorError::InvalidPack("invalid idx file".to_string()));
    }
    let version = u32::from_be_bytes(data[4..8].try_into().unwrap());
    if version != 2 {
        return Err(MirrorError::InvalidPack(format!(
            "unsupported idx version: {}",
            version
        )));
    }
    let count = u32::from_be_bytes(data[8 + 255 * 4..8 + 256 * 4].try_into().unwrap()) as usize;

    let oid_base = 8 + 256 * 4;
    let crc_base = oid_base + count * 20;
    let off_base = crc_base + count * 4;
    let large_base = off_base + count * 4;
    if data.len() < large_base + 40 {
        return Err(MirrorError::InvalidPack("truncated idx file".to_string()));
    }

    let mut entries = Vec::with_capacity(count);
    for i in 0..count {
        let mut id = [0u8; 20];
        id.copy_from_slice(&data[oid_base + i * 20..oid_base + (i + 1) * 20]);
        let crc32 = u32::from_be_bytes(data[crc_base + i * 4..crc_base + (i + 1) * 4].try_into().unwrap());
        let raw = u32::from_be_bytes(data[off_base + i * 4..off_base + (i + 1) * 4].try_into().unwrap());
        let offset = if raw & 0x8000_0000 != 0 {
            let index = (raw & 0x7FFF_FFFF) as usize;
            let at = large_base + index * 8;
            if data.len() < at + 8 {
                return Err(MirrorError::InvalidPack("truncated large offsets".to_string()));
            }
            u64::from_be_bytes(data[at..at + 8].try_into().unwrap())
        } else {
            raw as u64
        };
        entries.push(IdxEntry {
            id: ObjectId::from_bytes(id),
            crc32,
            offset,
        });
    }
    Ok(entries)
}

/// An installed pack readable in place through its index.
pub struct PackFile {
    pack: Bytes,
    offsets: HashMap<ObjectId, u64>,
}

impl PackFile {
    /// Opens a pack/idx pair from disk.
    pub fn open(pack_path: &Path, idx_path: &Path) -> Result<Self> {
        let idx_data = std::fs::read(idx_path)?;
        let entries = parse_idx(&idx_data)?;
        let pack = Bytes::from(std::fs::read(pack_path)?);
        let offsets = entries.into_iter().map(|e| (e.id, e.offset)).collect();
        Ok(Self { pack, offsets })
    }

    /// Returns true if the pack contains the object.
    pub fn contains(&self, id: &ObjectId) -> bool {
        self.offsets.contains_key(id)
    }

    /// Iterates all object ids in the pack.
    pub fn ids(&self) -> impl Iterator<Item = &ObjectId> {
        self.offsets.keys()
    }

    /// Reads an object out of the pack, resolving delta chains. Bases
    /// outside this pack are fetched through `lookup`.
    pub fn get(
        &self,
        id: &ObjectId,
        lookup: &dyn Fn(&ObjectId) -> Option<GitObject>,
    ) -> Result<Option<GitObject>> {
        match self.offsets.get(id) {
            Some(&offset) => Ok(Some(self.entry_at(offset, lookup)?)),
            None => Ok(None),
        }
    }

    fn entry_at(
        &self,
        offset: u64,
        lookup: &dyn Fn(&ObjectId) -> Option<GitObject>,
    ) -> Result<GitObject> {
        let mut parser = PackParser::new(&self.pack);
        parser.pos = offset as usize;
        let entry = parser.read_raw_entry()?;
        match entry.base {
            BaseRef::None(object_type) => Ok(GitObject::new(object_type, entry.data)),
            BaseRef::Offset(base_offset) => {
                let base = self.entry_at(base_offset, lookup)?;
                apply_delta_object(&base, &entry.data)
            }
            BaseRef::Id(base_id) => {
                let base = match self.offsets.get(&base_id) {
                    Some(&base_offset) => self.entry_at(base_offset, lookup)?,
                    None => lookup(&base_id).ok_or_else(|| {
                        MirrorError::InvalidPack(format!("missing delta base {}", base_id))
                    })?,
                };
                apply_delta_object(&base, &entry.data)
            }
        }
    }
}
