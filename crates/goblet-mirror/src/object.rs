//! Git object types and graph-walking helpers.

use crate::{MirrorError, Result};
use bytes::Bytes;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha1::{Digest, Sha1};
use std::fmt;

/// A 20-byte SHA-1 object identifier.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectId([u8; 20]);

impl Serialize for ObjectId {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for ObjectId {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        ObjectId::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

impl ObjectId {
    /// Creates an ObjectId from raw bytes.
    pub fn from_bytes(bytes: [u8; 20]) -> Self {
        Self(bytes)
    }

    /// Creates an ObjectId from a 40-character hex string.
    pub fn from_hex(hex: &str) -> Result<Self> {
        if hex.len() != 40 {
            return Err(MirrorError::InvalidObject(format!(
                "invalid object id length: {}",
                hex.len()
            )));
        }
        let mut bytes = [0u8; 20];
        hex::decode_to_slice(hex, &mut bytes)
            .map_err(|e| MirrorError::InvalidObject(e.to_string()))?;
        Ok(Self(bytes))
    }

    /// Returns the raw bytes.
    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    /// Returns the hex representation.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Computes the SHA-1 hash of data with a git object header.
    pub fn hash_object(object_type: ObjectType, data: &[u8]) -> Self {
        let header = format!("{} {}\0", object_type.as_str(), data.len());
        let mut hasher = Sha1::new();
        hasher.update(header.as_bytes());
        hasher.update(data);
        let result = hasher.finalize();
        let mut bytes = [0u8; 20];
        bytes.copy_from_slice(&result);
        Self(bytes)
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectId({})", self.to_hex())
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// Git object types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectType {
    /// File content.
    Blob,
    /// Directory listing.
    Tree,
    /// Commit object.
    Commit,
    /// Annotated tag.
    Tag,
}

impl ObjectType {
    /// Returns the string representation used in git.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Blob => "blob",
            Self::Tree => "tree",
            Self::Commit => "commit",
            Self::Tag => "tag",
        }
    }

    /// Parses an object type from a string.
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "blob" => Ok(Self::Blob),
            "tree" => Ok(Self::Tree),
            "commit" => Ok(Self::Commit),
            "tag" => Ok(Self::Tag),
            _ => Err(MirrorError::InvalidObject(format!(
                "unknown object type: {}",
                s
            ))),
        }
    }

    /// Returns the type code used in pack files.
    pub fn pack_type(&self) -> u8 {
        match self {
            Self::Commit => 1,
            Self::Tree => 2,
            Self::Blob => 3,
            Self::Tag => 4,
        }
    }

    /// Parses an object type from a pack file type code.
    pub fn from_pack_type(code: u8) -> Result<Self> {
        match code {
            1 => Ok(Self::Commit),
            2 => Ok(Self::Tree),
            3 => Ok(Self::Blob),
            4 => Ok(Self::Tag),
            _ => Err(MirrorError::InvalidObject(format!(
                "unknown pack type: {}",
                code
            ))),
        }
    }
}

/// A git object (blob, tree, commit, or tag).
#[derive(Debug, Clone)]
pub struct GitObject {
    /// The object's unique identifier (SHA-1 hash).
    pub id: ObjectId,
    /// The type of object.
    pub object_type: ObjectType,
    /// The raw object data (uncompressed, without the loose header).
    pub data: Bytes,
}

/// A single entry in a tree object.
#[derive(Debug, Clone)]
pub struct TreeEntry {
    /// File mode as recorded in the tree (e.g. `100644`, `40000`).
    pub mode: u32,
    /// Entry name.
    pub name: String,
    /// Target object id.
    pub id: ObjectId,
}

impl TreeEntry {
    /// Returns true if this entry points at a subtree.
    pub fn is_tree(&self) -> bool {
        self.mode & 0o170000 == 0o040000
    }

    /// Returns true if this entry is a gitlink (submodule commit).
    pub fn is_gitlink(&self) -> bool {
        self.mode & 0o170000 == 0o160000
    }
}

impl GitObject {
    /// Creates a new git object, computing its ID from the data.
    pub fn new(object_type: ObjectType, data: impl Into<Bytes>) -> Self {
        let data = data.into();
        let id = ObjectId::hash_object(object_type, &data);
        Self {
            id,
            object_type,
            data,
        }
    }

    /// Creates a blob object.
    pub fn blob(content: impl Into<Bytes>) -> Self {
        Self::new(ObjectType::Blob, content)
    }

    /// Creates a commit object.
    pub fn commit(
        tree_id: &ObjectId,
        parents: &[ObjectId],
        author: &str,
        committer: &str,
        message: &str,
    ) -> Self {
        let mut content = format!("tree {}\n", tree_id);
        for parent in parents {
            content.push_str(&format!("parent {}\n", parent));
        }
        content.push_str(&format!("author {}\n", author));
        content.push_str(&format!("committer {}\n", committer));
        content.push_str(&format!("\n{}", message));
        Self::new(ObjectType::Commit, content.into_bytes())
    }

    /// Creates a tree object from entries. Entries are sorted the way git
    /// sorts them (directories compare as if suffixed with `/`).
    pub fn tree(mut entries: Vec<TreeEntry>) -> Self {
        entries.sort_by(|a, b| {
            let ka = tree_sort_key(a);
            let kb = tree_sort_key(b);
            ka.cmp(&kb)
        });
        let mut data = Vec::new();
        for entry in &entries {
            data.extend_from_slice(format!("{:o} {}", entry.mode, entry.name).as_bytes());
            data.push(0);
            data.extend_from_slice(entry.id.as_bytes());
        }
        Self::new(ObjectType::Tree, data)
    }

    /// Creates an annotated tag object.
    pub fn tag(target: &ObjectId, target_type: ObjectType, name: &str, tagger: &str) -> Self {
        let content = format!(
            "object {}\ntype {}\ntag {}\ntagger {}\n\n{}\n",
            target,
            target_type.as_str(),
            name,
            tagger,
            name
        );
        Self::new(ObjectType::Tag, content.into_bytes())
    }

    /// Returns the size of the object data.
    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// For a commit, returns its tree id and parent ids.
    pub fn commit_links(&self) -> Result<(ObjectId, Vec<ObjectId>)> {
        if self.object_type != ObjectType::Commit {
            return Err(MirrorError::InvalidObject(format!(
                "commit_links on a {}",
                self.object_type.as_str()
            )));
        }
        let mut tree = None;
        let mut parents = Vec::new();
        for line in self.data.split(|&b| b == b'\n') {
            if line.is_empty() {
                break;
            }
            if let Some(rest) = line.strip_prefix(b"tree ") {
                tree = Some(ObjectId::from_hex(std::str::from_utf8(rest).map_err(
                    |_| MirrorError::InvalidObject("non-utf8 tree line".into()),
                )?)?);
            } else if let Some(rest) = line.strip_prefix(b"parent ") {
                parents.push(ObjectId::from_hex(std::str::from_utf8(rest).map_err(
                    |_| MirrorError::InvalidObject("non-utf8 parent line".into()),
                )?)?);
            }
        }
        let tree = tree
            .ok_or_else(|| MirrorError::InvalidObject("commit without tree header".into()))?;
        Ok((tree, parents))
    }

    /// For a tree, parses its entries in on-disk order.
    pub fn tree_entries(&self) -> Result<Vec<TreeEntry>> {
        if self.object_type != ObjectType::Tree {
            return Err(MirrorError::InvalidObject(format!(
                "tree_entries on a {}",
                self.object_type.as_str()
            )));
        }
        let mut entries = Vec::new();
        let mut rest: &[u8] = &self.data;
        while !rest.is_empty() {
            let null_pos = rest
                .iter()
                .position(|&b| b == 0)
                .ok_or_else(|| MirrorError::InvalidObject("tree entry missing NUL".into()))?;
            if rest.len() < null_pos + 21 {
                return Err(MirrorError::InvalidObject("truncated tree entry".into()));
            }
            let header = std::str::from_utf8(&rest[..null_pos])
                .map_err(|_| MirrorError::InvalidObject("non-utf8 tree entry".into()))?;
            let (mode_str, name) = header
                .split_once(' ')
                .ok_or_else(|| MirrorError::InvalidObject("tree entry missing mode".into()))?;
            let mode = u32::from_str_radix(mode_str, 8)
                .map_err(|_| MirrorError::InvalidObject("bad tree entry mode".into()))?;
            let mut id = [0u8; 20];
            id.copy_from_slice(&rest[null_pos + 1..null_pos + 21]);
            entries.push(TreeEntry {
                mode,
                name: name.to_string(),
                id: ObjectId::from_bytes(id),
            });
            rest = &rest[null_pos + 21..];
        }
        Ok(entries)
    }

    /// For an annotated tag, returns the target object id and type.
    pub fn tag_target(&self) -> Result<(ObjectId, ObjectType)> {
        if self.object_type != ObjectType::Tag {
            return Err(MirrorError::InvalidObject(format!(
                "tag_target on a {}",
                self.object_type.as_str()
            )));
        }
        let mut target = None;
        let mut target_type = None;
        for line in self.data.split(|&b| b == b'\n') {
            if line.is_empty() {
                break;
            }
            if let Some(rest) = line.strip_prefix(b"object ") {
                target = Some(ObjectId::from_hex(std::str::from_utf8(rest).map_err(
                    |_| MirrorError::InvalidObject("non-utf8 object line".into()),
                )?)?);
            } else if let Some(rest) = line.strip_prefix(b"type ") {
                target_type = Some(ObjectType::parse(std::str::from_utf8(rest).map_err(
                    |_| MirrorError::InvalidObject("non-utf8 type line".into()),
                )?)?);
            }
        }
        match (target, target_type) {
            (Some(t), Some(ty)) => Ok((t, ty)),
            _ => Err(MirrorError::InvalidObject(
                "tag without object/type headers".into(),
            )),
        }
    }
}

fn tree_sort_key(entry: &TreeEntry) -> Vec<u8> {
    let mut key = entry.name.as_bytes().to_vec();
    if entry.is_tree() {
        key.push(b'/');
    }
    key
}
