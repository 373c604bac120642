//! # Goblet Mirror
//!
//! On-disk, bare-repo-shaped mirror cache for the Goblet proxy.
//!
//! Each upstream repository maps to one mirror directory holding a loose +
//! packed object database, a loose ref namespace with a symbolic HEAD, and a
//! `.goblet/meta.json` metadata record. The object DB is additive-only; pack
//! installs and ref updates are atomic.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod error;
mod meta;
mod object;
mod odb;
pub mod pack;
mod refs;
mod store;

pub use error::{MirrorError, Result};
pub use meta::MirrorMeta;
pub use object::{GitObject, ObjectId, ObjectType, TreeEntry};
pub use odb::ObjectDb;
pub use pack::{PackBuilder, PackParser};
pub use refs::{RefDb, RefUpdate, Reference};
pub use store::{Mirror, MirrorStore, RefEntry, RemoteUrl};
