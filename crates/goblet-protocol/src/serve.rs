//! Response materialization: builds v2 `ls-refs` and `fetch` responses from
//! a local mirror, including negotiation, shallow handling, partial-clone
//! filters, and sideband pack streaming.

use crate::pktline::PktLineWriter;
use crate::request::ParsedRequest;
use crate::sideband::{write_band, Band, SidebandWriter};
use crate::{ProtocolError, Result};
use goblet_mirror::pack::stream_pack;
use goblet_mirror::{GitObject, Mirror, ObjectId, ObjectType, RefEntry};
use std::collections::{HashSet, VecDeque};
use std::io::Write;

/// Capability advertisement for `GET /info/refs?service=git-upload-pack`.
///
/// Protocol v2 is advertised unconditionally.
pub fn advertisement(agent: &str) -> Vec<u8> {
    let mut out = Vec::new();
    let mut writer = PktLineWriter::new(&mut out);
    writer
        .write_line("# service=git-upload-pack")
        .expect("vec write");
    writer.flush_pkt().expect("vec write");
    writer.write_line("version 2").expect("vec write");
    writer.write_line(&format!("agent={}", agent)).expect("vec write");
    writer.write_line("ls-refs").expect("vec write");
    writer
        .write_line("fetch=shallow filter ref-in-want sideband-all")
        .expect("vec write");
    writer.write_line("server-option").expect("vec write");
    writer.write_line("object-format=sha1").expect("vec write");
    writer.flush_pkt().expect("vec write");
    out
}

/// Builds a complete `ls-refs` response from the mirror's current refs.
pub fn ls_refs_response(mirror: &Mirror, req: &ParsedRequest) -> Result<Vec<u8>> {
    let snapshot = mirror.refs_snapshot()?;
    let mut out = Vec::new();
    let mut writer = PktLineWriter::new(&mut out);

    for entry in &snapshot {
        if !prefix_match(&entry.name, &req.ref_prefixes) {
            continue;
        }
        let mut line = format!("{} {}", entry.target, entry.name);
        if req.symrefs {
            if let Some(target) = &entry.symref_target {
                line.push_str(&format!(" symref-target:{}", target));
            }
        }
        if req.peel {
            if let Some(peeled) = &entry.peeled {
                line.push_str(&format!(" peeled:{}", peeled));
            }
        }
        writer.write_line(&line)?;
    }
    writer.flush_pkt()?;
    Ok(out)
}

fn prefix_match(name: &str, prefixes: &[String]) -> bool {
    prefixes.is_empty() || prefixes.iter().any(|p| name.starts_with(p.as_str()))
}

/// Outcome of a materialized fetch response.
#[derive(Debug, Clone, Copy, Default)]
pub struct FetchStats {
    /// Objects written into the pack (0 when no packfile section was sent).
    pub objects: usize,
    /// Raw pack bytes before sideband framing.
    pub pack_bytes: u64,
}

/// Builds a complete v2 `fetch` response, streaming the pack through `out`.
///
/// The response is deterministic for a given mirror snapshot and request
/// fingerprint: same sections, same object set.
pub fn fetch_response<W: Write + ?Sized>(
    mirror: &Mirror,
    req: &ParsedRequest,
    out: &mut W,
) -> Result<FetchStats> {
    if !req.unknown.is_empty() {
        tracing::debug!(tokens = ?req.unknown, "Ignoring unknown fetch arguments");
    }
    let filter = PackFilter::parse(&req.filters)?;

    // Resolve want-refs against the snapshot and validate want oids.
    let snapshot = mirror.refs_snapshot()?;
    let mut wanted_refs: Vec<(String, ObjectId)> = Vec::new();
    for name in &req.want_refs {
        let entry = snapshot.iter().find(|e| &e.name == name).ok_or_else(|| {
            ProtocolError::NotOurRef(name.clone())
        })?;
        wanted_refs.push((name.clone(), entry.target));
    }
    let mut tips: Vec<ObjectId> = req.wants.clone();
    tips.extend(wanted_refs.iter().map(|(_, oid)| *oid));
    tips.sort();
    tips.dedup();
    if tips.is_empty() {
        return Err(ProtocolError::Protocol("fetch without wants".to_string()));
    }
    for tip in &tips {
        if !mirror.has_object(tip) {
            return Err(ProtocolError::NotOurRef(tip.to_hex()));
        }
    }

    let common: Vec<ObjectId> = {
        let mut c: Vec<ObjectId> = req
            .haves
            .iter()
            .copied()
            .filter(|h| mirror.has_object(h))
            .collect();
        c.sort();
        c.dedup();
        c
    };

    let mut writer = PktLineWriter::new(out);
    let mut sections = 0usize;

    // acknowledgments: only during negotiation (client has not said done).
    if !req.done {
        writer.write_line("acknowledgments")?;
        if common.is_empty() {
            writer.write_line("NAK")?;
        } else {
            for oid in &common {
                writer.write_line(&format!("ACK {}", oid))?;
            }
        }
        if req.wait_for_done {
            // The client insists on finishing negotiation first.
            writer.flush_pkt()?;
            writer.flush()?;
            return Ok(FetchStats::default());
        }
        writer.write_line("ready")?;
        sections += 1;
    }

    let walk = collect_pack_objects(mirror, &tips, &common, req, &filter, &snapshot)?;

    if !walk.shallow.is_empty() || !walk.unshallow.is_empty() {
        if sections > 0 {
            writer.delim_pkt()?;
        }
        writer.write_line("shallow-info")?;
        for oid in &walk.shallow {
            writer.write_line(&format!("shallow {}", oid))?;
        }
        for oid in &walk.unshallow {
            writer.write_line(&format!("unshallow {}", oid))?;
        }
        sections += 1;
    }

    if !wanted_refs.is_empty() {
        if sections > 0 {
            writer.delim_pkt()?;
        }
        writer.write_line("wanted-refs")?;
        for (name, oid) in &wanted_refs {
            writer.write_line(&format!("{} {}", oid, name))?;
        }
        sections += 1;
    }

    if sections > 0 {
        writer.delim_pkt()?;
    }
    writer.write_line("packfile")?;
    if req.sideband_all && !req.no_progress {
        write_band(
            &mut writer,
            Band::Progress,
            format!("Enumerating objects: {}, done.\n", walk.ids.len()).as_bytes(),
        )?;
    }

    let count = walk.ids.len();
    let mut band_writer = SidebandWriter::new(&mut writer);
    let pack_bytes = stream_pack(
        walk.ids.iter().map(|id| mirror.object(id)),
        count,
        &mut band_writer,
    )?;
    band_writer.finish()?;
    writer.flush_pkt()?;
    writer.flush()?;

    Ok(FetchStats {
        objects: count,
        pack_bytes,
    })
}

/// Partial-clone filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackFilter {
    /// No filtering.
    None,
    /// `blob:none` — exclude all blobs.
    BlobNone,
    /// `blob:limit=<n>` — exclude blobs larger than `n` bytes.
    BlobLimit(u64),
    /// `tree:<depth>` — exclude trees and blobs at depth >= `depth` from the
    /// root tree.
    TreeDepth(u32),
}

impl PackFilter {
    /// Parses the request's filter spec list (at most one spec).
    pub fn parse(specs: &[String]) -> Result<Self> {
        match specs {
            [] => Ok(Self::None),
            [spec] => Self::parse_one(spec),
            _ => Err(ProtocolError::Protocol(
                "combined filters are not supported".to_string(),
            )),
        }
    }

    fn parse_one(spec: &str) -> Result<Self> {
        if spec == "blob:none" {
            return Ok(Self::BlobNone);
        }
        if let Some(limit) = spec.strip_prefix("blob:limit=") {
            return Ok(Self::BlobLimit(parse_size(limit)?));
        }
        if let Some(depth) = spec.strip_prefix("tree:") {
            let depth: u32 = depth.parse().map_err(|_| {
                ProtocolError::Protocol(format!("invalid tree depth: {:?}", depth))
            })?;
            return Ok(Self::TreeDepth(depth));
        }
        Err(ProtocolError::Protocol(format!(
            "unsupported filter: {:?}",
            spec
        )))
    }

    fn admits_blob(&self, size: u64, depth: u32) -> bool {
        match self {
            Self::None => true,
            Self::BlobNone => false,
            Self::BlobLimit(limit) => size <= *limit,
            Self::TreeDepth(max) => depth < *max,
        }
    }

    fn admits_tree(&self, depth: u32) -> bool {
        match self {
            Self::TreeDepth(max) => depth < *max,
            _ => true,
        }
    }
}

fn parse_size(s: &str) -> Result<u64> {
    let (digits, multiplier) = match s.as_bytes().last() {
        Some(b'k') | Some(b'K') => (&s[..s.len() - 1], 1024),
        Some(b'm') | Some(b'M') => (&s[..s.len() - 1], 1024 * 1024),
        Some(b'g') | Some(b'G') => (&s[..s.len() - 1], 1024 * 1024 * 1024),
        _ => (s, 1),
    };
    let value: u64 = digits
        .parse()
        .map_err(|_| ProtocolError::Protocol(format!("invalid blob limit: {:?}", s)))?;
    Ok(value * multiplier)
}

struct Walk {
    /// Object ids in deterministic pack order.
    ids: Vec<ObjectId>,
    shallow: Vec<ObjectId>,
    unshallow: Vec<ObjectId>,
}

/// Computes the object closure of the wants minus the closure of the common
/// haves, honoring deepen limits and the partial-clone filter.
fn collect_pack_objects(
    mirror: &Mirror,
    tips: &[ObjectId],
    common: &[ObjectId],
    req: &ParsedRequest,
    filter: &PackFilter,
    snapshot: &[RefEntry],
) -> Result<Walk> {
    // Everything reachable from the common haves is excluded from the pack.
    let have_commits = commit_closure(mirror, common)?;
    let mut have_objects: HashSet<ObjectId> = HashSet::new();
    for commit_id in &have_commits {
        have_objects.insert(*commit_id);
        let (tree, _) = mirror.object(commit_id)?.commit_links()?;
        expand_tree_unfiltered(mirror, &tree, &mut have_objects)?;
    }

    // Closures of deepen-not refs also act as exclusions.
    let mut deepen_not_commits: HashSet<ObjectId> = HashSet::new();
    for name in &req.deepen_not {
        let entry = snapshot
            .iter()
            .find(|e| &e.name == name)
            .ok_or_else(|| ProtocolError::NotOurRef(name.clone()))?;
        let tip = peel_to_commit(mirror, &entry.target)?;
        deepen_not_commits.extend(commit_closure(mirror, &[tip])?);
    }

    let client_shallow: HashSet<ObjectId> = req.shallow.iter().copied().collect();
    let deepening = req.deepen.is_some() || req.deepen_since.is_some() || !req.deepen_not.is_empty();

    // Commit walk from the tips. Tags peel down to their commits; the tag
    // objects themselves are included in the pack.
    let mut ids: Vec<ObjectId> = Vec::new();
    let mut seen: HashSet<ObjectId> = HashSet::new();
    let mut commits: Vec<(ObjectId, u32)> = Vec::new();
    let mut shallow: Vec<ObjectId> = Vec::new();
    let mut unshallow: Vec<ObjectId> = Vec::new();
    let mut queue: VecDeque<(ObjectId, u32)> = VecDeque::new();

    for tip in tips {
        let mut id = *tip;
        loop {
            let object = mirror.object(&id)?;
            match object.object_type {
                ObjectType::Tag => {
                    if seen.insert(id) {
                        ids.push(id);
                    }
                    id = object.tag_target()?.0;
                }
                ObjectType::Commit => {
                    queue.push_back((id, 0));
                    break;
                }
                // A want may name a tree or blob directly (e.g. via
                // allow-any-sha1); pack its subtree and stop.
                ObjectType::Tree => {
                    if seen.insert(id) && filter.admits_tree(0) {
                        ids.push(id);
                        expand_tree_filtered(mirror, &id, 1, filter, &have_objects, &mut seen, &mut ids)?;
                    }
                    break;
                }
                ObjectType::Blob => {
                    if !have_objects.contains(&id) && seen.insert(id) {
                        ids.push(id);
                    }
                    break;
                }
            }
        }
    }

    while let Some((commit_id, depth)) = queue.pop_front() {
        if seen.contains(&commit_id)
            || have_commits.contains(&commit_id)
            || deepen_not_commits.contains(&commit_id)
        {
            continue;
        }
        let object = mirror.object(&commit_id)?;
        if let Some(since) = req.deepen_since {
            if commit_time(&object)? < since {
                continue;
            }
        }
        seen.insert(commit_id);
        commits.push((commit_id, depth));

        let at_depth_limit = req.deepen.map(|n| depth + 1 >= n).unwrap_or(false);
        let (_, parents) = object.commit_links()?;

        // Without a deepen request, an existing client shallow boundary stays
        // where it is; with one, we may walk past it and unshallow the commit.
        let stop_here = if client_shallow.contains(&commit_id) {
            if deepening && !at_depth_limit {
                unshallow.push(commit_id);
                false
            } else {
                true
            }
        } else {
            at_depth_limit
        };

        if stop_here {
            if !parents.is_empty() && !client_shallow.contains(&commit_id) {
                shallow.push(commit_id);
            }
            continue;
        }
        let mut boundary = false;
        for parent in &parents {
            if deepen_not_commits.contains(parent) {
                boundary = true;
                continue;
            }
            if let Some(since) = req.deepen_since {
                let parent_obj = mirror.object(parent)?;
                if commit_time(&parent_obj)? < since {
                    boundary = true;
                    continue;
                }
            }
            queue.push_back((*parent, depth + 1));
        }
        if boundary && deepening {
            shallow.push(commit_id);
        }
    }

    // Deterministic order: commits in walk order, then each commit's tree
    // expansion in entry order.
    for (commit_id, _) in &commits {
        ids.push(*commit_id);
    }
    for (commit_id, _) in &commits {
        let (tree, _) = mirror.object(commit_id)?.commit_links()?;
        if !have_objects.contains(&tree) && filter.admits_tree(0) && seen.insert(tree) {
            ids.push(tree);
        }
        if filter.admits_tree(0) {
            expand_tree_filtered(mirror, &tree, 1, filter, &have_objects, &mut seen, &mut ids)?;
        }
    }

    // include-tag: annotated tags whose peeled target made it into the pack.
    if req.include_tag {
        for entry in snapshot {
            if !entry.name.starts_with("refs/tags/") {
                continue;
            }
            if let Some(peeled) = entry.peeled {
                if seen.contains(&peeled) && !seen.contains(&entry.target) {
                    seen.insert(entry.target);
                    ids.push(entry.target);
                }
            }
        }
    }

    shallow.sort();
    shallow.dedup();
    unshallow.sort();
    unshallow.dedup();
    Ok(Walk {
        ids,
        shallow,
        unshallow,
    })
}

/// All commits reachable from the given tips (tags peel to their targets).
fn commit_closure(mirror: &Mirror, tips: &[ObjectId]) -> Result<HashSet<ObjectId>> {
    let mut commits = HashSet::new();
    let mut visited = HashSet::new();
    let mut queue: VecDeque<ObjectId> = tips.iter().copied().collect();
    while let Some(id) = queue.pop_front() {
        if !visited.insert(id) {
            continue;
        }
        let object = match mirror.object(&id) {
            Ok(object) => object,
            // A have the mirror only partially knows is simply not common.
            Err(goblet_mirror::MirrorError::ObjectNotFound(_)) => continue,
            Err(e) => return Err(e.into()),
        };
        match object.object_type {
            ObjectType::Commit => {
                commits.insert(id);
                let (_, parents) = object.commit_links()?;
                for parent in parents {
                    queue.push_back(parent);
                }
            }
            ObjectType::Tag => {
                queue.push_back(object.tag_target()?.0);
            }
            _ => {}
        }
    }
    Ok(commits)
}

fn peel_to_commit(mirror: &Mirror, id: &ObjectId) -> Result<ObjectId> {
    let mut current = *id;
    for _ in 0..10 {
        let object = mirror.object(&current)?;
        match object.object_type {
            ObjectType::Commit => return Ok(current),
            ObjectType::Tag => current = object.tag_target()?.0,
            other => {
                return Err(ProtocolError::Protocol(format!(
                    "expected commit, found {}",
                    other.as_str()
                )))
            }
        }
    }
    Err(ProtocolError::Protocol("tag chain too deep".to_string()))
}

/// Committer timestamp (seconds since epoch) of a commit object.
fn commit_time(object: &GitObject) -> Result<i64> {
    for line in object.data.split(|&b| b == b'\n') {
        if line.is_empty() {
            break;
        }
        if let Some(rest) = line.strip_prefix(b"committer ") {
            let text = std::str::from_utf8(rest)
                .map_err(|_| ProtocolError::Protocol("non-utf8 committer line".to_string()))?;
            let mut parts = text.rsplitn(3, ' ');
            let _tz = parts.next();
            let ts = parts
                .next()
                .ok_or_else(|| ProtocolError::Protocol("malformed committer line".to_string()))?;
            return ts.parse().map_err(|_| {
                ProtocolError::Protocol(format!("invalid committer timestamp: {:?}", ts))
            });
        }
    }
    Err(ProtocolError::Protocol(
        "commit without committer line".to_string(),
    ))
}

/// Expands a tree into the have-set without filtering.
fn expand_tree_unfiltered(
    mirror: &Mirror,
    tree_id: &ObjectId,
    out: &mut HashSet<ObjectId>,
) -> Result<()> {
    if !out.insert(*tree_id) {
        return Ok(());
    }
    let tree = match mirror.object(tree_id) {
        Ok(tree) => tree,
        Err(goblet_mirror::MirrorError::ObjectNotFound(_)) => return Ok(()),
        Err(e) => return Err(e.into()),
    };
    for entry in tree.tree_entries()? {
        if entry.is_gitlink() {
            continue;
        }
        if entry.is_tree() {
            expand_tree_unfiltered(mirror, &entry.id, out)?;
        } else {
            out.insert(entry.id);
        }
    }
    Ok(())
}

/// Expands a tree's children at `depth`, honoring the filter and skipping
/// objects the client already has.
fn expand_tree_filtered(
    mirror: &Mirror,
    tree_id: &ObjectId,
    depth: u32,
    filter: &PackFilter,
    have: &HashSet<ObjectId>,
    seen: &mut HashSet<ObjectId>,
    out: &mut Vec<ObjectId>,
) -> Result<()> {
    let tree = mirror.object(tree_id)?;
    for entry in tree.tree_entries()? {
        if entry.is_gitlink() || have.contains(&entry.id) {
            continue;
        }
        if entry.is_tree() {
            if !filter.admits_tree(depth) {
                continue;
            }
            if seen.insert(entry.id) {
                out.push(entry.id);
                expand_tree_filtered(mirror, &entry.id, depth + 1, filter, have, seen, out)?;
            }
        } else {
            let size = mirror.object(&entry.id)?.size() as u64;
            if filter.admits_blob(size, depth) && seen.insert(entry.id) {
                out.push(entry.id);
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pktline::{PktLine, PktLineReader};
    use crate::request::parse_request;
    use crate::sideband::SidebandReader;
    use goblet_mirror::{MirrorStore, PackParser, RefUpdate, RemoteUrl, TreeEntry};
    use std::io::Cursor;
    use tempfile::TempDir;

    const AUTHOR: &str = "Alice <alice@example.com> 1700000000 +0000";

    struct Fixture {
        _root: TempDir,
        mirror: std::sync::Arc<Mirror>,
        tip: ObjectId,
        old_tip: ObjectId,
        blob: ObjectId,
        tag: ObjectId,
    }

    /// Two-commit history with a blob, a subtree, and an annotated tag.
    fn fixture() -> Fixture {
        let root = TempDir::new().unwrap();
        let store = MirrorStore::open(root.path()).unwrap();
        let mirror = store
            .open_or_create(&RemoteUrl::new("https", "example.com", "demo/repo"))
            .unwrap();

        let blob = GitObject::blob(b"fn main() {}\n".to_vec());
        let readme = GitObject::blob(b"# demo\n".to_vec());
        mirror.put_object(&blob).unwrap();
        mirror.put_object(&readme).unwrap();

        let subtree = GitObject::tree(vec![TreeEntry {
            mode: 0o100644,
            name: "main.rs".into(),
            id: blob.id,
        }]);
        mirror.put_object(&subtree).unwrap();
        let tree1 = GitObject::tree(vec![TreeEntry {
            mode: 0o100644,
            name: "README.md".into(),
            id: readme.id,
        }]);
        mirror.put_object(&tree1).unwrap();
        let tree2 = GitObject::tree(vec![
            TreeEntry {
                mode: 0o100644,
                name: "README.md".into(),
                id: readme.id,
            },
            TreeEntry {
                mode: 0o040000,
                name: "src".into(),
                id: subtree.id,
            },
        ]);
        mirror.put_object(&tree2).unwrap();

        let c1 = GitObject::commit(&tree1.id, &[], AUTHOR, AUTHOR, "initial");
        mirror.put_object(&c1).unwrap();
        let c2 = GitObject::commit(&tree2.id, &[c1.id], AUTHOR, AUTHOR, "add src");
        mirror.put_object(&c2).unwrap();

        let tag = GitObject::tag(&c2.id, ObjectType::Commit, "v1", AUTHOR);
        mirror.put_object(&tag).unwrap();

        mirror
            .update_refs(&[
                RefUpdate {
                    name: "refs/heads/main".into(),
                    expected: None,
                    target: Some(c2.id),
                },
                RefUpdate {
                    name: "refs/tags/v1".into(),
                    expected: None,
                    target: Some(tag.id),
                },
            ])
            .unwrap();

        Fixture {
            _root: root,
            mirror,
            tip: c2.id,
            old_tip: c1.id,
            blob: blob.id,
            tag: tag.id,
        }
    }

    fn request(lines: &[String]) -> ParsedRequest {
        let mut buf = Vec::new();
        let mut writer = PktLineWriter::new(&mut buf);
        let mut iter = lines.iter();
        writer.write_line(iter.next().unwrap()).unwrap();
        writer.delim_pkt().unwrap();
        for line in iter {
            writer.write_line(line).unwrap();
        }
        writer.flush_pkt().unwrap();
        parse_request(&buf).unwrap()
    }

    /// Extracts the raw pack from a fetch response body and parses it.
    fn unpack(response: &[u8]) -> Vec<GitObject> {
        let mut reader = PktLineReader::new(Cursor::new(response.to_vec()));
        // Skip sections until the packfile header line.
        loop {
            match reader.read().unwrap() {
                Some(PktLine::Data(data)) => {
                    if data.as_slice() == b"packfile\n" {
                        break;
                    }
                }
                Some(_) => {}
                None => panic!("no packfile section in response"),
            }
        }
        let mut sideband = SidebandReader::new(reader);
        let pack = sideband.read_all_data().unwrap();
        let mut parser = PackParser::new(&pack);
        parser
            .parse_with(|_| None)
            .unwrap()
            .0
            .into_iter()
            .map(|p| p.object)
            .collect()
    }

    #[test]
    fn test_advertisement_contents() {
        let ad = advertisement("goblet/0.1.0");
        let text = String::from_utf8_lossy(&ad);
        assert!(text.contains("# service=git-upload-pack"));
        assert!(text.contains("version 2"));
        assert!(text.contains("ls-refs"));
        assert!(text.contains("fetch=shallow filter ref-in-want sideband-all"));
        assert!(text.contains("object-format=sha1"));
    }

    #[test]
    fn test_ls_refs_all() {
        let fx = fixture();
        let req = request(&["command=ls-refs".into(), "symrefs".into(), "peel".into()]);
        let body = ls_refs_response(&fx.mirror, &req).unwrap();
        let text = String::from_utf8_lossy(&body);

        let lines: Vec<&str> = text.lines().collect();
        assert!(lines[0].contains("HEAD symref-target:refs/heads/main"));
        assert!(text.contains(&format!("{} refs/heads/main", fx.tip)));
        assert!(text.contains(&format!("{} refs/tags/v1 peeled:{}", fx.tag, fx.tip)));
    }

    #[test]
    fn test_ls_refs_prefix_filter_sorted() {
        let fx = fixture();
        let req = request(&[
            "command=ls-refs".into(),
            "peel".into(),
            "ref-prefix refs/tags/".into(),
        ]);
        let body = ls_refs_response(&fx.mirror, &req).unwrap();
        let text = String::from_utf8_lossy(&body);

        assert!(!text.contains("refs/heads/"));
        assert!(!text.contains("HEAD"));
        assert!(text.contains(&format!("{} refs/tags/v1 peeled:{}", fx.tag, fx.tip)));
    }

    #[test]
    fn test_fetch_full_clone() {
        let fx = fixture();
        let req = request(&[
            "command=fetch".into(),
            format!("want {}", fx.tip),
            "done".into(),
        ]);
        let mut out = Vec::new();
        let stats = fetch_response(&fx.mirror, &req, &mut out).unwrap();

        let objects = unpack(&out);
        // 2 commits + 3 trees + 2 blobs
        assert_eq!(objects.len(), 7);
        assert_eq!(stats.objects, 7);
        assert!(objects.iter().any(|o| o.id == fx.blob));
        assert!(objects.iter().any(|o| o.id == fx.tip));
    }

    #[test]
    fn test_fetch_incremental_excludes_have_closure() {
        let fx = fixture();
        let req = request(&[
            "command=fetch".into(),
            format!("want {}", fx.tip),
            format!("have {}", fx.old_tip),
            "done".into(),
        ]);
        let mut out = Vec::new();
        fetch_response(&fx.mirror, &req, &mut out).unwrap();

        let objects = unpack(&out);
        // c2, tree2, subtree, main.rs blob. README and c1/tree1 are had.
        assert_eq!(objects.len(), 4);
        assert!(objects.iter().all(|o| o.id != fx.old_tip));
        assert!(objects.iter().any(|o| o.id == fx.blob));
    }

    #[test]
    fn test_fetch_negotiation_acks() {
        let fx = fixture();
        let req = request(&[
            "command=fetch".into(),
            format!("want {}", fx.tip),
            format!("have {}", fx.old_tip),
        ]);
        let mut out = Vec::new();
        fetch_response(&fx.mirror, &req, &mut out).unwrap();
        let text = String::from_utf8_lossy(&out);

        assert!(text.contains("acknowledgments"));
        assert!(text.contains(&format!("ACK {}", fx.old_tip)));
        assert!(text.contains("ready"));
        assert!(text.contains("packfile"));
    }

    #[test]
    fn test_fetch_nak_when_no_common() {
        let fx = fixture();
        let req = request(&[
            "command=fetch".into(),
            format!("want {}", fx.tip),
            format!("have {}", "c".repeat(40)),
        ]);
        let mut out = Vec::new();
        fetch_response(&fx.mirror, &req, &mut out).unwrap();
        let text = String::from_utf8_lossy(&out);
        assert!(text.contains("NAK"));
    }

    #[test]
    fn test_fetch_wait_for_done_suppresses_pack() {
        let fx = fixture();
        let req = request(&[
            "command=fetch".into(),
            format!("want {}", fx.tip),
            format!("have {}", fx.old_tip),
            "wait-for-done".into(),
        ]);
        let mut out = Vec::new();
        let stats = fetch_response(&fx.mirror, &req, &mut out).unwrap();
        let text = String::from_utf8_lossy(&out);

        assert_eq!(stats.objects, 0);
        assert!(text.contains("acknowledgments"));
        assert!(!text.contains("packfile"));
    }

    #[test]
    fn test_fetch_blob_none_filter() {
        let fx = fixture();
        let req = request(&[
            "command=fetch".into(),
            format!("want {}", fx.tip),
            "filter blob:none".into(),
            "done".into(),
        ]);
        let mut out = Vec::new();
        fetch_response(&fx.mirror, &req, &mut out).unwrap();

        let objects = unpack(&out);
        assert!(objects.iter().all(|o| o.object_type != ObjectType::Blob));
        // commits and trees still present
        assert!(objects.iter().any(|o| o.object_type == ObjectType::Commit));
        assert!(objects.iter().any(|o| o.object_type == ObjectType::Tree));
    }

    #[test]
    fn test_fetch_blob_limit_filter() {
        let fx = fixture();
        let req = request(&[
            "command=fetch".into(),
            format!("want {}", fx.tip),
            "filter blob:limit=8".into(),
            "done".into(),
        ]);
        let mut out = Vec::new();
        fetch_response(&fx.mirror, &req, &mut out).unwrap();

        let objects = unpack(&out);
        // "# demo\n" (7 bytes) passes, "fn main() {}\n" (13 bytes) is filtered.
        assert!(objects
            .iter()
            .all(|o| o.object_type != ObjectType::Blob || o.size() <= 8));
        assert!(objects.iter().any(|o| o.object_type == ObjectType::Blob));
    }

    #[test]
    fn test_fetch_tree_depth_filter() {
        let fx = fixture();
        let req = request(&[
            "command=fetch".into(),
            format!("want {}", fx.tip),
            "filter tree:1".into(),
            "done".into(),
        ]);
        let mut out = Vec::new();
        fetch_response(&fx.mirror, &req, &mut out).unwrap();

        let objects = unpack(&out);
        // Root trees only (depth 0); no blobs or subtrees at depth >= 1.
        assert!(objects.iter().all(|o| o.object_type != ObjectType::Blob));
        let trees: Vec<_> = objects
            .iter()
            .filter(|o| o.object_type == ObjectType::Tree)
            .collect();
        assert_eq!(trees.len(), 2); // tree1 and tree2, not the src subtree
    }

    #[test]
    fn test_fetch_deepen_one() {
        let fx = fixture();
        let req = request(&[
            "command=fetch".into(),
            format!("want {}", fx.tip),
            "deepen 1".into(),
            "done".into(),
        ]);
        let mut out = Vec::new();
        fetch_response(&fx.mirror, &req, &mut out).unwrap();
        let text = String::from_utf8_lossy(&out);

        assert!(text.contains("shallow-info"));
        assert!(text.contains(&format!("shallow {}", fx.tip)));
        let objects = unpack(&out);
        assert!(objects.iter().all(|o| o.id != fx.old_tip));
    }

    #[test]
    fn test_fetch_want_ref() {
        let fx = fixture();
        let req = request(&[
            "command=fetch".into(),
            "want-ref refs/heads/main".into(),
            "done".into(),
        ]);
        let mut out = Vec::new();
        fetch_response(&fx.mirror, &req, &mut out).unwrap();
        let text = String::from_utf8_lossy(&out);

        assert!(text.contains("wanted-refs"));
        assert!(text.contains(&format!("{} refs/heads/main", fx.tip)));
        let objects = unpack(&out);
        assert!(objects.iter().any(|o| o.id == fx.tip));
    }

    #[test]
    fn test_fetch_want_ref_missing() {
        let fx = fixture();
        let req = request(&[
            "command=fetch".into(),
            "want-ref refs/heads/nope".into(),
            "done".into(),
        ]);
        let mut out = Vec::new();
        assert!(matches!(
            fetch_response(&fx.mirror, &req, &mut out),
            Err(ProtocolError::NotOurRef(_))
        ));
    }

    #[test]
    fn test_fetch_unknown_want_is_not_our_ref() {
        let fx = fixture();
        let req = request(&[
            "command=fetch".into(),
            format!("want {}", "d".repeat(40)),
            "done".into(),
        ]);
        let mut out = Vec::new();
        assert!(matches!(
            fetch_response(&fx.mirror, &req, &mut out),
            Err(ProtocolError::NotOurRef(_))
        ));
    }

    #[test]
    fn test_fetch_include_tag() {
        let fx = fixture();
        let req = request(&[
            "command=fetch".into(),
            format!("want {}", fx.tip),
            "include-tag".into(),
            "done".into(),
        ]);
        let mut out = Vec::new();
        fetch_response(&fx.mirror, &req, &mut out).unwrap();

        let objects = unpack(&out);
        assert!(objects.iter().any(|o| o.id == fx.tag));
    }

    #[test]
    fn test_fetch_deterministic_object_set() {
        let fx = fixture();
        let req = request(&[
            "command=fetch".into(),
            format!("want {}", fx.tip),
            "done".into(),
        ]);
        let mut a = Vec::new();
        let mut b = Vec::new();
        fetch_response(&fx.mirror, &req, &mut a).unwrap();
        fetch_response(&fx.mirror, &req, &mut b).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_filter_parse() {
        assert_eq!(PackFilter::parse(&[]).unwrap(), PackFilter::None);
        assert_eq!(
            PackFilter::parse(&["blob:none".into()]).unwrap(),
            PackFilter::BlobNone
        );
        assert_eq!(
            PackFilter::parse(&["blob:limit=1k".into()]).unwrap(),
            PackFilter::BlobLimit(1024)
        );
        assert_eq!(
            PackFilter::parse(&["tree:2".into()]).unwrap(),
            PackFilter::TreeDepth(2)
        );
        assert!(PackFilter::parse(&["sparse:oid=abc".into()]).is_err());
        assert!(PackFilter::parse(&["blob:none".into(), "tree:1".into()]).is_err());
    }
}
