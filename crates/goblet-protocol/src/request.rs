//! Smart-HTTP v2 request classification and cache fingerprinting.
//!
//! A v2 request body is a pkt-line sequence: `command=<name>`, capability
//! assignments, a delimiter, command arguments, and a terminating flush.

use crate::pktline::{PktLine, PktLineDecoder};
use crate::{ProtocolError, Result};
use goblet_mirror::ObjectId;
use sha2::{Digest, Sha256};
use std::fmt;

/// The two v2 commands this proxy serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    /// `command=ls-refs`
    LsRefs,
    /// `command=fetch`
    Fetch,
}

impl Command {
    /// Protocol name of the command.
    pub fn as_str(&self) -> &'static str {
        match self {
            Command::LsRefs => "ls-refs",
            Command::Fetch => "fetch",
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A classified v2 request.
///
/// Every known argument is captured in a typed field; anything unrecognized
/// lands in `unknown` so it can still perturb the fingerprint (two requests
/// differing in a token we do not understand must never share a cache entry).
#[derive(Debug, Clone, Default)]
pub struct ParsedRequest {
    /// The request command. `None` only during construction.
    command: Option<Command>,
    /// `object-format=` capability value.
    pub object_format: Option<String>,
    /// `agent=` capability value (excluded from the fingerprint).
    pub agent: Option<String>,
    /// Requested tip oids.
    pub wants: Vec<ObjectId>,
    /// Requested tip ref names (`ref-in-want`).
    pub want_refs: Vec<String>,
    /// Oids the client already has.
    pub haves: Vec<ObjectId>,
    /// Client's existing shallow boundary.
    pub shallow: Vec<ObjectId>,
    /// `deepen <n>` depth limit.
    pub deepen: Option<u32>,
    /// `deepen-since <timestamp>`.
    pub deepen_since: Option<i64>,
    /// `deepen-not <ref>` exclusions.
    pub deepen_not: Vec<String>,
    /// Partial-clone filter specs.
    pub filters: Vec<String>,
    /// `ref-prefix` set (ls-refs).
    pub ref_prefixes: Vec<String>,
    /// ls-refs `symrefs` flag.
    pub symrefs: bool,
    /// ls-refs `peel` flag.
    pub peel: bool,
    /// fetch `done` flag.
    pub done: bool,
    /// fetch `wait-for-done` flag.
    pub wait_for_done: bool,
    /// `no-progress` flag.
    pub no_progress: bool,
    /// `include-tag` flag.
    pub include_tag: bool,
    /// `thin-pack` flag.
    pub thin_pack: bool,
    /// `ofs-delta` flag.
    pub ofs_delta: bool,
    /// `sideband-all` flag.
    pub sideband_all: bool,
    /// `packfile-uris` protocol list.
    pub packfile_uris: Vec<String>,
    /// Tokens we did not recognize, preserved verbatim.
    pub unknown: Vec<String>,
}

impl ParsedRequest {
    /// The request command.
    pub fn command(&self) -> Command {
        self.command.expect("parse_request always sets the command")
    }
}

/// Parses a complete v2 request body.
pub fn parse_request(body: &[u8]) -> Result<ParsedRequest> {
    let mut decoder = PktLineDecoder::new();
    decoder.feed(body);

    let mut req = ParsedRequest::default();
    let mut saw_flush = false;
    let mut first = true;

    while let Some(frame) = decoder.next_frame()? {
        match frame {
            PktLine::Flush => {
                saw_flush = true;
                break;
            }
            // Capability and argument sections share one token vocabulary
            // here, so the delimiter needs no state of its own.
            PktLine::Delimiter => {}
            PktLine::ResponseEnd => {
                return Err(ProtocolError::Protocol(
                    "response-end in a request body".to_string(),
                ))
            }
            PktLine::Data(data) => {
                let line = std::str::from_utf8(&data)
                    .map_err(|_| ProtocolError::Protocol("non-utf8 request line".to_string()))?
                    .trim_end_matches('\n');
                if first {
                    first = false;
                    let name = line.strip_prefix("command=").ok_or_else(|| {
                        ProtocolError::Protocol(format!(
                            "expected command=, got {:?}",
                            line
                        ))
                    })?;
                    req.command = Some(match name {
                        "ls-refs" => Command::LsRefs,
                        "fetch" => Command::Fetch,
                        other => return Err(ProtocolError::UnknownCommand(other.to_string())),
                    });
                } else {
                    parse_line(&mut req, line)?;
                }
            }
        }
    }

    if req.command.is_none() {
        return Err(ProtocolError::Protocol("empty request body".to_string()));
    }
    if !saw_flush {
        return Err(ProtocolError::Protocol(
            "request body not flush-terminated".to_string(),
        ));
    }
    if !decoder.is_empty() {
        return Err(ProtocolError::Protocol(
            "trailing bytes after request flush".to_string(),
        ));
    }
    Ok(req)
}

fn parse_line(req: &mut ParsedRequest, line: &str) -> Result<()> {
    if let Some(value) = line.strip_prefix("agent=") {
        req.agent = Some(value.to_string());
    } else if let Some(value) = line.strip_prefix("object-format=") {
        req.object_format = Some(value.to_string());
    } else if let Some(oid) = line.strip_prefix("want ") {
        req.wants.push(parse_oid(oid)?);
    } else if let Some(name) = line.strip_prefix("want-ref ") {
        req.want_refs.push(name.to_string());
    } else if let Some(oid) = line.strip_prefix("have ") {
        req.haves.push(parse_oid(oid)?);
    } else if let Some(oid) = line.strip_prefix("shallow ") {
        req.shallow.push(parse_oid(oid)?);
    } else if let Some(depth) = line.strip_prefix("deepen ") {
        let depth: u32 = depth
            .parse()
            .map_err(|_| ProtocolError::Protocol(format!("invalid deepen: {:?}", depth)))?;
        if depth == 0 {
            return Err(ProtocolError::Protocol("deepen 0 is invalid".to_string()));
        }
        req.deepen = Some(depth);
    } else if let Some(ts) = line.strip_prefix("deepen-since ") {
        req.deepen_since = Some(ts.parse().map_err(|_| {
            ProtocolError::Protocol(format!("invalid deepen-since: {:?}", ts))
        })?);
    } else if let Some(name) = line.strip_prefix("deepen-not ") {
        req.deepen_not.push(name.to_string());
    } else if let Some(spec) = line.strip_prefix("filter ") {
        req.filters.push(spec.to_string());
    } else if let Some(prefix) = line.strip_prefix("ref-prefix ") {
        req.ref_prefixes.push(prefix.to_string());
    } else if let Some(uris) = line.strip_prefix("packfile-uris ") {
        req.packfile_uris
            .extend(uris.split(',').map(|s| s.to_string()));
    } else {
        match line {
            "symrefs" => req.symrefs = true,
            "peel" => req.peel = true,
            "done" => req.done = true,
            "wait-for-done" => req.wait_for_done = true,
            "no-progress" => req.no_progress = true,
            "include-tag" => req.include_tag = true,
            "thin-pack" => req.thin_pack = true,
            "ofs-delta" => req.ofs_delta = true,
            "sideband-all" => req.sideband_all = true,
            // server-option is advertised but carries no response semantics
            _ if line.starts_with("server-option=") => {}
            _ => req.unknown.push(line.to_string()),
        }
    }
    Ok(())
}

fn parse_oid(hex: &str) -> Result<ObjectId> {
    ObjectId::from_hex(hex.trim())
        .map_err(|_| ProtocolError::Protocol(format!("invalid oid: {:?}", hex)))
}

/// Canonical hash identifying cache-equivalent requests.
///
/// Two requests with equal fingerprints produce equivalent responses against
/// a given mirror snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Computes the fingerprint of a classified request.
    pub fn of(req: &ParsedRequest) -> Self {
        let mut lines: Vec<String> = Vec::new();
        lines.push(format!("command={}", req.command()));

        for (flag, set) in [
            ("symrefs", req.symrefs),
            ("peel", req.peel),
            ("done", req.done),
            ("wait-for-done", req.wait_for_done),
            ("no-progress", req.no_progress),
            ("include-tag", req.include_tag),
            ("thin-pack", req.thin_pack),
            ("ofs-delta", req.ofs_delta),
            ("sideband-all", req.sideband_all),
        ] {
            if set {
                lines.push(format!("cap {}", flag));
            }
        }
        if let Some(format) = &req.object_format {
            lines.push(format!("object-format {}", format));
        }

        lines.extend(sorted(req.wants.iter().map(|o| format!("want {}", o))));
        lines.extend(sorted(
            req.want_refs.iter().map(|r| format!("want-ref {}", r)),
        ));
        lines.extend(sorted(req.haves.iter().map(|o| format!("have {}", o))));
        lines.extend(sorted(req.shallow.iter().map(|o| format!("shallow {}", o))));
        if let Some(depth) = req.deepen {
            lines.push(format!("deepen {}", depth));
        }
        if let Some(since) = req.deepen_since {
            lines.push(format!("deepen-since {}", since));
        }
        lines.extend(sorted(
            req.deepen_not.iter().map(|r| format!("deepen-not {}", r)),
        ));
        lines.extend(sorted(req.filters.iter().map(|f| format!("filter {}", f))));
        lines.extend(sorted(
            req.ref_prefixes.iter().map(|p| format!("ref-prefix {}", p)),
        ));
        lines.extend(sorted(
            req.packfile_uris.iter().map(|u| format!("packfile-uri {}", u)),
        ));
        lines.extend(sorted(req.unknown.iter().map(|t| format!("unknown {}", t))));

        let mut hasher = Sha256::new();
        for line in &lines {
            hasher.update(line.as_bytes());
            hasher.update(b"\n");
        }
        Self(hex::encode(hasher.finalize()))
    }

    /// Hex digest string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn sorted<I: Iterator<Item = String>>(iter: I) -> Vec<String> {
    let mut v: Vec<String> = iter.collect();
    v.sort();
    v
}
