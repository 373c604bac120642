//! Smart-HTTP v2 upstream client.

use crate::{Result, UpstreamError};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use goblet_mirror::{ObjectId, RemoteUrl};
use goblet_protocol::{PktLine, PktLineDecoder, PktLineWriter};
use reqwest::header;
use reqwest::redirect;
use std::time::Duration;

const USER_AGENT: &str = concat!("goblet/", env!("CARGO_PKG_VERSION"));

/// Deadline for establishing an upstream connection.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// Deadline for a single read making no progress (idle socket).
const READ_IDLE_TIMEOUT: Duration = Duration::from_secs(30);

/// A ref as advertised by the upstream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteRef {
    /// Full ref name (or `HEAD`).
    pub name: String,
    /// Target oid.
    pub target: ObjectId,
    /// Symref target, when advertised.
    pub symref_target: Option<String>,
    /// Peeled oid for annotated tags, when advertised.
    pub peeled: Option<ObjectId>,
}

/// Arguments for an upstream `fetch`.
#[derive(Debug, Clone, Default)]
pub struct FetchArgs {
    /// Tips to fetch.
    pub wants: Vec<ObjectId>,
    /// Objects we already hold (delta negotiation).
    pub haves: Vec<ObjectId>,
    /// Partial-clone filter to request.
    pub filter: Option<String>,
    /// Existing shallow boundary.
    pub shallow: Vec<ObjectId>,
    /// Depth limit to request.
    pub deepen: Option<u32>,
}

/// Transport seam for upstream Smart-HTTP v2 conversations. The proxy holds
/// this by handle so tests and future transports can swap the wire.
#[async_trait]
pub trait UpstreamTransport: Send + Sync {
    /// Performs `command=ls-refs` and returns the parsed advertisement.
    async fn ls_refs(
        &self,
        url: &RemoteUrl,
        prefixes: &[String],
        auth: Option<&str>,
    ) -> Result<Vec<RemoteRef>>;

    /// Performs `command=fetch` and returns the demuxed pack payload.
    async fn fetch_pack(
        &self,
        url: &RemoteUrl,
        args: &FetchArgs,
        auth: Option<&str>,
    ) -> Result<Bytes>;
}

/// reqwest-backed upstream transport.
pub struct HttpUpstream {
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpUpstream {
    /// Builds a client. Three timeouts apply to every call: connect, idle
    /// read, and the total per-call deadline given here; any of them
    /// elapsing classifies as [`UpstreamError::Timeout`]. Redirects are
    /// followed only within the original host.
    pub fn new(timeout: Duration) -> Result<Self> {
        let policy = redirect::Policy::custom(|attempt| {
            if attempt.previous().len() > 5 {
                return attempt.error("too many redirects");
            }
            let original_host = attempt
                .previous()
                .first()
                .and_then(|u| u.host_str())
                .map(str::to_owned);
            if original_host.as_deref() == attempt.url().host_str() {
                attempt.follow()
            } else {
                attempt.stop()
            }
        });
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .redirect(policy)
            .connect_timeout(CONNECT_TIMEOUT)
            .read_timeout(READ_IDLE_TIMEOUT)
            .build()
            .map_err(|e| UpstreamError::Network(e.to_string()))?;
        Ok(Self { client, timeout })
    }

    async fn upload_pack(
        &self,
        url: &RemoteUrl,
        body: Vec<u8>,
        auth: Option<&str>,
    ) -> Result<reqwest::Response> {
        let endpoint = format!("{}/git-upload-pack", url.as_url());
        let mut request = self
            .client
            .post(&endpoint)
            .timeout(self.timeout)
            .header("Git-Protocol", "version=2")
            .header(
                header::CONTENT_TYPE,
                "application/x-git-upload-pack-request",
            )
            .header(header::ACCEPT, "application/x-git-upload-pack-result")
            .body(body);
        if let Some(auth) = auth {
            request = request.header(header::AUTHORIZATION, auth);
        }
        let response = request.send().await?;
        let status = response.status().as_u16();
        match status {
            200 => Ok(response),
            401 | 403 => Err(UpstreamError::Auth(status)),
            _ => Err(UpstreamError::Status(status)),
        }
    }
}

#[async_trait]
impl UpstreamTransport for HttpUpstream {
    async fn ls_refs(
        &self,
        url: &RemoteUrl,
        prefixes: &[String],
        auth: Option<&str>,
    ) -> Result<Vec<RemoteRef>> {
        let mut body = Vec::new();
        {
            let mut writer = PktLineWriter::new(&mut body);
            writer.write_line("command=ls-refs")?;
            writer.write_line(&format!("agent={}", USER_AGENT))?;
            writer.write_line("object-format=sha1")?;
            writer.delim_pkt()?;
            writer.write_line("symrefs")?;
            writer.write_line("peel")?;
            for prefix in prefixes {
                writer.write_line(&format!("ref-prefix {}", prefix))?;
            }
            writer.flush_pkt()?;
        }

        let response = self.upload_pack(url, body, auth).await?;
        let frames = read_frames(response).await?;

        let mut refs = Vec::new();
        for frame in frames {
            let line = match frame {
                PktLine::Data(data) => data,
                _ => continue,
            };
            let line = std::str::from_utf8(&line)
                .map_err(|_| UpstreamError::Protocol("non-utf8 ls-refs line".into()))?
                .trim_end_matches('\n');
            let mut parts = line.split(' ');
            let oid = parts
                .next()
                .ok_or_else(|| UpstreamError::Protocol("empty ls-refs line".into()))?;
            let name = parts
                .next()
                .ok_or_else(|| UpstreamError::Protocol(format!("ls-refs line without name: {:?}", line)))?;
            let target = ObjectId::from_hex(oid)
                .map_err(|_| UpstreamError::Protocol(format!("invalid oid: {:?}", oid)))?;

            let mut remote_ref = RemoteRef {
                name: name.to_string(),
                target,
                symref_target: None,
                peeled: None,
            };
            for attr in parts {
                if let Some(target) = attr.strip_prefix("symref-target:") {
                    remote_ref.symref_target = Some(target.to_string());
                } else if let Some(peeled) = attr.strip_prefix("peeled:") {
                    remote_ref.peeled = Some(ObjectId::from_hex(peeled).map_err(|_| {
                        UpstreamError::Protocol(format!("invalid peeled oid: {:?}", peeled))
                    })?);
                }
            }
            refs.push(remote_ref);
        }
        Ok(refs)
    }

    async fn fetch_pack(
        &self,
        url: &RemoteUrl,
        args: &FetchArgs,
        auth: Option<&str>,
    ) -> Result<Bytes> {
        let mut body = Vec::new();
        {
            let mut writer = PktLineWriter::new(&mut body);
            writer.write_line("command=fetch")?;
            writer.write_line(&format!("agent={}", USER_AGENT))?;
            writer.write_line("object-format=sha1")?;
            writer.delim_pkt()?;
            writer.write_line("no-progress")?;
            writer.write_line("ofs-delta")?;
            for want in &args.wants {
                writer.write_line(&format!("want {}", want))?;
            }
            for have in &args.haves {
                writer.write_line(&format!("have {}", have))?;
            }
            for shallow in &args.shallow {
                writer.write_line(&format!("shallow {}", shallow))?;
            }
            if let Some(depth) = args.deepen {
                writer.write_line(&format!("deepen {}", depth))?;
            }
            if let Some(filter) = &args.filter {
                writer.write_line(&format!("filter {}", filter))?;
            }
            writer.write_line("done")?;
            writer.flush_pkt()?;
        }

        let response = self.upload_pack(url, body, auth).await?;

        // Stream the response through the pkt decoder, demuxing the
        // packfile section's sideband as frames arrive.
        let mut decoder = PktLineDecoder::new();
        let mut stream = response.bytes_stream();
        let mut in_packfile = false;
        let mut pack = BytesMut::new();

        loop {
            while let Some(frame) = decoder
                .next_frame()
                .map_err(|e| UpstreamError::Protocol(e.to_string()))?
            {
                match frame {
                    PktLine::Data(data) => {
                        if !in_packfile {
                            if data.as_slice() == b"packfile\n" || data.as_slice() == b"packfile" {
                                in_packfile = true;
                            } else if let Some(err) = std::str::from_utf8(&data)
                                .ok()
                                .and_then(|s| s.trim_end().strip_prefix("ERR "))
                            {
                                return Err(UpstreamError::Protocol(err.to_string()));
                            }
                            continue;
                        }
                        if data.is_empty() {
                            continue;
                        }
                        match data[0] {
                            1 => pack.extend_from_slice(&data[1..]),
                            2 => {
                                tracing::debug!(
                                    message = %String::from_utf8_lossy(&data[1..]).trim_end(),
                                    "Upstream progress"
                                );
                            }
                            3 => {
                                return Err(UpstreamError::Protocol(
                                    String::from_utf8_lossy(&data[1..]).trim_end().to_string(),
                                ))
                            }
                            band => {
                                return Err(UpstreamError::Protocol(format!(
                                    "unknown sideband channel: {}",
                                    band
                                )))
                            }
                        }
                    }
                    PktLine::Delimiter => {
                        in_packfile = false;
                    }
                    PktLine::Flush | PktLine::ResponseEnd => {}
                }
            }
            match stream.next().await {
                Some(chunk) => decoder.feed(&chunk?),
                None => break,
            }
        }
        if !decoder.is_empty() {
            return Err(UpstreamError::Protocol(
                "truncated upstream response".into(),
            ));
        }
        if pack.is_empty() {
            return Err(UpstreamError::Protocol(
                "upstream response contained no packfile".into(),
            ));
        }
        Ok(pack.freeze())
    }
}

/// Reads a whole response into pkt frames.
async fn read_frames(response: reqwest::Response) -> Result<Vec<PktLine>> {
    let mut decoder = PktLineDecoder::new();
    let mut frames = Vec::new();
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        decoder.feed(&chunk?);
        while let Some(frame) = decoder
            .next_frame()
            .map_err(|e| UpstreamError::Protocol(e.to_string()))?
        {
            frames.push(frame);
        }
    }
    if !decoder.is_empty() {
        return Err(UpstreamError::Protocol(
            "truncated upstream response".into(),
        ));
    }
    Ok(frames)
}
