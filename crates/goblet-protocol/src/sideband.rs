//! Sideband multiplexing within a `packfile` response section.
//!
//! - Band 1: pack data
//! - Band 2: progress messages
//! - Band 3: fatal error

use crate::pktline::{PktLine, PktLineReader, PktLineWriter, MAX_PKT_PAYLOAD};
use crate::{ProtocolError, Result};
use std::io::{Read, Write};

/// Largest sideband payload per pkt-line (one byte is spent on the band).
pub const MAX_SIDEBAND_PAYLOAD: usize = MAX_PKT_PAYLOAD - 1;

/// Sideband channel identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Band {
    /// Pack data (band 1).
    Data = 1,
    /// Progress messages (band 2).
    Progress = 2,
    /// Fatal error (band 3).
    Fatal = 3,
}

/// Writes one sideband frame.
pub fn write_band<W: Write>(
    writer: &mut PktLineWriter<W>,
    band: Band,
    payload: &[u8],
) -> Result<()> {
    for chunk in payload.chunks(MAX_SIDEBAND_PAYLOAD.max(1)) {
        let mut pkt = Vec::with_capacity(1 + chunk.len());
        pkt.push(band as u8);
        pkt.extend_from_slice(chunk);
        writer.write(&PktLine::Data(pkt))?;
    }
    Ok(())
}

/// A [`Write`] adapter that frames everything written through it as band-1
/// sideband pkt-lines, buffering up to one full frame.
pub struct SidebandWriter<'a, W: Write> {
    writer: &'a mut PktLineWriter<W>,
    buf: Vec<u8>,
}

impl<'a, W: Write> SidebandWriter<'a, W> {
    /// Wraps a pkt-line writer.
    pub fn new(writer: &'a mut PktLineWriter<W>) -> Self {
        Self {
            writer,
            buf: Vec::with_capacity(MAX_SIDEBAND_PAYLOAD),
        }
    }

    fn emit_buf(&mut self) -> std::io::Result<()> {
        if self.buf.is_empty() {
            return Ok(());
        }
        let mut pkt = Vec::with_capacity(1 + self.buf.len());
        pkt.push(Band::Data as u8);
        pkt.append(&mut self.buf);
        self.writer.write(&PktLine::Data(pkt)).map_err(|e| match e {
            // Preserve I/O error kinds (a broken pipe is a disconnect,
            // not a protocol failure).
            crate::ProtocolError::Io(io) => io,
            other => std::io::Error::other(other.to_string()),
        })
    }

    /// Flushes any buffered partial frame.
    pub fn finish(mut self) -> Result<()> {
        self.emit_buf()?;
        Ok(())
    }
}

impl<W: Write> Write for SidebandWriter<'_, W> {
    fn write(&mut self, data: &[u8]) -> std::io::Result<usize> {
        let mut rest = data;
        while !rest.is_empty() {
            let room = MAX_SIDEBAND_PAYLOAD - self.buf.len();
            let take = room.min(rest.len());
            self.buf.extend_from_slice(&rest[..take]);
            rest = &rest[take..];
            if self.buf.len() == MAX_SIDEBAND_PAYLOAD {
                self.emit_buf()?;
            }
        }
        Ok(data.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Demultiplexes a sideband stream, returning band-1 payloads and failing on
/// band-3. Progress frames are handed to the optional callback.
pub struct SidebandReader<R> {
    reader: PktLineReader<R>,
    on_progress: Option<Box<dyn FnMut(&[u8]) + Send>>,
}

impl<R: Read> SidebandReader<R> {
    /// Wraps a pkt-line reader.
    pub fn new(reader: PktLineReader<R>) -> Self {
        Self {
            reader,
            on_progress: None,
        }
    }

    /// Sets a progress callback.
    pub fn with_progress(mut self, callback: Box<dyn FnMut(&[u8]) + Send>) -> Self {
        self.on_progress = Some(callback);
        self
    }

    /// Reads the next band-1 payload; `None` on flush/response-end.
    pub fn read_data(&mut self) -> Result<Option<Vec<u8>>> {
        loop {
            match self.reader.read()? {
                None | Some(PktLine::Flush) | Some(PktLine::ResponseEnd) => return Ok(None),
                Some(PktLine::Delimiter) => return Ok(None),
                Some(PktLine::Data(data)) => {
                    if data.is_empty() {
                        continue;
                    }
                    let (band, payload) = (data[0], &data[1..]);
                    match band {
                        1 => return Ok(Some(payload.to_vec())),
                        2 => {
                            if let Some(cb) = self.on_progress.as_mut() {
                                cb(payload);
                            }
                        }
                        3 => {
                            return Err(ProtocolError::Remote(
                                String::from_utf8_lossy(payload).trim_end().to_string(),
                            ))
                        }
                        other => {
                            return Err(ProtocolError::Protocol(format!(
                                "unknown sideband channel: {}",
                                other
                            )))
                        }
                    }
                }
            }
        }
    }

    /// Collects all band-1 data.
    pub fn read_all_data(&mut self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        while let Some(chunk) = self.read_data()? {
            out.extend_from_slice(&chunk);
        }
        Ok(out)
    }
}
