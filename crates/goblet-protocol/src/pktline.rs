//! Git pkt-line framing.
//!
//! Every protocol line is prefixed with a 4-character hex length, with three
//! sentinel values: `0000` (flush), `0001` (delimiter), `0002` (response-end).

use crate::{ProtocolError, Result};
use bytes::{Buf, BytesMut};
use std::io::{Read, Write};

/// Largest payload a single pkt-line can carry (65520 minus the 4-byte
/// length prefix).
pub const MAX_PKT_PAYLOAD: usize = 65516;

/// A pkt-line packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PktLine {
    /// Data line with content.
    Data(Vec<u8>),
    /// Flush packet (0000).
    Flush,
    /// Delimiter packet (0001).
    Delimiter,
    /// Response-end packet (0002).
    ResponseEnd,
}

impl PktLine {
    /// Creates a data packet from a string slice.
    pub fn from_string(s: &str) -> Self {
        Self::Data(s.as_bytes().to_vec())
    }

    /// Creates a data packet from bytes.
    pub fn from_bytes(b: impl Into<Vec<u8>>) -> Self {
        Self::Data(b.into())
    }

    /// Encodes the packet to bytes. Panics if a data payload exceeds
    /// [`MAX_PKT_PAYLOAD`]; use [`encode_data_chunked`] for arbitrary sizes.
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Self::Data(data) => {
                assert!(data.len() <= MAX_PKT_PAYLOAD, "pkt-line payload too large");
                let len = data.len() + 4;
                let mut result = format!("{:04x}", len).into_bytes();
                result.extend_from_slice(data);
                result
            }
            Self::Flush => b"0000".to_vec(),
            Self::Delimiter => b"0001".to_vec(),
            Self::ResponseEnd => b"0002".to_vec(),
        }
    }

    /// Returns true if this is a flush packet.
    pub fn is_flush(&self) -> bool {
        matches!(self, Self::Flush)
    }

    /// Returns the data content, or None for special packets.
    pub fn data(&self) -> Option<&[u8]> {
        match self {
            Self::Data(data) => Some(data),
            _ => None,
        }
    }

    /// Returns the data as a string, trimming any trailing newline.
    pub fn as_str(&self) -> Option<&str> {
        self.data()
            .and_then(|d| std::str::from_utf8(d).ok())
            .map(|s| s.trim_end_matches('\n'))
    }
}

/// Encodes an arbitrarily large payload as a sequence of data pkt-lines,
/// chunking at [`MAX_PKT_PAYLOAD`].
pub fn encode_data_chunked(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() + 4 * (data.len() / MAX_PKT_PAYLOAD + 1));
    if data.is_empty() {
        out.extend_from_slice(&PktLine::Data(Vec::new()).encode());
        return out;
    }
    for chunk in data.chunks(MAX_PKT_PAYLOAD) {
        out.extend_from_slice(&PktLine::Data(chunk.to_vec()).encode());
    }
    out
}

/// Incremental pkt-line decoder for network streams.
///
/// Bytes arrive via [`feed`](Self::feed) in whatever chunks the transport
/// produces; [`next_frame`](Self::next_frame) yields complete packets as soon
/// as they are available. At most one frame is buffered.
#[derive(Debug, Default)]
pub struct PktLineDecoder {
    buf: BytesMut,
}

impl PktLineDecoder {
    /// Creates an empty decoder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends incoming bytes to the frame buffer.
    pub fn feed(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Returns the next complete packet, or `None` if more bytes are needed.
    pub fn next_frame(&mut self) -> Result<Option<PktLine>> {
        if self.buf.len() < 4 {
            return Ok(None);
        }
        let len = parse_length(&self.buf[..4])?;
        match len {
            0 => {
                self.buf.advance(4);
                Ok(Some(PktLine::Flush))
            }
            1 => {
                self.buf.advance(4);
                Ok(Some(PktLine::Delimiter))
            }
            2 => {
                self.buf.advance(4);
                Ok(Some(PktLine::ResponseEnd))
            }
            3 => Err(ProtocolError::InvalidPktLine(
                "length 0003 is reserved".to_string(),
            )),
            _ => {
                if len - 4 > MAX_PKT_PAYLOAD {
                    return Err(ProtocolError::InvalidPktLine(format!(
                        "length {:04x} exceeds maximum",
                        len
                    )));
                }
                if self.buf.len() < len {
                    return Ok(None);
                }
                self.buf.advance(4);
                let data = self.buf.split_to(len - 4).to_vec();
                Ok(Some(PktLine::Data(data)))
            }
        }
    }

    /// Number of buffered bytes not yet consumed.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    /// True if no partial frame remains buffered.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}

fn parse_length(prefix: &[u8]) -> Result<usize> {
    let s = std::str::from_utf8(prefix)
        .map_err(|_| ProtocolError::InvalidPktLine("non-ascii length prefix".to_string()))?;
    if !s.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(ProtocolError::InvalidPktLine(format!(
            "invalid length prefix: {:?}",
            s
        )));
    }
    usize::from_str_radix(s, 16)
        .map_err(|_| ProtocolError::InvalidPktLine(format!("invalid length prefix: {:?}", s)))
}

/// Reader for pkt-line format over any [`Read`].
pub struct PktLineReader<R> {
    reader: R,
}

impl<R: Read> PktLineReader<R> {
    /// Creates a new pkt-line reader.
    pub fn new(reader: R) -> Self {
        Self { reader }
    }

    /// Reads the next packet. Returns `None` on a clean EOF.
    pub fn read(&mut self) -> Result<Option<PktLine>> {
        let mut len_buf = [0u8; 4];
        match self.reader.read_exact(&mut len_buf) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }

        let len = parse_length(&len_buf)?;
        match len {
            0 => Ok(Some(PktLine::Flush)),
            1 => Ok(Some(PktLine::Delimiter)),
            2 => Ok(Some(PktLine::ResponseEnd)),
            3 => Err(ProtocolError::InvalidPktLine(
                "length 0003 is reserved".to_string(),
            )),
            _ => {
                if len - 4 > MAX_PKT_PAYLOAD {
                    return Err(ProtocolError::InvalidPktLine(format!(
                        "length {:04x} exceeds maximum",
                        len
                    )));
                }
                let mut data = vec![0u8; len - 4];
                self.reader.read_exact(&mut data).map_err(|_| {
                    ProtocolError::InvalidPktLine("truncated pkt-line".to_string())
                })?;
                Ok(Some(PktLine::Data(data)))
            }
        }
    }

    /// Reads all packets until a flush packet (the flush is consumed).
    pub fn read_until_flush(&mut self) -> Result<Vec<PktLine>> {
        let mut packets = Vec::new();
        loop {
            match self.read()? {
                Some(PktLine::Flush) | None => break,
                Some(pkt) => packets.push(pkt),
            }
        }
        Ok(packets)
    }

    /// Returns a mutable reference to the inner reader.
    pub fn inner_mut(&mut self) -> &mut R {
        &mut self.reader
    }

    /// Consumes the reader and returns the inner reader.
    pub fn into_inner(self) -> R {
        self.reader
    }
}

/// Writer for pkt-line format over any [`Write`].
pub struct PktLineWriter<W> {
    writer: W,
}

impl<W: Write> PktLineWriter<W> {
    /// Creates a new pkt-line writer.
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    /// Writes a packet, chunking oversized data payloads.
    pub fn write(&mut self, pkt: &PktLine) -> Result<()> {
        match pkt {
            PktLine::Data(data) if data.len() > MAX_PKT_PAYLOAD => {
                self.writer.write_all(&encode_data_chunked(data))?;
            }
            _ => self.writer.write_all(&pkt.encode())?,
        }
        Ok(())
    }

    /// Writes a data line.
    pub fn write_data(&mut self, data: &[u8]) -> Result<()> {
        self.write(&PktLine::Data(data.to_vec()))
    }

    /// Writes a text line, appending a newline if missing.
    pub fn write_line(&mut self, s: &str) -> Result<()> {
        let mut data = s.as_bytes().to_vec();
        if !s.ends_with('\n') {
            data.push(b'\n');
        }
        self.write(&PktLine::Data(data))
    }

    /// Writes a flush packet.
    pub fn flush_pkt(&mut self) -> Result<()> {
        self.write(&PktLine::Flush)
    }

    /// Writes a delimiter packet.
    pub fn delim_pkt(&mut self) -> Result<()> {
        self.write(&PktLine::Delimiter)
    }

    /// Flushes the underlying writer.
    pub fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }

    /// Returns the inner writer.
    pub fn into_inner(self) -> W {
        self.writer
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_pktline_encode() {
        assert_eq!(PktLine::from_string("hello\n").encode(), b"000ahello\n");
        assert_eq!(PktLine::Flush.encode(), b"0000");
        assert_eq!(PktLine::Delimiter.encode(), b"0001");
        assert_eq!(PktLine::ResponseEnd.encode(), b"0002");
    }

    #[test]
    fn test_pktline_roundtrip() {
        let packets = vec![
            PktLine::from_string("hello\n"),
            PktLine::from_string("world\n"),
            PktLine::Flush,
        ];

        let mut buf = Vec::new();
        {
            let mut writer = PktLineWriter::new(&mut buf);
            for pkt in &packets {
                writer.write(pkt).unwrap();
            }
        }

        let mut reader = PktLineReader::new(Cursor::new(buf));
        assert_eq!(reader.read().unwrap(), Some(packets[0].clone()));
        assert_eq!(reader.read().unwrap(), Some(packets[1].clone()));
        assert_eq!(reader.read().unwrap(), Some(PktLine::Flush));
        assert_eq!(reader.read().unwrap(), None);
    }

    #[test]
    fn test_max_payload_roundtrip() {
        let payload = vec![0x5a; MAX_PKT_PAYLOAD];
        let encoded = PktLine::Data(payload.clone()).encode();
        assert_eq!(&encoded[..4], b"fff0");

        let mut reader = PktLineReader::new(Cursor::new(encoded));
        assert_eq!(reader.read().unwrap(), Some(PktLine::Data(payload)));
    }

    #[test]
    fn test_oversized_payload_is_chunked() {
        let payload = vec![7u8; MAX_PKT_PAYLOAD + 100];
        let mut buf = Vec::new();
        {
            let mut writer = PktLineWriter::new(&mut buf);
            writer.write_data(&payload).unwrap();
        }

        let mut reader = PktLineReader::new(Cursor::new(buf));
        let first = reader.read().unwrap().unwrap();
        let second = reader.read().unwrap().unwrap();
        assert_eq!(first.data().unwrap().len(), MAX_PKT_PAYLOAD);
        assert_eq!(second.data().unwrap().len(), 100);
    }

    #[test]
    fn test_decoder_handles_arbitrary_chunk_boundaries() {
        let mut stream = Vec::new();
        stream.extend_from_slice(&PktLine::from_string("command=ls-refs\n").encode());
        stream.extend_from_slice(&PktLine::Delimiter.encode());
        stream.extend_from_slice(&PktLine::from_string("ref-prefix refs/heads/\n").encode());
        stream.extend_from_slice(&PktLine::Flush.encode());

        // Feed one byte at a time.
        let mut decoder = PktLineDecoder::new();
        let mut frames = Vec::new();
        for byte in &stream {
            decoder.feed(std::slice::from_ref(byte));
            while let Some(frame) = decoder.next_frame().unwrap() {
                frames.push(frame);
            }
        }
        assert_eq!(frames.len(), 4);
        assert_eq!(frames[0].as_str(), Some("command=ls-refs"));
        assert_eq!(frames[1], PktLine::Delimiter);
        assert_eq!(frames[3], PktLine::Flush);
        assert!(decoder.is_empty());
    }

    #[test]
    fn test_decoder_incomplete_frame() {
        let mut decoder = PktLineDecoder::new();
        decoder.feed(b"000ahel");
        assert_eq!(decoder.next_frame().unwrap(), None);
        decoder.feed(b"lo\n");
        assert_eq!(
            decoder.next_frame().unwrap(),
            Some(PktLine::from_string("hello\n"))
        );
    }

    #[test]
    fn test_decoder_rejects_bad_lengths() {
        let mut decoder = PktLineDecoder::new();
        decoder.feed(b"zzzz");
        assert!(decoder.next_frame().is_err());

        let mut decoder = PktLineDecoder::new();
        decoder.feed(b"0003");
        assert!(decoder.next_frame().is_err());
    }

    #[test]
    fn test_reader_rejects_truncated_frame() {
        let mut reader = PktLineReader::new(Cursor::new(b"0009hi".to_vec()));
        assert!(reader.read().is_err());
    }

    #[test]
    fn test_reader_rejects_reserved_length() {
        let mut reader = PktLineReader::new(Cursor::new(b"0003".to_vec()));
        assert!(reader.read().is_err());
    }

    #[test]
    fn test_empty_data_line() {
        let encoded = PktLine::Data(Vec::new()).encode();
        assert_eq!(encoded, b"0004");
        let mut reader = PktLineReader::new(Cursor::new(encoded));
        assert_eq!(reader.read().unwrap(), Some(PktLine::Data(Vec::new())));
    }

    #[test]
    fn test_read_until_flush() {
        let mut buf = Vec::new();
        {
            let mut writer = PktLineWriter::new(&mut buf);
            writer.write_line("a").unwrap();
            writer.write_line("b").unwrap();
            writer.flush_pkt().unwrap();
            writer.write_line("after").unwrap();
        }
        let mut reader = PktLineReader::new(Cursor::new(buf));
        let packets = reader.read_until_flush().unwrap();
        assert_eq!(packets.len(), 2);
    }
}
