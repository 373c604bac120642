//! # Goblet Protocol
//!
//! Git Smart-HTTP v2 wire handling for the Goblet proxy: pkt-line framing,
//! request classification with cache fingerprinting, sideband multiplexing,
//! and response materialization from a local mirror.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod error;
pub mod pktline;
pub mod request;
pub mod serve;
pub mod sideband;

pub use error::{ProtocolError, Result};
pub use pktline::{PktLine, PktLineDecoder, PktLineReader, PktLineWriter, MAX_PKT_PAYLOAD};
pub use request::{parse_request, Command, Fingerprint, ParsedRequest};
pub use serve::{advertisement, fetch_response, ls_refs_response, FetchStats, PackFilter};
pub use sideband::{Band, SidebandReader, SidebandWriter, MAX_SIDEBAND_PAYLOAD};
