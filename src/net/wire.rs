//! Wire formats and first-bytes classification.
//!
//! Every connection opens with a four-byte format marker written by the
//! initiator. The sniffing decoder classifies the marker without consuming
//! anything beyond it; bytes that arrive after the marker stay available to
//! the framing layer.

use serde::{Deserialize, Serialize};

pub const MARKER_LEN: usize = 4;

const BINARY_MARKER: [u8; MARKER_LEN] = [0xC4, b'A', b'R', b'B'];
const TEXT_MARKER: [u8; MARKER_LEN] = [b'A', b'R', b'B', b'\n'];

/// Negotiated body encoding for a connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WireFormat {
    /// CBOR bodies.
    Binary,
    /// JSON bodies.
    Text,
}

impl WireFormat {
    pub const fn marker(self) -> [u8; MARKER_LEN] {
        match self {
            WireFormat::Binary => BINARY_MARKER,
            WireFormat::Text => TEXT_MARKER,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            WireFormat::Binary => "binary",
            WireFormat::Text => "text",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "binary" => Some(WireFormat::Binary),
            "text" => Some(WireFormat::Text),
            _ => None,
        }
    }
}

/// Classification outcome for the bytes seen so far.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Sniff {
    /// Not enough bytes to decide; feed more and retry.
    NeedMoreData,
    /// Marker fully matched; `SniffingDecoder::into_remainder` yields the
    /// bytes that followed it.
    Classified { format: WireFormat },
    /// The stream cannot be any known wire format.
    Unrecognized { at: usize, byte: u8 },
}

/// Incremental wire-format classifier for a newly accepted connection.
#[derive(Debug, Default)]
pub struct SniffingDecoder {
    buf: Vec<u8>,
}

impl SniffingDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append freshly read bytes and re-classify.
    pub fn feed(&mut self, bytes: &[u8]) -> Sniff {
        self.buf.extend_from_slice(bytes);
        self.classify()
    }

    fn classify(&self) -> Sniff {
        let Some(&first) = self.buf.first() else {
            return Sniff::NeedMoreData;
        };
        let (format, marker) = match first {
            b if b == BINARY_MARKER[0] => (WireFormat::Binary, BINARY_MARKER),
            b if b == TEXT_MARKER[0] => (WireFormat::Text, TEXT_MARKER),
            byte => return Sniff::Unrecognized { at: 0, byte },
        };
        for (at, (&seen, &expected)) in self.buf.iter().zip(marker.iter()).enumerate() {
            if seen != expected {
                return Sniff::Unrecognized { at, byte: seen };
            }
        }
        if self.buf.len() >= MARKER_LEN {
            Sniff::Classified { format }
        } else {
            Sniff::NeedMoreData
        }
    }

    /// Bytes received beyond the classified marker, in arrival order.
    pub fn into_remainder(mut self) -> Vec<u8> {
        self.buf.split_off(MARKER_LEN.min(self.buf.len()))
    }
}
