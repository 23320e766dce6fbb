//! Hubstat wire format — the fragment header in front of every datagram.
//!
//! A logical `TransportMessage` is serialized to JSON, optionally
//! compressed, and split into fragments no larger than the transport's
//! ceiling. Every fragment carries the same stream id and fragmentation
//! timestamp so the receiver can put them back together in any arrival
//! order.
//!
//! Multi-byte integers are stored big-endian in byte arrays, so the header
//! has alignment 1 and no field ever needs an unaligned read.

use bytes::Bytes;
use static_assertions::assert_eq_size;
use zerocopy::{AsBytes, FromBytes, FromZeroes};

use crate::message::{TransportMessage, WireError};

// ── Fragment Header ───────────────────────────────────────────────────────────

/// Wire size: 84 bytes.
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct FragmentHeader {
    /// BLAKE3 hash of the logical stream key (`<source>.<bundle-type>`).
    pub stream_id: [u8; 32],

    /// BLAKE3 hash of the destination hub name. All zeroes = any hub.
    pub destination: [u8; 32],

    /// Producer clock (unix millis) at fragmentation time. Correlates the
    /// fragments of one logical message.
    pub fragmentation_timestamp: [u8; 8],

    /// Total size of the encoded message across all fragments.
    pub total_size: [u8; 4],

    /// Byte offset of this fragment within the encoded message.
    pub offset: [u8; 4],

    /// `ContentEncoding` of the reassembled bytes.
    pub encoding: u8,

    /// Wire format version. Currently 0x01.
    pub version: u8,

    /// Reserved, must be zero.
    pub reserved: [u8; 2],
}

assert_eq_size!(FragmentHeader, [u8; 84]);

pub const HEADER_LEN: usize = 84;

/// Current fragment format version.
pub const WIRE_VERSION: u8 = 0x01;

/// Largest fragment payload that still fits a UDP datagram with its header.
pub const MAX_FRAGMENT_PAYLOAD: usize = 65_000;

/// Destination hash meaning "any hub".
pub const ANY_DESTINATION: [u8; 32] = [0u8; 32];

impl FragmentHeader {
    pub fn fragmentation_timestamp(&self) -> u64 {
        u64::from_be_bytes(self.fragmentation_timestamp)
    }

    pub fn total_size(&self) -> u32 {
        u32::from_be_bytes(self.total_size)
    }

    pub fn offset(&self) -> u32 {
        u32::from_be_bytes(self.offset)
    }

    pub fn content_encoding(&self) -> Result<ContentEncoding, WireError> {
        ContentEncoding::try_from(self.encoding)
    }

    /// True if a receiver for `hub` should accept this fragment.
    pub fn is_for(&self, hub: &[u8; 32]) -> bool {
        self.destination == ANY_DESTINATION || self.destination == *hub
    }
}

/// Hash of a logical stream key.
pub fn stream_id(key: &str) -> [u8; 32] {
    *blake3::hash(key.as_bytes()).as_bytes()
}

/// Hash of a hub name; the empty name is "any hub".
pub fn hub_hash(name: &str) -> [u8; 32] {
    if name.is_empty() {
        ANY_DESTINATION
    } else {
        *blake3::hash(name.as_bytes()).as_bytes()
    }
}

// ── Content Encoding ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum ContentEncoding {
    #[default]
    Identity = 0x00,
    Zstd = 0x01,
}

const ZSTD_LEVEL: i32 = 3;

impl ContentEncoding {
    pub fn encode(self, data: &[u8]) -> Result<Vec<u8>, WireError> {
        match self {
            ContentEncoding::Identity => Ok(data.to_vec()),
            ContentEncoding::Zstd => zstd::encode_all(data, ZSTD_LEVEL).map_err(WireError::Compress),
        }
    }

    pub fn decode(self, data: &[u8]) -> Result<Vec<u8>, WireError> {
        match self {
            ContentEncoding::Identity => Ok(data.to_vec()),
            ContentEncoding::Zstd => zstd::decode_all(data).map_err(WireError::Decompress),
        }
    }
}

impl TryFrom<u8> for ContentEncoding {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(ContentEncoding::Identity),
            0x01 => Ok(ContentEncoding::Zstd),
            other => Err(WireError::UnknownEncoding(other)),
        }
    }
}

// ── Fragments ─────────────────────────────────────────────────────────────────

/// One datagram: header plus a slice of the encoded message.
#[derive(Debug, Clone)]
pub struct Fragment {
    pub header: FragmentHeader,
    pub payload: Bytes,
}

impl Fragment {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_LEN + self.payload.len());
        out.extend_from_slice(self.header.as_bytes());
        out.extend_from_slice(&self.payload);
        out
    }

    pub fn from_bytes(datagram: &[u8]) -> Result<Self, WireError> {
        if datagram.len() < HEADER_LEN {
            return Err(WireError::Truncated(datagram.len()));
        }
        let header = FragmentHeader::read_from_prefix(&datagram[..HEADER_LEN])
            .ok_or(WireError::Truncated(datagram.len()))?;
        if header.version != WIRE_VERSION {
            return Err(WireError::UnsupportedVersion(header.version));
        }
        Ok(Self {
            header,
            payload: Bytes::copy_from_slice(&datagram[HEADER_LEN..]),
        })
    }
}

/// Serialize, encode and split a message into fragments of at most
/// `max_fragment` payload bytes. Messages that fit produce one fragment.
pub fn fragment_message(
    message: &TransportMessage,
    encoding: ContentEncoding,
    max_fragment: usize,
    fragmentation_timestamp: u64,
) -> Result<Vec<Fragment>, WireError> {
    if max_fragment == 0 || max_fragment > MAX_FRAGMENT_PAYLOAD {
        return Err(WireError::TooLarge(max_fragment));
    }
    let encoded = encoding.encode(&message.to_json()?)?;
    let total_size = u32::try_from(encoded.len()).map_err(|_| WireError::TooLarge(encoded.len()))?;
    let encoded = Bytes::from(encoded);

    let stream_id = stream_id(&message.key);
    let destination = hub_hash(&message.destination);

    let mut fragments = Vec::with_capacity(encoded.len() / max_fragment + 1);
    let mut offset = 0usize;
    loop {
        let end = (offset + max_fragment).min(encoded.len());
        fragments.push(Fragment {
            header: FragmentHeader {
                stream_id,
                destination,
                fragmentation_timestamp: fragmentation_timestamp.to_be_bytes(),
                total_size: total_size.to_be_bytes(),
                offset: (offset as u32).to_be_bytes(),
                encoding: encoding as u8,
                version: WIRE_VERSION,
                reserved: [0; 2],
            },
            payload: encoded.slice(offset..end),
        });
        offset = end;
        if offset >= encoded.len() {
            break;
        }
    }
    Ok(fragments)
}

// ── Tests ─────────────────────────────────────────────────────────────────────
