//! Transport messages and bundle envelopes.
//!
//! A `TransportMessage` is what the assembler hands upward once every
//! fragment arrived. Its payload is a CloudEvents-style JSON document
//! (`BundleEnvelope`) carrying one bundle from one leaf hub.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::version::{BundleVersion, VersionError};

/// Message type tag for status bundles.
pub const STATUS_BUNDLE: &str = "StatusBundle";

/// A complete logical message on the transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportMessage {
    /// Logical stream key, `<source>.<id>`.
    pub key: String,
    /// Bundle type; stable for the lifetime of the stream.
    pub id: String,
    #[serde(rename = "msgType")]
    pub msg_type: String,
    /// String form of the `BundleVersion`.
    pub version: String,
    /// Destination hub. Empty means any hub.
    #[serde(default)]
    pub destination: String,
    #[serde(with = "b64")]
    pub payload: Bytes,
}

impl TransportMessage {
    /// Build the transport wrapper for an envelope.
    pub fn from_envelope(
        envelope: &BundleEnvelope,
        destination: impl Into<String>,
    ) -> Result<Self, WireError> {
        let payload = serde_json::to_vec(envelope).map_err(WireError::Encode)?;
        Ok(Self {
            key: stream_key(&envelope.source, &envelope.bundle_type),
            id: envelope.bundle_type.clone(),
            msg_type: STATUS_BUNDLE.to_string(),
            version: envelope.version.to_string(),
            destination: destination.into(),
            payload: Bytes::from(payload),
        })
    }

    /// The producing leaf hub, recovered from the stream key.
    pub fn source(&self) -> Option<&str> {
        self.key
            .strip_suffix(self.id.as_str())
            .and_then(|s| s.strip_suffix('.'))
            .filter(|s| !s.is_empty())
    }

    pub fn parsed_version(&self) -> Result<BundleVersion, VersionError> {
        self.version.parse()
    }

    /// Decode the payload into a bundle envelope and cross-check it
    /// against the transport-level routing fields.
    pub fn to_envelope(&self) -> Result<BundleEnvelope, WireError> {
        let version = self.parsed_version().map_err(WireError::Version)?;
        let envelope = BundleEnvelope::decode(&self.payload)?;
        if envelope.bundle_type != self.id {
            return Err(WireError::Mismatch {
                field: "type",
                transport: self.id.clone(),
                envelope: envelope.bundle_type,
            });
        }
        if envelope.version != version {
            return Err(WireError::Mismatch {
                field: "version",
                transport: self.version.clone(),
                envelope: envelope.version.to_string(),
            });
        }
        Ok(envelope)
    }

    pub fn to_json(&self) -> Result<Vec<u8>, WireError> {
        serde_json::to_vec(self).map_err(WireError::Encode)
    }

    pub fn from_json(bytes: &[u8]) -> Result<Self, WireError> {
        serde_json::from_slice(bytes).map_err(WireError::Decode)
    }
}

pub fn stream_key(source: &str, bundle_type: &str) -> String {
    format!("{source}.{bundle_type}")
}

/// One bundle from one leaf hub, CloudEvents structured mode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BundleEnvelope {
    #[serde(rename = "specversion", default = "spec_version")]
    pub spec_version: String,
    #[serde(rename = "type")]
    pub bundle_type: String,
    /// Leaf hub name.
    pub source: String,
    pub id: String,
    pub time: DateTime<Utc>,
    pub version: BundleVersion,
    /// Minimum processed version of the dependency bundle this one needs.
    #[serde(
        rename = "dependencyversion",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub dependency_version: Option<BundleVersion>,
    #[serde(default)]
    pub data: Vec<serde_json::Value>,
}

fn spec_version() -> String {
    "1.0".to_string()
}

/// Same shape as `BundleEnvelope` with versions kept as raw strings, so a
/// bad version is reported as such rather than as a generic JSON error.
#[derive(Deserialize)]
struct RawEnvelope {
    #[serde(rename = "specversion", default = "spec_version")]
    spec_version: String,
    #[serde(rename = "type")]
    bundle_type: String,
    source: String,
    id: String,
    time: DateTime<Utc>,
    version: String,
    #[serde(rename = "dependencyversion", default)]
    dependency_version: Option<String>,
    #[serde(default)]
    data: Vec<serde_json::Value>,
}

impl BundleEnvelope {
    pub fn new(
        source: impl Into<String>,
        bundle_type: impl Into<String>,
        version: BundleVersion,
        data: Vec<serde_json::Value>,
    ) -> Self {
        let source = source.into();
        let bundle_type = bundle_type.into();
        Self {
            spec_version: spec_version(),
            id: format!("{source}.{bundle_type}.{version}"),
            bundle_type,
            source,
            time: Utc::now(),
            version,
            dependency_version: None,
            data,
        }
    }

    pub fn with_dependency_version(mut self, version: BundleVersion) -> Self {
        self.dependency_version = Some(version);
        self
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        let raw: RawEnvelope = serde_json::from_slice(bytes).map_err(WireError::Decode)?;
        let version = raw.version.parse().map_err(WireError::Version)?;
        let dependency_version = raw
            .dependency_version
            .map(|v| v.parse())
            .transpose()
            .map_err(WireError::Version)?;
        Ok(Self {
            spec_version: raw.spec_version,
            bundle_type: raw.bundle_type,
            source: raw.source,
            id: raw.id,
            time: raw.time,
            version,
            dependency_version,
            data: raw.data,
        })
    }
}

/// Where an envelope sat in the transport log.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TransportPosition {
    pub topic: String,
    pub partition: u32,
    pub offset: u64,
}

impl TransportPosition {
    pub fn new(topic: impl Into<String>, partition: u32, offset: u64) -> Self {
        Self {
            topic: topic.into(),
            partition,
            offset,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("malformed version: {0}")]
    Version(#[from] VersionError),
    #[error("failed to decode: {0}")]
    Decode(serde_json::Error),
    #[error("failed to encode: {0}")]
    Encode(serde_json::Error),
    #[error("{field} mismatch: transport says {transport:?}, envelope says {envelope:?}")]
    Mismatch {
        field: &'static str,
        transport: String,
        envelope: String,
    },
    #[error("decompression failed: {0}")]
    Decompress(std::io::Error),
    #[error("compression failed: {0}")]
    Compress(std::io::Error),
    #[error("unknown content encoding {0}")]
    UnknownEncoding(u8),
    #[error("datagram too short: {0} bytes")]
    Truncated(usize),
    #[error("unsupported wire version {0}")]
    UnsupportedVersion(u8),
    #[error("fragment size {0} exceeds the wire limit")]
    TooLarge(usize),
}

mod b64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &Bytes, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Bytes, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        STANDARD
            .decode(s.as_bytes())
            .map(Bytes::from)
            .map_err(serde::de::Error::custom)
    }
}
