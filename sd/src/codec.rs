//! Revoked-set serialization
//!
//! Steady-state format: a JSON snapshot compressed with zlib.
//!
//! ```text
//! zlib( {"v":1,"maxlen":50000,"expires_ms":10800000,"entries":[["task-id",1718000000000],...]} )
//! ```
//!
//! Entries are written oldest first so decoding rebuilds the same eviction order.
//!
//! The legacy path reads the local state files older workers kept, in any of
//! their three layouts, and normalizes them to a [`RevokedTaskSet`]. It is only
//! used by the migrator.

use std::io::{self, Read, Write};
use std::time::Duration;

use flate2::Compression;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::DecodeError;
use crate::revoked::{RevokedTaskSet, Timestamp, now_ms};

/// Version tag of the current blob format
pub const FORMAT_VERSION: u32 = 1;

#[derive(Debug, Deserialize)]
struct Header {
    v: u32,
}

#[derive(Debug, Serialize, Deserialize)]
struct Snapshot {
    v: u32,
    #[serde(default)]
    maxlen: usize,
    #[serde(default)]
    expires_ms: Option<u64>,
    entries: Vec<(String, Timestamp)>,
}

impl From<&RevokedTaskSet> for Snapshot {
    fn from(set: &RevokedTaskSet) -> Self {
        Self {
            v: FORMAT_VERSION,
            maxlen: set.maxlen(),
            expires_ms: set.expires().map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX)),
            entries: set.iter().map(|(id, ts)| (id.to_string(), ts)).collect(),
        }
    }
}

impl Snapshot {
    fn into_set(self) -> RevokedTaskSet {
        let mut set = RevokedTaskSet::new(self.maxlen, self.expires_ms.map(Duration::from_millis));
        for (task_id, timestamp) in self.entries {
            set.insert_at(task_id, timestamp);
        }
        set
    }
}

/// Serialize and compress a revoked set
pub fn encode(set: &RevokedTaskSet) -> io::Result<Vec<u8>> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    serde_json::to_writer(&mut encoder, &Snapshot::from(set))?;
    encoder.flush()?;
    let bytes = encoder.finish()?;
    debug!(entries = set.len(), bytes = bytes.len(), "encode: done");
    Ok(bytes)
}

/// Decompress and deserialize a revoked set
///
/// Empty input, a broken zlib stream, bad JSON and an unknown version are all
/// distinct errors; none of them decode to an empty set.
pub fn decode(bytes: &[u8]) -> Result<RevokedTaskSet, DecodeError> {
    if bytes.is_empty() {
        return Err(DecodeError::Empty);
    }

    let mut json = Vec::new();
    ZlibDecoder::new(bytes)
        .read_to_end(&mut json)
        .map_err(DecodeError::Decompress)?;

    let header: Header = serde_json::from_slice(&json)?;
    if header.v != FORMAT_VERSION {
        return Err(DecodeError::UnsupportedVersion(header.v));
    }

    let snapshot: Snapshot = serde_json::from_slice(&json)?;
    Ok(snapshot.into_set())
}

/// Layout a legacy state file was written in, newest first
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LegacyFormat {
    /// `zrevoked`: a compressed blob in the current format
    Compressed,
    /// `revoked`: a structured set with bounds and per-entry timestamps
    Structured,
    /// `revoked` (or the whole file): a bare collection of ids
    Raw,
}

impl std::fmt::Display for LegacyFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Compressed => write!(f, "v3 (compressed)"),
            Self::Structured => write!(f, "v2 (structured)"),
            Self::Raw => write!(f, "v1 (raw)"),
        }
    }
}

/// Result of reading a legacy state file
#[derive(Debug, Clone, PartialEq)]
pub struct LegacyImport {
    /// The normalized set, if the file held any revoked data
    pub revoked: Option<RevokedTaskSet>,
    pub format: Option<LegacyFormat>,
    /// The clock, only if the file stored one
    pub clock: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct LegacyDocument {
    #[serde(default)]
    zrevoked: Option<Vec<u8>>,
    #[serde(default)]
    revoked: Option<serde_json::Value>,
    #[serde(default)]
    clock: Option<u64>,
}

/// v2 layout: float-second timestamps, as the old files stored them
#[derive(Debug, Deserialize)]
struct StructuredSet {
    #[serde(default)]
    maxlen: Option<usize>,
    #[serde(default)]
    expires: Option<f64>,
    entries: Vec<(String, f64)>,
}

fn seconds_to_ms(seconds: f64) -> Timestamp {
    (seconds * 1000.0).round() as Timestamp
}

impl StructuredSet {
    /// Missing bounds mean unbounded, so an import never drops entries
    fn into_set(self) -> RevokedTaskSet {
        let maxlen = self.maxlen.unwrap_or(0);
        let expires = self
            .expires
            .filter(|secs| *secs > 0.0)
            .and_then(|secs| Duration::try_from_secs_f64(secs).ok());

        let mut entries = self.entries;
        entries.sort_by(|a, b| a.1.total_cmp(&b.1));

        let mut set = RevokedTaskSet::new(maxlen, expires);
        for (task_id, seconds) in entries {
            set.insert_at(task_id, seconds_to_ms(seconds));
        }
        set
    }
}

/// v1 layout: ids only, either a list or a map keyed by id
///
/// These files carried no bounds, so every id is kept.
fn raw_collection(value: &serde_json::Value) -> Option<RevokedTaskSet> {
    let now = now_ms();
    let mut set = RevokedTaskSet::unbounded();
    match value {
        serde_json::Value::Array(items) => {
            for item in items {
                set.insert_at(item.as_str()?, now);
            }
        }
        serde_json::Value::Object(map) => {
            for (task_id, stamp) in map {
                let timestamp = stamp.as_f64().map(seconds_to_ms).unwrap_or(now);
                set.insert_at(task_id.as_str(), timestamp);
            }
        }
        _ => return None,
    }
    Some(set)
}

fn decode_legacy_revoked(value: serde_json::Value) -> Result<(RevokedTaskSet, LegacyFormat), DecodeError> {
    if let Ok(structured) = serde_json::from_value::<StructuredSet>(value.clone()) {
        return Ok((structured.into_set(), LegacyFormat::Structured));
    }
    raw_collection(&value)
        .map(|set| (set, LegacyFormat::Raw))
        .ok_or(DecodeError::UnrecognizedLegacyFormat)
}

/// Sniff a legacy state file and normalize its contents
///
/// Tries `zrevoked`, then a structured `revoked`, then a raw `revoked`
/// collection. A file that is itself a bare JSON array is read as v1.
pub fn decode_legacy(bytes: &[u8]) -> Result<LegacyImport, DecodeError> {
    if bytes.is_empty() {
        return Err(DecodeError::Empty);
    }

    let value: serde_json::Value = serde_json::from_slice(bytes)?;
    if value.is_array() {
        let revoked = raw_collection(&value).ok_or(DecodeError::UnrecognizedLegacyFormat)?;
        return Ok(LegacyImport {
            revoked: Some(revoked),
            format: Some(LegacyFormat::Raw),
            clock: None,
        });
    }

    let document: LegacyDocument = serde_json::from_value(value)?;

    let (revoked, format) = if let Some(blob) = document.zrevoked {
        (Some(decode(&blob)?), Some(LegacyFormat::Compressed))
    } else if let Some(revoked) = document.revoked {
        let (set, format) = decode_legacy_revoked(revoked)?;
        (Some(set), Some(format))
    } else {
        (None, None)
    };

    debug!(?format, entries = revoked.as_ref().map(|s| s.len()), "decode_legacy: done");
    Ok(LegacyImport {
        revoked,
        format,
        clock: document.clock,
    })
}
