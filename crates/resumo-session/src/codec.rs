//! Byte-level encoding of session records.
//!
//! A record is a sequence of frames, one per line:
//!
//! ```text
//! <payload length>:<checksum>:<payload json>\n
//! ```
//!
//! The checksum is the first 8 bytes of the payload's SHA-256, hex encoded.
//! Compact JSON never contains a raw newline, so every frame is exactly one line.
//! The first frame is always the header, which names the format and its version.

use chrono::{DateTime, Utc};
use resumo_core::{DecodeError, ResumoResult, SessionId, SessionRecord, Turn};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// Format name written into every header.
pub const FORMAT_NAME: &str = "resumo-session";
/// Highest format version this build writes and reads.
pub const FORMAT_VERSION: u32 = 1;

const CHECKSUM_BYTES: usize = 8;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Header {
    format: String,
    version: u32,
    id: SessionId,
    created_at: DateTime<Utc>,
    #[serde(default)]
    metadata: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum Frame {
    Header(Header),
    Turn(Turn),
    Metadata {
        key: String,
        value: String,
        at: DateTime<Utc>,
    },
    Touch {
        at: DateTime<Utc>,
    },
    Closed {
        at: DateTime<Utc>,
    },
}

/// Result of a tolerant decode: the record plus how much of the input it used.
#[derive(Debug, Clone)]
pub struct DecodedLog {
    /// Everything up to the last complete frame.
    pub record: SessionRecord,
    /// Byte length of the complete frames.
    pub valid_len: u64,
    /// Bytes of a dangling trailing fragment that were ignored.
    pub discarded_bytes: u64,
}

enum FrameFault {
    /// The input ends before the frame terminator.
    Incomplete,
    /// The frame is terminated but fails a structural or checksum check.
    Invalid(String),
}

fn checksum(payload: &[u8]) -> String {
    let digest = Sha256::digest(payload);
    hex::encode(&digest[..CHECKSUM_BYTES])
}

fn encode_frame(frame: &Frame) -> ResumoResult<Vec<u8>> {
    let payload = serde_json::to_vec(frame)?;
    let prefix = format!("{}:{}:", payload.len(), checksum(&payload));
    let mut out = Vec::with_capacity(prefix.len() + payload.len() + 1);
    out.extend_from_slice(prefix.as_bytes());
    out.extend_from_slice(&payload);
    out.push(b'\n');
    Ok(out)
}

/// Encodes the header frame for a new record.
pub fn encode_header(record: &SessionRecord) -> ResumoResult<Vec<u8>> {
    encode_frame(&Frame::Header(Header {
        format: FORMAT_NAME.to_string(),
        version: FORMAT_VERSION,
        id: record.id.clone(),
        created_at: record.created_at,
        metadata: record.metadata.clone(),
    }))
}

/// Encodes one turn frame.
pub fn encode_turn(turn: &Turn) -> ResumoResult<Vec<u8>> {
    encode_frame(&Frame::Turn(turn.clone()))
}

/// Encodes a metadata update frame.
pub fn encode_metadata(key: &str, value: &str, at: DateTime<Utc>) -> ResumoResult<Vec<u8>> {
    encode_frame(&Frame::Metadata {
        key: key.to_string(),
        value: value.to_string(),
        at,
    })
}

/// Encodes the close marker.
pub fn encode_closed(at: DateTime<Utc>) -> ResumoResult<Vec<u8>> {
    encode_frame(&Frame::Closed { at })
}

/// Encodes a whole record.
pub fn encode(record: &SessionRecord) -> ResumoResult<Vec<u8>> {
    let mut out = encode_header(record)?;
    let mut derived = record.created_at;
    for turn in &record.turns {
        out.extend_from_slice(&encode_turn(turn)?);
        derived = derived.max(turn.timestamp);
    }
    if let Some(closed_at) = record.closed_at {
        derived = derived.max(closed_at);
    }
    if record.last_active_at > derived {
        out.extend_from_slice(&encode_frame(&Frame::Touch {
            at: record.last_active_at,
        })?);
    }
    if let Some(closed_at) = record.closed_at {
        out.extend_from_slice(&encode_closed(closed_at)?);
    }
    Ok(out)
}

/// Strict decode: any trailing fragment is an error.
pub fn decode(bytes: &[u8]) -> Result<SessionRecord, DecodeError> {
    let log = decode_log(bytes)?;
    if log.discarded_bytes > 0 {
        return Err(DecodeError::truncated(format!(
            "{} trailing bytes after offset {}",
            log.discarded_bytes, log.valid_len
        )));
    }
    Ok(log.record)
}

/// Tolerant decode used for reading append logs.
///
/// A fault in the final line is treated as a write interrupted by a crash and
/// reported through [`DecodedLog::discarded_bytes`]. A fault followed by further
/// frames is corruption and fails with `Malformed`.
pub fn decode_log(bytes: &[u8]) -> Result<DecodedLog, DecodeError> {
    let mut offset = 0usize;
    let mut index = 0usize;
    let mut record: Option<SessionRecord> = None;

    while offset < bytes.len() {
        let (payload, next) = match read_frame(bytes, offset) {
            Ok(found) => found,
            Err(FrameFault::Incomplete) => break,
            Err(FrameFault::Invalid(detail)) => {
                if is_final_line(bytes, offset) {
                    break;
                }
                return Err(DecodeError::malformed(format!(
                    "frame {index} at offset {offset}: {detail}"
                )));
            }
        };

        let frame = parse_payload(payload, index)?;
        record = Some(match record.take() {
            None => start_record(frame, index)?,
            Some(mut current) => {
                apply_frame(&mut current, frame, index)?;
                current
            }
        });
        offset = next;
        index += 1;
    }

    let record = record.ok_or_else(|| {
        if bytes.is_empty() {
            DecodeError::truncated("empty input")
        } else {
            DecodeError::truncated("no complete header frame")
        }
    })?;

    Ok(DecodedLog {
        record,
        valid_len: offset as u64,
        discarded_bytes: (bytes.len() - offset) as u64,
    })
}

fn is_final_line(bytes: &[u8], offset: usize) -> bool {
    bytes[offset..]
        .iter()
        .position(|b| *b == b'\n')
        .map_or(true, |pos| offset + pos + 1 == bytes.len())
}

fn read_frame(bytes: &[u8], offset: usize) -> Result<(&[u8], usize), FrameFault> {
    let rest = &bytes[offset..];
    let Some(line_len) = rest.iter().position(|b| *b == b'\n') else {
        return Err(FrameFault::Incomplete);
    };
    let line = &rest[..line_len];

    let mut parts = line.splitn(3, |b| *b == b':');
    let (Some(len_field), Some(sum_field), Some(payload)) =
        (parts.next(), parts.next(), parts.next())
    else {
        return Err(FrameFault::Invalid("missing field delimiter".into()));
    };

    let declared = std::str::from_utf8(len_field)
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .ok_or_else(|| FrameFault::Invalid("invalid length field".into()))?;
    if declared != payload.len() {
        return Err(FrameFault::Invalid(format!(
            "declared length {declared}, found {}",
            payload.len()
        )));
    }

    let expected = std::str::from_utf8(sum_field)
        .map_err(|_| FrameFault::Invalid("invalid checksum field".into()))?;
    if checksum(payload) != expected {
        return Err(FrameFault::Invalid("checksum mismatch".into()));
    }

    Ok((payload, offset + line_len + 1))
}

fn parse_payload(payload: &[u8], index: usize) -> Result<Frame, DecodeError> {
    let value: Value = serde_json::from_slice(payload)
        .map_err(|e| DecodeError::malformed(format!("frame {index}: {e}")))?;

    if value.get("kind").and_then(Value::as_str) == Some("header") {
        let format = value.get("format").and_then(Value::as_str).unwrap_or_default();
        if format != FORMAT_NAME {
            return Err(DecodeError::malformed(format!("unknown format {format:?}")));
        }
        let version = value
            .get("version")
            .and_then(Value::as_u64)
            .ok_or_else(|| DecodeError::malformed("header has no version"))?;
        if version == 0 || version > u64::from(FORMAT_VERSION) {
            return Err(DecodeError::version_unsupported(
                u32::try_from(version).unwrap_or(u32::MAX),
                FORMAT_VERSION,
            ));
        }
    }

    serde_json::from_value(value).map_err(|e| DecodeError::malformed(format!("frame {index}: {e}")))
}

fn start_record(frame: Frame, index: usize) -> Result<SessionRecord, DecodeError> {
    match frame {
        Frame::Header(header) => Ok(SessionRecord {
            id: header.id,
            created_at: header.created_at,
            last_active_at: header.created_at,
            turns: Vec::new(),
            metadata: header.metadata,
            closed_at: None,
        }),
        _ => Err(DecodeError::malformed(format!(
            "frame {index} precedes the header"
        ))),
    }
}

fn apply_frame(record: &mut SessionRecord, frame: Frame, index: usize) -> Result<(), DecodeError> {
    match frame {
        Frame::Header(_) => {
            return Err(DecodeError::malformed(format!(
                "duplicate header at frame {index}"
            )))
        }
        Frame::Turn(turn) => record
            .push_turn(turn)
            .map_err(|e| DecodeError::malformed(format!("frame {index}: {e}")))?,
        Frame::Metadata { key, value, at } => {
            record.metadata.insert(key, value);
            record.touch(at);
        }
        Frame::Touch { at } => record.touch(at),
        Frame::Closed { at } => {
            record.closed_at = Some(at);
            record.touch(at);
        }
    }
    Ok(())
}
