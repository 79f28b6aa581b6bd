//! Manifest message format.
//!
//! A manifest is the final message of an upload. It is a fenced block of
//! `key: value` lines:
//!
//! ~~~text
//! ```
//! File: a.txt
//! Compressed: False
//! Total Chunks: 2
//! First Chunk ID: 100
//! Last Chunk ID: 101
//! ```
//! ~~~
//!
//! Keys are case-sensitive. `File`, `First Chunk ID` and `Last Chunk ID` are
//! required; every other key is optional and unknown keys are ignored so
//! older readers keep working when new keys are added.

use std::collections::HashMap;

use chrono::{DateTime, SecondsFormat, Utc};

use crate::constants::MANIFEST_FENCE;
use crate::names::validate_file_name;
use crate::types::Position;
use crate::ProtocolError;

pub const KEY_FILE: &str = "File";
pub const KEY_COMPRESSED: &str = "Compressed";
pub const KEY_TOTAL_CHUNKS: &str = "Total Chunks";
pub const KEY_FIRST_CHUNK: &str = "First Chunk ID";
pub const KEY_LAST_CHUNK: &str = "Last Chunk ID";
pub const KEY_FILE_SIZE: &str = "File Size";
pub const KEY_CHECKSUM: &str = "SHA-256";
pub const KEY_ENCRYPTED: &str = "Encrypted";
pub const KEY_KEY_ID: &str = "Key ID";
pub const KEY_CREATED_AT: &str = "Created At";

const REQUIRED_KEYS: [&str; 3] = [KEY_FILE, KEY_FIRST_CHUNK, KEY_LAST_CHUNK];

/// Description of one uploaded file and where its chunks live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Manifest {
    pub file_name: String,
    pub compressed: bool,
    /// Number of chunks. Absent in manifests written by minimal senders;
    /// the chunk frames carry the same value.
    pub total_chunks: Option<u32>,
    pub first_position: Position,
    pub last_position: Position,
    pub created_at: Option<DateTime<Utc>>,
    /// Size of the original file in bytes.
    pub file_size: Option<u64>,
    /// SHA-256 hex digest of the original file.
    pub checksum: Option<String>,
    pub encrypted: bool,
    /// Key store identifier of the key used when `encrypted` is set.
    pub key_id: Option<String>,
}

impl Manifest {
    /// Creates a manifest with the required fields; optional fields are empty.
    pub fn new(file_name: impl Into<String>, first: Position, last: Position) -> Self {
        Self {
            file_name: file_name.into(),
            compressed: false,
            total_chunks: None,
            first_position: first,
            last_position: last,
            created_at: None,
            file_size: None,
            checksum: None,
            encrypted: false,
            key_id: None,
        }
    }

    /// Serializes the manifest into its fenced text form.
    pub fn encode(&self) -> String {
        let mut lines = vec![
            MANIFEST_FENCE.to_string(),
            format!("{KEY_FILE}: {}", self.file_name),
            format!("{KEY_COMPRESSED}: {}", encode_bool(self.compressed)),
        ];
        if let Some(total) = self.total_chunks {
            lines.push(format!("{KEY_TOTAL_CHUNKS}: {total}"));
        }
        lines.push(format!("{KEY_FIRST_CHUNK}: {}", self.first_position));
        lines.push(format!("{KEY_LAST_CHUNK}: {}", self.last_position));
        if let Some(size) = self.file_size {
            lines.push(format!("{KEY_FILE_SIZE}: {size}"));
        }
        if let Some(ref checksum) = self.checksum {
            lines.push(format!("{KEY_CHECKSUM}: {checksum}"));
        }
        if self.encrypted {
            lines.push(format!("{KEY_ENCRYPTED}: {}", encode_bool(true)));
        }
        if let Some(ref key_id) = self.key_id {
            lines.push(format!("{KEY_KEY_ID}: {key_id}"));
        }
        if let Some(created_at) = self.created_at {
            lines.push(format!(
                "{KEY_CREATED_AT}: {}",
                created_at.to_rfc3339_opts(SecondsFormat::AutoSi, true)
            ));
        }
        lines.push(MANIFEST_FENCE.to_string());
        lines.join("\n")
    }

    /// Parses a manifest from its text form.
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        // key -> (value, original line)
        let mut fields: HashMap<&str, (&str, &str)> = HashMap::new();

        for raw in text.lines() {
            let trimmed = raw.trim();
            let is_fence = trimmed.starts_with(MANIFEST_FENCE);
            let line = strip_fence(trimmed);
            if line.is_empty() {
                continue;
            }
            let Some((key, value)) = line.split_once(':') else {
                // "```text" style info strings on the opening fence.
                if is_fence {
                    continue;
                }
                return Err(parse_error(trimmed, "missing ':' separator"));
            };
            fields.insert(key.trim(), (value.trim(), trimmed));
        }

        for key in REQUIRED_KEYS {
            if !fields.contains_key(key) {
                return Err(ProtocolError::ManifestParse {
                    line: key.to_string(),
                    reason: "required key is missing".into(),
                });
            }
        }

        let field = |key: &str| fields.get(key).copied();

        let (file_name, _) = field(KEY_FILE).unwrap_or_default();
        let first_position = parse_position(field(KEY_FIRST_CHUNK))?;
        let last_position = parse_position(field(KEY_LAST_CHUNK))?;

        let compressed = match field(KEY_COMPRESSED) {
            Some((value, line)) => parse_bool(value, line)?,
            None => false,
        };
        let encrypted = match field(KEY_ENCRYPTED) {
            Some((value, line)) => parse_bool(value, line)?,
            None => false,
        };
        let total_chunks = match field(KEY_TOTAL_CHUNKS) {
            Some((value, line)) => Some(
                value
                    .parse::<u32>()
                    .map_err(|e| parse_error(line, &e.to_string()))?,
            ),
            None => None,
        };
        let file_size = match field(KEY_FILE_SIZE) {
            Some((value, line)) => Some(
                value
                    .parse::<u64>()
                    .map_err(|e| parse_error(line, &e.to_string()))?,
            ),
            None => None,
        };
        let checksum = match field(KEY_CHECKSUM) {
            Some((value, line)) => {
                if value.len() != 64 || !value.chars().all(|c| c.is_ascii_hexdigit()) {
                    return Err(parse_error(line, "expected 64 hex characters"));
                }
                Some(value.to_ascii_lowercase())
            }
            None => None,
        };
        let key_id = field(KEY_KEY_ID)
            .map(|(value, _)| value.to_string())
            .filter(|v| !v.is_empty());
        let created_at = match field(KEY_CREATED_AT) {
            Some((value, line)) => Some(
                DateTime::parse_from_rfc3339(value)
                    .map_err(|e| parse_error(line, &e.to_string()))?
                    .with_timezone(&Utc),
            ),
            None => None,
        };

        let manifest = Self {
            file_name: file_name.to_string(),
            compressed,
            total_chunks,
            first_position,
            last_position,
            created_at,
            file_size,
            checksum,
            encrypted,
            key_id,
        };
        manifest.validate()?;
        Ok(manifest)
    }

    /// Checks the cross-field invariants.
    pub fn validate(&self) -> Result<(), ProtocolError> {
        validate_file_name(&self.file_name)?;

        if self.first_position > self.last_position {
            return Err(ProtocolError::ManifestValidation(format!(
                "first chunk position {} is greater than last chunk position {}",
                self.first_position, self.last_position
            )));
        }

        if self.total_chunks == Some(0) {
            return Err(ProtocolError::ManifestValidation(
                "total chunks must be positive".into(),
            ));
        }

        if self.encrypted && self.key_id.is_none() {
            return Err(ProtocolError::ManifestValidation(
                "encrypted manifest without a key id".into(),
            ));
        }

        Ok(())
    }
}

/// Returns `true` if `text` has the shape of a manifest message: fenced, with
/// a `File:` line. Used to pick candidates during discovery.
pub fn looks_like_manifest(text: &str) -> bool {
    let trimmed = text.trim();
    trimmed.starts_with(MANIFEST_FENCE)
        && trimmed
            .lines()
            .any(|l| strip_fence(l.trim()).starts_with(&format!("{KEY_FILE}:")))
}

fn strip_fence(line: &str) -> &str {
    line.trim_start_matches(MANIFEST_FENCE)
        .trim_end_matches(MANIFEST_FENCE)
        .trim()
}

fn encode_bool(value: bool) -> &'static str {
    if value { "True" } else { "False" }
}

fn parse_bool(value: &str, line: &str) -> Result<bool, ProtocolError> {
    if value.eq_ignore_ascii_case("true") {
        Ok(true)
    } else if value.eq_ignore_ascii_case("false") {
        Ok(false)
    } else {
        Err(parse_error(line, "expected True or False"))
    }
}

fn parse_position(field: Option<(&str, &str)>) -> Result<Position, ProtocolError> {
    let (value, line) = field.unwrap_or_default();
    value
        .parse::<Position>()
        .map_err(|e| parse_error(line, &e.to_string()))
}

fn parse_error(line: &str, reason: &str) -> ProtocolError {
    ProtocolError::ManifestParse {
        line: line.to_string(),
        reason: reason.to_string(),
    }
}
