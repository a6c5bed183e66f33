use std::time::{Duration, SystemTime};

use bytes::Bytes;
use http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;

const MAGIC: &str = "STASH/1";
const MAX_META_LEN: usize = 16 * 1024 * 1024;

/// A captured upstream response. Immutable once stored.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub captured_at: SystemTime,
}

impl CacheEntry {
    pub fn new(status: StatusCode, headers: HeaderMap, body: Bytes) -> Self {
        Self {
            status,
            headers,
            body,
            captured_at: SystemTime::now(),
        }
    }
}

/// Entry metadata as written at the front of each entry file.
#[derive(Debug, Serialize, Deserialize)]
struct PersistedEntry {
    key: String,
    status: u16,
    headers: Vec<(String, PersistedValue)>,
    captured_at: u64,
    content_hash: String,
    content_length: u64,
}

/// Header values are kept as text when they are visible ASCII and as raw bytes otherwise, so
/// values such as UTF-8 filenames replay unchanged.
#[derive(Debug, Serialize, Deserialize)]
#[serde(untagged)]
enum PersistedValue {
    Text(String),
    Bytes(Vec<u8>),
}

impl PersistedValue {
    fn as_bytes(&self) -> &[u8] {
        match self {
            PersistedValue::Text(text) => text.as_bytes(),
            PersistedValue::Bytes(bytes) => bytes,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub(super) enum DecodeError {
    #[error("missing or unknown file header")]
    BadHeader,
    #[error("metadata is not valid: {0}")]
    BadMetadata(String),
    #[error("entry belongs to a different key")]
    KeyMismatch,
    #[error("body length or hash does not match metadata")]
    BodyMismatch,
}

/// Layout: `STASH/1 <meta_len>\n`, then `meta_len` bytes of JSON metadata, then the raw body.
pub(super) fn encode(key: &str, entry: &CacheEntry) -> Result<Vec<u8>, serde_json::Error> {
    let persisted = PersistedEntry {
        key: key.to_string(),
        status: entry.status.as_u16(),
        headers: headermap_to_vec(&entry.headers),
        captured_at: entry
            .captured_at
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs(),
        content_hash: content_hash(&entry.body),
        content_length: entry.body.len() as u64,
    };
    let meta = serde_json::to_vec(&persisted)?;
    let header = format!("{MAGIC} {}\n", meta.len());
    let mut out = Vec::with_capacity(header.len() + meta.len() + entry.body.len());
    out.extend_from_slice(header.as_bytes());
    out.extend_from_slice(&meta);
    out.extend_from_slice(&entry.body);
    Ok(out)
}

pub(super) fn decode(key: &str, data: Bytes) -> Result<CacheEntry, DecodeError> {
    let newline = data
        .iter()
        .take(64)
        .position(|b| *b == b'\n')
        .ok_or(DecodeError::BadHeader)?;
    let header = std::str::from_utf8(&data[..newline]).map_err(|_| DecodeError::BadHeader)?;
    let meta_len: usize = match header.split_once(' ') {
        Some((MAGIC, len)) => len.parse().map_err(|_| DecodeError::BadHeader)?,
        _ => return Err(DecodeError::BadHeader),
    };
    let meta_start = newline + 1;
    if meta_len > MAX_META_LEN || data.len() < meta_start + meta_len {
        return Err(DecodeError::BadHeader);
    }
    let persisted: PersistedEntry =
        serde_json::from_slice(&data[meta_start..meta_start + meta_len])
            .map_err(|err| DecodeError::BadMetadata(err.to_string()))?;
    if persisted.key != key {
        return Err(DecodeError::KeyMismatch);
    }
    let status = StatusCode::from_u16(persisted.status)
        .map_err(|_| DecodeError::BadMetadata(format!("invalid status {}", persisted.status)))?;

    let body = data.slice(meta_start + meta_len..);
    if body.len() as u64 != persisted.content_length || content_hash(&body) != persisted.content_hash
    {
        return Err(DecodeError::BodyMismatch);
    }
    Ok(CacheEntry {
        status,
        headers: to_headermap(&persisted.headers)?,
        body,
        captured_at: SystemTime::UNIX_EPOCH + Duration::from_secs(persisted.captured_at),
    })
}

fn content_hash(body: &[u8]) -> String {
    blake3::hash(body).to_hex().to_string()
}

fn to_headermap(items: &[(String, PersistedValue)]) -> Result<HeaderMap, DecodeError> {
    let mut map = HeaderMap::with_capacity(items.len());
    for (name, value) in items {
        let name = HeaderName::try_from(name.as_str())
            .map_err(|_| DecodeError::BadMetadata(format!("invalid header name {name:?}")))?;
        let value = HeaderValue::from_bytes(value.as_bytes())
            .map_err(|_| DecodeError::BadMetadata(format!("invalid value for header {name}")))?;
        map.append(name, value);
    }
    Ok(map)
}

fn headermap_to_vec(map: &HeaderMap) -> Vec<(String, PersistedValue)> {
    map.iter()
        .map(|(name, value)| {
            let value = match value.to_str() {
                Ok(text) => PersistedValue::Text(text.to_string()),
                Err(_) => PersistedValue::Bytes(value.as_bytes().to_vec()),
            };
            (name.as_str().to_string(), value)
        })
        .collect()
}
