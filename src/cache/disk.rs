//! Durable on-disk tier.
//!
//! One file per cache key, named by the SHA-256 of the key. Layout:
//!
//! ```text
//! +-------+----------------+------------------+-----------------+
//! | MCA1  | header len u32 | JSON header      | payload bytes   |
//! | 4 B   | little endian  | (DiskHeader)     | (rest of file)  |
//! +-------+----------------+------------------+-----------------+
//! ```
//!
//! A file whose header does not parse, or whose payload is empty, is invalid.

use super::CacheEntry;
use crate::endpoint::file_extension;
use crate::error::{MirrorError, Result};
use crate::transport::Validators;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, warn};

/// Extension of every file owned by the durable tier.
pub const ENTRY_EXTENSION: &str = "asset";

const MAGIC: &[u8; 4] = b"MCA1";
const PREFIX_LEN: usize = MAGIC.len() + 4;

/// Suffix of staging files; a crash between write and rename leaves one behind.
const STAGING_SUFFIX: &str = ".tmp";

static STAGING_SEQ: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Serialize, Deserialize)]
struct DiskHeader {
    key: String,
    origin_url: String,
    extension: Option<String>,
    etag: Option<String>,
    last_modified: Option<String>,
    cached_at: DateTime<Utc>,
}

/// Result of reading one key from disk.
#[derive(Debug)]
pub enum DiskLookup {
    Hit(CacheEntry),
    Miss,
    /// The file exists but could not be read or is invalid
    Error(MirrorError),
}

/// Aggregate size of the durable tier.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DiskUsage {
    pub entries: usize,
    pub bytes: u64,
}

/// Outcome of a best-effort clear.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ClearReport {
    pub removed: usize,
    pub failed: usize,
}

#[derive(Clone, Debug)]
pub struct DiskTier {
    dir: PathBuf,
}

impl DiskTier {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// File holding `key`: hex SHA-256 of the key plus the tier's extension.
    pub fn path_for(&self, key: &str) -> PathBuf {
        let mut hasher = Sha256::new();
        hasher.update(key.as_bytes());
        let digest = hex::encode(hasher.finalize());
        self.dir.join(format!("{digest}.{ENTRY_EXTENSION}"))
    }

    pub async fn read(&self, key: &str) -> DiskLookup {
        let path = self.path_for(key);
        let raw = match tokio::fs::read(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => return DiskLookup::Miss,
            Err(e) => return DiskLookup::Error(e.into()),
        };

        match decode(&raw) {
            Ok((header, payload)) if header.key == key => DiskLookup::Hit(CacheEntry {
                key: header.key,
                bytes: payload,
                origin_url: header.origin_url,
                validators: Validators {
                    etag: header.etag,
                    last_modified: header.last_modified,
                },
                cached_at: header.cached_at,
            }),
            Ok((header, _)) => DiskLookup::Error(MirrorError::CorruptEntry(format!(
                "{} holds key {} instead of {}",
                path.display(),
                header.key,
                key
            ))),
            Err(e) => DiskLookup::Error(e),
        }
    }

    /// Write an entry atomically (temp file, then rename).
    ///
    /// Every write stages to its own file, so concurrent writers of one key
    /// never interleave; the last rename wins.
    pub async fn write(&self, entry: &CacheEntry) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;

        let header = DiskHeader {
            key: entry.key.clone(),
            origin_url: entry.origin_url.clone(),
            extension: file_extension(&entry.origin_url),
            etag: entry.validators.etag.clone(),
            last_modified: entry.validators.last_modified.clone(),
            cached_at: entry.cached_at,
        };
        let encoded = encode(&header, &entry.bytes)?;

        let path = self.path_for(&entry.key);
        let seq = STAGING_SEQ.fetch_add(1, Ordering::Relaxed);
        let tmp = path.with_extension(format!(
            "{ENTRY_EXTENSION}.{}-{seq}{STAGING_SUFFIX}",
            std::process::id()
        ));

        let staged = match tokio::fs::write(&tmp, encoded).await {
            Ok(()) => tokio::fs::rename(&tmp, &path).await,
            Err(e) => Err(e),
        };
        if let Err(e) = staged {
            if let Err(cleanup) = tokio::fs::remove_file(&tmp).await {
                debug!("Could not remove staging file {}: {}", tmp.display(), cleanup);
            }
            return Err(e.into());
        }

        debug!("Wrote {} ({} bytes) to {}", entry.key, entry.bytes.len(), path.display());
        Ok(())
    }

    /// Remove `key`. Returns whether a file was deleted.
    pub async fn remove(&self, key: &str) -> Result<bool> {
        match tokio::fs::remove_file(self.path_for(key)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Delete every entry file and any staging files left by interrupted
    /// writes. Individual failures are logged and counted, never returned.
    pub async fn clear(&self) -> ClearReport {
        let mut report = ClearReport::default();
        for path in self.list_files(|p| is_entry_file(p) || is_staging_file(p)).await {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => report.removed += 1,
                Err(e) => {
                    warn!("Failed to delete cache file {}: {}", path.display(), e);
                    report.failed += 1;
                }
            }
        }
        report
    }

    pub async fn usage(&self) -> DiskUsage {
        let mut usage = DiskUsage::default();
        for path in self.list_files(is_entry_file).await {
            if let Ok(meta) = tokio::fs::metadata(&path).await {
                usage.entries += 1;
                usage.bytes += meta.len();
            }
        }
        usage
    }

    async fn list_files(&self, wanted: impl Fn(&Path) -> bool) -> Vec<PathBuf> {
        let mut files = Vec::new();
        let mut dir = match tokio::fs::read_dir(&self.dir).await {
            Ok(dir) => dir,
            Err(e) => {
                if e.kind() != ErrorKind::NotFound {
                    warn!("Cannot list cache dir {}: {}", self.dir.display(), e);
                }
                return files;
            }
        };

        loop {
            match dir.next_entry().await {
                Ok(Some(entry)) => {
                    let path = entry.path();
                    if wanted(&path) {
                        files.push(path);
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!("Error listing cache dir {}: {}", self.dir.display(), e);
                    break;
                }
            }
        }
        files
    }
}

fn is_entry_file(path: &Path) -> bool {
    path.extension().and_then(|e| e.to_str()) == Some(ENTRY_EXTENSION)
}

fn is_staging_file(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.ends_with(STAGING_SUFFIX) && n.contains(&format!(".{ENTRY_EXTENSION}.")))
}

fn encode(header: &DiskHeader, payload: &[u8]) -> Result<Vec<u8>> {
    let header_json = serde_json::to_vec(header)?;
    let header_len = u32::try_from(header_json.len())
        .map_err(|_| MirrorError::CorruptEntry("header too large".to_string()))?;

    let mut out = Vec::with_capacity(PREFIX_LEN + header_json.len() + payload.len());
    out.extend_from_slice(MAGIC);
    out.extend_from_slice(&header_len.to_le_bytes());
    out.extend_from_slice(&header_json);
    out.extend_from_slice(payload);
    Ok(out)
}

fn decode(raw: &[u8]) -> Result<(DiskHeader, Bytes)> {
    if raw.len() < PREFIX_LEN || &raw[..MAGIC.len()] != MAGIC {
        return Err(MirrorError::CorruptEntry("bad magic".to_string()));
    }

    let mut len_bytes = [0u8; 4];
    len_bytes.copy_from_slice(&raw[MAGIC.len()..PREFIX_LEN]);
    let header_len = u32::from_le_bytes(len_bytes) as usize;

    let payload_start = PREFIX_LEN
        .checked_add(header_len)
        .filter(|end| *end <= raw.len())
        .ok_or_else(|| MirrorError::CorruptEntry("truncated header".to_string()))?;

    let header: DiskHeader = serde_json::from_slice(&raw[PREFIX_LEN..payload_start])
        .map_err(|e| MirrorError::CorruptEntry(format!("unreadable header: {e}")))?;

    let payload = &raw[payload_start..];
    if payload.is_empty() {
        return Err(MirrorError::CorruptEntry("empty payload".to_string()));
    }

    Ok((header, Bytes::copy_from_slice(payload)))
}
