//! Archival of aged-out entries to a pluggable backend. Archives are JSON
//! arrays of entries, optionally gzipped, named
//! `logs-archive-YYYYMMDD-HHMMSS.json[.gz]`.

mod local;
mod s3;

pub use local::LocalArchive;
pub use s3::S3Archive;

use chrono::{DateTime, NaiveDateTime, Utc};
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use serde::Serialize;
use std::io::{Read, Write};

use crate::config::{ArchiveSettings, StorageKind};
use crate::error::{Error, Result};
use crate::models::log::LogEntry;

const NAME_PREFIX: &str = "logs-archive-";
/// Gzip streams start with these two bytes.
const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

#[derive(Debug, Clone, Serialize)]
pub struct StorageMetrics {
    pub count: u64,
    pub total_bytes: u64,
    pub oldest: Option<String>,
    pub newest: Option<String>,
}

/// Archive backend variants. Dispatch is a match, not a vtable.
pub enum ArchiveStore {
    Local(LocalArchive),
    S3(S3Archive),
}

impl ArchiveStore {
    pub fn from_settings(settings: &ArchiveSettings) -> Result<Self> {
        match settings.storage {
            StorageKind::Local => Ok(ArchiveStore::Local(LocalArchive::new(
                settings.local_path.clone(),
            ))),
            StorageKind::S3 => {
                let bucket = settings
                    .s3_bucket
                    .clone()
                    .ok_or_else(|| Error::Config("s3 storage requires a bucket".into()))?;
                Ok(ArchiveStore::S3(S3Archive::new(
                    bucket,
                    settings.s3_region.clone(),
                )))
            }
        }
    }

    pub fn save_archive(&self, name: &str, bytes: &[u8]) -> Result<()> {
        match self {
            ArchiveStore::Local(backend) => backend.save_archive(name, bytes),
            ArchiveStore::S3(backend) => backend.save_archive(name, bytes),
        }
    }

    pub fn list_archives(&self) -> Result<Vec<String>> {
        match self {
            ArchiveStore::Local(backend) => backend.list_archives(),
            ArchiveStore::S3(backend) => backend.list_archives(),
        }
    }

    pub fn get_archive(&self, name: &str) -> Result<Vec<u8>> {
        match self {
            ArchiveStore::Local(backend) => backend.get_archive(name),
            ArchiveStore::S3(backend) => backend.get_archive(name),
        }
    }

    pub fn delete_archive(&self, name: &str) -> Result<()> {
        match self {
            ArchiveStore::Local(backend) => backend.delete_archive(name),
            ArchiveStore::S3(backend) => backend.delete_archive(name),
        }
    }

    pub fn get_storage_metrics(&self) -> Result<StorageMetrics> {
        match self {
            ArchiveStore::Local(backend) => backend.get_storage_metrics(),
            ArchiveStore::S3(backend) => backend.get_storage_metrics(),
        }
    }

    /// Names whose embedded timestamp falls inside [start, end]. Names that
    /// do not parse are skipped, not errored.
    pub fn search_archives(
        &self,
        start: &DateTime<Utc>,
        end: &DateTime<Utc>,
    ) -> Result<Vec<String>> {
        let mut matches: Vec<String> = self
            .list_archives()?
            .into_iter()
            .filter(|name| match parse_archive_timestamp(name) {
                Some(at) => at >= *start && at <= *end,
                None => false,
            })
            .collect();
        matches.sort();
        Ok(matches)
    }
}

/// `logs-archive-YYYYMMDD-HHMMSS.json[.gz]` for the given instant.
pub fn archive_filename(at: &DateTime<Utc>, compressed: bool) -> String {
    let stamp = at.format("%Y%m%d-%H%M%S");
    if compressed {
        format!("{NAME_PREFIX}{stamp}.json.gz")
    } else {
        format!("{NAME_PREFIX}{stamp}.json")
    }
}

/// Parse the timestamp embedded in an archive filename. Returns `None` for
/// anything that does not follow the naming scheme.
pub fn parse_archive_timestamp(name: &str) -> Option<DateTime<Utc>> {
    let rest = name.strip_prefix(NAME_PREFIX)?;
    let stamp = rest
        .strip_suffix(".json.gz")
        .or_else(|| rest.strip_suffix(".json"))?;
    NaiveDateTime::parse_from_str(stamp, "%Y%m%d-%H%M%S")
        .ok()
        .map(|naive| naive.and_utc())
}

/// Marshal a batch to JSON, gzipping when requested.
pub fn encode_batch(entries: &[LogEntry], compress: bool) -> Result<Vec<u8>> {
    let json = serde_json::to_vec(entries).map_err(|e| Error::Internal(e.into()))?;
    if !compress {
        return Ok(json);
    }
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(&json)
        .and_then(|_| encoder.finish())
        .map_err(|e| Error::Internal(e.into()))
}

/// Decode an archive blob back to entries, sniffing gzip by magic prefix.
pub fn decode_batch(bytes: &[u8]) -> Result<Vec<LogEntry>> {
    let json: Vec<u8> = if bytes.starts_with(&GZIP_MAGIC) {
        let mut decoder = GzDecoder::new(bytes);
        let mut out = Vec::new();
        decoder
            .read_to_end(&mut out)
            .map_err(|e| Error::validation(format!("corrupt gzip archive: {e}")))?;
        out
    } else {
        bytes.to_vec()
    };
    serde_json::from_slice(&json).map_err(|e| Error::validation(format!("corrupt archive: {e}")))
}
