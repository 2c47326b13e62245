// Content-addressable write path for case detail pages.
//
// Blob first (compressed body + metadata), then the audit rows in one
// relational transaction. The two stores commit independently: a crash in
// between leaves a blob with no audit rows, which readers ignore.

use std::io::{Read, Write};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use casesearch_common::{ScrapeAudit, ScrapeEvent, ScrapeVersion, StoredPage};

use crate::traits::{CaseStore, PageStore};

/// What `PageWriter::store` ended up doing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreResult {
    /// A new version was written under this version id.
    Written { version_id: String },
    /// Stored content is byte-identical; nothing written.
    Unchanged,
}

pub struct PageWriter {
    pages: Arc<dyn PageStore>,
    cases: Arc<dyn CaseStore>,
}

impl PageWriter {
    pub fn new(pages: Arc<dyn PageStore>, cases: Arc<dyn CaseStore>) -> Self {
        Self { pages, cases }
    }

    /// Persist `html` as the latest version of `case_number`.
    ///
    /// With `check_before_store`, the write is skipped when the stored body
    /// decompresses to exactly `html`. Without it, a new version is always
    /// written (backfill assumes nothing is stored yet).
    pub async fn store(
        &self,
        case_number: &str,
        detail_loc: &str,
        html: &str,
        duration: Option<Duration>,
        check_before_store: bool,
    ) -> Result<StoreResult> {
        if check_before_store {
            match self.pages.get(case_number).await? {
                None => {
                    debug!(case_number, "Case details not found, adding");
                }
                Some(previous) => {
                    let previous_html = gunzip(&previous.body)
                        .with_context(|| format!("stored body for {case_number} is corrupt"))?;
                    if previous_html == html {
                        debug!(case_number, "Case details unchanged");
                        return Ok(StoreResult::Unchanged);
                    }
                    debug!(case_number, "Found new version of case, replacing");
                }
            }
        }

        self.write(case_number, detail_loc, html, duration, Utc::now())
            .await
    }

    async fn write(
        &self,
        case_number: &str,
        detail_loc: &str,
        html: &str,
        duration: Option<Duration>,
        timestamp: DateTime<Utc>,
    ) -> Result<StoreResult> {
        let hash = content_hash(html);
        let body = gzip(html)?;

        self.pages
            .put(StoredPage {
                case_number: case_number.to_string(),
                body,
                timestamp,
                detail_loc: detail_loc.to_string(),
                content_hash: hash.clone(),
            })
            .await?;
        self.pages.commit().await?;

        let version_id = version_id(&hash, timestamp);
        let audit = ScrapeAudit {
            version: ScrapeVersion {
                version_id: version_id.clone(),
                case_number: case_number.to_string(),
                length: html.len() as i64,
                sha256: hash,
            },
            event: ScrapeEvent {
                case_number: case_number.to_string(),
                version_id: version_id.clone(),
                timestamp,
                duration_secs: duration.map(|d| d.as_secs_f64()),
            },
        };
        self.cases
            .record_scrape(&audit)
            .await
            .with_context(|| format!("blob for {case_number} written without audit rows"))?;

        info!(case_number, version_id = %version_id, bytes = html.len(), "Stored case details");
        Ok(StoreResult::Written { version_id })
    }
}

/// sha256 hex of the uncompressed page text.
pub fn content_hash(html: &str) -> String {
    hex::encode(Sha256::digest(html.as_bytes()))
}

/// Hash plus write time, so rewriting identical content later still yields a
/// distinct version.
pub fn version_id(hash: &str, timestamp: DateTime<Utc>) -> String {
    format!("{hash}{}", timestamp.format("%Y-%m-%d %H:%M:%S%.6f"))
}

pub fn gzip(text: &str) -> Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(text.as_bytes())?;
    Ok(encoder.finish()?)
}

pub fn gunzip(bytes: &[u8]) -> Result<String> {
    let mut text = String::new();
    GzDecoder::new(bytes).read_to_string(&mut text)?;
    Ok(text)
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    #[test]
    fn gzip_roundtrip_preserves_text() {
        let html = "<html>Case Number: 24-C-21-001234 ünïcödé</html>";
        assert_eq!(gunzip(&gzip(html).unwrap()).unwrap(), html);
    }

    #[test]
    fn gunzip_rejects_garbage() {
        assert!(gunzip(b"not gzip").is_err());
    }

    #[test]
    fn content_hash_is_sha256_hex() {
        assert_eq!(
            content_hash(""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn version_id_appends_timestamp() {
        let ts = Utc.with_ymd_and_hms(2024, 3, 1, 12, 30, 5).unwrap();
        assert_eq!(version_id("abc", ts), "abc2024-03-01 12:30:05.000000");
    }
}
