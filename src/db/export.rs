// ========================================
// export.rs - Archival export of the capture log
// ========================================
// Matching entries, oldest first, one JSON object per line, gzip-compressed.

use std::io::Write;

use flate2::{Compression, write::GzEncoder};
use futures::TryStreamExt;
use tracing::info;

use crate::db::Database;
use crate::error::Result;
use crate::model::{CaptureFilter, Page};

const EXPORT_PAGE_SIZE: u32 = 500;

impl Database {
    /// Writes matching entries to `writer` as gzip-compressed JSON Lines and
    /// returns how many were written. `writer` receives a complete gzip
    /// member; it is not flushed or closed beyond that.
    pub async fn export_jsonl_gz<W: Write>(&self, filter: &CaptureFilter, writer: W) -> Result<u64> {
        let mut encoder = GzEncoder::new(writer, Compression::default());
        let mut entries = self.entries(filter.clone(), Page::oldest_first(EXPORT_PAGE_SIZE));
        let mut written: u64 = 0;

        while let Some(entry) = entries.try_next().await? {
            serde_json::to_writer(&mut encoder, &entry)?;
            encoder.write_all(b"\n")?;
            written += 1;
        }

        encoder.finish()?;

        info!(entries = written, table = ?filter.table_name, "exported capture log");
        Ok(written)
    }
}
