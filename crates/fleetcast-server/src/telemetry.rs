//! JSON-lines telemetry writer.
//!
//! Appends one JSON object per position event to a file.

use async_trait::async_trait;
use fleetcast_core::{SinkError, TelemetryWriter};
use fleetcast_protocol::PositionEvent;
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncWriteExt, BufWriter};

/// Writes position events as newline-delimited JSON.
pub struct JsonLinesWriter {
    path: PathBuf,
    out: BufWriter<File>,
    line: Vec<u8>,
}

impl JsonLinesWriter {
    /// Open `path` for appending, creating it if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, SinkError> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;

        Ok(Self {
            path,
            out: BufWriter::new(file),
            line: Vec::with_capacity(256),
        })
    }

    /// The file being written.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl TelemetryWriter for JsonLinesWriter {
    async fn write(&mut self, event: &PositionEvent) -> Result<(), SinkError> {
        self.line.clear();
        serde_json::to_writer(&mut self.line, event)?;
        self.line.push(b'\n');
        self.out.write_all(&self.line).await?;
        Ok(())
    }

    async fn flush(&mut self) -> Result<(), SinkError> {
        self.out.flush().await?;
        Ok(())
    }
}
