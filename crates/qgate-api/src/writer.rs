//! Row cursor → JSON array, optionally gzip-compressed.
//!
//! # Architecture
//!
//! ```text
//! RowCursor ─read()─▶ write_rows ─▶ BufWriter (streaming) or Vec (buffered)
//!                                    ─▶ [GzEncoder] ─▶ ChannelWriter ─mpsc─▶ HTTP body
//! ```
//!
//! Everything here is blocking and runs on the blocking pool next to the
//! backend cursor. The output is one JSON array with one object per row, keys
//! in cursor order. A canceled or failed write leaves the array unclosed.

use std::io::{self, BufWriter, Write};

use bytes::Bytes;
use flate2::Compression;
use flate2::write::GzEncoder;
use qgate_core::ResultMode;
use qgate_pool::RowCursor;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::WriteError;

/// Rows between progress log lines.
pub const PROGRESS_INTERVAL: u64 = 50_000;
/// Largest chunk handed to the response body.
pub const MAX_CHUNK: usize = 64 * 1024;

const STREAM_BUFFER: usize = 16 * 1024;
const PREVIEW_BYTES: usize = 256;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteSummary {
    pub rows: u64,
}

#[derive(Debug, Clone)]
pub struct ResultWriter {
    mode: ResultMode,
    gzip: bool,
    progress_interval: u64,
}

impl ResultWriter {
    pub fn new(mode: ResultMode, gzip: bool) -> Self {
        Self {
            mode,
            gzip,
            progress_interval: PROGRESS_INTERVAL,
        }
    }

    pub fn with_progress_interval(mut self, rows: u64) -> Self {
        self.progress_interval = rows.max(1);
        self
    }

    /// Serialize every row of `cursor` into `sink`.
    ///
    /// `cancel` is checked before each row. On success every layer is flushed
    /// and the gzip trailer written.
    pub fn write<W: Write>(
        &self,
        cursor: &mut dyn RowCursor,
        sink: W,
        cancel: &CancellationToken,
    ) -> Result<WriteSummary, WriteError> {
        if self.gzip {
            let mut encoder = GzEncoder::new(sink, Compression::default());
            let summary = self.write_body(cursor, &mut encoder, cancel)?;
            encoder.finish()?.flush()?;
            Ok(summary)
        } else {
            let mut sink = sink;
            let summary = self.write_body(cursor, &mut sink, cancel)?;
            sink.flush()?;
            Ok(summary)
        }
    }

    fn write_body<W: Write>(
        &self,
        cursor: &mut dyn RowCursor,
        out: &mut W,
        cancel: &CancellationToken,
    ) -> Result<WriteSummary, WriteError> {
        match self.mode {
            ResultMode::Streaming => {
                let mut buffered = BufWriter::with_capacity(STREAM_BUFFER, out);
                let summary = self.write_rows(cursor, &mut buffered, cancel)?;
                buffered.flush()?;
                Ok(summary)
            }
            ResultMode::Buffered => {
                let mut buffer = Vec::new();
                let summary = self.write_rows(cursor, &mut buffer, cancel)?;
                let preview = &buffer[..buffer.len().min(PREVIEW_BYTES)];
                debug!(
                    bytes = buffer.len(),
                    preview = %String::from_utf8_lossy(preview),
                    "buffered result ready"
                );
                out.write_all(&buffer)?;
                Ok(summary)
            }
        }
    }

    fn write_rows<W: Write>(
        &self,
        cursor: &mut dyn RowCursor,
        out: &mut W,
        cancel: &CancellationToken,
    ) -> Result<WriteSummary, WriteError> {
        out.write_all(b"[")?;
        let mut rows: u64 = 0;
        loop {
            if cancel.is_cancelled() {
                warn!(rows, "query canceled, result truncated");
                return Err(WriteError::Canceled);
            }
            if !cursor.read()? {
                break;
            }
            if rows > 0 {
                out.write_all(b",")?;
            }
            write_row(cursor, out)?;
            rows += 1;
            if rows % self.progress_interval == 0 {
                info!(rows, "rows written");
            }
        }
        out.write_all(b"]")?;
        Ok(WriteSummary { rows })
    }
}

fn write_row<W: Write>(cursor: &dyn RowCursor, out: &mut W) -> Result<(), WriteError> {
    out.write_all(b"{")?;
    for i in 0..cursor.field_count() {
        if i > 0 {
            out.write_all(b",")?;
        }
        serde_json::to_writer(&mut *out, cursor.name(i)).map_err(io::Error::from)?;
        out.write_all(b":")?;
        let value = cursor.value(i)?;
        serde_json::to_writer(&mut *out, &value).map_err(io::Error::from)?;
    }
    out.write_all(b"}")?;
    Ok(())
}

// ── ChannelWriter ────────────────────────────────────────────────────

/// Blocking [`Write`] that forwards bytes to an async response body.
///
/// Must only be used off the async runtime (e.g. inside `spawn_blocking`).
/// Writes fail with `BrokenPipe` once the body has been dropped, which is how
/// a client disconnect surfaces to the writer.
#[derive(Debug)]
pub struct ChannelWriter {
    tx: mpsc::Sender<Result<Bytes, io::Error>>,
}

impl ChannelWriter {
    pub fn new(tx: mpsc::Sender<Result<Bytes, io::Error>>) -> Self {
        Self { tx }
    }
}

impl Write for ChannelWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let n = buf.len().min(MAX_CHUNK);
        self.tx
            .blocking_send(Ok(Bytes::copy_from_slice(&buf[..n])))
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "response body dropped"))?;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
