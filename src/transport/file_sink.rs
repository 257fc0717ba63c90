// src/transport/file_sink.rs
//! Synchronous file sink
//!
//! Writes in the caller's thread and keeps track of the absolute stream
//! position so the deferred-footer framing can point back at its dictionary.

use crate::transport::Sink;
use crate::utils::errors::{DiscoveryError, Result};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Seek, Write};
use std::path::Path;
use tracing::{debug, warn};

/// Sink over any `Write`, seekable when built from a `Write + Seek` stream
pub struct FileSink<W: Write> {
    writer: Option<W>,
    position: u64,
    seekable: bool,
}

impl FileSink<BufWriter<File>> {
    /// Create (or truncate) a trace file at `path`
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path.as_ref())
            .map_err(|e| DiscoveryError::WriteFailed(format!("Failed to open file: {}", e)))?;

        debug!("Opened trace file {:?}", path.as_ref());

        Self::new(BufWriter::new(file))
    }
}

impl<W: Write + Seek> FileSink<W> {
    /// Seekable sink starting at the stream's current position
    pub fn new(mut writer: W) -> Result<Self> {
        let position = writer.stream_position().map_err(|e| {
            DiscoveryError::WriteFailed(format!("Failed to query stream position: {}", e))
        })?;

        Ok(Self {
            writer: Some(writer),
            position,
            seekable: true,
        })
    }
}

impl<W: Write> FileSink<W> {
    /// Forward-only sink (pipes, stdout); positions count from zero
    pub fn streaming(writer: W) -> Self {
        Self {
            writer: Some(writer),
            position: 0,
            seekable: false,
        }
    }

    /// Underlying writer, once the sink has been closed
    pub fn into_inner(mut self) -> Option<W> {
        self.writer.take()
    }

    /// Borrow the underlying writer
    pub fn get_ref(&self) -> Option<&W> {
        self.writer.as_ref()
    }

    fn writer_mut(&mut self) -> Result<&mut W> {
        self.writer.as_mut().ok_or(DiscoveryError::SessionClosed)
    }
}

impl<W: Write> Sink for FileSink<W> {
    fn write_all(&mut self, data: &[u8]) -> Result<()> {
        self.writer_mut()?
            .write_all(data)
            .map_err(|e| DiscoveryError::WriteFailed(format!("Failed to write trace: {}", e)))?;
        self.position += data.len() as u64;
        Ok(())
    }

    fn position(&self) -> u64 {
        self.position
    }

    fn is_seekable(&self) -> bool {
        self.seekable
    }

    fn close(&mut self) -> Result<()> {
        let Some(writer) = self.writer.as_mut() else {
            return Ok(());
        };
        writer
            .flush()
            .map_err(|e| DiscoveryError::WriteFailed(format!("Failed to flush trace: {}", e)))?;
        debug!("Closed file sink at position {}", self.position);
        Ok(())
    }
}

impl<W: Write> Drop for FileSink<W> {
    fn drop(&mut self) {
        if let Some(writer) = self.writer.as_mut() {
            if let Err(e) = writer.flush() {
                warn!("Failed to flush file sink on drop: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Cursor, Read};
    use tempfile::NamedTempFile;

    #[test]
    fn test_in_memory_sink_tracks_position() {
        let mut sink = FileSink::new(Cursor::new(Vec::new())).unwrap();
        assert!(sink.is_seekable());

        sink.write_all(b"Hello").unwrap();
        sink.write_all(b", World").unwrap();
        assert_eq!(sink.position(), 12);

        let bytes = sink.into_inner().unwrap().into_inner();
        assert_eq!(bytes, b"Hello, World");
    }

    #[test]
    fn test_position_starts_at_stream_offset() {
        let mut cursor = Cursor::new(vec![0u8; 4]);
        cursor.set_position(4);
        let mut sink = FileSink::new(cursor).unwrap();
        assert_eq!(sink.position(), 4);
        sink.write_all(&[1, 2]).unwrap();
        assert_eq!(sink.position(), 6);
    }

    #[test]
    fn test_streaming_sink_is_not_seekable() {
        let mut sink = FileSink::streaming(Vec::new());
        assert!(!sink.is_seekable());
        sink.write_all(&[1, 2, 3]).unwrap();
        assert_eq!(sink.position(), 3);
        assert_eq!(sink.get_ref().unwrap(), &vec![1, 2, 3]);
    }

    #[test]
    fn test_create_writes_file() {
        let file = NamedTempFile::new().unwrap();
        let mut sink = FileSink::create(file.path()).unwrap();
        sink.write_all(b"trace data").unwrap();
        sink.close().unwrap();

        let mut contents = Vec::new();
        File::open(file.path())
            .unwrap()
            .read_to_end(&mut contents)
            .unwrap();
        assert_eq!(contents, b"trace data");
    }
}
