// src/recording/encoder.rs
//! Binary trace framing
//!
//! Two framings share one header (`[MAGIC][version]`) and one record layout:
//!
//! ```text
//! TestMarker        = 2  suite test class_count { class method_count { method } }
//! FullDictionary    = 3  count { id name }          (version 1 only)
//! PartialDictionary = 4  count { id name }          (version 2 only)
//! ```
//!
//! **Version 1 (deferred footer)** appends test markers as tests finish and
//! writes the whole dictionary once at the end, followed by an 8-byte
//! big-endian offset of the dictionary body (the byte right after its tag).
//! Readers start from the footer.
//!
//! **Version 2 (incremental)** writes a partial dictionary holding only the
//! new names right before the first marker that uses them, so the stream can
//! be read front to back.

use crate::recording::codec::{write_compact, write_len, write_str};
use crate::recording::dictionary::{DictionaryEntry, NameDictionary};
use crate::recording::recorder::TestRecord;
use crate::transport::Sink;
use crate::utils::errors::{DiscoveryError, Result};
use serde::Serialize;
use tracing::{debug, warn};

/// First byte of every trace
pub const MAGIC: u8 = 0x01;

/// Length of the `[MAGIC][version]` header
pub const HEADER_LEN: usize = 2;

/// Length of the version 1 footer
pub const FOOTER_LEN: usize = 8;

/// Record tags
pub mod tags {
    pub const TEST_MARKER: u8 = 0x02;
    pub const FULL_DICTIONARY: u8 = 0x03;
    pub const PARTIAL_DICTIONARY: u8 = 0x04;
}

/// Trace framing variant, carried in the header's second byte
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TraceVersion {
    /// Dictionary written once at session end, located via a footer
    DeferredFooter,

    /// Dictionary deltas written ahead of the records that need them
    Incremental,
}

impl TraceVersion {
    pub fn as_byte(self) -> u8 {
        match self {
            TraceVersion::DeferredFooter => 1,
            TraceVersion::Incremental => 2,
        }
    }

    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            1 => Some(TraceVersion::DeferredFooter),
            2 => Some(TraceVersion::Incremental),
            _ => None,
        }
    }

    /// Whether this framing needs a seekable destination
    pub fn requires_seek(self) -> bool {
        matches!(self, TraceVersion::DeferredFooter)
    }
}

/// Serializes test records and dictionary blocks onto a [`Sink`]
#[derive(Debug)]
pub struct RecordEncoder {
    version: TraceVersion,
    scratch: Vec<u8>,
    started: bool,
    finished: bool,
    records_written: u64,
}

impl RecordEncoder {
    pub fn new(version: TraceVersion) -> Self {
        Self {
            version,
            scratch: Vec::with_capacity(256),
            started: false,
            finished: false,
            records_written: 0,
        }
    }

    /// Encoder for `sink`, falling back to the incremental framing when the
    /// requested one needs a seekable destination the sink cannot offer
    pub fn for_sink<S: Sink + ?Sized>(requested: TraceVersion, sink: &S) -> Self {
        if requested.requires_seek() && !sink.is_seekable() {
            warn!(
                "Sink is not seekable, using {:?} framing instead of {:?}",
                TraceVersion::Incremental,
                requested
            );
            return Self::new(TraceVersion::Incremental);
        }
        Self::new(requested)
    }

    pub fn version(&self) -> TraceVersion {
        self.version
    }

    pub fn records_written(&self) -> u64 {
        self.records_written
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Write the header; called once before anything else
    pub fn start<S: Sink + ?Sized>(&mut self, sink: &mut S) -> Result<()> {
        if self.started {
            return Ok(());
        }
        sink.write_all(&[MAGIC, self.version.as_byte()])?;
        self.started = true;
        debug!("Started {:?} trace", self.version);
        Ok(())
    }

    /// Append one finished test, preceded by a partial dictionary when the
    /// framing is incremental and new names exist
    pub fn encode_test<S: Sink + ?Sized>(
        &mut self,
        record: &TestRecord,
        dictionary: &mut NameDictionary,
        sink: &mut S,
    ) -> Result<()> {
        self.ensure_open(sink)?;

        self.scratch.clear();
        let watermark = dictionary.len();
        if self.version == TraceVersion::Incremental && dictionary.has_pending() {
            Self::put_dictionary(
                &mut self.scratch,
                tags::PARTIAL_DICTIONARY,
                dictionary.peek_pending(),
            )?;
        }
        Self::put_test_marker(&mut self.scratch, record)?;

        // Definitions stay pending until they have actually been written
        sink.write_all(&self.scratch)?;
        if self.version == TraceVersion::Incremental {
            dictionary.commit_flushed(watermark);
        }
        self.records_written += 1;
        Ok(())
    }

    /// Finalize the trace and close the sink. Further calls are no-ops.
    pub fn finish<S: Sink + ?Sized>(
        &mut self,
        dictionary: &mut NameDictionary,
        sink: &mut S,
    ) -> Result<()> {
        if self.finished {
            return Ok(());
        }
        self.start(sink)?;

        self.scratch.clear();
        let watermark = dictionary.len();
        match self.version {
            TraceVersion::DeferredFooter => {
                let body_offset = sink.position() + 1;
                // Newest entries first
                Self::put_dictionary(
                    &mut self.scratch,
                    tags::FULL_DICTIONARY,
                    dictionary.entries().rev(),
                )?;
                self.scratch.extend_from_slice(&body_offset.to_be_bytes());
            }
            TraceVersion::Incremental => {
                if dictionary.has_pending() {
                    Self::put_dictionary(
                        &mut self.scratch,
                        tags::PARTIAL_DICTIONARY,
                        dictionary.peek_pending(),
                    )?;
                }
            }
        }

        if !self.scratch.is_empty() {
            sink.write_all(&self.scratch)?;
        }
        // A full table covers everything that was pending too
        dictionary.commit_flushed(watermark);
        self.finished = true;
        sink.close()?;

        debug!(
            "Finished {:?} trace: {} records, {} names",
            self.version,
            self.records_written,
            dictionary.len()
        );
        Ok(())
    }

    fn ensure_open<S: Sink + ?Sized>(&mut self, sink: &mut S) -> Result<()> {
        if self.finished {
            return Err(DiscoveryError::SessionClosed);
        }
        self.start(sink)
    }

    fn put_test_marker(out: &mut Vec<u8>, record: &TestRecord) -> Result<()> {
        out.push(tags::TEST_MARKER);
        write_compact(out, record.identity.suite.get());
        write_compact(out, record.identity.test.get());
        write_len(out, record.classes.len())?;
        for touch in &record.classes {
            write_compact(out, touch.class.get());
            write_len(out, touch.methods.len())?;
            for method in &touch.methods {
                write_compact(out, method.get());
            }
        }
        Ok(())
    }

    fn put_dictionary<'a, I>(out: &mut Vec<u8>, tag: u8, entries: I) -> Result<()>
    where
        I: ExactSizeIterator<Item = DictionaryEntry<'a>>,
    {
        out.push(tag);
        write_len(out, entries.len())?;
        for entry in entries {
            write_compact(out, entry.id.get());
            write_str(out, entry.name)?;
        }
        Ok(())
    }
}
