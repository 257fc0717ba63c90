// src/recording/reader.rs
//! Trace decoding
//!
//! Version 1 traces are read footer first: the last 8 bytes locate the
//! dictionary, then the records between the header and the dictionary are
//! parsed. Version 2 traces are read front to back and every id must be
//! defined before a test marker uses it.

use crate::recording::codec::ByteReader;
use crate::recording::dictionary::NameId;
use crate::recording::encoder::{tags, TraceVersion, FOOTER_LEN, HEADER_LEN, MAGIC};
use crate::recording::recorder::{ClassTouch, TestIdentity, TestRecord};
use crate::utils::errors::{DiscoveryError, Result};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use tracing::debug;

/// A decoded trace
#[derive(Debug, Clone, Serialize)]
pub struct Trace {
    pub version: TraceVersion,
    pub names: BTreeMap<NameId, String>,
    pub records: Vec<TestRecord>,
}

/// One test with every id replaced by its name
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolvedTest {
    pub suite: String,
    pub test: String,
    pub classes: Vec<ResolvedClass>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolvedClass {
    pub class: String,
    pub methods: Vec<String>,
}

/// Flat `(suite, test, class, method)` fact
pub type Touch = (String, String, String, String);

impl Trace {
    /// Read and decode a trace file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let data = std::fs::read(path.as_ref()).map_err(|e| {
            DiscoveryError::MalformedTrace(format!(
                "Failed to read {:?}: {}",
                path.as_ref(),
                e
            ))
        })?;
        Self::parse(&data)
    }

    /// Decode a complete trace held in memory
    pub fn parse(data: &[u8]) -> Result<Self> {
        let mut header = ByteReader::new(data);
        let magic = header.read_u8()?;
        if magic != MAGIC {
            return Err(DiscoveryError::MalformedTrace(format!(
                "bad magic byte {:#04x}",
                magic
            )));
        }
        let version_byte = header.read_u8()?;
        let version = TraceVersion::from_byte(version_byte).ok_or_else(|| {
            DiscoveryError::MalformedTrace(format!("unknown trace version {}", version_byte))
        })?;

        let trace = match version {
            TraceVersion::DeferredFooter => Self::parse_deferred(data)?,
            TraceVersion::Incremental => Self::parse_incremental(data)?,
        };

        debug!(
            "Parsed {:?} trace: {} records, {} names",
            trace.version,
            trace.records.len(),
            trace.names.len()
        );
        Ok(trace)
    }

    fn parse_deferred(data: &[u8]) -> Result<Self> {
        if data.len() < HEADER_LEN + 2 + FOOTER_LEN {
            return Err(DiscoveryError::MalformedTrace(format!(
                "version 1 trace of {} bytes is too short",
                data.len()
            )));
        }

        let footer_start = data.len() - FOOTER_LEN;
        let body = ByteReader::at(data, footer_start)?.read_u64_be()?;
        let body = usize::try_from(body)
            .ok()
            .filter(|&offset| offset > HEADER_LEN && offset <= footer_start)
            .ok_or_else(|| {
                DiscoveryError::MalformedTrace(format!("footer offset {} out of range", body))
            })?;
        if data[body - 1] != tags::FULL_DICTIONARY {
            return Err(DiscoveryError::MalformedTrace(format!(
                "footer does not point at a dictionary (tag {:#04x})",
                data[body - 1]
            )));
        }

        let mut names = BTreeMap::new();
        let mut dict = ByteReader::at(&data[..footer_start], body)?;
        read_dictionary(&mut dict, &mut names)?;
        if !dict.is_empty() {
            return Err(DiscoveryError::MalformedTrace(format!(
                "{} stray bytes after the dictionary",
                dict.remaining()
            )));
        }

        let mut records = Vec::new();
        let mut reader = ByteReader::at(&data[..body - 1], HEADER_LEN)?;
        while !reader.is_empty() {
            let tag = reader.read_u8()?;
            if tag != tags::TEST_MARKER {
                return Err(unexpected_tag(tag, reader.position() - 1));
            }
            let record = read_test_marker(&mut reader)?;
            check_resolvable(&record, &names)?;
            records.push(record);
        }

        Ok(Self {
            version: TraceVersion::DeferredFooter,
            names,
            records,
        })
    }

    fn parse_incremental(data: &[u8]) -> Result<Self> {
        let mut names = BTreeMap::new();
        let mut records = Vec::new();
        let mut reader = ByteReader::at(data, HEADER_LEN)?;

        while !reader.is_empty() {
            let tag = reader.read_u8()?;
            match tag {
                tags::PARTIAL_DICTIONARY => read_dictionary(&mut reader, &mut names)?,
                tags::TEST_MARKER => {
                    let record = read_test_marker(&mut reader)?;
                    check_resolvable(&record, &names)?;
                    records.push(record);
                }
                other => return Err(unexpected_tag(other, reader.position() - 1)),
            }
        }

        Ok(Self {
            version: TraceVersion::Incremental,
            names,
            records,
        })
    }

    pub fn name(&self, id: NameId) -> Option<&str> {
        self.names.get(&id).map(String::as_str)
    }

    /// Records with names instead of ids
    pub fn resolve(&self) -> Vec<ResolvedTest> {
        self.records
            .iter()
            .map(|record| ResolvedTest {
                suite: self.display(record.identity.suite),
                test: self.display(record.identity.test),
                classes: record
                    .classes
                    .iter()
                    .map(|touch| ResolvedClass {
                        class: self.display(touch.class),
                        methods: touch.methods.iter().map(|&m| self.display(m)).collect(),
                    })
                    .collect(),
            })
            .collect()
    }

    /// Every `(suite, test, class, method)` touch in the trace
    pub fn touches(&self) -> BTreeSet<Touch> {
        self.resolve()
            .into_iter()
            .flat_map(|test| {
                let ResolvedTest {
                    suite,
                    test: name,
                    classes,
                } = test;
                classes.into_iter().flat_map(move |class| {
                    let suite = suite.clone();
                    let name = name.clone();
                    class.methods.into_iter().map(move |method| {
                        (suite.clone(), name.clone(), class.class.clone(), method)
                    })
                })
            })
            .collect()
    }

    fn display(&self, id: NameId) -> String {
        self.name(id).map_or_else(|| id.to_string(), str::to_string)
    }
}

fn read_id(reader: &mut ByteReader<'_>) -> Result<NameId> {
    let offset = reader.position();
    let raw = reader.read_compact()?;
    NameId::new(raw)
        .ok_or_else(|| DiscoveryError::MalformedTrace(format!("name id 0 at offset {}", offset)))
}

fn read_dictionary(reader: &mut ByteReader<'_>, names: &mut BTreeMap<NameId, String>) -> Result<()> {
    let count = reader.read_compact()?;
    for _ in 0..count {
        let id = read_id(reader)?;
        let name = reader.read_str()?;
        if let Some(previous) = names.insert(id, name.to_string()) {
            if previous != name {
                return Err(DiscoveryError::MalformedTrace(format!(
                    "id {} redefined from {:?} to {:?}",
                    id, previous, name
                )));
            }
        }
    }
    Ok(())
}

fn read_test_marker(reader: &mut ByteReader<'_>) -> Result<TestRecord> {
    let identity = TestIdentity {
        suite: read_id(reader)?,
        test: read_id(reader)?,
    };
    let class_count = reader.read_compact()? as usize;
    let mut classes = Vec::with_capacity(class_count.min(reader.remaining()));
    for _ in 0..class_count {
        let class = read_id(reader)?;
        let method_count = reader.read_compact()? as usize;
        let mut methods = Vec::with_capacity(method_count.min(reader.remaining()));
        for _ in 0..method_count {
            methods.push(read_id(reader)?);
        }
        classes.push(ClassTouch { class, methods });
    }
    Ok(TestRecord { identity, classes })
}

fn check_resolvable(record: &TestRecord, names: &BTreeMap<NameId, String>) -> Result<()> {
    let ids = [record.identity.suite, record.identity.test]
        .into_iter()
        .chain(record.classes.iter().flat_map(|c| {
            std::iter::once(c.class).chain(c.methods.iter().copied())
        }));
    for id in ids {
        if !names.contains_key(&id) {
            return Err(DiscoveryError::MalformedTrace(format!(
                "test marker references undefined id {}",
                id
            )));
        }
    }
    Ok(())
}

fn unexpected_tag(tag: u8, offset: usize) -> DiscoveryError {
    DiscoveryError::MalformedTrace(format!("unexpected tag {:#04x} at offset {}", tag, offset))
}
