// src/recording/mod.rs
//! Per-test coverage recording and the binary trace format
//!
//! - **Dictionary**: interns class and method names as small integer ids
//! - **Recorder**: turns a test's visited markers into a [`TestRecord`]
//! - **Encoder**: writes records as a trace, in one of two layouts
//! - **Reader**: parses a trace back into names and records
//! - **Codec**: the compact integer and string encoding both formats share
//!
//! # Trace layout
//!
//! ```text
//! [1][version]
//!   v1:  { TEST_MARKER record }* FULL_DICTIONARY dict  [u64 BE footer]
//!   v2:  { PARTIAL_DICTIONARY dict }? TEST_MARKER record  ...
//! ```
//!
//! The v1 footer points just past the FULL_DICTIONARY tag. v2 emits newly
//! enumerated names right before the record that uses them.

pub mod codec;
pub mod dictionary;
pub mod encoder;
pub mod reader;
pub mod recorder;

pub use dictionary::{DictionaryEntry, NameDictionary, NameId};
pub use encoder::{RecordEncoder, TraceVersion};
pub use reader::{ResolvedClass, ResolvedTest, Trace};
pub use recorder::{ClassTouch, TestCoverage, TestIdentity, TestRecord, TouchRecorder};
