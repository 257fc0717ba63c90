// src/lib.rs
//! Test Discovery Data Collection Library
//!
//! Records which classes and methods each executed test touched and delivers
//! that record stream to a trace file or a live socket listener without
//! holding up the instrumented program.
//!
//! # Architecture
//!
//! - **recording**: name dictionary, per-test touch records, trace framing
//!   and the trace reader
//! - **transport**: file and socket sinks, bounded buffer queue, wire protocol
//! - **listener**: the per-test entry points tying recording to a sink
//! - **merge**: additive merge of branch hit counters
//! - **observability**: tracing setup
//! - **utils**: configuration and errors
//!
//! ```text
//! enumerate(name) ─→ NameDictionary
//! test_finished() ─→ TouchRecorder ─→ RecordEncoder ─→ FileSink   ─→ trace file
//!                                  └─→ wire message  ─→ SocketSink ─→ listener
//! ```

pub mod listener;
pub mod merge;
pub mod observability;
pub mod recording;
pub mod transport;
pub mod utils;

// Re-export commonly used types
pub use listener::{DiscoveryListener, SocketListener, TraceFileListener};
pub use merge::{CounterVector, JumpCounter, BranchCounters};
pub use recording::{NameDictionary, NameId, TestCoverage, Trace, TraceVersion, TouchRecorder};
pub use transport::{FileSink, Sink, SocketSink};
pub use utils::config::DiscoveryConfig;
pub use utils::errors::{DiscoveryError, Result};

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }

    #[test]
    fn test_end_to_end_trace() {
        let sink = FileSink::new(Cursor::new(Vec::new())).unwrap();
        let mut listener = TraceFileListener::new(sink, TraceVersion::DeferredFooter).unwrap();

        let class = listener.enumerate("org.example.Service").unwrap();
        let coverage = TestCoverage::new().with_class(class, vec![true, true], ["start", "stop"]);
        listener.test_finished("ServiceTest", "lifecycle", &coverage).unwrap();
        listener.tests_finished().unwrap();

        let bytes = listener.into_sink().into_inner().unwrap().into_inner();
        let resolved = Trace::parse(&bytes).unwrap().resolve();
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0].suite, "ServiceTest");
        assert_eq!(resolved[0].classes[0].methods, vec!["start", "stop"]);
    }
}
