// src/listener.rs
//! Test-completion listeners
//!
//! The instrumentation layer talks to one [`DiscoveryListener`]: it interns
//! class names up front, reports every finished test, and finishes the
//! session once. Two implementations exist:
//!
//! - [`TraceFileListener`]: binary trace (deferred footer or incremental)
//!   written synchronously through any [`Sink`]
//! - [`SocketListener`]: live protocol streamed to a listener over
//!   [`SocketSink`]

use crate::recording::dictionary::NameId;
use crate::recording::encoder::{RecordEncoder, TraceVersion};
use crate::recording::recorder::{TestCoverage, TouchRecorder};
use crate::transport::file_sink::FileSink;
use crate::transport::socket_sink::SocketSink;
use crate::transport::wire::put_test_finished;
use crate::transport::Sink;
use crate::utils::config::DiscoveryConfig;
use crate::utils::errors::{DiscoveryError, Result};
use bytes::Bytes;
use tracing::{info, warn};

/// Receiver of per-test coverage from the instrumentation layer
pub trait DiscoveryListener: Send {
    /// Intern a class (or any other) name, returning its stable id
    fn enumerate(&mut self, name: &str) -> Result<NameId>;

    /// Record a finished test. Nothing is written for a test whose input is
    /// rejected.
    fn test_finished(&mut self, suite: &str, test: &str, coverage: &TestCoverage) -> Result<()>;

    /// Finish the session; no data follows
    fn tests_finished(&mut self) -> Result<()>;
}

/// Writes the binary trace through a [`Sink`]
pub struct TraceFileListener<S: Sink> {
    recorder: TouchRecorder,
    encoder: RecordEncoder,
    sink: S,
}

impl<S: Sink> TraceFileListener<S> {
    /// Start a trace on `sink`, writing the header immediately. A deferred
    /// footer request on a non-seekable sink is downgraded to incremental.
    pub fn new(mut sink: S, version: TraceVersion) -> Result<Self> {
        let mut encoder = RecordEncoder::for_sink(version, &sink);
        encoder.start(&mut sink)?;
        Ok(Self {
            recorder: TouchRecorder::new(),
            encoder,
            sink,
        })
    }

    pub fn version(&self) -> TraceVersion {
        self.encoder.version()
    }

    pub fn recorder(&self) -> &TouchRecorder {
        &self.recorder
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn into_sink(self) -> S {
        self.sink
    }
}

impl<S: Sink + Send> DiscoveryListener for TraceFileListener<S> {
    fn enumerate(&mut self, name: &str) -> Result<NameId> {
        self.recorder.enumerate(name)
    }

    fn test_finished(&mut self, suite: &str, test: &str, coverage: &TestCoverage) -> Result<()> {
        let record = self.recorder.record(suite, test, coverage)?;
        self.encoder
            .encode_test(&record, self.recorder.dictionary_mut(), &mut self.sink)
    }

    fn tests_finished(&mut self) -> Result<()> {
        self.encoder
            .finish(self.recorder.dictionary_mut(), &mut self.sink)
    }
}

/// Streams TEST_FINISHED messages over a [`SocketSink`]
pub struct SocketListener {
    recorder: TouchRecorder,
    sink: SocketSink,
    tests_sent: u64,
    tests_failed: u64,
}

impl SocketListener {
    pub fn new(sink: SocketSink) -> Self {
        Self {
            recorder: TouchRecorder::new(),
            sink,
            tests_sent: 0,
            tests_failed: 0,
        }
    }

    pub fn sink(&self) -> &SocketSink {
        &self.sink
    }

    pub fn tests_sent(&self) -> u64 {
        self.tests_sent
    }

    /// Tests whose message could not be encoded or enqueued
    pub fn tests_failed(&self) -> u64 {
        self.tests_failed
    }

    fn encode_and_send(&mut self, suite: &str, test: &str, coverage: &TestCoverage) -> Result<()> {
        let record = self.recorder.record(suite, test, coverage)?;

        // The whole message is built before anything reaches the queue
        let mut message = Vec::new();
        let test_name = format!("{}.{}", suite, test);
        put_test_finished(&mut message, &test_name, &record, self.recorder.dictionary())?;
        self.sink.send(Bytes::from(message))
    }
}

impl DiscoveryListener for SocketListener {
    fn enumerate(&mut self, name: &str) -> Result<NameId> {
        self.recorder.enumerate(name)
    }

    fn test_finished(&mut self, suite: &str, test: &str, coverage: &TestCoverage) -> Result<()> {
        match self.encode_and_send(suite, test, coverage) {
            Ok(()) => {
                self.tests_sent += 1;
                Ok(())
            }
            Err(e) => {
                self.tests_failed += 1;
                warn!("Dropping discovery data for {}.{}: {}", suite, test, e);
                Err(e)
            }
        }
    }

    fn tests_finished(&mut self) -> Result<()> {
        info!(
            "Finishing socket session: {} tests sent, {} failed",
            self.tests_sent, self.tests_failed
        );
        self.sink.shutdown()
    }
}

/// Build the listener the configuration asks for: a trace file when
/// `trace.path` is set, otherwise the socket transport
pub fn from_config(config: &DiscoveryConfig) -> Result<Box<dyn DiscoveryListener>> {
    config.validate()?;

    if let Some(path) = &config.trace.path {
        let version = config.trace.trace_version()?;
        info!("Writing discovery trace to {:?} ({:?})", path, version);
        let sink = FileSink::create(path)?;
        return Ok(Box::new(TraceFileListener::new(sink, version)?));
    }

    if config.socket.port.is_some() {
        let sink = SocketSink::connect(&config.socket)?;
        return Ok(Box::new(SocketListener::new(sink)));
    }

    Err(DiscoveryError::ConfigError(
        "neither trace.path nor socket.port is configured".to_string(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recording::reader::Trace;
    use crate::transport::wire::WireMessage;
    use crate::utils::config::{SocketConfig, TraceConfig};
    use std::io::{Cursor, Read};
    use std::net::TcpListener;
    use std::thread;

    fn run_session(listener: &mut dyn DiscoveryListener) {
        let foo = listener.enumerate("com.example.Foo").unwrap();
        let bar = listener.enumerate("com.example.Bar").unwrap();

        let first = TestCoverage::new()
            .with_class(foo, vec![true, false], ["run", "stop"])
            .with_class(bar, vec![false], ["idle"]);
        listener.test_finished("FooTest", "testRun", &first).unwrap();

        let second = TestCoverage::new()
            .with_class(foo, vec![false, true], ["run", "stop"])
            .with_class(bar, vec![true], ["idle"]);
        listener.test_finished("FooTest", "testStop", &second).unwrap();

        listener.tests_finished().unwrap();
    }

    fn expected_touches() -> Vec<(&'static str, &'static str, &'static str, &'static str)> {
        vec![
            ("FooTest", "testRun", "com.example.Foo", "run"),
            ("FooTest", "testStop", "com.example.Bar", "idle"),
            ("FooTest", "testStop", "com.example.Foo", "stop"),
        ]
    }

    #[test]
    fn test_trace_file_listener_both_versions() {
        for version in [TraceVersion::DeferredFooter, TraceVersion::Incremental] {
            let sink = FileSink::new(Cursor::new(Vec::new())).unwrap();
            let mut listener = TraceFileListener::new(sink, version).unwrap();
            run_session(&mut listener);

            let bytes = listener.into_sink().into_inner().unwrap().into_inner();
            let trace = Trace::parse(&bytes).unwrap();
            assert_eq!(trace.version, version);

            let touches: Vec<_> = trace.touches().into_iter().collect();
            let expected: Vec<_> = expected_touches()
                .into_iter()
                .map(|(s, t, c, m)| (s.to_string(), t.to_string(), c.to_string(), m.to_string()))
                .collect();
            assert_eq!(touches, expected);
        }
    }

    #[test]
    fn test_rejected_test_writes_nothing() {
        let sink = FileSink::new(Cursor::new(Vec::new())).unwrap();
        let mut listener = TraceFileListener::new(sink, TraceVersion::Incremental).unwrap();
        let class = listener.enumerate("A").unwrap();

        let mut broken = TestCoverage::new();
        broken.set_markers(class, vec![true, true]);
        broken.set_method_names(class, vec!["only".to_string()]);
        let before = listener.sink().position();
        assert!(matches!(
            listener.test_finished("S", "t", &broken),
            Err(DiscoveryError::ContractViolation(_))
        ));
        assert_eq!(listener.sink().position(), before);

        let fine = TestCoverage::new().with_class(class, vec![true], ["m"]);
        listener.test_finished("S", "u", &fine).unwrap();
        listener.tests_finished().unwrap();

        let bytes = listener.into_sink().into_inner().unwrap().into_inner();
        let trace = Trace::parse(&bytes).unwrap();
        assert_eq!(trace.records.len(), 1);
    }

    #[test]
    fn test_streaming_sink_gets_incremental_trace() {
        let listener = TraceFileListener::new(FileSink::streaming(Vec::new()), TraceVersion::DeferredFooter)
            .unwrap();
        assert_eq!(listener.version(), TraceVersion::Incremental);
    }

    #[test]
    fn test_socket_listener_streams_messages() {
        let server = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = server.local_addr().unwrap().port();
        let reader = thread::spawn(move || {
            let (mut stream, _) = server.accept().unwrap();
            let mut received = Vec::new();
            stream.read_to_end(&mut received).unwrap();
            received
        });

        let sink = SocketSink::connect(&SocketConfig::new("127.0.0.1", port)).unwrap();
        let mut listener = SocketListener::new(sink);
        run_session(&mut listener);
        assert_eq!(listener.tests_sent(), 2);
        assert_eq!(listener.tests_failed(), 0);

        let messages = WireMessage::decode_all(&reader.join().unwrap()).unwrap();
        assert_eq!(
            messages,
            vec![
                WireMessage::Start { version: 1 },
                WireMessage::TestFinished {
                    test: "FooTest.testRun".to_string(),
                    classes: vec![("com.example.Foo".to_string(), vec!["run".to_string()])],
                },
                WireMessage::TestFinished {
                    test: "FooTest.testStop".to_string(),
                    classes: vec![
                        ("com.example.Foo".to_string(), vec!["stop".to_string()]),
                        ("com.example.Bar".to_string(), vec!["idle".to_string()]),
                    ],
                },
                WireMessage::Finished,
            ]
        );
    }

    #[test]
    fn test_socket_listener_skips_rejected_test() {
        let server = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = server.local_addr().unwrap().port();
        let reader = thread::spawn(move || {
            let (mut stream, _) = server.accept().unwrap();
            let mut received = Vec::new();
            stream.read_to_end(&mut received).unwrap();
            received
        });

        let sink = SocketSink::connect(&SocketConfig::new("127.0.0.1", port)).unwrap();
        let mut listener = SocketListener::new(sink);
        let class = listener.enumerate("com.example.Foo").unwrap();

        let mut broken = TestCoverage::new();
        broken.set_markers(class, vec![true, true]);
        broken.set_method_names(class, vec!["only".to_string()]);
        assert!(matches!(
            listener.test_finished("FooTest", "broken", &broken),
            Err(DiscoveryError::ContractViolation(_))
        ));

        let fine = TestCoverage::new().with_class(class, vec![true], ["run"]);
        listener.test_finished("FooTest", "fine", &fine).unwrap();
        listener.tests_finished().unwrap();
        assert_eq!(listener.tests_failed(), 1);
        assert_eq!(listener.tests_sent(), 1);

        let messages = WireMessage::decode_all(&reader.join().unwrap()).unwrap();
        assert_eq!(
            messages,
            vec![
                WireMessage::Start { version: 1 },
                WireMessage::TestFinished {
                    test: "FooTest.fine".to_string(),
                    classes: vec![("com.example.Foo".to_string(), vec!["run".to_string()])],
                },
                WireMessage::Finished,
            ]
        );
    }

    #[test]
    fn test_from_config_prefers_trace_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.tr");
        let config = DiscoveryConfig {
            trace: TraceConfig {
                path: Some(path.clone()),
                version: 2,
            },
            socket: SocketConfig::default(),
        };

        let mut listener = from_config(&config).unwrap();
        run_session(listener.as_mut());
        drop(listener);

        let trace = Trace::from_file(&path).unwrap();
        assert_eq!(trace.version, TraceVersion::Incremental);
        assert_eq!(trace.records.len(), 2);
    }

    #[test]
    fn test_from_config_requires_a_destination() {
        assert!(matches!(
            from_config(&DiscoveryConfig::default()),
            Err(DiscoveryError::ConfigError(_))
        ));
    }
}
