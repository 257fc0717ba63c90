// src/transport/wire.rs
//! Live socket protocol
//!
//! One-directional, no acknowledgements. Each message is a kind byte followed
//! by its payload; names travel inline rather than through a dictionary.
//!
//! ```text
//! START(0)          version
//! TEST_FINISHED(2)  test_name class_count { class_name method_count { method_name } }
//! FINISHED(1)
//! ```

use crate::recording::codec::{write_len, write_str, ByteReader};
use crate::recording::dictionary::NameDictionary;
use crate::recording::recorder::TestRecord;
use crate::utils::errors::{DiscoveryError, Result};
use bytes::Bytes;
use serde::Serialize;

/// Protocol version sent in the START message
pub const WIRE_VERSION: u8 = 1;

pub mod kinds {
    pub const START: u8 = 0;
    pub const FINISHED: u8 = 1;
    pub const TEST_FINISHED: u8 = 2;
}

/// Handshake written right after connecting
pub const START_PREAMBLE: [u8; 2] = [kinds::START, WIRE_VERSION];

/// Decoded protocol message
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WireMessage {
    Start {
        version: u8,
    },
    TestFinished {
        test: String,
        classes: Vec<(String, Vec<String>)>,
    },
    Finished,
}

impl WireMessage {
    /// Encode this message
    pub fn to_bytes(&self) -> Result<Bytes> {
        let mut out = Vec::new();
        match self {
            WireMessage::Start { version } => out.extend_from_slice(&[kinds::START, *version]),
            WireMessage::TestFinished { test, classes } => {
                out.push(kinds::TEST_FINISHED);
                write_str(&mut out, test)?;
                write_len(&mut out, classes.len())?;
                for (class, methods) in classes {
                    write_str(&mut out, class)?;
                    write_len(&mut out, methods.len())?;
                    for method in methods {
                        write_str(&mut out, method)?;
                    }
                }
            }
            WireMessage::Finished => out.push(kinds::FINISHED),
        }
        Ok(Bytes::from(out))
    }

    /// Decode every message in a received stream
    pub fn decode_all(data: &[u8]) -> Result<Vec<WireMessage>> {
        let mut reader = ByteReader::new(data);
        let mut messages = Vec::new();

        while !reader.is_empty() {
            let kind = reader.read_u8()?;
            let message = match kind {
                kinds::START => WireMessage::Start {
                    version: reader.read_u8()?,
                },
                kinds::FINISHED => WireMessage::Finished,
                kinds::TEST_FINISHED => {
                    let test = reader.read_str()?.to_string();
                    let class_count = reader.read_compact()?;
                    let mut classes = Vec::new();
                    for _ in 0..class_count {
                        let class = reader.read_str()?.to_string();
                        let method_count = reader.read_compact()?;
                        let mut methods = Vec::new();
                        for _ in 0..method_count {
                            methods.push(reader.read_str()?.to_string());
                        }
                        classes.push((class, methods));
                    }
                    WireMessage::TestFinished { test, classes }
                }
                other => {
                    return Err(DiscoveryError::MalformedTrace(format!(
                        "unknown message kind {} at offset {}",
                        other,
                        reader.position() - 1
                    )))
                }
            };
            messages.push(message);
        }

        Ok(messages)
    }
}

/// Encode a TEST_FINISHED message for `record` straight from the dictionary,
/// without building owned strings
pub fn put_test_finished(
    out: &mut Vec<u8>,
    test_name: &str,
    record: &TestRecord,
    dictionary: &NameDictionary,
) -> Result<()> {
    let resolve = |id| {
        dictionary.name(id).ok_or_else(|| {
            DiscoveryError::ContractViolation(format!("id {} was never enumerated", id))
        })
    };

    out.push(kinds::TEST_FINISHED);
    write_str(out, test_name)?;
    write_len(out, record.classes.len())?;
    for touch in &record.classes {
        write_str(out, resolve(touch.class)?)?;
        write_len(out, touch.methods.len())?;
        for &method in &touch.methods {
            write_str(out, resolve(method)?)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recording::recorder::{TestCoverage, TouchRecorder};

    #[test]
    fn test_fixed_messages() {
        assert_eq!(
            WireMessage::Start { version: WIRE_VERSION }.to_bytes().unwrap(),
            Bytes::from_static(&START_PREAMBLE)
        );
        assert_eq!(
            WireMessage::Finished.to_bytes().unwrap(),
            Bytes::from_static(&[kinds::FINISHED])
        );
    }

    #[test]
    fn test_test_finished_layout() {
        let message = WireMessage::TestFinished {
            test: "T.t".to_string(),
            classes: vec![("A".to_string(), vec!["m".to_string(), "n".to_string()])],
        };
        let bytes = message.to_bytes().unwrap();
        assert_eq!(
            &bytes[..],
            &[2, 3, b'T', b'.', b't', 1, 1, b'A', 2, 1, b'm', 1, b'n']
        );
        assert_eq!(WireMessage::decode_all(&bytes).unwrap(), vec![message]);
    }

    #[test]
    fn test_put_test_finished_matches_owned_encoding() {
        let mut recorder = TouchRecorder::new();
        let class = recorder.enumerate("com.example.Foo").unwrap();
        let coverage = TestCoverage::new().with_class(class, vec![false, true], ["a", "b"]);
        let record = recorder.record("FooTest", "testB", &coverage).unwrap();

        let mut out = Vec::new();
        put_test_finished(&mut out, "FooTest.testB", &record, recorder.dictionary()).unwrap();

        let expected = WireMessage::TestFinished {
            test: "FooTest.testB".to_string(),
            classes: vec![("com.example.Foo".to_string(), vec!["b".to_string()])],
        };
        assert_eq!(out, expected.to_bytes().unwrap().to_vec());
    }

    #[test]
    fn test_unknown_class_id_is_contract_violation() {
        let mut recorder = TouchRecorder::new();
        let record = {
            let mut other = TouchRecorder::new();
            let class = other.enumerate("Elsewhere").unwrap();
            let class = crate::recording::dictionary::NameId::new(class.get() + 10).unwrap();
            let coverage = TestCoverage::new().with_class(class, vec![true], ["m"]);
            other.record("S", "t", &coverage).unwrap()
        };
        recorder.enumerate("S").unwrap();

        let mut out = Vec::new();
        assert!(matches!(
            put_test_finished(&mut out, "S.t", &record, recorder.dictionary()),
            Err(DiscoveryError::ContractViolation(_))
        ));
    }

    #[test]
    fn test_decode_stream() {
        let mut stream = START_PREAMBLE.to_vec();
        stream.extend_from_slice(
            &WireMessage::TestFinished {
                test: "S.t".to_string(),
                classes: vec![],
            }
            .to_bytes()
            .unwrap(),
        );
        stream.push(kinds::FINISHED);

        let messages = WireMessage::decode_all(&stream).unwrap();
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[0], WireMessage::Start { version: 1 });
        assert_eq!(messages[2], WireMessage::Finished);

        assert!(WireMessage::decode_all(&[9]).is_err());
    }
}
