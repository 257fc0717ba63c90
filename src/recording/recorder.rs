// src/recording/recorder.rs
//! Per-test touch recording
//!
//! The instrumentation layer reports, for a finished test, one marker array
//! per class (indexed by method ordinal) plus the method names for those
//! ordinals. The recorder turns that into a [`TestRecord`] of interned ids,
//! keeping only classes that had at least one visited method.

use crate::recording::dictionary::{NameDictionary, NameId};
use crate::utils::errors::{DiscoveryError, Result};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use tracing::trace;

/// One test invocation: suite (or class) and test method
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct TestIdentity {
    pub suite: NameId,
    pub test: NameId,
}

/// Methods of one class visited by a test, in ordinal order
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClassTouch {
    pub class: NameId,
    pub methods: Vec<NameId>,
}

/// Everything one test touched
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TestRecord {
    pub identity: TestIdentity,
    pub classes: Vec<ClassTouch>,
}

impl TestRecord {
    /// Total visited methods across all classes
    pub fn method_count(&self) -> usize {
        self.classes.iter().map(|c| c.methods.len()).sum()
    }
}

/// Raw marker state handed over by the instrumentation when a test completes
#[derive(Debug, Clone, Default)]
pub struct TestCoverage {
    /// class id -> visited marker per method ordinal
    visited: BTreeMap<NameId, Vec<bool>>,

    /// class id -> method name per ordinal
    method_names: HashMap<NameId, Vec<String>>,
}

impl TestCoverage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a class with its markers and method names in one go
    pub fn with_class<I, S>(mut self, class: NameId, markers: Vec<bool>, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.method_names
            .insert(class, names.into_iter().map(Into::into).collect());
        self.visited.insert(class, markers);
        self
    }

    pub fn set_markers(&mut self, class: NameId, markers: Vec<bool>) {
        self.visited.insert(class, markers);
    }

    pub fn set_method_names(&mut self, class: NameId, names: Vec<String>) {
        self.method_names.insert(class, names);
    }

    /// Mark every method of every class as not visited, keeping the layout
    pub fn reset(&mut self) {
        for markers in self.visited.values_mut() {
            markers.iter_mut().for_each(|m| *m = false);
        }
    }

    pub fn class_count(&self) -> usize {
        self.visited.len()
    }
}

/// Builds [`TestRecord`]s and owns the session's name dictionary
#[derive(Debug, Default)]
pub struct TouchRecorder {
    dictionary: NameDictionary,
    tests_recorded: u64,
}

impl TouchRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Intern a name (class names are registered here by the instrumentation)
    pub fn enumerate(&mut self, name: &str) -> Result<NameId> {
        self.dictionary.enumerate(name)
    }

    pub fn dictionary(&self) -> &NameDictionary {
        &self.dictionary
    }

    pub fn dictionary_mut(&mut self) -> &mut NameDictionary {
        &mut self.dictionary
    }

    pub fn tests_recorded(&self) -> u64 {
        self.tests_recorded
    }

    /// Build the record for a finished test.
    ///
    /// Fails with [`DiscoveryError::ContractViolation`] when a visited class
    /// has no method names or its name table does not match its markers.
    pub fn record(&mut self, suite: &str, test: &str, coverage: &TestCoverage) -> Result<TestRecord> {
        let identity = TestIdentity {
            suite: self.dictionary.enumerate(suite)?,
            test: self.dictionary.enumerate(test)?,
        };

        let mut classes = Vec::new();
        for (&class, markers) in &coverage.visited {
            if !markers.contains(&true) {
                continue;
            }

            let names = coverage.method_names.get(&class).ok_or_else(|| {
                DiscoveryError::ContractViolation(format!(
                    "class {} has visited methods but no method names",
                    class
                ))
            })?;
            if names.len() != markers.len() {
                return Err(DiscoveryError::ContractViolation(format!(
                    "class {} has {} markers but {} method names",
                    class,
                    markers.len(),
                    names.len()
                )));
            }

            let methods = markers
                .iter()
                .zip(names)
                .filter(|(&visited, _)| visited)
                .map(|(_, name)| self.dictionary.enumerate(name))
                .collect::<Result<Vec<_>>>()?;
            classes.push(ClassTouch { class, methods });
        }

        self.tests_recorded += 1;
        trace!(
            "Recorded test {}.{} touching {} classes",
            suite,
            test,
            classes.len()
        );

        Ok(TestRecord { identity, classes })
    }
}
