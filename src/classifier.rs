//! Test framework detection.
//!
//! Sniffs Python source text to decide whether a file or folder holds
//! pytest or unittest tests. The first candidate file that matches any
//! predicate decides the outcome; there is no voting across files.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use walkdir::{DirEntry, WalkDir};

use crate::sandbox::workspace::EXCLUDED_NAMES;

/// Source extensions considered when walking a directory.
const SOURCE_EXTENSIONS: &[&str] = &["py"];

/// Test framework detected in a file or folder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TestType {
    Pytest,
    Unittest,
    Unknown,
}

impl std::fmt::Display for TestType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pytest => write!(f, "pytest"),
            Self::Unittest => write!(f, "unittest"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

/// Ordered predicates. Earlier entries take precedence within a file.
const PREDICATES: &[(TestType, &[&str])] = &[
    (
        TestType::Pytest,
        &["import pytest", "from pytest", "@pytest.mark", "def test_"],
    ),
    (
        TestType::Unittest,
        &["import unittest", "from unittest", "unittest.TestCase"],
    ),
];

/// Classify a single file's text.
///
/// Returns `None` when neither framework is recognised so the caller can
/// move on to the next candidate.
pub fn classify_source(content: &str) -> Option<TestType> {
    PREDICATES
        .iter()
        .find(|(_, needles)| needles.iter().any(|needle| content.contains(needle)))
        .map(|(test_type, _)| *test_type)
}

/// Classify a file or directory.
///
/// Unreadable files (permissions, invalid UTF-8) are skipped silently.
pub fn classify(path: &Path) -> TestType {
    for candidate in candidates(path) {
        let content = match std::fs::read_to_string(&candidate) {
            Ok(content) => content,
            Err(e) => {
                tracing::trace!(path = %candidate.display(), error = %e, "Skipping unreadable file");
                continue;
            }
        };
        if let Some(test_type) = classify_source(&content) {
            tracing::debug!(
                path = %candidate.display(),
                test_type = %test_type,
                "Detected test framework"
            );
            return test_type;
        }
    }
    TestType::Unknown
}

/// Candidate files in a stable (file-name sorted, depth-first) order.
///
/// Virtual environments and caches are never staged, so they are not
/// searched either.
fn candidates(path: &Path) -> Vec<PathBuf> {
    if path.is_file() {
        return vec![path.to_path_buf()];
    }
    WalkDir::new(path)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| entry.depth() == 0 || !is_excluded(entry))
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .map(|entry| entry.into_path())
        .filter(|p| has_source_extension(p))
        .collect()
}

fn is_excluded(entry: &DirEntry) -> bool {
    entry
        .file_name()
        .to_str()
        .is_some_and(|name| EXCLUDED_NAMES.contains(&name))
}

fn has_source_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| SOURCE_EXTENSIONS.contains(&ext))
}
