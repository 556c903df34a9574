//! Test-explorer engine: incremental test discovery and streamed run-output
//! correlation for an editor's native test explorer.
//!
//! The crate has two halves. Discovery parses source files with tree-sitter,
//! extracts declarative `test(...)`/`suite(...)` calls and reconciles them
//! into a stable [`tree::TestTree`] without losing node identity across
//! re-parses. Run feedback consumes a line-oriented JSON event stream from a
//! spawned test process and translates it into per-test outcome updates,
//! resolving failure stack locations through source maps while the stream is
//! drained.
//!
//! Hosts integrate through [`sink::TestSink`] (tree and outcome updates),
//! [`workspace::FileEvent`] (file creation/change/deletion) and
//! [`run::ProcessHandle`] (the spawned runner's output streams).

use lsp_types::Range;
use serde::{Deserialize, Serialize};

pub mod config;
pub mod debounce;
pub mod discover;
pub mod error;
pub mod extract;
pub mod log;
pub mod run;
pub mod sink;
pub mod source_map;
pub mod tree;
pub mod workspace;

pub use run::{CancellationSource, CancellationToken, ProcessHandle, RunQueue, RunRequest};
pub use sink::TestSink;
pub use source_map::SourceMapLoader;
pub use tree::{ChangeSet, NodeId, PendingCase, PendingMap, TestTree};
pub use workspace::{DiscoveryHandle, FileEvent};

// --- Core Types ---

pub type FilePath = String;

/// Kind of a declared test node.
#[derive(Serialize, Deserialize, Debug, Eq, PartialEq, Clone, Copy, Hash)]
pub enum TestKind {
    Case,
    Suite,
}

/// Where a test or suite is declared: from the start of its name literal to
/// the end of its body function.
#[derive(Serialize, Deserialize, Debug, Eq, PartialEq, Clone)]
pub struct TestLocation {
    pub path: FilePath,
    pub range: Range,
}

impl TestLocation {
    pub fn new(path: impl Into<FilePath>, range: Range) -> Self {
        Self {
            path: path.into(),
            range,
        }
    }
}

/// The space-joined chain of ancestor suite names plus a test's own name.
///
/// This is the correlation key shared with the external test runner: the
/// runner reports results under the same full title, so the concatenation
/// here must match it byte for byte.
#[derive(Serialize, Deserialize, Debug, Eq, PartialEq, Clone, Hash, Default)]
pub struct FullyQualifiedName(String);

impl FullyQualifiedName {
    /// The root prefix: empty, contributes nothing to child names.
    #[must_use]
    pub fn root() -> Self {
        Self(String::new())
    }

    /// Extend this name with a child label.
    #[must_use]
    pub fn child(&self, label: &str) -> Self {
        if self.0.is_empty() {
            Self(label.to_string())
        } else {
            Self(format!("{} {}", self.0, label))
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for FullyQualifiedName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for FullyQualifiedName {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Failure details attached to a [`RunOutcome::Failed`].
///
/// When the runner reported both an expected and an actual payload the raw
/// strings are kept alongside the message so the host can re-render the diff
/// programmatically.
#[derive(Debug, Eq, PartialEq, Clone)]
pub struct FailureMessage {
    pub text: String,
    pub expected: Option<String>,
    pub actual: Option<String>,
    pub location: Option<TestLocation>,
}

impl FailureMessage {
    /// Whether this message carries a structured expected/actual diff.
    #[must_use]
    pub fn is_diff(&self) -> bool {
        self.expected.is_some() && self.actual.is_some()
    }
}

/// Per-case state during an active run. Never persisted.
#[derive(Debug, PartialEq, Clone)]
pub enum RunOutcome {
    Queued,
    Running,
    Passed {
        duration_ms: Option<u64>,
    },
    Failed {
        message: FailureMessage,
        duration_ms: Option<u64>,
    },
    Skipped,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fully_qualified_names_join_with_spaces() {
        let root = FullyQualifiedName::root();
        let suite = root.child("a");
        let case = suite.child("aa");
        assert_eq!(suite.as_str(), "a");
        assert_eq!(case.as_str(), "a aa");
    }

    #[test]
    fn root_prefix_is_empty() {
        assert_eq!(FullyQualifiedName::root().as_str(), "");
        assert_eq!(FullyQualifiedName::root().child("x").as_str(), "x");
    }

    #[test]
    fn failure_message_diff_detection() {
        let plain = FailureMessage {
            text: "boom".to_string(),
            expected: None,
            actual: None,
            location: None,
        };
        assert!(!plain.is_diff());
        let diff = FailureMessage {
            expected: Some("1".to_string()),
            actual: Some("2".to_string()),
            ..plain
        };
        assert!(diff.is_diff());
    }
}
