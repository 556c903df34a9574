//! The boundary to the host's test-explorer UI.
//!
//! The engine pushes discovery changes and run outcomes through [`TestSink`];
//! the sink is told, never polled, and must not reach back into engine-owned
//! tree state except through the documented operations.

use std::sync::{Arc, Mutex};

use crate::{
    FullyQualifiedName, RunOutcome, TestLocation,
    tree::{ChangeSet, NodeSummary, TestTree},
};

pub trait TestSink: Send {
    /// A node was discovered for the first time.
    fn discovered(&mut self, node: &NodeSummary);

    /// A previously reported node disappeared.
    fn removed(&mut self, node: &NodeSummary);

    /// A node kept its identity but its declaration moved.
    fn location_changed(&mut self, node: &NodeSummary, location: &TestLocation);

    /// A case transitioned run state.
    fn set_outcome(&mut self, case: &FullyQualifiedName, outcome: RunOutcome);

    /// Raw output from the test process, optionally attributed to a case
    /// and/or annotated with a resolved source location.
    fn append_output(
        &mut self,
        text: &str,
        location: Option<&TestLocation>,
        case: Option<&FullyQualifiedName>,
    );

    /// The current run finished, successfully or not.
    fn end(&mut self);
}

/// Shared, lockable sink handle as threads of the engine see it.
pub type SharedSink = Arc<Mutex<dyn TestSink>>;

/// Forward one pass's accumulated changes to the sink.
///
/// Removals go out first so the host never sees a removed node resurface
/// within the same batch, then fresh discoveries, then location moves.
pub fn emit_changes(tree: &TestTree, changes: &ChangeSet, sink: &mut dyn TestSink) {
    for summary in changes.removed() {
        sink.removed(summary);
    }
    for &id in changes.discovered() {
        if let Some(summary) = tree.summary(id) {
            sink.discovered(&summary);
        }
    }
    for &id in changes.relocated() {
        if let Some(summary) = tree.summary(id)
            && let Some(location) = summary.location.clone()
        {
            sink.location_changed(&summary, &location);
        }
    }
}

/// What a [`RecordingSink`] saw, in order.
#[derive(Debug, Clone, PartialEq)]
pub enum SinkEvent {
    Discovered(FullyQualifiedName),
    Removed(FullyQualifiedName),
    LocationChanged(FullyQualifiedName, TestLocation),
    Outcome(FullyQualifiedName, RunOutcome),
    Output {
        text: String,
        location: Option<TestLocation>,
        case: Option<FullyQualifiedName>,
    },
    End,
}

/// In-memory sink recording every notification, for hosts' tests and ours.
#[derive(Debug, Default)]
pub struct RecordingSink {
    pub events: Vec<SinkEvent>,
}

impl RecordingSink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn shared() -> Arc<Mutex<RecordingSink>> {
        Arc::new(Mutex::new(Self::new()))
    }

    /// Outcomes recorded for one case, in order.
    #[must_use]
    pub fn outcomes_for(&self, case: &FullyQualifiedName) -> Vec<RunOutcome> {
        self.events
            .iter()
            .filter_map(|event| match event {
                SinkEvent::Outcome(fqn, outcome) if fqn == case => Some(outcome.clone()),
                _ => None,
            })
            .collect()
    }

    #[must_use]
    pub fn ended(&self) -> bool {
        self.events.iter().any(|event| *event == SinkEvent::End)
    }
}

impl TestSink for RecordingSink {
    fn discovered(&mut self, node: &NodeSummary) {
        self.events
            .push(SinkEvent::Discovered(node.fully_qualified_name.clone()));
    }

    fn removed(&mut self, node: &NodeSummary) {
        self.events
            .push(SinkEvent::Removed(node.fully_qualified_name.clone()));
    }

    fn location_changed(&mut self, node: &NodeSummary, location: &TestLocation) {
        self.events.push(SinkEvent::LocationChanged(
            node.fully_qualified_name.clone(),
            location.clone(),
        ));
    }

    fn set_outcome(&mut self, case: &FullyQualifiedName, outcome: RunOutcome) {
        self.events.push(SinkEvent::Outcome(case.clone(), outcome));
    }

    fn append_output(
        &mut self,
        text: &str,
        location: Option<&TestLocation>,
        case: Option<&FullyQualifiedName>,
    ) {
        self.events.push(SinkEvent::Output {
            text: text.to_string(),
            location: location.cloned(),
            case: case.cloned(),
        });
    }

    fn end(&mut self) {
        self.events.push(SinkEvent::End);
    }
}
