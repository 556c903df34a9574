//! The test tree: a forest of suites and cases keyed by label, merged
//! incrementally across discovery passes and pruned by generation.
//!
//! Nodes live in an arena and are addressed by [`NodeId`], so re-discovering
//! a file updates existing nodes in place instead of replacing them; a
//! node's id is its identity for the whole session. Parent links are plain
//! back-references, the parent's label map is the sole owner.

use std::collections::HashMap;

use crate::{FullyQualifiedName, TestKind, TestLocation};

/// Placeholder label for declarations whose name literal is empty.
pub const EMPTY_LABEL: &str = "<anonymous>";

/// Generation sentinel greater than every real pass generation; pruning with
/// it evicts a file's entire subtree.
pub const EVICT_GENERATION: u64 = u64::MAX;

/// Stable identity of a tree node. Never reused within a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(usize);

impl NodeId {
    pub(crate) fn from_index(index: usize) -> Self {
        Self(index)
    }
}

/// A fresh node produced by one discovery pass, before merging.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub kind: TestKind,
    pub label: String,
    pub location: TestLocation,
    pub generation: u64,
}

impl Candidate {
    pub fn new(kind: TestKind, name: &str, location: TestLocation, generation: u64) -> Self {
        let label = if name.is_empty() {
            EMPTY_LABEL.to_string()
        } else {
            name.to_string()
        };
        Self {
            kind,
            label,
            location,
            generation,
        }
    }
}

/// Variant data of a tree node. The set is closed: every consumer matches
/// exhaustively over root, suite and case.
#[derive(Debug)]
pub enum NodeData {
    Root { children: HashMap<String, NodeId> },
    Suite { children: HashMap<String, NodeId> },
    Case { generation: u64 },
}

#[derive(Debug)]
pub struct TreeNode {
    pub label: String,
    pub fully_qualified_name: FullyQualifiedName,
    pub location: Option<TestLocation>,
    parent: Option<NodeId>,
    pub data: NodeData,
}

impl TreeNode {
    #[must_use]
    pub fn kind(&self) -> Option<TestKind> {
        match self.data {
            NodeData::Root { .. } => None,
            NodeData::Suite { .. } => Some(TestKind::Suite),
            NodeData::Case { .. } => Some(TestKind::Case),
        }
    }

    #[must_use]
    pub fn parent(&self) -> Option<NodeId> {
        self.parent
    }

    fn children(&self) -> Option<&HashMap<String, NodeId>> {
        match &self.data {
            NodeData::Root { children } | NodeData::Suite { children } => Some(children),
            NodeData::Case { .. } => None,
        }
    }

    fn children_mut(&mut self) -> Option<&mut HashMap<String, NodeId>> {
        match &mut self.data {
            NodeData::Root { children } | NodeData::Suite { children } => Some(children),
            NodeData::Case { .. } => None,
        }
    }
}

/// Snapshot of a node's externally visible state, handed to sinks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeSummary {
    pub id: NodeId,
    pub kind: TestKind,
    pub label: String,
    pub fully_qualified_name: FullyQualifiedName,
    pub location: Option<TestLocation>,
}

/// One case expected to report an outcome during a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingCase {
    pub id: NodeId,
    pub fully_qualified_name: FullyQualifiedName,
    pub location: TestLocation,
}

/// Snapshot of the cases dispatched to one run, keyed by full title.
pub type PendingMap = HashMap<FullyQualifiedName, PendingCase>;

/// Result of merging a candidate into a parent's children.
#[derive(Debug)]
pub enum MergeOutcome {
    /// No same-label sibling existed; the candidate was inserted.
    Inserted(NodeId),
    /// A same-label, same-kind sibling absorbed the candidate.
    Merged { id: NodeId, location_changed: bool },
    /// A same-label sibling of the other kind exists. The candidate is not
    /// inserted and the existing node keeps its identity; the caller decides
    /// the policy.
    KindConflict { existing: NodeId, candidate: Candidate },
}

/// An unresolved same-label, different-kind merge surfaced to the caller.
#[derive(Debug, Clone)]
pub struct MergeConflict {
    pub parent: NodeId,
    pub existing: NodeSummary,
    pub candidate_kind: TestKind,
    pub candidate_location: TestLocation,
}

/// Changes accumulated over one discovery pass.
#[derive(Debug, Default)]
pub struct ChangeSet {
    changed: Vec<NodeId>,
    discovered: Vec<NodeId>,
    relocated: Vec<NodeId>,
    removed: Vec<NodeSummary>,
    conflicts: Vec<MergeConflict>,
}

impl ChangeSet {
    /// Nodes whose state or structure changed this pass, in first-touch order.
    #[must_use]
    pub fn changed(&self) -> &[NodeId] {
        &self.changed
    }

    /// Nodes inserted fresh this pass.
    #[must_use]
    pub fn discovered(&self) -> &[NodeId] {
        &self.discovered
    }

    /// Nodes whose label survived but whose declaration moved.
    #[must_use]
    pub fn relocated(&self) -> &[NodeId] {
        &self.relocated
    }

    /// Nodes pruned this pass, captured as summaries since the nodes are gone.
    #[must_use]
    pub fn removed(&self) -> &[NodeSummary] {
        &self.removed
    }

    /// Unresolved kind conflicts encountered this pass.
    #[must_use]
    pub fn conflicts(&self) -> &[MergeConflict] {
        &self.conflicts
    }

    #[must_use]
    pub fn contains_changed(&self, id: NodeId) -> bool {
        self.changed.contains(&id)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.changed.is_empty() && self.removed.is_empty() && self.conflicts.is_empty()
    }

    pub fn mark_changed(&mut self, id: NodeId) {
        if !self.changed.contains(&id) {
            self.changed.push(id);
        }
    }

    pub fn mark_discovered(&mut self, id: NodeId) {
        self.mark_changed(id);
        if !self.discovered.contains(&id) {
            self.discovered.push(id);
        }
    }

    pub fn mark_relocated(&mut self, id: NodeId) {
        self.mark_changed(id);
        if !self.relocated.contains(&id) {
            self.relocated.push(id);
        }
    }

    pub fn mark_conflict(&mut self, conflict: MergeConflict) {
        self.conflicts.push(conflict);
    }

    /// Record a removal. A detached node must not linger as a pending update,
    /// so any earlier mention of it is dropped from the accumulator.
    pub fn mark_removed(&mut self, id: NodeId, summary: NodeSummary) {
        self.changed.retain(|&queued| queued != id);
        self.discovered.retain(|&queued| queued != id);
        self.relocated.retain(|&queued| queued != id);
        self.removed.push(summary);
    }
}

/// Arena-backed test tree with a single root.
#[derive(Debug)]
pub struct TestTree {
    nodes: Vec<Option<TreeNode>>,
    root: NodeId,
}

impl Default for TestTree {
    fn default() -> Self {
        Self::new()
    }
}

impl TestTree {
    #[must_use]
    pub fn new() -> Self {
        let root = TreeNode {
            label: String::new(),
            fully_qualified_name: FullyQualifiedName::root(),
            location: None,
            parent: None,
            data: NodeData::Root {
                children: HashMap::new(),
            },
        };
        Self {
            nodes: vec![Some(root)],
            root: NodeId(0),
        }
    }

    #[must_use]
    pub fn root(&self) -> NodeId {
        self.root
    }

    #[must_use]
    pub fn node(&self, id: NodeId) -> Option<&TreeNode> {
        self.nodes.get(id.0).and_then(Option::as_ref)
    }

    fn node_mut(&mut self, id: NodeId) -> Option<&mut TreeNode> {
        self.nodes.get_mut(id.0).and_then(Option::as_mut)
    }

    /// Summary of a live node; `None` for the root or detached ids.
    #[must_use]
    pub fn summary(&self, id: NodeId) -> Option<NodeSummary> {
        let node = self.node(id)?;
        Some(NodeSummary {
            id,
            kind: node.kind()?,
            label: node.label.clone(),
            fully_qualified_name: node.fully_qualified_name.clone(),
            location: node.location.clone(),
        })
    }

    /// Look up a direct child of `parent` by label.
    #[must_use]
    pub fn child_by_label(&self, parent: NodeId, label: &str) -> Option<NodeId> {
        self.node(parent)?.children()?.get(label).copied()
    }

    /// Labels of a node's direct children; empty for cases.
    #[must_use]
    pub fn child_labels(&self, id: NodeId) -> Vec<String> {
        self.node(id)
            .and_then(TreeNode::children)
            .map(|children| children.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of live nodes, excluding the root.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.iter().flatten().count() - 1
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Merge a candidate into `parent`'s children.
    ///
    /// A same-label, same-kind sibling absorbs the candidate: its location
    /// and generation are updated in place and its identity is retained.
    /// A same-label sibling of a different kind is reported as a
    /// [`MergeOutcome::KindConflict`] without touching either identity.
    pub fn add_child(&mut self, parent: NodeId, candidate: Candidate) -> MergeOutcome {
        if let Some(existing) = self.child_by_label(parent, &candidate.label) {
            let node = self.node_mut(existing).expect("child map points at live node");
            if node.kind() == Some(candidate.kind) {
                let location_changed = node.location.as_ref() != Some(&candidate.location);
                node.location = Some(candidate.location);
                if let NodeData::Case { generation } = &mut node.data {
                    *generation = candidate.generation;
                }
                return MergeOutcome::Merged {
                    id: existing,
                    location_changed,
                };
            }
            return MergeOutcome::KindConflict {
                existing,
                candidate,
            };
        }

        let fully_qualified_name = self
            .node(parent)
            .expect("parent is live")
            .fully_qualified_name
            .child(&candidate.label);
        let data = match candidate.kind {
            TestKind::Suite => NodeData::Suite {
                children: HashMap::new(),
            },
            TestKind::Case => NodeData::Case {
                generation: candidate.generation,
            },
        };
        let id = NodeId(self.nodes.len());
        self.nodes.push(Some(TreeNode {
            label: candidate.label.clone(),
            fully_qualified_name,
            location: Some(candidate.location),
            parent: Some(parent),
            data,
        }));
        self.node_mut(parent)
            .expect("parent is live")
            .children_mut()
            .expect("cases cannot parent children")
            .insert(candidate.label, id);
        MergeOutcome::Inserted(id)
    }

    /// Remove every stale case under `node` that lives in `file`, cascade
    /// removal of emptied suites, and record the structural changes.
    ///
    /// A case is stale when its generation predates `generation`. Suites are
    /// never pruned by generation, only by ending up with zero children.
    /// Returns whether `node` still has children afterwards.
    pub fn prune(
        &mut self,
        node: NodeId,
        file: &str,
        generation: u64,
        changes: &mut ChangeSet,
    ) -> bool {
        let Some(children) = self.node(node).and_then(TreeNode::children) else {
            return false;
        };
        let child_ids: Vec<NodeId> = children.values().copied().collect();

        for child in child_ids {
            enum Verdict {
                StaleCase,
                Suite,
                Keep,
            }
            let verdict = match self.node(child) {
                Some(child_node) => match &child_node.data {
                    NodeData::Case {
                        generation: observed,
                    } => {
                        let stale = child_node
                            .location
                            .as_ref()
                            .is_some_and(|location| location.path == file)
                            && *observed < generation;
                        if stale { Verdict::StaleCase } else { Verdict::Keep }
                    }
                    NodeData::Suite { .. } => Verdict::Suite,
                    NodeData::Root { .. } => Verdict::Keep,
                },
                None => continue,
            };
            let remove = match verdict {
                Verdict::StaleCase => true,
                Verdict::Suite => !self.prune(child, file, generation, changes),
                Verdict::Keep => false,
            };
            if remove {
                self.detach(node, child, changes);
            }
        }

        self.node(node)
            .and_then(TreeNode::children)
            .is_some_and(|children| !children.is_empty())
    }

    fn detach(&mut self, parent: NodeId, child: NodeId, changes: &mut ChangeSet) {
        let Some(summary) = self.summary(child) else {
            return;
        };
        if let Some(children) = self.node_mut(parent).and_then(TreeNode::children_mut) {
            children.remove(&summary.label);
        }
        self.nodes[child.0] = None;
        changes.mark_removed(child, summary);
        // The removal is surfaced as a change to the surviving parent.
        if parent != self.root {
            changes.mark_changed(parent);
        }
    }

    /// Evict a file's entire subtree, used when the file is deleted.
    pub fn evict_file(&mut self, file: &str, changes: &mut ChangeSet) {
        self.prune(self.root, file, EVICT_GENERATION, changes);
    }

    /// Snapshot every case into a pending map keyed by full title.
    #[must_use]
    pub fn snapshot_pending(&self) -> PendingMap {
        let mut pending = PendingMap::new();
        for (index, slot) in self.nodes.iter().enumerate() {
            let Some(node) = slot else { continue };
            let NodeData::Case { .. } = node.data else {
                continue;
            };
            let Some(location) = node.location.clone() else {
                continue;
            };
            pending.insert(
                node.fully_qualified_name.clone(),
                PendingCase {
                    id: NodeId(index),
                    fully_qualified_name: node.fully_qualified_name.clone(),
                    location,
                },
            );
        }
        pending
    }
}
