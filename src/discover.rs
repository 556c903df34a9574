//! Per-file discovery: parse source text, walk the syntax tree, reconcile
//! recognized declarations against the existing tree and prune what was not
//! re-observed.

use std::collections::HashSet;

use tree_sitter::Node;

use crate::{
    FilePath, TestKind, TestLocation,
    extract::{self, Declaration},
    tree::{Candidate, ChangeSet, MergeConflict, MergeOutcome, NodeId, TestTree},
};

/// Owns the pass-generation counter shared by all files of one discovery
/// scope. Staleness is only ever compared within one file's own passes, but
/// a single counter keeps the "newer generation wins" ordering trivially
/// true across interleaved passes.
#[derive(Debug)]
pub struct DiscoveryContext {
    next_generation: u64,
}

impl Default for DiscoveryContext {
    fn default() -> Self {
        Self::new()
    }
}

impl DiscoveryContext {
    #[must_use]
    pub fn new() -> Self {
        Self { next_generation: 1 }
    }

    pub fn next_generation(&mut self) -> u64 {
        let generation = self.next_generation;
        self.next_generation += 1;
        generation
    }
}

/// Drives discovery passes over individual files and tracks which files are
/// currently in a parse-errored state.
#[derive(Debug, Default)]
pub struct DiscoveryEngine {
    context: DiscoveryContext,
    errored: HashSet<FilePath>,
}

impl DiscoveryEngine {
    #[must_use]
    pub fn new() -> Self {
        Self {
            context: DiscoveryContext::new(),
            errored: HashSet::new(),
        }
    }

    /// Whether the last pass over `path` failed to parse. The prior good
    /// tree for the file is retained while this is set.
    #[must_use]
    pub fn is_errored(&self, path: &str) -> bool {
        self.errored.contains(path)
    }

    /// Run one discovery pass over a file's source text.
    ///
    /// Parse failure is isolated: the file is marked errored, the existing
    /// subtree stays untouched (an in-progress edit must not drop state) and
    /// an empty change set is returned. A successful parse reconciles the
    /// recognized declarations into the tree and prunes everything in this
    /// file that the pass did not re-observe.
    pub fn discover_source(
        &mut self,
        tree: &mut TestTree,
        path: &str,
        source: &str,
    ) -> ChangeSet {
        let mut changes = ChangeSet::default();
        let Some(syntax) = extract::parse_source(source) else {
            log::warn!("parse failed for {path}, keeping previous tree state");
            self.errored.insert(path.to_string());
            return changes;
        };
        self.errored.remove(path);

        let generation = self.context.next_generation();
        let mut parents = vec![tree.root()];
        visit(
            tree,
            syntax.root_node(),
            source.as_bytes(),
            path,
            generation,
            &mut parents,
            &mut changes,
        );

        tree.prune(tree.root(), path, generation, &mut changes);
        log::debug!(
            "discovered {path} at generation {generation}: {} changed, {} removed",
            changes.changed().len(),
            changes.removed().len()
        );
        changes
    }

    /// Evict a deleted file's entire subtree.
    pub fn evict_file(&mut self, tree: &mut TestTree, path: &str) -> ChangeSet {
        let mut changes = ChangeSet::default();
        tree.evict_file(path, &mut changes);
        self.errored.remove(path);
        changes
    }
}

fn visit(
    tree: &mut TestTree,
    node: Node,
    source: &[u8],
    path: &str,
    generation: u64,
    parents: &mut Vec<NodeId>,
    changes: &mut ChangeSet,
) {
    if let Some(declaration) = extract::extract(node, source) {
        let parent = *parents.last().expect("parent stack is never empty");
        let merged = merge(tree, parent, &declaration, path, generation, changes);
        // Suites nest further declarations; case bodies are opaque.
        if declaration.kind == TestKind::Suite
            && let Some(suite) = merged
        {
            parents.push(suite);
            visit_children(tree, node, source, path, generation, parents, changes);
            parents.pop();
        }
        return;
    }
    // Declarations may hide inside any wrapping expression, keep walking.
    visit_children(tree, node, source, path, generation, parents, changes);
}

fn visit_children(
    tree: &mut TestTree,
    node: Node,
    source: &[u8],
    path: &str,
    generation: u64,
    parents: &mut Vec<NodeId>,
    changes: &mut ChangeSet,
) {
    let mut cursor = node.walk();
    let children: Vec<Node> = node.children(&mut cursor).collect();
    for child in children {
        visit(tree, child, source, path, generation, parents, changes);
    }
}

fn merge(
    tree: &mut TestTree,
    parent: NodeId,
    declaration: &Declaration,
    path: &str,
    generation: u64,
    changes: &mut ChangeSet,
) -> Option<NodeId> {
    let location = TestLocation::new(path, declaration.range);
    let candidate = Candidate::new(declaration.kind, &declaration.name, location, generation);
    match tree.add_child(parent, candidate) {
        MergeOutcome::Inserted(id) => {
            changes.mark_discovered(id);
            Some(id)
        }
        MergeOutcome::Merged {
            id,
            location_changed,
        } => {
            if location_changed {
                changes.mark_relocated(id);
            }
            Some(id)
        }
        MergeOutcome::KindConflict {
            existing,
            candidate,
        } => {
            let summary = tree.summary(existing).expect("conflicting node is live");
            log::warn!(
                "declaration {:?} collides with existing {:?} of the other kind, leaving both untouched",
                candidate.label,
                summary.fully_qualified_name
            );
            changes.mark_conflict(MergeConflict {
                parent,
                existing: summary,
                candidate_kind: candidate.kind,
                candidate_location: candidate.location,
            });
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::*;

    const NESTED: &str = "\
suite('a', () => { test('aa', fn); test('ab', fn); suite('ac', () => { test('aca', fn); }); });
suite('b', () => { test('ba', fn); });
";

    fn labels(tree: &TestTree, parent: NodeId) -> BTreeSet<String> {
        let mut out = BTreeSet::new();
        let mut stack = vec![parent];
        while let Some(id) = stack.pop() {
            if let Some(summary) = tree.summary(id) {
                out.insert(summary.fully_qualified_name.as_str().to_string());
            }
            for child_label in tree.child_labels(id) {
                stack.push(tree.child_by_label(id, &child_label).unwrap());
            }
        }
        out
    }

    #[test]
    fn discovers_nested_structure() {
        let mut engine = DiscoveryEngine::new();
        let mut tree = TestTree::new();
        engine.discover_source(&mut tree, "f.ts", NESTED);

        let expected: BTreeSet<String> = ["a", "a aa", "a ab", "a ac", "a ac aca", "b", "b ba"]
            .iter()
            .map(ToString::to_string)
            .collect();
        let found = labels(&tree, tree.root());
        assert_eq!(found, expected);
    }

    #[test]
    fn rediscovery_of_unchanged_source_is_idempotent() {
        let mut engine = DiscoveryEngine::new();
        let mut tree = TestTree::new();
        let first = engine.discover_source(&mut tree, "f.ts", NESTED);
        assert!(!first.is_empty());
        let second = engine.discover_source(&mut tree, "f.ts", NESTED);
        assert!(second.is_empty(), "second pass produced {second:?}");
    }

    #[test]
    fn removing_a_test_prunes_it_and_marks_the_parent() {
        let mut engine = DiscoveryEngine::new();
        let mut tree = TestTree::new();
        engine.discover_source(&mut tree, "f.ts", NESTED);

        let a = tree.child_by_label(tree.root(), "a").unwrap();
        let aa = tree.child_by_label(a, "aa").unwrap();
        let ac = tree.child_by_label(a, "ac").unwrap();
        let aca = tree.child_by_label(ac, "aca").unwrap();
        let b = tree.child_by_label(tree.root(), "b").unwrap();

        let without_ab = NESTED.replace("test('ab', fn); ", "");
        let changes = engine.discover_source(&mut tree, "f.ts", &without_ab);

        let removed: Vec<&str> = changes.removed().iter().map(|s| s.label.as_str()).collect();
        assert_eq!(removed, vec!["ab"]);
        assert!(changes.contains_changed(a));
        // Survivors keep the same identity.
        assert_eq!(tree.child_by_label(tree.root(), "a"), Some(a));
        assert_eq!(tree.child_by_label(a, "aa"), Some(aa));
        assert_eq!(tree.child_by_label(ac, "aca"), Some(aca));
        assert_eq!(tree.child_by_label(tree.root(), "b"), Some(b));
    }

    #[test]
    fn rename_updates_location_in_place() {
        let mut engine = DiscoveryEngine::new();
        let mut tree = TestTree::new();
        engine.discover_source(&mut tree, "f.ts", "test('a', () => {});");
        let id = tree.child_by_label(tree.root(), "a").unwrap();

        let changes = engine.discover_source(&mut tree, "f.ts", "\n\ntest('a', () => {});");
        assert_eq!(changes.relocated(), &[id]);
        assert!(changes.removed().is_empty());
        assert_eq!(
            tree.node(id).unwrap().location.as_ref().unwrap().range.start.line,
            2
        );
    }

    #[test]
    fn declarations_inside_conditionals_are_found() {
        let source = "if (platform === 'win32') { suite('windows', () => { test('w', fn); }); }";
        let mut engine = DiscoveryEngine::new();
        let mut tree = TestTree::new();
        engine.discover_source(&mut tree, "f.ts", source);
        let windows = tree.child_by_label(tree.root(), "windows").unwrap();
        assert!(tree.child_by_label(windows, "w").is_some());
    }

    #[test]
    fn case_bodies_are_not_searched_for_nested_declarations() {
        let source = "test('outer', () => { test('inner', fn); });";
        let mut engine = DiscoveryEngine::new();
        let mut tree = TestTree::new();
        engine.discover_source(&mut tree, "f.ts", source);
        assert!(tree.child_by_label(tree.root(), "outer").is_some());
        assert!(tree.child_by_label(tree.root(), "inner").is_none());
    }

    #[test]
    fn kind_conflict_is_reported_in_changes() {
        let source = "suite('dual', () => { test('x', fn); });\ntest('dual', () => {});";
        let mut engine = DiscoveryEngine::new();
        let mut tree = TestTree::new();
        let changes = engine.discover_source(&mut tree, "f.ts", source);
        assert_eq!(changes.conflicts().len(), 1);
        assert_eq!(changes.conflicts()[0].candidate_kind, TestKind::Case);
        // The suite keeps its identity and children.
        let dual = tree.child_by_label(tree.root(), "dual").unwrap();
        assert!(tree.child_by_label(dual, "x").is_some());
    }

    #[test]
    fn files_do_not_interfere() {
        let mut engine = DiscoveryEngine::new();
        let mut tree = TestTree::new();
        engine.discover_source(&mut tree, "a.ts", "test('from-a', () => {});");
        engine.discover_source(&mut tree, "b.ts", "test('from-b', () => {});");
        // Re-discovering a.ts must not prune b.ts's test.
        engine.discover_source(&mut tree, "a.ts", "test('from-a', () => {});");
        assert!(tree.child_by_label(tree.root(), "from-b").is_some());
    }

    #[test]
    fn evict_file_uses_the_generation_sentinel() {
        let mut engine = DiscoveryEngine::new();
        let mut tree = TestTree::new();
        engine.discover_source(&mut tree, "f.ts", NESTED);
        let changes = engine.evict_file(&mut tree, "f.ts");
        assert!(tree.is_empty());
        assert_eq!(changes.removed().len(), 7);
    }
}
