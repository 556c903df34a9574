//! Declaration extractor: recognizes the narrow declarative call pattern
//! `test("name", fn)` / `suite("name", fn)` in a parsed syntax tree.

use lsp_types::{Position, Range};
use tree_sitter::{Node, Point};

use crate::TestKind;

const TEST_CASE_CALLEE: &str = "test";
const TEST_SUITE_CALLEE: &str = "suite";
const TEST_SUITE_CALLEE2: &str = "flakySuite";

/// Node kinds accepted as the body argument: inline functions in either
/// syntax, or an identifier referencing a function declared elsewhere.
const BODY_KINDS: [&str; 4] = [
    "arrow_function",
    "function",
    "function_expression",
    "identifier",
];

/// A recognized test or suite declaration.
#[derive(Debug, Eq, PartialEq, Clone)]
pub struct Declaration {
    pub kind: TestKind,
    pub name: String,
    /// From the start of the name literal to the end of the body function.
    pub range: Range,
}

pub(crate) fn to_position(point: Point) -> Position {
    Position {
        line: point.row as u32,
        character: point.column as u32,
    }
}

/// Strip the surrounding quote characters from a string-literal node's text.
fn string_literal_text(text: &str) -> &str {
    match (text.chars().next(), text.chars().last()) {
        (Some(open @ ('"' | '\'')), Some(close)) if close == open && text.len() >= 2 => {
            &text[1..text.len() - 1]
        }
        _ => text,
    }
}

/// Try to read a test or suite declaration out of a single syntax node.
///
/// Only direct calls `identifier("name", function)` match; everything else
/// returns `None` and the caller keeps walking into children, since
/// declarations may be nested inside arbitrary wrapping expressions. The
/// function never fails on partial or invalid source: unparseable regions
/// simply produce no match.
#[must_use]
pub fn extract(node: Node, source: &[u8]) -> Option<Declaration> {
    if node.kind() != "call_expression" {
        return None;
    }
    let callee = node.child_by_field_name("function")?;
    if callee.kind() != "identifier" {
        return None;
    }
    let kind = match callee.utf8_text(source).ok()? {
        TEST_CASE_CALLEE => TestKind::Case,
        TEST_SUITE_CALLEE | TEST_SUITE_CALLEE2 => TestKind::Suite,
        _ => return None,
    };

    let arguments = node.child_by_field_name("arguments")?;
    let mut cursor = arguments.walk();
    let args: Vec<Node> = arguments.named_children(&mut cursor).collect();
    if args.len() < 2 {
        return None;
    }

    let name_node = args[0];
    if name_node.kind() != "string" {
        return None;
    }
    let body = args[1];
    if !BODY_KINDS.contains(&body.kind()) {
        return None;
    }

    let name = string_literal_text(name_node.utf8_text(source).ok()?).to_string();
    Some(Declaration {
        kind,
        name,
        range: Range {
            start: to_position(name_node.start_position()),
            end: to_position(body.end_position()),
        },
    })
}

/// Parse JavaScript/TypeScript source text into a syntax tree.
///
/// Returns `None` when the parser gives up entirely; partially invalid
/// source still yields a tree with ERROR nodes, which extraction tolerates.
pub fn parse_source(source: &str) -> Option<tree_sitter::Tree> {
    let mut parser = tree_sitter::Parser::new();
    parser
        .set_language(&tree_sitter_javascript::language())
        .ok()?;
    parser.parse(source, None)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn extract_all(source: &str) -> Vec<Declaration> {
        let tree = parse_source(source).unwrap();
        let mut found = Vec::new();
        collect(tree.root_node(), source.as_bytes(), &mut found);
        found
    }

    fn collect(node: Node, source: &[u8], found: &mut Vec<Declaration>) {
        if let Some(declaration) = extract(node, source) {
            found.push(declaration);
        }
        let mut cursor = node.walk();
        for child in node.children(&mut cursor) {
            collect(child, source, found);
        }
    }

    #[test]
    fn extracts_nothing_from_empty_source() {
        assert!(extract_all("").is_empty());
    }

    #[test]
    fn extracts_test_call() {
        let found = extract_all("test('hello', () => {})");
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].kind, TestKind::Case);
        assert_eq!(found[0].name, "hello");
        assert_eq!(found[0].range.start, Position { line: 0, character: 5 });
        assert_eq!(found[0].range.end, Position { line: 0, character: 22 });
    }

    #[test]
    fn extracts_suite_and_flaky_suite() {
        let found = extract_all("suite('a', () => {});\nflakySuite('b', function () {});");
        assert_eq!(found.len(), 2);
        assert!(found.iter().all(|d| d.kind == TestKind::Suite));
        assert_eq!(found[0].name, "a");
        assert_eq!(found[1].name, "b");
    }

    #[test]
    fn ignores_other_callees_and_member_calls() {
        let found = extract_all("it('nope', () => {}); foo.test('nope', () => {});");
        assert!(found.is_empty());
    }

    #[test]
    fn requires_two_arguments() {
        assert!(extract_all("test('lonely')").is_empty());
    }

    #[test]
    fn requires_literal_name() {
        assert!(extract_all("test(name, () => {})").is_empty());
        assert!(extract_all("test(`tpl`, () => {})").is_empty());
    }

    #[test]
    fn requires_function_like_second_argument() {
        assert!(extract_all("test('a', 42)").is_empty());
        assert!(extract_all("test('a', 'b')").is_empty());
    }

    #[test]
    fn accepts_named_function_reference() {
        let found = extract_all("test('named', helper)");
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].name, "named");
    }

    #[test]
    fn tolerates_partial_source() {
        // Mid-edit source with a dangling brace still yields the valid call.
        let found = extract_all("test('ok', () => {});\nsuite('broken', () => {");
        assert!(found.iter().any(|d| d.name == "ok"));
    }

    #[test]
    fn double_quoted_name() {
        let found = extract_all("test(\"dq\", () => {})");
        assert_eq!(found[0].name, "dq");
    }
}
