//! Source-map backed location resolution for failure stacks and logged
//! output.
//!
//! Loading the raw map from disk stays outside the engine behind
//! [`SourceMapLoader`]; this module decodes the `mappings` VLQ stream and
//! answers "which original source position produced generated line/column".

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::Arc,
};

use lsp_types::{Position, Range, Url};
use regex::Regex;
use serde::Deserialize;

use crate::{FilePath, TestLocation};

/// The relevant subset of the source-map v3 JSON format.
#[derive(Debug, Clone, Deserialize)]
pub struct RawSourceMap {
    pub version: u32,
    #[serde(default)]
    pub sources: Vec<String>,
    #[serde(default, rename = "sourceRoot")]
    pub source_root: Option<String>,
    #[serde(default)]
    pub names: Vec<String>,
    pub mappings: String,
}

/// Provides the raw source map for a generated file, if one exists.
pub trait SourceMapLoader: Send + Sync {
    fn load(&self, path: &str) -> Option<RawSourceMap>;
}

/// Loader for hosts without source maps; resolution falls back to the
/// generated locations themselves.
pub struct NullSourceMapLoader;

impl SourceMapLoader for NullSourceMapLoader {
    fn load(&self, _path: &str) -> Option<RawSourceMap> {
        None
    }
}

/// A position in an original source file, zero-based.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OriginalPosition {
    pub source: FilePath,
    pub line: u32,
    pub column: u32,
}

#[derive(Debug, Clone, Copy)]
struct Segment {
    generated_column: u32,
    source: u32,
    line: u32,
    column: u32,
}

/// A parsed `mappings` field, indexed by generated line.
#[derive(Debug)]
pub struct DecodedSourceMap {
    sources: Vec<FilePath>,
    lines: Vec<Vec<Segment>>,
}

const BASE64_CHARS: &[u8; 64] =
    b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+/";

fn base64_value(byte: u8) -> Option<i64> {
    BASE64_CHARS
        .iter()
        .position(|&candidate| candidate == byte)
        .map(|index| index as i64)
}

/// Decode one VLQ value from `bytes` starting at `index`; returns the value
/// and the next index.
fn decode_vlq(bytes: &[u8], mut index: usize) -> Option<(i64, usize)> {
    let mut result: i64 = 0;
    let mut shift = 0u32;
    loop {
        let digit = base64_value(*bytes.get(index)?)?;
        index += 1;
        result += (digit & 0b1_1111) << shift;
        if digit & 0b10_0000 == 0 {
            break;
        }
        shift += 5;
    }
    let negative = result & 1 == 1;
    let value = result >> 1;
    Some((if negative { -value } else { value }, index))
}

impl DecodedSourceMap {
    /// Decode a raw map, resolving its source paths against the generated
    /// file's directory. Malformed mapping lines are skipped, not fatal.
    #[must_use]
    pub fn decode(raw: &RawSourceMap, generated_path: &str) -> Self {
        let sources = raw
            .sources
            .iter()
            .map(|source| resolve_source(generated_path, raw.source_root.as_deref(), source))
            .collect();

        let mut lines = Vec::new();
        let mut source: i64 = 0;
        let mut original_line: i64 = 0;
        let mut original_column: i64 = 0;

        for group in raw.mappings.split(';') {
            let mut segments = Vec::new();
            let mut generated_column: i64 = 0;
            'segments: for encoded in group.split(',') {
                if encoded.is_empty() {
                    continue;
                }
                let bytes = encoded.as_bytes();
                let mut fields = [0i64; 5];
                let mut count = 0;
                let mut index = 0;
                while index < bytes.len() && count < 5 {
                    match decode_vlq(bytes, index) {
                        Some((value, next)) => {
                            fields[count] = value;
                            count += 1;
                            index = next;
                        }
                        None => {
                            log::debug!("skipping malformed source-map segment {encoded:?}");
                            continue 'segments;
                        }
                    }
                }
                generated_column += fields[0];
                // One-field segments carry no source information.
                if count >= 4 {
                    source += fields[1];
                    original_line += fields[2];
                    original_column += fields[3];
                    if generated_column >= 0
                        && source >= 0
                        && original_line >= 0
                        && original_column >= 0
                    {
                        segments.push(Segment {
                            generated_column: generated_column as u32,
                            source: source as u32,
                            line: original_line as u32,
                            column: original_column as u32,
                        });
                    }
                }
            }
            segments.sort_by_key(|segment| segment.generated_column);
            lines.push(segments);
        }

        Self { sources, lines }
    }

    /// Map a zero-based generated position to its original position: the
    /// closest segment at or before `column` on that line.
    #[must_use]
    pub fn original_position_for(&self, line: u32, column: u32) -> Option<OriginalPosition> {
        let segments = self.lines.get(line as usize)?;
        let segment = segments
            .iter()
            .rev()
            .find(|segment| segment.generated_column <= column)
            .or_else(|| segments.first())?;
        let source = self.sources.get(segment.source as usize)?;
        Some(OriginalPosition {
            source: source.clone(),
            line: segment.line,
            column: segment.column,
        })
    }
}

fn resolve_source(generated_path: &str, source_root: Option<&str>, source: &str) -> FilePath {
    if let Ok(url) = Url::parse(source)
        && url.scheme() == "file"
    {
        if let Ok(path) = url.to_file_path() {
            return path.to_string_lossy().to_string();
        }
    }
    let rooted = match source_root {
        Some(root) if !root.is_empty() => format!("{}/{}", root.trim_end_matches('/'), source),
        _ => source.to_string(),
    };
    if Path::new(&rooted).is_absolute() {
        return rooted;
    }
    let base = Path::new(generated_path)
        .parent()
        .unwrap_or_else(|| Path::new(""));
    normalize(&base.join(rooted)).to_string_lossy().to_string()
}

fn normalize(path: &Path) -> PathBuf {
    let mut components = Vec::new();
    for component in path.components() {
        match component {
            std::path::Component::ParentDir => {
                components.pop();
            }
            std::path::Component::Normal(_) | std::path::Component::RootDir => {
                components.push(component);
            }
            _ => {}
        }
    }
    PathBuf::from_iter(components)
}

/// Resolves `file://…:line:col` references through cached source maps.
///
/// A file with no map resolves to the generated location itself, which is
/// already correct when tests run unbundled.
pub struct LocationResolver {
    loader: Arc<dyn SourceMapLoader>,
    cache: HashMap<FilePath, Option<DecodedSourceMap>>,
    frame_pattern: Regex,
}

impl LocationResolver {
    #[must_use]
    pub fn new(loader: Arc<dyn SourceMapLoader>) -> Self {
        Self {
            loader,
            cache: HashMap::new(),
            frame_pattern: Regex::new(r"(file://[^\s)]+):(\d+):(\d+)").unwrap(),
        }
    }

    /// Resolve the first `file://…:line:col` reference in `text`, if any.
    /// Line and column in stack traces are one-based.
    pub fn resolve_first_reference(&mut self, text: &str) -> Option<TestLocation> {
        let captures = self.frame_pattern.captures(text)?;
        let uri = captures.get(1)?.as_str();
        let line: u32 = captures.get(2)?.as_str().parse().ok()?;
        let column: u32 = captures.get(3)?.as_str().parse().ok()?;
        let path = Url::parse(uri)
            .ok()?
            .to_file_path()
            .ok()?
            .to_string_lossy()
            .to_string();
        Some(self.resolve_position(&path, line.saturating_sub(1), column.saturating_sub(1)))
    }

    /// Map a zero-based generated position to the original source, falling
    /// back to the generated position when no mapping applies.
    pub fn resolve_position(&mut self, path: &str, line: u32, column: u32) -> TestLocation {
        let loader = Arc::clone(&self.loader);
        let decoded = self
            .cache
            .entry(path.to_string())
            .or_insert_with(|| {
                loader
                    .load(path)
                    .map(|raw| DecodedSourceMap::decode(&raw, path))
            });
        if let Some(map) = decoded
            && let Some(original) = map.original_position_for(line, column)
        {
            return TestLocation::new(original.source, point_range(original.line, original.column));
        }
        TestLocation::new(path, point_range(line, column))
    }
}

fn point_range(line: u32, character: u32) -> Range {
    let position = Position { line, character };
    Range {
        start: position,
        end: position,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_simple_vlq_values() {
        // "A" = 0, "C" = 1, "D" = -1, "2H" = 123
        assert_eq!(decode_vlq(b"A", 0), Some((0, 1)));
        assert_eq!(decode_vlq(b"C", 0), Some((1, 1)));
        assert_eq!(decode_vlq(b"D", 0), Some((-1, 1)));
        assert_eq!(decode_vlq(b"2H", 0), Some((123, 2)));
        assert_eq!(decode_vlq(b"$", 0), None);
    }

    fn raw(mappings: &str, sources: &[&str]) -> RawSourceMap {
        RawSourceMap {
            version: 3,
            sources: sources.iter().map(ToString::to_string).collect(),
            source_root: None,
            names: vec![],
            mappings: mappings.to_string(),
        }
    }

    #[test]
    fn maps_generated_positions_to_original() {
        // Line 0: column 0 -> src 0 line 0 col 0, column 8 -> line 2 col 4.
        // "AAAA" = [0,0,0,0]; "QAEI" = [8,0,2,4].
        let map = DecodedSourceMap::decode(&raw("AAAA,QAEI", &["/src/a.ts"]), "/out/a.js");
        let first = map.original_position_for(0, 0).unwrap();
        assert_eq!(first.source, "/src/a.ts");
        assert_eq!((first.line, first.column), (0, 0));

        let second = map.original_position_for(0, 10).unwrap();
        assert_eq!((second.line, second.column), (2, 4));
    }

    #[test]
    fn relative_sources_resolve_against_generated_file() {
        let map = DecodedSourceMap::decode(&raw("AAAA", &["../src/a.ts"]), "/repo/out/a.js");
        let position = map.original_position_for(0, 0).unwrap();
        assert_eq!(position.source, "/repo/src/a.ts");
    }

    #[test]
    fn missing_line_yields_none() {
        let map = DecodedSourceMap::decode(&raw("AAAA", &["/src/a.ts"]), "/out/a.js");
        assert!(map.original_position_for(9, 0).is_none());
    }

    #[test]
    fn malformed_segments_are_skipped() {
        let map = DecodedSourceMap::decode(&raw("!!!!,AAAA", &["/src/a.ts"]), "/out/a.js");
        assert!(map.original_position_for(0, 0).is_some());
    }

    struct FixedLoader(RawSourceMap);

    impl SourceMapLoader for FixedLoader {
        fn load(&self, _path: &str) -> Option<RawSourceMap> {
            Some(self.0.clone())
        }
    }

    #[test]
    fn resolver_maps_stack_references_through_the_map() {
        let loader = FixedLoader(raw("AAAA;AAAA;AAAA;AAAA;AACA", &["/src/a.ts"]));
        let mut resolver = LocationResolver::new(Arc::new(loader));
        let stack = "Error: boom\n    at fn (file:///out/a.js:5:1)";
        let location = resolver.resolve_first_reference(stack).unwrap();
        assert_eq!(location.path, "/src/a.ts");
        assert_eq!(location.range.start.line, 1);
    }

    #[test]
    fn resolver_falls_back_to_generated_location_without_a_map() {
        let mut resolver = LocationResolver::new(Arc::new(NullSourceMapLoader));
        let location = resolver
            .resolve_first_reference("at file:///out/b.js:3:7")
            .unwrap();
        assert_eq!(location.path, "/out/b.js");
        assert_eq!(location.range.start.line, 2);
        assert_eq!(location.range.start.character, 6);
    }

    #[test]
    fn no_reference_means_no_location() {
        let mut resolver = LocationResolver::new(Arc::new(NullSourceMapLoader));
        assert!(resolver.resolve_first_reference("plain log line").is_none());
    }
}
