//! Annotated YAML loading
//!
//! Builds one [`AnnotatedValue`] per YAML node from yaml-rust2's marked event
//! stream, so every node carries the file, line and column it came from.
//! Plain `serde`-style deserialization cannot do this, which is why parsing
//! happens at the event level.

use std::fs;
use std::path::{Path, PathBuf};

use yaml_rust2::parser::{Event, MarkedEventReceiver, Parser};
use yaml_rust2::scanner::{Marker, ScanError, TScalarStyle};

use crate::annotation::{AnnotatedValue, SourceSpan, Value};
use crate::error::OtkError;

/// Loads YAML files into annotated trees.
///
/// `base` is stripped from file paths when rendering annotation filenames,
/// keeping diagnostics readable when inputs live under a long prefix. Paths
/// outside `base` pass through unchanged.
#[derive(Debug, Clone, Default)]
pub struct Loader {
    base: PathBuf,
}

impl Loader {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    pub fn load_path(&self, path: &Path) -> Result<AnnotatedValue, OtkError> {
        let content = fs::read_to_string(path)?;
        self.load_str(&content, path)
    }

    /// Parse `content`, annotating nodes as coming from `path`.
    ///
    /// An empty document yields a Null node; the caller decides whether that
    /// is acceptable.
    pub fn load_str(&self, content: &str, path: &Path) -> Result<AnnotatedValue, OtkError> {
        let display = self.display_name(path);
        let mut parser = Parser::new_from_str(content);
        let mut builder = TreeBuilder::new(&display);
        let scanned = parser.load(&mut builder, false);
        builder.finish(scanned)
    }

    fn display_name(&self, path: &Path) -> String {
        path.strip_prefix(&self.base)
            .unwrap_or(path)
            .display()
            .to_string()
    }
}

/// One mapping entry under construction. `value` stays `None` between the
/// key event and the value event.
struct MapEntry {
    key: String,
    key_span: SourceSpan,
    value: Option<AnnotatedValue>,
}

enum BuildNode {
    Sequence {
        start: Marker,
        items: Vec<AnnotatedValue>,
    },
    Mapping {
        start: Marker,
        entries: Vec<MapEntry>,
    },
}

/// Event receiver that assembles the annotated tree.
///
/// `on_event` cannot return errors, so the first structural problem
/// (duplicate key, alias, complex key) is parked in `error` and reported
/// by [`TreeBuilder::finish`]; events after that point only keep the stack
/// balanced.
struct TreeBuilder<'a> {
    filename: &'a str,
    stack: Vec<BuildNode>,
    root: Option<AnnotatedValue>,
    error: Option<OtkError>,
}

impl<'a> TreeBuilder<'a> {
    fn new(filename: &'a str) -> Self {
        Self {
            filename,
            stack: Vec::new(),
            root: None,
            error: None,
        }
    }

    fn finish(mut self, scanned: Result<(), ScanError>) -> Result<AnnotatedValue, OtkError> {
        // A structural error always precedes a later scanner error in the
        // stream, so it wins when both are present.
        if let Some(err) = self.error.take() {
            return Err(err);
        }
        scanned.map_err(|err| OtkError::Scan(format!("{}: {err}", self.filename)))?;
        Ok(self.root.unwrap_or_else(AnnotatedValue::null))
    }

    fn fail(&mut self, err: OtkError) {
        if self.error.is_none() {
            self.error = Some(err);
        }
    }

    /// Next scalar lands in key position of the innermost mapping?
    fn at_key_position(&self) -> bool {
        match self.stack.last() {
            Some(BuildNode::Mapping { entries, .. }) => {
                entries.last().is_none_or(|entry| entry.value.is_some())
            }
            _ => false,
        }
    }

    fn span(&self, start: &Marker, line_end: usize, column_end: usize) -> SourceSpan {
        SourceSpan {
            file: self.filename.to_string(),
            line: start.line(),
            line_end,
            column: start.col() + 1,
            column_end,
        }
    }

    /// Span of a scalar given only its start marker.
    // TODO: compute the real end from the source text for quoted and block
    // scalars; this assumes the scalar sits on one line as written.
    fn scalar_span(&self, marker: &Marker, text: &str) -> SourceSpan {
        self.span(
            marker,
            marker.line(),
            marker.col() + 1 + text.chars().count(),
        )
    }

    fn begin_entry(&mut self, key: String, key_span: SourceSpan) {
        let Some(BuildNode::Mapping { entries, .. }) = self.stack.last_mut() else {
            return;
        };
        let duplicate = entries.iter().any(|entry| entry.key == key);
        entries.push(MapEntry {
            key: key.clone(),
            key_span,
            value: None,
        });
        // The entry is recorded either way; reporting needs `&mut self`
        // again, so it happens after the stack borrow ends.
        if duplicate {
            let mut msg = format!("{}: duplicated '{key}' key found", self.filename);
            if key.contains("otk.") {
                msg.push_str(&format!(
                    ", try using {key}.<uniq-tag>, e.g. {key}.foo"
                ));
            }
            self.fail(OtkError::DuplicatedYamlKey(msg));
        }
    }

    fn push_complete(&mut self, node: AnnotatedValue) {
        match self.stack.last_mut() {
            None => self.root = Some(node),
            Some(BuildNode::Sequence { items, .. }) => items.push(node),
            Some(BuildNode::Mapping { entries, .. }) => {
                match entries.last_mut() {
                    Some(entry) if entry.value.is_none() => entry.value = Some(node),
                    // Key position; only reachable for containers, scalars
                    // take the begin_entry path. The error was already
                    // recorded at the container's start event.
                    _ => {}
                }
            }
        }
    }

    fn annotated(&self, value: Value, span: &SourceSpan) -> AnnotatedValue {
        let mut node = AnnotatedValue::new(value);
        // content_ attributes always describe the node's own extent; the
        // plain set is overwritten by the owning key's span once the parent
        // mapping completes.
        node.add_source_attributes(span, "content_");
        node.add_source_attributes(span, "");
        node
    }

    fn reject_container_key(&mut self, marker: &Marker) {
        let span = self.span(marker, marker.line(), marker.col() + 1);
        self.fail(OtkError::Parse(format!(
            "{} - mapping keys must be scalars",
            span_src(&span)
        )));
    }
}

fn span_src(span: &SourceSpan) -> String {
    format!("{}:{}", span.file, span.line)
}

/// YAML 1.1 style scalar typing for plain scalars; quoted and block scalars
/// are always strings.
fn scalar_value(text: &str, style: TScalarStyle) -> Value {
    if !matches!(style, TScalarStyle::Plain) {
        return Value::String(text.to_string());
    }
    match text {
        "" | "~" | "null" | "Null" | "NULL" => return Value::Null,
        "true" | "True" | "TRUE" | "yes" | "Yes" | "YES" | "on" | "On" | "ON" => {
            return Value::Bool(true)
        }
        "false" | "False" | "FALSE" | "no" | "No" | "NO" | "off" | "Off" | "OFF" => {
            return Value::Bool(false)
        }
        _ => {}
    }
    if let Ok(i) = text.parse::<i64>() {
        return Value::Int(i);
    }
    if let Ok(f) = text.parse::<f64>() {
        return Value::Float(f);
    }
    Value::String(text.to_string())
}

impl MarkedEventReceiver for TreeBuilder<'_> {
    fn on_event(&mut self, ev: Event, marker: Marker) {
        match ev {
            Event::Nothing
            | Event::StreamStart
            | Event::StreamEnd
            | Event::DocumentStart
            | Event::DocumentEnd => {}

            Event::Scalar(text, style, _, _) => {
                if self.at_key_position() {
                    // Keys keep their literal spelling, `5:` stays "5".
                    let span = self.scalar_span(&marker, &text);
                    self.begin_entry(text, span);
                } else {
                    let span = self.scalar_span(&marker, &text);
                    let node = self.annotated(scalar_value(&text, style), &span);
                    self.push_complete(node);
                }
            }

            Event::Alias(_) => {
                self.fail(OtkError::Parse(format!(
                    "{}: YAML anchors and aliases are not supported",
                    self.filename
                )));
                // Keep the structure well formed so later events still pair.
                let span = self.scalar_span(&marker, "");
                let node = self.annotated(Value::Null, &span);
                if self.at_key_position() {
                    self.begin_entry(String::new(), span);
                } else {
                    self.push_complete(node);
                }
            }

            Event::SequenceStart(_, _) => {
                if self.at_key_position() {
                    self.reject_container_key(&marker);
                }
                self.stack.push(BuildNode::Sequence {
                    start: marker,
                    items: Vec::new(),
                });
            }

            Event::SequenceEnd => {
                let Some(BuildNode::Sequence { start, items }) = self.stack.pop() else {
                    return;
                };
                let span = self.span(&start, marker.line(), marker.col() + 1);
                let node = self.annotated(Value::Sequence(items), &span);
                self.push_complete(node);
            }

            Event::MappingStart(_, _) => {
                if self.at_key_position() {
                    self.reject_container_key(&marker);
                }
                self.stack.push(BuildNode::Mapping {
                    start: marker,
                    entries: Vec::new(),
                });
            }

            Event::MappingEnd => {
                let Some(BuildNode::Mapping { start, entries }) = self.stack.pop() else {
                    return;
                };
                let mut map = indexmap::IndexMap::new();
                for entry in entries {
                    let mut value = entry.value.unwrap_or_else(AnnotatedValue::null);
                    // Values report the line of their key, which is where a
                    // reader looks first.
                    value.add_source_attributes(&entry.key_span, "");
                    map.insert(entry.key, value);
                }
                let span = self.span(&start, marker.line(), marker.col() + 1);
                let node = self.annotated(Value::Mapping(map), &span);
                self.push_complete(node);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn load(content: &str) -> AnnotatedValue {
        Loader::default()
            .load_str(content, Path::new("test.yaml"))
            .unwrap()
    }

    #[test]
    fn scalar_typing() {
        let tree = load("a: 1\nb: yes\nc: '1'\nd: 1.5\ne: ~\nf: hello");
        let map = tree.as_mapping().unwrap();
        assert_eq!(map["a"].value(), &Value::Int(1));
        assert_eq!(map["b"].value(), &Value::Bool(true));
        assert_eq!(map["c"].value(), &Value::String("1".into()));
        assert_eq!(map["d"].value(), &Value::Float(1.5));
        assert_eq!(map["e"].value(), &Value::Null);
        assert_eq!(map["f"].value(), &Value::String("hello".into()));
    }

    #[test]
    fn values_carry_key_spans() {
        let tree = load("a: 1\nb:\n  c: 2");
        let map = tree.as_mapping().unwrap();

        assert_eq!(map["a"].annotation("src"), Some("test.yaml:1"));
        assert_eq!(map["a"].annotation("line_number"), Some("1"));
        assert_eq!(map["a"].annotation("column"), Some("1"));
        // The value's own extent stays in the content_ attributes.
        assert_eq!(map["a"].annotation("content_column"), Some("4"));

        assert_eq!(map["b"].annotation("src"), Some("test.yaml:2"));
        let inner = map["b"].as_mapping().unwrap();
        assert_eq!(inner["c"].annotation("src"), Some("test.yaml:3"));
        assert_eq!(inner["c"].annotation("column"), Some("3"));
    }

    #[test]
    fn sequence_reports_key_line() {
        let tree = load("xs:\n  - 1\n  - two");
        let map = tree.as_mapping().unwrap();
        let xs = &map["xs"];
        assert_eq!(xs.annotation("src"), Some("test.yaml:1"));
        assert_eq!(xs.annotation("content_src"), Some("test.yaml:2"));

        let items = xs.as_sequence().unwrap();
        assert_eq!(items[0].value(), &Value::Int(1));
        assert_eq!(items[1].value(), &Value::String("two".into()));
        assert_eq!(items[1].annotation("src"), Some("test.yaml:3"));
    }

    #[test]
    fn duplicate_key_rejected() {
        let err = Loader::default()
            .load_str("a: 1\na: 2", Path::new("test.yaml"))
            .unwrap_err();
        assert_eq!(err.to_string(), "test.yaml: duplicated 'a' key found");
    }

    #[test]
    fn duplicate_key_after_other_entries_detected() {
        let err = Loader::default()
            .load_str("a: 1\nb: 2\nb: 3\nc: 4", Path::new("test.yaml"))
            .unwrap_err();
        assert_eq!(err.to_string(), "test.yaml: duplicated 'b' key found");
    }

    #[test]
    fn duplicate_directive_key_suggests_uniq_tag() {
        let err = Loader::default()
            .load_str("otk.define: {}\notk.define: {}", Path::new("test.yaml"))
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "test.yaml: duplicated 'otk.define' key found, \
             try using otk.define.<uniq-tag>, e.g. otk.define.foo"
        );
    }

    #[test]
    fn empty_document_is_null() {
        assert!(load("").is_null());
        assert!(load("# only a comment\n").is_null());
    }

    #[test]
    fn aliases_rejected() {
        let err = Loader::default()
            .load_str("a: &x 1\nb: *x", Path::new("test.yaml"))
            .unwrap_err();
        assert!(matches!(err, OtkError::Parse(_)));
        assert!(err.to_string().contains("aliases are not supported"));
    }

    #[test]
    fn non_string_keys_keep_their_spelling() {
        let tree = load("5: five\ntrue: yes");
        let map = tree.as_mapping().unwrap();
        assert!(map.contains_key("5"));
        assert!(map.contains_key("true"));
    }

    #[test]
    fn scan_error_names_the_file() {
        let err = Loader::default()
            .load_str("a: [1, 2", Path::new("test.yaml"))
            .unwrap_err();
        assert!(matches!(err, OtkError::Scan(_)));
        assert!(err.to_string().starts_with("test.yaml:"));
    }

    #[test]
    fn base_prefix_stripped_from_filenames() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("omnifest.yaml");
        std::fs::write(&path, "a: 1\n").unwrap();

        let tree = Loader::new(dir.path()).load_path(&path).unwrap();
        let map = tree.as_mapping().unwrap();
        assert_eq!(map["a"].annotation("filename"), Some("omnifest.yaml"));
    }

    #[test]
    fn missing_file_is_io_error() {
        let err = Loader::default()
            .load_path(Path::new("does-not-exist.yaml"))
            .unwrap_err();
        assert!(matches!(err, OtkError::Io(_)));
    }
}
