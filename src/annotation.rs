//! Annotated value model
//!
//! Every node of a loaded omnifest is an [`AnnotatedValue`]: the payload
//! (mapping, sequence, or scalar) plus a bag of string annotations carrying
//! source locations and provenance. Annotations ride along through every
//! transformation so diagnostics can always point at real file/line input,
//! and are stripped in one go when the final manifest is dumped.

use std::fmt;
use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use serde::ser::{Serialize, SerializeMap, SerializeSeq, Serializer};

/// Annotation keys and values are plain strings; insertion order is kept so
/// dumped diagnostics stay stable.
pub type Annotations = IndexMap<String, String>;

/// Source span reported by the loader for one YAML node.
///
/// `file` arrives already normalized for display. Lines are 1-based, columns
/// 1-based.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceSpan {
    pub file: String,
    pub line: usize,
    pub line_end: usize,
    pub column: usize,
    pub column_end: usize,
}

/// The payload of an annotated node.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Path(PathBuf),
    Sequence(Vec<AnnotatedValue>),
    Mapping(IndexMap<String, AnnotatedValue>),
}

/// A value plus its annotations.
///
/// Equality is structural over the payload only; two nodes with the same data
/// but different provenance compare equal.
#[derive(Debug, Clone)]
pub struct AnnotatedValue {
    value: Value,
    annotations: Annotations,
}

impl PartialEq for AnnotatedValue {
    fn eq(&self, other: &Self) -> bool {
        self.value == other.value
    }
}

impl AnnotatedValue {
    pub fn new(value: Value) -> Self {
        Self {
            value,
            annotations: Annotations::new(),
        }
    }

    /// An empty annotated mapping.
    pub fn mapping() -> Self {
        Self::new(Value::Mapping(IndexMap::new()))
    }

    pub fn null() -> Self {
        Self::new(Value::Null)
    }

    /// Recursively wrap a plain JSON-shaped value; annotations start empty.
    pub fn from_raw(raw: serde_json::Value) -> Self {
        match raw {
            serde_json::Value::Null => Self::null(),
            serde_json::Value::Bool(b) => Self::new(Value::Bool(b)),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Self::new(Value::Int(i))
                } else {
                    Self::new(Value::Float(n.as_f64().unwrap_or(f64::NAN)))
                }
            }
            serde_json::Value::String(s) => Self::new(Value::String(s)),
            serde_json::Value::Array(items) => Self::new(Value::Sequence(
                items.into_iter().map(Self::from_raw).collect(),
            )),
            serde_json::Value::Object(map) => Self::new(Value::Mapping(
                map.into_iter()
                    .map(|(k, v)| (k, Self::from_raw(v)))
                    .collect(),
            )),
        }
    }

    /// Convert any node into a Path node, absorbing its annotations.
    ///
    /// A Path never wraps another Path; strings become paths, paths stay as
    /// they are, and anything else becomes a path of its display form.
    pub fn into_path(self) -> Self {
        let annotations = self.annotations;
        let path = match self.value {
            Value::Path(p) => p,
            Value::String(s) => PathBuf::from(s),
            other => PathBuf::from(AnnotatedValue::new(other).to_string()),
        };
        Self {
            value: Value::Path(path),
            annotations,
        }
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    pub fn value_mut(&mut self) -> &mut Value {
        &mut self.value
    }

    pub fn into_value(self) -> Value {
        self.value
    }

    /// A short noun for error messages.
    pub fn kind(&self) -> &'static str {
        match &self.value {
            Value::Null => "null",
            Value::Bool(_) => "boolean",
            Value::Int(_) => "integer",
            Value::Float(_) => "float",
            Value::String(_) => "string",
            Value::Path(_) => "path",
            Value::Sequence(_) => "sequence",
            Value::Mapping(_) => "mapping",
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self.value, Value::Null)
    }

    pub fn is_string(&self) -> bool {
        matches!(self.value, Value::String(_))
    }

    pub fn is_mapping(&self) -> bool {
        matches!(self.value, Value::Mapping(_))
    }

    pub fn is_sequence(&self) -> bool {
        matches!(self.value, Value::Sequence(_))
    }

    pub fn as_str(&self) -> Option<&str> {
        match &self.value {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match &self.value {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_path(&self) -> Option<&Path> {
        match &self.value {
            Value::Path(p) => Some(p),
            _ => None,
        }
    }

    pub fn as_sequence(&self) -> Option<&Vec<AnnotatedValue>> {
        match &self.value {
            Value::Sequence(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_mapping(&self) -> Option<&IndexMap<String, AnnotatedValue>> {
        match &self.value {
            Value::Mapping(map) => Some(map),
            _ => None,
        }
    }

    pub fn as_mapping_mut(&mut self) -> Option<&mut IndexMap<String, AnnotatedValue>> {
        match &mut self.value {
            Value::Mapping(map) => Some(map),
            _ => None,
        }
    }

    /// The mapping payload, replacing the value with an empty mapping first
    /// when it is anything else.
    pub fn make_mapping_mut(&mut self) -> &mut IndexMap<String, AnnotatedValue> {
        if !self.is_mapping() {
            self.value = Value::Mapping(IndexMap::new());
        }
        match &mut self.value {
            Value::Mapping(map) => map,
            _ => unreachable!("value was just made a mapping"),
        }
    }

    pub fn annotations(&self) -> &Annotations {
        &self.annotations
    }

    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.annotations.get(key).map(String::as_str)
    }

    /// The `src` annotation, when the node has one.
    pub fn src(&self) -> Option<&str> {
        self.annotation("src")
    }

    pub fn set_annotation(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.annotations.insert(key.into(), value.into());
    }

    pub fn set_annotations(&mut self, annotations: Annotations) {
        self.annotations = annotations;
    }

    pub fn with_annotations(mut self, annotations: Annotations) -> Self {
        self.annotations = annotations;
        self
    }

    /// Populate the standard source attributes from a loader span.
    ///
    /// `prefix` distinguishes node-level attributes (empty prefix, later
    /// overwritten by the owning key's span for mapping values) from
    /// `content_` attributes, which always describe the node's own extent.
    pub fn add_source_attributes(&mut self, span: &SourceSpan, prefix: &str) {
        self.annotations.insert(
            format!("{prefix}src"),
            format!("{}:{}", span.file, span.line),
        );
        self.annotations
            .insert(format!("{prefix}filename"), span.file.clone());
        self.annotations
            .insert(format!("{prefix}line_number"), span.line.to_string());
        self.annotations.insert(
            format!("{prefix}line_number_end"),
            span.line_end.to_string(),
        );
        self.annotations
            .insert(format!("{prefix}column"), span.column.to_string());
        self.annotations
            .insert(format!("{prefix}column_end"), span.column_end.to_string());
    }

    /// Merge the annotations of several source nodes into one map.
    ///
    /// `src` entries are grouped per filename, line lists deduplicated, and
    /// rendered as a bullet list (one bullet per file, even for a single
    /// file). Other keys keep their first value; a value differing from the
    /// accumulated string is appended with `", "`. The comparison is against
    /// the whole accumulated string, so a repeat only collapses while the
    /// slot holds exactly that value; after one collision it appends again.
    /// The result depends on input order in the order and number of those
    /// concatenations.
    pub fn squash_annotations(nodes: &[&AnnotatedValue]) -> Annotations {
        let mut out = Annotations::new();
        let mut sources: IndexMap<String, Vec<String>> = IndexMap::new();

        for node in nodes {
            for (key, value) in node.annotations() {
                if key == "src" {
                    let (file, lines) = value.split_once(':').unwrap_or((value.as_str(), ""));
                    let entry = sources.entry(file.to_string()).or_default();
                    if !entry.iter().any(|l| l == lines) {
                        entry.push(lines.to_string());
                    }
                } else {
                    match out.get_mut(key) {
                        Some(existing) => {
                            if existing != value {
                                existing.push_str(", ");
                                existing.push_str(value);
                            }
                        }
                        None => {
                            out.insert(key.clone(), value.clone());
                        }
                    }
                }
            }
        }

        if !sources.is_empty() {
            let rendered = sources
                .iter()
                .map(|(file, lines)| format!("* {}:{}", file, lines.join(", ")))
                .collect::<Vec<_>>()
                .join("\n");
            out.insert("src".to_string(), rendered);
        }
        out
    }

    /// Strip annotations, producing a plain value tree.
    ///
    /// Mapping entries whose value is Null are dropped.
    pub fn deep_dump(&self) -> serde_json::Value {
        match &self.value {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Int(i) => serde_json::Value::from(*i),
            Value::Float(f) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::String(s) => serde_json::Value::String(s.clone()),
            Value::Path(p) => serde_json::Value::String(p.display().to_string()),
            Value::Sequence(items) => {
                serde_json::Value::Array(items.iter().map(AnnotatedValue::deep_dump).collect())
            }
            Value::Mapping(map) => {
                let mut out = serde_json::Map::new();
                for (key, value) in map {
                    if !value.is_null() {
                        out.insert(key.clone(), value.deep_dump());
                    }
                }
                serde_json::Value::Object(out)
            }
        }
    }
}

/// Serializes like [`AnnotatedValue::deep_dump`]: payload only, null mapping
/// entries dropped.
impl Serialize for AnnotatedValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match &self.value {
            Value::Null => serializer.serialize_unit(),
            Value::Bool(b) => serializer.serialize_bool(*b),
            Value::Int(i) => serializer.serialize_i64(*i),
            Value::Float(f) => serializer.serialize_f64(*f),
            Value::String(s) => serializer.serialize_str(s),
            Value::Path(p) => serializer.serialize_str(&p.display().to_string()),
            Value::Sequence(items) => {
                let mut seq = serializer.serialize_seq(Some(items.len()))?;
                for item in items {
                    seq.serialize_element(item)?;
                }
                seq.end()
            }
            Value::Mapping(map) => {
                let mut m = serializer.serialize_map(None)?;
                for (key, value) in map {
                    if !value.is_null() {
                        m.serialize_entry(key, value)?;
                    }
                }
                m.end()
            }
        }
    }
}

/// Strings display bare (they interpolate into messages constantly); other
/// payloads display as compact JSON.
impl fmt::Display for AnnotatedValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.value {
            Value::String(s) => f.write_str(s),
            Value::Path(p) => write!(f, "{}", p.display()),
            _ => write!(f, "{}", self.deep_dump()),
        }
    }
}

impl From<Value> for AnnotatedValue {
    fn from(value: Value) -> Self {
        Self::new(value)
    }
}

impl From<&str> for AnnotatedValue {
    fn from(s: &str) -> Self {
        Self::new(Value::String(s.to_string()))
    }
}

impl From<String> for AnnotatedValue {
    fn from(s: String) -> Self {
        Self::new(Value::String(s))
    }
}

impl From<i64> for AnnotatedValue {
    fn from(i: i64) -> Self {
        Self::new(Value::Int(i))
    }
}

impl From<f64> for AnnotatedValue {
    fn from(f: f64) -> Self {
        Self::new(Value::Float(f))
    }
}

impl From<bool> for AnnotatedValue {
    fn from(b: bool) -> Self {
        Self::new(Value::Bool(b))
    }
}

impl From<PathBuf> for AnnotatedValue {
    fn from(p: PathBuf) -> Self {
        Self::new(Value::Path(p))
    }
}

impl From<&Path> for AnnotatedValue {
    fn from(p: &Path) -> Self {
        Self::new(Value::Path(p.to_path_buf()))
    }
}

impl From<Vec<AnnotatedValue>> for AnnotatedValue {
    fn from(items: Vec<AnnotatedValue>) -> Self {
        Self::new(Value::Sequence(items))
    }
}

impl From<IndexMap<String, AnnotatedValue>> for AnnotatedValue {
    fn from(map: IndexMap<String, AnnotatedValue>) -> Self {
        Self::new(Value::Mapping(map))
    }
}
