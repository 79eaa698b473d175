//! Traversal state threaded through resolution
//!
//! [`State`] tracks where the resolver currently is: the file being
//! resolved, the chain of includes that led there, and the dotted subkey
//! prefix inside nested `otk.define` blocks. States are immutable values;
//! the only way to get a different one is through the `with_*` constructors,
//! which is what makes the include chain trustworthy for cycle detection.

use std::path::{Path, PathBuf};

use crate::annotation::AnnotatedValue;
use crate::error::OtkError;

#[derive(Debug, Clone)]
pub struct State {
    /// Path of the file currently being resolved; always a Path node.
    path: AnnotatedValue,
    /// Dotted prefix accumulated inside nested define blocks.
    define_subkeys: Vec<String>,
    /// Files already entered on this branch, in include order.
    includes: Vec<AnnotatedValue>,
}

impl Default for State {
    fn default() -> Self {
        Self::new("")
    }
}

impl State {
    /// Root state for a file. An empty path (stdin, unit tests) starts with
    /// an empty include chain; anything else seeds the chain with itself so
    /// a file including itself is already a cycle.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let node = AnnotatedValue::from(path.into());
        let includes = if node.as_path().is_some_and(|p| p.as_os_str().is_empty()) {
            Vec::new()
        } else {
            vec![node.clone()]
        };
        Self {
            path: node,
            define_subkeys: Vec::new(),
            includes,
        }
    }

    pub fn path(&self) -> &Path {
        self.path.as_path().unwrap_or_else(|| Path::new(""))
    }

    /// The current file rendered for error prefixes; empty at the root.
    pub fn path_display(&self) -> String {
        self.path().display().to_string()
    }

    pub fn includes(&self) -> &[AnnotatedValue] {
        &self.includes
    }

    /// Enter `path` (normally an annotated include value carrying its own
    /// provenance). Fails when the path is already on the include chain,
    /// rendering the whole chain.
    pub fn with_path(&self, path: AnnotatedValue) -> Result<Self, OtkError> {
        let path = path.into_path();
        if self.includes.iter().any(|seen| seen == &path) {
            let chain: Vec<String> = self
                .includes
                .iter()
                .chain(std::iter::once(&path))
                .map(render_include)
                .collect();
            return Err(OtkError::CircularInclude(chain.join(" ->\n")));
        }

        let mut next = self.clone();
        next.includes.push(path.clone());
        next.path = path;
        Ok(next)
    }

    /// Extend the define-subkey prefix by one segment.
    pub fn with_subkey(&self, key: &str) -> Self {
        let mut next = self.clone();
        next.define_subkeys.push(key.to_string());
        next
    }

    /// The dotted define prefix, optionally extended by `extra`.
    pub fn define_subkey(&self, extra: Option<&str>) -> String {
        let mut parts: Vec<&str> = self.define_subkeys.iter().map(String::as_str).collect();
        if let Some(extra) = extra {
            parts.push(extra);
        }
        parts.join(".")
    }
}

/// One include-chain entry with its provenance when it has one.
fn render_include(path: &AnnotatedValue) -> String {
    match path.src() {
        Some(src) => format!("{path} (included from {src})"),
        None => path.to_string(),
    }
}
