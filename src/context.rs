//! Compilation context: the shared variable store
//!
//! One [`Context`] lives for the duration of a compilation. The resolver
//! mutates it as `otk.define` blocks are processed; everything else reads
//! from it through dotted-path lookups.

use indexmap::IndexMap;
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, warn};

use crate::annotation::{AnnotatedValue, Value};
use crate::error::OtkError;

/// Each dot-separated segment of a variable name must look like this.
static VALID_VAR_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-zA-Z][a-zA-Z0-9_]*$").expect("valid regex"));

/// Check every segment of a dotted variable name.
pub fn validate_var_name(name: &str) -> Result<(), OtkError> {
    for part in name.split('.') {
        if !VALID_VAR_NAME.is_match(part) {
            return Err(OtkError::InvalidVariableName(format!(
                "invalid variable part '{part}' in '{name}', allowed [a-zA-Z][a-zA-Z0-9_]*"
            )));
        }
    }
    Ok(())
}

/// Shared state of one compilation: document version, requested target, and
/// the tree of defined variables.
#[derive(Debug, Default)]
pub struct Context {
    version: Option<i64>,
    target_requested: Option<String>,
    warn_duplicated_defs: bool,
    variables: IndexMap<String, AnnotatedValue>,
}

impl Context {
    pub fn new(target_requested: Option<String>, warn_duplicated_defs: bool) -> Self {
        Self {
            version: None,
            target_requested,
            warn_duplicated_defs,
            variables: IndexMap::new(),
        }
    }

    /// The target selected for this compilation, if any. A dry run (target
    /// discovery, `validate` without `-t`) has none.
    pub fn target_requested(&self) -> Option<&str> {
        self.target_requested.as_deref()
    }

    pub fn version(&self) -> Option<i64> {
        self.version
    }

    /// Record the document version. The first value sticks; seeing a
    /// different one later is an error, the same one is a no-op.
    pub fn set_version(&mut self, version: i64) -> Result<(), OtkError> {
        match self.version {
            Some(previous) if previous != version => Err(OtkError::VersionConflict {
                previous,
                new: version,
            }),
            _ => {
                self.version = Some(version);
                Ok(())
            }
        }
    }

    /// Bind `name` (dotted path) to `value`, creating intermediate mappings
    /// as needed. A non-mapping value sitting at an intermediate segment is
    /// replaced by a mapping.
    pub fn define(&mut self, name: &str, value: AnnotatedValue) -> Result<(), OtkError> {
        validate_var_name(name)?;
        debug!(name, "defining variable");

        let parts: Vec<&str> = name.split('.').collect();
        let mut current = &mut self.variables;
        for part in &parts[..parts.len() - 1] {
            let slot = current
                .entry(part.to_string())
                .or_insert_with(AnnotatedValue::mapping);
            current = slot.make_mapping_mut();
        }

        let last = parts[parts.len() - 1];
        if self.warn_duplicated_defs {
            if let Some(previous) = current.get(last) {
                if previous != &value {
                    warn!(
                        "redefinition of '{name}', previous value was '{previous}' and new value is '{value}'"
                    );
                }
            }
        }
        current.insert(last.to_string(), value);
        Ok(())
    }

    /// Merge a mapping of variables in at `name`.
    ///
    /// With an empty name the top level is updated directly (new keys win);
    /// otherwise this is a plain [`define`](Self::define).
    pub fn merge_defines_at(&mut self, name: &str, value: AnnotatedValue) -> Result<(), OtkError> {
        if name.is_empty() {
            match value.into_value() {
                Value::Mapping(map) => {
                    self.variables.extend(map);
                    Ok(())
                }
                other => Err(OtkError::DirectiveType(format!(
                    "defines to merge must be a mapping of variables, not a {}",
                    AnnotatedValue::new(other).kind()
                ))),
            }
        } else {
            self.define(name, value)
        }
    }

    /// Look up a dotted variable name.
    ///
    /// Mappings consume a segment as a key, sequences as a numeric index;
    /// anything else mid-path is an error naming the prefix walked so far.
    pub fn variable(&self, name: &str) -> Result<&AnnotatedValue, OtkError> {
        let mut found: Option<&AnnotatedValue> = None;
        let mut so_far = String::new();

        for part in name.split('.') {
            let prefix = so_far.clone();
            if !so_far.is_empty() {
                so_far.push('.');
            }
            so_far.push_str(part);

            let node = match found {
                None => {
                    found = Some(self.variables.get(part).ok_or_else(|| {
                        OtkError::VariableNotFound(format!(
                            "could not resolve '{name}' as '{part}' is not defined"
                        ))
                    })?);
                    continue;
                }
                Some(node) => node,
            };

            match node.value() {
                Value::Mapping(map) => {
                    found = Some(map.get(part).ok_or_else(|| {
                        OtkError::VariableNotFound(format!(
                            "could not resolve '{name}' as '{part}' is not defined"
                        ))
                    })?);
                }
                Value::Sequence(items) => {
                    let index: usize = part.parse().map_err(|_| {
                        OtkError::IndexNotNumeric(format!(
                            "tried to look up '{name}', but '{part}' is not a numeric index"
                        ))
                    })?;
                    found = Some(items.get(index).ok_or_else(|| {
                        OtkError::IndexOutOfRange(format!("{index} is out of range for {node}"))
                    })?);
                }
                _ => {
                    return Err(OtkError::NotIndexable(format!(
                        "tried to look up '{name}', but the value of prefix '{prefix}' is not a mapping but a {}",
                        node.kind()
                    )));
                }
            }
        }

        found.ok_or_else(|| {
            OtkError::VariableNotFound(format!(
                "could not resolve '{name}' as '{name}' is not defined"
            ))
        })
    }
}
