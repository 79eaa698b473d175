//! Error types with fix suggestions

use thiserror::Error;

/// Trait for errors that provide fix suggestions
pub trait FixSuggestion {
    fn fix_suggestion(&self) -> Option<&str>;
}

/// All error variants are part of the public API.
///
/// Messages are built at the raise site, already carrying location context
/// (either `file:line - ` from the offending value's `src` annotation or
/// `path: ` from the traversal state), so Display stays a plain passthrough
/// for most variants.
#[derive(Error, Debug)]
pub enum OtkError {
    // ─────────────────────────────────────────────────────────────
    // Parse-time errors
    // ─────────────────────────────────────────────────────────────
    #[error("{0}")]
    ParseType(String),

    #[error("{0}")]
    Parse(String),

    #[error("{0}")]
    Scan(String),

    #[error("{0}")]
    MissingVersion(String),

    #[error("duplicate but different version, previous {previous} and new {new}")]
    VersionConflict { previous: i64, new: i64 },

    #[error("{0}")]
    NoTargets(String),

    #[error("{0}")]
    DuplicatedYamlKey(String),

    // ─────────────────────────────────────────────────────────────
    // Traversal errors
    // ─────────────────────────────────────────────────────────────
    #[error("circular include detected:\n{0}")]
    CircularInclude(String),

    #[error("{0}")]
    IncludeNotFound(String),

    // ─────────────────────────────────────────────────────────────
    // Variable errors
    // ─────────────────────────────────────────────────────────────
    #[error("{0}")]
    InvalidVariableName(String),

    #[error("{0}")]
    VariableNotFound(String),

    #[error("{0}")]
    NotIndexable(String),

    #[error("{0}")]
    IndexNotNumeric(String),

    #[error("{0}")]
    IndexOutOfRange(String),

    // ─────────────────────────────────────────────────────────────
    // Directive errors
    // ─────────────────────────────────────────────────────────────
    #[error("{0}")]
    DirectiveType(String),

    #[error("{0}")]
    MissingArgument(String),

    #[error("{0}")]
    DirectiveSibling(String),

    #[error("{0}")]
    UnknownDirective(String),

    #[error("{0}")]
    OverrideNonEmpty(String),

    // ─────────────────────────────────────────────────────────────
    // External errors
    // ─────────────────────────────────────────────────────────────
    #[error("{0}")]
    ExecutableNotFound(String),

    #[error("{0}")]
    ExternalFailed(String),

    // ─────────────────────────────────────────────────────────────
    // Target errors
    // ─────────────────────────────────────────────────────────────
    #[error("{0}")]
    TargetShape(String),

    #[error("{0}")]
    TargetReservedKey(String),

    #[error("{0}")]
    TargetNotFound(String),

    #[error("{0}")]
    MultipleTargets(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl OtkError {
    /// Prefix the message with a location.
    ///
    /// Variable errors are raised by the context, which does not know which
    /// file is being resolved; the resolver re-locates them on the way out.
    pub(crate) fn locate(self, prefix: &str) -> Self {
        use OtkError::*;
        if prefix.is_empty() {
            return self;
        }
        match self {
            InvalidVariableName(m) => InvalidVariableName(format!("{prefix}: {m}")),
            VariableNotFound(m) => VariableNotFound(format!("{prefix}: {m}")),
            NotIndexable(m) => NotIndexable(format!("{prefix}: {m}")),
            IndexNotNumeric(m) => IndexNotNumeric(format!("{prefix}: {m}")),
            IndexOutOfRange(m) => IndexOutOfRange(format!("{prefix}: {m}")),
            other => other,
        }
    }
}

impl FixSuggestion for OtkError {
    fn fix_suggestion(&self) -> Option<&str> {
        match self {
            OtkError::Scan(_) => Some("Check YAML syntax: indentation and quoting"),
            OtkError::MissingVersion(_) => Some("Add 'otk.version: 1' at the top of the omnifest"),
            OtkError::NoTargets(_) => Some("Add at least one 'otk.target.<kind>.<name>' block"),
            OtkError::DuplicatedYamlKey(_) => {
                Some("Rename one of the keys; repeated directives take a .<uniq-tag> suffix")
            }
            OtkError::CircularInclude(_) => {
                Some("Remove one of the includes in the reported chain")
            }
            OtkError::InvalidVariableName(_) => {
                Some("Variable names are dotted identifiers: letters first, then letters, digits, or _")
            }
            OtkError::ExecutableNotFound(_) => {
                Some("Set OTK_EXTERNAL_PATH to the directory holding your external commands")
            }
            OtkError::MultipleTargets(_) => {
                Some("Pass -t/--target to pick one of the targets in the omnifest")
            }
            OtkError::TargetNotFound(_) => {
                Some("List available targets with 'otk validate' and check the -t spelling")
            }
            OtkError::Io(_) => Some("Check file path and permissions"),
            _ => None,
        }
    }
}
