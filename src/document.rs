//! Omnifest documents
//!
//! An [`Omnifest`] is the result of loading and resolving one or more input
//! sources against a shared variable context. The CLI runs this twice: once
//! without a target to discover what the document offers, then again with
//! the selected target to produce output.

use std::path::PathBuf;

use indexmap::IndexMap;
use tracing::{debug, info};

use crate::annotation::{AnnotatedValue, Value};
use crate::constant::{NAME_VERSION, PREFIX, PREFIX_TARGET};
use crate::context::Context;
use crate::error::OtkError;
use crate::external::SearchPaths;
use crate::loader::Loader;
use crate::target::registry;
use crate::transform::{record_version, target_matches, Resolver};
use crate::traversal::State;

/// One omnifest input.
///
/// `Literal` carries content read elsewhere (standard input, tests) under a
/// display name; relative includes inside it resolve against the current
/// directory.
#[derive(Debug, Clone)]
pub enum Source {
    File(PathBuf),
    Literal { name: String, content: String },
}

impl Source {
    pub fn stdin(content: String) -> Self {
        Self::Literal {
            name: "<stdin>".to_string(),
            content,
        }
    }
}

/// Everything the entry point decides before a compilation starts.
#[derive(Debug, Default)]
pub struct CompileOptions {
    /// The target to resolve; `None` is a dry run that skips target blocks
    /// and externals.
    pub target: Option<String>,
    /// Warn when an `otk.define` overwrites an existing variable.
    pub warn_duplicated_defs: bool,
    /// Where external commands are looked up.
    pub externals: SearchPaths,
    /// Stripped from file paths in diagnostics.
    pub base: PathBuf,
}

/// A fully resolved omnifest.
#[derive(Debug)]
pub struct Omnifest {
    root: IndexMap<String, AnnotatedValue>,
    target_requested: Option<String>,
}

impl Omnifest {
    /// Load and resolve `sources` in order against one shared context.
    ///
    /// Earlier sources resolve first, so `-e` preload files can define
    /// variables the main document uses; their root entries are overridden
    /// by later sources on key collision.
    pub fn load(sources: &[Source], options: &CompileOptions) -> Result<Self, OtkError> {
        let loader = Loader::new(&options.base);
        let mut ctx = Context::new(options.target.clone(), options.warn_duplicated_defs);
        let mut root: IndexMap<String, AnnotatedValue> = IndexMap::new();

        for source in sources {
            let (tree, state) = match source {
                Source::File(path) => {
                    debug!(path = %path.display(), "loading omnifest");
                    (loader.load_path(path)?, State::new(path.clone()))
                }
                Source::Literal { name, content } => {
                    debug!(name, "loading omnifest");
                    (
                        loader.load_str(content, std::path::Path::new(name))?,
                        State::new(name.clone()),
                    )
                }
            };

            ensure_omnifest_shape(&tree)?;
            record_version(&mut ctx, &state, &tree)?;

            let resolved =
                Resolver::new(&mut ctx, &loader, &options.externals).resolve(&state, tree)?;
            match resolved.into_value() {
                Value::Mapping(map) => root.extend(map),
                other => {
                    return Err(OtkError::ParseType(format!(
                        "omnifest resolved to a {} instead of a mapping",
                        AnnotatedValue::new(other).kind()
                    )))
                }
            }
        }

        if ctx.version().is_none() {
            return Err(OtkError::MissingVersion(format!(
                "omnifest must contain a key by the name of '{NAME_VERSION}'"
            )));
        }
        let doc = Self {
            root,
            target_requested: options.target.clone(),
        };
        if doc.targets().is_empty() {
            return Err(OtkError::NoTargets(format!(
                "omnifest must contain at least one key by the name of '{PREFIX_TARGET}*'"
            )));
        }
        info!(targets = ?doc.targets(), "omnifest resolved");
        Ok(doc)
    }

    /// Target names present in the document, in document order.
    pub fn targets(&self) -> Vec<String> {
        let mut seen: Vec<String> = Vec::new();
        for key in self.root.keys() {
            if let Some(suffix) = key.strip_prefix(PREFIX_TARGET) {
                if !seen.iter().any(|s| s == suffix) {
                    seen.push(suffix.to_string());
                }
            }
        }
        seen
    }

    /// The resolved document root.
    pub fn tree(&self) -> &IndexMap<String, AnnotatedValue> {
        &self.root
    }

    /// Render the requested target through its renderer.
    ///
    /// Picks the first target block matching the requested name in document
    /// order; the kind segment after `otk.target.` selects the renderer.
    pub fn as_target_string(&self) -> Result<String, OtkError> {
        let requested = self.target_requested.as_deref().ok_or_else(|| {
            OtkError::TargetNotFound("no target was requested for this compilation".to_string())
        })?;

        let (suffix, tree) = self
            .root
            .iter()
            .find_map(|(key, value)| {
                key.strip_prefix(PREFIX_TARGET)
                    .filter(|suffix| target_matches(requested, suffix))
                    .map(|suffix| (suffix, value))
            })
            .ok_or_else(|| {
                OtkError::TargetNotFound(format!(
                    "requested target '{requested}' does not exist in INPUT"
                ))
            })?;

        let kind = suffix.split('.').next().unwrap_or(suffix);
        let target = registry(kind);
        target.ensure_valid(tree)?;
        target.as_string(tree, true)
    }
}

/// Select the target to compile given what the document offers.
///
/// Without an explicit request a single available target is implied;
/// multiple targets require `-t`.
pub fn select_target(
    available: &[String],
    requested: Option<&str>,
) -> Result<String, OtkError> {
    match requested {
        Some(name) => {
            if available.iter().any(|suffix| target_matches(name, suffix)) {
                Ok(name.to_string())
            } else {
                Err(OtkError::TargetNotFound(format!(
                    "requested target '{name}' does not exist in INPUT, available: {available:?}"
                )))
            }
        }
        None => match available {
            [single] => Ok(single.clone()),
            _ => Err(OtkError::MultipleTargets(
                "INPUT contains multiple targets, `-t` is required".to_string(),
            )),
        },
    }
}

/// Per-file shape checks, run on the raw tree before resolution.
fn ensure_omnifest_shape(tree: &AnnotatedValue) -> Result<(), OtkError> {
    let Some(map) = tree.as_mapping() else {
        return Err(OtkError::ParseType(format!(
            "omnifest must deserialize to a mapping, not a {}",
            tree.kind()
        )));
    };
    for key in map.keys() {
        if !key.starts_with(PREFIX) {
            return Err(OtkError::Parse(format!(
                "top level key '{key}' is not allowed; everything at the top of an omnifest \
                 is either a directive or inside a target block"
            )));
        }
    }
    Ok(())
}
