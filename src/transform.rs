//! Tree resolution
//!
//! Omnifests are resolved depth first, left to right. Scalars pass through
//! untouched except for strings, which get variable interpolation. Mappings
//! are where the work happens: keys carrying the `otk.` prefix are
//! directives and decide how their value is folded into the output tree.

use std::collections::VecDeque;
use std::path::{Component, Path, PathBuf};

use indexmap::IndexMap;
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, info, warn};

use crate::annotation::{AnnotatedValue, Annotations, Value};
use crate::constant::{
    NAME_VERSION, PREFIX, PREFIX_DEFINE, PREFIX_EXTERNAL, PREFIX_INCLUDE, PREFIX_OP, PREFIX_TARGET,
};
use crate::context::{validate_var_name, Context};
use crate::error::OtkError;
use crate::external::{self, SearchPaths};
use crate::loader::Loader;
use crate::traversal::State;

/// `${name}` placeholders; the name charset is wider than a valid variable
/// name on purpose, so `${a-}` parses as a placeholder and then fails name
/// validation instead of passing through silently.
static VAR_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\$\{([a-zA-Z0-9_.\-]+)\}").expect("valid regex"));

/// Prefix `msg` with the offending value's source location, falling back to
/// the file currently being resolved.
fn located(state: &State, value: &AnnotatedValue, msg: String) -> String {
    match value.src() {
        Some(src) => format!("{src} - {msg}"),
        None => prefixed(state, msg),
    }
}

/// Prefix `msg` with the file currently being resolved, when there is one.
fn prefixed(state: &State, msg: String) -> String {
    let path = state.path_display();
    if path.is_empty() {
        msg
    } else {
        format!("{path}: {msg}")
    }
}

fn is_directive(key: &str) -> bool {
    key.starts_with(PREFIX)
}

/// Does `-t requested` select the target key suffix `suffix`?
///
/// Exact name or dot-separated prefix, so `osbuild` selects
/// `osbuild.qcow2` but not `osbuildx.y`.
pub(crate) fn target_matches(requested: &str, suffix: &str) -> bool {
    suffix == requested
        || suffix
            .strip_prefix(requested)
            .is_some_and(|rest| rest.starts_with('.'))
}

/// Record a loaded file's `otk.version` with the context, if it has one.
/// The first version seen wins; a conflicting later one is an error.
pub(crate) fn record_version(
    ctx: &mut Context,
    state: &State,
    tree: &AnnotatedValue,
) -> Result<(), OtkError> {
    let Some(map) = tree.as_mapping() else {
        return Ok(());
    };
    let Some(version) = map.get(NAME_VERSION) else {
        return Ok(());
    };
    match version.as_int() {
        Some(v) => ctx.set_version(v),
        None => Err(OtkError::ParseType(located(
            state,
            version,
            format!("otk.version must be an integer, not a {}", version.kind()),
        ))),
    }
}

/// Fold `.` and `..` segments without touching the filesystem, so cycle
/// detection also works on paths that are about to fail existence checks.
fn normalize_path(path: &Path) -> PathBuf {
    let mut parts: Vec<Component> = Vec::new();
    for comp in path.components() {
        match comp {
            Component::CurDir => {}
            Component::ParentDir => match parts.last() {
                Some(Component::Normal(_)) => {
                    parts.pop();
                }
                Some(Component::RootDir) => {}
                _ => parts.push(comp),
            },
            other => parts.push(other),
        }
    }
    parts.iter().collect()
}

/// Render `path` relative to the components it shares with `reference`.
/// Used to keep not-found messages short.
fn strip_common_prefix(path: &Path, reference: &Path) -> String {
    let shared = path
        .components()
        .zip(reference.components())
        .take_while(|(a, b)| a == b)
        .count();
    let stripped: PathBuf = path.components().skip(shared).collect();
    if stripped.as_os_str().is_empty() {
        path.display().to_string()
    } else {
        stripped.display().to_string()
    }
}

/// The resolution engine for one compilation pass.
///
/// Holds the shared variable context, the loader used for includes, and the
/// search paths for external programs. All state lives in these three
/// injected pieces; the resolver itself is stateless between calls.
pub struct Resolver<'a> {
    ctx: &'a mut Context,
    loader: &'a Loader,
    externals: &'a SearchPaths,
}

impl<'a> Resolver<'a> {
    pub fn new(ctx: &'a mut Context, loader: &'a Loader, externals: &'a SearchPaths) -> Self {
        Self {
            ctx,
            loader,
            externals,
        }
    }

    /// Resolve one node into its output form.
    pub fn resolve(
        &mut self,
        state: &State,
        data: AnnotatedValue,
    ) -> Result<AnnotatedValue, OtkError> {
        let annotations = data.annotations().clone();
        match data.into_value() {
            Value::Mapping(map) => self.resolve_mapping(state, map, annotations),
            Value::Sequence(items) => self.resolve_sequence(state, items, annotations),
            Value::String(s) => {
                let node = AnnotatedValue::new(Value::String(s)).with_annotations(annotations);
                self.substitute_vars(state, node)
            }
            // Numbers, booleans, nulls and paths resolve to themselves.
            other => Ok(AnnotatedValue::new(other).with_annotations(annotations)),
        }
    }

    fn resolve_sequence(
        &mut self,
        state: &State,
        items: Vec<AnnotatedValue>,
        annotations: Annotations,
    ) -> Result<AnnotatedValue, OtkError> {
        debug!(elements = items.len(), "resolving sequence");
        let mut resolved = Vec::with_capacity(items.len());
        for item in items {
            resolved.push(self.resolve(state, item)?);
        }
        Ok(AnnotatedValue::from(resolved).with_annotations(annotations))
    }

    /// Walk one mapping, applying directives.
    ///
    /// Entries move from `pending` into `out` one at a time; directives that
    /// merge content (includes, targets) or consume it (defines) see both
    /// sides, which is what the sibling rules below are defined over.
    fn resolve_mapping(
        &mut self,
        state: &State,
        map: IndexMap<String, AnnotatedValue>,
        mut annotations: Annotations,
    ) -> Result<AnnotatedValue, OtkError> {
        let mut pending: VecDeque<(String, AnnotatedValue)> = map.into_iter().collect();
        let mut out: IndexMap<String, AnnotatedValue> = IndexMap::new();

        while let Some((key, value)) = pending.pop_front() {
            // Substitute variables in string values before anything else, so
            // directive arguments can themselves reference variables. The
            // pre-substitution value is kept for the skip paths below, which
            // leave the document untouched.
            let (original, value) = if value.is_string() {
                let keep = value.clone();
                (Some(keep), self.substitute_vars(state, value)?)
            } else {
                (None, value)
            };

            if !is_directive(&key) {
                let resolved = self.resolve(state, value)?;
                out.insert(key, resolved);
                continue;
            }

            if key.starts_with(PREFIX_DEFINE) {
                // Defines feed the context and vanish from the output tree.
                self.process_defines(state, value)?;
                continue;
            }

            if key == NAME_VERSION {
                // Consumed by the load-time version check; stays as written.
                out.insert(key, original.unwrap_or(value));
                continue;
            }

            if let Some(suffix) = key.strip_prefix(PREFIX_TARGET) {
                let selected = self
                    .ctx
                    .target_requested()
                    .is_some_and(|requested| target_matches(requested, suffix));
                if !selected {
                    // Dry run or a different target: leave the block as is.
                    out.insert(key, original.unwrap_or(value));
                    continue;
                }
                let mut resolved = self.resolve(state, value)?;
                if !resolved.is_mapping() {
                    return Err(OtkError::TargetShape(located(
                        state,
                        &resolved,
                        format!(
                            "First level below a 'target' should be a mapping (not a {})",
                            resolved.kind()
                        ),
                    )));
                }
                let squashed = AnnotatedValue::squash_annotations(&[&resolved]);
                resolved.set_annotations(squashed);
                out.insert(key, resolved);
                continue;
            }

            if key.starts_with(PREFIX_INCLUDE) {
                let shown = value.to_string();
                let included = self.process_include(state, value)?;

                if included.is_mapping() {
                    let shell = AnnotatedValue::mapping().with_annotations(annotations);
                    annotations = AnnotatedValue::squash_annotations(&[&shell, &included]);
                    if let Value::Mapping(inc_map) = included.into_value() {
                        for (inc_key, inc_value) in inc_map {
                            // Included entries override earlier siblings;
                            // later siblings get resolved afterwards and
                            // override the included ones in turn.
                            out.insert(inc_key, inc_value);
                        }
                    }
                    continue;
                }

                if out.is_empty() && pending.is_empty() {
                    // A non-mapping include replaces the whole mapping.
                    return Ok(included);
                }
                let mut rest = out;
                rest.extend(pending);
                let existing = AnnotatedValue::from(rest).deep_dump();
                return Err(OtkError::OverrideNonEmpty(prefixed(
                    state,
                    format!(
                        "otk.include '{shown}' overrides non-empty mapping {existing} with '{included}'"
                    ),
                )));
            }

            // Everything past this point is sibling-exclusive.
            if !out.is_empty() || !pending.is_empty() {
                let mut shown: Vec<String> = Vec::new();
                for (k, v) in &out {
                    shown.push(format!("{k} ({})", v.src().unwrap_or("unknown")));
                }
                shown.push(format!("{key} ({})", value.src().unwrap_or("unknown")));
                for (k, v) in &pending {
                    shown.push(format!("{k} ({})", v.src().unwrap_or("unknown")));
                }
                return Err(OtkError::DirectiveSibling(located(
                    state,
                    &value,
                    format!("directive {key} should not have siblings: {shown:?}"),
                )));
            }

            if key.starts_with(PREFIX_OP) {
                let resolved = self.resolve(state, value)?;
                let joined = self.op(state, resolved, &key)?;
                // The joined tree may itself contain directives.
                return self.resolve(state, joined);
            }

            if key.starts_with(PREFIX_EXTERNAL) {
                if self.ctx.target_requested().is_none() {
                    // Dry run: externals only fire when a target is selected.
                    out.insert(key, original.unwrap_or(value));
                    continue;
                }
                let resolved = self.resolve(state, value)?;
                let reply = external::call(state, &key, &resolved, self.externals)?;
                return self.resolve(state, reply);
            }

            return Err(OtkError::UnknownDirective(located(
                state,
                &value,
                format!("unknown directive '{key}'"),
            )));
        }

        Ok(AnnotatedValue::from(out).with_annotations(annotations))
    }

    /// Feed a define block into the context.
    ///
    /// `state` carries the dotted subkey prefix for nested blocks. New
    /// definitions land under that prefix; references in substituted values
    /// resolve against the whole context.
    fn process_defines(&mut self, state: &State, tree: AnnotatedValue) -> Result<(), OtkError> {
        if tree.is_null() {
            warn!("empty otk.define in {}", state.path_display());
            return Ok(());
        }
        if !tree.is_mapping() {
            return Err(OtkError::DirectiveType(located(
                state,
                &tree,
                format!(
                    "otk.define expects a mapping as its argument but received a {}: '{tree}'",
                    tree.kind()
                ),
            )));
        }
        let Value::Mapping(map) = tree.into_value() else {
            return Ok(());
        };

        if map.is_empty() {
            let subkey = state.define_subkey(None);
            if !subkey.is_empty() {
                self.ctx.define(&subkey, AnnotatedValue::mapping())?;
            }
            return Ok(());
        }

        for (key, value) in map {
            if key.starts_with(PREFIX_DEFINE) {
                // Nested define blocks flatten into the same scope.
                self.process_defines(state, value)?;
                continue;
            }

            if key.starts_with(PREFIX_INCLUDE) {
                return Err(OtkError::Parse(format!(
                    "otk.include is not allowed in an otk.define in {}",
                    state.path_display()
                )));
            }

            if key.starts_with(PREFIX_OP) {
                let resolved = self.resolve(state, value)?;
                let joined = self.op(state, resolved, &key)?;
                self.ctx.define(&state.define_subkey(None), joined)?;
                continue;
            }

            if key.starts_with(PREFIX_EXTERNAL) {
                // Externals in define blocks run even without a target; a
                // dry run still needs the variables they produce.
                let resolved = self.resolve(state, value)?;
                let reply = external::call(state, &key, &resolved, self.externals)?;
                let new_vars = self.resolve(state, reply)?;
                self.ctx
                    .merge_defines_at(&state.define_subkey(None), new_vars)?;
                continue;
            }

            if value.is_mapping() {
                let nested = state.with_subkey(&key);
                self.process_defines(&nested, value)?;
            } else if value.is_string() {
                let substituted = self.substitute_vars(state, value)?;
                self.ctx
                    .define(&state.define_subkey(Some(&key)), substituted)?;
            } else {
                self.ctx.define(&state.define_subkey(Some(&key)), value)?;
            }
        }
        Ok(())
    }

    /// Load and resolve an included file.
    fn process_include(
        &mut self,
        state: &State,
        value: AnnotatedValue,
    ) -> Result<AnnotatedValue, OtkError> {
        let raw = match value.as_str() {
            Some(s) => s.to_string(),
            None => {
                return Err(OtkError::DirectiveType(located(
                    state,
                    &value,
                    format!(
                        "otk.include expects a string as its argument but received a {}: '{value}'",
                        value.kind()
                    ),
                )))
            }
        };

        let mut path = PathBuf::from(&raw);
        if path.is_relative() {
            if let Some(parent) = state.path().parent() {
                path = parent.join(&path);
            }
        }
        let path = normalize_path(&path);
        info!("resolving include {}", path.display());

        // The path node keeps the include string's provenance so circular
        // include chains can say where each hop came from.
        let path_node = AnnotatedValue::from(path.clone()).with_annotations(value.annotations().clone());
        let new_state = state.with_path(path_node)?;

        let loaded = match self.loader.load_path(&path) {
            Ok(tree) => tree,
            Err(OtkError::Io(err)) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(OtkError::IncludeNotFound(prefixed(
                    state,
                    format!(
                        "file '{}' was not found",
                        strip_common_prefix(&path, state.path())
                    ),
                )));
            }
            Err(err) => return Err(err),
        };

        record_version(self.ctx, &new_state, &loaded)?;

        if loaded.is_null() {
            // Empty files include as nothing.
            return Ok(AnnotatedValue::mapping());
        }
        self.resolve(&new_state, loaded)
    }

    /// Dispatch `otk.op.*`.
    fn op(
        &mut self,
        state: &State,
        tree: AnnotatedValue,
        key: &str,
    ) -> Result<AnnotatedValue, OtkError> {
        if key == "otk.op.join" {
            return self.op_join(state, tree);
        }
        Err(OtkError::UnknownDirective(prefixed(
            state,
            format!("nonexistent op '{key}'"),
        )))
    }

    /// Join a list of sequences into one sequence, or a list of mappings
    /// into one mapping (later keys win).
    fn op_join(&self, state: &State, tree: AnnotatedValue) -> Result<AnnotatedValue, OtkError> {
        if !tree.is_mapping() {
            return Err(OtkError::DirectiveType(located(
                state,
                &tree,
                format!(
                    "otk.op.join expects a mapping as its argument but received a {}: '{tree}'",
                    tree.kind()
                ),
            )));
        }
        let Value::Mapping(mut map) = tree.into_value() else {
            return Ok(AnnotatedValue::null());
        };
        let values = match map.shift_remove("values") {
            Some(values) => values,
            None => {
                return Err(OtkError::MissingArgument(prefixed(
                    state,
                    "Expected key 'values'".to_string(),
                )))
            }
        };
        if !values.is_sequence() {
            return Err(OtkError::DirectiveType(located(
                state,
                &values,
                format!(
                    "seq join received values of the wrong type, was expecting a list of lists but got '{values}'"
                ),
            )));
        }

        let (all_sequences, all_mappings) = match values.as_sequence() {
            Some(items) => (
                items.iter().all(AnnotatedValue::is_sequence),
                items.iter().all(AnnotatedValue::is_mapping),
            ),
            None => (false, false),
        };

        // An empty values list joins to an empty sequence.
        if all_sequences {
            let annotations = match values.as_sequence() {
                Some(items) => {
                    let refs: Vec<&AnnotatedValue> = items.iter().collect();
                    AnnotatedValue::squash_annotations(&refs)
                }
                None => Annotations::new(),
            };
            let mut joined: Vec<AnnotatedValue> = Vec::new();
            if let Value::Sequence(elements) = values.into_value() {
                for element in elements {
                    if let Value::Sequence(items) = element.into_value() {
                        joined.extend(items);
                    }
                }
            }
            return Ok(AnnotatedValue::from(joined).with_annotations(annotations));
        }

        if all_mappings {
            let annotations = match values.as_sequence() {
                Some(items) => {
                    let refs: Vec<&AnnotatedValue> = items.iter().collect();
                    AnnotatedValue::squash_annotations(&refs)
                }
                None => Annotations::new(),
            };
            let mut joined: IndexMap<String, AnnotatedValue> = IndexMap::new();
            if let Value::Sequence(elements) = values.into_value() {
                for element in elements {
                    if let Value::Mapping(entries) = element.into_value() {
                        joined.extend(entries);
                    }
                }
            }
            return Ok(AnnotatedValue::from(joined).with_annotations(annotations));
        }

        Err(OtkError::DirectiveType(located(
            state,
            &values,
            format!("cannot join '{values}'"),
        )))
    }

    /// Interpolate `${name}` placeholders in a string node.
    ///
    /// A string that is exactly one placeholder resolves to the variable's
    /// typed value; placeholders inside longer strings require primitive
    /// values and splice in their textual form. Replacement text is not
    /// rescanned within this call.
    fn substitute_vars(
        &mut self,
        state: &State,
        data: AnnotatedValue,
    ) -> Result<AnnotatedValue, OtkError> {
        let text = match data.as_str() {
            Some(text) => text.to_string(),
            None => return Ok(data),
        };

        if let Some(caps) = VAR_PATTERN.captures(&text) {
            let whole = caps.get(0).map(|m| (m.start(), m.end()));
            if whole == Some((0, text.len())) {
                let name = &caps[1];
                let prefix = state.path_display();
                validate_var_name(name).map_err(|err| err.locate(&prefix))?;
                let value = self
                    .ctx
                    .variable(name)
                    .map_err(|err| err.locate(&prefix))?;
                return Ok(value.clone());
            }
        }

        let names: Vec<String> = VAR_PATTERN
            .captures_iter(&text)
            .map(|caps| caps[1].to_string())
            .collect();
        if names.is_empty() {
            return Ok(data);
        }

        let mut annotations = data.annotations().clone();
        let mut result = text.clone();
        for name in &names {
            validate_var_name(name)?;
            let value = self.ctx.variable(name)?;
            let rendered = match value.value() {
                Value::String(s) => s.clone(),
                Value::Int(i) => i.to_string(),
                Value::Float(f) => f.to_string(),
                _ => {
                    let src = annotations
                        .get("src")
                        .map(|s| format!(" ({s})"))
                        .unwrap_or_default();
                    return Err(OtkError::DirectiveType(format!(
                        "expected int, float, or str. Can not use {} to resolve string '{text}'{src}",
                        value.kind()
                    )));
                }
            };
            let value_src = value.src().map(str::to_string);

            debug!(name, "substituting variable into string");
            result = result.replace(&format!("${{{name}}}"), &rendered);
            if let Some(value_src) = value_src {
                if let Some(data_src) = annotations.get("src").cloned() {
                    annotations.insert(
                        "src".to_string(),
                        format!("variable from {value_src} applied to {data_src}"),
                    );
                }
            }
        }
        Ok(AnnotatedValue::from(result).with_annotations(annotations))
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

    struct Fixture {
        ctx: Context,
        loader: Loader,
        externals: SearchPaths,
    }

    impl Fixture {
        fn new() -> Self {
            Self::with_target(None)
        }

        fn with_target(target: Option<&str>) -> Self {
            Self {
                ctx: Context::new(target.map(str::to_string), false),
                loader: Loader::default(),
                externals: SearchPaths::default(),
            }
        }

        fn resolve(
            &mut self,
            state: &State,
            data: AnnotatedValue,
        ) -> Result<AnnotatedValue, OtkError> {
            Resolver::new(&mut self.ctx, &self.loader, &self.externals).resolve(state, data)
        }
    }

    #[test]
    fn plain_values_pass_through() {
        let mut fx = Fixture::new();
        let out = fx.resolve(&State::default(), load("a: 1\nb: [x, y]")).unwrap();
        assert_eq!(out, load("a: 1\nb: [x, y]"));
    }

    #[test]
    fn substitution_in_plain_string() {
        let mut fx = Fixture::new();
        fx.ctx.define("name", AnnotatedValue::from("world")).unwrap();
        let out = fx
            .resolve(&State::default(), AnnotatedValue::from("hello ${name}"))
            .unwrap();
        assert_eq!(out.as_str(), Some("hello world"));
    }

    #[test]
    fn full_match_keeps_the_type() {
        let mut fx = Fixture::new();
        fx.ctx.define("count", AnnotatedValue::from(3)).unwrap();
        let out = fx
            .resolve(&State::default(), AnnotatedValue::from("${count}"))
            .unwrap();
        assert_eq!(out.value(), &Value::Int(3));

        let out = fx
            .resolve(&State::default(), AnnotatedValue::from("n=${count}"))
            .unwrap();
        assert_eq!(out.as_str(), Some("n=3"));
    }

    #[test]
    fn interpolating_a_sequence_fails() {
        let mut fx = Fixture::new();
        fx.ctx
            .define("list", load("xs: [1, 2]").as_mapping().unwrap()["xs"].clone())
            .unwrap();
        let err = fx
            .resolve(&State::default(), AnnotatedValue::from("x${list}"))
            .unwrap_err();
        assert!(matches!(err, OtkError::DirectiveType(_)));
        assert!(err
            .to_string()
            .contains("Can not use sequence to resolve string 'x${list}'"));
    }

    #[test]
    fn full_match_lookup_failure_names_the_file() {
        let mut fx = Fixture::new();
        let err = fx
            .resolve(&State::new("omni.yaml"), AnnotatedValue::from("${missing}"))
            .unwrap_err();
        assert!(matches!(err, OtkError::VariableNotFound(_)));
        assert!(err.to_string().starts_with("omni.yaml: "));
    }

    #[test]
    fn invalid_variable_name_rejected() {
        let mut fx = Fixture::new();
        let err = fx
            .resolve(&State::default(), AnnotatedValue::from("${a-b}"))
            .unwrap_err();
        assert!(matches!(err, OtkError::InvalidVariableName(_)));
    }

    #[test]
    fn defines_vanish_and_bind() {
        let mut fx = Fixture::new();
        let out = fx
            .resolve(
                &State::default(),
                load("otk.define:\n  a: 1\n  nested:\n    b: two\nkeep: '${nested.b}'"),
            )
            .unwrap();
        let map = out.as_mapping().unwrap();
        assert!(!map.contains_key("otk.define"));
        assert_eq!(map["keep"].as_str(), Some("two"));
        assert_eq!(fx.ctx.variable("a").unwrap().value(), &Value::Int(1));
    }

    #[test]
    fn define_values_substitute_at_definition_time() {
        let mut fx = Fixture::new();
        fx.resolve(
            &State::default(),
            load("otk.define:\n  base: /srv\n  full: '${base}/images'"),
        )
        .unwrap();
        assert_eq!(
            fx.ctx.variable("full").unwrap().as_str(),
            Some("/srv/images")
        );
    }

    #[test]
    fn nested_define_blocks_flatten() {
        let mut fx = Fixture::new();
        fx.resolve(
            &State::default(),
            load("otk.define:\n  otk.define.more:\n    x: 1"),
        )
        .unwrap();
        assert_eq!(fx.ctx.variable("x").unwrap().value(), &Value::Int(1));
    }

    #[test]
    fn include_inside_define_is_rejected() {
        let mut fx = Fixture::new();
        let err = fx
            .resolve(
                &State::new("omni.yaml"),
                load("otk.define:\n  otk.include: other.yaml"),
            )
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "otk.include is not allowed in an otk.define in omni.yaml"
        );
    }

    #[test]
    fn join_inside_define_resolves_references() {
        let mut fx = Fixture::new();
        fx.resolve(
            &State::default(),
            load(concat!(
                "otk.define:\n",
                "  a: [1]\n",
                "  b: [2]\n",
                "  joined:\n",
                "    otk.op.join:\n",
                "      values:\n",
                "        - ${a}\n",
                "        - ${b}\n",
            )),
        )
        .unwrap();
        let joined = fx.ctx.variable("joined").unwrap();
        let items = joined.as_sequence().unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].value(), &Value::Int(1));
        assert_eq!(items[1].value(), &Value::Int(2));
    }

    #[test]
    fn empty_define_block_is_tolerated() {
        let mut fx = Fixture::new();
        assert!(fx.resolve(&State::default(), load("otk.define:")).is_ok());
        assert!(fx.resolve(&State::default(), load("otk.define: {}")).is_ok());
    }

    #[test]
    fn version_key_survives_unchanged() {
        let mut fx = Fixture::new();
        let out = fx
            .resolve(&State::default(), load("otk.version: 1\nother: x"))
            .unwrap();
        let map = out.as_mapping().unwrap();
        assert_eq!(map["otk.version"].value(), &Value::Int(1));
    }

    #[test]
    fn sibling_rule_for_ops() {
        let mut fx = Fixture::new();
        let err = fx
            .resolve(
                &State::default(),
                load("otk.op.join:\n  values: []\nextra: 1"),
            )
            .unwrap_err();
        assert!(matches!(err, OtkError::DirectiveSibling(_)));
        assert!(err.to_string().contains("otk.op.join should not have siblings"));
        assert!(err.to_string().contains("extra"));
    }

    #[test]
    fn unknown_directive_fails() {
        let mut fx = Fixture::new();
        let err = fx
            .resolve(&State::default(), load("otk.frobnicate: 1"))
            .unwrap_err();
        assert!(matches!(err, OtkError::UnknownDirective(_)));
        assert!(err.to_string().contains("otk.frobnicate"));
    }

    #[test]
    fn unknown_op_fails() {
        let mut fx = Fixture::new();
        let err = fx
            .resolve(&State::default(), load("otk.op.split:\n  values: []"))
            .unwrap_err();
        assert!(matches!(err, OtkError::UnknownDirective(_)));
        assert!(err.to_string().contains("nonexistent op 'otk.op.split'"));
    }

    #[test]
    fn join_sequences() {
        let mut fx = Fixture::new();
        let out = fx
            .resolve(
                &State::default(),
                load("otk.op.join:\n  values:\n    - [1, 2]\n    - [3, 4]"),
            )
            .unwrap();
        let items = out.as_sequence().unwrap();
        let ints: Vec<i64> = items.iter().filter_map(AnnotatedValue::as_int).collect();
        assert_eq!(ints, vec![1, 2, 3, 4]);
    }

    #[test]
    fn join_mappings_later_wins() {
        let mut fx = Fixture::new();
        let out = fx
            .resolve(
                &State::default(),
                load("otk.op.join:\n  values:\n    - a: 1\n    - a: 2\n      b: 3"),
            )
            .unwrap();
        let map = out.as_mapping().unwrap();
        assert_eq!(map["a"].value(), &Value::Int(2));
        assert_eq!(map["b"].value(), &Value::Int(3));
    }

    #[test]
    fn join_mixed_shapes_fails() {
        let mut fx = Fixture::new();
        let err = fx
            .resolve(
                &State::default(),
                load("otk.op.join:\n  values:\n    - [1, 2]\n    - a: 1"),
            )
            .unwrap_err();
        assert!(matches!(err, OtkError::DirectiveType(_)));
        assert!(err.to_string().contains("cannot join"));
    }

    #[test]
    fn join_requires_values_key() {
        let mut fx = Fixture::new();
        let err = fx
            .resolve(&State::default(), load("otk.op.join:\n  data: []"))
            .unwrap_err();
        assert!(matches!(err, OtkError::MissingArgument(_)));
        assert!(err.to_string().contains("Expected key 'values'"));
    }

    #[test]
    fn join_values_must_be_a_sequence() {
        let mut fx = Fixture::new();
        let err = fx
            .resolve(&State::default(), load("otk.op.join:\n  values: nope"))
            .unwrap_err();
        assert!(matches!(err, OtkError::DirectiveType(_)));
    }

    #[test]
    fn empty_join_gives_empty_sequence() {
        let mut fx = Fixture::new();
        let out = fx
            .resolve(&State::default(), load("otk.op.join:\n  values: []"))
            .unwrap();
        assert_eq!(out.as_sequence().map(Vec::len), Some(0));
    }

    #[test]
    fn target_skipped_without_request() {
        let mut fx = Fixture::new();
        let out = fx
            .resolve(
                &State::default(),
                load("otk.target.demo:\n  val: '${x}'\notk.define:\n  x: 1"),
            )
            .unwrap();
        let map = out.as_mapping().unwrap();
        // Dry run: target body stays unresolved, define still processed.
        let body = map["otk.target.demo"].as_mapping().unwrap();
        assert_eq!(body["val"].as_str(), Some("${x}"));
        assert_eq!(fx.ctx.variable("x").unwrap().value(), &Value::Int(1));
    }

    #[test]
    fn requested_target_resolves() {
        let mut fx = Fixture::with_target(Some("demo"));
        let out = fx
            .resolve(
                &State::default(),
                load("otk.define:\n  x: 1\notk.target.demo:\n  val: '${x}'"),
            )
            .unwrap();
        let map = out.as_mapping().unwrap();
        let body = map["otk.target.demo"].as_mapping().unwrap();
        assert_eq!(body["val"].value(), &Value::Int(1));
    }

    #[test]
    fn target_matching_respects_dot_boundaries() {
        assert!(target_matches("osbuild", "osbuild"));
        assert!(target_matches("osbuild", "osbuild.qcow2"));
        assert!(!target_matches("osbuild", "osbuildx.y"));
        assert!(!target_matches("osbuild.qcow2", "osbuild"));
    }

    #[test]
    fn non_matching_target_stays_raw() {
        let mut fx = Fixture::with_target(Some("other"));
        let out = fx
            .resolve(
                &State::default(),
                load("otk.target.demo:\n  val: '${x}'"),
            )
            .unwrap();
        let body = out.as_mapping().unwrap()["otk.target.demo"]
            .as_mapping()
            .unwrap();
        assert_eq!(body["val"].as_str(), Some("${x}"));
    }

    #[test]
    fn target_body_must_be_a_mapping() {
        let mut fx = Fixture::with_target(Some("demo"));
        let err = fx
            .resolve(&State::default(), load("otk.target.demo: just-a-string"))
            .unwrap_err();
        assert!(matches!(err, OtkError::TargetShape(_)));
        assert!(err
            .to_string()
            .contains("First level below a 'target' should be a mapping (not a string)"));
    }

    #[test]
    fn external_skipped_without_target() {
        let mut fx = Fixture::new();
        let out = fx
            .resolve(
                &State::default(),
                load("otk.external.osbuild-gen-nonsense:\n  packages: [vim]"),
            )
            .unwrap();
        let map = out.as_mapping().unwrap();
        assert!(map.contains_key("otk.external.osbuild-gen-nonsense"));
    }

    fn write_file(dir: &Path, name: &str, content: &str) -> PathBuf {
        let path = dir.join(name);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn include_merges_into_the_mapping() {
        let dir = tempfile::tempdir().unwrap();
        write_file(dir.path(), "inc.yaml", "b: 2\nc: 3\n");
        let main = write_file(dir.path(), "main.yaml", "");

        let mut fx = Fixture::new();
        let out = fx
            .resolve(
                &State::new(&main),
                load("a: 1\notk.include: inc.yaml\nc: 9"),
            )
            .unwrap();
        let map = out.as_mapping().unwrap();
        assert_eq!(map["a"].value(), &Value::Int(1));
        assert_eq!(map["b"].value(), &Value::Int(2));
        // A later sibling wins over the included value.
        assert_eq!(map["c"].value(), &Value::Int(9));
    }

    #[test]
    fn include_overrides_earlier_siblings() {
        let dir = tempfile::tempdir().unwrap();
        write_file(dir.path(), "inc.yaml", "a: 2\n");
        let main = write_file(dir.path(), "main.yaml", "");

        let mut fx = Fixture::new();
        let out = fx
            .resolve(&State::new(&main), load("a: 1\notk.include: inc.yaml"))
            .unwrap();
        assert_eq!(
            out.as_mapping().unwrap()["a"].value(),
            &Value::Int(2)
        );
    }

    #[test]
    fn non_mapping_include_replaces_lone_mapping() {
        let dir = tempfile::tempdir().unwrap();
        write_file(dir.path(), "list.yaml", "- 1\n- 2\n");
        let main = write_file(dir.path(), "main.yaml", "");

        let mut fx = Fixture::new();
        let out = fx
            .resolve(&State::new(&main), load("otk.include: list.yaml"))
            .unwrap();
        assert_eq!(out.as_sequence().map(Vec::len), Some(2));
    }

    #[test]
    fn non_mapping_include_with_siblings_fails() {
        let dir = tempfile::tempdir().unwrap();
        write_file(dir.path(), "list.yaml", "- 1\n");
        let main = write_file(dir.path(), "main.yaml", "");

        let mut fx = Fixture::new();
        let err = fx
            .resolve(
                &State::new(&main),
                load("keep: 1\notk.include: list.yaml"),
            )
            .unwrap_err();
        assert!(matches!(err, OtkError::OverrideNonEmpty(_)));
        assert!(err.to_string().contains("overrides non-empty mapping"));
    }

    #[test]
    fn missing_include_reports_clean_path() {
        let dir = tempfile::tempdir().unwrap();
        let main = write_file(dir.path(), "main.yaml", "");

        let mut fx = Fixture::new();
        let err = fx
            .resolve(&State::new(&main), load("otk.include: sub/nope.yaml"))
            .unwrap_err();
        assert!(matches!(err, OtkError::IncludeNotFound(_)));
        assert!(err.to_string().contains("file 'sub/nope.yaml' was not found"));
    }

    #[test]
    fn circular_include_detected() {
        let dir = tempfile::tempdir().unwrap();
        write_file(dir.path(), "a.yaml", "otk.include: b.yaml\n");
        write_file(dir.path(), "b.yaml", "otk.include: a.yaml\n");
        let a = dir.path().join("a.yaml");

        let mut fx = Fixture::new();
        let loaded = fx.loader.load_path(&a).unwrap();
        let err = fx.resolve(&State::new(&a), loaded).unwrap_err();
        assert!(matches!(err, OtkError::CircularInclude(_)));
        let msg = err.to_string();
        assert!(msg.starts_with("circular include detected:\n"));
        assert!(msg.contains("a.yaml ->"));
        assert!(msg.contains("b.yaml"));
    }

    #[test]
    fn include_records_version() {
        let dir = tempfile::tempdir().unwrap();
        write_file(dir.path(), "inc.yaml", "otk.version: 1\nx: 1\n");
        let main = write_file(dir.path(), "main.yaml", "");

        let mut fx = Fixture::new();
        fx.resolve(&State::new(&main), load("otk.include: inc.yaml"))
            .unwrap();
        assert_eq!(fx.ctx.version(), Some(1));
    }

    #[test]
    fn include_path_substitutes_variables() {
        let dir = tempfile::tempdir().unwrap();
        write_file(dir.path(), "parts/disk.yaml", "layout: gpt\n");
        let main = write_file(dir.path(), "main.yaml", "");

        let mut fx = Fixture::new();
        fx.ctx.define("part", AnnotatedValue::from("disk")).unwrap();
        let out = fx
            .resolve(
                &State::new(&main),
                load("otk.include: parts/${part}.yaml"),
            )
            .unwrap();
        assert_eq!(
            out.as_mapping().unwrap()["layout"].as_str(),
            Some("gpt")
        );
    }

    #[test]
    fn normalize_folds_dot_segments() {
        assert_eq!(
            normalize_path(Path::new("a/b/../c/./d.yaml")),
            PathBuf::from("a/c/d.yaml")
        );
        assert_eq!(normalize_path(Path::new("../x.yaml")), PathBuf::from("../x.yaml"));
    }
}
