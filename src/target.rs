//! Target rendering
//!
//! A target turns a resolved `otk.target.<kind>.<name>` subtree into final
//! output text. Targets are looked up by kind through [`registry`]; every
//! kind currently renders through [`ManifestTarget`], which emits a JSON
//! build manifest with a fixed format version injected.

use crate::annotation::AnnotatedValue;
use crate::error::OtkError;

/// The manifest format version injected into rendered output.
const MANIFEST_VERSION: &str = "2";

/// One output dialect.
pub trait Target {
    /// Structural checks on the resolved target subtree, before rendering.
    fn ensure_valid(&self, tree: &AnnotatedValue) -> Result<(), OtkError>;

    /// Render the subtree as final output text.
    fn as_string(&self, tree: &AnnotatedValue, pretty: bool) -> Result<String, OtkError>;
}

/// Look up the target implementation for a target kind.
///
/// `kind` is the first segment after `otk.target.`, e.g. `osbuild` in
/// `otk.target.osbuild.qcow2`. All kinds currently share the manifest
/// renderer; the seam exists so new dialects slot in without touching the
/// resolver.
pub fn registry(_kind: &str) -> Box<dyn Target> {
    Box::new(ManifestTarget)
}

/// Renders a resolved target subtree as a pretty-printed JSON manifest.
pub struct ManifestTarget;

impl Target for ManifestTarget {
    fn ensure_valid(&self, tree: &AnnotatedValue) -> Result<(), OtkError> {
        if let Some(map) = tree.as_mapping() {
            if map.contains_key("version") {
                return Err(OtkError::TargetReservedKey(
                    "First level below a 'target' must not contain 'version'. \
                     The key 'version' is added by otk internally."
                        .to_string(),
                ));
            }
        }
        Ok(())
    }

    fn as_string(&self, tree: &AnnotatedValue, pretty: bool) -> Result<String, OtkError> {
        let mut dumped = tree.deep_dump();
        if let serde_json::Value::Object(map) = &mut dumped {
            // After the document's own keys, matching their order in output.
            map.insert(
                "version".to_string(),
                serde_json::Value::String(MANIFEST_VERSION.to_string()),
            );
        }
        let rendered = if pretty {
            serde_json::to_string_pretty(&dumped)
        } else {
            serde_json::to_string(&dumped)
        };
        rendered.map_err(|err| OtkError::TargetShape(format!("could not render manifest: {err}")))
    }
}
