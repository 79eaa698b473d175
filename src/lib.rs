//! otk - the omnifest toolkit
//!
//! Compiles YAML omnifests into build manifests. The interesting part is
//! [`transform::Resolver`], which walks an annotated document tree and
//! expands `otk.*` directives: includes, defines, joins, target blocks, and
//! external commands, with `${name}` variable interpolation throughout.
//! Every node carries source-location annotations so errors can point at the
//! line that caused them.

pub mod annotation;
pub mod constant;
pub mod context;
pub mod document;
pub mod error;
pub mod external;
pub mod loader;
pub mod target;
pub mod transform;
pub mod traversal;

pub use annotation::{AnnotatedValue, Annotations, Value};
pub use context::Context;
pub use document::{select_target, CompileOptions, Omnifest, Source};
pub use error::{FixSuggestion, OtkError};
pub use external::SearchPaths;
pub use loader::Loader;
pub use transform::Resolver;
pub use traversal::State;
