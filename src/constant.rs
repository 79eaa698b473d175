//! Reserved directive names and prefixes

/// Every directive key starts with this prefix.
pub const PREFIX: &str = "otk.";

/// Target blocks: `otk.target.<kind>.<name>`.
pub const PREFIX_TARGET: &str = "otk.target.";

/// Define blocks: `otk.define` plus an optional `.<uniq-tag>` suffix.
pub const PREFIX_DEFINE: &str = "otk.define";

/// Includes: `otk.include` plus an optional `.<uniq-tag>` suffix.
pub const PREFIX_INCLUDE: &str = "otk.include";

/// Tree operations: `otk.op.<name>`.
pub const PREFIX_OP: &str = "otk.op.";

/// External commands: `otk.external.<executable>`.
pub const PREFIX_EXTERNAL: &str = "otk.external.";

/// The document version key.
pub const NAME_VERSION: &str = "otk.version";
