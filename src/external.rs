//! External command invocation
//!
//! `otk.external.<name>` hands a resolved subtree to an out-of-process
//! helper. The helper receives `{"tree": ...}` as JSON on stdin and answers
//! with `{"tree": ...}` on stdout; the reply replaces the directive in the
//! document. Helpers are plain executables found on a search path, invoked
//! synchronously with no arguments and no timeout.

use std::io::{self, Write};
use std::path::PathBuf;
use std::process::{Command, Stdio};

use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use crate::annotation::AnnotatedValue;
use crate::constant::PREFIX_EXTERNAL;
use crate::error::OtkError;
use crate::traversal::State;

/// Directories searched when no override is configured, in order.
const BUILTIN_DIRS: [&str; 4] = [
    "/usr/local/libexec/otk",
    "/usr/libexec/otk",
    "/usr/local/lib/otk",
    "/usr/lib/otk",
];

/// Environment variable prepending directories to the search path,
/// colon-separated.
pub const EXTERNAL_PATH_ENV: &str = "OTK_EXTERNAL_PATH";

/// Ordered list of directories searched for external commands.
///
/// Built once at the entry point and injected into the resolver; nothing in
/// the core reads the environment on its own.
#[derive(Debug, Clone)]
pub struct SearchPaths {
    dirs: Vec<PathBuf>,
}

impl Default for SearchPaths {
    fn default() -> Self {
        Self::new([])
    }
}

impl SearchPaths {
    /// Search `extra` directories first, then the built-in ones.
    pub fn new(extra: impl IntoIterator<Item = PathBuf>) -> Self {
        let mut dirs: Vec<PathBuf> = extra.into_iter().collect();
        dirs.extend(BUILTIN_DIRS.iter().map(PathBuf::from));
        Self { dirs }
    }

    /// Build the search path from `OTK_EXTERNAL_PATH` when set.
    pub fn from_env() -> Self {
        match std::env::var(EXTERNAL_PATH_ENV) {
            Ok(value) => Self::new(
                value
                    .split(':')
                    .filter(|dir| !dir.is_empty())
                    .map(PathBuf::from),
            ),
            Err(_) => Self::default(),
        }
    }

    /// The first existing file named `exe` in any search directory.
    fn find(&self, exe: &str) -> Option<PathBuf> {
        self.dirs
            .iter()
            .map(|dir| dir.join(exe))
            .find(|path| path.is_file())
    }
}

#[derive(Serialize)]
struct Request<'a> {
    tree: &'a AnnotatedValue,
}

#[derive(Deserialize)]
struct Reply {
    tree: serde_json::Value,
}

/// Invoke the external command behind `directive` on `tree`.
///
/// The reply tree comes back without annotations; a synthesized `src` entry
/// records which command produced it and what input it saw, so diagnostics
/// further down still point somewhere useful.
pub fn call(
    state: &State,
    directive: &str,
    tree: &AnnotatedValue,
    paths: &SearchPaths,
) -> Result<AnnotatedValue, OtkError> {
    let name = directive.strip_prefix(PREFIX_EXTERNAL).unwrap_or(directive);
    let exe = paths.find(name).ok_or_else(|| {
        OtkError::ExecutableNotFound(prefixed(
            state,
            format!("could not find '{name}' in any search path {:?}", paths.dirs),
        ))
    })?;

    let request = serde_json::to_string(&Request { tree }).map_err(|err| {
        OtkError::ExternalFailed(prefixed(
            state,
            format!("could not serialize input for '{name}': {err}"),
        ))
    })?;

    debug!(name, exe = %exe.display(), "calling external");
    let mut child = Command::new(&exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;
    if let Some(mut stdin) = child.stdin.take() {
        // A helper may exit without draining its input; the interesting
        // diagnostics are then its exit status and stderr, not the pipe.
        match stdin.write_all(request.as_bytes()) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::BrokenPipe => {}
            Err(err) => return Err(err.into()),
        }
    }
    let output = child.wait_with_output()?;

    if !output.status.success() {
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        error!(name, status = ?output.status.code(), "external failed");
        return Err(OtkError::ExternalFailed(prefixed(
            state,
            format!(
                "call to '{}' failed with {}: stdout='{}', stderr='{}'",
                exe.display(),
                output.status,
                stdout.trim_end(),
                stderr.trim_end()
            ),
        )));
    }

    let reply: Reply = serde_json::from_slice(&output.stdout).map_err(|err| {
        OtkError::ExternalFailed(prefixed(
            state,
            format!("'{name}' returned malformed JSON: {err}"),
        ))
    })?;

    let mut result = AnnotatedValue::from_raw(reply.tree);
    if let Some(src) = tree.src() {
        let mut desc = format!("result of {directive} ({src})");
        if let (Some(file), Some(start), Some(end)) = (
            tree.annotation("content_filename"),
            tree.annotation("content_line_number"),
            tree.annotation("content_line_number_end"),
        ) {
            desc.push_str(&format!(" with input from {file}:{start}-{end}"));
        }
        result.set_annotation("src", desc);
    }
    Ok(result)
}

fn prefixed(state: &State, msg: String) -> String {
    let path = state.path_display();
    if path.is_empty() {
        msg
    } else {
        format!("{path}: {msg}")
    }
}
