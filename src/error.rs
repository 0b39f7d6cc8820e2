//! Error types for render-approvals
//!
//! The taxonomy mirrors the ways a single approval case can go wrong:
//! - Launch errors (renderer binary missing or not executable)
//! - Render errors (renderer exited non-zero, was killed, or timed out)
//! - Load errors (approved or received PNG missing or undecodable)
//! - Harness misuse (invalid case names, bad configuration)
//!
//! An image mismatch is not an error: it is the verdict this
//! harness exists to produce, and lives in [`crate::approval::Verdict`].

use crate::approval::CaseState;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for harness operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type for the harness.
///
/// # Examples
///
/// ```
/// use render_approvals::error::{Error, ImageRole, LoadError, LoadErrorKind};
///
/// let err = Error::Load(LoadError {
///     role: ImageRole::Approved,
///     path: "Images/Bunny.approved.png".into(),
///     kind: LoadErrorKind::Missing,
/// });
/// assert!(err.to_string().contains("approved"));
/// ```
#[derive(Error, Debug)]
pub enum Error {
  /// The renderer process could not be started at all.
  #[error("Failed to launch renderer '{}': {source}", program.display())]
  Launch {
    program: PathBuf,
    #[source]
    source: std::io::Error,
  },

  /// The renderer started but did not complete successfully.
  #[error("Render error: {0}")]
  Render(#[from] RenderError),

  /// One of the two images could not be loaded.
  #[error("Load error: {0}")]
  Load(#[from] LoadError),

  /// A test case name that cannot be turned into a unique file name.
  #[error("Invalid test case name '{name}': {reason}")]
  InvalidName { name: String, reason: String },

  /// A case step was attempted out of order.
  #[error("Invalid case transition {from:?} -> {to:?}")]
  InvalidTransition { from: CaseState, to: CaseState },

  /// Invalid harness configuration (usually from an environment variable).
  #[error("Configuration error: {0}")]
  Config(String),

  /// I/O error while managing harness artifacts.
  #[error("I/O error on '{}': {source}", path.display())]
  Io {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },
}

impl Error {
  pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
    Error::Io {
      path: path.into(),
      source,
    }
  }

  /// Returns true for failures of the renderer itself (launch, exit code, timeout).
  pub fn is_render_failure(&self) -> bool {
    matches!(self, Error::Launch { .. } | Error::Render(_))
  }
}

/// Failures of a renderer process that did start.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RenderError {
  /// Renderer exited with a non-zero status code.
  #[error("renderer exited with code {code}{}", stderr_suffix(stderr))]
  NonZeroExit { code: i32, stderr: String },

  /// Renderer was terminated by a signal (no exit code available).
  #[error("renderer was terminated without an exit code{}", stderr_suffix(stderr))]
  Terminated { stderr: String },

  /// Renderer did not exit before the deadline and was killed.
  #[error("renderer timed out after {}ms (pid {pid})", timeout.as_millis())]
  Timeout { timeout: Duration, pid: u32 },
}

fn stderr_suffix(stderr: &str) -> String {
  let trimmed = stderr.trim();
  if trimmed.is_empty() {
    String::new()
  } else {
    format!(": {trimmed}")
  }
}

/// Which side of the comparison an image belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageRole {
  Approved,
  Received,
}

impl fmt::Display for ImageRole {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(match self {
      ImageRole::Approved => "approved",
      ImageRole::Received => "received",
    })
  }
}

/// An image that could not be loaded, naming the file and the reason.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("cannot load {role} image '{}': {kind}{}", path.display(), missing_hint(*role, kind))]
pub struct LoadError {
  pub role: ImageRole,
  pub path: PathBuf,
  pub kind: LoadErrorKind,
}

fn missing_hint(role: ImageRole, kind: &LoadErrorKind) -> &'static str {
  match (role, kind) {
    (ImageRole::Received, LoadErrorKind::Missing) => " (renderer wrote no output)",
    (ImageRole::Approved, LoadErrorKind::Missing) => " (no approved baseline yet)",
    _ => "",
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadErrorKind {
  /// The file does not exist.
  Missing,
  /// The file exists but is not a decodable PNG.
  Decode(String),
  /// The file exists but could not be read.
  Io(String),
}

impl fmt::Display for LoadErrorKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      LoadErrorKind::Missing => f.write_str("file not found"),
      LoadErrorKind::Decode(reason) => write!(f, "failed to decode PNG: {reason}"),
      LoadErrorKind::Io(reason) => write!(f, "failed to read file: {reason}"),
    }
  }
}
