//! Approval cases: render a model, then compare the received image against its baseline.
//!
//! Each case owns two files under the images directory:
//! `<Name>.approved.png` (checked in) and `<Name>.received.png` (rewritten every
//! run). A mismatch additionally writes `<Name>.diff.png` when diff images are
//! enabled.
//!
//! ```no_run
//! use render_approvals::{Harness, HarnessConfig};
//!
//! let harness = Harness::new(HarnessConfig::new(".", "bin/renderer"));
//! let case = harness.case("Bunny", "Models/bun_zipper.ply").unwrap();
//! harness.run(&case).assert_passed();
//! ```

use crate::codec::{self, load_png};
use crate::config::{HarnessConfig, ReceivedPolicy};
use crate::error::{Error, ImageRole, LoadError, LoadErrorKind, Result};
use crate::image_compare::{compare_images, CompareConfig, ImageDiff};
use crate::renderer::{ProcessResult, RendererCommand};
use serde::Serialize;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

const APPROVED_SUFFIX: &str = ".approved.png";
const RECEIVED_SUFFIX: &str = ".received.png";
const DIFF_SUFFIX: &str = ".diff.png";

/// One approval scenario. Paths are relative to the harness root unless absolute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestCase {
  name: String,
  model: PathBuf,
  approved: PathBuf,
  received: PathBuf,
  diff: PathBuf,
}

impl TestCase {
  pub fn new(name: &str, model: impl Into<PathBuf>, images_dir: &Path) -> Result<Self> {
    validate_name(name)?;
    Ok(Self {
      name: name.to_string(),
      model: model.into(),
      approved: images_dir.join(format!("{name}{APPROVED_SUFFIX}")),
      received: images_dir.join(format!("{name}{RECEIVED_SUFFIX}")),
      diff: images_dir.join(format!("{name}{DIFF_SUFFIX}")),
    })
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  pub fn model(&self) -> &Path {
    &self.model
  }

  pub fn approved_path(&self) -> &Path {
    &self.approved
  }

  pub fn received_path(&self) -> &Path {
    &self.received
  }

  pub fn diff_path(&self) -> &Path {
    &self.diff
  }
}

/// Names become file names, so they must not escape the images directory.
pub fn validate_name(name: &str) -> Result<()> {
  let invalid = |reason: &str| {
    Err(Error::InvalidName {
      name: name.to_string(),
      reason: reason.to_string(),
    })
  };

  if name.trim().is_empty() {
    return invalid("name is empty");
  }
  if name == "." || name == ".." {
    return invalid("name is a relative path component");
  }
  if let Some(c) = name
    .chars()
    .find(|&c| c.is_control() || matches!(c, '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|'))
  {
    return invalid(&format!("character {c:?} is not allowed in file names"));
  }
  Ok(())
}

/// Lifecycle of a single case.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CaseState {
  NotStarted,
  Rendering,
  Rendered,
  RenderFailed,
  Comparing,
  Passed,
  Failed,
}

impl CaseState {
  pub fn is_terminal(self) -> bool {
    matches!(
      self,
      CaseState::Passed | CaseState::Failed | CaseState::RenderFailed
    )
  }

  pub fn can_transition_to(self, next: CaseState) -> bool {
    use CaseState::*;
    matches!(
      (self, next),
      (NotStarted, Rendering)
        | (Rendering, Rendered)
        | (Rendering, RenderFailed)
        | (Rendered, Comparing)
        | (Comparing, Passed)
        | (Comparing, Failed)
    )
  }
}

/// Tracks the state of one case and rejects out-of-order steps.
#[derive(Debug, Clone)]
pub struct CaseProgress {
  state: CaseState,
}

impl Default for CaseProgress {
  fn default() -> Self {
    Self {
      state: CaseState::NotStarted,
    }
  }
}

impl CaseProgress {
  pub fn state(&self) -> CaseState {
    self.state
  }

  pub fn advance(&mut self, next: CaseState) -> Result<()> {
    if !self.state.can_transition_to(next) {
      return Err(Error::InvalidTransition {
        from: self.state,
        to: next,
      });
    }
    self.state = next;
    Ok(())
  }
}

/// Outcome of comparing a received image to its baseline.
#[derive(Debug)]
pub enum ComparisonResult {
  Match(Box<ImageDiff>),
  Mismatch(Box<ImageDiff>),
  LoadError(LoadError),
}

impl ComparisonResult {
  pub fn is_match(&self) -> bool {
    matches!(self, ComparisonResult::Match(_))
  }

  pub fn summary(&self) -> String {
    match self {
      ComparisonResult::Match(diff) | ComparisonResult::Mismatch(diff) => diff.summary(),
      ComparisonResult::LoadError(err) => err.to_string(),
    }
  }
}

/// Load both images and compare them. Never panics on bad input.
pub fn verify_image(approved: &Path, received: &Path, config: &CompareConfig) -> ComparisonResult {
  let approved_img = match load_png(approved, ImageRole::Approved) {
    Ok(img) => img,
    Err(err) => return ComparisonResult::LoadError(err),
  };
  let received_img = match load_png(received, ImageRole::Received) {
    Ok(img) => img,
    Err(err) => return ComparisonResult::LoadError(err),
  };

  let diff = Box::new(compare_images(&received_img, &approved_img, config));
  if diff.is_match() {
    ComparisonResult::Match(diff)
  } else {
    ComparisonResult::Mismatch(diff)
  }
}

/// Final judgement of a case.
#[derive(Debug)]
pub enum Verdict {
  Passed,
  /// Update mode replaced a missing or stale baseline with the received image.
  Approved { previous: Option<String> },
  Mismatch(Box<ImageDiff>),
  LoadFailed(LoadError),
  RenderFailed(Error),
  /// The harness itself failed (filesystem errors around the render).
  HarnessError(Error),
}

impl Verdict {
  pub fn is_pass(&self) -> bool {
    matches!(self, Verdict::Passed | Verdict::Approved { .. })
  }

  pub fn label(&self) -> &'static str {
    match self {
      Verdict::Passed => "passed",
      Verdict::Approved { .. } => "approved",
      Verdict::Mismatch(_) => "mismatch",
      Verdict::LoadFailed(_) => "load_error",
      Verdict::RenderFailed(_) => "render_failed",
      Verdict::HarnessError(_) => "harness_error",
    }
  }
}

impl fmt::Display for Verdict {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Verdict::Passed => f.write_str("passed"),
      Verdict::Approved { previous: None } => f.write_str("approved new baseline"),
      Verdict::Approved {
        previous: Some(reason),
      } => write!(f, "approved new baseline (was: {reason})"),
      Verdict::Mismatch(diff) => f.write_str(&diff.summary()),
      Verdict::LoadFailed(err) => write!(f, "{err}"),
      Verdict::RenderFailed(err) => write!(f, "{err}"),
      Verdict::HarnessError(err) => write!(f, "harness error: {err}"),
    }
  }
}

/// Everything known about one finished case.
#[derive(Debug)]
pub struct CaseReport {
  pub name: String,
  pub state: CaseState,
  pub verdict: Verdict,
  pub render: Option<ProcessResult>,
  pub approved_path: PathBuf,
  pub received_path: PathBuf,
  /// Diff image written for a mismatch.
  pub diff_path: Option<PathBuf>,
}

impl CaseReport {
  pub fn passed(&self) -> bool {
    self.verdict.is_pass()
  }

  pub fn summary(&self) -> String {
    let mut summary = format!("{}: {}", self.name, self.verdict);
    if let Some(diff) = &self.diff_path {
      summary.push_str(&format!(" (diff: {})", diff.display()));
    }
    summary
  }

  /// Panic with the human-readable summary unless the case passed.
  #[track_caller]
  pub fn assert_passed(&self) {
    if !self.passed() {
      panic!("approval failed: {}", self.summary());
    }
  }
}

/// Drives approval cases for one renderer and images directory.
#[derive(Debug, Clone)]
pub struct Harness {
  config: HarnessConfig,
  renderer: RendererCommand,
}

impl Harness {
  pub fn new(config: HarnessConfig) -> Self {
    codec::init();
    if config.compare.is_tolerant() {
      tracing::info!(
        channel_tolerance = config.compare.channel_tolerance,
        max_different_percent = config.compare.max_different_percent,
        compare_alpha = config.compare.compare_alpha,
        "tolerant comparison: passing cases may differ from their baselines"
      );
    }
    let renderer = config.renderer_command();
    Self { config, renderer }
  }

  /// Build a harness whose config is overridden from `RENDER_APPROVALS_*` variables.
  pub fn from_env(config: HarnessConfig) -> Result<Self> {
    Ok(Self::new(config.apply_env()?))
  }

  pub fn config(&self) -> &HarnessConfig {
    &self.config
  }

  pub fn case(&self, name: &str, model: impl Into<PathBuf>) -> Result<TestCase> {
    TestCase::new(name, model, &self.config.images_dir)
  }

  /// Compare the current files of `case` without rendering.
  pub fn verify(&self, case: &TestCase) -> ComparisonResult {
    verify_image(
      &self.config.resolve(case.approved_path()),
      &self.config.resolve(case.received_path()),
      &self.config.compare,
    )
  }

  /// Render and verify one case. Failures end only this case.
  pub fn run(&self, case: &TestCase) -> CaseReport {
    let mut progress = CaseProgress::default();
    let mut report = CaseReport {
      name: case.name().to_string(),
      state: progress.state(),
      verdict: Verdict::Passed,
      render: None,
      approved_path: self.config.resolve(case.approved_path()),
      received_path: self.config.resolve(case.received_path()),
      diff_path: None,
    };

    let verdict = match self.run_steps(case, &mut progress, &mut report) {
      Ok(verdict) => verdict,
      Err(err) => Verdict::HarnessError(err),
    };
    report.state = progress.state();
    report.verdict = verdict;

    if report.passed() {
      tracing::info!(case = %report.name, verdict = %report.verdict, "approval case passed");
    } else {
      tracing::warn!(case = %report.name, verdict = %report.verdict, "approval case failed");
    }
    report
  }

  fn run_steps(
    &self,
    case: &TestCase,
    progress: &mut CaseProgress,
    report: &mut CaseReport,
  ) -> Result<Verdict> {
    progress.advance(CaseState::Rendering)?;
    if let Err(err) = self.prepare_output(report) {
      progress.advance(CaseState::RenderFailed)?;
      return Ok(Verdict::HarnessError(err));
    }

    match self
      .renderer
      .render_model(case.model(), case.received_path())
    {
      Ok(result) => {
        progress.advance(CaseState::Rendered)?;
        report.render = Some(result);
      }
      Err(err) => {
        progress.advance(CaseState::RenderFailed)?;
        if err.is_render_failure() {
          return Ok(Verdict::RenderFailed(err));
        }
        // Waiting on the child failed; the renderer itself may be fine.
        return Ok(Verdict::HarnessError(err));
      }
    }

    progress.advance(CaseState::Comparing)?;
    let comparison = verify_image(
      &report.approved_path,
      &report.received_path,
      &self.config.compare,
    );
    let verdict = match comparison {
      ComparisonResult::Match(_) => {
        self.cleanup_after_pass(case, report);
        Verdict::Passed
      }
      ComparisonResult::Mismatch(diff) if self.config.update_mode => {
        self.promote(report, Some(diff.summary()))
      }
      ComparisonResult::Mismatch(diff) => {
        report.diff_path = self.write_diff(case, &diff);
        Verdict::Mismatch(diff)
      }
      ComparisonResult::LoadError(err)
        if self.config.update_mode
          && err.role == ImageRole::Approved
          && err.kind == LoadErrorKind::Missing =>
      {
        self.promote(report, None)
      }
      ComparisonResult::LoadError(err) => Verdict::LoadFailed(err),
    };

    progress.advance(if verdict.is_pass() {
      CaseState::Passed
    } else {
      CaseState::Failed
    })?;
    Ok(verdict)
  }

  /// Make sure the renderer can write its output and that no stale file survives.
  fn prepare_output(&self, report: &CaseReport) -> Result<()> {
    if let Some(parent) = report.received_path.parent() {
      fs::create_dir_all(parent).map_err(|e| Error::io(parent, e))?;
    }
    remove_if_exists(&report.received_path)
  }

  fn cleanup_after_pass(&self, case: &TestCase, report: &CaseReport) {
    let mut stale = vec![self.config.resolve(case.diff_path())];
    if self.config.received_policy == ReceivedPolicy::DeleteOnPass {
      stale.push(report.received_path.clone());
    }
    for path in stale {
      if let Err(err) = remove_if_exists(&path) {
        tracing::warn!(error = %err, "failed to remove artifact");
      }
    }
  }

  fn write_diff(&self, case: &TestCase, diff: &ImageDiff) -> Option<PathBuf> {
    let image = diff.diff_image.as_ref()?;
    let path = self.config.resolve(case.diff_path());
    match codec::save_png(image, &path) {
      Ok(()) => Some(path),
      Err(err) => {
        tracing::warn!(error = %err, "failed to write diff image");
        None
      }
    }
  }

  fn promote(&self, report: &CaseReport, previous: Option<String>) -> Verdict {
    match promote_received(&report.received_path, &report.approved_path) {
      Ok(()) => {
        tracing::warn!(
          baseline = %report.approved_path.display(),
          "replaced approved baseline with received image"
        );
        Verdict::Approved { previous }
      }
      Err(Error::Load(err)) => Verdict::LoadFailed(err),
      Err(err) => Verdict::HarnessError(err),
    }
  }

  /// Accept the current received image of `case` as its new baseline.
  pub fn approve(&self, case: &TestCase) -> Result<()> {
    let received = self.config.resolve(case.received_path());
    let approved = self.config.resolve(case.approved_path());
    promote_received(&received, &approved)?;
    remove_if_exists(&self.config.resolve(case.diff_path()))?;
    tracing::info!(case = case.name(), "approved received image");
    Ok(())
  }

  /// Remove every received and diff artifact below the images directory.
  pub fn clean(&self) -> Result<Vec<PathBuf>> {
    clean_artifacts(&self.config.resolve(&self.config.images_dir))
  }
}

/// Copy `received` over `approved`, then remove `received`.
fn promote_received(received: &Path, approved: &Path) -> Result<()> {
  if !received.exists() {
    return Err(
      LoadError {
        role: ImageRole::Received,
        path: received.to_path_buf(),
        kind: LoadErrorKind::Missing,
      }
      .into(),
    );
  }
  if let Some(parent) = approved.parent() {
    fs::create_dir_all(parent).map_err(|e| Error::io(parent, e))?;
  }
  fs::copy(received, approved).map_err(|e| Error::io(approved, e))?;
  remove_if_exists(received)
}

fn remove_if_exists(path: &Path) -> Result<()> {
  match fs::remove_file(path) {
    Ok(()) => Ok(()),
    Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
    Err(e) => Err(Error::io(path, e)),
  }
}

/// Delete `*.received.png` and `*.diff.png` files below `dir`, returning what was removed.
///
/// Approved baselines are never touched. A missing directory is not an error.
pub fn clean_artifacts(dir: &Path) -> Result<Vec<PathBuf>> {
  if !dir.exists() {
    return Ok(Vec::new());
  }

  let mut removed = Vec::new();
  for entry in WalkDir::new(dir).sort_by_file_name() {
    let entry = entry.map_err(|e| {
      let path = e.path().unwrap_or(dir).to_path_buf();
      Error::io(path, std::io::Error::other(e.to_string()))
    })?;
    if !entry.file_type().is_file() {
      continue;
    }
    let name = entry.file_name().to_string_lossy();
    if name.ends_with(RECEIVED_SUFFIX) || name.ends_with(DIFF_SUFFIX) {
      remove_if_exists(entry.path())?;
      removed.push(entry.path().to_path_buf());
    }
  }
  Ok(removed)
}
