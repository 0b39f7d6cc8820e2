//! Suite runs and their JSON report.

use crate::approval::{CaseReport, CaseState, Harness, TestCase, Verdict};
use crate::error::{Error, Result};
use crate::image_compare::DiffStatistics;
use serde::Serialize;
use std::fs;
use std::path::Path;

#[derive(Serialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EntryStatus {
  Passed,
  Approved,
  Mismatch,
  LoadError,
  RenderFailed,
  HarnessError,
}

impl EntryStatus {
  fn from_verdict(verdict: &Verdict) -> Self {
    match verdict {
      Verdict::Passed => EntryStatus::Passed,
      Verdict::Approved { .. } => EntryStatus::Approved,
      Verdict::Mismatch(_) => EntryStatus::Mismatch,
      Verdict::LoadFailed(_) => EntryStatus::LoadError,
      Verdict::RenderFailed(_) => EntryStatus::RenderFailed,
      Verdict::HarnessError(_) => EntryStatus::HarnessError,
    }
  }

  pub fn is_failure(&self) -> bool {
    !matches!(self, EntryStatus::Passed | EntryStatus::Approved)
  }
}

#[derive(Serialize, Clone, Debug)]
pub struct ReportEntry {
  pub name: String,
  pub status: EntryStatus,
  pub state: CaseState,
  pub summary: String,
  pub approved: String,
  pub received: String,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub diff: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub render_ms: Option<u64>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub statistics: Option<DiffStatistics>,
}

impl From<&CaseReport> for ReportEntry {
  fn from(report: &CaseReport) -> Self {
    let statistics = match &report.verdict {
      Verdict::Mismatch(diff) => Some(diff.statistics.clone()),
      _ => None,
    };
    ReportEntry {
      name: report.name.clone(),
      status: EntryStatus::from_verdict(&report.verdict),
      state: report.state,
      summary: report.verdict.to_string(),
      approved: report.approved_path.display().to_string(),
      received: report.received_path.display().to_string(),
      diff: report.diff_path.as_ref().map(|p| p.display().to_string()),
      render_ms: report.render.as_ref().map(|r| r.elapsed.as_millis() as u64),
      statistics,
    }
  }
}

#[derive(Serialize, Default, Clone, Debug, PartialEq, Eq)]
pub struct SuiteTotals {
  pub cases: usize,
  pub passed: usize,
  pub approved: usize,
  pub mismatches: usize,
  pub load_errors: usize,
  pub render_failures: usize,
  pub harness_errors: usize,
}

impl SuiteTotals {
  fn record(&mut self, status: EntryStatus) {
    self.cases += 1;
    match status {
      EntryStatus::Passed => self.passed += 1,
      EntryStatus::Approved => self.approved += 1,
      EntryStatus::Mismatch => self.mismatches += 1,
      EntryStatus::LoadError => self.load_errors += 1,
      EntryStatus::RenderFailed => self.render_failures += 1,
      EntryStatus::HarnessError => self.harness_errors += 1,
    }
  }

  pub fn failures(&self) -> usize {
    self.mismatches + self.load_errors + self.render_failures + self.harness_errors
  }
}

#[derive(Serialize, Clone, Debug, Default)]
pub struct SuiteReport {
  pub totals: SuiteTotals,
  pub results: Vec<ReportEntry>,
}

impl SuiteReport {
  pub fn push(&mut self, report: &CaseReport) {
    let entry = ReportEntry::from(report);
    self.totals.record(entry.status);
    self.results.push(entry);
  }

  pub fn all_passed(&self) -> bool {
    self.totals.failures() == 0
  }

  pub fn failed(&self) -> impl Iterator<Item = &ReportEntry> {
    self.results.iter().filter(|e| e.status.is_failure())
  }

  pub fn to_json(&self) -> Result<String> {
    serde_json::to_string_pretty(self)
      .map_err(|e| Error::Config(format!("failed to serialize report: {e}")))
  }

  pub fn write_json(&self, path: &Path) -> Result<()> {
    let json = self.to_json()?;
    if let Some(parent) = path.parent() {
      if !parent.as_os_str().is_empty() {
        fs::create_dir_all(parent).map_err(|e| Error::io(parent, e))?;
      }
    }
    fs::write(path, json).map_err(|e| Error::io(path, e))
  }
}

/// Run every case in order. A failing case never stops the suite.
pub fn run_suite(harness: &Harness, cases: &[TestCase]) -> SuiteReport {
  let mut suite = SuiteReport::default();
  for case in cases {
    let report = harness.run(case);
    suite.push(&report);
  }
  tracing::info!(
    cases = suite.totals.cases,
    failures = suite.totals.failures(),
    "approval suite finished"
  );
  suite
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::error::{ImageRole, LoadError, LoadErrorKind, RenderError};
  use std::path::PathBuf;

  fn report(name: &str, state: CaseState, verdict: Verdict) -> CaseReport {
    CaseReport {
      name: name.to_string(),
      state,
      verdict,
      render: None,
      approved_path: PathBuf::from(format!("Images/{name}.approved.png")),
      received_path: PathBuf::from(format!("Images/{name}.received.png")),
      diff_path: None,
    }
  }

  #[test]
  fn totals_count_each_category() {
    let mut suite = SuiteReport::default();
    suite.push(&report("A", CaseState::Passed, Verdict::Passed));
    suite.push(&report(
      "B",
      CaseState::RenderFailed,
      Verdict::RenderFailed(
        RenderError::NonZeroExit {
          code: 2,
          stderr: String::new(),
        }
        .into(),
      ),
    ));
    suite.push(&report(
      "C",
      CaseState::Failed,
      Verdict::LoadFailed(LoadError {
        role: ImageRole::Approved,
        path: PathBuf::from("Images/C.approved.png"),
        kind: LoadErrorKind::Missing,
      }),
    ));

    assert_eq!(suite.totals.cases, 3);
    assert_eq!(suite.totals.passed, 1);
    assert_eq!(suite.totals.render_failures, 1);
    assert_eq!(suite.totals.load_errors, 1);
    assert_eq!(suite.totals.failures(), 2);
    assert!(!suite.all_passed());
    let failed: Vec<_> = suite.failed().map(|e| e.name.as_str()).collect();
    assert_eq!(failed, vec!["B", "C"]);
  }

  #[test]
  fn json_uses_snake_case_statuses() {
    let mut suite = SuiteReport::default();
    suite.push(&report(
      "Bunny",
      CaseState::RenderFailed,
      Verdict::RenderFailed(
        RenderError::Terminated {
          stderr: String::new(),
        }
        .into(),
      ),
    ));
    let value: serde_json::Value = serde_json::from_str(&suite.to_json().unwrap()).unwrap();
    assert_eq!(value["results"][0]["status"], "render_failed");
    assert_eq!(value["results"][0]["state"], "render_failed");
    assert_eq!(value["totals"]["render_failures"], 1);
    assert!(value["results"][0].get("diff").is_none());
  }

  #[test]
  fn write_json_creates_parent_dirs() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("out/report.json");
    SuiteReport::default().write_json(&path).unwrap();
    assert!(path.exists());
  }
}
