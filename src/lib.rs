pub mod approval;
pub mod codec;
pub mod config;
pub mod error;
pub mod image_compare;
pub mod renderer;
pub mod report;

pub use approval::{
  verify_image, CaseReport, CaseState, ComparisonResult, Harness, TestCase, Verdict,
};
pub use config::{HarnessConfig, ReceivedPolicy};
pub use error::{Error, Result};
pub use image_compare::{CompareConfig, DiffStatistics, ImageDiff};
pub use renderer::{ProcessResult, RendererCommand};
pub use report::{run_suite, SuiteReport};
