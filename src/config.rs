//! Harness configuration.
//!
//! Defaults are strict (exact pixel equality, 60 s render timeout, received
//! files kept). Every knob has a builder method and most can be overridden
//! from the environment:
//!
//! | Variable | Effect |
//! | --- | --- |
//! | `RENDER_APPROVALS_RENDERER` | renderer binary |
//! | `RENDER_APPROVALS_TIMEOUT_MS` | render timeout in milliseconds |
//! | `RENDER_APPROVALS_TOLERANCE` | per-channel tolerance (0-255) |
//! | `RENDER_APPROVALS_MAX_DIFFERENT_PERCENT` | allowed differing pixels (0-100) |
//! | `RENDER_APPROVALS_IGNORE_ALPHA` | ignore the alpha channel |
//! | `RENDER_APPROVALS_FUZZY` | fuzzy preset; explicit values above still win |
//! | `RENDER_APPROVALS_UPDATE` | overwrite baselines with received images |
//! | `RENDER_APPROVALS_KEEP_RECEIVED` | `0` deletes received images of passing cases |

use crate::error::{Error, Result};
use crate::image_compare::CompareConfig;
use crate::renderer::{RendererCommand, DEFAULT_TIMEOUT};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const ENV_RENDERER: &str = "RENDER_APPROVALS_RENDERER";
pub const ENV_TIMEOUT_MS: &str = "RENDER_APPROVALS_TIMEOUT_MS";
pub const ENV_TOLERANCE: &str = "RENDER_APPROVALS_TOLERANCE";
pub const ENV_MAX_DIFFERENT_PERCENT: &str = "RENDER_APPROVALS_MAX_DIFFERENT_PERCENT";
pub const ENV_IGNORE_ALPHA: &str = "RENDER_APPROVALS_IGNORE_ALPHA";
pub const ENV_FUZZY: &str = "RENDER_APPROVALS_FUZZY";
pub const ENV_UPDATE: &str = "RENDER_APPROVALS_UPDATE";
pub const ENV_KEEP_RECEIVED: &str = "RENDER_APPROVALS_KEEP_RECEIVED";

pub const DEFAULT_IMAGES_DIR: &str = "Images";

/// What happens to `<Name>.received.png` once a case has been judged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReceivedPolicy {
  /// Leave every received image on disk for inspection.
  #[default]
  Keep,
  /// Remove the received image when the case passes.
  DeleteOnPass,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HarnessConfig {
  /// Working directory of the renderer; relative paths are resolved against it.
  pub root_dir: PathBuf,
  pub renderer: PathBuf,
  pub renderer_args: Vec<String>,
  /// Directory holding approved/received images, relative to `root_dir` unless absolute.
  pub images_dir: PathBuf,
  pub timeout: Duration,
  pub compare: CompareConfig,
  /// Replace missing or mismatching baselines with the received image.
  pub update_mode: bool,
  pub received_policy: ReceivedPolicy,
}

impl HarnessConfig {
  pub fn new(root_dir: impl Into<PathBuf>, renderer: impl Into<PathBuf>) -> Self {
    Self {
      root_dir: root_dir.into(),
      renderer: renderer.into(),
      renderer_args: Vec::new(),
      images_dir: PathBuf::from(DEFAULT_IMAGES_DIR),
      timeout: DEFAULT_TIMEOUT,
      compare: CompareConfig::strict(),
      update_mode: false,
      received_policy: ReceivedPolicy::Keep,
    }
  }

  pub fn with_images_dir(mut self, dir: impl Into<PathBuf>) -> Self {
    self.images_dir = dir.into();
    self
  }

  pub fn with_timeout(mut self, timeout: Duration) -> Self {
    self.timeout = timeout;
    self
  }

  pub fn with_compare(mut self, compare: CompareConfig) -> Self {
    self.compare = compare;
    self
  }

  pub fn with_update_mode(mut self, update: bool) -> Self {
    self.update_mode = update;
    self
  }

  pub fn with_received_policy(mut self, policy: ReceivedPolicy) -> Self {
    self.received_policy = policy;
    self
  }

  pub fn with_renderer_args<I, S>(mut self, args: I) -> Self
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    self.renderer_args = args.into_iter().map(Into::into).collect();
    self
  }

  /// Resolve a harness-relative path against `root_dir`.
  pub fn resolve(&self, path: &Path) -> PathBuf {
    if path.is_absolute() {
      path.to_path_buf()
    } else {
      self.root_dir.join(path)
    }
  }

  /// The renderer invocation described by this config.
  pub fn renderer_command(&self) -> RendererCommand {
    // Relative program paths are ambiguous once the child's cwd changes.
    let program = self.resolve(&self.renderer);
    let program = std::path::absolute(&program).unwrap_or(program);
    RendererCommand::new(program, &self.root_dir)
      .with_timeout(self.timeout)
      .with_extra_args(self.renderer_args.iter().cloned())
  }

  /// Apply overrides from the process environment.
  pub fn apply_env(self) -> Result<Self> {
    self.apply_env_with(|key| std::env::var(key).ok())
  }

  /// Apply overrides from an arbitrary variable lookup.
  pub fn apply_env_with<F>(mut self, lookup: F) -> Result<Self>
  where
    F: Fn(&str) -> Option<String>,
  {
    if let Some(renderer) = lookup(ENV_RENDERER).filter(|v| !v.is_empty()) {
      self.renderer = PathBuf::from(renderer);
    }

    if let Some(raw) = lookup(ENV_TIMEOUT_MS) {
      let millis = parse_value::<u64>(ENV_TIMEOUT_MS, &raw)?;
      if millis == 0 {
        return Err(Error::Config(format!(
          "{ENV_TIMEOUT_MS} must be greater than zero"
        )));
      }
      self.timeout = Duration::from_millis(millis);
    }

    if is_flag_set(lookup(ENV_FUZZY)) {
      let explicit_diff_image = self.compare.generate_diff_image;
      self.compare = CompareConfig::fuzzy().with_generate_diff_image(explicit_diff_image);
    }

    if let Some(raw) = lookup(ENV_TOLERANCE) {
      self.compare.channel_tolerance = parse_value::<u8>(ENV_TOLERANCE, &raw)?;
    }

    if let Some(raw) = lookup(ENV_MAX_DIFFERENT_PERCENT) {
      let percent = parse_value::<f64>(ENV_MAX_DIFFERENT_PERCENT, &raw)?;
      validate_percent(ENV_MAX_DIFFERENT_PERCENT, percent)?;
      self.compare.max_different_percent = percent;
    }

    if is_flag_set(lookup(ENV_IGNORE_ALPHA)) {
      self.compare.compare_alpha = false;
    }

    if is_flag_set(lookup(ENV_UPDATE)) {
      self.update_mode = true;
    }

    if let Some(raw) = lookup(ENV_KEEP_RECEIVED) {
      self.received_policy = if is_flag_set(Some(raw)) {
        ReceivedPolicy::Keep
      } else {
        ReceivedPolicy::DeleteOnPass
      };
    }

    Ok(self)
  }
}

/// Unset, empty, `0` and `false` are off; anything else is on.
fn is_flag_set(value: Option<String>) -> bool {
  match value {
    None => false,
    Some(v) => {
      let v = v.trim();
      !(v.is_empty() || v == "0" || v.eq_ignore_ascii_case("false"))
    }
  }
}

fn parse_value<T>(var: &str, raw: &str) -> Result<T>
where
  T: std::str::FromStr,
  T::Err: std::fmt::Display,
{
  raw
    .trim()
    .parse::<T>()
    .map_err(|e| Error::Config(format!("Invalid {var} '{raw}': {e}")))
}

fn validate_percent(var: &str, value: f64) -> Result<()> {
  if value.is_finite() && (0.0..=100.0).contains(&value) {
    Ok(())
  } else {
    Err(Error::Config(format!(
      "{var} must be between 0 and 100 (got {value})"
    )))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::collections::HashMap;

  fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
    let map: HashMap<String, String> = pairs
      .iter()
      .map(|(k, v)| (k.to_string(), v.to_string()))
      .collect();
    move |key| map.get(key).cloned()
  }

  fn base() -> HarnessConfig {
    HarnessConfig::new("/work", "bin/renderer")
  }

  #[test]
  fn defaults_are_strict() {
    let config = base().apply_env_with(env(&[])).unwrap();
    assert_eq!(config.compare, CompareConfig::strict());
    assert_eq!(config.timeout, DEFAULT_TIMEOUT);
    assert_eq!(config.images_dir, PathBuf::from("Images"));
    assert!(!config.update_mode);
    assert_eq!(config.received_policy, ReceivedPolicy::Keep);
  }

  #[test]
  fn fuzzy_preset_with_explicit_tolerance_override() {
    let config = base()
      .apply_env_with(env(&[(ENV_FUZZY, "1"), (ENV_TOLERANCE, "4")]))
      .unwrap();
    assert_eq!(config.compare.channel_tolerance, 4);
    assert_eq!(config.compare.max_different_percent, 1.0);
    assert!(!config.compare.compare_alpha);
  }

  #[test]
  fn flags_respect_zero_and_false() {
    let config = base()
      .apply_env_with(env(&[(ENV_UPDATE, "0"), (ENV_IGNORE_ALPHA, "false")]))
      .unwrap();
    assert!(!config.update_mode);
    assert!(config.compare.compare_alpha);

    let config = base()
      .apply_env_with(env(&[(ENV_UPDATE, "1"), (ENV_KEEP_RECEIVED, "0")]))
      .unwrap();
    assert!(config.update_mode);
    assert_eq!(config.received_policy, ReceivedPolicy::DeleteOnPass);
  }

  #[test]
  fn timeout_and_renderer_overrides() {
    let config = base()
      .apply_env_with(env(&[
        (ENV_TIMEOUT_MS, "1500"),
        (ENV_RENDERER, "/opt/renderer"),
      ]))
      .unwrap();
    assert_eq!(config.timeout, Duration::from_millis(1500));
    assert_eq!(config.renderer, PathBuf::from("/opt/renderer"));
  }

  #[test]
  fn invalid_values_name_the_variable() {
    let err = base()
      .apply_env_with(env(&[(ENV_TOLERANCE, "300")]))
      .unwrap_err();
    assert!(err.to_string().contains(ENV_TOLERANCE), "{err}");

    let err = base()
      .apply_env_with(env(&[(ENV_MAX_DIFFERENT_PERCENT, "150")]))
      .unwrap_err();
    assert!(err.to_string().contains(ENV_MAX_DIFFERENT_PERCENT), "{err}");

    let err = base()
      .apply_env_with(env(&[(ENV_TIMEOUT_MS, "0")]))
      .unwrap_err();
    assert!(err.to_string().contains(ENV_TIMEOUT_MS), "{err}");
  }

  #[test]
  fn renderer_command_resolves_against_root() {
    let config = base().with_timeout(Duration::from_secs(5));
    let cmd = config.renderer_command();
    assert_eq!(cmd.program(), Path::new("/work/bin/renderer"));
    assert_eq!(cmd.working_dir(), Path::new("/work"));
    assert_eq!(cmd.timeout(), Duration::from_secs(5));
  }
}
