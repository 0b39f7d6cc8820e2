use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use render_approvals::config::ENV_RENDERER;
use render_approvals::{
  run_suite, verify_image, CompareConfig, ComparisonResult, Harness, HarnessConfig,
  ReceivedPolicy,
};
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
  name = "render_approvals",
  about = "Render models with an external renderer and compare the output against approved PNGs"
)]
struct Cli {
  #[command(subcommand)]
  command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
  /// Render and verify one or more cases
  Run(RunArgs),
  /// Compare two PNG files without rendering
  Verify(VerifyArgs),
  /// Promote received images to approved baselines
  Approve(ApproveArgs),
  /// Delete received and diff images
  Clean(LocationArgs),
}

#[derive(Args, Debug)]
struct LocationArgs {
  /// Harness root; the renderer runs here and relative paths resolve against it
  #[arg(long, default_value = ".")]
  root: PathBuf,

  /// Directory of approved/received images, relative to the root
  #[arg(long, default_value = "Images")]
  images_dir: PathBuf,
}

#[derive(Args, Debug, Default)]
struct CompareArgs {
  /// Per-channel tolerance (0-255)
  #[arg(long)]
  tolerance: Option<u8>,

  /// Maximum percent of pixels allowed to differ (0-100)
  #[arg(long)]
  max_diff_percent: Option<f64>,

  /// Ignore the alpha channel
  #[arg(long)]
  ignore_alpha: bool,

  /// Allow RGB and RGBA images with identical pixels to match
  #[arg(long)]
  ignore_layout: bool,

  /// Start from the fuzzy preset (tolerance 10, 1% pixels, alpha ignored)
  #[arg(long)]
  fuzzy: bool,
}

impl CompareArgs {
  fn apply(&self, mut config: CompareConfig) -> Result<CompareConfig> {
    if self.fuzzy {
      config = CompareConfig::fuzzy();
    }
    if let Some(tolerance) = self.tolerance {
      config.channel_tolerance = tolerance;
    }
    if let Some(percent) = self.max_diff_percent {
      if !(0.0..=100.0).contains(&percent) {
        bail!("--max-diff-percent must be between 0 and 100 (got {percent})");
      }
      config.max_different_percent = percent;
    }
    if self.ignore_alpha {
      config.compare_alpha = false;
    }
    if self.ignore_layout {
      config.require_same_layout = false;
    }
    Ok(config)
  }
}

#[derive(Args, Debug)]
struct RunArgs {
  #[command(flatten)]
  location: LocationArgs,

  #[command(flatten)]
  compare: CompareArgs,

  /// Renderer executable (defaults to $RENDER_APPROVALS_RENDERER)
  #[arg(long)]
  renderer: Option<PathBuf>,

  /// Case to run as NAME=MODEL (repeatable)
  #[arg(long = "case", value_parser = parse_case, required = true)]
  cases: Vec<(String, PathBuf)>,

  /// Render timeout in milliseconds
  #[arg(long)]
  timeout_ms: Option<u64>,

  /// Replace missing or mismatching baselines with the received image
  #[arg(long)]
  update: bool,

  /// Delete received images of passing cases
  #[arg(long)]
  delete_received_on_pass: bool,

  /// Extra argument passed to the renderer after --model/--image (repeatable)
  #[arg(long = "renderer-arg", allow_hyphen_values = true)]
  renderer_args: Vec<String>,

  /// Path to write the JSON report
  #[arg(long)]
  json: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct VerifyArgs {
  #[arg(long)]
  approved: PathBuf,

  #[arg(long)]
  received: PathBuf,

  #[command(flatten)]
  compare: CompareArgs,
}

#[derive(Args, Debug)]
struct ApproveArgs {
  #[command(flatten)]
  location: LocationArgs,

  /// Case name to approve (repeatable)
  #[arg(long = "name", required = true)]
  names: Vec<String>,
}

fn parse_case(raw: &str) -> Result<(String, PathBuf), String> {
  let (name, model) = raw
    .split_once('=')
    .ok_or_else(|| format!("expected NAME=MODEL, got '{raw}'"))?;
  if name.is_empty() || model.is_empty() {
    return Err(format!("expected NAME=MODEL, got '{raw}'"));
  }
  Ok((name.to_string(), PathBuf::from(model)))
}

fn main() {
  tracing_subscriber::fmt()
    .with_env_filter(
      EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    )
    .with_writer(std::io::stderr)
    .init();

  match run(Cli::parse()) {
    Ok(exit_code) => std::process::exit(exit_code),
    Err(err) => {
      eprintln!("error: {err:#}");
      std::process::exit(1);
    }
  }
}

fn run(cli: Cli) -> Result<i32> {
  match cli.command {
    Commands::Run(args) => run_cases(args),
    Commands::Verify(args) => run_verify(args),
    Commands::Approve(args) => run_approve(args),
    Commands::Clean(args) => run_clean(args),
  }
}

fn location_config(location: &LocationArgs) -> HarnessConfig {
  // Renderer is irrelevant for commands that never render.
  HarnessConfig::new(&location.root, PathBuf::new()).with_images_dir(&location.images_dir)
}

fn run_cases(args: RunArgs) -> Result<i32> {
  let mut config = location_config(&args.location)
    .apply_env()
    .context("read RENDER_APPROVALS_* overrides")?;

  match args.renderer {
    Some(renderer) => config.renderer = renderer,
    None if config.renderer.as_os_str().is_empty() => {
      bail!("no renderer given; pass --renderer or set {ENV_RENDERER}")
    }
    None => {}
  }
  if let Some(ms) = args.timeout_ms {
    if ms == 0 {
      bail!("--timeout-ms must be greater than zero");
    }
    config.timeout = Duration::from_millis(ms);
  }
  if args.update {
    config.update_mode = true;
  }
  if args.delete_received_on_pass {
    config.received_policy = ReceivedPolicy::DeleteOnPass;
  }
  if !args.renderer_args.is_empty() {
    config.renderer_args = args.renderer_args;
  }
  config.compare = args.compare.apply(config.compare)?;

  let harness = Harness::new(config);
  let cases = args
    .cases
    .iter()
    .map(|(name, model)| harness.case(name, model))
    .collect::<render_approvals::Result<Vec<_>>>()?;

  let suite = run_suite(&harness, &cases);
  for entry in &suite.results {
    println!(
      "{:<4} {}: {}",
      entry_label(entry.status.is_failure()),
      entry.name,
      entry.summary
    );
  }
  if let Some(json) = &args.json {
    suite
      .write_json(json)
      .with_context(|| format!("write report {}", json.display()))?;
  }

  println!(
    "{} case(s): {} passed, {} approved, {} failed",
    suite.totals.cases,
    suite.totals.passed,
    suite.totals.approved,
    suite.totals.failures()
  );
  Ok(if suite.all_passed() { 0 } else { 1 })
}

fn entry_label(failed: bool) -> &'static str {
  if failed {
    "FAIL"
  } else {
    "ok"
  }
}

fn run_verify(args: VerifyArgs) -> Result<i32> {
  render_approvals::codec::init();
  let config = args.compare.apply(CompareConfig::strict())?;
  let result = verify_image(&args.approved, &args.received, &config);
  println!("{}", result.summary());
  Ok(match result {
    ComparisonResult::Match(_) => 0,
    ComparisonResult::Mismatch(_) => 1,
    ComparisonResult::LoadError(_) => 2,
  })
}

fn run_approve(args: ApproveArgs) -> Result<i32> {
  let harness = Harness::new(location_config(&args.location));
  for name in &args.names {
    let case = harness.case(name, PathBuf::new())?;
    harness
      .approve(&case)
      .with_context(|| format!("approve {name}"))?;
    println!("approved {name}");
  }
  Ok(0)
}

fn run_clean(args: LocationArgs) -> Result<i32> {
  let harness = Harness::new(location_config(&args));
  let removed = harness.clean()?;
  for path in &removed {
    println!("removed {}", path.display());
  }
  println!("{} file(s) removed", removed.len());
  Ok(0)
}
