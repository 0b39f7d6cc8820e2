use crate::test_support::{bunny_image, Workspace, MODEL};
use image::Rgba;
use serde_json::Value;
use std::fs;
use std::process::Command;

const ENV_VARS: [&str; 8] = [
  "RENDER_APPROVALS_RENDERER",
  "RENDER_APPROVALS_TIMEOUT_MS",
  "RENDER_APPROVALS_TOLERANCE",
  "RENDER_APPROVALS_MAX_DIFFERENT_PERCENT",
  "RENDER_APPROVALS_IGNORE_ALPHA",
  "RENDER_APPROVALS_FUZZY",
  "RENDER_APPROVALS_UPDATE",
  "RENDER_APPROVALS_KEEP_RECEIVED",
];

fn cli() -> Command {
  let mut cmd = Command::new(env!("CARGO_BIN_EXE_render_approvals"));
  for var in ENV_VARS {
    cmd.env_remove(var);
  }
  cmd
}

#[test]
fn help_lists_subcommands() {
  let output = cli().arg("--help").output().expect("run render_approvals --help");
  assert!(output.status.success());
  let stdout = String::from_utf8_lossy(&output.stdout);
  for sub in ["run", "verify", "approve", "clean"] {
    assert!(stdout.contains(sub), "missing {sub} in help:\n{stdout}");
  }
}

#[test]
fn verify_exit_codes_distinguish_match_mismatch_and_load_error() {
  let ws = Workspace::new();
  let mut changed = bunny_image();
  changed.put_pixel(3, 3, Rgba([0, 0, 0, 255]));
  ws.write_png("a.png", &bunny_image());
  ws.write_png("b.png", &bunny_image());
  ws.write_png("c.png", &changed);

  let verify = |received: &str| {
    cli()
      .arg("verify")
      .arg("--approved")
      .arg(ws.path("a.png"))
      .arg("--received")
      .arg(ws.path(received))
      .output()
      .expect("run render_approvals verify")
  };

  let same = verify("b.png");
  assert_eq!(same.status.code(), Some(0));
  assert!(String::from_utf8_lossy(&same.stdout).contains("Images match"));

  let differs = verify("c.png");
  assert_eq!(differs.status.code(), Some(1));
  assert!(String::from_utf8_lossy(&differs.stdout).contains("first at (3, 3)"));

  let missing = verify("nope.png");
  assert_eq!(missing.status.code(), Some(2));
  assert!(String::from_utf8_lossy(&missing.stdout).contains("received"));
}

#[test]
fn verify_tolerance_flag_accepts_small_changes() {
  let ws = Workspace::new();
  let mut nudged = bunny_image();
  let px = nudged.get_pixel_mut(3, 3);
  px[0] = px[0].wrapping_add(2);
  ws.write_png("a.png", &bunny_image());
  ws.write_png("b.png", &nudged);

  let status = cli()
    .arg("verify")
    .arg("--approved")
    .arg(ws.path("a.png"))
    .arg("--received")
    .arg(ws.path("b.png"))
    .args(["--tolerance", "2"])
    .status()
    .expect("run render_approvals verify");
  assert_eq!(status.code(), Some(0));
}

#[test]
fn run_without_renderer_names_the_env_var() {
  let ws = Workspace::new();
  let output = cli()
    .arg("run")
    .arg("--root")
    .arg(ws.root())
    .args(["--case", &format!("Bunny={MODEL}")])
    .output()
    .expect("run render_approvals run");
  assert_eq!(output.status.code(), Some(1));
  let stderr = String::from_utf8_lossy(&output.stderr);
  assert!(stderr.contains("RENDER_APPROVALS_RENDERER"), "{stderr}");
}

#[cfg(unix)]
#[test]
fn run_writes_json_report_and_fails_on_render_error() {
  let ws = Workspace::new();
  ws.write_png("renders/bunny.png", &bunny_image());
  ws.write_png("Images/Bunny.approved.png", &bunny_image());
  let renderer = ws.copying_renderer("bunny.png");
  let report = ws.path("out/report.json");

  let output = cli()
    .arg("run")
    .arg("--root")
    .arg(ws.root())
    .arg("--renderer")
    .arg(&renderer)
    .args(["--case", &format!("Bunny={MODEL}")])
    .args(["--case", "Dragon=Models/dragon.ply"])
    .arg("--json")
    .arg(&report)
    .output()
    .expect("run render_approvals run");

  assert_eq!(output.status.code(), Some(1));
  let stdout = String::from_utf8_lossy(&output.stdout);
  assert!(stdout.contains("ok   Bunny"), "{stdout}");
  assert!(stdout.contains("FAIL Dragon"), "{stdout}");

  let json: Value = serde_json::from_str(&fs::read_to_string(&report).unwrap()).unwrap();
  assert_eq!(json["totals"]["cases"], 2);
  assert_eq!(json["totals"]["passed"], 1);
  assert_eq!(json["results"][0]["status"], "passed");
  assert_eq!(json["results"][1]["status"], "render_failed");
}

#[cfg(unix)]
#[test]
fn approve_then_clean() {
  let ws = Workspace::new();
  ws.write_png("Images/Bunny.received.png", &bunny_image());
  ws.write_png("Images/Other.received.png", &bunny_image());
  ws.write_png("Images/Other.diff.png", &bunny_image());

  let status = cli()
    .arg("approve")
    .arg("--root")
    .arg(ws.root())
    .args(["--name", "Bunny"])
    .status()
    .expect("run render_approvals approve");
  assert!(status.success());
  assert!(ws.path("Images/Bunny.approved.png").exists());
  assert!(!ws.path("Images/Bunny.received.png").exists());

  let output = cli()
    .arg("clean")
    .arg("--root")
    .arg(ws.root())
    .output()
    .expect("run render_approvals clean");
  assert!(output.status.success());
  assert!(String::from_utf8_lossy(&output.stdout).contains("2 file(s) removed"));
  assert!(ws.path("Images/Bunny.approved.png").exists());
  assert!(!ws.path("Images/Other.diff.png").exists());
}
