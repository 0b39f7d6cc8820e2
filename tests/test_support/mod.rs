//! Helpers shared by the integration tests: stub renderers and synthetic PNGs.

#![allow(dead_code)]

use image::{Rgba, RgbaImage};
use render_approvals::codec::save_png;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

pub const MODEL: &str = "Models/bun_zipper.ply";

/// Prologue for stub renderers: parses `--model`/`--image` into `$model`/`$image`.
const ARG_PARSER: &str = r#"#!/usr/bin/env sh
set -eu
model=""
image=""
while [ "$#" -gt 0 ]; do
  case "$1" in
    --model) model="$2"; shift 2;;
    --image) image="$2"; shift 2;;
    *) shift;;
  esac
done
"#;

#[cfg(unix)]
pub fn make_executable(path: &Path) {
  use std::os::unix::fs::PermissionsExt;
  let mut perms = fs::metadata(path).expect("stat stub executable").permissions();
  perms.set_mode(0o755);
  fs::set_permissions(path, perms).expect("chmod stub executable");
}

#[cfg(not(unix))]
pub fn make_executable(_path: &Path) {}

/// A throwaway harness root with a model file and an `Images/` directory.
pub struct Workspace {
  pub dir: TempDir,
}

impl Workspace {
  pub fn new() -> Self {
    let dir = tempfile::tempdir().expect("tempdir");
    let model = dir.path().join(MODEL);
    fs::create_dir_all(model.parent().expect("model parent")).expect("create Models/");
    fs::write(&model, b"ply\nformat ascii 1.0\nend_header\n").expect("write model");
    fs::create_dir_all(dir.path().join("Images")).expect("create Images/");
    Self { dir }
  }

  pub fn root(&self) -> &Path {
    self.dir.path()
  }

  pub fn path(&self, relative: &str) -> PathBuf {
    self.dir.path().join(relative)
  }

  /// Write a stub renderer whose body runs after argument parsing.
  pub fn renderer(&self, name: &str, body: &str) -> PathBuf {
    let path = self.path(&format!("bin/{name}"));
    fs::create_dir_all(path.parent().expect("bin parent")).expect("create bin/");
    fs::write(&path, format!("{ARG_PARSER}{body}")).expect("write stub renderer");
    make_executable(&path);
    path
  }

  /// Renderer that copies `renders/<file>` (relative to its cwd) to the requested image.
  pub fn copying_renderer(&self, file: &str) -> PathBuf {
    self.renderer(
      "copy-renderer",
      &format!(
        r#"[ -f "$model" ] || {{ echo "cannot open model $model" >&2; exit 3; }}
mkdir -p "$(dirname "$image")"
cp "renders/{file}" "$image"
"#
      ),
    )
  }

  pub fn write_png(&self, relative: &str, image: &RgbaImage) {
    save_png(image, &self.path(relative)).expect("write png");
  }
}

/// Deterministic test pattern standing in for a rendered bunny.
pub fn bunny_image() -> RgbaImage {
  RgbaImage::from_fn(32, 24, |x, y| {
    let inside = (x as i32 - 16).pow(2) + (y as i32 - 12).pow(2) < 64;
    if inside {
      Rgba([200, 180, 160, 255])
    } else {
      Rgba([20, 20, 40, 255])
    }
  })
}
