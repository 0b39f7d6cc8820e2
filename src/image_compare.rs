use crate::codec::{ChannelLayout, DecodedImage};
use image::{ImageBuffer, Pixel, Primitive, Rgba, RgbaImage};
use serde::Serialize;

/// Configuration for comparing a received image against its approved baseline.
///
/// The default is exact equality: every channel of every pixel must match.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompareConfig {
  /// Maximum allowed difference per color channel (0-255).
  pub channel_tolerance: u8,
  /// Maximum percentage of pixels that can differ before failing (0.0-100.0).
  pub max_different_percent: f64,
  /// Whether to compare the alpha channel. When false, alpha is ignored.
  pub compare_alpha: bool,
  /// Whether an RGB image may match an RGBA one with identical pixels.
  pub require_same_layout: bool,
  /// Whether to generate a visual diff image.
  pub generate_diff_image: bool,
}

impl Default for CompareConfig {
  fn default() -> Self {
    Self {
      channel_tolerance: 0,
      max_different_percent: 0.0,
      compare_alpha: true,
      require_same_layout: true,
      generate_diff_image: true,
    }
  }
}

impl CompareConfig {
  /// Strict comparison: exact match required.
  pub fn strict() -> Self {
    Self::default()
  }

  /// Fuzzy comparison: allow small raster differences and ignore alpha.
  pub fn fuzzy() -> Self {
    Self {
      channel_tolerance: 10,
      max_different_percent: 1.0,
      compare_alpha: false,
      require_same_layout: false,
      generate_diff_image: true,
    }
  }

  pub fn with_channel_tolerance(mut self, tolerance: u8) -> Self {
    self.channel_tolerance = tolerance;
    self
  }

  pub fn with_max_different_percent(mut self, percent: f64) -> Self {
    self.max_different_percent = percent;
    self
  }

  pub fn with_compare_alpha(mut self, compare: bool) -> Self {
    self.compare_alpha = compare;
    self
  }

  pub fn with_require_same_layout(mut self, require: bool) -> Self {
    self.require_same_layout = require;
    self
  }

  pub fn with_generate_diff_image(mut self, generate: bool) -> Self {
    self.generate_diff_image = generate;
    self
  }

  /// True when any tolerance is configured, i.e. a pass does not imply equality.
  pub fn is_tolerant(&self) -> bool {
    self.channel_tolerance > 0 || self.max_different_percent > 0.0 || !self.compare_alpha
  }
}

/// Smallest rectangle containing every differing pixel (inclusive bounds).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DiffBounds {
  pub min_x: u32,
  pub min_y: u32,
  pub max_x: u32,
  pub max_y: u32,
}

impl DiffBounds {
  fn at(x: u32, y: u32) -> Self {
    Self {
      min_x: x,
      min_y: y,
      max_x: x,
      max_y: y,
    }
  }

  fn include(&mut self, x: u32, y: u32) {
    self.min_x = self.min_x.min(x);
    self.min_y = self.min_y.min(y);
    self.max_x = self.max_x.max(x);
    self.max_y = self.max_y.max(y);
  }

  pub fn width(&self) -> u32 {
    self.max_x - self.min_x + 1
  }

  pub fn height(&self) -> u32 {
    self.max_y - self.min_y + 1
  }
}

/// Statistics about pixel differences.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DiffStatistics {
  /// Total number of pixels compared.
  pub total_pixels: u64,
  /// Number of pixels that differ (respecting tolerance/alpha settings).
  pub different_pixels: u64,
  /// Percentage of pixels that differ (0.0-100.0).
  pub different_percent: f64,
  pub max_red_diff: u8,
  pub max_green_diff: u8,
  pub max_blue_diff: u8,
  pub max_alpha_diff: u8,
  /// Mean squared error across compared channels.
  pub mse: f64,
  /// First differing pixel in row-major order.
  pub first_difference: Option<(u32, u32)>,
  pub bounds: Option<DiffBounds>,
}

impl DiffStatistics {
  /// Returns the maximum difference across all channels.
  pub fn max_channel_diff(&self, compare_alpha: bool) -> u8 {
    let max_rgb = self
      .max_red_diff
      .max(self.max_green_diff)
      .max(self.max_blue_diff);
    if compare_alpha {
      max_rgb.max(self.max_alpha_diff)
    } else {
      max_rgb
    }
  }
}

/// Result of comparing two images.
#[derive(Debug, Clone)]
pub struct ImageDiff {
  /// Whether the images match according to the config.
  pub matches: bool,
  pub statistics: DiffStatistics,
  /// Difference image (red highlights), if generated.
  pub diff_image: Option<RgbaImage>,
  pub dimensions_match: bool,
  pub layout_match: bool,
  pub actual_dimensions: (u32, u32),
  pub expected_dimensions: (u32, u32),
  pub actual_layout: ChannelLayout,
  pub expected_layout: ChannelLayout,
  pub actual_bit_depth: u8,
  pub expected_bit_depth: u8,
  pub config: CompareConfig,
}

impl ImageDiff {
  pub fn is_match(&self) -> bool {
    self.matches
  }

  /// Returns a human-readable summary of the comparison result.
  pub fn summary(&self) -> String {
    if !self.dimensions_match {
      return format!(
        "Dimension mismatch: received {}x{}, approved {}x{}",
        self.actual_dimensions.0,
        self.actual_dimensions.1,
        self.expected_dimensions.0,
        self.expected_dimensions.1
      );
    }

    if !self.layout_match {
      return format!(
        "Channel layout mismatch: received {} {}-bit, approved {} {}-bit",
        self.actual_layout.label(),
        self.actual_bit_depth,
        self.expected_layout.label(),
        self.expected_bit_depth
      );
    }

    if self.matches {
      if self.statistics.different_pixels == 0 {
        return "Images match".to_string();
      }
      return format!(
        "Images match within tolerance ({} of {} pixels differ, {:.4}%)",
        self.statistics.different_pixels,
        self.statistics.total_pixels,
        self.statistics.different_percent
      );
    }

    let mut summary = format!(
      "Images differ: {} of {} pixels ({:.4}%), max channel diff: {}, MSE: {:.4}",
      self.statistics.different_pixels,
      self.statistics.total_pixels,
      self.statistics.different_percent,
      self.statistics.max_channel_diff(self.config.compare_alpha),
      self.statistics.mse
    );
    if let Some((x, y)) = self.statistics.first_difference {
      summary.push_str(&format!(", first at ({x}, {y})"));
    }
    if let Some(bounds) = self.statistics.bounds {
      summary.push_str(&format!(
        ", region {}x{} at ({}, {})",
        bounds.width(),
        bounds.height(),
        bounds.min_x,
        bounds.min_y
      ));
    }
    summary
  }
}

/// Compare a received image against its approved baseline.
///
/// Two 16-bit images are compared at full depth; anything else at 8 bits.
pub fn compare_images(
  received: &DecodedImage,
  approved: &DecodedImage,
  config: &CompareConfig,
) -> ImageDiff {
  let mut diff = match (&received.pixels16, &approved.pixels16) {
    (Some(actual), Some(expected)) => compare_rgba16(actual, expected, config),
    _ => compare_rgba(&received.pixels, &approved.pixels, config),
  };
  diff.actual_layout = received.layout;
  diff.expected_layout = approved.layout;
  diff.actual_bit_depth = received.bit_depth;
  diff.expected_bit_depth = approved.bit_depth;
  if config.require_same_layout
    && (received.layout != approved.layout || received.bit_depth != approved.bit_depth)
  {
    diff.layout_match = false;
    diff.matches = false;
  }
  diff
}

/// Compare two RGBA buffers. Both are treated as RGBA layout.
pub fn compare_rgba(actual: &RgbaImage, expected: &RgbaImage, config: &CompareConfig) -> ImageDiff {
  compare_buffers(actual, expected, config, 8)
}

/// Compare two 16-bit RGBA buffers.
///
/// Differences are reported on the 8-bit scale, rounded up, so a 1-LSB change
/// still counts under a zero tolerance.
pub fn compare_rgba16(
  actual: &ImageBuffer<Rgba<u16>, Vec<u16>>,
  expected: &ImageBuffer<Rgba<u16>, Vec<u16>>,
  config: &CompareConfig,
) -> ImageDiff {
  compare_buffers(actual, expected, config, 16)
}

/// Per-channel difference on the 8-bit scale: rounded-up value and exact value.
trait Channel: Primitive {
  fn scaled_diff(self, other: Self) -> (u8, f64);
}

impl Channel for u8 {
  fn scaled_diff(self, other: Self) -> (u8, f64) {
    let d = self.abs_diff(other);
    (d, d as f64)
  }
}

impl Channel for u16 {
  fn scaled_diff(self, other: Self) -> (u8, f64) {
    let d = u32::from(self.abs_diff(other));
    (((d + 256) / 257) as u8, d as f64 / 257.0)
  }
}

fn compare_buffers<T>(
  actual: &ImageBuffer<Rgba<T>, Vec<T>>,
  expected: &ImageBuffer<Rgba<T>, Vec<T>>,
  config: &CompareConfig,
  bit_depth: u8,
) -> ImageDiff
where
  T: Channel,
  Rgba<T>: Pixel<Subpixel = T>,
{
  let actual_dims = actual.dimensions();
  let expected_dims = expected.dimensions();

  let mut result = ImageDiff {
    matches: false,
    statistics: DiffStatistics::default(),
    diff_image: None,
    dimensions_match: actual_dims == expected_dims,
    layout_match: true,
    actual_dimensions: actual_dims,
    expected_dimensions: expected_dims,
    actual_layout: ChannelLayout::Rgba,
    expected_layout: ChannelLayout::Rgba,
    actual_bit_depth: bit_depth,
    expected_bit_depth: bit_depth,
    config: config.clone(),
  };
  if !result.dimensions_match {
    return result;
  }

  let (width, height) = actual_dims;
  let total_pixels = (width as u64) * (height as u64);
  let mut diff_image = config
    .generate_diff_image
    .then(|| RgbaImage::new(width, height));

  let mut stats = DiffStatistics {
    total_pixels,
    ..DiffStatistics::default()
  };
  let mut sum_squared_error = 0.0f64;

  for ((x, y, actual_px), expected_px) in actual.enumerate_pixels().zip(expected.pixels()) {
    let diffs: [(u8, f64); 4] =
      std::array::from_fn(|i| actual_px.0[i].scaled_diff(expected_px.0[i]));
    let [dr, dg, db, da] = diffs.map(|(d, _)| d);

    stats.max_red_diff = stats.max_red_diff.max(dr);
    stats.max_green_diff = stats.max_green_diff.max(dg);
    stats.max_blue_diff = stats.max_blue_diff.max(db);
    stats.max_alpha_diff = stats.max_alpha_diff.max(da);

    let compared = if config.compare_alpha { 4 } else { 3 };
    sum_squared_error += diffs[..compared].iter().map(|&(_, d)| d * d).sum::<f64>();

    let alpha_diff = if config.compare_alpha { da } else { 0 };
    let intensity = dr.max(dg).max(db).max(alpha_diff);
    let is_different = intensity > config.channel_tolerance;

    if is_different {
      stats.different_pixels += 1;
      stats.first_difference.get_or_insert((x, y));
      match stats.bounds.as_mut() {
        Some(bounds) => bounds.include(x, y),
        None => stats.bounds = Some(DiffBounds::at(x, y)),
      }
    }

    if let Some(ref mut diff_img) = diff_image {
      let highlight = if is_different {
        // Red with alpha scaled by magnitude so tiny drifts stay visible.
        Rgba([255, 0, 0, intensity.saturating_mul(2).max(64)])
      } else {
        Rgba([0, 0, 0, 0])
      };
      diff_img.put_pixel(x, y, highlight);
    }
  }

  if total_pixels > 0 {
    stats.different_percent = (stats.different_pixels as f64 / total_pixels as f64) * 100.0;
    let channels = if config.compare_alpha { 4.0 } else { 3.0 };
    stats.mse = sum_squared_error / (total_pixels as f64 * channels);
  }

  result.matches = stats.different_percent <= config.max_different_percent + f64::EPSILON
    && (config.max_different_percent > 0.0 || stats.different_pixels == 0);
  result.statistics = stats;
  result.diff_image = diff_image;
  result
}
