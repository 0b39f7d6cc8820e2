//! PNG decoding for approved and received images.
//!
//! Decoder settings are registered once per process with [`init`] (or
//! [`init_with`]) before the first image is loaded. Every later load reads the
//! same settings; re-initialisation with different limits is ignored.

use crate::error::{Error, ImageRole, LoadError, LoadErrorKind, Result};
use image::{ColorType, ImageBuffer, ImageFormat, ImageReader, Limits, Rgba, RgbaImage};
use serde::Serialize;
use std::fs;
use std::io::Cursor;
use std::path::Path;
use std::sync::OnceLock;

/// Decoder limits applied to every PNG the harness loads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CodecSettings {
  pub max_width: u32,
  pub max_height: u32,
  /// Upper bound on bytes allocated while decoding a single image.
  pub max_alloc: u64,
}

impl Default for CodecSettings {
  fn default() -> Self {
    Self {
      max_width: 16_384,
      max_height: 16_384,
      max_alloc: 1024 * 1024 * 1024,
    }
  }
}

impl CodecSettings {
  fn limits(&self) -> Limits {
    let mut limits = Limits::default();
    limits.max_image_width = Some(self.max_width);
    limits.max_image_height = Some(self.max_height);
    limits.max_alloc = Some(self.max_alloc);
    limits
  }
}

/// RGBA with 16 bits per channel, used when the source PNG is 16-bit.
pub type Rgba16Image = ImageBuffer<Rgba<u16>, Vec<u16>>;

static CODEC: OnceLock<CodecSettings> = OnceLock::new();

/// Register the PNG codec with default settings. Idempotent.
pub fn init() -> &'static CodecSettings {
  init_with(CodecSettings::default())
}

/// Register the PNG codec with explicit settings.
///
/// The first call wins; the returned reference is the settings actually in effect.
pub fn init_with(settings: CodecSettings) -> &'static CodecSettings {
  let active = CODEC.get_or_init(|| {
    tracing::debug!(?settings, "registered PNG codec");
    settings
  });
  if *active != settings {
    tracing::warn!(
      requested = ?settings,
      active = ?active,
      "PNG codec already registered; keeping existing settings"
    );
  }
  active
}

fn settings() -> &'static CodecSettings {
  CODEC.get_or_init(CodecSettings::default)
}

/// Channel layout of the PNG as stored on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelLayout {
  Luma,
  LumaAlpha,
  Rgb,
  Rgba,
}

impl ChannelLayout {
  fn from_color(color: ColorType) -> Self {
    match (color.has_color(), color.has_alpha()) {
      (false, false) => ChannelLayout::Luma,
      (false, true) => ChannelLayout::LumaAlpha,
      (true, false) => ChannelLayout::Rgb,
      (true, true) => ChannelLayout::Rgba,
    }
  }

  pub fn label(&self) -> &'static str {
    match self {
      ChannelLayout::Luma => "gray",
      ChannelLayout::LumaAlpha => "gray+alpha",
      ChannelLayout::Rgb => "RGB",
      ChannelLayout::Rgba => "RGBA",
    }
  }
}

/// A decoded image normalised to RGBA8, remembering its original layout.
///
/// 16-bit sources additionally keep their full-depth samples in `pixels16`.
#[derive(Debug, Clone)]
pub struct DecodedImage {
  pub pixels: RgbaImage,
  pub pixels16: Option<Rgba16Image>,
  pub layout: ChannelLayout,
  /// Bits per channel of the source PNG after decoding (8 or 16).
  pub bit_depth: u8,
}

impl DecodedImage {
  /// An 8-bit image with the given source layout.
  pub fn from_rgba8(pixels: RgbaImage, layout: ChannelLayout) -> Self {
    Self {
      pixels,
      pixels16: None,
      layout,
      bit_depth: 8,
    }
  }

  pub fn dimensions(&self) -> (u32, u32) {
    self.pixels.dimensions()
  }
}

fn channel_bits(color: ColorType) -> u8 {
  let bits = color.bits_per_pixel() / u16::from(color.channel_count());
  if bits > 8 {
    16
  } else {
    8
  }
}

/// Decode PNG bytes.
pub fn decode_png(data: &[u8]) -> std::result::Result<DecodedImage, image::ImageError> {
  let mut reader = ImageReader::new(Cursor::new(data));
  reader.set_format(ImageFormat::Png);
  reader.limits(settings().limits());
  let image = reader.decode()?;
  let color = image.color();
  let bit_depth = channel_bits(color);
  Ok(DecodedImage {
    layout: ChannelLayout::from_color(color),
    pixels: image.to_rgba8(),
    pixels16: (bit_depth == 16).then(|| image.to_rgba16()),
    bit_depth,
  })
}

/// Load a PNG from disk, attributing any failure to `role`.
pub fn load_png(path: &Path, role: ImageRole) -> std::result::Result<DecodedImage, LoadError> {
  let load_error = |kind| LoadError {
    role,
    path: path.to_path_buf(),
    kind,
  };

  let data = fs::read(path).map_err(|e| {
    if e.kind() == std::io::ErrorKind::NotFound {
      load_error(LoadErrorKind::Missing)
    } else {
      load_error(LoadErrorKind::Io(e.to_string()))
    }
  })?;

  decode_png(&data).map_err(|e| load_error(LoadErrorKind::Decode(e.to_string())))
}

/// Encode an RGBA image to PNG bytes.
pub fn encode_png(image: &RgbaImage) -> std::result::Result<Vec<u8>, image::ImageError> {
  let mut buffer = Vec::new();
  image.write_to(&mut Cursor::new(&mut buffer), ImageFormat::Png)?;
  Ok(buffer)
}

/// Encode and write an RGBA image as PNG, creating parent directories.
pub fn save_png(image: &RgbaImage, path: &Path) -> Result<()> {
  let encoded = encode_png(image).map_err(|e| {
    Error::io(
      path,
      std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()),
    )
  })?;
  if let Some(parent) = path.parent() {
    if !parent.as_os_str().is_empty() {
      fs::create_dir_all(parent).map_err(|e| Error::io(parent, e))?;
    }
  }
  fs::write(path, encoded).map_err(|e| Error::io(path, e))
}
