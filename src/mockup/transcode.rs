use image::{DynamicImage, ImageFormat};
use tracing::{debug, info, warn};

/// Encoded output at or below this size is treated as a failed encode.
const MIN_ENCODED_BYTES: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssetFormat {
    Webp,
    Png,
    Jpeg,
    Gif,
    Unknown,
}

impl AssetFormat {
    pub fn detect(bytes: &[u8]) -> Self {
        match image::guess_format(bytes) {
            Ok(ImageFormat::WebP) => AssetFormat::Webp,
            Ok(ImageFormat::Png) => AssetFormat::Png,
            Ok(ImageFormat::Jpeg) => AssetFormat::Jpeg,
            Ok(ImageFormat::Gif) => AssetFormat::Gif,
            _ => AssetFormat::Unknown,
        }
    }

    /// Unknown payloads from the renderer are PNG in practice.
    pub fn extension(&self) -> &'static str {
        match self {
            AssetFormat::Webp => "webp",
            AssetFormat::Png | AssetFormat::Unknown => "png",
            AssetFormat::Jpeg => "jpg",
            AssetFormat::Gif => "gif",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Transcoded {
    pub bytes: Vec<u8>,
    pub format: AssetFormat,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TranscodeStrategy {
    Webp { quality: f32 },
    Passthrough,
}

/// Lossy WebP recompression with a deterministic fallback to the input.
#[derive(Debug, Clone, Copy)]
pub struct Transcoder {
    strategy: TranscodeStrategy,
}

impl Transcoder {
    /// Checks once that the encoder works so requests never discover it.
    pub fn detect(enabled: bool, quality: f32) -> Self {
        let strategy = if !enabled {
            TranscodeStrategy::Passthrough
        } else if encoder_available(quality) {
            TranscodeStrategy::Webp { quality }
        } else {
            warn!(target = "bridge.mockup", "webp_encoder_unavailable");
            TranscodeStrategy::Passthrough
        };
        info!(target = "bridge.mockup", strategy = ?strategy, "transcoder_ready");
        Self { strategy }
    }

    pub fn passthrough() -> Self {
        Self {
            strategy: TranscodeStrategy::Passthrough,
        }
    }

    /// Never fails: any decode or encode problem returns the input untouched.
    pub fn transcode(&self, raw: &[u8]) -> Transcoded {
        let original = || Transcoded {
            bytes: raw.to_vec(),
            format: AssetFormat::detect(raw),
        };
        let TranscodeStrategy::Webp { quality } = self.strategy else {
            return original();
        };

        let decoded = match image::load_from_memory(raw) {
            Ok(decoded) => decoded,
            Err(err) => {
                debug!(target = "bridge.mockup", error = %err, "transcode_decode_failed");
                return original();
            }
        };

        match encode_webp(&decoded, quality) {
            Some(bytes) if bytes.len() > MIN_ENCODED_BYTES => {
                debug!(
                    target = "bridge.mockup",
                    before = raw.len(),
                    after = bytes.len(),
                    "transcoded_webp"
                );
                Transcoded {
                    bytes,
                    format: AssetFormat::Webp,
                }
            }
            _ => original(),
        }
    }
}

fn encode_webp(decoded: &DynamicImage, quality: f32) -> Option<Vec<u8>> {
    let (width, height) = (decoded.width(), decoded.height());
    let encoded = if decoded.color().has_alpha() {
        let rgba = decoded.to_rgba8();
        webp::Encoder::from_rgba(rgba.as_raw(), width, height)
            .encode_simple(false, quality)
            .ok()?
            .to_vec()
    } else {
        let rgb = decoded.to_rgb8();
        webp::Encoder::from_rgb(rgb.as_raw(), width, height)
            .encode_simple(false, quality)
            .ok()?
            .to_vec()
    };
    Some(encoded)
}

fn encoder_available(quality: f32) -> bool {
    let pixel = DynamicImage::ImageRgb8(image::RgbImage::from_pixel(1, 1, image::Rgb([0, 0, 0])));
    encode_webp(&pixel, quality).is_some_and(|bytes| !bytes.is_empty())
}
