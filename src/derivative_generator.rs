use crate::config::DerivativeConfig;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::metadata::Orientation;
use image::{DynamicImage, ImageDecoder, ImageFormat, ImageReader, RgbaImage};
use std::io::Cursor;
use std::path::Path;
use thiserror::Error;
use tracing::{debug, warn};

/// Errors raised while producing derivatives from a source image.
#[derive(Debug, Error)]
pub enum DerivativeError {
    #[error("unsupported image format; expected jpeg, png or webp")]
    UnsupportedFormat,
    #[error("failed to decode image: {0}")]
    Decode(#[source] image::ImageError),
    #[error("failed to encode derivative: {0}")]
    Encode(#[source] image::ImageError),
    #[error("failed to read watermark asset: {0}")]
    WatermarkAsset(#[source] std::io::Error),
}

/// Identify the source format by sniffing content, never by filename.
///
/// Only the marketplace's allowed upload formats are accepted.
pub fn sniff_format(bytes: &[u8]) -> Result<ImageFormat, DerivativeError> {
    match image::guess_format(bytes) {
        Ok(format @ (ImageFormat::Jpeg | ImageFormat::Png | ImageFormat::WebP)) => Ok(format),
        _ => Err(DerivativeError::UnsupportedFormat),
    }
}

/// Canonical file extension for a sniffed source format.
pub fn extension_for(format: ImageFormat) -> &'static str {
    match format {
        ImageFormat::Jpeg => "jpg",
        ImageFormat::Png => "png",
        ImageFormat::WebP => "webp",
        _ => "bin",
    }
}

/// Watermark asset, decoded once at startup and shared read-only.
pub struct Watermark {
    image: RgbaImage,
}

impl Watermark {
    /// Load the watermark from disk. Startup should fail fast on error
    /// instead of discovering a bad asset per-request.
    pub fn load(path: &Path) -> Result<Self, DerivativeError> {
        let bytes = std::fs::read(path).map_err(DerivativeError::WatermarkAsset)?;
        Self::from_bytes(&bytes)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, DerivativeError> {
        let image = image::load_from_memory(bytes)
            .map_err(DerivativeError::Decode)?
            .to_rgba8();
        Ok(Self { image })
    }

    /// Scale to fit inside `max_w` x `max_h` preserving aspect ratio, with
    /// `opacity` applied to the alpha channel.
    fn scaled_for(&self, max_w: u32, max_h: u32, opacity: f32) -> RgbaImage {
        let mut scaled = DynamicImage::ImageRgba8(self.image.clone())
            .resize(max_w.max(1), max_h.max(1), FilterType::Lanczos3)
            .to_rgba8();
        for pixel in scaled.pixels_mut() {
            pixel[3] = (pixel[3] as f32 * opacity).round() as u8;
        }
        scaled
    }
}

/// Derivatives produced for one source image.
#[derive(Debug)]
pub struct DerivativeSet {
    /// Compact thumbnail for gallery listings
    pub thumbnail: Vec<u8>,
    /// Watermark-protected preview (or the degraded fallback)
    pub preview: Vec<u8>,
    /// Whether the preview actually carries the watermark
    pub watermarked: bool,
}

/// Pure transform pipeline from a source image to its derivatives.
///
/// All parameters are fixed by configuration and every operation is
/// deterministic, so identical inputs produce byte-identical outputs.
pub struct DerivativeGenerator {
    config: DerivativeConfig,
    watermark: Option<Watermark>,
}

impl DerivativeGenerator {
    pub fn new(config: DerivativeConfig, watermark: Option<Watermark>) -> Self {
        Self { config, watermark }
    }

    /// Produce the thumbnail and protected preview for one source image.
    ///
    /// A thumbnail failure is fatal for the file. A preview compositing
    /// failure degrades to a plain heavily-compressed preview instead of
    /// failing the upload.
    pub fn generate(&self, bytes: &[u8]) -> Result<DerivativeSet, DerivativeError> {
        let source = decode_oriented(bytes)?;

        let thumbnail = self.thumbnail(&source)?;
        let (preview, watermarked) = match self.protected_preview(&source) {
            Ok(result) => result,
            Err(e) => {
                warn!(error = %e, "Watermark compositing failed; emitting fallback preview");
                metrics::counter!("derivative.preview.fallback").increment(1);
                (
                    self.degraded_base(
                        &source,
                        self.config.fallback_width,
                        self.config.fallback_quality,
                    )?,
                    false,
                )
            }
        };

        debug!(
            thumb_bytes = thumbnail.len(),
            preview_bytes = preview.len(),
            watermarked = watermarked,
            "Derivatives generated"
        );

        Ok(DerivativeSet {
            thumbnail,
            preview,
            watermarked,
        })
    }

    /// Resize so the longer edge hits the configured target and re-encode
    /// as compact lossy JPEG.
    fn thumbnail(&self, source: &DynamicImage) -> Result<Vec<u8>, DerivativeError> {
        let edge = self.config.thumb_max_edge;
        let resized = source.resize(edge, edge, FilterType::Lanczos3);
        encode_jpeg(&resized, self.config.thumb_quality)
    }

    /// Degrade, composite the watermark centered over the canvas, flatten.
    fn protected_preview(
        &self,
        source: &DynamicImage,
    ) -> Result<(Vec<u8>, bool), DerivativeError> {
        let degraded = self.degraded_base(
            source,
            self.config.preview_width,
            self.config.preview_quality,
        )?;

        let Some(watermark) = &self.watermark else {
            return Ok((degraded, false));
        };

        let mut canvas = image::load_from_memory(&degraded)
            .map_err(DerivativeError::Decode)?
            .to_rgba8();
        let (width, height) = canvas.dimensions();

        // The mark may cover almost the whole canvas but never exceeds
        // either dimension.
        let max_w = (width as f32 * self.config.watermark_coverage).floor() as u32;
        let max_h = (height as f32 * self.config.watermark_coverage).floor() as u32;
        let mark = watermark.scaled_for(max_w, max_h, self.config.watermark_opacity);

        let left = (width.saturating_sub(mark.width())) / 2;
        let top = (height.saturating_sub(mark.height())) / 2;
        image::imageops::overlay(&mut canvas, &mark, left as i64, top as i64);

        let flattened = DynamicImage::ImageRgba8(canvas);
        Ok((encode_jpeg(&flattened, self.config.preview_quality)?, true))
    }

    /// Resize to an exact display width and re-encode at degraded quality.
    fn degraded_base(
        &self,
        source: &DynamicImage,
        width: u32,
        quality: u8,
    ) -> Result<Vec<u8>, DerivativeError> {
        let (sw, sh) = (source.width() as u64, source.height() as u64);
        let height = ((sh * width as u64 + sw / 2) / sw).max(1) as u32;
        let resized = source.resize_exact(width, height, FilterType::Lanczos3);
        encode_jpeg(&resized, quality)
    }
}

/// Decode a source image and apply its embedded orientation metadata, so a
/// portrait photo stored with a landscape pixel grid comes out rotated the
/// way it displays.
fn decode_oriented(bytes: &[u8]) -> Result<DynamicImage, DerivativeError> {
    let format = sniff_format(bytes)?;
    let mut decoder = ImageReader::with_format(Cursor::new(bytes), format)
        .into_decoder()
        .map_err(DerivativeError::Decode)?;
    let orientation = decoder.orientation().unwrap_or(Orientation::NoTransforms);
    let mut image = DynamicImage::from_decoder(decoder).map_err(DerivativeError::Decode)?;
    image.apply_orientation(orientation);
    Ok(image)
}

/// Flatten to RGB and encode as JPEG at a fixed quality.
fn encode_jpeg(image: &DynamicImage, quality: u8) -> Result<Vec<u8>, DerivativeError> {
    let rgb = image.to_rgb8();
    let mut out = Vec::new();
    let mut encoder = JpegEncoder::new_with_quality(&mut out, quality);
    encoder.encode_image(&rgb).map_err(DerivativeError::Encode)?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage, Rgba};

    fn sample_jpeg(width: u32, height: u32) -> Vec<u8> {
        let img = RgbImage::from_fn(width, height, |x, y| {
            Rgb([(x % 256) as u8, (y % 256) as u8, ((x + y) % 256) as u8])
        });
        let mut out = Vec::new();
        let mut encoder = JpegEncoder::new_with_quality(&mut out, 90);
        encoder.encode_image(&img).unwrap();
        out
    }

    fn sample_watermark() -> Watermark {
        let img = RgbaImage::from_fn(64, 64, |x, y| {
            if (x + y) % 2 == 0 {
                Rgba([255, 255, 255, 200])
            } else {
                Rgba([0, 0, 0, 0])
            }
        });
        let mut out = Vec::new();
        DynamicImage::ImageRgba8(img)
            .write_to(&mut Cursor::new(&mut out), ImageFormat::Png)
            .unwrap();
        Watermark::from_bytes(&out).unwrap()
    }

    /// Splice an APP1 Exif segment carrying only an orientation entry
    /// right after the SOI marker.
    fn with_exif_orientation(jpeg: &[u8], orientation: u16) -> Vec<u8> {
        let tiff: [u8; 26] = [
            b'I', b'I', 0x2a, 0x00, // little-endian TIFF header
            0x08, 0x00, 0x00, 0x00, // IFD0 offset
            0x01, 0x00, // one entry
            0x12, 0x01, // tag 0x0112 (orientation)
            0x03, 0x00, // type SHORT
            0x01, 0x00, 0x00, 0x00, // count 1
            (orientation & 0xff) as u8,
            (orientation >> 8) as u8,
            0x00,
            0x00,
            0x00, 0x00, 0x00, 0x00, // no next IFD
        ];
        let mut payload = b"Exif\0\0".to_vec();
        payload.extend_from_slice(&tiff);

        let segment_len = (payload.len() + 2) as u16;
        let mut out = Vec::with_capacity(jpeg.len() + payload.len() + 4);
        out.extend_from_slice(&jpeg[..2]);
        out.extend_from_slice(&[0xff, 0xe1]);
        out.extend_from_slice(&segment_len.to_be_bytes());
        out.extend_from_slice(&payload);
        out.extend_from_slice(&jpeg[2..]);
        out
    }

    fn generator(watermark: Option<Watermark>) -> DerivativeGenerator {
        DerivativeGenerator::new(DerivativeConfig::default(), watermark)
    }

    #[test]
    fn test_sniff_format_allowlist() {
        assert!(matches!(
            sniff_format(&sample_jpeg(8, 8)),
            Ok(ImageFormat::Jpeg)
        ));
        assert!(matches!(
            sniff_format(b"definitely not an image"),
            Err(DerivativeError::UnsupportedFormat)
        ));

        // A real image in a disallowed container is still rejected
        let img = RgbImage::from_pixel(4, 4, Rgb([1, 2, 3]));
        let mut bmp = Vec::new();
        DynamicImage::ImageRgb8(img)
            .write_to(&mut Cursor::new(&mut bmp), ImageFormat::Bmp)
            .unwrap();
        assert!(matches!(
            sniff_format(&bmp),
            Err(DerivativeError::UnsupportedFormat)
        ));
    }

    #[test]
    fn test_outputs_are_deterministic() {
        let source = sample_jpeg(1200, 800);
        let generator = generator(Some(sample_watermark()));

        let first = generator.generate(&source).unwrap();
        let second = generator.generate(&source).unwrap();

        assert!(first.watermarked);
        assert_eq!(first.thumbnail, second.thumbnail);
        assert_eq!(first.preview, second.preview);
    }

    #[test]
    fn test_thumbnail_longer_edge() {
        let source = sample_jpeg(1200, 800);
        let set = generator(Some(sample_watermark())).generate(&source).unwrap();

        let thumb = image::load_from_memory(&set.thumbnail).unwrap();
        assert_eq!((thumb.width(), thumb.height()), (500, 333));
    }

    #[test]
    fn test_preview_is_decodable_and_display_width() {
        let source = sample_jpeg(1200, 800);
        let set = generator(Some(sample_watermark())).generate(&source).unwrap();

        let preview = image::load_from_memory(&set.preview).unwrap();
        assert_eq!(preview.width(), 800);
    }

    #[test]
    fn test_missing_watermark_falls_back_to_plain_preview() {
        let source = sample_jpeg(1000, 700);
        let set = generator(None).generate(&source).unwrap();

        assert!(!set.watermarked);
        let preview = image::load_from_memory(&set.preview).unwrap();
        assert_eq!(preview.width(), 800);
    }

    #[test]
    fn test_corrupt_watermark_asset_is_rejected_at_load() {
        assert!(Watermark::from_bytes(b"not a png").is_err());
    }

    #[test]
    fn test_orientation_is_applied_before_resize() {
        // Raw pixel grid is landscape; orientation 6 says rotate 90 CW for
        // display, so derivatives must come out portrait.
        let oriented = with_exif_orientation(&sample_jpeg(120, 60), 6);
        let set = generator(Some(sample_watermark())).generate(&oriented).unwrap();

        let thumb = image::load_from_memory(&set.thumbnail).unwrap();
        assert_eq!((thumb.width(), thumb.height()), (250, 500));

        let preview = image::load_from_memory(&set.preview).unwrap();
        assert_eq!(preview.width(), 800);
        assert_eq!(preview.height(), 1600);
    }

    #[test]
    fn test_corrupt_source_is_fatal() {
        // Valid JPEG magic so sniffing passes, but the stream is truncated
        let mut truncated = sample_jpeg(600, 400);
        truncated.truncate(64);

        let err = generator(None).generate(&truncated).unwrap_err();
        assert!(matches!(err, DerivativeError::Decode(_)));
    }
}
