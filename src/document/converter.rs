//! Normalizes a single attachment into page-bearing PDF.
//!
//! Input is classified once into [`Media`]; documents pass through untouched
//! and raster images become exactly one page, oriented by the image's aspect,
//! scaled to fit inside the page margins and centered.

use image::{DynamicImage, ImageFormat};
use lopdf::content::{Content, Operation};
use lopdf::{Document, Stream, dictionary};

use super::error::ConversionError;
use super::merge::{media_box, single_page_document};
use crate::validation;

/// A4 in PDF points.
pub const A4_WIDTH_PT: f32 = 595.0;
pub const A4_HEIGHT_PT: f32 = 842.0;
pub const DEFAULT_MARGIN_MM: f32 = 10.0;

const POINTS_PER_MM: f32 = 72.0 / 25.4;
const PDF_MAGIC: &[u8] = b"%PDF-";
// The header may be preceded by junk bytes.
const PDF_HEADER_WINDOW: usize = 1024;

/// Classified attachment content.
#[derive(Debug, Clone, PartialEq)]
pub enum Media {
    Document(Vec<u8>),
    Image { bytes: Vec<u8>, format: ImageFormat },
}

impl Media {
    /// Classify by content signature first, then by declared media type or file name.
    ///
    /// Image magic is anchored at offset 0 and wins over a `%PDF-` marker
    /// found later in the header window, which may sit in image metadata.
    pub fn classify(bytes: Vec<u8>, media_type: &str, name: &str) -> Result<Media, ConversionError> {
        if let Ok(format) = image::guess_format(&bytes)
            && is_supported_image(format)
        {
            return Ok(Media::Image { bytes, format });
        }
        if has_pdf_header(&bytes) {
            return Ok(Media::Document(bytes));
        }
        if validation::is_pdf(media_type, name) {
            return Ok(Media::Document(bytes));
        }
        if validation::is_image(media_type, name) {
            let format = declared_image_format(media_type, name).ok_or_else(|| {
                ConversionError::UnsupportedMediaType(media_type.to_string())
            })?;
            return Ok(Media::Image { bytes, format });
        }

        let declared = if media_type.trim().is_empty() {
            format!("unknown ({name})")
        } else {
            media_type.to_string()
        };
        Err(ConversionError::UnsupportedMediaType(declared))
    }
}

/// Page geometry used when placing images.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PageLayout {
    pub width: f32,
    pub height: f32,
    pub margin: f32,
}

impl Default for PageLayout {
    fn default() -> Self {
        Self::a4(DEFAULT_MARGIN_MM)
    }
}

/// Where an image lands on its page, in points from the lower-left corner.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Placement {
    pub page_width: f32,
    pub page_height: f32,
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl PageLayout {
    pub fn a4(margin_mm: f32) -> Self {
        Self {
            width: A4_WIDTH_PT,
            height: A4_HEIGHT_PT,
            margin: margin_mm.max(0.0) * POINTS_PER_MM,
        }
    }

    /// Landscape when the image is wider than tall, portrait otherwise.
    pub fn place(&self, image_width: u32, image_height: u32) -> Placement {
        let (short, long) = (self.width.min(self.height), self.width.max(self.height));
        let (page_width, page_height) = if image_width > image_height {
            (long, short)
        } else {
            (short, long)
        };

        let (w, h) = (image_width as f32, image_height as f32);
        let available_w = (page_width - 2.0 * self.margin).max(1.0);
        let available_h = (page_height - 2.0 * self.margin).max(1.0);
        let scale = (available_w / w).min(available_h / h);
        let (width, height) = (w * scale, h * scale);

        Placement {
            page_width,
            page_height,
            x: (page_width - width) / 2.0,
            y: (page_height - height) / 2.0,
            width,
            height,
        }
    }
}

pub struct DocumentConverter {
    layout: PageLayout,
}

impl DocumentConverter {
    pub fn new(layout: PageLayout) -> Self {
        Self { layout }
    }

    /// Produce PDF bytes for an attachment. Documents come back unchanged.
    pub fn convert(&self, media: Media) -> Result<Vec<u8>, ConversionError> {
        match media {
            Media::Document(bytes) => Ok(bytes),
            Media::Image { bytes, format } => {
                let mut doc = self.image_document(&bytes, format)?;
                let mut out = Vec::new();
                doc.save_to(&mut out)
                    .map_err(|e| ConversionError::Pdf(e.to_string()))?;
                Ok(out)
            }
        }
    }

    /// Like [`convert`](Self::convert) but hands back the parsed document,
    /// which is what the merger consumes.
    pub fn load(&self, media: Media) -> Result<Document, ConversionError> {
        match media {
            Media::Document(bytes) => {
                Document::load_mem(&bytes).map_err(|e| ConversionError::Pdf(e.to_string()))
            }
            Media::Image { bytes, format } => self.image_document(&bytes, format),
        }
    }

    fn image_document(&self, bytes: &[u8], format: ImageFormat) -> Result<Document, ConversionError> {
        let img = image::load_from_memory_with_format(bytes, format)
            .map_err(|e| ConversionError::ImageDecode(e.to_string()))?;
        let (width, height) = (img.width(), img.height());
        if width == 0 || height == 0 {
            return Err(ConversionError::ImageDecode("image has no pixels".into()));
        }
        let placement = self.layout.place(width, height);

        tracing::debug!(
            width,
            height,
            ?format,
            page_width = placement.page_width,
            page_height = placement.page_height,
            "Placing image on page"
        );

        let mut doc = Document::with_version("1.5");
        let image_id = doc.add_object(Stream::new(
            dictionary! {
                "Type" => "XObject",
                "Subtype" => "Image",
                "Width" => i64::from(width),
                "Height" => i64::from(height),
                "ColorSpace" => "DeviceRGB",
                "BitsPerComponent" => 8,
            },
            rgb_over_white(&img),
        ));

        let content = Content {
            operations: vec![
                Operation::new("q", vec![]),
                Operation::new(
                    "cm",
                    vec![
                        placement.width.into(),
                        0.into(),
                        0.into(),
                        placement.height.into(),
                        placement.x.into(),
                        placement.y.into(),
                    ],
                ),
                Operation::new("Do", vec!["Im0".into()]),
                Operation::new("Q", vec![]),
            ],
        };
        let encoded = content
            .encode()
            .map_err(|e| ConversionError::Pdf(e.to_string()))?;
        let content_id = doc.add_object(Stream::new(dictionary! {}, encoded));

        let page = dictionary! {
            "MediaBox" => media_box(placement.page_width, placement.page_height),
            "Contents" => content_id,
            "Resources" => dictionary! {
                "XObject" => dictionary! { "Im0" => image_id },
            },
        };
        let mut doc = single_page_document(doc, page);
        doc.compress();
        Ok(doc)
    }
}

fn has_pdf_header(bytes: &[u8]) -> bool {
    let window = &bytes[..bytes.len().min(PDF_HEADER_WINDOW)];
    window.windows(PDF_MAGIC.len()).any(|w| w == PDF_MAGIC)
}

fn is_supported_image(format: ImageFormat) -> bool {
    matches!(format, ImageFormat::Jpeg | ImageFormat::Png | ImageFormat::WebP)
}

fn declared_image_format(media_type: &str, name: &str) -> Option<ImageFormat> {
    let media_type = media_type.trim().to_lowercase();
    let token = match media_type.strip_prefix("image/") {
        Some(subtype) => subtype.to_string(),
        None => name.rsplit_once('.')?.1.to_lowercase(),
    };
    match token.as_str() {
        "jpeg" | "jpg" => Some(ImageFormat::Jpeg),
        "png" => Some(ImageFormat::Png),
        "webp" => Some(ImageFormat::WebP),
        _ => None,
    }
}

/// Raw 8-bit RGB samples; transparent pixels are composited over white.
fn rgb_over_white(img: &DynamicImage) -> Vec<u8> {
    if !img.color().has_alpha() {
        return img.to_rgb8().into_raw();
    }
    let rgba = img.to_rgba8();
    let mut out = Vec::with_capacity(rgba.width() as usize * rgba.height() as usize * 3);
    for pixel in rgba.pixels() {
        let alpha = u16::from(pixel[3]);
        for channel in &pixel.0[..3] {
            let blended = (u16::from(*channel) * alpha + 255 * (255 - alpha)) / 255;
            out.push(blended as u8);
        }
    }
    out
}
