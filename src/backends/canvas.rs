//! Low-fidelity raster tier
//!
//! Draws a wireframe of the document's text blocks (headings as dark bars,
//! body text as grey lines) on an in-memory surface and encodes it as PNG or
//! JPEG. No fonts, no CSS; it exists so a raster preview is possible on hosts
//! without a rendering engine.

use crate::config::CanvasConfig;
use crate::converter::{markup_content_types, validate_markup, BackendId, ConversionContext, Converter};
use crate::{ConversionResult, ConvertError, Document, TargetFormat, ValidationReport};
use async_trait::async_trait;
use image::{ImageOutputFormat, Rgb, RgbImage};
use once_cell::sync::Lazy;
use regex::Regex;
use std::io::Cursor;
use tracing::debug;

const PADDING: u32 = 32;
const BLOCK_GAP: u32 = 12;
const MIN_HEIGHT: u32 = 64;

const BACKGROUND: Rgb<u8> = Rgb([255, 255, 255]);
const HEADING_INK: Rgb<u8> = Rgb([60, 60, 60]);
const TEXT_INK: Rgb<u8> = Rgb([190, 190, 190]);

static HIDDEN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?is)<(?:script|style|head|template)\b.*?</(?:script|style|head|template)>")
        .expect("hidden-element pattern must compile")
});
static BLOCKS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?is)<(h[1-6]|p|li|pre|blockquote|td|th|figcaption|dt|dd)\b[^>]*>(.*?)</(?:h[1-6]|p|li|pre|blockquote|td|th|figcaption|dt|dd)\s*>",
    )
    .expect("block pattern must compile")
});
static TAGS: Lazy<Regex> = Lazy::new(|| Regex::new(r"<[^>]*>").expect("tag pattern must compile"));

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockKind {
    Heading(u8),
    Text,
}

/// A text block reduced to what the wireframe needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextBlock {
    pub kind: BlockKind,
    pub chars: usize,
}

impl TextBlock {
    fn metrics(&self) -> (u32, u32, u32) {
        // (char width, line height, bar height)
        match self.kind {
            BlockKind::Heading(1) => (12, 34, 20),
            BlockKind::Heading(_) => (10, 28, 16),
            BlockKind::Text => (7, 16, 8),
        }
    }
}

fn visible_chars(fragment: &str) -> usize {
    TAGS.replace_all(fragment, " ")
        .split_whitespace()
        .map(|word| word.chars().count() + 1)
        .sum::<usize>()
        .saturating_sub(1)
}

/// Pull the visible text blocks out of `markup`.
pub fn extract_blocks(markup: &str) -> Vec<TextBlock> {
    let visible = HIDDEN.replace_all(markup, "");
    let mut blocks: Vec<TextBlock> = BLOCKS
        .captures_iter(&visible)
        .filter_map(|caps| {
            let tag = caps.get(1)?.as_str().to_ascii_lowercase();
            let chars = visible_chars(caps.get(2)?.as_str());
            if chars == 0 {
                return None;
            }
            let kind = match tag.strip_prefix('h').and_then(|level| level.parse::<u8>().ok()) {
                Some(level) => BlockKind::Heading(level),
                None => BlockKind::Text,
            };
            Some(TextBlock { kind, chars })
        })
        .collect();

    if blocks.is_empty() {
        let chars = visible_chars(&visible);
        if chars > 0 {
            blocks.push(TextBlock {
                kind: BlockKind::Text,
                chars,
            });
        }
    }
    blocks
}

fn fill_rect(image: &mut RgbImage, x: u32, y: u32, width: u32, height: u32, color: Rgb<u8>) {
    let x_end = (x + width).min(image.width());
    let y_end = (y + height).min(image.height());
    for py in y..y_end {
        for px in x..x_end {
            image.put_pixel(px, py, color);
        }
    }
}

/// Height the wireframe for `blocks` needs at `width`.
pub fn layout_height(blocks: &[TextBlock], width: u32) -> u32 {
    let usable = width.saturating_sub(2 * PADDING).max(1);
    let body: u32 = blocks
        .iter()
        .map(|block| {
            let (char_width, line_height, _) = block.metrics();
            let per_line = (usable / char_width).max(1) as usize;
            let lines = block.chars.div_ceil(per_line) as u32;
            lines * line_height + BLOCK_GAP
        })
        .sum();
    (body + 2 * PADDING).max(MIN_HEIGHT)
}

/// Draw the wireframe. Returns the image and whether it was cut at
/// `max_pixels`.
pub fn render_wireframe(
    blocks: &[TextBlock],
    width: u32,
    max_pixels: u64,
) -> Result<(RgbImage, bool), ConvertError> {
    if width == 0 || u64::from(width) * u64::from(MIN_HEIGHT) > max_pixels {
        return Err(ConvertError::RenderFailed(format!(
            "a {width}px wide surface exceeds the {max_pixels} pixel limit"
        )));
    }

    let wanted = layout_height(blocks, width);
    let max_height = (max_pixels / u64::from(width)).min(u64::from(u32::MAX)) as u32;
    let height = wanted.min(max_height);
    let truncated = wanted > height;

    let mut image = RgbImage::from_pixel(width, height, BACKGROUND);
    let usable = width.saturating_sub(2 * PADDING).max(1);
    let mut y = PADDING;

    'blocks: for block in blocks {
        let (char_width, line_height, bar_height) = block.metrics();
        let ink = match block.kind {
            BlockKind::Heading(_) => HEADING_INK,
            BlockKind::Text => TEXT_INK,
        };
        let per_line = (usable / char_width).max(1) as usize;
        let mut remaining = block.chars;

        while remaining > 0 {
            if y >= height {
                break 'blocks;
            }
            let line_chars = remaining.min(per_line);
            let bar_width = (line_chars as u32 * char_width).min(usable);
            fill_rect(&mut image, PADDING, y + (line_height - bar_height) / 2, bar_width, bar_height, ink);
            remaining -= line_chars;
            y += line_height;
        }
        y += BLOCK_GAP;
    }

    Ok((image, truncated))
}

pub fn encode(image: &RgbImage, format: TargetFormat, jpeg_quality: u8) -> Result<Vec<u8>, ConvertError> {
    let output = match format {
        TargetFormat::Png => ImageOutputFormat::Png,
        TargetFormat::Jpeg => ImageOutputFormat::Jpeg(jpeg_quality.clamp(1, 100)),
        other => {
            return Err(ConvertError::BackendUnavailable(format!(
                "canvas tier cannot produce {other}"
            )))
        }
    };

    let mut data = Vec::new();
    image
        .write_to(&mut Cursor::new(&mut data), output)
        .map_err(|e| ConvertError::RenderFailed(e.to_string()))?;
    Ok(data)
}

/// Extract, draw and encode in one go. CPU bound; call from a blocking task.
pub fn render_preview(
    markup: &str,
    config: &CanvasConfig,
    format: TargetFormat,
) -> Result<(Vec<u8>, bool), ConvertError> {
    let blocks = extract_blocks(markup);
    let (image, truncated) = render_wireframe(&blocks, config.width, config.max_pixels)?;
    let data = encode(&image, format, config.jpeg_quality)?;
    Ok((data, truncated))
}

pub struct CanvasBackend {
    config: CanvasConfig,
}

impl CanvasBackend {
    pub fn new(config: CanvasConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Converter for CanvasBackend {
    fn name(&self) -> &str {
        BackendId::Canvas.as_str()
    }

    fn backend_id(&self) -> Option<BackendId> {
        Some(BackendId::Canvas)
    }

    fn supported_content_types(&self) -> Vec<String> {
        markup_content_types()
    }

    fn output_format(&self) -> TargetFormat {
        TargetFormat::Png
    }

    fn output_formats(&self) -> Vec<TargetFormat> {
        vec![TargetFormat::Png, TargetFormat::Jpeg]
    }

    fn validate(&self, document: &Document) -> ValidationReport {
        validate_markup(document, self.config.max_document_size, self.name())
    }

    async fn convert(
        &self,
        document: &Document,
        context: &ConversionContext,
    ) -> Result<ConversionResult, ConvertError> {
        let format = context.target;
        if !format.is_raster() {
            return Err(ConvertError::BackendUnavailable(format!(
                "canvas tier cannot produce {format}"
            )));
        }

        let markup = document.content.clone();
        let config = self.config.clone();
        let task = tokio::task::spawn_blocking(move || render_preview(&markup, &config, format));
        let (data, truncated) = context
            .cancel
            .run(task)
            .await?
            .map_err(|e| ConvertError::RenderFailed(format!("canvas task failed: {e}")))??;

        debug!("Canvas preview: {} bytes (truncated: {})", data.len(), truncated);

        let mut result = ConversionResult::new(data, format, document, self.name())
            .with_extra("width", self.config.width);
        if truncated {
            result = result.with_extra("truncated", true);
        }
        Ok(result)
    }
}
