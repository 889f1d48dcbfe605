//! Grid overlay rendering for screen captures.
//!
//! The annotated capture is what the decision model looks at: every cell
//! boundary is drawn, column letters run along the top and bottom edges and
//! row numbers along the left and right edges. Sparse inner labels ("C3")
//! help the model find cells far from the edges.

use ab_glyph::{FontVec, PxScale};
use base64::{engine::general_purpose::STANDARD, Engine};
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_filled_rect_mut, draw_hollow_circle_mut, draw_text_mut, text_size};
use imageproc::rect::Rect;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

use super::glyphs;
use super::spec::{column_letter, CellLabel, GridSpec};
use crate::actions::Action;
use crate::model::EncodedImage;

/// Long side of the image sent to the model.
pub const DEFAULT_MODEL_IMAGE_SIDE: u32 = 1568;

/// JPEG quality of the image sent to the model.
pub const DEFAULT_JPEG_QUALITY: u8 = 85;

const LABEL_MARGIN: i32 = 10;
const LABEL_PADDING: i32 = 4;

const CLICK_COLOR: Rgb<u8> = Rgb([255, 0, 0]);
const CLICK_RADIUS: i32 = 40;
const CLICK_RING_WIDTH: i32 = 6;
const CLICK_ARM: i32 = 60;
const CLICK_ARM_WIDTH: u32 = 4;

const TYPE_BANNER: [u8; 4] = [0, 128, 255, 200];
const AWAKE_BANNER: [u8; 4] = [0, 200, 0, 200];
const SCROLL_BANNER: [u8; 4] = [255, 140, 0, 200];

/// System fonts tried when no explicit font is configured.
const SYSTEM_FONT_CANDIDATES: &[&str] = &[
    "/usr/share/fonts/truetype/dejavu/DejaVuSans-Bold.ttf",
    "/usr/share/fonts/TTF/DejaVuSans-Bold.ttf",
    "/usr/share/fonts/dejavu/DejaVuSans-Bold.ttf",
    "/System/Library/Fonts/Supplemental/Arial Bold.ttf",
    "C:\\Windows\\Fonts\\arialbd.ttf",
];

/// Annotation errors.
#[derive(Error, Debug)]
pub enum AnnotateError {
    #[error("Failed to load font {path}: {reason}")]
    FontLoad { path: PathBuf, reason: String },
    #[error("Failed to encode image: {0}")]
    Encode(#[from] image::ImageError),
}

/// Visual style of the grid overlay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GridStyle {
    pub line_color: [u8; 3],
    pub line_width: u32,
    pub label_size: u32,
    pub label_color: [u8; 3],
    /// RGBA; the alpha channel is the box opacity.
    pub label_bg_color: [u8; 4],
    pub show_inner_labels: bool,
    pub inner_label_interval: u32,
    pub inner_label_opacity: u8,
    /// TrueType font for labels. Falls back to system fonts, then to the
    /// built-in bitmap font.
    pub font_path: Option<PathBuf>,
}

impl Default for GridStyle {
    fn default() -> Self {
        Self {
            line_color: [255, 0, 0],
            line_width: 3,
            label_size: 32,
            label_color: [255, 255, 0],
            label_bg_color: [0, 0, 0, 180],
            show_inner_labels: true,
            inner_label_interval: 3,
            inner_label_opacity: 128,
            font_path: None,
        }
    }
}

impl GridStyle {
    /// Check value ranges. Returns a description of the first violation.
    pub fn validate(&self) -> Result<(), String> {
        if !(1..=10).contains(&self.line_width) {
            return Err(format!("line_width must be 1-10, got {}", self.line_width));
        }
        if !(8..=128).contains(&self.label_size) {
            return Err(format!("label_size must be 8-128, got {}", self.label_size));
        }
        if !(1..=10).contains(&self.inner_label_interval) {
            return Err(format!(
                "inner_label_interval must be 1-10, got {}",
                self.inner_label_interval
            ));
        }
        if self.inner_label_opacity < 50 {
            return Err(format!(
                "inner_label_opacity must be 50-255, got {}",
                self.inner_label_opacity
            ));
        }
        Ok(())
    }
}

enum LabelFont {
    Vector(FontVec),
    Bitmap,
}

/// Draws grid overlays and action markers.
pub struct Annotator {
    style: GridStyle,
    font: LabelFont,
}

impl std::fmt::Debug for Annotator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let font = match self.font {
            LabelFont::Vector(_) => "vector",
            LabelFont::Bitmap => "bitmap",
        };
        f.debug_struct("Annotator")
            .field("style", &self.style)
            .field("font", &font)
            .finish()
    }
}

fn load_font(path: &Path) -> Result<FontVec, AnnotateError> {
    let data = std::fs::read(path).map_err(|e| AnnotateError::FontLoad {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    FontVec::try_from_vec(data).map_err(|e| AnnotateError::FontLoad {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}

impl Annotator {
    /// Create an annotator, loading the label font.
    ///
    /// An explicitly configured font that cannot be loaded is an error.
    /// Without one, the first readable system font is used, or the built-in
    /// bitmap font if none is found.
    pub fn new(style: GridStyle) -> Result<Self, AnnotateError> {
        let font = match &style.font_path {
            Some(path) => LabelFont::Vector(load_font(path)?),
            None => SYSTEM_FONT_CANDIDATES
                .iter()
                .map(Path::new)
                .filter(|p| p.exists())
                .find_map(|p| load_font(p).ok())
                .map(LabelFont::Vector)
                .unwrap_or(LabelFont::Bitmap),
        };
        if matches!(font, LabelFont::Bitmap) {
            tracing::debug!("No TrueType font available, using bitmap labels");
        }
        Ok(Self { style, font })
    }

    /// Create an annotator that always uses the built-in bitmap font.
    pub fn with_bitmap_font(style: GridStyle) -> Self {
        Self {
            style,
            font: LabelFont::Bitmap,
        }
    }

    pub fn style(&self) -> &GridStyle {
        &self.style
    }

    /// Overlay the grid onto a copy of `image`.
    ///
    /// The grid is scaled to the image size, so a capture whose resolution
    /// differs from the grid's screen size is still fully covered.
    pub fn annotate(&self, image: &RgbImage, grid: &GridSpec) -> RgbImage {
        let mut canvas = image.clone();
        let (width, height) = canvas.dimensions();
        if width == 0 || height == 0 {
            return canvas;
        }
        let cell_w = width as f64 / grid.columns() as f64;
        let cell_h = height as f64 / grid.rows() as f64;
        let line_width = self.style.line_width.max(1);
        let half = (line_width / 2) as i32;
        let line_color = Rgb(self.style.line_color);

        for i in 0..=grid.columns() {
            let x = (i as f64 * cell_w) as i32;
            draw_filled_rect_mut(
                &mut canvas,
                Rect::at(x - half, 0).of_size(line_width, height),
                line_color,
            );
        }
        for i in 0..=grid.rows() {
            let y = (i as f64 * cell_h) as i32;
            draw_filled_rect_mut(
                &mut canvas,
                Rect::at(0, y - half).of_size(width, line_width),
                line_color,
            );
        }

        let (_, label_h) = self.text_size("0");
        let top_y = LABEL_MARGIN + label_h as i32 / 2 + LABEL_PADDING;
        let bottom_y = height as i32 - top_y;
        for col in 0..grid.columns() {
            let Some(letter) = column_letter(col) else { continue };
            let text = letter.to_string();
            let x = ((col as f64 + 0.5) * cell_w) as i32;
            self.draw_label(&mut canvas, &text, x, top_y, None);
            self.draw_label(&mut canvas, &text, x, bottom_y, None);
        }

        for row in 0..grid.rows() {
            let text = (row + 1).to_string();
            let (label_w, _) = self.text_size(&text);
            let y = ((row as f64 + 0.5) * cell_h) as i32;
            let left_x = LABEL_MARGIN + label_w as i32 / 2 + LABEL_PADDING;
            let right_x = width as i32 - left_x;
            self.draw_label(&mut canvas, &text, left_x, y, None);
            self.draw_label(&mut canvas, &text, right_x, y, None);
        }

        if self.style.show_inner_labels {
            let interval = self.style.inner_label_interval.max(1);
            let opacity = Some(self.style.inner_label_opacity);
            for col in (interval - 1..grid.columns()).step_by(interval as usize) {
                for row in (interval - 1..grid.rows()).step_by(interval as usize) {
                    let label = CellLabel::new(col, row).to_string();
                    let x = ((col as f64 + 0.5) * cell_w) as i32;
                    let y = ((row as f64 + 0.5) * cell_h) as i32;
                    self.draw_label(&mut canvas, &label, x, y, opacity);
                }
            }
        }

        canvas
    }

    /// Draw an audit marker for `action` onto a copy of `image`.
    ///
    /// Clicks get a ring and crosshair at the target cell center. Type,
    /// launch and scroll actions get a banner at the top of the image.
    pub fn mark_action(&self, image: &RgbImage, action: &Action, grid: &GridSpec) -> RgbImage {
        let mut canvas = image.clone();
        match action {
            Action::Click { cell } => {
                let Ok((x, y)) = grid.cell_to_pixel(*cell) else {
                    return canvas;
                };
                // Captures may be scaled relative to the reported screen size.
                let x = (x as f64 * canvas.width() as f64 / grid.screen_width() as f64) as i32;
                let y = (y as f64 * canvas.height() as f64 / grid.screen_height() as f64) as i32;

                for r in (CLICK_RADIUS - CLICK_RING_WIDTH / 2)..=(CLICK_RADIUS + CLICK_RING_WIDTH / 2) {
                    draw_hollow_circle_mut(&mut canvas, (x, y), r, CLICK_COLOR);
                }
                let arm_half = (CLICK_ARM_WIDTH / 2) as i32;
                draw_filled_rect_mut(
                    &mut canvas,
                    Rect::at(x - CLICK_ARM, y - arm_half).of_size(2 * CLICK_ARM as u32, CLICK_ARM_WIDTH),
                    CLICK_COLOR,
                );
                draw_filled_rect_mut(
                    &mut canvas,
                    Rect::at(x - arm_half, y - CLICK_ARM).of_size(CLICK_ARM_WIDTH, 2 * CLICK_ARM as u32),
                    CLICK_COLOR,
                );

                let label = format!("CLICK {}", cell);
                let (_, label_h) = self.text_size(&label);
                let label_y = y - CLICK_RADIUS - LABEL_MARGIN - label_h as i32 / 2;
                self.draw_box_label(&mut canvas, &label, x, label_y, [255, 0, 0, 200]);
            }
            Action::Type { text, .. } => {
                self.draw_banner(&mut canvas, &format!("TYPE: \"{}\"", text), TYPE_BANNER);
            }
            Action::Awake { package } => {
                self.draw_banner(&mut canvas, &format!("AWAKE: {}", package), AWAKE_BANNER);
            }
            Action::Scroll { direction, .. } => {
                let text = format!("SCROLL {}", direction).to_uppercase();
                self.draw_banner(&mut canvas, &text, SCROLL_BANNER);
            }
            Action::Complete { .. } => {}
        }
        canvas
    }

    fn draw_banner(&self, canvas: &mut RgbImage, text: &str, bg: [u8; 4]) {
        let (_, text_h) = self.text_size(text);
        let center_x = canvas.width() as i32 / 2;
        let center_y = 2 * LABEL_MARGIN + text_h as i32 / 2;
        self.draw_box_label(canvas, text, center_x, center_y, bg);
    }

    fn draw_box_label(&self, canvas: &mut RgbImage, text: &str, cx: i32, cy: i32, bg: [u8; 4]) {
        let (text_w, text_h) = self.text_size(text);
        let pad = LABEL_PADDING + 2;
        let left = cx - text_w as i32 / 2;
        let top = cy - text_h as i32 / 2;
        blend_rect(
            canvas,
            left - pad,
            top - pad,
            text_w + 2 * pad as u32,
            text_h + 2 * pad as u32,
            [bg[0], bg[1], bg[2]],
            bg[3],
        );
        self.draw_text(canvas, Rgb([255, 255, 255]), left, top, text);
    }

    /// Draw `text` centered on `(cx, cy)` over a label box. `opacity`
    /// overrides the alpha of both box and text.
    fn draw_label(&self, canvas: &mut RgbImage, text: &str, cx: i32, cy: i32, opacity: Option<u8>) {
        let (text_w, text_h) = self.text_size(text);
        let left = cx - text_w as i32 / 2;
        let top = cy - text_h as i32 / 2;
        let bg = self.style.label_bg_color;
        let bg_alpha = opacity.unwrap_or(bg[3]);

        blend_rect(
            canvas,
            left - LABEL_PADDING,
            top - LABEL_PADDING,
            text_w + 2 * LABEL_PADDING as u32,
            text_h + 2 * LABEL_PADDING as u32,
            [bg[0], bg[1], bg[2]],
            bg_alpha,
        );

        let color = Rgb(self.style.label_color);
        match opacity {
            None | Some(255) => self.draw_text(canvas, color, left, top, text),
            Some(alpha) => {
                // Render onto a copy of the affected region, then blend it back.
                let Some((x0, y0, x1, y1)) = clip(canvas, left, top, text_w, text_h) else {
                    return;
                };
                let mut layer = image::imageops::crop_imm(canvas, x0, y0, x1 - x0, y1 - y0).to_image();
                self.draw_text(&mut layer, color, left - x0 as i32, top - y0 as i32, text);
                blend_layer(canvas, &layer, x0, y0, alpha);
            }
        }
    }

    fn text_size(&self, text: &str) -> (u32, u32) {
        match &self.font {
            LabelFont::Vector(font) => text_size(PxScale::from(self.style.label_size as f32), font, text),
            LabelFont::Bitmap => glyphs::text_size(text, glyphs::scale_for(self.style.label_size)),
        }
    }

    fn draw_text(&self, canvas: &mut RgbImage, color: Rgb<u8>, x: i32, y: i32, text: &str) {
        match &self.font {
            LabelFont::Vector(font) => draw_text_mut(
                canvas,
                color,
                x,
                y,
                PxScale::from(self.style.label_size as f32),
                font,
                text,
            ),
            LabelFont::Bitmap => {
                glyphs::draw_text(canvas, color, x, y, glyphs::scale_for(self.style.label_size), text)
            }
        }
    }
}

fn blend_pixel(pixel: &mut Rgb<u8>, color: [u8; 3], alpha: u8) {
    let a = alpha as f32 / 255.0;
    for (channel, target) in pixel.0.iter_mut().zip(color) {
        *channel = (*channel as f32 * (1.0 - a) + target as f32 * a).round() as u8;
    }
}

/// Clip a rectangle to the canvas, returning `(x0, y0, x1, y1)` or `None` if
/// nothing is visible.
fn clip(canvas: &RgbImage, x: i32, y: i32, w: u32, h: u32) -> Option<(u32, u32, u32, u32)> {
    let x0 = x.max(0) as i64;
    let y0 = y.max(0) as i64;
    let x1 = (x as i64 + w as i64).min(canvas.width() as i64);
    let y1 = (y as i64 + h as i64).min(canvas.height() as i64);
    if x0 >= x1 || y0 >= y1 {
        return None;
    }
    Some((x0 as u32, y0 as u32, x1 as u32, y1 as u32))
}

fn blend_rect(canvas: &mut RgbImage, x: i32, y: i32, w: u32, h: u32, color: [u8; 3], alpha: u8) {
    let Some((x0, y0, x1, y1)) = clip(canvas, x, y, w, h) else { return };
    for py in y0..y1 {
        for px in x0..x1 {
            blend_pixel(canvas.get_pixel_mut(px, py), color, alpha);
        }
    }
}

fn blend_layer(canvas: &mut RgbImage, layer: &RgbImage, x0: u32, y0: u32, alpha: u8) {
    for (lx, ly, src) in layer.enumerate_pixels() {
        blend_pixel(canvas.get_pixel_mut(x0 + lx, y0 + ly), src.0, alpha);
    }
}

/// Downscale so the long side is at most `max_side`, then JPEG-encode and
/// base64 the result.
pub fn encode_for_model(
    image: &RgbImage,
    max_side: u32,
    quality: u8,
) -> Result<EncodedImage, AnnotateError> {
    let (width, height) = image.dimensions();
    let long_side = width.max(height);
    let resized;
    let source = if long_side > max_side && max_side > 0 {
        let ratio = max_side as f64 / long_side as f64;
        let new_w = ((width as f64 * ratio).round() as u32).max(1);
        let new_h = ((height as f64 * ratio).round() as u32).max(1);
        resized = image::imageops::resize(image, new_w, new_h, FilterType::Lanczos3);
        &resized
    } else {
        image
    };

    let mut bytes = Vec::new();
    let encoder = JpegEncoder::new_with_quality(&mut bytes, quality.clamp(1, 100));
    source.write_with_encoder(encoder)?;

    Ok(EncodedImage {
        mime_type: "image/jpeg".to_string(),
        data: STANDARD.encode(&bytes),
        width: source.width(),
        height: source.height(),
    })
}

/// JPEG-encode an image at `quality` for saving to disk.
pub fn encode_jpeg(image: &RgbImage, quality: u8) -> Result<Vec<u8>, AnnotateError> {
    let mut bytes = Vec::new();
    let encoder = JpegEncoder::new_with_quality(&mut bytes, quality.clamp(1, 100));
    image.write_with_encoder(encoder)?;
    Ok(bytes)
}
