//! CAPTCHA raster rendering.
//!
//! Background fill, then noise dots and lines, then the glyphs with random
//! jitter and dark colours, then (hard tier only) a horizontal sine-wave
//! shear. The result is PNG-encoded.

use std::f64::consts::TAU;
use std::io::Cursor;
use std::path::Path;

use ab_glyph::{FontArc, PxScale};
use gatehouse_common::{CaptchaDifficulty, GuardError};
use image::{DynamicImage, ImageFormat, Rgba, RgbaImage};
use imageproc::drawing::{draw_filled_rect_mut, draw_line_segment_mut, draw_text_mut};
use imageproc::rect::Rect;
use rand::Rng;

use super::glyphs::{GLYPH_COLS, GLYPH_ROWS, glyph, is_set};

const BACKGROUND: Rgba<u8> = Rgba([240, 240, 245, 255]);
const LINE_COLOR: Rgba<u8> = Rgba([200, 200, 200, 255]);
const NOISE_LINES: usize = 3;
/// One noise dot per this many pixels
const PIXELS_PER_DOT: u32 = 50;

/// Renders solution text into PNG images
pub struct CaptchaRenderer {
    width: u32,
    height: u32,
    font: Option<FontArc>,
}

impl CaptchaRenderer {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            font: None,
        }
    }

    pub fn with_font(mut self, font: FontArc) -> Self {
        self.font = Some(font);
        self
    }

    /// Load a TrueType/OpenType font from disk
    pub fn load_font(path: &Path) -> Result<FontArc, GuardError> {
        let bytes = std::fs::read(path).map_err(|e| {
            GuardError::Config(format!("cannot read CAPTCHA font {}: {e}", path.display()))
        })?;
        FontArc::try_from_vec(bytes).map_err(|e| {
            GuardError::Config(format!("invalid CAPTCHA font {}: {e}", path.display()))
        })
    }

    /// Render `text` and return PNG bytes
    pub fn render(&self, text: &str, difficulty: CaptchaDifficulty) -> Result<Vec<u8>, GuardError> {
        let mut rng = rand::rng();
        let mut img = RgbaImage::from_pixel(self.width, self.height, BACKGROUND);

        self.add_noise(&mut img, &mut rng);
        self.draw_text(&mut img, text, &mut rng);

        if difficulty.distorted() {
            img = wave_distort(&img, &mut rng);
        }

        let mut png = Vec::new();
        DynamicImage::ImageRgba8(img)
            .write_to(&mut Cursor::new(&mut png), ImageFormat::Png)
            .map_err(|e| GuardError::Internal(format!("CAPTCHA encoding failed: {e}")))?;

        Ok(png)
    }

    fn add_noise(&self, img: &mut RgbaImage, rng: &mut impl Rng) {
        let dots = self.width * self.height / PIXELS_PER_DOT;
        for _ in 0..dots {
            let x = rng.random_range(0..self.width);
            let y = rng.random_range(0..self.height);
            let gray = rng.random_range(0..128u8) + 127;
            img.put_pixel(x, y, Rgba([gray, gray, gray, 255]));
        }

        for _ in 0..NOISE_LINES {
            let start = (
                rng.random_range(0..self.width) as f32,
                rng.random_range(0..self.height) as f32,
            );
            let end = (
                rng.random_range(0..self.width) as f32,
                rng.random_range(0..self.height) as f32,
            );
            draw_line_segment_mut(img, start, end, LINE_COLOR);
        }
    }

    fn draw_text(&self, img: &mut RgbaImage, text: &str, rng: &mut impl Rng) {
        let len = text.chars().count().max(1) as u32;
        let char_width = self.width / len;

        for (i, ch) in text.chars().enumerate() {
            let color = Rgba([
                rng.random_range(0..128u8),
                rng.random_range(0..128u8),
                rng.random_range(0..128u8),
                255,
            ]);
            let x = (i as u32 * char_width) as i32 + rng.random_range(0..10);
            let jitter = rng.random_range(-5..=5);

            match &self.font {
                Some(font) => {
                    let px = self.height as f32 * 0.55;
                    let y = ((self.height as f32 - px) / 2.0) as i32 + jitter;
                    draw_text_mut(img, color, x, y, PxScale::from(px), font, &ch.to_string());
                }
                None => {
                    let scale = ((self.height * 45 / 100) / GLYPH_ROWS)
                        .min((char_width * 70 / 100) / GLYPH_COLS)
                        .max(1);
                    let y = (self.height.saturating_sub(GLYPH_ROWS * scale) / 2) as i32 + jitter;
                    draw_bitmap_glyph(img, ch, x, y, scale, color);
                }
            }
        }
    }
}

fn draw_bitmap_glyph(img: &mut RgbaImage, ch: char, x: i32, y: i32, scale: u32, color: Rgba<u8>) {
    let Some(rows) = glyph(ch) else {
        return;
    };

    for row in 0..GLYPH_ROWS {
        for col in 0..GLYPH_COLS {
            if is_set(rows, col, row) {
                let cell = Rect::at(x + (col * scale) as i32, y + (row * scale) as i32)
                    .of_size(scale, scale);
                draw_filled_rect_mut(img, cell, color);
            }
        }
    }
}

/// Shift each row horizontally along a sine wave
fn wave_distort(img: &RgbaImage, rng: &mut impl Rng) -> RgbaImage {
    let (width, height) = img.dimensions();
    let amplitude = rng.random_range(3.0..5.0);
    let wavelength = (height as f64 / 2.0).max(1.0);
    let phase = rng.random_range(0.0..TAU);

    let mut out = RgbaImage::from_pixel(width, height, BACKGROUND);
    for y in 0..height {
        let shift = (amplitude * (y as f64 / wavelength * TAU + phase).sin()).round() as i64;
        for x in 0..width {
            let src = x as i64 + shift;
            if (0..width as i64).contains(&src) {
                out.put_pixel(x, y, *img.get_pixel(src as u32, y));
            }
        }
    }
    out
}
