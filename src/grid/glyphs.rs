//! Built-in 5x5 bitmap font used when no TrueType font can be loaded.
//!
//! Only `0-9` and `A-Z` have glyphs; other characters render as blanks.

use image::{Rgb, RgbImage};
use imageproc::drawing::draw_filled_rect_mut;
use imageproc::rect::Rect;

/// Glyph height and width in font units.
pub const GLYPH_SIZE: u32 = 5;

// Each glyph: 5 rows, each row is a u8 where bit4=leftmost pixel, bit0=rightmost.
// Index 0-9 = digits '0'-'9', index 10-35 = letters 'A'-'Z'.
const FONT_5X5: [[u8; 5]; 36] = [
    [0b01110, 0b10001, 0b10001, 0b10001, 0b01110], // 0
    [0b00100, 0b01100, 0b00100, 0b00100, 0b01110], // 1
    [0b01110, 0b10001, 0b00110, 0b01000, 0b11111], // 2
    [0b11110, 0b00001, 0b00110, 0b00001, 0b11110], // 3
    [0b00110, 0b01010, 0b10010, 0b11111, 0b00010], // 4
    [0b11111, 0b10000, 0b11110, 0b00001, 0b11110], // 5
    [0b01110, 0b10000, 0b11110, 0b10001, 0b01110], // 6
    [0b11111, 0b00001, 0b00010, 0b00100, 0b00100], // 7
    [0b01110, 0b10001, 0b01110, 0b10001, 0b01110], // 8
    [0b01110, 0b10001, 0b01111, 0b00001, 0b01110], // 9
    [0b01110, 0b10001, 0b11111, 0b10001, 0b10001], // A
    [0b11110, 0b10001, 0b11110, 0b10001, 0b11110], // B
    [0b01110, 0b10000, 0b10000, 0b10000, 0b01110], // C
    [0b11100, 0b10010, 0b10001, 0b10010, 0b11100], // D
    [0b11111, 0b10000, 0b11110, 0b10000, 0b11111], // E
    [0b11111, 0b10000, 0b11110, 0b10000, 0b10000], // F
    [0b01110, 0b10000, 0b10011, 0b10001, 0b01110], // G
    [0b10001, 0b10001, 0b11111, 0b10001, 0b10001], // H
    [0b01110, 0b00100, 0b00100, 0b00100, 0b01110], // I
    [0b00111, 0b00010, 0b00010, 0b10010, 0b01100], // J
    [0b10001, 0b10010, 0b11100, 0b10010, 0b10001], // K
    [0b10000, 0b10000, 0b10000, 0b10000, 0b11111], // L
    [0b10001, 0b11011, 0b10101, 0b10001, 0b10001], // M
    [0b10001, 0b11001, 0b10101, 0b10011, 0b10001], // N
    [0b01110, 0b10001, 0b10001, 0b10001, 0b01110], // O
    [0b11110, 0b10001, 0b11110, 0b10000, 0b10000], // P
    [0b01110, 0b10001, 0b10101, 0b10010, 0b01101], // Q
    [0b11110, 0b10001, 0b11110, 0b10010, 0b10001], // R
    [0b01111, 0b10000, 0b01110, 0b00001, 0b11110], // S
    [0b11111, 0b00100, 0b00100, 0b00100, 0b00100], // T
    [0b10001, 0b10001, 0b10001, 0b10001, 0b01110], // U
    [0b10001, 0b10001, 0b10001, 0b01010, 0b00100], // V
    [0b10001, 0b10001, 0b10101, 0b11011, 0b10001], // W
    [0b10001, 0b01010, 0b00100, 0b01010, 0b10001], // X
    [0b10001, 0b01010, 0b00100, 0b00100, 0b00100], // Y
    [0b11111, 0b00010, 0b00100, 0b01000, 0b11111], // Z
];

fn glyph(c: char) -> Option<&'static [u8; 5]> {
    let c = c.to_ascii_uppercase();
    let idx = match c {
        '0'..='9' => (c as u8 - b'0') as usize,
        'A'..='Z' => 10 + (c as u8 - b'A') as usize,
        _ => return None,
    };
    FONT_5X5.get(idx)
}

/// Pixel scale that makes the bitmap font roughly `label_size` tall.
pub fn scale_for(label_size: u32) -> u32 {
    (label_size / 7).max(1)
}

/// Rendered size of `text` in pixels at `scale`.
pub fn text_size(text: &str, scale: u32) -> (u32, u32) {
    let chars = text.chars().count() as u32;
    if chars == 0 {
        return (0, 0);
    }
    let width = chars * GLYPH_SIZE * scale + (chars - 1) * scale;
    (width, GLYPH_SIZE * scale)
}

/// Draw `text` with its top-left corner at `(x, y)`.
pub fn draw_text(canvas: &mut RgbImage, color: Rgb<u8>, x: i32, y: i32, scale: u32, text: &str) {
    let advance = ((GLYPH_SIZE + 1) * scale) as i32;
    for (i, c) in text.chars().enumerate() {
        let Some(rows) = glyph(c) else { continue };
        let origin_x = x + i as i32 * advance;
        for (row, &bits) in rows.iter().enumerate() {
            for col in 0..GLYPH_SIZE {
                if (bits >> (GLYPH_SIZE - 1 - col)) & 1 == 0 {
                    continue;
                }
                draw_filled_rect_mut(
                    canvas,
                    Rect::at(
                        origin_x + (col * scale) as i32,
                        y + (row as u32 * scale) as i32,
                    )
                    .of_size(scale, scale),
                    color,
                );
            }
        }
    }
}
