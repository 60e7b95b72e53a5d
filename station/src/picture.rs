use chrono::{DateTime, Local};
use image::{Rgb, RgbImage};

/// Top-left corner of the stamp, in pixels.
pub const STAMP_ORIGIN: (u32, u32) = (10, 10);

const GLYPH_WIDTH: u32 = 5;
const GLYPH_HEIGHT: u32 = 7;
const STAMP_COLOR: Rgb<u8> = Rgb([255, 255, 255]);

/// `"{label} yy-mm-dd HH:MM"`, the text burned into every recorded frame.
pub fn stamp_text(label: &str, now: &DateTime<Local>) -> String {
    format!("{} {} {}", label, now.format("%y-%m-%d"), now.format("%H:%M"))
}

/// Draws `stamp_text` at `STAMP_ORIGIN`, clipped to the image.
pub fn stamp(image: &mut RgbImage, label: &str, now: &DateTime<Local>) {
    let scale = (image.height() / 360).max(1);
    draw_text(image, &stamp_text(label, now), STAMP_ORIGIN, scale);
}

pub fn draw_text(image: &mut RgbImage, text: &str, (left, top): (u32, u32), scale: u32) {
    let advance = (GLYPH_WIDTH + 1) * scale;

    for (i, c) in text.chars().enumerate() {
        let glyph_left = left + i as u32 * advance;
        if glyph_left >= image.width() {
            break;
        }

        for (row, bits) in glyph(c).iter().enumerate() {
            for col in 0..GLYPH_WIDTH {
                if bits & (1 << (GLYPH_WIDTH - 1 - col)) == 0 {
                    continue;
                }

                let x = glyph_left + col * scale;
                let y = top + row as u32 * scale;
                fill_block(image, x, y, scale);
            }
        }
    }
}

fn fill_block(image: &mut RgbImage, x: u32, y: u32, size: u32) {
    for dy in 0..size {
        for dx in 0..size {
            let (px, py) = (x + dx, y + dy);
            if px < image.width() && py < image.height() {
                image.put_pixel(px, py, STAMP_COLOR);
            }
        }
    }
}

/// 5x7 bitmap, one byte per row, most significant of the low five bits on the left.
fn glyph(c: char) -> [u8; GLYPH_HEIGHT as usize] {
    match c.to_ascii_uppercase() {
        '0' => [0x0E, 0x11, 0x13, 0x15, 0x19, 0x11, 0x0E],
        '1' => [0x04, 0x0C, 0x04, 0x04, 0x04, 0x04, 0x0E],
        '2' => [0x0E, 0x11, 0x01, 0x02, 0x04, 0x08, 0x1F],
        '3' => [0x1F, 0x02, 0x04, 0x02, 0x01, 0x11, 0x0E],
        '4' => [0x02, 0x06, 0x0A, 0x12, 0x1F, 0x02, 0x02],
        '5' => [0x1F, 0x10, 0x1E, 0x01, 0x01, 0x11, 0x0E],
        '6' => [0x06, 0x08, 0x10, 0x1E, 0x11, 0x11, 0x0E],
        '7' => [0x1F, 0x01, 0x02, 0x04, 0x08, 0x08, 0x08],
        '8' => [0x0E, 0x11, 0x11, 0x0E, 0x11, 0x11, 0x0E],
        '9' => [0x0E, 0x11, 0x11, 0x0F, 0x01, 0x02, 0x0C],
        'A' => [0x0E, 0x11, 0x11, 0x1F, 0x11, 0x11, 0x11],
        'B' => [0x1E, 0x11, 0x11, 0x1E, 0x11, 0x11, 0x1E],
        'C' => [0x0E, 0x11, 0x10, 0x10, 0x10, 0x11, 0x0E],
        'D' => [0x1C, 0x12, 0x11, 0x11, 0x11, 0x12, 0x1C],
        'E' => [0x1F, 0x10, 0x10, 0x1E, 0x10, 0x10, 0x1F],
        'F' => [0x1F, 0x10, 0x10, 0x1E, 0x10, 0x10, 0x10],
        'G' => [0x0E, 0x11, 0x10, 0x17, 0x11, 0x11, 0x0F],
        'H' => [0x11, 0x11, 0x11, 0x1F, 0x11, 0x11, 0x11],
        'I' => [0x0E, 0x04, 0x04, 0x04, 0x04, 0x04, 0x0E],
        'J' => [0x07, 0x02, 0x02, 0x02, 0x02, 0x12, 0x0C],
        'K' => [0x11, 0x12, 0x14, 0x18, 0x14, 0x12, 0x11],
        'L' => [0x10, 0x10, 0x10, 0x10, 0x10, 0x10, 0x1F],
        'M' => [0x11, 0x1B, 0x15, 0x15, 0x11, 0x11, 0x11],
        'N' => [0x11, 0x11, 0x19, 0x15, 0x13, 0x11, 0x11],
        'O' => [0x0E, 0x11, 0x11, 0x11, 0x11, 0x11, 0x0E],
        'P' => [0x1E, 0x11, 0x11, 0x1E, 0x10, 0x10, 0x10],
        'Q' => [0x0E, 0x11, 0x11, 0x11, 0x15, 0x12, 0x0D],
        'R' => [0x1E, 0x11, 0x11, 0x1E, 0x14, 0x12, 0x11],
        'S' => [0x0F, 0x10, 0x10, 0x0E, 0x01, 0x01, 0x1E],
        'T' => [0x1F, 0x04, 0x04, 0x04, 0x04, 0x04, 0x04],
        'U' => [0x11, 0x11, 0x11, 0x11, 0x11, 0x11, 0x0E],
        'V' => [0x11, 0x11, 0x11, 0x11, 0x11, 0x0A, 0x04],
        'W' => [0x11, 0x11, 0x11, 0x15, 0x15, 0x15, 0x0A],
        'X' => [0x11, 0x11, 0x0A, 0x04, 0x0A, 0x11, 0x11],
        'Y' => [0x11, 0x11, 0x11, 0x0A, 0x04, 0x04, 0x04],
        'Z' => [0x1F, 0x01, 0x02, 0x04, 0x08, 0x10, 0x1F],
        '-' => [0x00, 0x00, 0x00, 0x1F, 0x00, 0x00, 0x00],
        ':' => [0x00, 0x0C, 0x0C, 0x00, 0x0C, 0x0C, 0x00],
        '.' => [0x00, 0x00, 0x00, 0x00, 0x00, 0x0C, 0x0C],
        '_' => [0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x1F],
        '/' => [0x00, 0x01, 0x02, 0x04, 0x08, 0x10, 0x00],
        '#' => [0x0A, 0x0A, 0x1F, 0x0A, 0x1F, 0x0A, 0x0A],
        _ => [0x00; GLYPH_HEIGHT as usize],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn stamp_text_has_short_date_and_minutes() {
        let now = Local.ymd(2024, 3, 9).and_hms(14, 5, 59);
        assert_eq!(stamp_text("Gate Cam", &now), "Gate Cam 24-03-09 14:05");
    }

    #[test]
    fn stamp_lights_pixels_at_origin() {
        let mut image = RgbImage::new(200, 40);
        let now = Local.ymd(2024, 3, 9).and_hms(14, 5, 0);

        stamp(&mut image, "T", &now);

        // top bar of the 'T'
        let (x, y) = STAMP_ORIGIN;
        assert_eq!(*image.get_pixel(x, y), STAMP_COLOR);
        assert_eq!(*image.get_pixel(x + 4, y), STAMP_COLOR);
        // nothing drawn above the stamp
        assert_eq!(*image.get_pixel(x, y - 1), Rgb([0, 0, 0]));
    }

    #[test]
    fn stamp_is_clipped_to_small_images() {
        let mut image = RgbImage::new(12, 12);
        let now = Local.ymd(2024, 1, 1).and_hms(0, 0, 0);
        stamp(&mut image, "TITLE", &now);
        assert_eq!(*image.get_pixel(10, 10), STAMP_COLOR);
    }
}
