//! Built-in calibration label.

use image::{DynamicImage, GrayImage, Luma};

const TEST_IMAGE_HEIGHT: u32 = 240;

const INK: Luma<u8> = Luma([0]);
const PAPER: Luma<u8> = Luma([255]);

/// Border, horizontal bars, two diagonals and a row of markers, drawn at the
/// printer's native width so every dot maps 1:1.
pub fn generate_test_label(width: u32) -> DynamicImage {
    let w = width.max(8);
    let h = TEST_IMAGE_HEIGHT;

    let image = GrayImage::from_fn(w, h, |x, y| {
        let border = x < 2 || x >= w - 2 || y < 2 || y >= h - 2;
        let bar = y % 16 < 2;
        let diag = x == (y * 2) % w || x == w - 1 - ((y * 2) % w);
        let marker = y > 40 && y < 110 && (x % 48 < 12);
        if border || bar || diag || marker { INK } else { PAPER }
    });
    DynamicImage::ImageLuma8(image)
}
