//! TSPL bitmap encoder.
//!
//! Frame layout:
//! ```text
//! CLS\r\n
//! SIZE <w>,<h>\r\n
//! GAP <gap> mm,0\r\n
//! DIRECTION <0|1>\r\n
//! BITMAP 0,0,<width_bytes>,<height>,0,<payload>
//! \r\nPRINT 1\r\n
//! ```
//! Payload bits: 1 = ink, 8 dots per byte, MSB first, rows top to bottom.

use image::DynamicImage;
use tracing::debug;

use crate::label::LabelOptions;
use crate::{PrinterError, Result};

/// Channel values at or below this print as ink.
pub const INK_THRESHOLD: u8 = 128;

/// Encoded command stream for one print.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrintCommandBuffer {
    bytes: Vec<u8>,
    height: u32,
}

impl PrintCommandBuffer {
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Bitmap height in dots after resizing.
    pub fn height_dots(&self) -> u32 {
        self.height
    }
}

impl AsRef<[u8]> for PrintCommandBuffer {
    fn as_ref(&self) -> &[u8] {
        &self.bytes
    }
}

/// Decode an encoded image file (PNG, JPEG, ...) from memory.
pub fn decode_image(bytes: &[u8]) -> Result<DynamicImage> {
    image::load_from_memory(bytes).map_err(|e| PrinterError::EncodeFailed(e.to_string()))
}

/// Decode an image file and encode it for printing.
pub fn encode_bytes(bytes: &[u8], label: &LabelOptions) -> Result<PrintCommandBuffer> {
    let image = decode_image(bytes)?;
    encode(&image, label)
}

/// Encode a raster image into a complete TSPL print job.
pub fn encode(image: &DynamicImage, label: &LabelOptions) -> Result<PrintCommandBuffer> {
    let (src_w, src_h) = (image.width(), image.height());
    if src_w == 0 || src_h == 0 {
        return Err(PrinterError::EncodeFailed(format!(
            "image has zero area ({src_w}x{src_h})"
        )));
    }
    if label.dot_width == 0 {
        return Err(PrinterError::EncodeFailed("dot width is zero".into()));
    }

    let height = scaled_height(src_w, src_h, label.dot_width)?;
    let width_bytes = label.width_bytes();

    let header = format!(
        "CLS\r\nSIZE {},{}\r\nGAP {} mm,0\r\nDIRECTION {}\r\nBITMAP 0,0,{},{},0,",
        format_dim(label.width_in),
        format_dim(label.height_in),
        format_dim(label.gap_mm),
        label.direction.as_flag(),
        width_bytes,
        height,
    );
    const FOOTER: &[u8] = b"\r\nPRINT 1\r\n";

    let payload_len = width_bytes * height as usize;
    let mut bytes = Vec::with_capacity(header.len() + payload_len + FOOTER.len());
    bytes.extend_from_slice(header.as_bytes());
    let src = image.to_rgba8();
    let columns: Vec<u32> = (0..label.dot_width)
        .map(|x| nearest(x, src_w, label.dot_width))
        .collect();
    for y in 0..height {
        let sy = nearest(y, src_h, height);
        let row = columns
            .iter()
            .map(|&sx| is_ink(channel_value(src.get_pixel(sx, sy).0)));
        bytes.extend(pack_row(row, width_bytes));
    }
    bytes.extend_from_slice(FOOTER);

    debug!(
        src_w,
        src_h,
        dot_width = label.dot_width,
        height,
        payload_len,
        total = bytes.len(),
        "Encoded TSPL bitmap"
    );

    Ok(PrintCommandBuffer { bytes, height })
}

/// Tallest bitmap accepted, in dots.
pub const MAX_HEIGHT_DOTS: u32 = 65_535;

/// Height after scaling `src_w x src_h` to `dot_width`, rounded, at least 1.
///
/// Fails when the result would exceed [`MAX_HEIGHT_DOTS`].
pub fn scaled_height(src_w: u32, src_h: u32, dot_width: u32) -> Result<u32> {
    let (w, h, d) = (u64::from(src_w), u64::from(src_h), u64::from(dot_width));
    let height = ((h * d + w / 2) / w).max(1);
    if height > u64::from(MAX_HEIGHT_DOTS) {
        return Err(PrinterError::EncodeFailed(format!(
            "{src_w}x{src_h} scaled to {dot_width} dots is {height} dots tall (max {MAX_HEIGHT_DOTS})"
        )));
    }
    Ok(height as u32)
}

/// Nearest source index for output index `dst`: `src = dst * src_len / dst_len`.
///
/// No filtering: each output dot copies exactly one source pixel, so the
/// threshold step sees original values only.
fn nearest(dst: u32, src_len: u32, dst_len: u32) -> u32 {
    (u64::from(dst) * u64::from(src_len) / u64::from(dst_len)) as u32
}

/// Red channel composited over white paper.
fn channel_value([r, _, _, a]: [u8; 4]) -> u8 {
    let (r, a) = (u32::from(r), u32::from(a));
    ((r * a + 255 * (255 - a) + 127) / 255) as u8
}

fn is_ink(value: u8) -> bool {
    value <= INK_THRESHOLD
}

/// Pack one row of dots into `width_bytes` bytes, MSB first, zero padded.
pub fn pack_row(dots: impl IntoIterator<Item = bool>, width_bytes: usize) -> Vec<u8> {
    let mut out = vec![0u8; width_bytes];
    for (i, ink) in dots.into_iter().enumerate().take(width_bytes * 8) {
        if ink {
            out[i / 8] |= 0x80 >> (i % 8);
        }
    }
    out
}

/// `4.0` -> `"4"`, `2.5` -> `"2.5"`.
fn format_dim(value: f32) -> String {
    if value.fract() == 0.0 {
        format!("{}", value as i64)
    } else {
        format!("{value}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{GrayImage, Luma, Rgba, RgbaImage};
    use pretty_assertions::assert_eq;

    const HEADER_800: &str = "CLS\r\nSIZE 4,6\r\nGAP 3 mm,0\r\nDIRECTION 1\r\n";

    fn gray(width: u32, height: u32, f: impl Fn(u32, u32) -> u8) -> DynamicImage {
        DynamicImage::ImageLuma8(GrayImage::from_fn(width, height, |x, y| Luma([f(x, y)])))
    }

    /// Split an encoded job into (bitmap header line, payload).
    fn split_payload(buf: &PrintCommandBuffer) -> (String, Vec<u8>) {
        let bytes = buf.as_bytes();
        let start = bytes
            .windows(7)
            .position(|w| w == b"BITMAP ")
            .expect("BITMAP command");
        let mut commas = 0;
        let mut data_start = start;
        for (i, b) in bytes[start..].iter().enumerate() {
            if *b == b',' {
                commas += 1;
                if commas == 5 {
                    data_start = start + i + 1;
                    break;
                }
            }
        }
        let footer = b"\r\nPRINT 1\r\n";
        assert!(bytes.ends_with(footer));
        let header = String::from_utf8(bytes[start..data_start].to_vec()).unwrap();
        (header, bytes[data_start..bytes.len() - footer.len()].to_vec())
    }

    #[test]
    fn frame_matches_tspl_layout() {
        let img = gray(800, 2, |_, _| 255);
        let buf = encode(&img, &LabelOptions::default()).unwrap();
        let text = String::from_utf8_lossy(buf.as_bytes());
        assert!(text.starts_with(HEADER_800));
        assert!(text.contains("BITMAP 0,0,100,2,0,"));
        assert!(buf.as_bytes().ends_with(b"\r\nPRINT 1\r\n"));
        assert_eq!(
            buf.len(),
            HEADER_800.len() + "BITMAP 0,0,100,2,0,".len() + 200 + "\r\nPRINT 1\r\n".len()
        );
    }

    #[test]
    fn payload_length_is_width_bytes_times_height() {
        for (w, h, dots) in [(300, 400, 800), (1, 1, 800), (1000, 333, 800), (37, 91, 203)] {
            let label = LabelOptions::new().with_dot_width(dots);
            let buf = encode(&gray(w, h, |x, y| ((x + y) % 256) as u8), &label).unwrap();
            let (_, payload) = split_payload(&buf);
            let height = scaled_height(w, h, dots).unwrap();
            assert_eq!(buf.height_dots(), height);
            assert_eq!(payload.len(), label.width_bytes() * height as usize);
        }
    }

    #[test]
    fn threshold_boundary_is_inclusive_at_128() {
        let label = LabelOptions::new().with_dot_width(8);
        let img = gray(8, 1, |x, _| if x < 4 { 128 } else { 129 });
        let (_, payload) = split_payload(&encode(&img, &label).unwrap());
        assert_eq!(payload, vec![0b1111_0000]);
    }

    #[test]
    fn threshold_is_monotonic_over_full_range() {
        let label = LabelOptions::new().with_dot_width(256);
        let img = gray(256, 1, |x, _| x as u8);
        let (_, payload) = split_payload(&encode(&img, &label).unwrap());
        // 0..=128 are ink: 16 full bytes plus the MSB of byte 16
        assert!(payload[..16].iter().all(|&b| b == 0xff));
        assert_eq!(payload[16], 0x80);
        assert!(payload[17..].iter().all(|&b| b == 0x00));
    }

    #[test]
    fn padding_bits_are_zero() {
        let label = LabelOptions::new().with_dot_width(10);
        let img = gray(10, 3, |_, _| 0);
        let (header, payload) = split_payload(&encode(&img, &label).unwrap());
        assert_eq!(header, "BITMAP 0,0,2,3,0,");
        for row in payload.chunks(2) {
            assert_eq!(row, [0xff, 0b1100_0000]);
        }
    }

    #[test]
    fn striped_300x400_scales_to_full_rows() {
        // 50px horizontal bands: even bands black, odd bands white
        let img = gray(300, 400, |_, y| if (y / 50) % 2 == 0 { 0 } else { 255 });
        let buf = encode(&img, &LabelOptions::default()).unwrap();
        let (header, payload) = split_payload(&buf);
        assert_eq!(header, "BITMAP 0,0,100,1067,0,");

        for (y, row) in payload.chunks(100).enumerate() {
            let src_y = y * 400 / 1067;
            let expected = if (src_y / 50) % 2 == 0 { 0xff } else { 0x00 };
            assert!(row.iter().all(|&b| b == expected), "row {y}");
        }
    }

    #[test]
    fn checkerboard_300x400_maps_each_dot_to_one_source_pixel() {
        let cell = 30;
        let img = gray(300, 400, |x, y| {
            if ((x / cell) + (y / cell)) % 2 == 0 { 0 } else { 255 }
        });
        let buf = encode(&img, &LabelOptions::default()).unwrap();
        let (_, payload) = split_payload(&buf);
        assert_eq!(payload.len(), 100 * 1067);

        for y in [0usize, 1, 79, 80, 500, 1066] {
            let sy = y * 400 / 1067;
            let expected = pack_row(
                (0..800usize).map(|x| {
                    let sx = x * 300 / 800;
                    ((sx as u32 / cell) + (sy as u32 / cell)) % 2 == 0
                }),
                100,
            );
            assert_eq!(&payload[y * 100..(y + 1) * 100], expected.as_slice(), "row {y}");
        }
    }

    #[test]
    fn transparent_pixels_are_paper() {
        let label = LabelOptions::new().with_dot_width(8);
        let img = DynamicImage::ImageRgba8(RgbaImage::from_fn(8, 1, |x, _| {
            if x == 0 { Rgba([0, 0, 0, 255]) } else { Rgba([0, 0, 0, 0]) }
        }));
        let (_, payload) = split_payload(&encode(&img, &label).unwrap());
        assert_eq!(payload, vec![0x80]);
    }

    #[test]
    fn encoding_is_deterministic() {
        let img = gray(123, 77, |x, y| ((x * 7 + y * 13) % 256) as u8);
        let label = LabelOptions::default();
        assert_eq!(encode(&img, &label).unwrap(), encode(&img, &label).unwrap());
    }

    #[test]
    fn zero_area_image_fails() {
        let img = DynamicImage::ImageLuma8(GrayImage::new(0, 10));
        assert!(matches!(
            encode(&img, &LabelOptions::default()),
            Err(PrinterError::EncodeFailed(_))
        ));
    }

    #[test]
    fn oversized_height_fails_before_allocating() {
        // 4x20000 at 800 dots would be 4,000,000 rows
        let img = gray(4, 20_000, |_, _| 0);
        let err = encode(&img, &LabelOptions::default()).unwrap_err();
        assert!(matches!(err, PrinterError::EncodeFailed(ref msg) if msg.contains("4000000")));
        assert!(scaled_height(800, u32::MAX, 800).is_err());
    }

    #[test]
    fn tallest_accepted_height_encodes() {
        let label = LabelOptions::new().with_dot_width(8);
        let buf = encode(&gray(8, MAX_HEIGHT_DOTS, |_, _| 255), &label).unwrap();
        assert_eq!(buf.height_dots(), MAX_HEIGHT_DOTS);
    }

    #[test]
    fn undecodable_bytes_fail() {
        assert!(matches!(
            encode_bytes(b"definitely not an image", &LabelOptions::default()),
            Err(PrinterError::EncodeFailed(_))
        ));
    }

    #[test]
    fn fractional_dimensions_keep_their_decimals() {
        assert_eq!(format_dim(4.0), "4");
        assert_eq!(format_dim(2.5), "2.5");
        assert_eq!(format_dim(0.0), "0");
    }

    #[test]
    fn pack_row_is_msb_first() {
        assert_eq!(pack_row([true], 1), vec![0x80]);
        assert_eq!(pack_row([false, true], 1), vec![0x40]);
        assert_eq!(pack_row(std::iter::repeat_n(true, 8), 1), vec![0xff]);
        assert_eq!(pack_row(std::iter::repeat_n(true, 9), 2), vec![0xff, 0x80]);
    }
}
