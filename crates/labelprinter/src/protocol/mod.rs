//! Printer protocol definitions.
//!
//! The label printer speaks TSPL: ASCII setup commands terminated by CRLF,
//! followed by a `BITMAP` command carrying a raw 1-bit payload.

pub mod tspl;

pub use tspl::{INK_THRESHOLD, MAX_HEIGHT_DOTS, PrintCommandBuffer, decode_image, encode, encode_bytes};
