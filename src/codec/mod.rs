//! Container codecs: PNG chunks, JPEG segments, EXIF tag text.

pub mod exif;
pub mod jpeg;
pub mod png;

pub use jpeg::JpegFile;
pub use png::{PngChunk, TextChunks};
