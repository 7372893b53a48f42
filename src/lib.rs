//! # sdmeta
//!
//! Read and re-embed AI image generation metadata (prompt, negative prompt,
//! model, sampler, steps, CFG, seed, size) in PNG and JPEG files, whatever
//! tool produced them: AUTOMATIC1111, ComfyUI, InvokeAI, NovelAI, SD.Next,
//! Fooocus or plain sidecar text.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use sdmeta::{read_metadata, write_metadata, MetadataPatch};
//! use std::path::Path;
//!
//! fn main() -> anyhow::Result<()> {
//!     let path = Path::new("render.png");
//!
//!     // Resolve whatever the file carries into one normalized record
//!     let meta = read_metadata(path)?;
//!     println!("{}: {:?}", meta.generator, meta.prompt);
//!
//!     // Sparse update: only `steps` and `seed` change
//!     let patch = MetadataPatch {
//!         steps: Some(30),
//!         seed: Some(sdmeta::Seed::Int(1234)),
//!         ..Default::default()
//!     };
//!     let written = write_metadata(path, &patch)?;
//!     assert_eq!(written.steps, Some(30));
//!
//!     Ok(())
//! }
//! ```
//!
//! ## Batch Processing
//!
//! ```rust,no_run
//! use sdmeta::config::Config;
//! use sdmeta::pipeline::{collect_images, process_image};
//! use std::path::PathBuf;
//!
//! let config = Config::default();
//! for path in collect_images(&[PathBuf::from("./outputs")]) {
//!     let result = process_image(&path, None, &config);
//!     match (&result.metadata, &result.error) {
//!         (Some(meta), _) => println!("{}: {}", path.display(), meta.generator),
//!         (_, Some(err)) => eprintln!("{}: {err}", path.display()),
//!         _ => {}
//!     }
//! }
//! ```
//!
//! ## Supported Formats
//!
//! | Format | Read | Write |
//! |--------|------|-------|
//! | PNG (`.png`) | tEXt / zTXt / iTXt chunks, whole-file scan | `parameters` + `sd-metadata` iTXt chunks |
//! | JPEG (`.jpg`, `.jpeg`) | EXIF, XMP, COM, IPTC caption, whole-file scan | XMP packet (`sdx` namespace) |
//! | Anything else | Whole-file scan, `.json` / `.txt` sidecar | `.json` sidecar |
//!
//! ## Modules
//!
//! - [`codec`]: PNG chunk and JPEG segment codecs, EXIF text
//! - [`text`]: encoding detection, JSON extraction, parameters grammar, XMP helpers
//! - [`lift`]: per-generator lifters onto [`ImageMetadata`]
//! - [`reader`]: the resolution pipeline
//! - [`writer`]: atomic re-embedding
//! - [`sidecar`], [`export`], [`config`], [`pipeline`]

pub mod codec;
pub mod config;
pub mod error;
pub mod export;
pub mod lift;
pub mod metadata;
pub mod pipeline;
pub mod reader;
pub mod sidecar;
pub mod text;
pub mod writer;

pub use config::Config;
pub use error::FormatError;
pub use metadata::{Generator, ImageMetadata, MetadataPatch, MetadataSource, Seed};
pub use reader::{read_metadata, read_metadata_with};
pub use writer::{write_metadata, write_metadata_with};
