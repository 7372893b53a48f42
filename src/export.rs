//! Plain-text metadata reports (`<image>.metadata.txt`).

use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use log::info;

use crate::config::Config;
use crate::metadata::ImageMetadata;
use crate::reader::read_metadata_with;
use crate::writer::atomic_write;

const RAW_HEADER: &str = "--- RAW ---";

/// Render the human-readable report for one record.
pub fn render_report(meta: &ImageMetadata) -> String {
    let mut out = String::new();
    let mut line = |label: &str, value: Option<String>| {
        if let Some(value) = value {
            let _ = writeln!(out, "{label}: {value}");
        }
    };

    line("Prompt", meta.prompt.clone());
    line("Negative", meta.negative.clone());
    line("Model", meta.model.clone());
    line("Sampler", meta.sampler.clone());
    line("Steps", meta.steps.map(|s| s.to_string()));
    line("CFG", meta.cfg.map(|c| c.to_string()));
    line("Seed", meta.seed.as_ref().map(|s| s.to_string()));
    line("Size", meta.size.clone());

    let raw = serde_json::to_string_pretty(&meta.raw).unwrap_or_default();
    let _ = write!(out, "\n{RAW_HEADER}\n{raw}\n");
    out
}

/// `<image path>.metadata.txt`
pub fn report_path(image: &Path) -> PathBuf {
    let mut name = image.as_os_str().to_owned();
    name.push(".metadata.txt");
    PathBuf::from(name)
}

/// Read `image` and write its report next to it.
pub fn export_report(image: &Path, config: &Config) -> Result<PathBuf> {
    let meta = read_metadata_with(image, &config.reader)
        .with_context(|| format!("Failed to read {}", image.display()))?;
    let path = report_path(image);
    atomic_write(&path, render_report(&meta).as_bytes(), config.writer.preserve_permissions)?;
    info!("Exported report: {}", path.display());
    Ok(path)
}
