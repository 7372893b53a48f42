use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;

use sdmeta::metadata::ImageMetadata;
use sdmeta::{config, pipeline};

#[derive(Parser, Debug)]
#[command(
    name = "sdmeta",
    version,
    about = "Read and re-embed AI image generation metadata in PNG and JPEG files"
)]
struct Cli {
    /// Image files or directories to process
    #[arg(value_name = "PATH")]
    paths: Vec<PathBuf>,

    /// Path to config file (default: sdmeta.json next to binary)
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Initialize a default sdmeta.json and exit
    #[arg(long)]
    init: bool,

    /// Sparse metadata patch to write, as inline JSON or @file
    #[arg(long, value_name = "JSON|@FILE")]
    patch: Option<String>,

    /// Show the merged result without writing to files
    #[arg(long)]
    dry_run: bool,

    /// Write a <file>.metadata.txt report next to every image
    #[arg(long)]
    export: bool,

    /// Output results as JSON
    #[arg(long)]
    json: bool,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level))
        .format_timestamp(None)
        .init();

    if cli.init {
        let config = config::Config::default();
        let path = cli.config.as_deref();
        config.save(path)?;
        let save_path = match path {
            Some(p) => p.to_path_buf(),
            None => config::Config::config_path()?,
        };
        println!("Default config written to {}", save_path.display());
        return Ok(());
    }

    if cli.paths.is_empty() {
        anyhow::bail!("No input files or directories specified. Use --help for usage.");
    }

    let mut config = config::Config::load(cli.config.as_deref())?;
    if cli.dry_run {
        config.output.dry_run = true;
    }
    if cli.export {
        config.output.export_reports = true;
    }

    let patch = cli.patch.as_deref().map(pipeline::load_patch).transpose()?;

    let images = pipeline::collect_images(&cli.paths);
    if images.is_empty() {
        anyhow::bail!("No supported image files found in the specified paths.");
    }

    log::info!("Found {} image(s) to process", images.len());
    if config.output.dry_run && patch.is_some() {
        log::info!("DRY RUN: no files will be modified");
    }

    let mut results = Vec::new();
    let total = images.len();

    for (i, image_path) in images.iter().enumerate() {
        log::debug!("[{}/{}] {}", i + 1, total, image_path.display());

        let result = pipeline::process_image(image_path, patch.as_ref(), &config);

        if let Some(ref err) = result.error {
            log::error!("{}: {err}", image_path.display());
        }
        if let Some(ref written) = result.written_to {
            log::info!("  Wrote: {}", written.display());
        }
        if let Some(ref report) = result.report_path {
            log::info!("  Report: {}", report.display());
        }
        if !cli.json {
            if let Some(ref meta) = result.metadata {
                print_metadata(image_path, meta);
            }
        }

        results.push(result);
    }

    if cli.json {
        let json_results: Vec<serde_json::Value> = results
            .iter()
            .map(|r| {
                serde_json::json!({
                    "path": r.path.display().to_string(),
                    "metadata": r.metadata,
                    "written_to": r.written_to.as_ref().map(|p| p.display().to_string()),
                    "report_path": r.report_path.as_ref().map(|p| p.display().to_string()),
                    "error": r.error,
                })
            })
            .collect();

        println!("{}", serde_json::to_string_pretty(&json_results)?);
    }

    let failed = results.iter().filter(|r| r.error.is_some()).count();
    log::info!(
        "Done: {} succeeded, {failed} failed out of {total} images",
        total - failed
    );

    Ok(())
}

// ANSI color codes
const DIM: &str = "\x1b[2m";
const RESET: &str = "\x1b[0m";
const BOLD: &str = "\x1b[1m";

/// Max width for the value column before wrapping.
const VAL_WIDTH: usize = 46;
/// Indent for continuation lines (tag column width + " : " = 25 chars + 2 leading spaces).
const INDENT: &str = "                           ";

/// Print the resolved record for one file.
fn print_metadata(path: &std::path::Path, meta: &ImageMetadata) {
    println!();
    println!("{BOLD}File:{RESET} {}", path.display());
    println!("  {DIM}{}{RESET}", "─".repeat(70));

    let seed = meta.seed.as_ref().map(|s| s.to_string());
    let steps = meta.steps.map(|s| s.to_string());
    let cfg = meta.cfg.map(|c| c.to_string());
    let rows: [(&str, Option<&str>); 10] = [
        ("Generator", Some(meta.generator.label())),
        ("Prompt", meta.prompt.as_deref()),
        ("Negative", meta.negative.as_deref()),
        ("Model", meta.model.as_deref()),
        ("Sampler", meta.sampler.as_deref()),
        ("Scheduler", meta.scheduler.as_deref()),
        ("Steps", steps.as_deref()),
        ("CFG", cfg.as_deref()),
        ("Seed", seed.as_deref()),
        ("Size", meta.size.as_deref()),
    ];
    for (tag, val) in rows {
        if let Some(v) = val {
            print_row(tag, v);
        }
    }

    if meta.is_empty() {
        println!("  {DIM}(no generation metadata found){RESET}");
    }
}

/// Print a single row in the metadata table.
fn print_row(tag: &str, val: &str) {
    let tag_col = format!("{:<22}", tag);
    let lines = wrap_text(val, VAL_WIDTH);
    for (i, line) in lines.iter().enumerate() {
        if i == 0 {
            println!("  {tag_col} : {line}");
        } else {
            println!("  {INDENT}{line}");
        }
    }
}

/// Wrap text at word boundaries to fit within max_width.
fn wrap_text(s: &str, max_width: usize) -> Vec<String> {
    let mut lines = Vec::new();
    let mut current_line = String::new();

    for word in s.split_whitespace() {
        if current_line.is_empty() {
            current_line = word.to_string();
        } else if current_line.len() + 1 + word.len() <= max_width {
            current_line.push(' ');
            current_line.push_str(word);
        } else {
            lines.push(current_line);
            current_line = word.to_string();
        }
    }

    if !current_line.is_empty() {
        lines.push(current_line);
    }

    if lines.is_empty() {
        lines.push(s.to_string());
    }

    lines
}
