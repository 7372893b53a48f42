use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Top-level configuration for sdmeta.
///
/// Controls how hard the reader looks for metadata, how the writer treats
/// the original file, and CLI output behavior.
///
/// # Loading
///
/// ```rust,no_run
/// use sdmeta::config::Config;
///
/// // From a JSON file
/// let config = Config::load(Some("sdmeta.json".as_ref())).unwrap();
///
/// // Or use defaults and customize
/// let mut config = Config::default();
/// config.reader.sidecar_fallback = false;
/// config.writer.backup_originals = true;
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Resolution pipeline settings.
    pub reader: ReaderConfig,
    /// Atomic writer settings.
    pub writer: WriterConfig,
    /// Output behavior (dry run, report export).
    pub output: OutputConfig,
}

/// Controls candidate discovery in the resolution pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReaderConfig {
    /// Look for a same-basename `.json`/`.txt` file when nothing usable is embedded.
    pub sidecar_fallback: bool,
    /// Brute-force scan the whole file for JSON and parameters text (JPEG and other formats).
    pub scan_whole_file: bool,
    /// Whole-file scans look at no more than this many leading bytes.
    pub max_scan_bytes: usize,
    /// Cap on the deduplicated candidate string set.
    pub max_candidates: usize,
}

/// Controls how the writer replaces files.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WriterConfig {
    /// If `true`, copy the original to `<name>.<ext>.bak` once before the first rewrite.
    pub backup_originals: bool,
    /// If `true`, the rewritten file keeps the original's permissions.
    pub preserve_permissions: bool,
}

/// Output and behavior configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    /// If `true`, show the merged record without modifying any files.
    pub dry_run: bool,
    /// If `true`, write a `<file>.metadata.txt` report next to every image.
    pub export_reports: bool,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            sidecar_fallback: true,
            scan_whole_file: true,
            max_scan_bytes: 64 * 1024 * 1024,
            max_candidates: 256,
        }
    }
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            backup_originals: false,
            preserve_permissions: true,
        }
    }
}

impl Config {
    /// Resolve the config file path: `sdmeta.json` next to the executable.
    pub fn config_path() -> Result<PathBuf> {
        let exe_path = std::env::current_exe().context("Failed to get executable path")?;
        let exe_dir = exe_path
            .parent()
            .context("Failed to get executable directory")?;
        Ok(exe_dir.join("sdmeta.json"))
    }

    /// Load config from the given path, or from the default location.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config_path = match path {
            Some(p) => p.to_path_buf(),
            None => Self::config_path()?,
        };

        if !config_path.exists() {
            log::warn!(
                "Config file not found at {}. Using defaults.",
                config_path.display()
            );
            return Ok(Self::default());
        }

        let contents =
            std::fs::read_to_string(&config_path).context("Failed to read config file")?;
        let config: Config =
            serde_json::from_str(&contents).context("Failed to parse config file")?;
        Ok(config)
    }

    /// Save config to the given path, or to the default location.
    pub fn save(&self, path: Option<&Path>) -> Result<()> {
        let config_path = match path {
            Some(p) => p.to_path_buf(),
            None => Self::config_path()?,
        };

        let contents = serde_json::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(&config_path, contents).context("Failed to write config file")?;
        log::info!("Config saved to {}", config_path.display());
        Ok(())
    }
}
