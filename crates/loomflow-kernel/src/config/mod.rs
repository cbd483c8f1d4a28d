//! Configuration loading
//!
//! Engine settings (executor limits, default resilience policies, circuit
//! breaker thresholds) are plain serde structs. This module turns files or
//! strings in any format the `config` crate understands into those structs.
//!
//! - Format detected from the file extension
//! - `${VAR}` / `$VAR` environment substitution before parsing
//! - Layering: later sources override earlier ones

use config::{Config as Cfg, File};
use regex::Regex;
use serde::de::DeserializeOwned;
use std::path::Path;
use std::sync::LazyLock;

pub use config::FileFormat;


/// Errors raised while loading configuration.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Config parsing error: {0}")]
    Parse(String),

    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("Deserialization error: {0}")]
    Deserialize(String),
}

/// Result type for config operations
pub type ConfigResult<T> = Result<T, ConfigError>;

static BRACED_VAR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("static regex is valid")
});

static BARE_VAR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$([A-Za-z_][A-Za-z0-9_]*)\b").expect("static regex is valid")
});

/// Map a file extension to a [`FileFormat`].
///
/// ```rust
/// use loomflow_kernel::config::{detect_format, FileFormat};
///
/// assert_eq!(detect_format("engine.yml").unwrap(), FileFormat::Yaml);
/// assert!(detect_format("engine.xml").is_err());
/// ```
pub fn detect_format(path: impl AsRef<Path>) -> ConfigResult<FileFormat> {
    let ext = path
        .as_ref()
        .extension()
        .and_then(|e| e.to_str())
        .ok_or_else(|| ConfigError::UnsupportedFormat("no file extension".to_string()))?;

    match ext.to_lowercase().as_str() {
        "yaml" | "yml" => Ok(FileFormat::Yaml),
        "toml" => Ok(FileFormat::Toml),
        "json" => Ok(FileFormat::Json),
        "ini" => Ok(FileFormat::Ini),
        "ron" => Ok(FileFormat::Ron),
        "json5" => Ok(FileFormat::Json5),
        other => Err(ConfigError::UnsupportedFormat(other.to_string())),
    }
}

/// Replace `${VAR}` and `$VAR` references with environment values.
///
/// Unknown variables are left untouched so that the parse error (if any)
/// points at the original text.
pub fn substitute_env_vars(content: &str) -> String {
    let braced = BRACED_VAR.replace_all(content, |caps: &regex::Captures| {
        std::env::var(&caps[1]).unwrap_or_else(|_| caps[0].to_string())
    });

    BARE_VAR
        .replace_all(&braced, |caps: &regex::Captures| {
            std::env::var(&caps[1]).unwrap_or_else(|_| caps[0].to_string())
        })
        .into_owned()
}

fn build<T: DeserializeOwned>(sources: Vec<(String, FileFormat)>) -> ConfigResult<T> {
    let mut builder = Cfg::builder();
    for (content, format) in sources {
        builder = builder.add_source(File::from_str(&substitute_env_vars(&content), format));
    }

    builder
        .build()
        .map_err(|e| ConfigError::Parse(e.to_string()))?
        .try_deserialize()
        .map_err(|e| ConfigError::Deserialize(e.to_string()))
}

/// Parse configuration text in an explicit format.
pub fn from_str<T: DeserializeOwned>(content: &str, format: FileFormat) -> ConfigResult<T> {
    build(vec![(content.to_string(), format)])
}

/// Load a single configuration file.
///
/// ```rust,ignore
/// let engine: EngineConfig = loomflow_kernel::config::load_config("loomflow.toml")?;
/// ```
pub fn load_config<T: DeserializeOwned>(path: impl AsRef<Path>) -> ConfigResult<T> {
    load_layered(&[path])
}

/// Load several files; keys in later files override earlier ones.
pub fn load_layered<T, P>(paths: &[P]) -> ConfigResult<T>
where
    T: DeserializeOwned,
    P: AsRef<Path>,
{
    let mut sources = Vec::with_capacity(paths.len());
    for path in paths {
        let format = detect_format(path)?;
        sources.push((std::fs::read_to_string(path)?, format));
    }
    build(sources)
}
