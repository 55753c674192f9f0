//! Configuration resolution
//!
//! Each setting resolves through the same priority order:
//! 1. Command-line argument (highest priority)
//! 2. Environment variable (via clap's env support)
//! 3. TOML config file
//! 4. Compiled default (fallback)

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Parser;
use serde::Deserialize;

pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_MODEL_PATH: &str = "artifacts/model.gbdt";

/// Command-line arguments for boxpick
#[derive(Parser, Debug, Default)]
#[command(name = "boxpick")]
#[command(about = "Box-id prediction service")]
#[command(version)]
pub struct Args {
    /// Port to listen on
    #[arg(short, long, env = "BOXPICK_PORT")]
    pub port: Option<u16>,

    /// Path to the trained model artifact
    #[arg(short, long, env = "BOXPICK_MODEL_PATH")]
    pub model_path: Option<PathBuf>,

    /// Path to a TOML config file
    #[arg(short, long, env = "BOXPICK_CONFIG")]
    pub config: Option<PathBuf>,
}

/// Optional TOML config file contents
#[derive(Debug, Default, Deserialize)]
pub struct TomlConfig {
    pub port: Option<u16>,
    pub model_path: Option<PathBuf>,
}

/// Fully resolved application configuration
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub port: u16,
    pub model_path: PathBuf,
}

impl AppConfig {
    /// Resolve configuration from parsed arguments.
    pub fn resolve(args: &Args) -> Result<Self> {
        let toml_config = load_toml_config(args.config.as_deref())?;
        Ok(Self::from_tiers(args, &toml_config))
    }

    fn from_tiers(args: &Args, toml_config: &TomlConfig) -> Self {
        Self {
            port: args.port.or(toml_config.port).unwrap_or(DEFAULT_PORT),
            model_path: args
                .model_path
                .clone()
                .or_else(|| toml_config.model_path.clone())
                .unwrap_or_else(|| PathBuf::from(DEFAULT_MODEL_PATH)),
        }
    }
}

/// Load the TOML config file.
///
/// An explicitly given path must parse; a missing file at the default
/// locations is not an error. Default locations: `./boxpick.toml`, then
/// `<config_dir>/boxpick/boxpick.toml`.
fn load_toml_config(explicit: Option<&Path>) -> Result<TomlConfig> {
    let path = match explicit {
        Some(path) => path.to_path_buf(),
        None => match default_config_path() {
            Some(path) => path,
            None => return Ok(TomlConfig::default()),
        },
    };

    let content = std::fs::read_to_string(&path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    toml::from_str(&content)
        .with_context(|| format!("failed to parse config file {}", path.display()))
}

fn default_config_path() -> Option<PathBuf> {
    let local = PathBuf::from("boxpick.toml");
    if local.exists() {
        return Some(local);
    }
    let user = dirs::config_dir()?.join("boxpick").join("boxpick.toml");
    if user.exists() {
        return Some(user);
    }
    None
}
