// =============================================================================
// CONFIGURATION - Load settings from config.toml
// =============================================================================
//
// Both binaries read the same config.toml from the working directory.
// Every field has a default, so a missing file (or a missing section) still
// produces a runnable setup.

use anyhow::{Context, Result};
use ash::vk;
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Read from the working directory by both binaries
pub const CONFIG_PATH: &str = "config.toml";

/// Root configuration structure
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub window: WindowConfig,
    pub graphics: GraphicsConfig,
    pub compute: ComputeConfig,
    pub debug: DebugConfig,
}

/// Window settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct WindowConfig {
    pub title: String,
    pub width: u32,
    pub height: u32,
    pub fullscreen: bool,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            title: "Learning Vulkan".to_string(),
            width: 500,
            height: 500,
            fullscreen: false,
        }
    }
}

/// Graphics settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct GraphicsConfig {
    pub present_mode: String,
    pub clear_color: [f32; 4],
    /// Empty string means "pick the first supported depth format"
    pub depth_format: String,
    pub texture_path: PathBuf,
    /// "optimal" (staged, mip-mapped) or "linear" (host-mapped, one level)
    pub texture_tiling: String,
    pub shader_dir: PathBuf,
    pub instance_count: u32,
}

impl Default for GraphicsConfig {
    fn default() -> Self {
        Self {
            present_mode: "fifo".to_string(),
            clear_color: [0.0, 0.0, 0.0, 0.0],
            depth_format: String::new(),
            texture_path: PathBuf::from("assets/texture.png"),
            texture_tiling: "optimal".to_string(),
            shader_dir: PathBuf::from("shaders"),
            instance_count: 100,
        }
    }
}

/// Headless compute settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ComputeConfig {
    pub element_count: u32,
    pub shader_path: PathBuf,
}

impl Default for ComputeConfig {
    fn default() -> Self {
        Self {
            element_count: 16384,
            shader_path: PathBuf::from("shaders/compute.comp.spv"),
        }
    }
}

/// Debug settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct DebugConfig {
    pub validation_layers: bool,
    pub log_level: String,
    pub show_fps: bool,
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            validation_layers: cfg!(debug_assertions),
            log_level: "info".to_string(),
            show_fps: true,
        }
    }
}

/// How the sample texture is laid out in GPU memory
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextureTiling {
    Optimal,
    Linear,
}

/// Where the configuration came from. Reading happens before the logger
/// exists, so the outcome is kept and reported afterwards.
#[derive(Debug)]
pub enum ConfigSource {
    File(PathBuf),
    Missing(PathBuf),
    Invalid(PathBuf, anyhow::Error),
}

impl ConfigSource {
    pub fn report(&self) {
        match self {
            ConfigSource::File(path) => log::info!("Loaded configuration from {:?}", path),
            ConfigSource::Missing(path) => {
                log::info!("Config file not found at {:?}, using defaults", path)
            }
            ConfigSource::Invalid(path, e) => {
                log::warn!("Failed to load {:?}: {:#}. Using defaults.", path, e)
            }
        }
    }
}

impl Config {
    /// Read `path`, falling back to defaults if it is missing or invalid
    pub fn resolve<P: AsRef<Path>>(path: P) -> (Self, ConfigSource) {
        let path = path.as_ref().to_path_buf();

        if !path.exists() {
            return (Config::default(), ConfigSource::Missing(path));
        }
        match Self::load_from_path(&path) {
            Ok(config) => (config, ConfigSource::File(path)),
            Err(e) => (Config::default(), ConfigSource::Invalid(path, e)),
        }
    }

    /// Load configuration from a specific path
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            return Ok(Config::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;

        Ok(config)
    }

    /// Get present mode as Vulkan enum
    pub fn present_mode(&self) -> vk::PresentModeKHR {
        match self.graphics.present_mode.to_lowercase().as_str() {
            "immediate" => vk::PresentModeKHR::IMMEDIATE,
            "mailbox" => vk::PresentModeKHR::MAILBOX,
            "fifo" => vk::PresentModeKHR::FIFO,
            "fifo_relaxed" => vk::PresentModeKHR::FIFO_RELAXED,
            _ => {
                log::warn!(
                    "Unknown present mode '{}', defaulting to FIFO",
                    self.graphics.present_mode
                );
                vk::PresentModeKHR::FIFO
            }
        }
    }

    pub fn texture_tiling(&self) -> TextureTiling {
        match self.graphics.texture_tiling.to_lowercase().as_str() {
            "optimal" => TextureTiling::Optimal,
            "linear" => TextureTiling::Linear,
            other => {
                log::warn!("Unknown texture tiling '{}', defaulting to optimal", other);
                TextureTiling::Optimal
            }
        }
    }

    /// Explicitly requested depth format, if any
    pub fn depth_format(&self) -> Option<vk::Format> {
        match self.graphics.depth_format.to_lowercase().as_str() {
            "" => None,
            "d16_unorm" => Some(vk::Format::D16_UNORM),
            "d16_unorm_s8_uint" => Some(vk::Format::D16_UNORM_S8_UINT),
            "d24_unorm_s8_uint" => Some(vk::Format::D24_UNORM_S8_UINT),
            "d32_sfloat" => Some(vk::Format::D32_SFLOAT),
            "d32_sfloat_s8_uint" => Some(vk::Format::D32_SFLOAT_S8_UINT),
            other => {
                log::warn!("Unknown depth format '{}', picking automatically", other);
                None
            }
        }
    }

    /// Configured level, `Info` when the string is not a level name
    pub fn log_level(&self) -> log::LevelFilter {
        self.debug
            .log_level
            .parse()
            .unwrap_or(log::LevelFilter::Info)
    }

    fn log_level_is_known(&self) -> bool {
        self.debug.log_level.parse::<log::LevelFilter>().is_ok()
    }
}

/// Initialize `env_logger` at the configured level. `RUST_LOG` still wins.
pub fn init_logging(config: &Config) {
    let mut builder = env_logger::Builder::new();
    builder.filter_level(config.log_level());
    builder.parse_default_env();
    // A second init (e.g. from tests) is harmless
    let _ = builder.try_init();

    if !config.log_level_is_known() {
        log::warn!(
            "Unknown log level '{}', defaulting to info",
            config.debug.log_level
        );
    }
}

/// Read `path`, start logging from it, then report how the file was read
pub fn load_and_init_logging<P: AsRef<Path>>(path: P) -> Config {
    let (config, source) = Config::resolve(path);
    init_logging(&config);
    source.report();
    log::debug!("Config: {:?}", config);
    config
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load_from_path(dir.path().join("nope.toml")).unwrap();
        assert_eq!(config.window.width, 500);
        assert_eq!(config.compute.element_count, 16384);
        assert_eq!(config.texture_tiling(), TextureTiling::Optimal);
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[window]\nwidth = 800\n\n[graphics]\ntexture_tiling = \"linear\"\ndepth_format = \"D24_UNORM_S8_UINT\""
        )
        .unwrap();

        let config = Config::load_from_path(file.path()).unwrap();
        assert_eq!(config.window.width, 800);
        assert_eq!(config.window.height, 500);
        assert_eq!(config.texture_tiling(), TextureTiling::Linear);
        assert_eq!(config.depth_format(), Some(vk::Format::D24_UNORM_S8_UINT));
        assert_eq!(config.graphics.instance_count, 100);
    }

    #[test]
    fn malformed_file_is_an_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[window\nwidth = ").unwrap();
        assert!(Config::load_from_path(file.path()).is_err());
    }

    #[test]
    fn malformed_file_falls_back_and_is_reported() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[graphics]\ninstance_count = \"many\"").unwrap();

        let (config, source) = Config::resolve(file.path());
        assert_eq!(config.window.width, 500);
        assert_eq!(config.graphics.instance_count, 100);
        match source {
            ConfigSource::Invalid(path, e) => {
                assert_eq!(path, file.path());
                assert!(format!("{:#}", e).contains("Failed to parse"));
            }
            other => panic!("expected an invalid source, got {:?}", other),
        }

        // The warning is emitted only once a logger is installed
        let config = load_and_init_logging(file.path());
        assert_eq!(config.window.width, 500);
        assert!(log::log_enabled!(log::Level::Warn));
    }

    #[test]
    fn resolve_distinguishes_missing_and_valid_files() {
        let dir = tempfile::tempdir().unwrap();
        let (_, source) = Config::resolve(dir.path().join("nope.toml"));
        assert!(matches!(source, ConfigSource::Missing(_)));

        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[window]\nheight = 720").unwrap();
        let (config, source) = Config::resolve(file.path());
        assert!(matches!(source, ConfigSource::File(_)));
        assert_eq!(config.window.height, 720);
    }

    #[test]
    fn unknown_strings_fall_back() {
        let mut config = Config::default();
        config.graphics.present_mode = "vsync-please".into();
        config.graphics.depth_format = "d99".into();
        config.debug.log_level = "chatty".into();
        assert_eq!(config.present_mode(), vk::PresentModeKHR::FIFO);
        assert_eq!(config.depth_format(), None);
        assert_eq!(config.log_level(), log::LevelFilter::Info);
        assert!(!config.log_level_is_known());

        config.graphics.present_mode = "Mailbox".into();
        config.debug.log_level = "debug".into();
        assert_eq!(config.present_mode(), vk::PresentModeKHR::MAILBOX);
        assert_eq!(config.log_level(), log::LevelFilter::Debug);
        assert!(config.log_level_is_known());
    }
}
