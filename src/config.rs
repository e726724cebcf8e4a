//! Configuration system for rview
//!
//! Loads configuration from TOML file at `~/.config/rview/config.toml`
//! Auto-generates default config file on first run if missing.
//! Command-line flags override the file.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::pipeline::reactor::DEFAULT_MAX_HANDLES;
use crate::pipeline::SessionSettings;
use crate::session::SessionOptions;

/// Main configuration structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub session: SessionConfig,
    pub display: DisplayConfig,
    pub input: InputConfig,
    pub protocol: ProtocolConfig,
}

impl Config {
    /// Load configuration from `path`, or from the default location.
    ///
    /// A missing default file is generated; a missing explicit file is an error.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config_path = match path {
            Some(path) => {
                if !path.exists() {
                    bail!("Config file {:?} does not exist", path);
                }
                path.to_path_buf()
            }
            None => Self::config_path()?,
        };

        if !config_path.exists() {
            info!("Config file not found at {:?}, using defaults", config_path);
            if let Err(e) = Self::save_default(&config_path) {
                warn!("Failed to create default config file: {}", e);
            }
            return Ok(Self::default());
        }

        let content = fs::read_to_string(&config_path).context("Failed to read config file")?;
        let config = Self::parse(&content)?;

        info!("Configuration loaded from {:?}", config_path);
        debug!("Config: {:?}", config);
        Ok(config)
    }

    /// Parse TOML content; absent keys keep their defaults
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse config file")
    }

    /// Get the path to the config file
    fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Failed to get config directory")?
            .join("rview");

        Ok(config_dir.join("config.toml"))
    }

    /// Save default configuration to file
    fn save_default(path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).context("Failed to create config directory")?;
        }

        let toml_string =
            toml::to_string_pretty(&Self::default()).context("Failed to serialize default config")?;
        fs::write(path, toml_string).context("Failed to write default config file")?;

        info!("Created default config file at {:?}", path);
        Ok(())
    }

    /// Fold command-line overrides into the loaded file
    pub fn apply(&mut self, args: &CliArgs) {
        if let Some(host) = &args.host {
            self.session.host = host.clone();
        }
        if let Some(port) = args.port {
            self.session.port = port;
        }
        if let Some((width, height)) = args.size {
            self.session.width = width;
            self.session.height = height;
        }
        if args.fullscreen {
            self.session.fullscreen = true;
        }
        if args.grab_keyboard {
            self.session.grab_keyboard = true;
        }
        if args.strict_input {
            self.input.strict_forwarding = true;
        }
    }

    /// Initial session settings
    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            desktop_width: self.session.width,
            desktop_height: self.session.height,
            fullscreen: self.session.fullscreen,
            grab_keyboard: self.session.grab_keyboard,
        }
    }

    /// Transport options for the session engine
    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            host: self.session.host.clone(),
            port: self.session.port,
            connect_timeout: Duration::from_millis(self.session.connect_timeout_ms),
            max_frame_bytes: self.protocol.max_frame_bytes,
        }
    }
}

/// Remote session configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub host: String,
    pub port: u16,
    /// Requested desktop size; replaced by the output size when fullscreen
    pub width: u32,
    pub height: u32,
    pub fullscreen: bool,
    /// Keep display-server shortcuts away while the window has focus
    pub grab_keyboard: bool,
    pub connect_timeout_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: rview_proto::DEFAULT_PORT,
            width: 1024,
            height: 768,
            fullscreen: false,
            grab_keyboard: false,
            connect_timeout_ms: 10_000,
        }
    }
}

/// Local display configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DisplayConfig {
    /// X11 display name, `$DISPLAY` when unset
    pub name: Option<String>,
    pub title: String,
    /// Cap on session readiness handles per wait
    pub max_event_handles: usize,
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            name: None,
            title: "rview".to_string(),
            max_event_handles: DEFAULT_MAX_HANDLES,
        }
    }
}

/// Input forwarding configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InputConfig {
    /// Treat a failed input forward as fatal instead of dropping the event
    pub strict_forwarding: bool,
}

/// Wire protocol limits
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolConfig {
    pub max_frame_bytes: usize,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            max_frame_bytes: rview_proto::DEFAULT_MAX_FRAME_BYTES,
        }
    }
}

/// Command-line arguments
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CliArgs {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub size: Option<(u32, u32)>,
    pub fullscreen: bool,
    pub grab_keyboard: bool,
    pub strict_input: bool,
    pub config: Option<PathBuf>,
    pub help: bool,
}

impl CliArgs {
    /// Parse arguments, program name excluded
    pub fn parse(args: &[String]) -> Result<Self> {
        let mut parsed = Self::default();
        let mut iter = args.iter();

        while let Some(arg) = iter.next() {
            match arg.as_str() {
                "-f" | "--fullscreen" => parsed.fullscreen = true,
                "--grab-keyboard" => parsed.grab_keyboard = true,
                "--strict-input" => parsed.strict_input = true,
                "-h" | "--help" => parsed.help = true,
                "--size" => {
                    let value = iter.next().context("--size needs a WxH value")?;
                    parsed.size = Some(parse_size(value)?);
                }
                "--config" => {
                    let value = iter.next().context("--config needs a path")?;
                    parsed.config = Some(PathBuf::from(value));
                }
                flag if flag.starts_with('-') => bail!("Unknown option: {}", flag),
                target => {
                    if parsed.host.is_some() {
                        bail!("Unexpected argument: {}", target);
                    }
                    let (host, port) = parse_target(target)?;
                    parsed.host = Some(host);
                    parsed.port = port;
                }
            }
        }
        Ok(parsed)
    }

    pub fn usage() -> &'static str {
        "Usage: rview [HOST[:PORT]] [-f|--fullscreen] [--size WxH] [--grab-keyboard] [--strict-input] [--config PATH]"
    }
}

fn parse_size(value: &str) -> Result<(u32, u32)> {
    let (w, h) = value
        .split_once(['x', 'X'])
        .with_context(|| format!("Invalid size {:?}, expected WxH", value))?;
    let width: u32 = w.parse().with_context(|| format!("Invalid width in {:?}", value))?;
    let height: u32 = h.parse().with_context(|| format!("Invalid height in {:?}", value))?;
    if width == 0 || height == 0 {
        bail!("Size {:?} must be non-zero", value);
    }
    Ok((width, height))
}

fn parse_target(value: &str) -> Result<(String, Option<u16>)> {
    match value.rsplit_once(':') {
        // Bare IPv6 addresses contain colons of their own
        Some((host, port)) if !host.contains(':') => {
            let port = port.parse().with_context(|| format!("Invalid port in {:?}", value))?;
            Ok((host.to_string(), Some(port)))
        }
        _ => Ok((value.to_string(), None)),
    }
}
