use dirs::home_dir;
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::capture::default_capture_command;
use crate::error::{Error, Result};
use crate::timelapse::TimelapseSettings;

const CONFIG_FILE: &str = ".tutorcap/config.json";
const DATA_DIR_ENV: &str = "TUTORCAP_DATA_DIR";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub data_dir: PathBuf,
    pub analysis_prompt: String,
    pub capture_command: String,
    pub jpeg_quality: u8,
    pub timelapse: TimelapseSettings,
    /// Explicit ffmpeg binary; when unset it is looked up next to the
    /// executable and then on `PATH`.
    pub encoder_path: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            analysis_prompt: String::new(),
            capture_command: default_capture_command().to_string(),
            jpeg_quality: 80,
            timelapse: TimelapseSettings::default(),
            encoder_path: None,
        }
    }
}

impl Config {
    /// Loads `path` (or the default location), writing defaults there first
    /// if it does not exist. The data dir can be overridden from the
    /// environment or a `.env` file.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = path.map(Path::to_path_buf).unwrap_or_else(get_config_path);

        let mut config = if path.exists() {
            let content = fs::read_to_string(&path)?;
            serde_json::from_str(&content)
                .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?
        } else {
            let config = Config::default();
            config.save(&path)?;
            info!(path = %path.display(), "created default configuration file");
            config
        };

        if let Some(dir) = data_dir_override() {
            config.data_dir = dir;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.data_dir.as_os_str().is_empty() {
            return Err(Error::Config("data_dir cannot be empty".to_string()));
        }
        if !(1..=100).contains(&self.jpeg_quality) {
            return Err(Error::Config(
                "jpeg_quality must be between 1 and 100".to_string(),
            ));
        }
        if self.timelapse.fps == 0 {
            return Err(Error::Config("timelapse fps must be at least 1".to_string()));
        }
        if self.capture_command.trim().is_empty() {
            return Err(Error::Config("capture_command cannot be empty".to_string()));
        }
        Ok(())
    }
}

fn data_dir_override() -> Option<PathBuf> {
    // 1. process environment, 2. .env in the current directory
    if let Ok(dir) = env::var(DATA_DIR_ENV) {
        return Some(PathBuf::from(dir));
    }
    dotenv::dotenv().ok();
    env::var(DATA_DIR_ENV).ok().map(PathBuf::from)
}

fn default_data_dir() -> PathBuf {
    home_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join(".tutorcap")
        .join("sessions")
}

pub fn get_config_path() -> PathBuf {
    home_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join(CONFIG_FILE)
}
