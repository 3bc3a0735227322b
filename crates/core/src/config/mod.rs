use std::{
    fs,
    io::ErrorKind,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::{BeatCutError, RenderSettings, Result, UploadConfig};

/// Top-level configuration structure for the application.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub folders: FolderConfig,
    pub plan: PlanConfig,
    pub render: RenderSettings,
    pub upload: UploadConfig,
    /// Keep producing videos until the process is stopped.
    pub run_loop: bool,
}

impl AppConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|err| {
            BeatCutError::msg(format!("failed to read config {}: {err}", path.display()))
        })?;
        let config = Self::from_json(&content)?;
        config.validate()?;
        info!(path = %path.display(), "configuration loaded");
        Ok(config)
    }

    /// Loads `path`, falling back to defaults when the file does not exist.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        match fs::metadata(path) {
            Ok(_) => Self::load(path),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!(path = %path.display(), "no configuration file, using defaults");
                Ok(Self::default())
            }
            Err(err) => Err(err.into()),
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_json::to_vec_pretty(self)?)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if !self.plan.min_intro_seconds.is_finite() || self.plan.min_intro_seconds < 0.0 {
            return Err(BeatCutError::InvalidInput(
                "plan.min_intro_seconds must be non-negative",
            ));
        }
        if self.render.width == 0 || self.render.height == 0 {
            return Err(BeatCutError::InvalidInput(
                "render width and height must be positive",
            ));
        }
        if self.render.fps == 0 {
            return Err(BeatCutError::InvalidInput("render fps must be positive"));
        }
        if self.upload.retry.max_attempts == 0 {
            return Err(BeatCutError::InvalidInput(
                "upload.retry.max_attempts must be at least one",
            ));
        }
        Ok(())
    }
}

/// Locations of the input and output folders.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FolderConfig {
    /// Clips that may open a video. Used once per video.
    pub intro_clips: PathBuf,
    /// Clips cycled through after the intro.
    pub edit_clips: PathBuf,
    pub audio: PathBuf,
    pub output: PathBuf,
}

impl Default for FolderConfig {
    fn default() -> Self {
        Self {
            intro_clips: PathBuf::from("clips/intro"),
            edit_clips: PathBuf::from("clips/edit"),
            audio: PathBuf::from("audios"),
            output: PathBuf::from("output"),
        }
    }
}

impl FolderConfig {
    /// Creates every folder that does not exist yet.
    pub fn ensure(&self) -> Result<()> {
        for dir in [&self.intro_clips, &self.edit_clips, &self.audio, &self.output] {
            if !dir.exists() {
                fs::create_dir_all(dir)?;
                info!(dir = %dir.display(), "created folder");
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlanConfig {
    /// The intro lasts at least this long; it ends on the next beat.
    pub min_intro_seconds: f64,
}

impl Default for PlanConfig {
    fn default() -> Self {
        Self {
            min_intro_seconds: 2.0,
        }
    }
}
