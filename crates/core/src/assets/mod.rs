use std::{
    fs,
    io::ErrorKind,
    path::{Path, PathBuf},
};

use rand::{seq::SliceRandom, Rng};
use serde::Serialize;
use tracing::{debug, warn};

use crate::{BeatCutError, ClipSlot, Result};

/// Extensions recognised as video clips.
pub const VIDEO_EXTENSIONS: &[&str] = &["mp4", "avi", "mov", "mkv", "wmv", "flv", "webm"];

/// Lists regular files in `dir` whose extension matches one of `extensions`
/// (case-insensitive), sorted by path. A missing directory lists nothing.
pub fn list_media_files(dir: &Path, extensions: &[&str]) -> Result<Vec<PathBuf>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err.into()),
    };

    let mut files = Vec::new();
    for entry in entries {
        let path = entry?.path();
        let matches = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| extensions.iter().any(|known| ext.eq_ignore_ascii_case(known)))
            .unwrap_or(false);
        if matches && path.is_file() {
            files.push(path);
        }
    }

    files.sort();
    Ok(files)
}

/// Clips found in the intro and edit folders.
#[derive(Debug, Clone, Default)]
pub struct ClipInventory {
    intro_clips: Vec<PathBuf>,
    edit_clips: Vec<PathBuf>,
}

impl ClipInventory {
    pub fn new(intro_clips: Vec<PathBuf>, edit_clips: Vec<PathBuf>) -> Self {
        Self {
            intro_clips,
            edit_clips,
        }
    }

    pub fn scan(intro_dir: &Path, edit_dir: &Path) -> Result<Self> {
        let inventory = Self::new(
            list_media_files(intro_dir, VIDEO_EXTENSIONS)?,
            list_media_files(edit_dir, VIDEO_EXTENSIONS)?,
        );
        debug!(
            intro = inventory.intro_clips.len(),
            edit = inventory.edit_clips.len(),
            "clip inventory scanned"
        );
        Ok(inventory)
    }

    pub fn intro_clips(&self) -> &[PathBuf] {
        &self.intro_clips
    }

    pub fn edit_clips(&self) -> &[PathBuf] {
        &self.edit_clips
    }

    pub fn is_empty(&self) -> bool {
        self.intro_clips.is_empty() && self.edit_clips.is_empty()
    }

    /// Picks the intro clip and the round-robin pool.
    ///
    /// The intro comes from the intro folder when it has clips, otherwise
    /// from the edit folder. Every edit clip joins the pool; with no edit
    /// clips the intro clip is reused as the only pool entry.
    pub fn select<R: Rng + ?Sized>(&self, rng: &mut R) -> Result<ClipSelection> {
        let intro = self
            .intro_clips
            .choose(rng)
            .or_else(|| self.edit_clips.choose(rng))
            .cloned()
            .ok_or(BeatCutError::EmptyClipPool)?;

        let pool = if self.edit_clips.is_empty() {
            warn!(intro = %intro.display(), "no edit clips available, reusing intro clip");
            vec![intro.clone()]
        } else {
            self.edit_clips.clone()
        };

        Ok(ClipSelection { intro, pool })
    }
}

/// Clips chosen for one video: the intro and the ordered pool.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClipSelection {
    pub intro: PathBuf,
    pub pool: Vec<PathBuf>,
}

impl ClipSelection {
    pub fn pool_len(&self) -> usize {
        self.pool.len()
    }

    /// Resolves a segment's slot to the clip file that fills it.
    pub fn resolve(&self, slot: ClipSlot) -> Result<&Path> {
        match slot {
            ClipSlot::Intro => Ok(&self.intro),
            ClipSlot::Pool(index) => self.pool.get(index).map(PathBuf::as_path).ok_or_else(|| {
                BeatCutError::msg(format!(
                    "segment refers to clip {index} but the pool holds {}",
                    self.pool.len()
                ))
            }),
        }
    }
}
