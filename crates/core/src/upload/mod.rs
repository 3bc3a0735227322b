//! Hand-off of finished videos to an external upload program.
//!
//! The browser automation itself lives outside this crate. This module owns
//! the pieces around it: caption composition, a bounded retry policy applied
//! uniformly to every attempt, and the append-only ledger of videos that were
//! already published.

use std::{
    collections::HashSet,
    ffi::OsString,
    fs::{self, File, OpenOptions},
    io::{ErrorKind, Write},
    path::{Path, PathBuf},
    process::{Command, Stdio},
    thread,
    time::Duration,
};

use rand::{seq::SliceRandom, Rng};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::{
    assets::{list_media_files, VIDEO_EXTENSIONS},
    BeatCutError, Result,
};

const VIDEO_PLACEHOLDER: &str = "{video}";
const CAPTION_PLACEHOLDER: &str = "{caption}";

/// Bounded retry with exponential backoff.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub multiplier: f64,
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 500,
            multiplier: 2.0,
            max_backoff_ms: 8_000,
        }
    }
}

impl RetryPolicy {
    /// Policy that tries once and never waits.
    pub fn once() -> Self {
        Self {
            max_attempts: 1,
            initial_backoff_ms: 0,
            ..Self::default()
        }
    }

    /// Delay to wait after failed attempt number `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1) as i32;
        let millis = self.initial_backoff_ms as f64 * self.multiplier.max(1.0).powi(exponent);
        Duration::from_millis(millis.min(self.max_backoff_ms as f64) as u64)
    }
}

/// Runs `attempt` until it succeeds or the policy is exhausted, returning the
/// last error. Plan failures are returned immediately since repeating them
/// cannot succeed.
pub fn retry<T, F>(policy: &RetryPolicy, operation: &str, mut attempt: F) -> Result<T>
where
    F: FnMut(u32) -> Result<T>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut current = 1;
    loop {
        match attempt(current) {
            Ok(value) => return Ok(value),
            Err(err) if err.is_plan_failure() || current >= max_attempts => {
                warn!(operation, attempt = current, error = %err, "giving up");
                return Err(err);
            }
            Err(err) => {
                let delay = policy.backoff(current);
                warn!(
                    operation,
                    attempt = current,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "attempt failed, retrying"
                );
                thread::sleep(delay);
                current += 1;
            }
        }
    }
}

/// Program invoked to upload a video. `{video}` and `{caption}` in `args`
/// are substituted; whichever does not appear is appended, video first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadCommand {
    pub program: PathBuf,
    #[serde(default)]
    pub args: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadConfig {
    pub enabled: bool,
    pub command: Option<UploadCommand>,
    /// One description is picked at random per upload.
    pub descriptions: Vec<String>,
    pub hashtags: Vec<String>,
    pub ledger_path: PathBuf,
    pub retry: RetryPolicy,
    pub batch: BatchSettings,
}

/// Pacing for uploading a whole folder of videos.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchSettings {
    /// Stop after this many successful uploads.
    pub max_uploads: Option<usize>,
    pub min_delay_secs: u64,
    pub max_delay_secs: u64,
}

impl Default for BatchSettings {
    fn default() -> Self {
        Self {
            max_uploads: None,
            min_delay_secs: 3_600,
            max_delay_secs: 7_200,
        }
    }
}

impl BatchSettings {
    /// Random pause between two uploads.
    pub fn delay<R: Rng + ?Sized>(&self, rng: &mut R) -> Duration {
        let low = self.min_delay_secs.min(self.max_delay_secs);
        Duration::from_secs(rng.gen_range(low..=self.max_delay_secs))
    }
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            command: None,
            descriptions: Vec::new(),
            hashtags: vec!["viral".to_string(), "fyp".to_string(), "trending".to_string()],
            ledger_path: PathBuf::from("uploaded_videos.txt"),
            retry: RetryPolicy::default(),
            batch: BatchSettings::default(),
        }
    }
}

/// Joins a random description with the hashtags, each prefixed by `#`.
pub fn compose_caption<R: Rng + ?Sized>(
    descriptions: &[String],
    hashtags: &[String],
    rng: &mut R,
) -> String {
    let mut parts: Vec<String> = descriptions
        .choose(rng)
        .filter(|d| !d.trim().is_empty())
        .map(|d| d.trim().to_string())
        .into_iter()
        .collect();
    parts.extend(
        hashtags
            .iter()
            .map(|tag| tag.trim().trim_start_matches('#'))
            .filter(|tag| !tag.is_empty())
            .map(|tag| format!("#{tag}")),
    );
    parts.join(" ")
}

/// Append-only record of uploaded videos, one path per line. The file stays
/// open for appending for as long as the ledger is alive.
#[derive(Debug)]
pub struct UploadLedger {
    path: PathBuf,
    entries: HashSet<String>,
    file: File,
}

impl UploadLedger {
    pub fn open(path: &Path) -> Result<Self> {
        let entries = match fs::read_to_string(path) {
            Ok(content) => content
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty())
                .map(str::to_string)
                .collect(),
            Err(err) if err.kind() == ErrorKind::NotFound => HashSet::new(),
            Err(err) => return Err(err.into()),
        };

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        debug!(path = %path.display(), entries = entries.len(), "upload ledger opened");

        Ok(Self {
            path: path.to_path_buf(),
            entries,
            file,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, video: &Path) -> bool {
        self.entries.contains(&ledger_key(video))
    }

    /// Appends `video` to the ledger and flushes it to disk.
    pub fn record(&mut self, video: &Path) -> Result<()> {
        let key = ledger_key(video);
        if self.entries.contains(&key) {
            return Ok(());
        }
        writeln!(self.file, "{key}")?;
        self.file.flush()?;
        self.entries.insert(key);
        Ok(())
    }
}

fn ledger_key(video: &Path) -> String {
    video.to_string_lossy().trim().to_string()
}

/// Capability that publishes a finished video.
pub trait Uploader {
    fn upload(&mut self, video: &Path, caption: &str) -> Result<()>;
}

/// [`Uploader`] that runs an external program once per attempt.
#[derive(Debug, Clone)]
pub struct CommandUploader {
    command: UploadCommand,
}

impl CommandUploader {
    pub fn new(command: UploadCommand) -> Self {
        Self { command }
    }

    pub fn command_args(&self, video: &Path, caption: &str) -> Vec<OsString> {
        let args = &self.command.args;
        let has_video = args.iter().any(|arg| arg.contains(VIDEO_PLACEHOLDER));
        let has_caption = args.iter().any(|arg| arg.contains(CAPTION_PLACEHOLDER));

        let video_text = video.to_string_lossy();
        let mut resolved: Vec<OsString> = args
            .iter()
            .map(|arg| {
                OsString::from(
                    arg.replace(VIDEO_PLACEHOLDER, &video_text)
                        .replace(CAPTION_PLACEHOLDER, caption),
                )
            })
            .collect();
        if !has_video {
            resolved.push(video.as_os_str().to_owned());
        }
        if !has_caption {
            resolved.push(caption.into());
        }
        resolved
    }
}

impl Uploader for CommandUploader {
    fn upload(&mut self, video: &Path, caption: &str) -> Result<()> {
        let output = Command::new(&self.command.program)
            .args(self.command_args(video, caption))
            .stdin(Stdio::null())
            .output()
            .map_err(|err| {
                BeatCutError::msg(format!(
                    "failed to start uploader {}: {err}",
                    self.command.program.display()
                ))
            })?;

        if output.status.success() {
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        Err(BeatCutError::Tool {
            tool: self.command.program.display().to_string(),
            status: output.status.code(),
            stderr: stderr.lines().last().unwrap_or_default().trim().to_string(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    Uploaded,
    AlreadyUploaded,
}

/// Uploads `video` unless the ledger already lists it, retrying per
/// `policy`, and records it on success.
#[instrument(skip(uploader, ledger, policy, caption), fields(video = %video.display()))]
pub fn publish<U: Uploader + ?Sized>(
    uploader: &mut U,
    ledger: &mut UploadLedger,
    policy: &RetryPolicy,
    video: &Path,
    caption: &str,
) -> Result<PublishOutcome> {
    if ledger.contains(video) {
        info!("video already uploaded, skipping");
        return Ok(PublishOutcome::AlreadyUploaded);
    }

    retry(policy, "upload", |_| uploader.upload(video, caption))?;
    ledger.record(video)?;
    info!("video uploaded");
    Ok(PublishOutcome::Uploaded)
}

/// Outcome of [`publish_directory`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchReport {
    pub uploaded: Vec<PathBuf>,
    /// Videos skipped because the ledger already lists them.
    pub already_uploaded: usize,
    /// Videos whose upload still failed after every retry.
    pub failed: Vec<PathBuf>,
}

/// Uploads every video in `dir` that the ledger does not list, in path
/// order, with a fresh caption for each. A video that keeps failing is
/// reported and the batch moves on. The batch stops once
/// `batch.max_uploads` videos went up, and waits a random delay between
/// uploads.
#[instrument(skip(uploader, ledger, config, rng), fields(dir = %dir.display()))]
pub fn publish_directory<U: Uploader + ?Sized, R: Rng + ?Sized>(
    uploader: &mut U,
    ledger: &mut UploadLedger,
    config: &UploadConfig,
    dir: &Path,
    rng: &mut R,
) -> Result<BatchReport> {
    if !dir.is_dir() {
        return Err(BeatCutError::msg(format!(
            "videos directory not found: {}",
            dir.display()
        )));
    }

    let mut report = BatchReport::default();
    let pending: Vec<PathBuf> = list_media_files(dir, VIDEO_EXTENSIONS)?
        .into_iter()
        .filter(|video| {
            let listed = ledger.contains(video);
            if listed {
                report.already_uploaded += 1;
            }
            !listed
        })
        .collect();
    info!(
        pending = pending.len(),
        already_uploaded = report.already_uploaded,
        "videos to upload"
    );

    let limit = config.batch.max_uploads.unwrap_or(usize::MAX);
    for (index, video) in pending.iter().enumerate() {
        if report.uploaded.len() >= limit {
            info!(limit, "upload limit reached");
            break;
        }

        let caption = compose_caption(&config.descriptions, &config.hashtags, rng);
        match publish(uploader, ledger, &config.retry, video, &caption) {
            Ok(_) => report.uploaded.push(video.clone()),
            Err(BeatCutError::Io(err)) => return Err(err.into()),
            Err(err) => {
                warn!(video = %video.display(), error = %err, "upload failed");
                report.failed.push(video.clone());
                continue;
            }
        }

        let more_left = index + 1 < pending.len() && report.uploaded.len() < limit;
        if more_left {
            let delay = config.batch.delay(rng);
            if !delay.is_zero() {
                info!(delay_secs = delay.as_secs(), "waiting before next upload");
                thread::sleep(delay);
            }
        }
    }

    info!(
        uploaded = report.uploaded.len(),
        failed = report.failed.len(),
        "upload batch finished"
    );
    Ok(report)
}
