//! One production cycle: pick a track, find its beats, plan the segments,
//! render the video and optionally publish it.

use std::path::{Path, PathBuf};

use chrono::Local;
use rand::Rng;
use serde::Serialize;
use tracing::{error, info, instrument, warn};

use crate::{
    audio::{decode_audio, probe_audio_duration},
    record::output_file_name,
    upload::{compose_caption, publish, publish_directory, BatchReport},
    AppConfig, AudioLibrary, BeatAnalysis, BeatCutError, BeatDetector, BeatPlanner, BeatSheet,
    BeatTimeline, ClipInventory, ClipOrder, ClipSelection, CommandUploader, PublishOutcome,
    RenderJob, Renderer, Result, SegmentPlan, UploadLedger, Uploader,
};

/// Path of the beat sheet kept next to an audio file: `song.mp3` maps to
/// `song.beats.json`.
pub fn sidecar_sheet_path(audio: &Path) -> PathBuf {
    audio.with_extension("beats.json")
}

/// Decodes `audio` and runs beat detection over it.
#[instrument(fields(audio = %audio.display()))]
pub fn detect_beats(audio: &Path) -> Result<BeatAnalysis> {
    let decoded = decode_audio(audio)?;
    BeatDetector::new().analyse(&decoded.samples, decoded.sample_rate)
}

/// Optional overrides for a single run.
#[derive(Debug, Clone, Default)]
pub struct RunRequest {
    pub audio: Option<PathBuf>,
    pub beat_sheet: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BeatSource {
    Sheet,
    Detected,
}

/// Everything decided before rendering starts.
#[derive(Debug, Clone)]
pub struct PreparedVideo {
    pub audio: PathBuf,
    pub beat_source: BeatSource,
    pub beats: BeatTimeline,
    pub selection: ClipSelection,
    pub plan: SegmentPlan,
    pub job: RenderJob,
}

#[derive(Debug, Clone)]
pub struct RunReport {
    pub audio: PathBuf,
    pub output: PathBuf,
    pub segments: usize,
    pub upload: Option<PublishOutcome>,
}

#[derive(Debug, Clone)]
pub struct Pipeline {
    config: AppConfig,
    renderer: Renderer,
}

impl Pipeline {
    pub fn new(config: AppConfig) -> Result<Self> {
        config.validate()?;
        let renderer = Renderer::new(config.render.clone());
        Ok(Self { config, renderer })
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// Loads the beats for `audio` along with its duration. A beat sheet is
    /// used when one is given or sits next to the track; otherwise the track
    /// is decoded and analysed.
    pub fn load_beats(
        &self,
        audio: &Path,
        beat_sheet: Option<&Path>,
    ) -> Result<(BeatTimeline, f64, BeatSource)> {
        let sidecar = sidecar_sheet_path(audio);
        let sheet_path = beat_sheet.or_else(|| sidecar.is_file().then_some(sidecar.as_path()));

        if let Some(sheet_path) = sheet_path {
            let timeline = BeatSheet::load(sheet_path)?.timeline();
            let duration = probe_audio_duration(audio)?;
            info!(sheet = %sheet_path.display(), beats = timeline.len(), "using beat sheet");
            return Ok((timeline, duration, BeatSource::Sheet));
        }

        info!("detecting beats from audio");
        let analysis = detect_beats(audio)?;
        info!(
            beats = analysis.beats.len(),
            drops = analysis.drops.len(),
            tempo_bpm = ?analysis.tempo_bpm,
            "beats detected"
        );
        Ok((analysis.timeline(), analysis.duration_seconds, BeatSource::Detected))
    }

    /// Resolves inputs and builds the segment plan and render job without
    /// invoking any external tool.
    #[instrument(skip(self, rng))]
    pub fn prepare<R: Rng + ?Sized>(
        &self,
        request: &RunRequest,
        rng: &mut R,
    ) -> Result<PreparedVideo> {
        let folders = &self.config.folders;
        folders.ensure()?;

        let audio = match &request.audio {
            Some(path) => path.clone(),
            None => AudioLibrary::scan(&folders.audio)?
                .choose(rng)
                .map(Path::to_path_buf)
                .ok_or_else(|| {
                    BeatCutError::msg(format!(
                        "no audio files found in {}",
                        folders.audio.display()
                    ))
                })?,
        };
        if !audio.is_file() {
            return Err(BeatCutError::msg(format!(
                "audio file not found: {}",
                audio.display()
            )));
        }
        info!(audio = %audio.display(), "selected audio");

        let (beats, duration, beat_source) =
            self.load_beats(&audio, request.beat_sheet.as_deref())?;

        let selection =
            ClipInventory::scan(&folders.intro_clips, &folders.edit_clips)?.select(rng)?;
        info!(
            intro = %selection.intro.display(),
            pool = selection.pool_len(),
            "clips selected"
        );

        let order = ClipOrder::choose(rng);
        let plan = BeatPlanner::new(self.config.plan.min_intro_seconds).plan(
            beats.as_slice(),
            duration,
            selection.pool_len(),
            order,
        )?;
        info!(
            intro_boundary = plan.intro_boundary,
            segments = plan.segments.len(),
            ?order,
            "segment plan ready"
        );

        let output = output_file_name(&folders.output, Local::now());
        let job = RenderJob::from_plan(&plan, &selection, &audio, &output, self.config.render.fps)?;

        Ok(PreparedVideo {
            audio,
            beat_source,
            beats,
            selection,
            plan,
            job,
        })
    }

    /// Prepares, renders and, when enabled, publishes one video.
    pub fn run_once<R: Rng + ?Sized>(
        &self,
        request: &RunRequest,
        rng: &mut R,
    ) -> Result<RunReport> {
        let prepared = self.prepare(request, rng)?;
        let output = self.renderer.render(&prepared.job)?;

        let upload = if self.config.upload.enabled {
            let mut uploader = self.command_uploader()?;
            Some(self.publish_video(&mut uploader, &output, rng)?)
        } else {
            None
        };

        Ok(RunReport {
            audio: prepared.audio,
            output,
            segments: prepared.job.segments.len(),
            upload,
        })
    }

    /// Uploader built from the configured upload command.
    pub fn command_uploader(&self) -> Result<CommandUploader> {
        self.config
            .upload
            .command
            .clone()
            .map(CommandUploader::new)
            .ok_or_else(|| BeatCutError::msg("no upload command is configured"))
    }

    /// Publishes every video in `dir` that the ledger does not list yet.
    pub fn publish_folder<U: Uploader + ?Sized, R: Rng + ?Sized>(
        &self,
        uploader: &mut U,
        dir: &Path,
        rng: &mut R,
    ) -> Result<BatchReport> {
        let upload = &self.config.upload;
        let mut ledger = UploadLedger::open(&upload.ledger_path)?;
        publish_directory(uploader, &mut ledger, upload, dir, rng)
    }

    /// Publishes `video` through `uploader`, holding the ledger open only for
    /// the duration of the call.
    pub fn publish_video<U: Uploader + ?Sized, R: Rng + ?Sized>(
        &self,
        uploader: &mut U,
        video: &Path,
        rng: &mut R,
    ) -> Result<PublishOutcome> {
        let upload = &self.config.upload;
        let caption = compose_caption(&upload.descriptions, &upload.hashtags, rng);
        let mut ledger = UploadLedger::open(&upload.ledger_path)?;
        publish(uploader, &mut ledger, &upload.retry, video, &caption)
    }

    /// Runs one cycle, or keeps cycling when `run_loop` is set. In loop mode
    /// failures caused by the chosen inputs are reported and the next cycle
    /// starts; configuration and filesystem errors end the loop. `max_cycles` bounds the loop.
    pub fn run<R: Rng + ?Sized>(
        &self,
        request: &RunRequest,
        rng: &mut R,
        max_cycles: Option<usize>,
    ) -> Result<Vec<RunReport>> {
        if !self.config.run_loop {
            return self.run_once(request, rng).map(|report| vec![report]);
        }

        let mut reports = Vec::new();
        let mut cycle = 0usize;
        while max_cycles.map_or(true, |max| cycle < max) {
            cycle += 1;
            match self.run_once(request, rng) {
                Ok(report) => {
                    info!(cycle, output = %report.output.display(), "cycle complete");
                    reports.push(report);
                }
                Err(err) if is_skippable(&err) => {
                    warn!(cycle, error = %err, "cycle skipped");
                }
                Err(err) => {
                    error!(cycle, error = %err, "stopping loop");
                    return Err(err);
                }
            }
        }

        Ok(reports)
    }
}

/// Errors tied to the track, sheet or clips picked for one cycle. Another
/// cycle may pick different inputs.
fn is_skippable(err: &BeatCutError) -> bool {
    err.is_plan_failure()
        || matches!(
            err,
            BeatCutError::Tool { .. }
                | BeatCutError::Decode(_)
                | BeatCutError::Json(_)
                | BeatCutError::InvalidInput(_)
        )
}

#[cfg(test)]
mod tests {
    use rand::{rngs::StdRng, SeedableRng};

    use super::*;

    #[test]
    fn sidecar_sits_next_to_audio() {
        assert_eq!(
            sidecar_sheet_path(Path::new("audios/song.mp3")),
            PathBuf::from("audios/song.beats.json")
        );
    }

    #[test]
    fn tool_and_plan_failures_are_skippable() {
        assert!(is_skippable(&BeatCutError::NoBeats));
        assert!(is_skippable(&BeatCutError::Tool {
            tool: "ffmpeg".to_string(),
            status: Some(1),
            stderr: String::new(),
        }));
        assert!(is_skippable(&BeatCutError::Decode("no suitable format reader".to_string())));
        assert!(is_skippable(&BeatCutError::InvalidInput("bad beats")));
        let bad_sheet = serde_json::from_str::<Vec<f64>>("{").unwrap_err();
        assert!(is_skippable(&BeatCutError::Json(bad_sheet)));
        assert!(!is_skippable(&BeatCutError::msg("audio file not found")));
    }

    #[derive(Default)]
    struct RecordingUploader {
        failures_left: u32,
        captions: Vec<String>,
    }

    impl Uploader for RecordingUploader {
        fn upload(&mut self, _video: &Path, caption: &str) -> Result<()> {
            self.captions.push(caption.to_string());
            if self.failures_left > 0 {
                self.failures_left -= 1;
                return Err(BeatCutError::msg("upload page timed out"));
            }
            Ok(())
        }
    }

    fn upload_pipeline(ledger_path: PathBuf) -> Pipeline {
        let mut config = AppConfig::default();
        config.upload.ledger_path = ledger_path;
        config.upload.descriptions = vec!["new edit".to_string()];
        config.upload.hashtags = vec!["fyp".to_string()];
        config.upload.retry.initial_backoff_ms = 0;
        Pipeline::new(config).unwrap()
    }

    #[test]
    fn publish_video_retries_and_records_in_ledger() {
        let dir = tempfile::tempdir().unwrap();
        let ledger_path = dir.path().join("uploaded_videos.txt");
        let pipeline = upload_pipeline(ledger_path.clone());
        let video = dir.path().join("output/beat_synced_20240101_000000.mp4");
        let mut uploader = RecordingUploader {
            failures_left: 1,
            ..Default::default()
        };
        let mut rng = StdRng::seed_from_u64(8);

        let outcome = pipeline.publish_video(&mut uploader, &video, &mut rng).unwrap();
        assert_eq!(outcome, PublishOutcome::Uploaded);
        assert_eq!(uploader.captions, vec!["new edit #fyp", "new edit #fyp"]);
        assert_eq!(
            std::fs::read_to_string(&ledger_path).unwrap(),
            format!("{}\n", video.display())
        );

        let again = pipeline.publish_video(&mut uploader, &video, &mut rng).unwrap();
        assert_eq!(again, PublishOutcome::AlreadyUploaded);
        assert_eq!(uploader.captions.len(), 2);
    }

    #[test]
    fn publish_folder_uses_configured_ledger() {
        let dir = tempfile::tempdir().unwrap();
        let videos = dir.path().join("videos");
        std::fs::create_dir_all(&videos).unwrap();
        std::fs::write(videos.join("a.mp4"), b"").unwrap();

        let ledger_path = dir.path().join("ledger.txt");
        let mut pipeline = upload_pipeline(ledger_path.clone());
        pipeline.config.upload.batch.min_delay_secs = 0;
        pipeline.config.upload.batch.max_delay_secs = 0;
        let mut uploader = RecordingUploader::default();

        let report = pipeline
            .publish_folder(&mut uploader, &videos, &mut StdRng::seed_from_u64(1))
            .unwrap();
        assert_eq!(report.uploaded, vec![videos.join("a.mp4")]);
        assert!(UploadLedger::open(&ledger_path)
            .unwrap()
            .contains(&videos.join("a.mp4")));
    }

    #[test]
    fn missing_upload_command_is_reported() {
        let pipeline = Pipeline::new(AppConfig::default()).unwrap();
        assert!(pipeline.command_uploader().is_err());
    }

    #[test]
    fn rejects_invalid_config() {
        let mut config = AppConfig::default();
        config.render.fps = 0;
        assert!(Pipeline::new(config).is_err());
    }
}
