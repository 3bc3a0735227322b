use std::{
    collections::HashMap,
    ffi::OsString,
    fs,
    path::{Path, PathBuf},
    process::{Command, Stdio},
};

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::{BeatCutError, ClipSelection, Result, SegmentPlan};

const STDERR_TAIL_LINES: usize = 4;

/// Encoder settings for the final video.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RenderSettings {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub video_codec: String,
    pub audio_codec: String,
    pub preset: String,
    pub crf: u32,
    pub ffmpeg: PathBuf,
    pub ffprobe: PathBuf,
}

impl Default for RenderSettings {
    fn default() -> Self {
        Self {
            width: 1080,
            height: 1920,
            fps: 30,
            video_codec: "libx264".to_string(),
            audio_codec: "aac".to_string(),
            preset: "veryfast".to_string(),
            crf: 20,
            ffmpeg: PathBuf::from("ffmpeg"),
            ffprobe: PathBuf::from("ffprobe"),
        }
    }
}

impl RenderSettings {
    /// Fits the clip inside the frame and pads the rest with black.
    fn video_filter(&self) -> String {
        format!(
            "scale={w}:{h}:force_original_aspect_ratio=decrease,pad={w}:{h}:(ow-iw)/2:(oh-ih)/2:black,setsar=1,fps={fps}",
            w = self.width,
            h = self.height,
            fps = self.fps
        )
    }
}

/// Builds `<dir>/beat_synced_<YYYYMMDD_HHMMSS>.mp4`.
pub fn output_file_name(dir: &Path, now: DateTime<Local>) -> PathBuf {
    dir.join(format!("beat_synced_{}.mp4", now.format("%Y%m%d_%H%M%S")))
}

/// Queries the container duration of a media file with ffprobe.
#[instrument(skip(settings), fields(path = %path.display()))]
pub fn probe_duration(settings: &RenderSettings, path: &Path) -> Result<f64> {
    let output = Command::new(&settings.ffprobe)
        .args(["-v", "error", "-show_entries", "format=duration", "-of"])
        .arg("default=noprint_wrappers=1:nokey=1")
        .arg(path)
        .stdin(Stdio::null())
        .output()
        .map_err(|err| BeatCutError::msg(format!("failed to start ffprobe: {err}")))?;

    if !output.status.success() {
        return Err(tool_error("ffprobe", output.status.code(), &output.stderr));
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    let value = stdout.trim();
    let duration: f64 = value.parse().map_err(|_| {
        BeatCutError::msg(format!(
            "ffprobe returned an unreadable duration `{value}` for {}",
            path.display()
        ))
    })?;
    debug!(duration, "probed media duration");
    Ok(duration)
}

/// One clip looped or trimmed to fill a planned segment. `start_frame` and
/// `frames` sit on the output frame grid.
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentRender {
    pub clip: PathBuf,
    pub start_frame: u64,
    pub frames: u64,
}

impl SegmentRender {
    pub fn duration_seconds(&self, fps: u32) -> f64 {
        self.frames as f64 / fps as f64
    }
}

/// Index of the output frame closest to `seconds`.
fn frame_index(seconds: f64, fps: u32) -> u64 {
    (seconds * fps as f64).round().max(0.0) as u64
}

/// Everything needed to turn a segment plan into a video file.
#[derive(Debug, Clone)]
pub struct RenderJob {
    pub segments: Vec<SegmentRender>,
    pub audio: PathBuf,
    pub audio_duration: f64,
    pub fps: u32,
    pub output: PathBuf,
}

impl RenderJob {
    /// Resolves every planned segment to its clip and snaps the cuts to the
    /// frame grid. Each cut lands on the frame nearest its beat, so rounding
    /// never accumulates along the video. Segments shorter than half a frame
    /// round to nothing and are left out.
    pub fn from_plan(
        plan: &SegmentPlan,
        selection: &ClipSelection,
        audio: &Path,
        output: &Path,
        fps: u32,
    ) -> Result<Self> {
        if fps == 0 {
            return Err(BeatCutError::InvalidInput("render fps must be positive"));
        }

        let mut segments = Vec::with_capacity(plan.segments.len());
        for segment in &plan.segments {
            let start_frame = frame_index(segment.start, fps);
            let frames = frame_index(segment.end, fps).saturating_sub(start_frame);
            if frames == 0 {
                debug!(start = segment.start, "skipping segment shorter than a frame");
                continue;
            }
            segments.push(SegmentRender {
                clip: selection.resolve(segment.clip)?.to_path_buf(),
                start_frame,
                frames,
            });
        }

        if segments.is_empty() {
            return Err(BeatCutError::msg("segment plan contains no renderable segments"));
        }

        Ok(Self {
            segments,
            audio: audio.to_path_buf(),
            audio_duration: plan.audio_duration,
            fps,
            output: output.to_path_buf(),
        })
    }

    pub fn segment_file(work_dir: &Path, index: usize) -> PathBuf {
        work_dir.join(format!("segment_{index:04}.mp4"))
    }

    /// Total frames in the rendered video.
    pub fn total_frames(&self) -> u64 {
        self.segments.iter().map(|segment| segment.frames).sum()
    }

    /// ffmpeg arguments that encode segment `index` into `work_dir`. The
    /// output stops after exactly `frames` frames; with `loop_clip` the clip
    /// is repeated until that count is reached.
    pub fn segment_args(
        &self,
        settings: &RenderSettings,
        index: usize,
        work_dir: &Path,
        loop_clip: bool,
    ) -> Result<Vec<OsString>> {
        let segment = self.segments.get(index).ok_or_else(|| {
            BeatCutError::msg(format!("render job has no segment {index}"))
        })?;

        let mut args: Vec<OsString> = ["-y", "-v", "error"].iter().map(OsString::from).collect();
        if loop_clip {
            args.push("-stream_loop".into());
            args.push("-1".into());
        }
        args.push("-i".into());
        args.push(segment.clip.clone().into_os_string());
        args.extend(
            [
                "-frames:v".to_string(),
                segment.frames.to_string(),
                "-vf".to_string(),
                settings.video_filter(),
                "-an".to_string(),
                "-c:v".to_string(),
                settings.video_codec.clone(),
                "-preset".to_string(),
                settings.preset.clone(),
                "-crf".to_string(),
                settings.crf.to_string(),
                "-pix_fmt".to_string(),
                "yuv420p".to_string(),
            ]
            .into_iter()
            .map(OsString::from),
        );
        args.push(Self::segment_file(work_dir, index).into_os_string());
        Ok(args)
    }

    /// Contents of the concat demuxer list for the encoded segments.
    pub fn concat_list(&self, work_dir: &Path) -> String {
        (0..self.segments.len())
            .map(|index| {
                let path = Self::segment_file(work_dir, index);
                let escaped = path.to_string_lossy().replace('\'', r"'\''");
                format!("file '{escaped}'\n")
            })
            .collect()
    }

    /// ffmpeg arguments that join the segments and lay the track under them.
    pub fn concat_args(&self, settings: &RenderSettings, list_path: &Path) -> Vec<OsString> {
        let mut args: Vec<OsString> = ["-y", "-v", "error", "-f", "concat", "-safe", "0", "-i"]
            .iter()
            .map(OsString::from)
            .collect();
        args.push(list_path.as_os_str().to_owned());
        args.push("-i".into());
        args.push(self.audio.clone().into_os_string());
        args.extend(
            [
                "-map".to_string(),
                "0:v:0".to_string(),
                "-map".to_string(),
                "1:a:0".to_string(),
                "-c:v".to_string(),
                "copy".to_string(),
                "-c:a".to_string(),
                settings.audio_codec.clone(),
                "-t".to_string(),
                format!("{:.3}", self.total_frames() as f64 / self.fps as f64),
                "-shortest".to_string(),
                "-movflags".to_string(),
                "+faststart".to_string(),
            ]
            .into_iter()
            .map(OsString::from),
        );
        args.push(self.output.clone().into_os_string());
        args
    }
}

/// Drives ffmpeg to execute a [`RenderJob`].
#[derive(Debug, Clone, Default)]
pub struct Renderer {
    settings: RenderSettings,
}

impl Renderer {
    pub fn new(settings: RenderSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &RenderSettings {
        &self.settings
    }

    /// Encodes each segment in a scratch directory, then concatenates them
    /// with the audio track into the job's output file. Clips are probed once
    /// each; a clip is looped only when it is shorter than its segment or its
    /// length is unknown.
    #[instrument(skip(self, job), fields(output = %job.output.display(), segments = job.segments.len()))]
    pub fn render(&self, job: &RenderJob) -> Result<PathBuf> {
        let work_dir = tempfile::tempdir()?;
        let mut native_durations: HashMap<&Path, Option<f64>> = HashMap::new();

        for (index, segment) in job.segments.iter().enumerate() {
            let native = *native_durations
                .entry(segment.clip.as_path())
                .or_insert_with(|| match probe_duration(&self.settings, &segment.clip) {
                    Ok(duration) => Some(duration),
                    Err(err) => {
                        warn!(clip = %segment.clip.display(), error = %err, "could not probe clip");
                        None
                    }
                });
            let loop_clip = needs_loop(native, segment.duration_seconds(job.fps));
            debug!(
                index,
                clip = %segment.clip.display(),
                start_frame = segment.start_frame,
                frames = segment.frames,
                loop_clip,
                "encoding segment"
            );
            let args = job.segment_args(&self.settings, index, work_dir.path(), loop_clip)?;
            self.run_ffmpeg(&args)?;
        }

        let list_path = work_dir.path().join("segments.txt");
        fs::write(&list_path, job.concat_list(work_dir.path()))?;

        if let Some(parent) = job.output.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        self.run_ffmpeg(&job.concat_args(&self.settings, &list_path))?;

        info!("video rendered");
        Ok(job.output.clone())
    }

    fn run_ffmpeg(&self, args: &[OsString]) -> Result<()> {
        let output = Command::new(&self.settings.ffmpeg)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .map_err(|err| BeatCutError::msg(format!("failed to start ffmpeg: {err}")))?;

        if output.status.success() {
            Ok(())
        } else {
            Err(tool_error("ffmpeg", output.status.code(), &output.stderr))
        }
    }
}

fn needs_loop(native: Option<f64>, segment_seconds: f64) -> bool {
    native.map_or(true, |native| native < segment_seconds)
}

/// Builds a [`BeatCutError::Tool`] from the last few non-empty stderr lines.
fn tool_error(tool: &str, status: Option<i32>, stderr: &[u8]) -> BeatCutError {
    let stderr = String::from_utf8_lossy(stderr);
    let mut tail: Vec<&str> = stderr
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .rev()
        .take(STDERR_TAIL_LINES)
        .collect();
    tail.reverse();

    BeatCutError::Tool {
        tool: tool.to_string(),
        status,
        stderr: tail.join(" | "),
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;
    use crate::{BeatPlanner, ClipOrder};

    fn selection() -> ClipSelection {
        ClipSelection {
            intro: PathBuf::from("intro.mp4"),
            pool: vec![PathBuf::from("a.mp4"), PathBuf::from("b.mp4")],
        }
    }

    fn job() -> RenderJob {
        let plan = BeatPlanner::new(2.0)
            .plan(&[1.0, 3.0, 6.0, 9.0], 10.0, 2, ClipOrder::Forward)
            .unwrap();
        RenderJob::from_plan(
            &plan,
            &selection(),
            Path::new("song.mp3"),
            Path::new("out.mp4"),
            30,
        )
        .unwrap()
    }

    fn strings(args: &[OsString]) -> Vec<String> {
        args.iter().map(|a| a.to_string_lossy().into_owned()).collect()
    }

    #[test]
    fn job_resolves_clips_in_plan_order() {
        let job = job();
        let clips: Vec<_> = job.segments.iter().map(|s| s.clip.clone()).collect();
        assert_eq!(
            clips,
            vec![
                PathBuf::from("intro.mp4"),
                PathBuf::from("a.mp4"),
                PathBuf::from("b.mp4"),
                PathBuf::from("a.mp4"),
            ]
        );
        assert_eq!(job.segments[3].frames, 30);
        assert_eq!(job.segments[3].start_frame, 270);
    }

    #[test]
    fn cuts_stay_on_the_beat_grid() {
        let fps = 30;
        let interval = 60.0 / 128.0;
        let beats: Vec<f64> = (0..)
            .map(|k| k as f64 * interval)
            .take_while(|beat| *beat < 30.0)
            .collect();
        let plan = BeatPlanner::new(2.0)
            .plan(&beats, 30.0, 2, ClipOrder::Forward)
            .unwrap();
        let job = RenderJob::from_plan(
            &plan,
            &selection(),
            Path::new("song.mp3"),
            Path::new("out.mp4"),
            fps,
        )
        .unwrap();

        assert_eq!(job.segments.len(), plan.segments.len());
        assert_eq!(job.total_frames(), (30.0 * fps as f64).round() as u64);

        let half_frame = 0.5 / fps as f64;
        let mut rendered_frames = 0;
        for (rendered, planned) in job.segments.iter().zip(&plan.segments) {
            let cut = rendered_frames as f64 / fps as f64;
            assert!(
                (cut - planned.start).abs() <= half_frame + 1e-9,
                "cut at {cut} drifted from beat {}",
                planned.start
            );
            rendered_frames += rendered.frames;
        }
    }

    #[test]
    fn rejects_zero_fps() {
        let plan = BeatPlanner::new(2.0)
            .plan(&[1.0, 3.0], 4.0, 1, ClipOrder::Forward)
            .unwrap();
        assert!(
            RenderJob::from_plan(&plan, &selection(), Path::new("s.mp3"), Path::new("o.mp4"), 0)
                .is_err()
        );
    }

    #[test]
    fn zero_length_intro_is_skipped() {
        let plan = BeatPlanner::new(0.0)
            .plan(&[0.0, 2.0], 4.0, 2, ClipOrder::Forward)
            .unwrap();
        let job =
            RenderJob::from_plan(&plan, &selection(), Path::new("s.mp3"), Path::new("o.mp4"), 30)
                .unwrap();
        assert_eq!(job.segments.len(), 2);
        assert_eq!(job.segments[0].clip, PathBuf::from("a.mp4"));
    }

    #[test]
    fn segment_args_loop_and_trim() {
        let args = strings(
            &job()
                .segment_args(&RenderSettings::default(), 1, Path::new("/tmp/work"), true)
                .unwrap(),
        );
        let position = |flag: &str| args.iter().position(|a| a == flag).unwrap();

        assert_eq!(args[position("-stream_loop") + 1], "-1");
        assert_eq!(args[position("-i") + 1], "a.mp4");
        assert_eq!(args[position("-frames:v") + 1], "90");
        assert!(args[position("-vf") + 1].contains("pad=1080:1920"));
        assert!(args.contains(&"-an".to_string()));
        assert_eq!(args.last().unwrap(), "/tmp/work/segment_0001.mp4");
    }

    #[test]
    fn segment_args_reject_unknown_index() {
        assert!(job()
            .segment_args(&RenderSettings::default(), 9, Path::new("/tmp"), true)
            .is_err());
    }

    #[test]
    fn long_clips_are_not_looped() {
        let args = strings(
            &job()
                .segment_args(&RenderSettings::default(), 1, Path::new("/tmp"), false)
                .unwrap(),
        );
        assert!(!args.contains(&"-stream_loop".to_string()));
        assert_eq!(args[1..5], ["-v", "error", "-i", "a.mp4"]);
    }

    #[test]
    fn loops_only_short_or_unknown_clips() {
        assert!(needs_loop(None, 1.0));
        assert!(needs_loop(Some(0.5), 1.0));
        assert!(!needs_loop(Some(1.0), 1.0));
        assert!(!needs_loop(Some(12.0), 3.0));
    }

    #[test]
    fn concat_list_escapes_quotes() {
        let list = job().concat_list(Path::new("/tmp/it's"));
        assert_eq!(list.lines().count(), 4);
        assert!(list.starts_with("file '/tmp/it'\\''s/segment_0000.mp4'"));
    }

    #[test]
    fn concat_args_mux_audio() {
        let args = strings(&job().concat_args(&RenderSettings::default(), Path::new("list.txt")));
        assert!(args.windows(2).any(|w| w == ["-i", "song.mp3"]));
        assert!(args.windows(2).any(|w| w == ["-c:a", "aac"]));
        assert!(args.windows(2).any(|w| w == ["-t", "10.000"]));
        assert_eq!(args.last().unwrap(), "out.mp4");
    }

    #[test]
    fn output_name_uses_timestamp() {
        let now = Local.with_ymd_and_hms(2024, 3, 9, 14, 5, 7).unwrap();
        assert_eq!(
            output_file_name(Path::new("output"), now),
            PathBuf::from("output/beat_synced_20240309_140507.mp4")
        );
    }

    #[test]
    fn tool_error_keeps_stderr_tail() {
        let err = tool_error("ffmpeg", Some(1), b"a\n\nb\nc\nd\ne\n");
        match err {
            BeatCutError::Tool { stderr, status, .. } => {
                assert_eq!(stderr, "b | c | d | e");
                assert_eq!(status, Some(1));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn probe_reports_missing_binary() {
        let settings = RenderSettings {
            ffprobe: PathBuf::from("/nonexistent/bin/ffprobe"),
            ..RenderSettings::default()
        };
        let err = probe_duration(&settings, Path::new("song.mp3")).unwrap_err();
        assert!(err.to_string().contains("ffprobe"));
    }
}
