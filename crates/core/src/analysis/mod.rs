use std::{collections::BTreeMap, f32::consts::PI, fmt, sync::Arc};

use realfft::{num_complex::Complex32, RealFftPlanner, RealToComplex};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{BeatCutError, BeatSheet, BeatTimeline, Result};

const DEFAULT_FRAME_SIZE: usize = 1024;
const DEFAULT_HOP_SIZE: usize = 512;
const BEAT_THRESHOLD: f32 = 0.5;
const DROP_THRESHOLD: f32 = 2.0;
const MIN_BEAT_INTERVAL: f64 = 0.2;
const MIN_DROP_INTERVAL: f64 = 1.0;

/// Tuning knobs for [`BeatDetector`]. Thresholds are expressed in standard
/// deviations above the mean onset strength.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorSettings {
    pub frame_size: usize,
    pub hop_size: usize,
    pub beat_threshold: f32,
    pub drop_threshold: f32,
    pub min_beat_interval: f64,
    pub min_drop_interval: f64,
}

impl Default for DetectorSettings {
    fn default() -> Self {
        Self {
            frame_size: DEFAULT_FRAME_SIZE,
            hop_size: DEFAULT_HOP_SIZE,
            beat_threshold: BEAT_THRESHOLD,
            drop_threshold: DROP_THRESHOLD,
            min_beat_interval: MIN_BEAT_INTERVAL,
            min_drop_interval: MIN_DROP_INTERVAL,
        }
    }
}

/// Beats and strong onsets found in a track.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BeatAnalysis {
    pub sample_rate: u32,
    pub duration_seconds: f64,
    pub tempo_bpm: Option<f64>,
    pub beats: Vec<f64>,
    /// Onsets well above the typical strength, labelled `drop` in sheets.
    pub drops: Vec<f64>,
}

impl BeatAnalysis {
    pub fn timeline(&self) -> BeatTimeline {
        BeatTimeline::from_unsorted(self.beats.clone())
    }

    /// Converts the analysis into a labelled beat sheet.
    pub fn to_sheet(&self) -> BeatSheet {
        let mut labeled_beats = BTreeMap::new();
        labeled_beats.insert("beat".to_string(), self.beats.clone());
        if !self.drops.is_empty() {
            labeled_beats.insert("drop".to_string(), self.drops.clone());
        }
        BeatSheet::Labeled { labeled_beats }
    }
}

/// Spectral-flux onset detector. Frames are Hann windowed and transformed
/// with a real FFT; the FFT plan is cached between calls while the frame size
/// stays the same.
pub struct BeatDetector {
    settings: DetectorSettings,
    fft_planner: RealFftPlanner<f32>,
    fft: Option<FftResources>,
}

impl BeatDetector {
    pub fn new() -> Self {
        Self::with_settings(DetectorSettings::default())
    }

    pub fn with_settings(settings: DetectorSettings) -> Self {
        Self {
            settings,
            fft_planner: RealFftPlanner::new(),
            fft: None,
        }
    }

    pub fn settings(&self) -> &DetectorSettings {
        &self.settings
    }

    /// Finds beats and drops in mono `samples`.
    pub fn analyse(&mut self, samples: &[f32], sample_rate: u32) -> Result<BeatAnalysis> {
        if sample_rate == 0 {
            return Err(BeatCutError::InvalidInput("sample rate must be positive"));
        }

        let duration_seconds = samples.len() as f64 / sample_rate as f64;
        let envelope = self.onset_envelope(samples)?;
        let hop = self.settings.hop_size as f64;
        let half_frame = self.settings.frame_size as f64 * 0.5;
        let frame_time = |index: usize| (index as f64 * hop + half_frame) / sample_rate as f64;

        let beats = pick_peaks(
            &envelope,
            self.settings.beat_threshold,
            self.settings.min_beat_interval,
            &frame_time,
        );
        let drops = pick_peaks(
            &envelope,
            self.settings.drop_threshold,
            self.settings.min_drop_interval,
            &frame_time,
        );
        let tempo_bpm = BeatTimeline::from_unsorted(beats.clone()).tempo_bpm();

        debug!(
            frames = envelope.len(),
            beats = beats.len(),
            drops = drops.len(),
            ?tempo_bpm,
            "beat analysis complete"
        );

        Ok(BeatAnalysis {
            sample_rate,
            duration_seconds,
            tempo_bpm,
            beats,
            drops,
        })
    }

    /// Positive spectral flux for each hop-spaced frame. Tracks shorter than
    /// one frame produce an empty envelope.
    pub fn onset_envelope(&mut self, samples: &[f32]) -> Result<Vec<f32>> {
        let frame_size = self.settings.frame_size;
        let hop_size = self.settings.hop_size;
        if frame_size < 2 || hop_size == 0 {
            return Err(BeatCutError::InvalidInput(
                "frame size must be at least two samples and hop size positive",
            ));
        }
        if samples.len() < frame_size {
            return Ok(Vec::new());
        }

        let frame_count = (samples.len() - frame_size) / hop_size + 1;
        let mut envelope = Vec::with_capacity(frame_count);
        let mut previous: Option<Vec<f32>> = None;

        for index in 0..frame_count {
            let offset = index * hop_size;
            let magnitudes = self.magnitude_spectrum(&samples[offset..offset + frame_size])?;
            let flux = previous
                .as_ref()
                .map(|prev| {
                    magnitudes
                        .iter()
                        .zip(prev)
                        .map(|(current, last)| (current - last).max(0.0))
                        .sum::<f32>()
                })
                .unwrap_or(0.0);
            envelope.push(flux);
            previous = Some(magnitudes);
        }

        Ok(envelope)
    }

    fn magnitude_spectrum(&mut self, frame: &[f32]) -> Result<Vec<f32>> {
        let len = frame.len();
        let fft = self.prepare_fft(len);

        for (index, value) in frame.iter().enumerate() {
            fft.input[index] = *value * hann_value(index, len);
        }

        fft.plan
            .process_with_scratch(&mut fft.input, &mut fft.spectrum, &mut fft.scratch)?;

        Ok(fft.spectrum.iter().map(|bin| bin.norm()).collect())
    }

    fn prepare_fft(&mut self, size: usize) -> &mut FftResources {
        let planner = &mut self.fft_planner;
        let fft = self.fft.get_or_insert_with(|| FftResources::new(planner, size));
        if fft.size != size {
            *fft = FftResources::new(planner, size);
        }
        fft
    }
}

impl Default for BeatDetector {
    fn default() -> Self {
        Self::new()
    }
}

struct FftResources {
    size: usize,
    plan: Arc<dyn RealToComplex<f32>>,
    scratch: Vec<Complex32>,
    spectrum: Vec<Complex32>,
    input: Vec<f32>,
}

impl FftResources {
    fn new(planner: &mut RealFftPlanner<f32>, size: usize) -> Self {
        let plan = planner.plan_fft_forward(size);
        Self {
            size,
            scratch: plan.make_scratch_vec(),
            spectrum: plan.make_output_vec(),
            input: plan.make_input_vec(),
            plan,
        }
    }
}

impl fmt::Debug for BeatDetector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BeatDetector")
            .field("settings", &self.settings)
            .field("fft", &self.fft)
            .finish()
    }
}

impl fmt::Debug for FftResources {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FftResources")
            .field("size", &self.size)
            .finish()
    }
}

/// Local maxima of `envelope` above `mean + threshold * stddev`, at least
/// `min_interval` seconds apart.
fn pick_peaks(
    envelope: &[f32],
    threshold: f32,
    min_interval: f64,
    frame_time: impl Fn(usize) -> f64,
) -> Vec<f64> {
    if envelope.len() < 3 {
        return Vec::new();
    }

    let count = envelope.len() as f32;
    let mean = envelope.iter().sum::<f32>() / count;
    let variance = envelope.iter().map(|v| (v - mean) * (v - mean)).sum::<f32>() / count;
    let cutoff = mean + threshold * variance.sqrt();

    let mut peaks: Vec<f64> = Vec::new();
    for index in 1..envelope.len() - 1 {
        let value = envelope[index];
        let is_peak = value > cutoff
            && value >= envelope[index - 1]
            && value > envelope[index + 1];
        if !is_peak {
            continue;
        }

        let time = frame_time(index);
        if peaks
            .last()
            .map(|last| time - last >= min_interval)
            .unwrap_or(true)
        {
            peaks.push(time);
        }
    }

    peaks
}

fn hann_value(index: usize, len: usize) -> f32 {
    if len <= 1 {
        return 1.0;
    }

    0.5 - 0.5 * ((2.0 * PI * index as f32) / (len as f32 - 1.0)).cos()
}

#[cfg(test)]
mod tests {
    use super::*;

    const RATE: u32 = 8_000;

    /// Silence with a short 440 Hz burst every half second.
    fn click_track(seconds: f32) -> (Vec<f32>, Vec<f64>) {
        let total = (seconds * RATE as f32) as usize;
        let mut samples = vec![0.0; total];
        let mut onsets = Vec::new();
        let mut start = RATE as usize / 2;
        while start + 800 < total {
            for offset in 0..800 {
                let t = offset as f32 / RATE as f32;
                samples[start + offset] = 0.8 * (2.0 * PI * 440.0 * t).sin();
            }
            onsets.push(start as f64 / RATE as f64);
            start += RATE as usize / 2;
        }
        (samples, onsets)
    }

    fn detector() -> BeatDetector {
        BeatDetector::with_settings(DetectorSettings {
            beat_threshold: 0.0,
            min_beat_interval: 0.25,
            ..DetectorSettings::default()
        })
    }

    #[test]
    fn silence_has_no_beats() {
        let mut detector = BeatDetector::new();
        let analysis = detector.analyse(&vec![0.0; RATE as usize * 2], RATE).unwrap();

        assert!(analysis.beats.is_empty());
        assert!(analysis.tempo_bpm.is_none());
        assert!((analysis.duration_seconds - 2.0).abs() < 1e-9);
    }

    #[test]
    fn short_input_yields_empty_envelope() {
        let mut detector = BeatDetector::new();
        assert!(detector.onset_envelope(&[0.5; 100]).unwrap().is_empty());
    }

    #[test]
    fn rejects_zero_sample_rate() {
        let mut detector = BeatDetector::new();
        assert!(detector.analyse(&[0.0; 4096], 0).is_err());
    }

    #[test]
    fn finds_clicks_and_tempo() {
        let (samples, onsets) = click_track(4.0);
        let analysis = detector().analyse(&samples, RATE).unwrap();

        assert_eq!(analysis.beats.len(), onsets.len());
        for (beat, onset) in analysis.beats.iter().zip(&onsets) {
            assert!((beat - onset).abs() < 0.2, "beat {beat} far from onset {onset}");
        }

        let tempo = analysis.tempo_bpm.expect("tempo should be detected");
        assert!((tempo - 120.0).abs() < 10.0);
    }

    #[test]
    fn sheet_carries_beat_and_drop_labels() {
        let analysis = BeatAnalysis {
            beats: vec![0.5, 1.0],
            drops: vec![1.0],
            ..Default::default()
        };
        let labeled = analysis.to_sheet().labeled();
        assert_eq!(labeled.len(), 3);
        assert!(labeled.iter().any(|beat| beat.label == "drop"));
        assert_eq!(analysis.to_sheet().timeline().as_slice(), &[0.5, 1.0]);
    }
}
