use std::{collections::BTreeMap, fs, path::Path};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{BeatCutError, Result};

/// Sorted, strictly increasing sequence of beat timestamps in seconds.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct BeatTimeline {
    beats: Vec<f64>,
}

impl BeatTimeline {
    /// Validates and wraps a list of timestamps. Every value must be finite,
    /// non-negative and strictly greater than the one before it.
    pub fn new(beats: Vec<f64>) -> Result<Self> {
        if beats.iter().any(|beat| !beat.is_finite() || *beat < 0.0) {
            return Err(BeatCutError::InvalidInput(
                "beat timestamps must be finite and non-negative",
            ));
        }

        if beats.windows(2).any(|pair| pair[1] <= pair[0]) {
            return Err(BeatCutError::InvalidInput(
                "beat timestamps must be strictly increasing",
            ));
        }

        Ok(Self { beats })
    }

    /// Builds a timeline from arbitrary timestamps by discarding invalid
    /// values, sorting and removing duplicates.
    pub fn from_unsorted(mut beats: Vec<f64>) -> Self {
        beats.retain(|beat| beat.is_finite() && *beat >= 0.0);
        beats.sort_by(f64::total_cmp);
        beats.dedup();
        Self { beats }
    }

    pub fn as_slice(&self) -> &[f64] {
        &self.beats
    }

    pub fn len(&self) -> usize {
        self.beats.len()
    }

    pub fn is_empty(&self) -> bool {
        self.beats.is_empty()
    }

    /// Average tempo implied by the spacing of the beats, if there are at
    /// least two.
    pub fn tempo_bpm(&self) -> Option<f64> {
        if self.beats.len() < 2 {
            return None;
        }

        let span = self.beats[self.beats.len() - 1] - self.beats[0];
        let average_interval = span / (self.beats.len() - 1) as f64;
        (average_interval > 0.0).then(|| 60.0 / average_interval)
    }
}

/// Single beat carrying the label it was filed under in a beat sheet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabeledBeat {
    pub time_seconds: f64,
    pub label: String,
}

impl LabeledBeat {
    pub fn new(time_seconds: f64, label: impl Into<String>) -> Self {
        Self {
            time_seconds,
            label: label.into(),
        }
    }
}

/// On-disk beat description. Three JSON shapes are accepted: an object with
/// `labeled_beats` mapping labels to timestamps, an object with a flat
/// `beats` list, or a bare array of timestamps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum BeatSheet {
    Labeled {
        labeled_beats: BTreeMap<String, Vec<f64>>,
    },
    Flat {
        beats: Vec<f64>,
    },
    Bare(Vec<f64>),
}

impl BeatSheet {
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|err| {
            BeatCutError::msg(format!(
                "failed to read beat sheet {}: {err}",
                path.display()
            ))
        })?;
        let sheet = Self::from_json(&content)?;
        debug!(path = %path.display(), beats = sheet.timeline().len(), "beat sheet loaded");
        Ok(sheet)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_json::to_vec_pretty(self)?)?;
        Ok(())
    }

    /// Merges every timestamp in the sheet into one timeline.
    pub fn timeline(&self) -> BeatTimeline {
        let all = match self {
            Self::Labeled { labeled_beats } => {
                labeled_beats.values().flatten().copied().collect()
            }
            Self::Flat { beats } | Self::Bare(beats) => beats.clone(),
        };
        BeatTimeline::from_unsorted(all)
    }

    /// Lists every beat with its label, ordered by time. Unlabelled sheets
    /// report the label `beat`.
    pub fn labeled(&self) -> Vec<LabeledBeat> {
        let mut events: Vec<LabeledBeat> = match self {
            Self::Labeled { labeled_beats } => labeled_beats
                .iter()
                .flat_map(|(label, times)| {
                    times.iter().map(move |time| LabeledBeat::new(*time, label.as_str()))
                })
                .collect(),
            Self::Flat { beats } | Self::Bare(beats) => {
                beats.iter().map(|time| LabeledBeat::new(*time, "beat")).collect()
            }
        };
        events.sort_by(|a, b| a.time_seconds.total_cmp(&b.time_seconds));
        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_unsorted_timeline() {
        let err = BeatTimeline::new(vec![1.0, 3.0, 2.0]).unwrap_err();
        assert!(matches!(err, BeatCutError::InvalidInput(_)));
    }

    #[test]
    fn rejects_duplicates_and_negatives() {
        assert!(BeatTimeline::new(vec![1.0, 1.0]).is_err());
        assert!(BeatTimeline::new(vec![-0.5, 1.0]).is_err());
        assert!(BeatTimeline::new(vec![f64::NAN]).is_err());
    }

    #[test]
    fn unsorted_input_is_normalised() {
        let timeline = BeatTimeline::from_unsorted(vec![3.0, 1.0, f64::NAN, 3.0, -2.0, 2.0]);
        assert_eq!(timeline.as_slice(), &[1.0, 2.0, 3.0]);
    }

    #[test]
    fn tempo_from_even_spacing() {
        let timeline = BeatTimeline::new(vec![0.0, 0.5, 1.0, 1.5]).unwrap();
        let tempo = timeline.tempo_bpm().unwrap();
        assert!((tempo - 120.0).abs() < 1e-9);
        assert!(BeatTimeline::new(vec![1.0]).unwrap().tempo_bpm().is_none());
    }

    #[test]
    fn parses_labeled_sheet_and_merges_labels() {
        let sheet =
            BeatSheet::from_json(r#"{"labeled_beats": {"drop": [4.0, 1.0], "beat": [2.0, 4.0]}}"#)
                .unwrap();
        assert!(matches!(sheet, BeatSheet::Labeled { .. }));
        assert_eq!(sheet.timeline().as_slice(), &[1.0, 2.0, 4.0]);

        let labeled = sheet.labeled();
        assert_eq!(labeled.len(), 4);
        assert_eq!(labeled[0], LabeledBeat::new(1.0, "drop"));
    }

    #[test]
    fn parses_flat_and_bare_sheets() {
        let flat = BeatSheet::from_json(r#"{"beats": [0.5, 1.5]}"#).unwrap();
        assert_eq!(flat.timeline().as_slice(), &[0.5, 1.5]);

        let bare = BeatSheet::from_json("[2.0, 1.0]").unwrap();
        assert_eq!(bare.timeline().as_slice(), &[1.0, 2.0]);
        assert_eq!(bare.labeled()[0].label, "beat");
    }

    #[test]
    fn rejects_unknown_shapes() {
        assert!(BeatSheet::from_json(r#"{"tempo": 120}"#).is_err());
    }
}
