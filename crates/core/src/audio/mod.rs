use std::{
    fs::File,
    path::{Path, PathBuf},
};

use rand::{seq::SliceRandom, Rng};
use symphonia::core::{
    audio::SampleBuffer,
    codecs::{DecoderOptions, CODEC_TYPE_NULL},
    errors::Error as SymphoniaError,
    formats::{FormatOptions, FormatReader},
    io::MediaSourceStream,
    meta::MetadataOptions,
    probe::Hint,
};
use tracing::{debug, instrument, warn};

use crate::{assets::list_media_files, BeatCutError, Result};

/// Extensions recognised as audio tracks.
pub const AUDIO_EXTENSIONS: &[&str] = &["mp3", "wav", "ogg", "m4a", "flac"];

/// Mono PCM samples decoded from an audio file.
#[derive(Debug, Clone, Default)]
pub struct DecodedAudio {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl DecodedAudio {
    pub fn duration_seconds(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.samples.len() as f64 / self.sample_rate as f64
    }
}

/// Decodes the first audio track of `path`, mixing every channel down to
/// mono.
#[instrument(fields(path = %path.display()))]
pub fn decode_audio(path: &Path) -> Result<DecodedAudio> {
    let mut format = open_format(path)?;

    let track = format
        .tracks()
        .iter()
        .find(|track| track.codec_params.codec != CODEC_TYPE_NULL)
        .ok_or_else(|| BeatCutError::Decode("no audio track found".to_string()))?;
    let track_id = track.id;
    let sample_rate = track
        .codec_params
        .sample_rate
        .ok_or_else(|| BeatCutError::Decode("audio track has no sample rate".to_string()))?;

    let mut decoder =
        symphonia::default::get_codecs().make(&track.codec_params, &DecoderOptions::default())?;
    let mut samples = Vec::new();

    loop {
        let packet = match format.next_packet() {
            Ok(packet) => packet,
            Err(SymphoniaError::IoError(err))
                if err.kind() == std::io::ErrorKind::UnexpectedEof =>
            {
                break;
            }
            Err(SymphoniaError::ResetRequired) => break,
            Err(err) => return Err(err.into()),
        };

        if packet.track_id() != track_id {
            continue;
        }

        let decoded = match decoder.decode(&packet) {
            Ok(decoded) => decoded,
            Err(SymphoniaError::DecodeError(reason)) => {
                warn!(reason, "skipping undecodable packet");
                continue;
            }
            Err(err) => return Err(err.into()),
        };

        let spec = *decoded.spec();
        let channels = spec.channels.count().max(1);
        let mut buffer = SampleBuffer::<f32>::new(decoded.capacity() as u64, spec);
        buffer.copy_interleaved_ref(decoded);
        samples.extend(
            buffer
                .samples()
                .chunks(channels)
                .map(|frame| frame.iter().sum::<f32>() / channels as f32),
        );
    }

    let audio = DecodedAudio {
        samples,
        sample_rate,
    };
    debug!(
        sample_rate,
        duration = audio.duration_seconds(),
        "audio decoded"
    );
    Ok(audio)
}

/// Reads the track duration from the container metadata, decoding the whole
/// stream only when the frame count is not declared.
#[instrument(fields(path = %path.display()))]
pub fn probe_audio_duration(path: &Path) -> Result<f64> {
    let declared = open_format(path)?
        .tracks()
        .iter()
        .find(|track| track.codec_params.codec != CODEC_TYPE_NULL)
        .and_then(|track| {
            let params = &track.codec_params;
            match (params.n_frames, params.sample_rate) {
                (Some(frames), Some(rate)) if rate > 0 => Some(frames as f64 / rate as f64),
                _ => None,
            }
        });

    match declared {
        Some(duration) => Ok(duration),
        None => Ok(decode_audio(path)?.duration_seconds()),
    }
}

fn open_format(path: &Path) -> Result<Box<dyn FormatReader>> {
    let file = File::open(path).map_err(|err| {
        BeatCutError::msg(format!("failed to open audio file {}: {err}", path.display()))
    })?;
    let stream = MediaSourceStream::new(Box::new(file), Default::default());

    let mut hint = Hint::new();
    if let Some(extension) = path.extension().and_then(|ext| ext.to_str()) {
        hint.with_extension(extension);
    }

    let probed = symphonia::default::get_probe().format(
        &hint,
        stream,
        &FormatOptions::default(),
        &MetadataOptions::default(),
    )?;
    Ok(probed.format)
}

/// Audio tracks available in a folder, sorted by path.
#[derive(Debug, Clone, Default)]
pub struct AudioLibrary {
    tracks: Vec<PathBuf>,
}

impl AudioLibrary {
    pub fn scan(dir: &Path) -> Result<Self> {
        let tracks = list_media_files(dir, AUDIO_EXTENSIONS)?;
        debug!(dir = %dir.display(), tracks = tracks.len(), "audio library scanned");
        Ok(Self { tracks })
    }

    pub fn tracks(&self) -> &[PathBuf] {
        &self.tracks
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    /// Picks a track uniformly at random.
    pub fn choose<R: Rng + ?Sized>(&self, rng: &mut R) -> Option<&Path> {
        self.tracks.choose(rng).map(PathBuf::as_path)
    }
}
