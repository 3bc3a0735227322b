use std::path::{Path, PathBuf};

use beatcut_core::{
    pipeline::{detect_beats, sidecar_sheet_path},
    AppConfig, BeatPlanner, BeatSheet, ClipOrder, Pipeline, RunRequest,
};
use clap::{Parser, Subcommand};
use rand::{rngs::StdRng, SeedableRng};
use tracing_subscriber::EnvFilter;

fn main() -> beatcut_core::Result<()> {
    init_tracing();

    let cli = Cli::parse();

    match cli.command {
        Commands::Init => run_init(&cli.config),
        Commands::Detect { audio, output } => run_detect(&audio, output.as_deref()),
        Commands::Plan {
            beats,
            duration,
            clips,
            min_intro,
            seed,
            reverse,
        } => run_plan(&cli.config, &beats, duration, clips, min_intro, seed, reverse),
        Commands::Run {
            audio,
            beats,
            seed,
            cycles,
        } => run_pipeline(&cli.config, audio, beats, seed, cycles),
        Commands::Upload { dir, max, seed } => run_upload(&cli.config, &dir, max, seed),
    }
}

fn run_init(config_path: &Path) -> beatcut_core::Result<()> {
    let config = AppConfig::load_or_default(config_path)?;
    config.folders.ensure()?;
    if !config_path.exists() {
        config.save(config_path)?;
        tracing::info!(path = %config_path.display(), "wrote default configuration");
    }
    Ok(())
}

fn run_detect(audio: &Path, output: Option<&Path>) -> beatcut_core::Result<()> {
    tracing::info!(audio = %audio.display(), "detecting beats");
    let analysis = detect_beats(audio)?;
    let output = output
        .map(Path::to_path_buf)
        .unwrap_or_else(|| sidecar_sheet_path(audio));
    analysis.to_sheet().save(&output)?;
    tracing::info!(
        beats = analysis.beats.len(),
        drops = analysis.drops.len(),
        tempo_bpm = ?analysis.tempo_bpm,
        output = %output.display(),
        "beat sheet written"
    );
    Ok(())
}

fn run_plan(
    config_path: &Path,
    beats: &Path,
    duration: f64,
    clips: usize,
    min_intro: Option<f64>,
    seed: Option<u64>,
    reverse: bool,
) -> beatcut_core::Result<()> {
    let config = AppConfig::load_or_default(config_path)?;
    let timeline = BeatSheet::load(beats)?.timeline();
    let planner = BeatPlanner::new(min_intro.unwrap_or(config.plan.min_intro_seconds));

    let mut order = ClipOrder::choose(&mut rng_from(seed));
    if reverse {
        order = order.reversed();
    }

    let plan = planner.plan(timeline.as_slice(), duration, clips, order)?;
    println!("{}", serde_json::to_string_pretty(&plan)?);
    Ok(())
}

fn run_pipeline(
    config_path: &Path,
    audio: Option<PathBuf>,
    beats: Option<PathBuf>,
    seed: Option<u64>,
    cycles: Option<usize>,
) -> beatcut_core::Result<()> {
    let config = AppConfig::load_or_default(config_path)?;
    let pipeline = Pipeline::new(config)?;
    let request = RunRequest {
        audio,
        beat_sheet: beats,
    };

    let reports = pipeline.run(&request, &mut rng_from(seed), cycles)?;
    for report in &reports {
        tracing::info!(
            audio = %report.audio.display(),
            output = %report.output.display(),
            segments = report.segments,
            upload = ?report.upload,
            "video created"
        );
    }
    Ok(())
}

fn run_upload(
    config_path: &Path,
    dir: &Path,
    max: Option<usize>,
    seed: Option<u64>,
) -> beatcut_core::Result<()> {
    let mut config = AppConfig::load_or_default(config_path)?;
    if max.is_some() {
        config.upload.batch.max_uploads = max;
    }
    let pipeline = Pipeline::new(config)?;
    let mut uploader = pipeline.command_uploader()?;

    let report = pipeline.publish_folder(&mut uploader, dir, &mut rng_from(seed))?;
    tracing::info!(
        uploaded = report.uploaded.len(),
        already_uploaded = report.already_uploaded,
        failed = report.failed.len(),
        "upload session completed"
    );
    Ok(())
}

fn rng_from(seed: Option<u64>) -> StdRng {
    match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .try_init();
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Beat-synchronised short video builder", long_about = None)]
struct Cli {
    /// Configuration file; defaults are used when it does not exist.
    #[arg(short, long, global = true, default_value = "beatcut.json")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create the clip, audio and output folders and a default config.
    Init,
    /// Analyse an audio file and write its beat sheet.
    Detect {
        /// Audio file to analyse.
        audio: PathBuf,
        /// Where to write the sheet. Defaults to `<audio>.beats.json`.
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Print the segment plan for a beat sheet as JSON.
    Plan {
        /// Beat sheet to plan from.
        #[arg(long)]
        beats: PathBuf,
        /// Audio duration in seconds.
        #[arg(long)]
        duration: f64,
        /// Number of clips in the round-robin pool.
        #[arg(long)]
        clips: usize,
        /// Minimum intro length in seconds; overrides the config.
        #[arg(long)]
        min_intro: Option<f64>,
        /// Seed for the clip order choice.
        #[arg(long)]
        seed: Option<u64>,
        /// Flip the chosen clip order.
        #[arg(long)]
        reverse: bool,
    },
    /// Build a video, and upload it when enabled in the config.
    Run {
        /// Use this audio file instead of a random one from the audio folder.
        #[arg(long)]
        audio: Option<PathBuf>,
        /// Use this beat sheet instead of the sidecar or detection.
        #[arg(long)]
        beats: Option<PathBuf>,
        /// Seed for every random choice.
        #[arg(long)]
        seed: Option<u64>,
        /// Stop after this many cycles when looping.
        #[arg(long)]
        cycles: Option<usize>,
    },
    /// Upload every video in a folder that has not been uploaded yet.
    Upload {
        /// Folder holding the videos.
        dir: PathBuf,
        /// Stop after this many uploads; overrides the config.
        #[arg(long)]
        max: Option<usize>,
        /// Seed for captions and delays.
        #[arg(long)]
        seed: Option<u64>,
    },
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_plan_arguments() {
        let cli = Cli::parse_from([
            "beatcut", "plan", "--beats", "b.json", "--duration", "10", "--clips", "2", "--seed",
            "7",
        ]);
        match cli.command {
            Commands::Plan {
                duration,
                clips,
                seed,
                reverse,
                ..
            } => {
                assert_eq!(duration, 10.0);
                assert_eq!(clips, 2);
                assert_eq!(seed, Some(7));
                assert!(!reverse);
            }
            other => panic!("unexpected command {other:?}"),
        }
        assert_eq!(cli.config, PathBuf::from("beatcut.json"));
    }

    #[test]
    fn parses_upload_arguments() {
        let cli = Cli::parse_from(["beatcut", "--config", "c.json", "upload", "output", "--max", "2"]);
        match cli.command {
            Commands::Upload { dir, max, seed } => {
                assert_eq!(dir, PathBuf::from("output"));
                assert_eq!(max, Some(2));
                assert_eq!(seed, None);
            }
            other => panic!("unexpected command {other:?}"),
        }
        assert_eq!(cli.config, PathBuf::from("c.json"));
    }
}
