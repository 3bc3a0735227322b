//! Core library for beatcut.
//!
//! Builds short vertical videos whose cuts land on the beats of an audio
//! track. Each module owns one step of the process: decoding and beat
//! analysis, the clip inventory, segment planning, rendering through ffmpeg
//! and the hand-off to an external uploader.

pub mod analysis;
pub mod assets;
pub mod audio;
pub mod config;
pub mod error;
pub mod pipeline;
pub mod plan;
pub mod record;
pub mod timeline;
pub mod upload;

pub use analysis::{BeatAnalysis, BeatDetector, DetectorSettings};
pub use assets::{ClipInventory, ClipSelection};
pub use audio::{AudioLibrary, DecodedAudio};
pub use config::{AppConfig, FolderConfig, PlanConfig};
pub use error::{BeatCutError, Result};
pub use pipeline::{Pipeline, PreparedVideo, RunReport, RunRequest};
pub use plan::{BeatPlanner, ClipOrder, ClipSlot, Segment, SegmentPlan};
pub use record::{RenderJob, RenderSettings, Renderer};
pub use timeline::{BeatSheet, BeatTimeline, LabeledBeat};
pub use upload::{
    BatchReport, BatchSettings, CommandUploader, PublishOutcome, RetryPolicy, UploadCommand,
    UploadConfig, UploadLedger, Uploader,
};
