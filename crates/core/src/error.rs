/// Result alias that carries the custom [`BeatCutError`] type.
pub type Result<T> = std::result::Result<T, BeatCutError>;

/// Common error type for the core crate.
#[derive(Debug, thiserror::Error)]
pub enum BeatCutError {
    /// The beat timeline is empty.
    #[error("no beats detected or provided")]
    NoBeats,
    /// No beat clears the minimum intro duration.
    #[error("no beat found at or after the minimum intro duration of {min_intro_seconds:.2}s")]
    NoIntroBoundary { min_intro_seconds: f64 },
    /// There are no clips to assign to segments.
    #[error("no clips available to build a video")]
    EmptyClipPool,
    /// Structurally invalid arguments handed to a pure function.
    #[error("invalid input: {0}")]
    InvalidInput(&'static str),
    /// Free-form message for conditions without a dedicated variant.
    #[error("{0}")]
    Message(String),
    /// Wrapper around standard IO errors.
    #[error("{0}")]
    Io(#[from] std::io::Error),
    /// Malformed JSON in a configuration or beat sheet.
    #[error("{0}")]
    Json(#[from] serde_json::Error),
    /// The audio stream could not be decoded.
    #[error("audio decode failed: {0}")]
    Decode(String),
    /// An external tool such as ffmpeg exited unsuccessfully.
    #[error("{tool} exited with status {status:?}: {stderr}")]
    Tool {
        tool: String,
        status: Option<i32>,
        stderr: String,
    },
}

impl BeatCutError {
    /// Creates a new error that simply wraps the provided message.
    pub fn msg<T: Into<String>>(msg: T) -> Self {
        Self::Message(msg.into())
    }

    /// Returns `true` for the errors raised when the inputs cannot produce a
    /// segment plan. Retrying with the same inputs will not help.
    pub fn is_plan_failure(&self) -> bool {
        matches!(
            self,
            Self::NoBeats | Self::NoIntroBoundary { .. } | Self::EmptyClipPool
        )
    }
}

impl From<&str> for BeatCutError {
    fn from(value: &str) -> Self {
        Self::msg(value)
    }
}

impl From<String> for BeatCutError {
    fn from(value: String) -> Self {
        Self::Message(value)
    }
}

impl From<symphonia::core::errors::Error> for BeatCutError {
    fn from(value: symphonia::core::errors::Error) -> Self {
        Self::Decode(value.to_string())
    }
}

impl From<realfft::FftError> for BeatCutError {
    fn from(value: realfft::FftError) -> Self {
        Self::Message(format!("fft failed: {value}"))
    }
}
