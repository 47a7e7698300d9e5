use thiserror::Error;

#[derive(Clone, Debug, Error, PartialEq)]
pub enum EngineError {
    #[error("sample rate must be greater than zero")]
    InvalidSampleRate,
    #[error("invalid range: start {start} is after end {end}")]
    InvalidRange { start: f64, end: f64 },
    #[error("range {start}..{end} lies outside the source ({len} samples)")]
    OutOfRange { start: u64, end: u64, len: u64 },
    #[error("sample source unavailable: {0}")]
    SourceUnavailable(String),
    /// Queued tier build dropped because the request that asked for it was superseded.
    #[error("tier build cancelled")]
    BuildCancelled,
    #[error("unknown channel {0}")]
    UnknownChannel(usize),
    #[error("channel {0} is marked bad")]
    ChannelMarkedBad(usize),
    #[error("unknown annotation {0}")]
    UnknownAnnotation(u64),
    #[error("point budget must be at least one point")]
    InvalidPointBudget,
    #[error("scale factor must be finite and positive, got {0}")]
    InvalidScale(f32),
    #[error("shape mismatch: expected {expected} columns, got {actual}")]
    ShapeMismatch { expected: usize, actual: usize },
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("failed to render plot: {0}")]
    Plot(String),
}

pub type Result<T> = std::result::Result<T, EngineError>;

impl<E: std::error::Error + Send + Sync + 'static> From<plotters::drawing::DrawingAreaErrorKind<E>>
    for EngineError
{
    fn from(value: plotters::drawing::DrawingAreaErrorKind<E>) -> Self {
        EngineError::Plot(format!("{value:?}"))
    }
}

impl From<image::ImageError> for EngineError {
    fn from(value: image::ImageError) -> Self {
        EngineError::Plot(value.to_string())
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(value: serde_json::Error) -> Self {
        EngineError::Config(value.to_string())
    }
}
