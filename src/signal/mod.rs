pub mod filter;
pub mod source;
pub mod spectrum;
pub mod stats;
pub mod synthetic;
pub mod transform;
pub mod window;

pub use filter::{FilterChain, FilterKind};
pub use source::{ArraySource, SampleSource};
pub use spectrum::{spectrogram, welch_psd, PowerSpectrum, Spectrogram};
pub use stats::{percentile, ChannelStats};
pub use transform::{Pipeline, ProcessingStage, WindowTransform};
pub use window::{ColumnSummary, Reduction, SampleWindow, TimeRange};
