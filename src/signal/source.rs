use ndarray::{s, Array2, Axis};

use crate::error::{EngineError, Result};

/// Random-access reader over a recorded multi-channel signal.
///
/// Implementations decode whatever container the recording lives in; the engine only
/// ever asks for dense `(samples x channels)` blocks of native-rate `f32` values.
pub trait SampleSource: Send + Sync {
    fn channel_count(&self) -> usize;

    fn sample_rate(&self) -> f64;

    /// Samples per channel.
    fn sample_count(&self) -> u64;

    fn channel_labels(&self) -> Vec<String> {
        (0..self.channel_count()).map(|idx| format!("Ch {idx}")).collect()
    }

    /// Reads native samples `[start, end)` for `channels`, in the given column order.
    ///
    /// Fails with `OutOfRange` when the range lies entirely outside the recording and
    /// with `SourceUnavailable` when the backing store can no longer be read.
    fn read(&self, start: u64, end: u64, channels: &[usize]) -> Result<Array2<f32>>;

    fn duration_seconds(&self) -> f64 {
        self.sample_count() as f64 / self.sample_rate()
    }
}

/// In-memory source useful for tests, synthetic data and already-decoded files.
#[derive(Clone, Debug)]
pub struct ArraySource {
    sample_rate: f64,
    labels: Vec<String>,
    data: Array2<f32>, // samples x channels
}

impl ArraySource {
    pub fn new(sample_rate: f64, data: Array2<f32>) -> Result<Self> {
        let labels = (0..data.ncols()).map(|idx| format!("Ch {idx}")).collect();
        Self::with_labels(sample_rate, data, labels)
    }

    pub fn with_labels(sample_rate: f64, data: Array2<f32>, labels: Vec<String>) -> Result<Self> {
        if !(sample_rate.is_finite() && sample_rate > 0.0) {
            return Err(EngineError::InvalidSampleRate);
        }
        if labels.len() != data.ncols() {
            return Err(EngineError::ShapeMismatch {
                expected: data.ncols(),
                actual: labels.len(),
            });
        }
        Ok(Self {
            sample_rate,
            labels,
            data,
        })
    }

    /// Builds a source from per-channel sample vectors (channels x samples).
    pub fn from_channels(sample_rate: f64, channels: &[Vec<f32>]) -> Result<Self> {
        let samples = channels.first().map(|c| c.len()).unwrap_or(0);
        if let Some(bad) = channels.iter().find(|c| c.len() != samples) {
            return Err(EngineError::ShapeMismatch {
                expected: samples,
                actual: bad.len(),
            });
        }
        let data = Array2::from_shape_fn((samples, channels.len()), |(row, col)| {
            channels[col][row]
        });
        Self::new(sample_rate, data)
    }

    pub fn data(&self) -> &Array2<f32> {
        &self.data
    }
}

impl SampleSource for ArraySource {
    fn channel_count(&self) -> usize {
        self.data.ncols()
    }

    fn sample_rate(&self) -> f64 {
        self.sample_rate
    }

    fn sample_count(&self) -> u64 {
        self.data.nrows() as u64
    }

    fn channel_labels(&self) -> Vec<String> {
        self.labels.clone()
    }

    fn read(&self, start: u64, end: u64, channels: &[usize]) -> Result<Array2<f32>> {
        let len = self.sample_count();
        if start >= len || end <= start {
            return Err(EngineError::OutOfRange { start, end, len });
        }
        if let Some(&bad) = channels.iter().find(|&&c| c >= self.channel_count()) {
            return Err(EngineError::UnknownChannel(bad));
        }
        let end = end.min(len);
        let block = self.data.slice(s![start as usize..end as usize, ..]);
        Ok(block.select(Axis(1), channels))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_channel() -> ArraySource {
        ArraySource::from_channels(100.0, &[vec![0.0, 1.0, 2.0, 3.0], vec![10.0, 11.0, 12.0, 13.0]])
            .unwrap()
    }

    #[test]
    fn reads_reordered_subset_and_clips_end() {
        let source = two_channel();
        let block = source.read(2, 99, &[1, 0]).unwrap();
        assert_eq!(block.shape(), &[2, 2]);
        assert_eq!(block[[0, 0]], 12.0);
        assert_eq!(block[[1, 1]], 3.0);
    }

    #[test]
    fn rejects_reads_past_the_end() {
        let source = two_channel();
        assert_eq!(
            source.read(4, 8, &[0]).unwrap_err(),
            EngineError::OutOfRange {
                start: 4,
                end: 8,
                len: 4
            }
        );
        assert_eq!(source.read(0, 2, &[2]).unwrap_err(), EngineError::UnknownChannel(2));
    }

    #[test]
    fn ragged_channels_are_rejected() {
        let err = ArraySource::from_channels(10.0, &[vec![0.0; 3], vec![0.0; 2]]).unwrap_err();
        assert!(matches!(err, EngineError::ShapeMismatch { .. }));
        assert_eq!(
            ArraySource::new(0.0, Array2::zeros((1, 1))).unwrap_err(),
            EngineError::InvalidSampleRate
        );
    }
}
