use ndarray::{Array2, ArrayView1, Axis};
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};

/// Half-open span of recording time in seconds.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: f64,
    pub end: f64,
}

impl TimeRange {
    pub fn new(start: f64, end: f64) -> Self {
        Self { start, end }
    }

    pub fn duration(&self) -> f64 {
        self.end - self.start
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.start.is_finite() && self.end.is_finite()) || self.end <= self.start {
            return Err(EngineError::InvalidRange {
                start: self.start,
                end: self.end,
            });
        }
        Ok(())
    }

    pub fn overlaps(&self, other: &TimeRange) -> bool {
        self.start < other.end && other.start < self.end
    }
}

/// How rows of a window relate to native samples.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Reduction {
    /// One row per native sample.
    Native,
    /// One low-pass filtered row every `factor` native samples.
    Filtered,
    /// Two rows (bucket min, then bucket max) per `factor` native samples.
    Envelope,
}

impl Reduction {
    pub fn rows_per_bucket(self) -> usize {
        match self {
            Reduction::Envelope => 2,
            Reduction::Native | Reduction::Filtered => 1,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ColumnSummary {
    pub mean: f32,
    pub min: f32,
    pub max: f32,
}

impl ColumnSummary {
    pub fn peak_to_peak(&self) -> f32 {
        self.max - self.min
    }
}

/// Immutable block of samples for a subset of channels.
///
/// Rows are ordered in time. `first_bucket` counts in units of `factor` native samples,
/// so the same bucket of the same tier always lands on the same native position.
#[derive(Clone, Debug)]
pub struct SampleWindow {
    sample_rate: f64,
    reduction: Reduction,
    factor: u64,
    first_bucket: u64,
    end_sample: u64,
    channels: Vec<usize>,
    values: Array2<f32>, // rows x channels
    summaries: OnceCell<Vec<ColumnSummary>>,
}

impl SampleWindow {
    pub fn new(
        sample_rate: f64,
        reduction: Reduction,
        factor: u64,
        first_bucket: u64,
        end_sample: u64,
        channels: Vec<usize>,
        values: Array2<f32>,
    ) -> Result<Self> {
        if !(sample_rate.is_finite() && sample_rate > 0.0) {
            return Err(EngineError::InvalidSampleRate);
        }
        if values.ncols() != channels.len() {
            return Err(EngineError::ShapeMismatch {
                expected: channels.len(),
                actual: values.ncols(),
            });
        }
        Ok(Self {
            sample_rate,
            reduction,
            factor: factor.max(1),
            first_bucket,
            end_sample,
            channels,
            values,
            summaries: OnceCell::new(),
        })
    }

    /// Native-rate window starting at `start_sample`.
    pub fn native(
        sample_rate: f64,
        start_sample: u64,
        channels: Vec<usize>,
        values: Array2<f32>,
    ) -> Result<Self> {
        let end_sample = start_sample + values.nrows() as u64;
        Self::new(
            sample_rate,
            Reduction::Native,
            1,
            start_sample,
            end_sample,
            channels,
            values,
        )
    }

    /// Same placement and channels, new values. Used by every transform.
    pub fn with_values(&self, values: Array2<f32>) -> Result<Self> {
        Self::new(
            self.sample_rate,
            self.reduction,
            self.factor,
            self.first_bucket,
            self.end_sample,
            self.channels.clone(),
            values,
        )
    }

    pub fn sample_rate(&self) -> f64 {
        self.sample_rate
    }

    /// Rate of buckets per second once downsampling is applied.
    pub fn effective_rate(&self) -> f64 {
        self.sample_rate / self.factor as f64
    }

    pub fn reduction(&self) -> Reduction {
        self.reduction
    }

    pub fn factor(&self) -> u64 {
        self.factor
    }

    pub fn first_bucket(&self) -> u64 {
        self.first_bucket
    }

    pub fn start_sample(&self) -> u64 {
        self.first_bucket * self.factor
    }

    pub fn end_sample(&self) -> u64 {
        self.end_sample
    }

    pub fn time_range(&self) -> TimeRange {
        TimeRange::new(
            self.start_sample() as f64 / self.sample_rate,
            self.end_sample as f64 / self.sample_rate,
        )
    }

    pub fn channels(&self) -> &[usize] {
        &self.channels
    }

    pub fn values(&self) -> &Array2<f32> {
        &self.values
    }

    pub fn len(&self) -> usize {
        self.values.nrows()
    }

    pub fn is_empty(&self) -> bool {
        self.values.nrows() == 0
    }

    /// Column position of `channel` inside this window.
    pub fn position_of(&self, channel: usize) -> Option<usize> {
        self.channels.iter().position(|&c| c == channel)
    }

    pub fn column(&self, channel: usize) -> Option<ArrayView1<'_, f32>> {
        self.position_of(channel)
            .map(|pos| self.values.index_axis(Axis(1), pos))
    }

    /// Native sample position (fractional for envelope maxima) of `row`.
    pub fn row_position(&self, row: usize) -> f64 {
        let per_bucket = self.reduction.rows_per_bucket();
        let bucket = self.first_bucket + (row / per_bucket) as u64;
        let within = (row % per_bucket) as f64 * self.factor as f64 / per_bucket as f64;
        (bucket * self.factor) as f64 + within
    }

    pub fn row_times(&self) -> Vec<f64> {
        (0..self.len())
            .map(|row| self.row_position(row) / self.sample_rate)
            .collect()
    }

    /// Mean/min/max per column, computed on first use.
    pub fn summaries(&self) -> &[ColumnSummary] {
        self.summaries.get_or_init(|| {
            self.values
                .axis_iter(Axis(1))
                .map(|column| summarize(column.iter().copied()))
                .collect()
        })
    }

    pub fn summary(&self, channel: usize) -> Option<ColumnSummary> {
        self.position_of(channel).map(|pos| self.summaries()[pos])
    }
}

fn summarize(values: impl Iterator<Item = f32>) -> ColumnSummary {
    let mut count = 0usize;
    let mut sum = 0.0f64;
    let mut min = f32::INFINITY;
    let mut max = f32::NEG_INFINITY;
    for v in values.filter(|v| v.is_finite()) {
        count += 1;
        sum += v as f64;
        min = min.min(v);
        max = max.max(v);
    }
    if count == 0 {
        return ColumnSummary {
            mean: 0.0,
            min: 0.0,
            max: 0.0,
        };
    }
    ColumnSummary {
        mean: (sum / count as f64) as f32,
        min,
        max,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn envelope_rows_alternate_inside_each_bucket() {
        let values = array![[0.0], [1.0], [-1.0], [2.0]];
        let window =
            SampleWindow::new(100.0, Reduction::Envelope, 10, 3, 50, vec![4], values).unwrap();
        assert_eq!(window.start_sample(), 30);
        assert_eq!(window.row_position(0), 30.0);
        assert_eq!(window.row_position(1), 35.0);
        assert_eq!(window.row_position(2), 40.0);
        let times = window.row_times();
        assert!(times.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(window.effective_rate(), 10.0);
    }

    #[test]
    fn summaries_skip_non_finite_values() {
        let values = array![[1.0, 5.0], [f32::NAN, 5.0], [3.0, 5.0]];
        let window = SampleWindow::native(10.0, 0, vec![2, 7], values).unwrap();
        let s = window.summary(2).unwrap();
        assert_eq!(s.mean, 2.0);
        assert_eq!(s.peak_to_peak(), 2.0);
        assert_eq!(window.summary(7).unwrap().peak_to_peak(), 0.0);
        assert!(window.summary(3).is_none());
    }

    #[test]
    fn column_count_must_match_channels() {
        let err = SampleWindow::native(10.0, 0, vec![0], Array2::zeros((4, 2))).unwrap_err();
        assert_eq!(
            err,
            EngineError::ShapeMismatch {
                expected: 1,
                actual: 2
            }
        );
    }

    #[test]
    fn reversed_time_range_is_invalid() {
        assert!(TimeRange::new(2.0, 1.0).validate().is_err());
        assert!(TimeRange::new(0.0, f64::NAN).validate().is_err());
        assert!(TimeRange::new(0.0, 1.0).overlaps(&TimeRange::new(0.5, 3.0)));
    }
}
