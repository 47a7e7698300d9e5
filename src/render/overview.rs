use crate::signal::stats::percentile;
use crate::signal::window::{Reduction, SampleWindow};

pub const OVERVIEW_LOW_PERCENTILE: f32 = 1.0;
pub const OVERVIEW_HIGH_PERCENTILE: f32 = 99.0;
pub const OVERVIEW_PADDING: f32 = 0.1;

/// Y-range for a single aggregate axis: 1st..99th percentile plus 10% padding.
///
/// Outliers beyond the percentiles are left to clip. `None` without finite values.
pub fn overview_y_range(values: &[f32]) -> Option<(f32, f32)> {
    let lo = percentile(values, OVERVIEW_LOW_PERCENTILE)?;
    let hi = percentile(values, OVERVIEW_HIGH_PERCENTILE)?;
    let span = hi - lo;
    let pad = if span > 0.0 {
        span * OVERVIEW_PADDING
    } else {
        (hi.abs() * OVERVIEW_PADDING).max(1.0)
    };
    Some((lo - pad, hi + pad))
}

/// Whole-recording minimap of one channel.
#[derive(Clone, Debug)]
pub struct OverviewTrace {
    pub channel: usize,
    pub times: Vec<f64>,
    pub values: Vec<f32>,
    pub y_range: (f32, f32),
    pub factor: u64,
    pub reduction: Reduction,
}

impl OverviewTrace {
    pub fn from_window(window: &SampleWindow, channel: usize) -> Option<Self> {
        let values: Vec<f32> = window.column(channel)?.to_vec();
        let y_range = overview_y_range(&values).unwrap_or((-1.0, 1.0));
        Some(Self {
            channel,
            times: window.row_times(),
            values,
            y_range,
            factor: window.factor(),
            reduction: window.reduction(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outliers_do_not_stretch_the_axis() {
        let mut values: Vec<f32> = (0..1000).map(|i| (i % 100) as f32 / 99.0).collect();
        values[10] = 1e6;
        values[20] = -1e6;
        let (lo, hi) = overview_y_range(&values).unwrap();
        assert!(lo > -0.2 && lo < 0.0, "lo {lo}");
        assert!(hi > 1.0 && hi < 1.2, "hi {hi}");
    }

    #[test]
    fn flat_signal_still_gets_a_visible_range() {
        assert_eq!(overview_y_range(&[0.0; 20]), Some((-1.0, 1.0)));
        assert_eq!(overview_y_range(&[50.0; 20]), Some((45.0, 55.0)));
        assert_eq!(overview_y_range(&[f32::NAN]), None);
    }
}
