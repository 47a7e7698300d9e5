use serde::Serialize;

/// Descriptive statistics of one channel over a window.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize)]
pub struct ChannelStats {
    pub mean: f32,
    pub std_dev: f32,
    pub median: f32,
    pub min: f32,
    pub max: f32,
    pub rms: f32,
    pub p25: f32,
    pub p75: f32,
}

impl ChannelStats {
    /// Non-finite samples are ignored; an empty input yields all zeros.
    pub fn from_samples(data: &[f32]) -> Self {
        let mut sorted: Vec<f32> = data.iter().copied().filter(|v| v.is_finite()).collect();
        if sorted.is_empty() {
            return Self::default();
        }
        sorted.sort_by(f32::total_cmp);
        let mean = sorted.iter().copied().sum::<f32>() / sorted.len() as f32;
        let rms = (sorted.iter().map(|v| v * v).sum::<f32>() / sorted.len() as f32).sqrt();
        Self {
            mean,
            std_dev: std_dev(&sorted),
            median: percentile_sorted(&sorted, 50.0),
            min: sorted[0],
            max: sorted[sorted.len() - 1],
            rms,
            p25: percentile_sorted(&sorted, 25.0),
            p75: percentile_sorted(&sorted, 75.0),
        }
    }
}

pub fn std_dev(data: &[f32]) -> f32 {
    if data.is_empty() {
        return 0.0;
    }
    let mean = data.iter().copied().sum::<f32>() / data.len() as f32;
    let variance = data
        .iter()
        .map(|v| {
            let delta = v - mean;
            delta * delta
        })
        .sum::<f32>()
        / data.len() as f32;
    variance.sqrt()
}

/// Percentile `q` in `[0, 100]` with linear interpolation between closest ranks.
pub fn percentile(data: &[f32], q: f32) -> Option<f32> {
    let mut sorted: Vec<f32> = data.iter().copied().filter(|v| v.is_finite()).collect();
    if sorted.is_empty() {
        return None;
    }
    sorted.sort_by(f32::total_cmp);
    Some(percentile_sorted(&sorted, q))
}

/// `sorted` must be ascending and non-empty.
pub fn percentile_sorted(sorted: &[f32], q: f32) -> f32 {
    let rank = (q.clamp(0.0, 100.0) / 100.0) * (sorted.len() - 1) as f32;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    let frac = rank - lo as f32;
    sorted[lo] + (sorted[hi] - sorted[lo]) * frac
}
