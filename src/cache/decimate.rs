use std::f64::consts::PI;
use std::ops::Range;

use ndarray::{s, Array2, ArrayView2, Axis};

/// Windowed-sinc low-pass used before keeping every `ratio`-th parent row.
#[derive(Clone, Debug)]
pub struct DecimationKernel {
    ratio: u64,
    half: usize,
    taps: Vec<f32>,
}

impl DecimationKernel {
    /// Cutoff sits at 80% of the output Nyquist; Blackman window, unity DC gain.
    pub fn new(ratio: u64, taps_per_ratio: usize) -> Self {
        let ratio = ratio.max(2);
        let half = (taps_per_ratio * ratio as usize / 2).max(1);
        let len = 2 * half + 1;
        let cutoff = 0.8 * 0.5 / ratio as f64; // cycles per parent row
        let mut taps: Vec<f64> = (0..len)
            .map(|k| {
                let m = k as f64 - half as f64;
                let sinc = if m == 0.0 {
                    2.0 * cutoff
                } else {
                    (2.0 * PI * cutoff * m).sin() / (PI * m)
                };
                let phase = 2.0 * PI * k as f64 / (len - 1) as f64;
                let blackman = 0.42 - 0.5 * phase.cos() + 0.08 * (2.0 * phase).cos();
                sinc * blackman
            })
            .collect();
        let sum: f64 = taps.iter().sum();
        taps.iter_mut().for_each(|t| *t /= sum);
        Self {
            ratio,
            half,
            taps: taps.into_iter().map(|t| t as f32).collect(),
        }
    }

    pub fn ratio(&self) -> u64 {
        self.ratio
    }

    /// Parent rows read on either side of an output row's centre.
    pub fn half_width(&self) -> u64 {
        self.half as u64
    }

    /// Parent rows needed for output `buckets`, clipped to a parent of `parent_len` rows.
    pub fn support(&self, buckets: &Range<u64>, parent_len: u64) -> Range<u64> {
        let lo = (buckets.start * self.ratio).saturating_sub(self.half as u64);
        let hi = ((buckets.end.saturating_sub(1)) * self.ratio + self.half as u64 + 1).min(parent_len);
        lo..hi
    }

    /// Filters and subsamples `parent`, which holds parent rows starting at `parent_first`.
    ///
    /// Output row `j` is centred on parent row `j * ratio`; reads past either end of the
    /// parent tier repeat its edge row. The result only depends on the parent tier, never on
    /// how it was split into tiles.
    pub fn apply(
        &self,
        parent: ArrayView2<'_, f32>,
        parent_first: u64,
        parent_len: u64,
        buckets: Range<u64>,
    ) -> Array2<f32> {
        let rows = (buckets.end - buckets.start) as usize;
        let mut out = Array2::<f32>::zeros((rows, parent.ncols()));
        let last = parent_len.saturating_sub(1) as i64;
        for (row, bucket) in buckets.enumerate() {
            let centre = (bucket * self.ratio) as i64;
            let mut acc = out.row_mut(row);
            for (k, &tap) in self.taps.iter().enumerate() {
                let idx = (centre + k as i64 - self.half as i64).clamp(0, last) as u64;
                let local = (idx - parent_first) as usize;
                acc.scaled_add(tap, &parent.row(local));
            }
        }
        out
    }
}

/// Min/max envelope: two rows per output bucket, the bucket minimum then its maximum.
///
/// `parent` holds parent rows starting at `parent_first`, with `rows_per_bucket` rows per
/// parent bucket. Non-finite values are ignored when a finite value exists.
pub fn envelope(
    parent: ArrayView2<'_, f32>,
    parent_first: u64,
    rows_per_bucket: u64,
    parent_buckets: u64,
    ratio: u64,
    buckets: Range<u64>,
) -> Array2<f32> {
    let rows = (buckets.end - buckets.start) as usize;
    let mut out = Array2::<f32>::zeros((rows * 2, parent.ncols()));
    for (idx, bucket) in buckets.enumerate() {
        let first = bucket * ratio;
        let end = ((bucket + 1) * ratio).min(parent_buckets);
        let lo = (first * rows_per_bucket - parent_first) as usize;
        let hi = (end * rows_per_bucket - parent_first) as usize;
        let block = parent.slice(s![lo..hi, ..]);
        for (col, column) in block.axis_iter(Axis(1)).enumerate() {
            let (min, max) = column.iter().fold(
                (f32::INFINITY, f32::NEG_INFINITY),
                |(min, max), &v| (min.min(v), max.max(v)),
            );
            let (min, max) = if min <= max { (min, max) } else { (f32::NAN, f32::NAN) };
            out[[2 * idx, col]] = min;
            out[[2 * idx + 1, col]] = max;
        }
    }
    out
}
