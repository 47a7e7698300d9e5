use std::f32::consts::PI;
use std::sync::Arc;

use ndarray::{aview1, Array2};
use rustfft::{num_complex::Complex32, Fft, FftPlanner};
use serde::Serialize;

/// Added to power before taking logs so silent bins stay finite.
const DB_FLOOR: f32 = 1e-10;

fn to_db(power: f32) -> f32 {
    10.0 * (power + DB_FLOOR).log10()
}

/// One-sided power spectral density estimate.
#[derive(Clone, Debug, Serialize)]
pub struct PowerSpectrum {
    pub frequencies_hz: Vec<f32>,
    pub power: Vec<f32>,
}

impl PowerSpectrum {
    pub fn to_db(&self) -> Vec<f32> {
        self.power.iter().copied().map(to_db).collect()
    }

    /// Sum of power in `[low_hz, high_hz)` times the bin width.
    pub fn band_power(&self, low_hz: f32, high_hz: f32) -> f32 {
        let df = match self.frequencies_hz.get(1) {
            Some(f) => *f,
            None => return 0.0,
        };
        self.frequencies_hz
            .iter()
            .zip(&self.power)
            .filter(|(f, _)| **f >= low_hz && **f < high_hz)
            .map(|(_, p)| p * df)
            .sum()
    }

    /// Frequency of the strongest bin, skipping DC.
    pub fn peak_frequency(&self) -> Option<f32> {
        peak_bin(self.power.iter().copied()).map(|bin| self.frequencies_hz[bin])
    }
}

/// Power density over time, one row per Hann segment.
#[derive(Clone, Debug)]
pub struct Spectrogram {
    /// Segment centres in seconds.
    pub times_s: Vec<f64>,
    pub frequencies_hz: Vec<f32>,
    /// frames x bins
    pub power: Array2<f32>,
}

impl Spectrogram {
    fn empty() -> Self {
        Self {
            times_s: Vec::new(),
            frequencies_hz: Vec::new(),
            power: Array2::zeros((0, 0)),
        }
    }

    pub fn frames(&self) -> usize {
        self.power.nrows()
    }

    pub fn bins(&self) -> usize {
        self.power.ncols()
    }

    pub fn is_empty(&self) -> bool {
        self.power.is_empty()
    }

    pub fn to_db(&self) -> Array2<f32> {
        self.power.mapv(to_db)
    }

    /// Strongest non-DC frequency of `frame`.
    pub fn peak_frequency(&self, frame: usize) -> Option<f32> {
        if frame >= self.frames() {
            return None;
        }
        peak_bin(self.power.row(frame).iter().copied()).map(|bin| self.frequencies_hz[bin])
    }

    /// Moves every frame time by `seconds`.
    pub fn shifted(mut self, seconds: f64) -> Self {
        for t in &mut self.times_s {
            *t += seconds;
        }
        self
    }
}

fn peak_bin(power: impl Iterator<Item = f32>) -> Option<usize> {
    power
        .enumerate()
        .skip(1)
        .max_by(|a, b| a.1.total_cmp(&b.1))
        .map(|(bin, _)| bin)
}

/// Segment length used for `len` input samples.
pub fn welch_segment_len(len: usize) -> usize {
    (len / 4).clamp(64, 2048).min(len)
}

/// Density-scaled one-sided periodogram of mean-removed Hann segments.
struct Periodogram {
    taper: Vec<f32>,
    scale: f32,
    sample_rate: f32,
    fft: Arc<dyn Fft<f32>>,
}

impl Periodogram {
    fn new(nperseg: usize, sample_rate: f32) -> Self {
        let taper = hann(nperseg);
        let scale = 1.0 / (sample_rate * taper.iter().map(|w| w * w).sum::<f32>());
        let fft = FftPlanner::<f32>::new().plan_fft_forward(nperseg);
        Self {
            taper,
            scale,
            sample_rate,
            fft,
        }
    }

    fn len(&self) -> usize {
        self.taper.len()
    }

    fn bins(&self) -> usize {
        self.len() / 2 + 1
    }

    fn frequencies(&self) -> Vec<f32> {
        let n = self.len() as f32;
        (0..self.bins())
            .map(|k| k as f32 * self.sample_rate / n)
            .collect()
    }

    /// Starts of the 50%-overlapping segments in `len >= self.len()` samples.
    fn starts(&self, len: usize) -> impl Iterator<Item = usize> {
        let step = (self.len() / 2).max(1);
        (0..=len.saturating_sub(self.len())).step_by(step)
    }

    /// Adds the density of `segment` (exactly `len()` samples) into `out`.
    fn accumulate(&self, segment: &[f32], out: &mut [f32]) {
        let n = self.len();
        let mean = segment.iter().sum::<f32>() / n as f32;
        let mut buffer: Vec<Complex32> = segment
            .iter()
            .zip(&self.taper)
            .map(|(v, w)| Complex32::new((v - mean) * w, 0.0))
            .collect();
        self.fft.process(&mut buffer);
        for (bin, slot) in out.iter_mut().enumerate() {
            let mut p = buffer[bin].norm_sqr() * self.scale;
            let nyquist_bin = n % 2 == 0 && bin == n / 2;
            if bin != 0 && !nyquist_bin {
                p *= 2.0;
            }
            *slot += p;
        }
    }
}

/// Welch's method: Hann segments with 50% overlap, per-segment mean removed, averaged periodograms.
pub fn welch_psd(samples: &[f32], sample_rate: f32) -> PowerSpectrum {
    let nperseg = welch_segment_len(samples.len());
    if nperseg < 2 || sample_rate <= 0.0 {
        return PowerSpectrum {
            frequencies_hz: Vec::new(),
            power: Vec::new(),
        };
    }
    let periodogram = Periodogram::new(nperseg, sample_rate);
    let mut power = vec![0.0f32; periodogram.bins()];
    let mut segments = 0usize;
    for start in periodogram.starts(samples.len()) {
        periodogram.accumulate(&samples[start..start + nperseg], &mut power);
        segments += 1;
    }
    for p in &mut power {
        *p /= segments as f32;
    }
    PowerSpectrum {
        frequencies_hz: periodogram.frequencies(),
        power,
    }
}

/// Short-time spectrum with the same segmenting as [`welch_psd`], kept per segment.
///
/// Frame times are segment centres measured from the first sample.
pub fn spectrogram(samples: &[f32], sample_rate: f32) -> Spectrogram {
    let nperseg = welch_segment_len(samples.len());
    if nperseg < 2 || sample_rate <= 0.0 {
        return Spectrogram::empty();
    }
    let periodogram = Periodogram::new(nperseg, sample_rate);
    let starts: Vec<usize> = periodogram.starts(samples.len()).collect();
    let mut power = Array2::zeros((starts.len(), periodogram.bins()));
    let mut scratch = vec![0.0f32; periodogram.bins()];
    for (frame, &start) in starts.iter().enumerate() {
        scratch.fill(0.0);
        periodogram.accumulate(&samples[start..start + nperseg], &mut scratch);
        power.row_mut(frame).assign(&aview1(&scratch));
    }
    let centre = (nperseg / 2) as f64;
    Spectrogram {
        times_s: starts
            .iter()
            .map(|&start| (start as f64 + centre) / sample_rate as f64)
            .collect(),
        frequencies_hz: periodogram.frequencies(),
        power,
    }
}

/// Periodic Hann taper.
fn hann(len: usize) -> Vec<f32> {
    (0..len)
        .map(|i| 0.5 - 0.5 * (2.0 * PI * i as f32 / len as f32).cos())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tone(freq: f32, rate: f32, len: usize, amp: f32) -> Vec<f32> {
        (0..len)
            .map(|i| amp * (2.0 * PI * freq * i as f32 / rate).sin())
            .collect()
    }

    #[test]
    fn welch_peak_sits_at_alpha() {
        let samples = tone(10.0, 200.0, 4000, 1.0);
        let psd = welch_psd(&samples, 200.0);
        assert_eq!(welch_segment_len(4000), 1000);
        let peak = psd.peak_frequency().unwrap();
        assert!((peak - 10.0).abs() <= 0.2);
        // A unit sine carries 0.5 units of power.
        let total = psd.band_power(8.0, 12.0);
        assert!((total - 0.5).abs() < 0.05, "band power {total}");
        assert!(psd.band_power(30.0, 60.0) < 1e-3);
        let db = psd.to_db();
        assert!(db[50] > db[300] + 40.0);
    }

    #[test]
    fn short_input_uses_whole_signal() {
        assert_eq!(welch_segment_len(10), 10);
        assert!(welch_psd(&[1.0], 100.0).power.is_empty());
        assert!(spectrogram(&[1.0], 100.0).is_empty());
    }

    #[test]
    fn spectrogram_follows_a_frequency_step() {
        // 20 s of 10 Hz followed by 20 s of 40 Hz.
        let mut samples = tone(10.0, 200.0, 4000, 1.0);
        samples.extend(tone(40.0, 200.0, 4000, 1.0));
        let sg = spectrogram(&samples, 200.0);
        // 2000-sample segments stepping by 1000.
        assert_eq!(sg.frames(), 7);
        assert_eq!(sg.bins(), 1001);
        assert_eq!(sg.times_s.len(), 7);
        assert!((sg.times_s[0] - 5.0).abs() < 1e-9);
        assert!((sg.times_s[6] - 35.0).abs() < 1e-9);

        let early = sg.peak_frequency(0).unwrap();
        let late = sg.peak_frequency(6).unwrap();
        assert!((early - 10.0).abs() < 0.05, "early peak {early}");
        assert!((late - 40.0).abs() < 0.05, "late peak {late}");
        assert_eq!(sg.peak_frequency(7), None);

        let db = sg.to_db();
        assert!(db[[6, 400]] > db[[6, 100]] + 40.0);
        assert!(db[[0, 100]] > db[[0, 400]] + 40.0);
    }

    #[test]
    fn spectrogram_frames_match_welch_average() {
        let samples = tone(25.0, 200.0, 3000, 2.0);
        let sg = spectrogram(&samples, 200.0);
        let psd = welch_psd(&samples, 200.0);
        assert_eq!(sg.frequencies_hz, psd.frequencies_hz);
        for (bin, &p) in psd.power.iter().enumerate() {
            let mean = sg.power.column(bin).sum() / sg.frames() as f32;
            assert!((mean - p).abs() <= 1e-4 * p.max(1.0), "bin {bin}");
        }
    }
}
