//! Deterministic EEG-like test recordings.

use std::f32::consts::PI;

use ndarray::Array2;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::error::Result;
use crate::signal::source::ArraySource;

pub const TRIGGER_CHANNEL: usize = 67;
pub const FLAT_CHANNEL: usize = 50;
pub const NOISY_CHANNEL: usize = 51;

pub fn sine_wave(freq_hz: f32, amplitude: f32, sample_rate: f64, len: usize) -> Vec<f32> {
    (0..len)
        .map(|i| amplitude * (2.0 * PI * freq_hz * (i as f64 / sample_rate) as f32).sin())
        .collect()
}

/// Rectangular pulses of `width_secs` every `period_secs`, the first at `first_secs`.
///
/// A pulse that would run past the end of the signal is dropped entirely.
pub fn pulse_train(
    sample_rate: f64,
    len: usize,
    first_secs: f64,
    period_secs: f64,
    width_secs: f64,
    amplitude: f32,
) -> Vec<f32> {
    let mut out = vec![0.0; len];
    if period_secs <= 0.0 {
        return out;
    }
    let duration = len as f64 / sample_rate;
    let mut t = first_secs;
    while t < duration {
        let start = (t * sample_rate).round() as usize;
        let end = ((t + width_secs) * sample_rate).round() as usize;
        if end < len {
            out[start..end].iter_mut().for_each(|v| *v = amplitude);
        }
        t += period_secs;
    }
    out
}

/// Zero-mean gaussian noise (Box-Muller over the seeded generator).
pub fn gaussian_noise(rng: &mut StdRng, std_dev: f32, len: usize) -> Vec<f32> {
    (0..len)
        .map(|_| {
            let u1: f32 = rng.gen_range(f32::EPSILON..1.0);
            let u2: f32 = rng.gen();
            std_dev * (-2.0 * u1.ln()).sqrt() * (2.0 * PI * u2).cos()
        })
        .collect()
}

/// Builder for the reference montage: band-limited oscillations, a flat channel,
/// a noisy channel, line noise, spikes and a trigger channel.
#[derive(Clone, Debug)]
pub struct SyntheticMontage {
    pub duration_seconds: f64,
    pub sample_rate: f64,
    pub channels: usize,
    pub seed: u64,
}

impl Default for SyntheticMontage {
    fn default() -> Self {
        Self {
            duration_seconds: 300.0,
            sample_rate: 200.0,
            channels: 72,
            seed: 7,
        }
    }
}

impl SyntheticMontage {
    pub fn build(&self) -> Result<ArraySource> {
        let len = (self.duration_seconds * self.sample_rate) as usize;
        let mut rng = StdRng::seed_from_u64(self.seed);
        let mut data = Array2::<f32>::zeros((len, self.channels));
        let mut labels = Vec::with_capacity(self.channels);
        for ch in 0..self.channels {
            let (label, signal) = self.channel(ch, len, &mut rng);
            for (slot, v) in data.column_mut(ch).iter_mut().zip(signal) {
                *slot = v;
            }
            labels.push(label);
        }
        log::debug!(
            "synthetic montage: {} channels x {} samples at {} Hz",
            self.channels,
            len,
            self.sample_rate
        );
        ArraySource::with_labels(self.sample_rate, data, labels)
    }

    fn channel(&self, ch: usize, len: usize, rng: &mut StdRng) -> (String, Vec<f32>) {
        let rate = self.sample_rate;
        let offset = |c: usize, base: usize| (c - base) as f32;
        let (label, mut signal, noise) = match ch {
            TRIGGER_CHANNEL => {
                let pulses = pulse_train(rate, len, 10.0, 30.0, 0.1, 2.0);
                return ("TRIG".to_string(), pulses);
            }
            0..=9 => (
                format!("Alpha {ch}"),
                sine_wave(10.0 + ch as f32 * 0.5, 50.0 + ch as f32 * 10.0, rate, len),
                5.0,
            ),
            10..=19 => (
                format!("Beta {ch}"),
                sine_wave(
                    15.0 + offset(ch, 10) * 1.5,
                    30.0 + offset(ch, 10) * 5.0,
                    rate,
                    len,
                ),
                8.0,
            ),
            20..=29 => (
                format!("Theta {ch}"),
                sine_wave(
                    5.0 + offset(ch, 20) * 0.3,
                    60.0 + offset(ch, 20) * 8.0,
                    rate,
                    len,
                ),
                10.0,
            ),
            30..=39 => (
                format!("Delta {ch}"),
                sine_wave(
                    2.0 + offset(ch, 30) * 0.2,
                    80.0 + offset(ch, 30) * 10.0,
                    rate,
                    len,
                ),
                15.0,
            ),
            FLAT_CHANNEL => return (format!("Flat {ch}"), vec![0.0; len]),
            NOISY_CHANNEL => return (format!("Noisy {ch}"), gaussian_noise(rng, 500.0, len)),
            52 => {
                let base = sine_wave(8.0, 40.0, rate, len);
                let mains = sine_wave(60.0, 100.0, rate, len);
                let mixed = base.iter().zip(&mains).map(|(a, b)| a + b).collect();
                return (format!("Line {ch}"), mixed);
            }
            53 => {
                let mut base = sine_wave(10.0, 50.0, rate, len);
                for _ in 0..100 {
                    let at = rng.gen_range(0..len.max(1));
                    if at + 10 < len {
                        base[at..at + 10].iter_mut().for_each(|v| *v += 500.0);
                    }
                }
                return (format!("Spikes {ch}"), base);
            }
            _ => {
                let f1 = 5.0 + (ch % 10) as f32 * 0.8;
                let f2 = 12.0 + (ch % 8) as f32 * 1.2;
                let amp = 40.0 + (ch % 15) as f32 * 5.0;
                let a = sine_wave(f1, amp, rate, len);
                let b = sine_wave(f2, amp * 0.5, rate, len);
                let mixed = a.iter().zip(&b).map(|(x, y)| x + y).collect();
                (format!("Mixed {ch}"), mixed, 8.0)
            }
        };
        for (v, n) in signal.iter_mut().zip(gaussian_noise(rng, noise, len)) {
            *v += n;
        }
        (label, signal)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signal::source::SampleSource;

    #[test]
    fn pulse_train_marks_expected_samples() {
        let pulses = pulse_train(200.0, 60_000, 10.0, 30.0, 0.1, 2.0);
        let rising: Vec<usize> = (1..pulses.len())
            .filter(|&i| pulses[i] > 0.0 && pulses[i - 1] == 0.0)
            .collect();
        assert_eq!(rising.len(), 10);
        assert_eq!(rising[0], 2000);
        assert_eq!(rising[9], 56_000);
        assert_eq!(pulses.iter().filter(|&&v| v > 0.0).count(), 10 * 20);
    }

    #[test]
    fn montage_is_reproducible() {
        let montage = SyntheticMontage {
            duration_seconds: 2.0,
            ..SyntheticMontage::default()
        };
        let a = montage.build().unwrap();
        let b = montage.build().unwrap();
        assert_eq!(a.data(), b.data());
        assert_eq!(a.channel_count(), 72);
        assert_eq!(a.channel_labels()[TRIGGER_CHANNEL], "TRIG");
        assert!(a.data().column(FLAT_CHANNEL).iter().all(|&v| v == 0.0));
    }
}
