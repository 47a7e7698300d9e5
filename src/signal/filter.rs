use std::f32::consts::PI;

use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub enum FilterKind {
    Notch { freq_hz: f32, q: f32 },
    Highpass { cutoff_hz: f32, q: f32 },
    Lowpass { cutoff_hz: f32, q: f32 },
    Bandpass { low_hz: f32, high_hz: f32, q: f32 },
    Bandstop { low_hz: f32, high_hz: f32, q: f32 },
}

impl FilterKind {
    pub fn describe(&self) -> String {
        match *self {
            FilterKind::Notch { freq_hz, q } => format!("notch(freq={freq_hz}, q={q})"),
            FilterKind::Highpass { cutoff_hz, q } => format!("highpass(cutoff={cutoff_hz}, q={q})"),
            FilterKind::Lowpass { cutoff_hz, q } => format!("lowpass(cutoff={cutoff_hz}, q={q})"),
            FilterKind::Bandpass { low_hz, high_hz, q } => {
                format!("bandpass(low={low_hz}, high={high_hz}, q={q})")
            }
            FilterKind::Bandstop { low_hz, high_hz, q } => {
                format!("bandstop(low={low_hz}, high={high_hz}, q={q})")
            }
        }
    }
}

#[derive(Clone, Copy, Debug)]
struct BiquadCoeffs {
    b0: f32,
    b1: f32,
    b2: f32,
    a1: f32,
    a2: f32,
}

#[derive(Clone, Copy, Debug, Default)]
struct BiquadState {
    z1: f32,
    z2: f32,
}

#[derive(Clone, Copy, Debug)]
struct BiquadFilter {
    coeffs: BiquadCoeffs,
    state: BiquadState,
}

impl BiquadFilter {
    fn new(coeffs: BiquadCoeffs) -> Self {
        Self {
            coeffs,
            state: BiquadState::default(),
        }
    }

    fn process(&mut self, input: f32) -> f32 {
        // Transposed direct form II
        let y = self.coeffs.b0 * input + self.state.z1;
        self.state.z1 = self.coeffs.b1 * input - self.coeffs.a1 * y + self.state.z2;
        self.state.z2 = self.coeffs.b2 * input - self.coeffs.a2 * y;
        y
    }

    /// Primes the delay line as if `value` had been fed forever.
    fn settle(&mut self, value: f32) {
        let c = self.coeffs;
        let denom = 1.0 + c.a1 + c.a2;
        let y = if denom.abs() > f32::EPSILON {
            value * (c.b0 + c.b1 + c.b2) / denom
        } else {
            0.0
        };
        self.state.z2 = c.b2 * value - c.a2 * y;
        self.state.z1 = c.b1 * value - c.a1 * y + self.state.z2;
    }
}

#[derive(Clone, Default, Debug)]
pub struct FilterChain {
    sections: Vec<BiquadFilter>,
}

impl FilterChain {
    pub fn from_kinds(sample_rate_hz: f32, kinds: &[FilterKind]) -> Self {
        let mut sections = Vec::new();
        for kind in kinds {
            sections.extend(design_sections(sample_rate_hz, *kind));
        }
        Self { sections }
    }

    pub fn is_empty(&self) -> bool {
        self.sections.is_empty()
    }

    pub fn reset(&mut self) {
        for section in &mut self.sections {
            section.state = BiquadState::default();
        }
    }

    pub fn process_sample(&mut self, mut value: f32) -> f32 {
        for section in &mut self.sections {
            value = section.process(value);
        }
        value
    }

    /// Runs the chain forward then backward over `samples`, cancelling the phase shift.
    pub fn filtfilt(&mut self, samples: &[f32]) -> Vec<f32> {
        if samples.is_empty() || self.is_empty() {
            return samples.to_vec();
        }
        self.prime(samples[0]);
        let mut forward: Vec<f32> = samples.iter().map(|&v| self.process_sample(v)).collect();
        forward.reverse();
        self.prime(forward[0]);
        let mut backward: Vec<f32> = forward.iter().map(|&v| self.process_sample(v)).collect();
        backward.reverse();
        backward
    }

    fn prime(&mut self, first: f32) {
        let mut value = first;
        for section in &mut self.sections {
            section.settle(value);
            let c = section.coeffs;
            let denom = 1.0 + c.a1 + c.a2;
            value = if denom.abs() > f32::EPSILON {
                value * (c.b0 + c.b1 + c.b2) / denom
            } else {
                0.0
            };
        }
    }
}

fn design_sections(sample_rate_hz: f32, kind: FilterKind) -> Vec<BiquadFilter> {
    let nyquist = sample_rate_hz * 0.5;
    match kind {
        FilterKind::Notch { freq_hz, q } => {
            let coeffs = notch(nyquist_clamp(freq_hz, nyquist), sample_rate_hz, q);
            vec![BiquadFilter::new(coeffs)]
        }
        FilterKind::Highpass { cutoff_hz, q } => {
            let coeffs = highpass(nyquist_clamp(cutoff_hz, nyquist), sample_rate_hz, q);
            vec![BiquadFilter::new(coeffs)]
        }
        FilterKind::Lowpass { cutoff_hz, q } => {
            let coeffs = lowpass(nyquist_clamp(cutoff_hz, nyquist), sample_rate_hz, q);
            vec![BiquadFilter::new(coeffs)]
        }
        FilterKind::Bandpass { low_hz, high_hz, q } => {
            let (low, high) = band_edges(low_hz, high_hz, nyquist);
            let center = (low * high).sqrt();
            let q_val = q.clamp(0.1, 100.0).min(center / (high - low).max(f32::EPSILON));
            let coeffs = bandpass(center, sample_rate_hz, q_val);
            vec![BiquadFilter::new(coeffs)]
        }
        FilterKind::Bandstop { low_hz, high_hz, q } => {
            let (low, high) = band_edges(low_hz, high_hz, nyquist);
            let center = (low * high).sqrt();
            let q_val = q.clamp(0.1, 100.0).min(center / (high - low).max(f32::EPSILON));
            let coeffs = notch(center, sample_rate_hz, q_val);
            vec![BiquadFilter::new(coeffs)]
        }
    }
}

fn nyquist_clamp(freq_hz: f32, nyquist: f32) -> f32 {
    freq_hz.clamp(0.01, (nyquist - 0.01).max(0.01))
}

fn band_edges(low_hz: f32, high_hz: f32, nyquist: f32) -> (f32, f32) {
    let low = nyquist_clamp(low_hz.min(high_hz), nyquist);
    let high = nyquist_clamp(low_hz.max(high_hz), nyquist);
    (low, high)
}

fn lowpass(freq_hz: f32, sample_rate_hz: f32, q: f32) -> BiquadCoeffs {
    let w0 = 2.0 * PI * freq_hz / sample_rate_hz;
    let alpha = w0.sin() / (2.0 * q);
    let cos_w0 = w0.cos();
    let b0 = (1.0 - cos_w0) * 0.5;
    let b1 = 1.0 - cos_w0;
    let b2 = b0;
    let a0 = 1.0 + alpha;
    let a1 = -2.0 * cos_w0;
    let a2 = 1.0 - alpha;
    normalize(b0, b1, b2, a0, a1, a2)
}

fn highpass(freq_hz: f32, sample_rate_hz: f32, q: f32) -> BiquadCoeffs {
    let w0 = 2.0 * PI * freq_hz / sample_rate_hz;
    let alpha = w0.sin() / (2.0 * q);
    let cos_w0 = w0.cos();
    let b0 = (1.0 + cos_w0) * 0.5;
    let b1 = -(1.0 + cos_w0);
    let b2 = b0;
    let a0 = 1.0 + alpha;
    let a1 = -2.0 * cos_w0;
    let a2 = 1.0 - alpha;
    normalize(b0, b1, b2, a0, a1, a2)
}

fn bandpass(center_hz: f32, sample_rate_hz: f32, q: f32) -> BiquadCoeffs {
    let w0 = 2.0 * PI * center_hz / sample_rate_hz;
    let alpha = w0.sin() / (2.0 * q);
    let cos_w0 = w0.cos();
    let b0 = alpha;
    let b1 = 0.0;
    let b2 = -alpha;
    let a0 = 1.0 + alpha;
    let a1 = -2.0 * cos_w0;
    let a2 = 1.0 - alpha;
    normalize(b0, b1, b2, a0, a1, a2)
}

fn notch(center_hz: f32, sample_rate_hz: f32, q: f32) -> BiquadCoeffs {
    let w0 = 2.0 * PI * center_hz / sample_rate_hz;
    let alpha = w0.sin() / (2.0 * q);
    let cos_w0 = w0.cos();
    let b0 = 1.0;
    let b1 = -2.0 * cos_w0;
    let b2 = 1.0;
    let a0 = 1.0 + alpha;
    let a1 = -2.0 * cos_w0;
    let a2 = 1.0 - alpha;
    normalize(b0, b1, b2, a0, a1, a2)
}

fn normalize(b0: f32, b1: f32, b2: f32, a0: f32, a1: f32, a2: f32) -> BiquadCoeffs {
    let a0_inv = 1.0 / a0;
    BiquadCoeffs {
        b0: b0 * a0_inv,
        b1: b1 * a0_inv,
        b2: b2 * a0_inv,
        a1: a1 * a0_inv,
        a2: a2 * a0_inv,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sine(freq_hz: f32, rate: f32, len: usize) -> Vec<f32> {
        (0..len)
            .map(|i| (2.0 * PI * freq_hz * i as f32 / rate).sin())
            .collect()
    }

    fn rms(values: &[f32]) -> f32 {
        (values.iter().map(|v| v * v).sum::<f32>() / values.len() as f32).sqrt()
    }

    #[test]
    fn notch_removes_line_noise() {
        let mut chain = FilterChain::from_kinds(
            200.0,
            &[FilterKind::Notch {
                freq_hz: 50.0,
                q: 30.0,
            }],
        );
        let out = chain.filtfilt(&sine(50.0, 200.0, 4000));
        assert!(rms(&out[500..3500]) < 0.05);
    }

    #[test]
    fn lowpass_keeps_slow_content_in_phase() {
        let input = sine(2.0, 200.0, 2000);
        let mut chain = FilterChain::from_kinds(
            200.0,
            &[FilterKind::Lowpass {
                cutoff_hz: 30.0,
                q: 0.707,
            }],
        );
        let out = chain.filtfilt(&input);
        // One full cycle well away from the edges.
        let cycle = 1000..1100;
        let peak_in = cycle.clone().max_by(|&a, &b| input[a].total_cmp(&input[b])).unwrap();
        let peak_out = cycle.max_by(|&a, &b| out[a].total_cmp(&out[b])).unwrap();
        assert!(peak_in.abs_diff(peak_out) <= 1);
        assert!((rms(&out) - rms(&input)).abs() < 0.02);
    }

    #[test]
    fn empty_chain_passes_through() {
        let mut chain = FilterChain::from_kinds(100.0, &[]);
        assert!(chain.is_empty());
        assert_eq!(chain.filtfilt(&[1.0, 2.0]), vec![1.0, 2.0]);
    }
}
