use serde::Serialize;

use crate::error::{EngineError, Result};

#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct TriggerEvent {
    pub sample_index: u64,
    pub time_seconds: f64,
}

/// Rising-edge detector with a refractory period that carries across calls.
///
/// Acceptance is greedy earliest-wins: once an edge is accepted, every edge within
/// `refractory_secs` after it is dropped. State only clears on [`TriggerDetector::reset`].
#[derive(Clone, Debug)]
pub struct TriggerDetector {
    threshold: f32,
    refractory_secs: f64,
    last_accepted: f64,
}

/// Slack for floating-point time arithmetic when comparing against the refractory period.
const TIME_EPSILON: f64 = 1e-9;

impl TriggerDetector {
    pub fn new(threshold: f32, refractory_secs: f64) -> Self {
        Self {
            threshold,
            refractory_secs: refractory_secs.max(0.0),
            last_accepted: f64::NEG_INFINITY,
        }
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    pub fn refractory_secs(&self) -> f64 {
        self.refractory_secs
    }

    pub fn last_accepted(&self) -> Option<f64> {
        self.last_accepted.is_finite().then_some(self.last_accepted)
    }

    pub fn reset(&mut self) {
        self.last_accepted = f64::NEG_INFINITY;
    }

    /// Scans `samples`, the first of which sits at `time_offset` seconds.
    ///
    /// A sample at exactly the threshold counts as above it. The first sample has no
    /// predecessor and is never an edge, so chunked callers overlap chunks by one sample.
    pub fn detect(
        &mut self,
        samples: &[f32],
        sample_rate: f64,
        time_offset: f64,
    ) -> Result<Vec<TriggerEvent>> {
        if !(sample_rate.is_finite() && sample_rate > 0.0) {
            return Err(EngineError::InvalidSampleRate);
        }
        let first_index = (time_offset * sample_rate).round().max(0.0) as u64;
        let mut events = Vec::new();
        let mut previous_above = match samples.first() {
            Some(&v) => v >= self.threshold,
            None => return Ok(events),
        };
        for (i, &value) in samples.iter().enumerate().skip(1) {
            // NaN compares false, so gaps read as below threshold.
            let above = value >= self.threshold;
            if above && !previous_above {
                let time = time_offset + i as f64 / sample_rate;
                if time - self.last_accepted + TIME_EPSILON >= self.refractory_secs {
                    self.last_accepted = time;
                    events.push(TriggerEvent {
                        sample_index: first_index + i as u64,
                        time_seconds: time,
                    });
                }
            }
            previous_above = above;
        }
        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signal::synthetic::pulse_train;

    #[test]
    fn pulse_train_every_thirty_seconds() {
        let rate = 200.0;
        let samples = pulse_train(rate, 300 * 200, 10.0, 30.0, 0.1, 2.0);
        let mut detector = TriggerDetector::new(1.0, 21.0);
        let events = detector.detect(&samples, rate, 0.0).unwrap();
        assert_eq!(events.len(), 10);
        for (k, event) in events.iter().enumerate() {
            let expected = 10.0 + 30.0 * k as f64;
            assert!((event.time_seconds - expected).abs() <= 1.0 / rate);
            assert_eq!(event.sample_index, (expected * rate) as u64);
        }
    }

    #[test]
    fn rerun_after_reset_is_identical() {
        let samples = pulse_train(200.0, 60_000, 10.0, 30.0, 0.1, 2.0);
        let mut detector = TriggerDetector::new(1.0, 21.0);
        let first = detector.detect(&samples, 200.0, 0.0).unwrap();
        detector.reset();
        let second = detector.detect(&samples, 200.0, 0.0).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn refractory_carries_across_calls() {
        let mut detector = TriggerDetector::new(0.5, 2.0);
        let chunk = [0.0, 1.0, 0.0, 0.0];
        let a = detector.detect(&chunk, 1.0, 0.0).unwrap();
        assert_eq!(a.len(), 1);
        // Edge at t = 4.0 + 1 = 5.0 is far enough; an edge at 1.0 + 1 = 2.0 would not be.
        assert!(detector.detect(&chunk, 1.0, 1.0).unwrap().is_empty());
        let b = detector.detect(&chunk, 1.0, 4.0).unwrap();
        assert_eq!(b[0].time_seconds, 5.0);
        assert_eq!(b[0].sample_index, 5);
    }

    #[test]
    fn earliest_edge_wins_inside_the_refractory_window() {
        // Edges at 0.5 s, 2.0 s and 3.0 s with a 2 s refractory. 2.0 is dropped, and 3.0
        // is measured against 0.5 rather than the dropped edge, so it is kept.
        let samples = [0.0, 1.0, 0.0, 0.0, 1.0, 0.0, 1.0];
        let mut detector = TriggerDetector::new(1.0, 2.0);
        let events = detector.detect(&samples, 2.0, 0.0).unwrap();
        let times: Vec<f64> = events.iter().map(|e| e.time_seconds).collect();
        assert_eq!(times, vec![0.5, 3.0]);
    }

    #[test]
    fn edge_cases() {
        let mut detector = TriggerDetector::new(1.0, 0.0);
        assert!(detector.detect(&[], 100.0, 0.0).unwrap().is_empty());
        // Starting above threshold is not an edge; equality counts as above.
        let events = detector.detect(&[2.0, 0.0, 1.0, f32::NAN, 1.0], 1.0, 0.0).unwrap();
        let idx: Vec<u64> = events.iter().map(|e| e.sample_index).collect();
        assert_eq!(idx, vec![2, 4]);
        assert_eq!(
            detector.detect(&[0.0], 0.0, 0.0).unwrap_err(),
            EngineError::InvalidSampleRate
        );
    }
}
