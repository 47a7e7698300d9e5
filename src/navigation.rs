use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};
use crate::signal::TimeRange;

/// Visible span of the recording, in seconds.
///
/// Every mutation keeps the window inside `[0, duration]` and no narrower than `min_span`
/// (unless the recording itself is shorter).
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Viewport {
    start: f64,
    span: f64,
    duration: f64,
    min_span: f64,
}

impl Viewport {
    /// Opens on the first `initial_span` seconds.
    pub fn new(duration: f64, sample_rate: f64, min_view_samples: u64, initial_span: f64) -> Result<Self> {
        if !(sample_rate.is_finite() && sample_rate > 0.0) {
            return Err(EngineError::InvalidSampleRate);
        }
        if !(duration.is_finite() && duration >= 0.0) {
            return Err(EngineError::InvalidRange {
                start: 0.0,
                end: duration,
            });
        }
        let min_span = (min_view_samples.max(1) as f64 / sample_rate).min(duration);
        let mut viewport = Self {
            start: 0.0,
            span: duration,
            duration,
            min_span,
        };
        viewport.span = viewport.clamp_span(initial_span);
        Ok(viewport)
    }

    pub fn start(&self) -> f64 {
        self.start
    }

    pub fn end(&self) -> f64 {
        self.start + self.span
    }

    pub fn span(&self) -> f64 {
        self.span
    }

    pub fn duration(&self) -> f64 {
        self.duration
    }

    pub fn min_span(&self) -> f64 {
        self.min_span
    }

    pub fn range(&self) -> TimeRange {
        TimeRange::new(self.start, self.end())
    }

    fn clamp_span(&self, span: f64) -> f64 {
        if !span.is_finite() {
            return self.duration;
        }
        span.clamp(self.min_span, self.duration)
    }

    fn place(&mut self, start: f64) {
        let latest = (self.duration - self.span).max(0.0);
        self.start = if start.is_finite() {
            start.clamp(0.0, latest)
        } else {
            0.0
        };
    }

    /// Shows `[start, end)`, widening about its centre when narrower than the minimum.
    pub fn set(&mut self, start: f64, end: f64) -> Result<()> {
        TimeRange::new(start, end).validate()?;
        let span = self.clamp_span(end - start);
        let centre = (start + end) / 2.0;
        self.span = span;
        self.place(centre - span / 2.0);
        Ok(())
    }

    /// Moves by `fraction` of the current span; negative goes backward.
    pub fn pan(&mut self, fraction: f64) {
        self.place(self.start + fraction * self.span);
    }

    pub fn step_forward(&mut self) {
        self.pan(1.0);
    }

    pub fn step_back(&mut self) {
        self.pan(-1.0);
    }

    pub fn half_step_forward(&mut self) {
        self.pan(0.5);
    }

    pub fn half_step_back(&mut self) {
        self.pan(-0.5);
    }

    /// Multiplies the span by `factor` keeping the centre fixed; `factor < 1` zooms in.
    pub fn zoom(&mut self, factor: f64) {
        if !(factor.is_finite() && factor > 0.0) {
            return;
        }
        let centre = self.start + self.span / 2.0;
        self.span = self.clamp_span(self.span * factor);
        self.place(centre - self.span / 2.0);
    }

    pub fn zoom_in(&mut self) {
        self.zoom(0.5);
    }

    pub fn zoom_out(&mut self) {
        self.zoom(2.0);
    }

    pub fn zoom_to_full(&mut self) {
        self.span = self.duration;
        self.start = 0.0;
    }

    pub fn go_to_start(&mut self) {
        self.place(0.0);
    }

    pub fn go_to_end(&mut self) {
        self.place(self.duration);
    }

    /// Recentres on `t` keeping the span, as an overview click does.
    pub fn center_on(&mut self, t: f64) {
        self.place(t - self.span / 2.0);
    }
}
