use crate::cache::RangeClipped;
use crate::signal::window::{Reduction, TimeRange};

/// One channel, ready to draw: `values` already include the slot offset.
#[derive(Clone, Debug, PartialEq)]
pub struct ChannelTrace {
    pub channel: usize,
    pub label: String,
    pub slot: usize,
    pub y_offset: f32,
    pub scale: f32,
    pub bad: bool,
    pub values: Vec<f32>,
}

impl ChannelTrace {
    /// `(min, max)` of the drawn values, ignoring non-finite ones.
    pub fn extent(&self) -> Option<(f32, f32)> {
        self.values
            .iter()
            .copied()
            .filter(|v| v.is_finite())
            .fold(None, |acc, v| match acc {
                None => Some((v, v)),
                Some((lo, hi)) => Some((lo.min(v), hi.max(v))),
            })
    }
}

/// Plot-ready coordinates for the visible window.
#[derive(Clone, Debug)]
pub struct RenderLayout {
    pub range: TimeRange,
    /// X coordinate (seconds) shared by every trace.
    pub times: Vec<f64>,
    pub traces: Vec<ChannelTrace>,
    pub spacing: f32,
    pub factor: u64,
    pub reduction: Reduction,
    pub clipped: Option<RangeClipped>,
    /// A coarser tier stood in while the requested one builds.
    pub provisional: bool,
    /// Served from previously cached tiles after the request itself failed.
    pub stale: bool,
}

impl RenderLayout {
    pub fn is_empty(&self) -> bool {
        self.traces.is_empty() || self.times.is_empty()
    }

    pub fn trace(&self, channel: usize) -> Option<&ChannelTrace> {
        self.traces.iter().find(|t| t.channel == channel)
    }

    /// Vertical extent needed to show every trace, padded by half a slot.
    pub fn y_bounds(&self) -> (f32, f32) {
        let (lo, hi) = self
            .traces
            .iter()
            .filter_map(ChannelTrace::extent)
            .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), (a, b)| {
                (lo.min(a), hi.max(b))
            });
        if lo > hi {
            return (-1.0, 1.0);
        }
        let pad = (self.spacing * 0.5).max(f32::EPSILON);
        (lo - pad, hi + pad)
    }

    pub fn point_count(&self) -> usize {
        self.traces.iter().map(|t| t.values.len()).sum()
    }
}
