use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};
use crate::render::layout::{ChannelTrace, RenderLayout};
use crate::signal::window::{Reduction, SampleWindow};

/// Headroom applied on top of the largest scaled peak-to-peak excursion.
///
/// Traces are centred on their mean, so neighbours are only guaranteed not to cross when
/// each signal is roughly symmetric about its mean. A channel that sits near one rail with
/// rare excursions to the other can reach well past half the spacing and overlap.
pub const SPACING_HEADROOM: f32 = 1.2;
/// Spacing used when nothing eligible has any excursion (all flat or all bad).
pub const FALLBACK_SPACING: f32 = 1.0;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChannelState {
    pub label: String,
    /// Per-channel override of the base scale.
    pub scale: Option<f32>,
    pub visible: bool,
    pub bad: bool,
}

impl ChannelState {
    fn new(label: String) -> Self {
        Self {
            label,
            scale: None,
            visible: true,
            bad: false,
        }
    }
}

/// Identity of the window a cached spacing was computed on.
#[derive(Clone, Debug, PartialEq)]
struct SpacingKey {
    first_bucket: u64,
    end_sample: u64,
    factor: u64,
    reduction: Reduction,
    channels: Vec<usize>,
}

impl SpacingKey {
    fn of(window: &SampleWindow) -> Self {
        Self {
            first_bucket: window.first_bucket(),
            end_sample: window.end_sample(),
            factor: window.factor(),
            reduction: window.reduction(),
            channels: window.channels().to_vec(),
        }
    }
}

/// Per-channel display parameters plus the derived channel spacing.
///
/// Slots go to channels that are both selected and visible, in selection order. Bad
/// channels keep their slot but never contribute to the spacing.
#[derive(Clone, Debug)]
pub struct RenderState {
    channels: Vec<ChannelState>,
    base_scale: f32,
    selection: Vec<usize>,
    dirty: bool,
    spacing: Option<(SpacingKey, f32)>,
    recomputations: u64,
}

impl RenderState {
    pub fn new(labels: Vec<String>, base_scale: f32) -> Result<Self> {
        check_scale(base_scale)?;
        let channels: Vec<ChannelState> = labels.into_iter().map(ChannelState::new).collect();
        let selection = (0..channels.len()).collect();
        Ok(Self {
            channels,
            base_scale,
            selection,
            dirty: true,
            spacing: None,
            recomputations: 0,
        })
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    pub fn channel(&self, channel: usize) -> Option<&ChannelState> {
        self.channels.get(channel)
    }

    pub fn channels(&self) -> &[ChannelState] {
        &self.channels
    }

    fn channel_mut(&mut self, channel: usize) -> Result<&mut ChannelState> {
        self.channels
            .get_mut(channel)
            .ok_or(EngineError::UnknownChannel(channel))
    }

    pub fn base_scale(&self) -> f32 {
        self.base_scale
    }

    pub fn set_base_scale(&mut self, scale: f32) -> Result<()> {
        check_scale(scale)?;
        if scale != self.base_scale {
            self.base_scale = scale;
            self.dirty = true;
        }
        Ok(())
    }

    pub fn set_channel_scale(&mut self, channel: usize, scale: f32) -> Result<()> {
        check_scale(scale)?;
        let state = self.channel_mut(channel)?;
        if state.scale != Some(scale) {
            state.scale = Some(scale);
            self.dirty = true;
        }
        Ok(())
    }

    /// Falls back to the base scale again.
    pub fn clear_channel_scale(&mut self, channel: usize) -> Result<()> {
        let state = self.channel_mut(channel)?;
        if state.scale.take().is_some() {
            self.dirty = true;
        }
        Ok(())
    }

    pub fn effective_scale(&self, channel: usize) -> Option<f32> {
        self.channels
            .get(channel)
            .map(|state| state.scale.unwrap_or(self.base_scale))
    }

    pub fn set_bad(&mut self, channel: usize, bad: bool) -> Result<()> {
        let state = self.channel_mut(channel)?;
        if state.bad != bad {
            state.bad = bad;
            self.dirty = true;
        }
        Ok(())
    }

    pub fn is_bad(&self, channel: usize) -> bool {
        self.channels.get(channel).is_some_and(|state| state.bad)
    }

    pub fn bad_channels(&self) -> Vec<usize> {
        (0..self.channels.len()).filter(|&c| self.is_bad(c)).collect()
    }

    pub fn set_visible(&mut self, channel: usize, visible: bool) -> Result<()> {
        let state = self.channel_mut(channel)?;
        if state.visible != visible {
            state.visible = visible;
            self.dirty = true;
        }
        Ok(())
    }

    /// Replaces the selection; duplicates keep their first position.
    pub fn select(&mut self, channels: &[usize]) -> Result<()> {
        if let Some(&bad) = channels.iter().find(|&&c| c >= self.channels.len()) {
            return Err(EngineError::UnknownChannel(bad));
        }
        let mut selection = Vec::with_capacity(channels.len());
        for &channel in channels {
            if !selection.contains(&channel) {
                selection.push(channel);
            }
        }
        if selection != self.selection {
            self.selection = selection;
            self.dirty = true;
        }
        Ok(())
    }

    pub fn selection(&self) -> &[usize] {
        &self.selection
    }

    /// Channels that get a vertical slot, in slot order.
    pub fn slots(&self) -> Vec<usize> {
        self.selection
            .iter()
            .copied()
            .filter(|&c| self.channels[c].visible)
            .collect()
    }

    /// Forces the next layout to recompute the spacing (e.g. the processing changed).
    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn spacing_recomputations(&self) -> u64 {
        self.recomputations
    }

    pub fn current_spacing(&self) -> Option<f32> {
        self.spacing.as_ref().map(|(_, spacing)| *spacing)
    }

    /// Spacing for `window`, reused while neither the window nor any display parameter changed.
    pub fn spacing_for(&mut self, window: &SampleWindow) -> Result<f32> {
        let key = SpacingKey::of(window);
        if !self.dirty {
            if let Some((cached_key, spacing)) = &self.spacing {
                if *cached_key == key {
                    return Ok(*spacing);
                }
            }
        }
        let mut widest = 0.0f32;
        for channel in self.slots() {
            if self.channels[channel].bad {
                continue;
            }
            let summary = window
                .summary(channel)
                .ok_or(EngineError::UnknownChannel(channel))?;
            let scale = self.effective_scale(channel).unwrap_or(self.base_scale);
            widest = widest.max(summary.peak_to_peak() * scale);
        }
        let spacing = if widest > 0.0 && widest.is_finite() {
            SPACING_HEADROOM * widest
        } else {
            FALLBACK_SPACING
        };
        self.spacing = Some((key, spacing));
        self.dirty = false;
        self.recomputations += 1;
        Ok(spacing)
    }

    /// Mean-centres, scales and offsets every slotted channel of `window`.
    pub fn compute_layout(&mut self, window: &SampleWindow) -> Result<RenderLayout> {
        let slots = self.slots();
        if let Some(&missing) = slots.iter().find(|&&c| window.position_of(c).is_none()) {
            return Err(EngineError::UnknownChannel(missing));
        }
        let spacing = self.spacing_for(window)?;
        let mut traces = Vec::with_capacity(slots.len());
        for (slot, &channel) in slots.iter().enumerate() {
            let (Some(column), Some(summary)) = (window.column(channel), window.summary(channel))
            else {
                return Err(EngineError::UnknownChannel(channel));
            };
            let state = &self.channels[channel];
            let scale = state.scale.unwrap_or(self.base_scale);
            let y_offset = slot as f32 * spacing;
            let values = column
                .iter()
                .map(|&v| (v - summary.mean) * scale + y_offset)
                .collect();
            traces.push(ChannelTrace {
                channel,
                label: state.label.clone(),
                slot,
                y_offset,
                scale,
                bad: state.bad,
                values,
            });
        }
        Ok(RenderLayout {
            range: window.time_range(),
            times: window.row_times(),
            traces,
            spacing,
            factor: window.factor(),
            reduction: window.reduction(),
            clipped: None,
            provisional: false,
            stale: false,
        })
    }
}

fn check_scale(scale: f32) -> Result<()> {
    if scale.is_finite() && scale > 0.0 {
        Ok(())
    } else {
        Err(EngineError::InvalidScale(scale))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::f32::consts::PI;

    fn labels(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("Ch {i}")).collect()
    }

    /// Sines with per-channel amplitudes, one full period per 50 rows.
    fn sine_window(amplitudes: &[f32]) -> SampleWindow {
        let rows = 500;
        let values = Array2::from_shape_fn((rows, amplitudes.len()), |(r, c)| {
            amplitudes[c] * (2.0 * PI * r as f32 / 50.0 + c as f32).sin() + 10.0 * c as f32
        });
        SampleWindow::native(100.0, 0, (0..amplitudes.len()).collect(), values).unwrap()
    }

    fn assert_no_overlap(layout: &RenderLayout) {
        for pair in layout.traces.windows(2) {
            let (_, upper_of_lower) = pair[0].extent().unwrap();
            let (lower_of_upper, _) = pair[1].extent().unwrap();
            assert!(
                upper_of_lower <= lower_of_upper,
                "slot {} reaches {upper_of_lower}, slot {} starts at {lower_of_upper}",
                pair[0].slot,
                pair[1].slot
            );
        }
    }

    #[test]
    fn skewed_channels_can_cross_after_mean_centring() {
        // Channel 0 rests at -1 with one spike to +1; channel 1 is its mirror image.
        let rows = 10;
        let values = Array2::from_shape_fn((rows, 2), |(r, c)| {
            let spike = r == 4;
            match (c, spike) {
                (0, false) | (1, true) => -1.0,
                _ => 1.0,
            }
        });
        let window = SampleWindow::native(100.0, 0, vec![0, 1], values).unwrap();
        let mut state = RenderState::new(labels(2), 1.0).unwrap();
        let layout = state.compute_layout(&window).unwrap();
        assert!((layout.spacing - 2.4).abs() < 1e-5);
        let (_, upper_of_lower) = layout.traces[0].extent().unwrap();
        let (lower_of_upper, _) = layout.traces[1].extent().unwrap();
        // Means of -0.8 and 0.8 put the spikes at 1.8 and 2.4 - 1.8.
        assert!((upper_of_lower - 1.8).abs() < 1e-5);
        assert!((lower_of_upper - 0.6).abs() < 1e-5);
        assert!(upper_of_lower > lower_of_upper);
    }

    #[test]
    fn random_scales_never_overlap() {
        let mut rng = StdRng::seed_from_u64(11);
        let amplitudes = [1.0, 50.0, 0.2, 300.0, 7.5, 20.0];
        let window = sine_window(&amplitudes);
        let mut state = RenderState::new(labels(amplitudes.len()), 1.0).unwrap();
        for _ in 0..50 {
            let mut selection: Vec<usize> = (0..amplitudes.len()).filter(|_| rng.gen_bool(0.7)).collect();
            if selection.is_empty() {
                selection.push(0);
            }
            state.select(&selection).unwrap();
            for &channel in &selection {
                state
                    .set_channel_scale(channel, rng.gen_range(0.01..20.0))
                    .unwrap();
            }
            let layout = state.compute_layout(&window).unwrap();
            assert_eq!(layout.traces.len(), selection.len());
            assert_no_overlap(&layout);
        }
    }

    #[test]
    fn eeg_next_to_trigger_stays_apart() {
        let rows = 2000;
        let values = Array2::from_shape_fn((rows, 2), |(r, c)| match c {
            0 => 40.0 * (2.0 * PI * r as f32 / 20.0).sin(),
            _ => {
                if r % 1000 < 20 {
                    2.0
                } else {
                    0.0
                }
            }
        });
        let window = SampleWindow::native(200.0, 0, vec![0, 1], values).unwrap();
        let mut state = RenderState::new(labels(2), 1.0).unwrap();
        state.set_channel_scale(1, 60.0).unwrap();
        let layout = state.compute_layout(&window).unwrap();
        // Spacing follows the scaled trigger swing, not the raw 0..2 range.
        assert!((layout.spacing - 1.2 * 120.0).abs() < 1e-3);
        assert_no_overlap(&layout);
    }

    #[test]
    fn bad_channel_only_matters_when_it_was_widest() {
        let window = sine_window(&[1.0, 5.0, 2.0]);
        let mut state = RenderState::new(labels(3), 1.0).unwrap();
        let full = state.compute_layout(&window).unwrap().spacing;

        state.set_bad(2, true).unwrap();
        let without_small = state.compute_layout(&window).unwrap();
        assert_eq!(without_small.spacing, full);
        // Still laid out, flagged, and still addressable.
        assert_eq!(without_small.traces.len(), 3);
        assert!(without_small.trace(2).unwrap().bad);

        state.set_bad(2, false).unwrap();
        state.set_bad(1, true).unwrap();
        let without_widest = state.compute_layout(&window).unwrap().spacing;
        assert!(without_widest < full);
        assert_eq!(state.bad_channels(), vec![1]);
    }

    #[test]
    fn spacing_is_cached_until_something_changes() {
        let window = sine_window(&[1.0, 2.0]);
        let mut state = RenderState::new(labels(2), 1.0).unwrap();
        state.compute_layout(&window).unwrap();
        state.compute_layout(&window).unwrap();
        assert_eq!(state.spacing_recomputations(), 1);

        // No-op updates do not invalidate.
        state.set_bad(0, false).unwrap();
        state.compute_layout(&window).unwrap();
        assert_eq!(state.spacing_recomputations(), 1);

        state.set_channel_scale(0, 3.0).unwrap();
        state.compute_layout(&window).unwrap();
        assert_eq!(state.spacing_recomputations(), 2);

        let other = SampleWindow::native(
            100.0,
            7,
            vec![0, 1],
            window.values().to_owned(),
        )
        .unwrap();
        state.compute_layout(&other).unwrap();
        assert_eq!(state.spacing_recomputations(), 3);
    }

    #[test]
    fn slots_follow_selection_order_and_skip_hidden() {
        let window = sine_window(&[1.0, 1.0, 1.0, 1.0]);
        let mut state = RenderState::new(labels(4), 2.0).unwrap();
        state.select(&[3, 1, 3, 0]).unwrap();
        state.set_visible(1, false).unwrap();
        assert_eq!(state.slots(), vec![3, 0]);
        let layout = state.compute_layout(&window).unwrap();
        let order: Vec<(usize, usize)> = layout.traces.iter().map(|t| (t.channel, t.slot)).collect();
        assert_eq!(order, vec![(3, 0), (0, 1)]);
        assert_eq!(layout.traces[1].y_offset, layout.spacing);
        assert_eq!(layout.traces[0].scale, 2.0);
    }

    #[test]
    fn all_flat_channels_use_fallback_spacing() {
        let window =
            SampleWindow::native(10.0, 0, vec![0, 1], Array2::from_elem((10, 2), 4.0)).unwrap();
        let mut state = RenderState::new(labels(2), 1.0).unwrap();
        let layout = state.compute_layout(&window).unwrap();
        assert_eq!(layout.spacing, FALLBACK_SPACING);
        assert_eq!(layout.traces[1].values[0], FALLBACK_SPACING);
    }

    #[test]
    fn rejects_bad_scales_and_channels() {
        let mut state = RenderState::new(labels(2), 1.0).unwrap();
        assert_eq!(
            state.set_channel_scale(0, 0.0).unwrap_err(),
            EngineError::InvalidScale(0.0)
        );
        assert!(state.set_base_scale(f32::NAN).is_err());
        assert_eq!(state.set_bad(5, true).unwrap_err(), EngineError::UnknownChannel(5));
        assert_eq!(state.select(&[0, 2]).unwrap_err(), EngineError::UnknownChannel(2));
        assert_eq!(state.selection(), &[0, 1]);
    }
}
