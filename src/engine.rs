// src/engine.rs
use std::sync::mpsc::Receiver;
use std::sync::Arc;

use crate::annotations::{Annotation, AnnotationRecord, AnnotationStore};
use crate::cache::{CacheStats, CachedView, ResolutionCache};
use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::navigation::Viewport;
use crate::render::{OverviewTrace, RenderLayout, RenderState};
use crate::signal::{
    spectrogram, welch_psd, ChannelStats, Pipeline, PowerSpectrum, SampleSource, Spectrogram,
    TimeRange,
};
use crate::trigger::{TriggerDetector, TriggerEvent};
use crate::types::{EngineCommand, EngineEvent, EventBus};

/// Span shown when a recording is first opened, in seconds.
pub const INITIAL_VIEW_SECONDS: f64 = 10.0;
/// Points per channel requested for the whole-recording minimap.
pub const OVERVIEW_POINTS: usize = 10_000;

// 检测器及其参数; 参数变化时重建
#[derive(Clone, Debug)]
struct ActiveDetector {
    channel: usize,
    threshold: f32,
    refractory_secs: f64,
    detector: TriggerDetector,
}

impl ActiveDetector {
    fn matches(&self, channel: usize, threshold: f32, refractory_secs: f64) -> bool {
        self.channel == channel
            && self.threshold == threshold
            && self.refractory_secs == refractory_secs
    }
}

/// Coordinates the cache, render state, annotations and trigger detection for one recording.
///
/// Every mutating call that changes what a layout would show emits `LayoutInvalidated`.
pub struct Engine {
    config: EngineConfig,
    events: EventBus,
    cache: ResolutionCache,
    render: RenderState,
    pipeline: Pipeline,
    annotations: AnnotationStore,
    detector: Option<ActiveDetector>,
    viewport: Viewport,
}

impl Engine {
    pub fn new(source: Arc<dyn SampleSource>, config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let events = EventBus::new();
        let cache = ResolutionCache::with_events(source, config.cache.clone(), events.clone())?;
        let render = RenderState::new(cache.channel_labels(), config.render.base_scale)?;
        let viewport = Viewport::new(
            cache.duration_seconds(),
            cache.sample_rate(),
            config.render.min_view_samples,
            INITIAL_VIEW_SECONDS,
        )?;
        log::info!(
            "engine ready: {} channels, {:.1} s at {} Hz",
            cache.channel_count(),
            cache.duration_seconds(),
            cache.sample_rate()
        );
        Ok(Self {
            config,
            events,
            cache,
            render,
            pipeline: Pipeline::default(),
            annotations: AnnotationStore::new(),
            detector: None,
            viewport,
        })
    }

    pub fn subscribe(&self) -> Receiver<EngineEvent> {
        self.events.subscribe()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn cache(&self) -> &ResolutionCache {
        &self.cache
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    pub fn render_state(&self) -> &RenderState {
        &self.render
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    pub fn viewport(&self) -> &Viewport {
        &self.viewport
    }

    /// Navigation does not invalidate anything; the next `request_viewport` picks it up.
    pub fn viewport_mut(&mut self) -> &mut Viewport {
        &mut self.viewport
    }

    pub fn sample_rate(&self) -> f64 {
        self.cache.sample_rate()
    }

    pub fn duration_seconds(&self) -> f64 {
        self.cache.duration_seconds()
    }

    // ============================================================
    // 窗口请求
    // ============================================================

    /// Layout for `[time_start, time_end)` with about `pixel_budget` points per channel.
    ///
    /// Requests the ideal tier under the configured deadline. When the request fails for
    /// reasons other than bad arguments, the best resident tier is served marked `stale`.
    pub fn request_window(
        &mut self,
        time_start: f64,
        time_end: f64,
        pixel_budget: usize,
    ) -> Result<RenderLayout> {
        let range = TimeRange::new(time_start, time_end);
        range.validate()?;
        if pixel_budget == 0 {
            return Err(EngineError::InvalidPointBudget);
        }
        let slots = self.render.slots();
        // Queued builds for the previous window are no longer wanted.
        self.cache.supersede();
        let served = self
            .cache
            .request_view(range, pixel_budget, &slots, self.config.build_deadline())
            .and_then(|view| self.layout_for(&view));
        match served {
            Ok(layout) => Ok(layout),
            Err(err) if is_caller_error(&err) => Err(err),
            Err(err) => {
                let Some(view) = self.cache.cached_view(range, pixel_budget, &slots) else {
                    log::warn!("window {time_start:.3}..{time_end:.3} s failed: {err}");
                    return Err(err);
                };
                log::warn!(
                    "window {time_start:.3}..{time_end:.3} s failed ({err}); serving cached factor {}",
                    view.window.factor()
                );
                let mut layout = self.layout_for(&view)?;
                layout.stale = true;
                Ok(layout)
            }
        }
    }

    pub fn request_viewport(&mut self, pixel_budget: usize) -> Result<RenderLayout> {
        let range = self.viewport.range();
        self.request_window(range.start, range.end, pixel_budget)
    }

    fn layout_for(&mut self, view: &CachedView) -> Result<RenderLayout> {
        let window = self.pipeline.apply(&view.window)?;
        let mut layout = self.render.compute_layout(&window)?;
        layout.clipped = view.clipped;
        layout.provisional = view.provisional;
        Ok(layout)
    }

    // ============================================================
    // 渲染状态
    // ============================================================

    fn invalidated(&self) {
        self.events.emit(EngineEvent::LayoutInvalidated);
    }

    pub fn set_channel_scale(&mut self, channel: usize, factor: f32) -> Result<()> {
        self.render.set_channel_scale(channel, factor)?;
        self.invalidated();
        Ok(())
    }

    pub fn clear_channel_scale(&mut self, channel: usize) -> Result<()> {
        self.render.clear_channel_scale(channel)?;
        self.invalidated();
        Ok(())
    }

    pub fn set_base_scale(&mut self, scale: f32) -> Result<()> {
        self.render.set_base_scale(scale)?;
        self.invalidated();
        Ok(())
    }

    pub fn set_bad(&mut self, channel: usize, bad: bool) -> Result<()> {
        self.render.set_bad(channel, bad)?;
        if bad && self.detector.as_ref().is_some_and(|d| d.channel == channel) {
            self.detector = None;
        }
        log::debug!("channel {channel} marked {}", if bad { "bad" } else { "good" });
        self.invalidated();
        Ok(())
    }

    pub fn set_visible(&mut self, channel: usize, visible: bool) -> Result<()> {
        self.render.set_visible(channel, visible)?;
        self.invalidated();
        Ok(())
    }

    pub fn select_channels(&mut self, channels: &[usize]) -> Result<()> {
        self.render.select(channels)?;
        self.invalidated();
        Ok(())
    }

    pub fn set_pipeline(&mut self, pipeline: Pipeline) {
        log::debug!("processing: {}", pipeline.describe());
        self.pipeline = pipeline;
        self.render.mark_dirty();
        self.invalidated();
    }

    // ============================================================
    // 触发检测
    // ============================================================

    /// Rising edges of `channel` over `range` (the whole recording when `None`).
    ///
    /// A whole-recording scan starts from a fresh detector. Range scans keep the refractory
    /// state of earlier calls with the same parameters, so consecutive ranges behave like
    /// one continuous scan. Samples are read through the native tier one tile at a time.
    pub fn detect_triggers(
        &mut self,
        channel: usize,
        threshold: f32,
        refractory_secs: f64,
        range: Option<TimeRange>,
    ) -> Result<Vec<TriggerEvent>> {
        if channel >= self.render.channel_count() {
            return Err(EngineError::UnknownChannel(channel));
        }
        if self.render.is_bad(channel) {
            return Err(EngineError::ChannelMarkedBad(channel));
        }
        let rate = self.cache.sample_rate();
        let len = self.cache.sample_count();
        let (start, end) = match range {
            Some(range) => {
                range.validate()?;
                let start = (range.start * rate).floor().max(0.0) as u64;
                let end = ((range.end * rate).ceil().max(0.0) as u64).min(len);
                (start, end)
            }
            None => (0, len),
        };
        if start >= end {
            return Err(EngineError::OutOfRange { start, end, len });
        }

        let reuse = range.is_some()
            && self
                .detector
                .as_ref()
                .is_some_and(|d| d.matches(channel, threshold, refractory_secs));
        if !reuse {
            self.detector = Some(ActiveDetector {
                channel,
                threshold,
                refractory_secs,
                detector: TriggerDetector::new(threshold, refractory_secs),
            });
        }
        let Some(active) = self.detector.as_mut() else {
            return Ok(Vec::new());
        };

        let chunk = self.config.cache.tile_len.max(1) as u64;
        let mut events = Vec::new();
        let mut pos = start;
        while pos < end {
            let chunk_end = (pos + chunk).min(end);
            // One sample of overlap so an edge on a chunk boundary is still seen.
            let read_start = pos.saturating_sub(1);
            // Bypasses the tier table so a full scan does not evict the display tiers.
            let window = self.cache.read_uncached(read_start, chunk_end, &[channel])?;
            let samples = window
                .column(channel)
                .ok_or(EngineError::UnknownChannel(channel))?
                .to_vec();
            let offset = read_start as f64 / rate;
            events.extend(active.detector.detect(&samples, rate, offset)?);
            pos = chunk_end;
        }
        log::info!(
            "{} triggers on channel {channel} (threshold {threshold}, refractory {refractory_secs} s)",
            events.len()
        );
        Ok(events)
    }

    pub fn reset_detector(&mut self) {
        if let Some(active) = self.detector.as_mut() {
            active.detector.reset();
        }
    }

    // ============================================================
    // 标注
    // ============================================================

    pub fn annotations(&self) -> &AnnotationStore {
        &self.annotations
    }

    pub fn add_annotation(
        &mut self,
        start_sample: u64,
        end_sample: u64,
        label: impl Into<String>,
    ) -> Result<u64> {
        let id = self.annotations.add(start_sample, end_sample, label)?;
        self.events.emit(EngineEvent::AnnotationsChanged);
        Ok(id)
    }

    pub fn resize_annotation(&mut self, id: u64, start_sample: u64, end_sample: u64) -> Result<()> {
        self.annotations.resize(id, start_sample, end_sample)?;
        self.events.emit(EngineEvent::AnnotationsChanged);
        Ok(())
    }

    pub fn remove_annotation(&mut self, id: u64) -> Result<Annotation> {
        let removed = self.annotations.remove(id)?;
        self.events.emit(EngineEvent::AnnotationsChanged);
        Ok(removed)
    }

    pub fn query_annotations(&self, start_sample: u64, end_sample: u64) -> Result<Vec<&Annotation>> {
        self.annotations.query(start_sample, end_sample)
    }

    /// Annotations intersecting a time range, using the recording's sample rate.
    pub fn annotations_in(&self, range: TimeRange) -> Result<Vec<&Annotation>> {
        range.validate()?;
        let rate = self.cache.sample_rate();
        let start = (range.start * rate).floor().max(0.0) as u64;
        let end = (range.end * rate).ceil().max(0.0) as u64;
        self.annotations.query(start, end)
    }

    /// Replaces every annotation with externally persisted records.
    pub fn load_annotations(
        &mut self,
        records: impl IntoIterator<Item = AnnotationRecord>,
    ) -> Result<()> {
        self.annotations = AnnotationStore::from_records(records)?;
        self.events.emit(EngineEvent::AnnotationsChanged);
        Ok(())
    }

    // ============================================================
    // 分析
    // ============================================================

    /// Whole-recording minimap of `channel` at roughly `points` points.
    pub fn overview(&self, channel: usize, points: usize) -> Result<OverviewTrace> {
        let full = TimeRange::new(0.0, self.cache.duration_seconds());
        let view = self.cache.get_view(full, points, &[channel])?;
        OverviewTrace::from_window(&view.window, channel).ok_or(EngineError::UnknownChannel(channel))
    }

    /// Statistics of the processed native samples of `channel` over `range`.
    pub fn channel_stats(&self, channel: usize, range: TimeRange) -> Result<ChannelStats> {
        let (_, samples) = self.processed_samples(channel, range)?;
        Ok(ChannelStats::from_samples(&samples))
    }

    /// Welch PSD of the processed native samples of `channel` over `range`.
    pub fn power_spectrum(&self, channel: usize, range: TimeRange) -> Result<PowerSpectrum> {
        let (_, samples) = self.processed_samples(channel, range)?;
        Ok(welch_psd(&samples, self.cache.sample_rate() as f32))
    }

    /// Short-time spectrum of `channel` over `range`, frame times in recording seconds.
    pub fn spectrogram(&self, channel: usize, range: TimeRange) -> Result<Spectrogram> {
        let (start, samples) = self.processed_samples(channel, range)?;
        let sg = spectrogram(&samples, self.cache.sample_rate() as f32);
        log::debug!(
            "spectrogram of channel {channel}: {} frames x {} bins",
            sg.frames(),
            sg.bins()
        );
        Ok(sg.shifted(start))
    }

    /// Processed native samples and the time of the first one.
    fn processed_samples(&self, channel: usize, range: TimeRange) -> Result<(f64, Vec<f32>)> {
        range.validate()?;
        let rate = self.cache.sample_rate();
        let start = (range.start * rate).floor().max(0.0) as u64;
        let end = (range.end * rate).ceil().max(0.0) as u64;
        let window = self.cache.get_samples(start, end, &[channel])?;
        let window = self.pipeline.apply(&window)?;
        let column = window
            .column(channel)
            .ok_or(EngineError::UnknownChannel(channel))?;
        Ok((window.start_sample() as f64 / rate, column.to_vec()))
    }

    // ============================================================
    // 数据源
    // ============================================================

    /// Switches to a new (or recovered) source.
    ///
    /// Render state survives when the channel count is unchanged; otherwise it starts over.
    /// The viewport keeps its span where the new recording allows.
    pub fn reattach(&mut self, source: Arc<dyn SampleSource>) -> Result<()> {
        self.cache.reattach(source)?;
        if self.cache.channel_count() != self.render.channel_count() {
            log::warn!(
                "channel count changed from {} to {}; render state reset",
                self.render.channel_count(),
                self.cache.channel_count()
            );
            self.render = RenderState::new(self.cache.channel_labels(), self.config.render.base_scale)?;
        } else {
            self.render.mark_dirty();
        }
        let previous = self.viewport.range();
        self.viewport = Viewport::new(
            self.cache.duration_seconds(),
            self.cache.sample_rate(),
            self.config.render.min_view_samples,
            previous.duration(),
        )?;
        self.viewport.center_on((previous.start + previous.end) / 2.0);
        self.detector = None;
        self.invalidated();
        Ok(())
    }

    /// Applies one UI command.
    pub fn handle(&mut self, command: EngineCommand) -> Result<()> {
        match command {
            EngineCommand::SetChannelScale { channel, factor } => {
                self.set_channel_scale(channel, factor)
            }
            EngineCommand::ClearChannelScale(channel) => self.clear_channel_scale(channel),
            EngineCommand::SetBaseScale(scale) => self.set_base_scale(scale),
            EngineCommand::SetBad { channel, bad } => self.set_bad(channel, bad),
            EngineCommand::SetVisible { channel, visible } => self.set_visible(channel, visible),
            EngineCommand::SelectChannels(channels) => self.select_channels(&channels),
            EngineCommand::SetPipeline(pipeline) => {
                self.set_pipeline(pipeline);
                Ok(())
            }
            EngineCommand::AddAnnotation {
                start_sample,
                end_sample,
                label,
            } => self.add_annotation(start_sample, end_sample, label).map(|_| ()),
            EngineCommand::ResizeAnnotation {
                id,
                start_sample,
                end_sample,
            } => self.resize_annotation(id, start_sample, end_sample),
            EngineCommand::RemoveAnnotation(id) => self.remove_annotation(id).map(|_| ()),
            EngineCommand::ResetDetector => {
                self.reset_detector();
                Ok(())
            }
        }
    }
}

/// Errors caused by the request itself; no cached tier would help.
fn is_caller_error(err: &EngineError) -> bool {
    matches!(
        err,
        EngineError::InvalidRange { .. }
            | EngineError::InvalidPointBudget
            | EngineError::OutOfRange { .. }
            | EngineError::UnknownChannel(_)
            | EngineError::InvalidScale(_)
    )
}
