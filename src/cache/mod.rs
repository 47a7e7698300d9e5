//! Multi-resolution tile cache over a [`SampleSource`].
//!
//! Every tier is a fixed downsampling factor `level_ratio^level` split into tiles of
//! `tile_len` buckets. Tiles are built from the next finer tier (or the source), so a
//! request touches at most a few tiles regardless of recording length.

pub mod decimate;
pub(crate) mod flight;
pub mod tier;
mod worker;

use std::collections::HashMap;
use std::ops::Range;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use ndarray::{s, Array2};

use crate::config::CacheConfig;
use crate::error::{EngineError, Result};
use crate::signal::source::SampleSource;
use crate::signal::window::{Reduction, SampleWindow, TimeRange};
use crate::types::{EngineEvent, EventBus};

use self::decimate::DecimationKernel;
use self::flight::Flight;
use self::worker::{BuildJob, WorkerPool};

pub use self::tier::{TierKey, TierTable, Tile};

/// The requested range reached past the recording and was served clipped.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RangeClipped {
    pub requested: TimeRange,
    pub served: TimeRange,
}

#[derive(Clone, Debug)]
pub struct CachedView {
    pub window: SampleWindow,
    pub clipped: Option<RangeClipped>,
    /// Served from a coarser tier while the ideal one is still building.
    pub provisional: bool,
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct CacheStats {
    pub tiles: usize,
    pub total_samples: usize,
    pub budget_samples: usize,
    pub in_flight: usize,
    pub builds: u64,
    pub epoch: u64,
}

#[derive(Clone, Copy, Debug)]
struct SourceInfo {
    channels: usize,
    rate: f64,
    len: u64,
}

impl SourceInfo {
    fn of(source: &dyn SampleSource) -> Result<Self> {
        let rate = source.sample_rate();
        if !(rate.is_finite() && rate > 0.0) {
            return Err(EngineError::InvalidSampleRate);
        }
        Ok(Self {
            channels: source.channel_count(),
            rate,
            len: source.sample_count(),
        })
    }

    fn buckets(&self, factor: u64) -> u64 {
        self.len.div_ceil(factor)
    }
}

struct CacheState {
    table: TierTable,
    flights: HashMap<TierKey, Arc<Flight>>,
    source: Arc<dyn SampleSource>,
    info: SourceInfo,
    epoch: u64,
    unavailable: Option<String>,
}

enum Acquire {
    Ready(Arc<Tile>),
    /// A new flight; the caller is responsible for getting it built.
    Owner(Arc<Flight>),
    Joined(Arc<Flight>),
}

/// Native sample span resolved to a level.
#[derive(Clone, Copy, Debug)]
struct Plan {
    start: u64,
    end: u64,
    level: u32,
    clipped: Option<RangeClipped>,
}

impl Plan {
    fn buckets(&self, factor: u64, info: &SourceInfo) -> Range<u64> {
        let first = self.start / factor;
        let end = self.end.div_ceil(factor).min(info.buckets(factor));
        first..end
    }
}

pub(crate) struct CacheShared {
    config: CacheConfig,
    kernel: DecimationKernel,
    state: Mutex<CacheState>,
    generation: AtomicU64,
    builds: AtomicU64,
    events: EventBus,
}

impl CacheShared {
    fn lock(&self) -> MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Source geometry, failing once the source has been lost.
    fn checked_info(&self, channels: &[usize]) -> Result<SourceInfo> {
        let state = self.lock();
        if let Some(reason) = &state.unavailable {
            return Err(EngineError::SourceUnavailable(reason.clone()));
        }
        if let Some(&bad) = channels.iter().find(|&&c| c >= state.info.channels) {
            return Err(EngineError::UnknownChannel(bad));
        }
        Ok(state.info)
    }

    fn factor_at(&self, level: u32) -> u64 {
        self.config.level_ratio.saturating_pow(level)
    }

    fn reduction_for(&self, factor: u64) -> Reduction {
        if factor <= 1 {
            Reduction::Native
        } else if factor >= self.config.envelope_from_factor {
            Reduction::Envelope
        } else {
            Reduction::Filtered
        }
    }

    /// Tier a tile of `key` is derived from.
    fn parent_of(&self, key: TierKey) -> (Reduction, u64) {
        let factor = key.factor / self.config.level_ratio;
        if factor <= 1 {
            (Reduction::Native, 1)
        } else {
            (key.reduction, factor)
        }
    }

    fn max_level(&self, info: &SourceInfo) -> u32 {
        let mut level = 0;
        while self.factor_at(level + 1) <= info.len.max(1) && level < 32 {
            level += 1;
        }
        level
    }

    /// Deepest level whose tier still leaves at least `budget` rows in `samples`.
    /// Envelope tiers emit two rows per bucket, so they are reached one level later.
    fn level_for(&self, samples: u64, budget: u64) -> u32 {
        let ratio = self.config.level_ratio;
        let mut level = 0;
        let mut factor: u64 = 1;
        while let Some(next) = factor.checked_mul(ratio) {
            let rows = self.reduction_for(next).rows_per_bucket() as u64;
            match next.checked_mul(budget) {
                Some(needed) if needed <= samples.saturating_mul(rows) => {
                    factor = next;
                    level += 1;
                }
                _ => break,
            }
        }
        level
    }

    fn plan(&self, info: &SourceInfo, range: TimeRange, budget: usize) -> Result<Plan> {
        range.validate()?;
        if budget == 0 {
            return Err(EngineError::InvalidPointBudget);
        }
        let len = info.len as f64;
        let start = (range.start * info.rate).floor();
        let end = (range.end * info.rate).ceil();
        if end <= 0.0 || start >= len {
            return Err(EngineError::OutOfRange {
                start: start.max(0.0) as u64,
                end: end.max(0.0) as u64,
                len: info.len,
            });
        }
        let first = start.max(0.0) as u64;
        let last = end.min(len) as u64;
        let clipped = (start < 0.0 || end > len).then(|| RangeClipped {
            requested: range,
            served: TimeRange::new(first as f64 / info.rate, last as f64 / info.rate),
        });
        Ok(Plan {
            start: first,
            end: last,
            level: self.level_for(last - first, budget as u64),
            clipped,
        })
    }

    fn tile_keys(&self, reduction: Reduction, factor: u64, buckets: &Range<u64>) -> Vec<TierKey> {
        let tile_len = self.config.tile_len as u64;
        (buckets.start / tile_len..=(buckets.end - 1) / tile_len)
            .map(|tile| TierKey::new(reduction, factor, tile))
            .collect()
    }

    fn acquire(&self, key: TierKey) -> Result<Acquire> {
        let mut state = self.lock();
        if let Some(reason) = &state.unavailable {
            return Err(EngineError::SourceUnavailable(reason.clone()));
        }
        if let Some(tile) = state.table.get(&key) {
            return Ok(Acquire::Ready(tile));
        }
        let generation = self.generation.load(Ordering::Acquire);
        if let Some(flight) = state.flights.get(&key) {
            flight.refresh(generation);
            return Ok(Acquire::Joined(flight.clone()));
        }
        let flight = Arc::new(Flight::new(state.epoch, generation));
        state.flights.insert(key, flight.clone());
        Ok(Acquire::Owner(flight))
    }

    /// Returns the tile, building it on this thread unless someone else already is.
    pub(crate) fn fetch_tile(&self, key: TierKey) -> Result<Arc<Tile>> {
        loop {
            let flight = match self.acquire(key)? {
                Acquire::Ready(tile) => return Ok(tile),
                Acquire::Owner(flight) | Acquire::Joined(flight) => flight,
            };
            let result = if flight.try_claim() {
                self.run_build(key, &flight)
            } else {
                flight.wait()
            };
            match result {
                Err(EngineError::BuildCancelled) => continue,
                other => return other,
            }
        }
    }

    fn run_build(&self, key: TierKey, flight: &Arc<Flight>) -> Result<Arc<Tile>> {
        let result = self.build(key);
        self.publish(key, flight, result)
    }

    pub(crate) fn run_job(&self, job: BuildJob) {
        if !job.flight.try_claim() {
            return;
        }
        if job.flight.generation() < self.generation.load(Ordering::Acquire) {
            log::debug!("dropping superseded build of {:?}", job.key);
            let _ = self.publish(job.key, &job.flight, Err(EngineError::BuildCancelled));
            return;
        }
        if let Err(err) = self.run_build(job.key, &job.flight) {
            log::warn!("background build of {:?} failed: {err}", job.key);
        }
    }

    fn build(&self, key: TierKey) -> Result<Arc<Tile>> {
        let (source, info) = {
            let state = self.lock();
            (state.source.clone(), state.info)
        };
        let tile_len = self.config.tile_len as u64;
        let first = key.tile * tile_len;
        let end = (first + tile_len).min(info.buckets(key.factor));
        if first >= end {
            return Err(EngineError::OutOfRange {
                start: first * key.factor,
                end: end * key.factor,
                len: info.len,
            });
        }
        let values = match key.reduction {
            Reduction::Native => {
                let all: Vec<usize> = (0..info.channels).collect();
                let block = source.read(first, end, &all)?;
                if block.nrows() as u64 != end - first {
                    return Err(EngineError::ShapeMismatch {
                        expected: (end - first) as usize,
                        actual: block.nrows(),
                    });
                }
                block
            }
            Reduction::Filtered => {
                let (parent, factor) = self.parent_of(key);
                let parent_len = info.buckets(factor);
                let support = self.kernel.support(&(first..end), parent_len);
                let block = self.gather(&info, parent, factor, support.clone())?;
                self.kernel.apply(block.view(), support.start, parent_len, first..end)
            }
            Reduction::Envelope => {
                let ratio = self.config.level_ratio;
                let (parent, factor) = self.parent_of(key);
                let parent_buckets = info.buckets(factor);
                let span = first * ratio..(end * ratio).min(parent_buckets);
                let per_bucket = parent.rows_per_bucket() as u64;
                let block = self.gather(&info, parent, factor, span.clone())?;
                decimate::envelope(
                    block.view(),
                    span.start * per_bucket,
                    per_bucket,
                    parent_buckets,
                    ratio,
                    first..end,
                )
            }
        };
        self.builds.fetch_add(1, Ordering::Relaxed);
        log::debug!("built {:?}: buckets {first}..{end}", key);
        Ok(Arc::new(Tile {
            key,
            first_bucket: first,
            values,
        }))
    }

    /// All channels of `buckets` at one tier, fetching (and pinning) the tiles involved.
    fn gather(
        &self,
        info: &SourceInfo,
        reduction: Reduction,
        factor: u64,
        buckets: Range<u64>,
    ) -> Result<Array2<f32>> {
        let channels: Vec<usize> = (0..info.channels).collect();
        self.copy_tiles(reduction, factor, &buckets, &channels, |key| {
            self.fetch_tile(key)
        })
    }

    fn copy_tiles(
        &self,
        reduction: Reduction,
        factor: u64,
        buckets: &Range<u64>,
        channels: &[usize],
        mut lookup: impl FnMut(TierKey) -> Result<Arc<Tile>>,
    ) -> Result<Array2<f32>> {
        let per_bucket = reduction.rows_per_bucket();
        let rows = (buckets.end - buckets.start) as usize * per_bucket;
        let mut values = Array2::<f32>::zeros((rows, channels.len()));
        for key in self.tile_keys(reduction, factor, buckets) {
            let tile = lookup(key)?;
            let lo = buckets.start.max(tile.first_bucket);
            let hi = buckets.end.min(tile.end_bucket());
            if lo >= hi {
                continue;
            }
            let src = (lo - tile.first_bucket) as usize * per_bucket
                ..(hi - tile.first_bucket) as usize * per_bucket;
            let dst_start = (lo - buckets.start) as usize * per_bucket;
            let dst = dst_start..dst_start + src.len();
            for (col, &channel) in channels.iter().enumerate() {
                values
                    .slice_mut(s![dst.clone(), col])
                    .assign(&tile.values.slice(s![src.clone(), channel]));
            }
        }
        Ok(values)
    }

    fn assemble(
        &self,
        info: &SourceInfo,
        plan: &Plan,
        level: u32,
        channels: &[usize],
        lookup: impl FnMut(TierKey) -> Result<Arc<Tile>>,
    ) -> Result<SampleWindow> {
        let factor = self.factor_at(level);
        let reduction = self.reduction_for(factor);
        let buckets = plan.buckets(factor, info);
        let values = self.copy_tiles(reduction, factor, &buckets, channels, lookup)?;
        SampleWindow::new(
            info.rate,
            reduction,
            factor,
            buckets.start,
            (buckets.end * factor).min(info.len),
            channels.to_vec(),
            values,
        )
    }

    /// Stores a finished build and wakes everyone waiting for it.
    fn publish(
        &self,
        key: TierKey,
        flight: &Arc<Flight>,
        result: Result<Arc<Tile>>,
    ) -> Result<Arc<Tile>> {
        let mut inserted = None;
        let mut lost = None;
        let mut orphans = Vec::new();
        {
            let mut state = self.lock();
            if state
                .flights
                .get(&key)
                .is_some_and(|current| Arc::ptr_eq(current, flight))
            {
                state.flights.remove(&key);
            }
            if flight.epoch() == state.epoch && state.unavailable.is_none() {
                match &result {
                    Ok(tile) => {
                        state.table.insert(tile.clone());
                        let evicted = state.table.evict_to_budget();
                        if !evicted.is_empty() {
                            log::debug!("evicted {} tiles", evicted.len());
                        }
                        let end = (tile.end_bucket() * tile.key.factor).min(state.info.len);
                        inserted = Some(EngineEvent::TierReady {
                            factor: tile.key.factor,
                            start_sample: tile.first_bucket * tile.key.factor,
                            end_sample: end,
                        });
                    }
                    Err(EngineError::SourceUnavailable(reason)) => {
                        orphans = Self::mark_lost(&mut state, reason);
                        lost = Some(reason.clone());
                    }
                    Err(_) => {}
                }
            }
        }
        flight.finish(result.clone());
        if let Some(reason) = lost {
            self.announce_loss(reason, orphans);
        } else if let Some(event) = inserted {
            self.events.emit(event);
        }
        result
    }

    /// Flags the source as lost and hands back every flight still waiting on it.
    fn mark_lost(state: &mut CacheState, reason: &str) -> Vec<Arc<Flight>> {
        state.unavailable = Some(reason.to_string());
        state.flights.drain().map(|(_, f)| f).collect()
    }

    fn announce_loss(&self, reason: String, orphans: Vec<Arc<Flight>>) {
        log::warn!("sample source lost: {reason}");
        for orphan in orphans {
            orphan.finish(Err(EngineError::SourceUnavailable(reason.clone())));
        }
        self.events.emit(EngineEvent::SourceUnavailable(reason));
    }

    /// Records a loss seen outside a tile build, unless the source was swapped meanwhile.
    fn source_lost(&self, epoch: u64, reason: &str) {
        let orphans = {
            let mut state = self.lock();
            if state.epoch != epoch || state.unavailable.is_some() {
                return;
            }
            Self::mark_lost(&mut state, reason)
        };
        self.announce_loss(reason.to_string(), orphans);
    }

    /// First level in `levels` whose tiles for `plan` are all resident.
    fn resident_view(
        &self,
        info: &SourceInfo,
        plan: &Plan,
        channels: &[usize],
        levels: impl IntoIterator<Item = u32>,
    ) -> Option<SampleWindow> {
        for level in levels {
            let factor = self.factor_at(level);
            let reduction = self.reduction_for(factor);
            let keys = self.tile_keys(reduction, factor, &plan.buckets(factor, info));
            let tiles: Option<HashMap<TierKey, Arc<Tile>>> = {
                let state = self.lock();
                keys.iter()
                    .map(|key| state.table.peek(key).map(|tile| (*key, tile)))
                    .collect()
            };
            let Some(tiles) = tiles else {
                continue;
            };
            let window = self.assemble(info, plan, level, channels, |key| {
                tiles
                    .get(&key)
                    .cloned()
                    .ok_or(EngineError::BuildCancelled)
            });
            if let Ok(window) = window {
                return Some(window);
            }
        }
        None
    }
}

/// Tiered cache with single-flight builds and optional background builders.
pub struct ResolutionCache {
    shared: Arc<CacheShared>,
    workers: WorkerPool,
}

impl ResolutionCache {
    pub fn new(source: Arc<dyn SampleSource>, config: CacheConfig) -> Result<Self> {
        Self::with_events(source, config, EventBus::new())
    }

    /// Same as [`ResolutionCache::new`], publishing `TierReady`/`SourceUnavailable` on `events`.
    pub fn with_events(
        source: Arc<dyn SampleSource>,
        config: CacheConfig,
        events: EventBus,
    ) -> Result<Self> {
        if config.tile_len == 0 || config.level_ratio < 2 || config.budget_samples == 0 {
            return Err(EngineError::Config(
                "cache needs a tile length, a ratio of at least 2 and a budget".into(),
            ));
        }
        let info = SourceInfo::of(&*source)?;
        let shared = Arc::new(CacheShared {
            kernel: DecimationKernel::new(config.level_ratio, config.filter_taps_per_ratio),
            state: Mutex::new(CacheState {
                table: TierTable::new(config.budget_samples),
                flights: HashMap::new(),
                source,
                info,
                epoch: 0,
                unavailable: None,
            }),
            generation: AtomicU64::new(0),
            builds: AtomicU64::new(0),
            events,
            config,
        });
        let workers = WorkerPool::spawn(shared.config.build_workers, &shared);
        log::debug!(
            "resolution cache: {} channels, {} samples, {} builders",
            info.channels,
            info.len,
            workers.len()
        );
        Ok(Self { shared, workers })
    }

    pub fn config(&self) -> &CacheConfig {
        &self.shared.config
    }

    pub fn sample_rate(&self) -> f64 {
        self.shared.lock().info.rate
    }

    pub fn sample_count(&self) -> u64 {
        self.shared.lock().info.len
    }

    pub fn channel_count(&self) -> usize {
        self.shared.lock().info.channels
    }

    pub fn duration_seconds(&self) -> f64 {
        let info = self.shared.lock().info;
        info.len as f64 / info.rate
    }

    pub fn channel_labels(&self) -> Vec<String> {
        let source = self.shared.lock().source.clone();
        source.channel_labels()
    }

    /// Downsampling factor a request for `range` at `budget` points would be served at.
    pub fn factor_for(&self, range: TimeRange, budget: usize) -> Result<u64> {
        let info = self.shared.lock().info;
        let plan = self.shared.plan(&info, range, budget)?;
        Ok(self.shared.factor_at(plan.level))
    }

    /// Blocking read: builds whatever tiles are missing on the calling thread.
    pub fn get_view(
        &self,
        range: TimeRange,
        budget: usize,
        channels: &[usize],
    ) -> Result<CachedView> {
        let shared = &self.shared;
        let info = shared.checked_info(channels)?;
        let plan = shared.plan(&info, range, budget)?;
        let window = shared.assemble(&info, &plan, plan.level, channels, |key| {
            shared.fetch_tile(key)
        })?;
        Ok(CachedView {
            window,
            clipped: plan.clipped,
            provisional: false,
        })
    }

    /// Deadline-bounded read for the render thread.
    ///
    /// Missing tiles are queued on the background builders. If they are not done by `wait`,
    /// a coarser fully resident tier is served as `provisional` and a `TierReady` event follows
    /// once the queued builds land. With nothing coarser resident it blocks like `get_view`.
    pub fn request_view(
        &self,
        range: TimeRange,
        budget: usize,
        channels: &[usize],
        wait: Duration,
    ) -> Result<CachedView> {
        let shared = &self.shared;
        let info = shared.checked_info(channels)?;
        let plan = shared.plan(&info, range, budget)?;
        let factor = shared.factor_at(plan.level);
        let reduction = shared.reduction_for(factor);
        let keys = shared.tile_keys(reduction, factor, &plan.buckets(factor, &info));
        let deadline = Instant::now() + wait;

        let mut ready: HashMap<TierKey, Arc<Tile>> = HashMap::new();
        let mut pending = Vec::new();
        for key in &keys {
            match shared.acquire(*key)? {
                Acquire::Ready(tile) => {
                    ready.insert(*key, tile);
                }
                Acquire::Owner(flight) => {
                    let job = BuildJob {
                        key: *key,
                        flight: flight.clone(),
                    };
                    if let Err(job) = self.workers.submit(job) {
                        if job.flight.try_claim() {
                            let _ = shared.run_build(job.key, &job.flight);
                        }
                    }
                    pending.push((*key, flight));
                }
                Acquire::Joined(flight) => pending.push((*key, flight)),
            }
        }
        for (key, flight) in &pending {
            match flight.wait_until(deadline) {
                Some(Ok(tile)) => {
                    ready.insert(*key, tile);
                }
                Some(Err(EngineError::BuildCancelled)) | None => {}
                Some(Err(err)) => return Err(err),
            }
        }

        if ready.len() < keys.len() {
            let coarser = plan.level + 1..=shared.max_level(&info);
            if let Some(window) = shared.resident_view(&info, &plan, channels, coarser) {
                log::debug!(
                    "serving factor {} while factor {factor} builds",
                    window.factor()
                );
                return Ok(CachedView {
                    window,
                    clipped: plan.clipped,
                    provisional: true,
                });
            }
        }
        let window = shared.assemble(&info, &plan, plan.level, channels, |key| {
            match ready.get(&key) {
                Some(tile) => Ok(tile.clone()),
                None => shared.fetch_tile(key),
            }
        })?;
        Ok(CachedView {
            window,
            clipped: plan.clipped,
            provisional: false,
        })
    }

    /// Best view assembled purely from resident tiles, even after the source was lost.
    ///
    /// Tries the ideal level first, then coarser, then finer ones.
    pub fn cached_view(
        &self,
        range: TimeRange,
        budget: usize,
        channels: &[usize],
    ) -> Option<CachedView> {
        let shared = &self.shared;
        let info = shared.lock().info;
        if channels.iter().any(|&c| c >= info.channels) {
            return None;
        }
        let plan = shared.plan(&info, range, budget).ok()?;
        let max = shared.max_level(&info);
        let levels = (plan.level..=max).chain((0..plan.level).rev());
        shared
            .resident_view(&info, &plan, channels, levels)
            .map(|window| CachedView {
                window,
                clipped: plan.clipped,
                provisional: false,
            })
    }

    /// Native-rate samples `[start, end)` through the native tier.
    pub fn get_samples(&self, start: u64, end: u64, channels: &[usize]) -> Result<SampleWindow> {
        let shared = &self.shared;
        let info = shared.checked_info(channels)?;
        if start >= info.len || end <= start {
            return Err(EngineError::OutOfRange {
                start,
                end,
                len: info.len,
            });
        }
        let plan = Plan {
            start,
            end: end.min(info.len),
            level: 0,
            clipped: None,
        };
        shared.assemble(&info, &plan, 0, channels, |key| shared.fetch_tile(key))
    }

    /// Native-rate samples `[start, end)` read straight from the source.
    ///
    /// Nothing is inserted into or promoted in the tier table, so long sequential scans
    /// leave the display tiers resident.
    pub fn read_uncached(&self, start: u64, end: u64, channels: &[usize]) -> Result<SampleWindow> {
        let (source, info, epoch) = {
            let state = self.shared.lock();
            if let Some(reason) = &state.unavailable {
                return Err(EngineError::SourceUnavailable(reason.clone()));
            }
            if let Some(&bad) = channels.iter().find(|&&c| c >= state.info.channels) {
                return Err(EngineError::UnknownChannel(bad));
            }
            (state.source.clone(), state.info, state.epoch)
        };
        if start >= info.len || end <= start {
            return Err(EngineError::OutOfRange {
                start,
                end,
                len: info.len,
            });
        }
        match source.read(start, end.min(info.len), channels) {
            Ok(values) => SampleWindow::native(info.rate, start, channels.to_vec(), values),
            Err(EngineError::SourceUnavailable(reason)) => {
                self.shared.source_lost(epoch, &reason);
                Err(EngineError::SourceUnavailable(reason))
            }
            Err(err) => Err(err),
        }
    }

    /// Fetches (building if needed) one tile. The returned `Arc` pins it against eviction.
    pub fn tile(&self, key: TierKey) -> Result<Arc<Tile>> {
        self.shared.fetch_tile(key)
    }

    pub fn is_resident(&self, key: &TierKey) -> bool {
        self.shared.lock().table.contains(key)
    }

    /// Marks every queued background build as stale; they are skipped unless a newer
    /// request asks for the same tile again. Builds already running still complete.
    pub fn supersede(&self) -> u64 {
        self.shared.generation.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn unavailable_reason(&self) -> Option<String> {
        self.shared.lock().unavailable.clone()
    }

    /// Swaps in a new source, dropping every tier and clearing a previous source loss.
    pub fn reattach(&self, source: Arc<dyn SampleSource>) -> Result<()> {
        let info = SourceInfo::of(&*source)?;
        let orphans: Vec<Arc<Flight>> = {
            let mut state = self.shared.lock();
            state.source = source;
            state.info = info;
            state.epoch += 1;
            state.table.clear();
            state.unavailable = None;
            state.flights.drain().map(|(_, flight)| flight).collect()
        };
        for flight in orphans {
            flight.finish(Err(EngineError::BuildCancelled));
        }
        log::info!(
            "source reattached: {} channels, {} samples at {} Hz",
            info.channels,
            info.len,
            info.rate
        );
        self.shared.events.emit(EngineEvent::SourceReattached);
        Ok(())
    }

    /// Drops every cached tile; in-flight builds still land.
    pub fn clear(&self) {
        self.shared.lock().table.clear();
    }

    pub fn stats(&self) -> CacheStats {
        let state = self.shared.lock();
        CacheStats {
            tiles: state.table.len(),
            total_samples: state.table.total_samples(),
            budget_samples: state.table.budget(),
            in_flight: state.flights.len(),
            builds: self.shared.builds.load(Ordering::Relaxed),
            epoch: state.epoch,
        }
    }
}

impl Drop for ResolutionCache {
    fn drop(&mut self) {
        // Queued jobs are skipped instead of built while the workers wind down.
        self.supersede();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signal::source::ArraySource;
    use std::f32::consts::PI;
    use std::sync::atomic::{AtomicBool, AtomicUsize};
    use std::sync::Barrier;
    use std::thread;

    /// Wraps an in-memory source with a read counter, a failure switch and a read delay.
    struct CountingSource {
        inner: ArraySource,
        reads: AtomicUsize,
        failing: AtomicBool,
        delay_ms: AtomicU64,
    }

    impl CountingSource {
        fn new(inner: ArraySource) -> Arc<Self> {
            Arc::new(Self {
                inner,
                reads: AtomicUsize::new(0),
                failing: AtomicBool::new(false),
                delay_ms: AtomicU64::new(0),
            })
        }

        fn reads(&self) -> usize {
            self.reads.load(Ordering::SeqCst)
        }
    }

    impl SampleSource for CountingSource {
        fn channel_count(&self) -> usize {
            self.inner.channel_count()
        }

        fn sample_rate(&self) -> f64 {
            self.inner.sample_rate()
        }

        fn sample_count(&self) -> u64 {
            self.inner.sample_count()
        }

        fn read(&self, start: u64, end: u64, channels: &[usize]) -> Result<Array2<f32>> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            let delay = self.delay_ms.load(Ordering::SeqCst);
            if delay > 0 {
                thread::sleep(Duration::from_millis(delay));
            }
            if self.failing.load(Ordering::SeqCst) {
                return Err(EngineError::SourceUnavailable("device removed".into()));
            }
            self.inner.read(start, end, channels)
        }
    }

    fn sine_source(rate: f64, len: usize, freq: f32) -> ArraySource {
        let samples: Vec<f32> = (0..len)
            .map(|i| (2.0 * PI * freq * (i as f64 / rate) as f32).sin())
            .collect();
        ArraySource::from_channels(rate, &[samples]).unwrap()
    }

    fn config(tile_len: usize, budget: usize, workers: usize) -> CacheConfig {
        CacheConfig {
            tile_len,
            budget_samples: budget,
            build_workers: workers,
            ..CacheConfig::default()
        }
    }

    /// Amplitude of the `freq_hz` component of `samples`.
    fn tone_amplitude(samples: &[f32], rate: f64, freq_hz: f64) -> f64 {
        let (mut re, mut im) = (0.0f64, 0.0f64);
        for (n, &v) in samples.iter().enumerate() {
            let phase = 2.0 * std::f64::consts::PI * freq_hz * n as f64 / rate;
            re += v as f64 * phase.cos();
            im -= v as f64 * phase.sin();
        }
        2.0 * (re * re + im * im).sqrt() / samples.len() as f64
    }

    #[test]
    fn filtered_tier_does_not_fold_high_frequencies() {
        // 220 Hz at 1 kHz lands above the 125 Hz Nyquist of a factor-4 tier and would
        // fold to 30 Hz under plain striding.
        let source = sine_source(1000.0, 4000, 220.0);
        let naive: Vec<f32> = source.data().column(0).iter().copied().step_by(4).collect();
        let cache = ResolutionCache::new(Arc::new(source), config(256, 1 << 20, 0)).unwrap();
        let view = cache
            .get_view(TimeRange::new(0.0, 4.0), 1000, &[0])
            .unwrap();
        let window = view.window;
        assert_eq!(window.factor(), 4);
        assert_eq!(window.reduction(), Reduction::Filtered);
        assert_eq!(window.len(), 1000);

        // 950 rows is a whole number of 30 Hz periods at 250 Hz; skip the edges.
        let filtered: Vec<f32> = window.values().column(0).iter().copied().collect();
        let alias_filtered = tone_amplitude(&filtered[16..966], 250.0, 30.0);
        let alias_naive = tone_amplitude(&naive[16..966], 250.0, 30.0);
        assert!(alias_naive > 0.9, "naive alias {alias_naive}");
        assert!(alias_filtered < 0.01, "filtered alias {alias_filtered}");
    }

    #[test]
    fn filtered_values_do_not_depend_on_tiling() {
        let source = Arc::new(sine_source(500.0, 50_000, 3.0));
        let small = ResolutionCache::new(source.clone(), config(64, 1 << 22, 0)).unwrap();
        let large = ResolutionCache::new(source, config(100_000, 1 << 22, 0)).unwrap();
        let range = TimeRange::new(3.3, 71.7);
        let a = small.get_view(range, 500, &[0]).unwrap().window;
        let b = large.get_view(range, 500, &[0]).unwrap().window;
        assert_eq!(a.factor(), 64);
        assert_eq!(a.first_bucket(), b.first_bucket());
        assert_eq!(a.values(), b.values());
    }

    #[test]
    fn overlapping_requests_share_identical_samples() {
        let source = Arc::new(sine_source(200.0, 200 * 600, 7.0));
        let cache = ResolutionCache::new(source, config(128, 1 << 22, 0)).unwrap();
        let a = cache
            .get_view(TimeRange::new(0.0, 40.0), 400, &[0])
            .unwrap()
            .window;
        let b = cache
            .get_view(TimeRange::new(21.3, 61.3), 400, &[0])
            .unwrap()
            .window;
        assert_eq!(a.factor(), b.factor());
        let offset = (b.first_bucket() - a.first_bucket()) as usize;
        let shared_rows = a.len() - offset;
        assert!(shared_rows > 100);
        let a_tail = a.values().slice(s![offset.., ..]);
        let b_head = b.values().slice(s![..shared_rows, ..]);
        assert_eq!(a_tail, b_head);
    }

    #[test]
    fn envelope_tier_keeps_a_single_sample_spike() {
        let mut samples = vec![0.0f32; 256 * 64];
        samples[5000] = 100.0;
        let source = ArraySource::from_channels(256.0, &[samples]).unwrap();
        let cache = ResolutionCache::new(Arc::new(source), config(32, 1 << 20, 0)).unwrap();
        let window = cache
            .get_view(TimeRange::new(0.0, 64.0), 64, &[0])
            .unwrap()
            .window;
        assert_eq!(window.reduction(), Reduction::Envelope);
        assert_eq!(window.factor(), 256);
        assert_eq!(window.len(), 128);
        let column = window.column(0).unwrap();
        assert_eq!(column[2 * (5000 / 256) + 1], 100.0);
        assert_eq!(column.iter().filter(|&&v| v != 0.0).count(), 1);
    }

    #[test]
    fn concurrent_misses_build_once() {
        let counted = CountingSource::new(sine_source(100.0, 1000, 1.0));
        counted.delay_ms.store(20, Ordering::SeqCst);
        let cache = Arc::new(
            ResolutionCache::new(counted.clone(), config(1000, 1 << 20, 0)).unwrap(),
        );
        let barrier = Arc::new(Barrier::new(8));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cache = cache.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    cache.get_view(TimeRange::new(0.0, 10.0), 1000, &[0]).unwrap()
                })
            })
            .collect();
        let views: Vec<CachedView> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(counted.reads(), 1);
        assert!(views.iter().all(|v| v.window.values() == views[0].window.values()));
        assert_eq!(cache.stats().builds, 1);
    }

    #[test]
    fn eviction_respects_budget_and_pins() {
        let source = Arc::new(sine_source(100.0, 10_000, 1.0));
        let cache = ResolutionCache::new(source, config(100, 300, 0)).unwrap();
        let pinned = cache
            .tile(TierKey::new(Reduction::Native, 1, 0))
            .unwrap();
        for tile in 1..10 {
            cache.tile(TierKey::new(Reduction::Native, 1, tile)).unwrap();
            assert!(cache.is_resident(&pinned.key));
        }
        let stats = cache.stats();
        assert!(stats.total_samples <= stats.budget_samples);
        assert!(!cache.is_resident(&TierKey::new(Reduction::Native, 1, 1)));
        drop(pinned);
    }

    #[test]
    fn ranges_past_the_end_are_clipped() {
        let cache =
            ResolutionCache::new(Arc::new(sine_source(100.0, 1000, 1.0)), config(256, 1 << 20, 0))
                .unwrap();
        let view = cache
            .get_view(TimeRange::new(-2.0, 5.0), 2000, &[0])
            .unwrap();
        let clipped = view.clipped.unwrap();
        assert_eq!(clipped.served, TimeRange::new(0.0, 5.0));
        assert_eq!(view.window.len(), 500);

        let view = cache.get_view(TimeRange::new(8.0, 12.0), 2000, &[0]).unwrap();
        assert_eq!(view.clipped.unwrap().served, TimeRange::new(8.0, 10.0));
        assert!(cache
            .get_view(TimeRange::new(0.0, 10.0), 2000, &[0])
            .unwrap()
            .clipped
            .is_none());

        assert!(matches!(
            cache.get_view(TimeRange::new(11.0, 12.0), 100, &[0]),
            Err(EngineError::OutOfRange { .. })
        ));
        assert!(matches!(
            cache.get_view(TimeRange::new(3.0, 1.0), 100, &[0]),
            Err(EngineError::InvalidRange { .. })
        ));
        assert_eq!(
            cache.get_view(TimeRange::new(0.0, 1.0), 0, &[0]).unwrap_err(),
            EngineError::InvalidPointBudget
        );
        assert_eq!(
            cache.get_view(TimeRange::new(0.0, 1.0), 10, &[3]).unwrap_err(),
            EngineError::UnknownChannel(3)
        );
    }

    #[test]
    fn lost_source_fails_every_read_until_reattached() {
        let counted = CountingSource::new(sine_source(100.0, 1000, 1.0));
        let events = EventBus::new();
        let rx = events.subscribe();
        let cache =
            ResolutionCache::with_events(counted.clone(), config(100, 1 << 20, 0), events).unwrap();
        cache.get_view(TimeRange::new(0.0, 1.0), 100, &[0]).unwrap();

        counted.failing.store(true, Ordering::SeqCst);
        let err = cache
            .get_view(TimeRange::new(5.0, 6.0), 100, &[0])
            .unwrap_err();
        assert!(matches!(err, EngineError::SourceUnavailable(_)));
        counted.failing.store(false, Ordering::SeqCst);
        // Resident tiles are no longer served either.
        assert!(matches!(
            cache.get_view(TimeRange::new(0.0, 1.0), 100, &[0]),
            Err(EngineError::SourceUnavailable(_))
        ));
        assert!(cache
            .cached_view(TimeRange::new(0.0, 1.0), 100, &[0])
            .is_some());
        assert!(rx
            .try_iter()
            .any(|e| matches!(e, EngineEvent::SourceUnavailable(_))));

        cache.reattach(counted.clone()).unwrap();
        assert!(cache.unavailable_reason().is_none());
        assert!(cache.get_view(TimeRange::new(5.0, 6.0), 100, &[0]).is_ok());
        assert_eq!(cache.stats().epoch, 1);
        assert!(rx.try_iter().any(|e| e == EngineEvent::SourceReattached));
    }

    #[test]
    fn uncached_reads_bypass_the_tier_table() {
        let counted = CountingSource::new(sine_source(100.0, 1000, 1.0));
        let events = EventBus::new();
        let rx = events.subscribe();
        let cache =
            ResolutionCache::with_events(counted.clone(), config(100, 1 << 20, 0), events).unwrap();
        let window = cache.read_uncached(250, 2000, &[0]).unwrap();
        assert_eq!(window.start_sample(), 250);
        assert_eq!(window.end_sample(), 1000);
        assert_eq!(
            window.column(0).unwrap()[0],
            counted.inner.data().column(0)[250]
        );
        let stats = cache.stats();
        assert_eq!((stats.tiles, stats.builds), (0, 0));
        assert!(matches!(
            cache.read_uncached(0, 10, &[3]),
            Err(EngineError::UnknownChannel(3))
        ));

        counted.failing.store(true, Ordering::SeqCst);
        assert!(matches!(
            cache.read_uncached(0, 10, &[0]),
            Err(EngineError::SourceUnavailable(_))
        ));
        counted.failing.store(false, Ordering::SeqCst);
        assert!(cache.unavailable_reason().is_some());
        assert!(rx
            .try_iter()
            .any(|e| matches!(e, EngineEvent::SourceUnavailable(_))));
    }

    #[test]
    fn slow_builds_serve_a_coarser_resident_tier() {
        let counted = CountingSource::new(sine_source(1000.0, 64_000, 5.0));
        let events = EventBus::new();
        let rx = events.subscribe();
        // Only room for the coarse overview once it is built.
        let cache =
            ResolutionCache::with_events(counted.clone(), config(1000, 1000, 1), events).unwrap();
        let overview = cache
            .get_view(TimeRange::new(0.0, 64.0), 1000, &[0])
            .unwrap();
        assert_eq!(overview.window.factor(), 64);
        while rx.try_recv().is_ok() {}

        counted.delay_ms.store(200, Ordering::SeqCst);
        let range = TimeRange::new(10.0, 12.0);
        let quick = cache
            .request_view(range, 2000, &[0], Duration::from_millis(10))
            .unwrap();
        assert!(quick.provisional);
        assert_eq!(quick.window.factor(), 64);

        let full = cache.get_view(range, 2000, &[0]).unwrap();
        assert!(!full.provisional);
        assert_eq!(full.window.factor(), 1);
        assert_eq!(full.window.len(), 2000);
        assert!(rx
            .recv_timeout(Duration::from_secs(5))
            .is_ok_and(|e| matches!(e, EngineEvent::TierReady { factor: 1, .. })));
    }

    #[test]
    fn superseded_queued_builds_are_cancelled() {
        let counted = CountingSource::new(sine_source(100.0, 1000, 1.0));
        let cache = ResolutionCache::new(counted.clone(), config(100, 1 << 20, 0)).unwrap();
        let key = TierKey::new(Reduction::Native, 1, 3);
        let Ok(Acquire::Owner(flight)) = cache.shared.acquire(key) else {
            panic!("expected a fresh flight");
        };
        cache.supersede();
        cache.shared.run_job(BuildJob {
            key,
            flight: flight.clone(),
        });
        assert_eq!(flight.wait().unwrap_err(), EngineError::BuildCancelled);
        assert_eq!(counted.reads(), 0);
        assert_eq!(cache.stats().in_flight, 0);
        // A later request simply builds it.
        assert_eq!(cache.tile(key).unwrap().first_bucket, 300);
        assert_eq!(counted.reads(), 1);
    }

    #[test]
    fn level_selection_stays_within_ratio_of_budget() {
        let cache = ResolutionCache::new(
            Arc::new(sine_source(1000.0, 1_000_000, 1.0)),
            config(2048, 1 << 22, 0),
        )
        .unwrap();
        let cases = [
            (1.0, 1000),
            (10.0, 1000),
            (100.0, 800),
            (100.0, 200),
            (300.0, 500),
            (1000.0, 1500),
            (1000.0, 1000),
            (1000.0, 300),
        ];
        for (seconds, budget) in cases {
            let range = TimeRange::new(0.0, seconds);
            let factor = cache.factor_for(range, budget).unwrap();
            let window = cache.get_view(range, budget, &[0]).unwrap().window;
            assert_eq!(window.factor(), factor);
            let rows = window.len();
            assert!(rows >= budget || factor == 1, "{rows} rows for {seconds} s @ {budget}");
            assert!(rows < budget * 4, "{rows} rows for {seconds} s @ {budget}");
        }
        // Envelope rows come in min/max pairs.
        let window = cache
            .get_view(TimeRange::new(0.0, 1000.0), 1000, &[0])
            .unwrap()
            .window;
        assert_eq!(window.reduction(), Reduction::Envelope);
        assert_eq!(window.factor(), 1024);
        assert_eq!(window.len(), 2 * 977);
    }
}
