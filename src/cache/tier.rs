use std::sync::Arc;

use lru::LruCache;
use ndarray::Array2;

use crate::signal::window::Reduction;

/// Identity of one cached tile: `tile` indexes runs of `tile_len` buckets at `factor`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TierKey {
    pub reduction: Reduction,
    pub factor: u64,
    pub tile: u64,
}

impl TierKey {
    pub fn new(reduction: Reduction, factor: u64, tile: u64) -> Self {
        Self {
            reduction,
            factor,
            tile,
        }
    }
}

/// Immutable block of one tier for every channel of the source.
#[derive(Debug)]
pub struct Tile {
    pub key: TierKey,
    /// First bucket (in units of `key.factor` native samples) held by the tile.
    pub first_bucket: u64,
    pub values: Array2<f32>, // rows x channels
}

impl Tile {
    pub fn buckets(&self) -> u64 {
        (self.values.nrows() / self.key.reduction.rows_per_bucket()) as u64
    }

    pub fn end_bucket(&self) -> u64 {
        self.first_bucket + self.buckets()
    }

    /// Sample values held, which is what the cache budget counts.
    pub fn cost(&self) -> usize {
        self.values.len()
    }
}

/// LRU-ordered table of built tiles, bounded by total sample values.
pub struct TierTable {
    tiles: LruCache<TierKey, Arc<Tile>>,
    budget: usize,
    total: usize,
}

impl TierTable {
    pub fn new(budget: usize) -> Self {
        Self {
            tiles: LruCache::unbounded(),
            budget,
            total: 0,
        }
    }

    /// Looks up and marks the tile as recently used.
    pub fn get(&mut self, key: &TierKey) -> Option<Arc<Tile>> {
        self.tiles.get(key).cloned()
    }

    pub fn peek(&self, key: &TierKey) -> Option<Arc<Tile>> {
        self.tiles.peek(key).cloned()
    }

    pub fn contains(&self, key: &TierKey) -> bool {
        self.tiles.contains(key)
    }

    pub fn insert(&mut self, tile: Arc<Tile>) {
        self.total += tile.cost();
        if let Some(old) = self.tiles.put(tile.key, tile) {
            self.total -= old.cost();
        }
    }

    /// Drops least-recently-used tiles until the budget holds.
    ///
    /// A tile whose `Arc` is held anywhere else (an in-flight read or assembly) is skipped,
    /// so the total may stay above budget while readers hold pins.
    pub fn evict_to_budget(&mut self) -> Vec<TierKey> {
        let mut evicted = Vec::new();
        while self.total > self.budget {
            let victim = self
                .tiles
                .iter()
                .rev()
                .find(|(_, tile)| Arc::strong_count(tile) == 1)
                .map(|(key, _)| *key);
            let Some(key) = victim else {
                break;
            };
            if let Some(tile) = self.tiles.pop(&key) {
                self.total -= tile.cost();
                evicted.push(key);
            }
        }
        evicted
    }

    pub fn clear(&mut self) {
        self.tiles.clear();
        self.total = 0;
    }

    pub fn total_samples(&self) -> usize {
        self.total
    }

    pub fn budget(&self) -> usize {
        self.budget
    }

    pub fn len(&self) -> usize {
        self.tiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tiles.is_empty()
    }
}
