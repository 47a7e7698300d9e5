use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};

pub const DEFAULT_COLOR: [u8; 3] = [255, 200, 0];

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Annotation {
    pub id: u64,
    pub start_sample: u64,
    pub end_sample: u64,
    pub label: String,
    pub description: String,
    pub color: [u8; 3],
    pub confidence: f32,
}

impl Annotation {
    pub fn is_point(&self) -> bool {
        self.start_sample == self.end_sample
    }

    /// Half-open overlap with `[start, end)`; a zero-length annotation is a point at its start.
    pub fn overlaps(&self, start: u64, end: u64) -> bool {
        if self.is_point() {
            start <= self.start_sample && self.start_sample < end
        } else {
            self.start_sample < end && start < self.end_sample
        }
    }
}

/// Annotation without an identity, as exchanged with whoever persists them.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AnnotationRecord {
    pub start_sample: u64,
    pub end_sample: u64,
    pub label: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_color")]
    pub color: [u8; 3],
    #[serde(default = "default_confidence")]
    pub confidence: f32,
}

fn default_color() -> [u8; 3] {
    DEFAULT_COLOR
}

fn default_confidence() -> f32 {
    1.0
}

impl AnnotationRecord {
    pub fn new(start_sample: u64, end_sample: u64, label: impl Into<String>) -> Self {
        Self {
            start_sample,
            end_sample,
            label: label.into(),
            description: String::new(),
            color: DEFAULT_COLOR,
            confidence: 1.0,
        }
    }
}

impl From<&Annotation> for AnnotationRecord {
    fn from(a: &Annotation) -> Self {
        Self {
            start_sample: a.start_sample,
            end_sample: a.end_sample,
            label: a.label.clone(),
            description: a.description.clone(),
            color: a.color,
            confidence: a.confidence,
        }
    }
}

fn check_range(start: u64, end: u64) -> Result<()> {
    if end < start {
        return Err(EngineError::InvalidRange {
            start: start as f64,
            end: end as f64,
        });
    }
    Ok(())
}

/// Time-ranged labels ordered by start sample, then by insertion.
#[derive(Clone, Debug, Default)]
pub struct AnnotationStore {
    ordered: BTreeMap<(u64, u64), Annotation>, // (start_sample, id)
    starts: HashMap<u64, u64>,                 // id -> start_sample
    next_id: u64,
}

impl AnnotationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.ordered.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ordered.is_empty()
    }

    pub fn add(&mut self, start_sample: u64, end_sample: u64, label: impl Into<String>) -> Result<u64> {
        self.add_record(AnnotationRecord::new(start_sample, end_sample, label))
    }

    pub fn add_record(&mut self, record: AnnotationRecord) -> Result<u64> {
        check_range(record.start_sample, record.end_sample)?;
        let id = self.next_id;
        self.next_id += 1;
        let annotation = Annotation {
            id,
            start_sample: record.start_sample,
            end_sample: record.end_sample,
            label: record.label,
            description: record.description,
            color: record.color,
            confidence: record.confidence.clamp(0.0, 1.0),
        };
        self.starts.insert(id, annotation.start_sample);
        self.ordered.insert((annotation.start_sample, id), annotation);
        Ok(id)
    }

    pub fn get(&self, id: u64) -> Option<&Annotation> {
        let start = self.starts.get(&id)?;
        self.ordered.get(&(*start, id))
    }

    fn get_mut(&mut self, id: u64) -> Result<&mut Annotation> {
        let start = *self
            .starts
            .get(&id)
            .ok_or(EngineError::UnknownAnnotation(id))?;
        self.ordered
            .get_mut(&(start, id))
            .ok_or(EngineError::UnknownAnnotation(id))
    }

    /// Annotations intersecting `[start, end)`, ascending by start then insertion.
    pub fn query(&self, start: u64, end: u64) -> Result<Vec<&Annotation>> {
        check_range(start, end)?;
        if start == end {
            return Ok(Vec::new());
        }
        Ok(self
            .ordered
            .range(..(end, 0))
            .map(|(_, a)| a)
            .filter(|a| a.overlaps(start, end))
            .collect())
    }

    pub fn iter(&self) -> impl Iterator<Item = &Annotation> {
        self.ordered.values()
    }

    pub fn resize(&mut self, id: u64, start_sample: u64, end_sample: u64) -> Result<()> {
        check_range(start_sample, end_sample)?;
        let old_start = *self
            .starts
            .get(&id)
            .ok_or(EngineError::UnknownAnnotation(id))?;
        let Some(mut annotation) = self.ordered.remove(&(old_start, id)) else {
            return Err(EngineError::UnknownAnnotation(id));
        };
        annotation.start_sample = start_sample;
        annotation.end_sample = end_sample;
        self.starts.insert(id, start_sample);
        self.ordered.insert((start_sample, id), annotation);
        Ok(())
    }

    pub fn remove(&mut self, id: u64) -> Result<Annotation> {
        let start = self
            .starts
            .remove(&id)
            .ok_or(EngineError::UnknownAnnotation(id))?;
        self.ordered
            .remove(&(start, id))
            .ok_or(EngineError::UnknownAnnotation(id))
    }

    pub fn relabel(&mut self, id: u64, label: impl Into<String>) -> Result<()> {
        self.get_mut(id)?.label = label.into();
        Ok(())
    }

    pub fn set_details(
        &mut self,
        id: u64,
        description: impl Into<String>,
        color: [u8; 3],
        confidence: f32,
    ) -> Result<()> {
        let annotation = self.get_mut(id)?;
        annotation.description = description.into();
        annotation.color = color;
        annotation.confidence = confidence.clamp(0.0, 1.0);
        Ok(())
    }

    pub fn clear(&mut self) {
        self.ordered.clear();
        self.starts.clear();
    }

    pub fn to_records(&self) -> Vec<AnnotationRecord> {
        self.iter().map(AnnotationRecord::from).collect()
    }

    /// Builds a store from persisted records; nothing is kept if any record is invalid.
    pub fn from_records(records: impl IntoIterator<Item = AnnotationRecord>) -> Result<Self> {
        let mut store = Self::new();
        for record in records {
            store.add_record(record)?;
        }
        Ok(store)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(found: Vec<&Annotation>) -> Vec<&str> {
        found.into_iter().map(|a| a.label.as_str()).collect()
    }

    #[test]
    fn query_orders_by_start_then_insertion() {
        let mut store = AnnotationStore::new();
        store.add(500, 900, "late").unwrap();
        store.add(100, 200, "first").unwrap();
        store.add(100, 150, "second").unwrap();
        store.add(0, 100, "touching").unwrap();
        store.add(950, 1000, "outside").unwrap();
        let found = store.query(100, 600).unwrap();
        assert_eq!(labels(found), vec!["first", "second", "late"]);
    }

    #[test]
    fn half_open_bounds_and_points() {
        let mut store = AnnotationStore::new();
        store.add(10, 20, "span").unwrap();
        store.add(30, 30, "point").unwrap();
        assert!(store.query(20, 30).unwrap().is_empty());
        assert_eq!(labels(store.query(19, 20).unwrap()), vec!["span"]);
        assert_eq!(labels(store.query(30, 31).unwrap()), vec!["point"]);
        assert!(store.query(25, 25).unwrap().is_empty());
    }

    #[test]
    fn reversed_range_leaves_store_untouched() {
        let mut store = AnnotationStore::new();
        let id = store.add(5, 10, "keep").unwrap();
        assert!(matches!(
            store.add(10, 5, "bad"),
            Err(EngineError::InvalidRange { .. })
        ));
        assert!(store.resize(id, 8, 2).is_err());
        assert_eq!(store.len(), 1);
        assert_eq!(store.get(id).unwrap().start_sample, 5);
        // The failed add did not burn an id either.
        assert_eq!(store.add(0, 1, "next").unwrap(), id + 1);
    }

    #[test]
    fn resize_reorders_but_keeps_insertion_rank() {
        let mut store = AnnotationStore::new();
        let a = store.add(50, 60, "a").unwrap();
        store.add(10, 20, "b").unwrap();
        store.resize(a, 10, 12).unwrap();
        assert_eq!(labels(store.query(0, 100).unwrap()), vec!["a", "b"]);
        assert_eq!(store.remove(a).unwrap().label, "a");
        assert_eq!(store.remove(a).unwrap_err(), EngineError::UnknownAnnotation(a));
        assert_eq!(labels(store.query(0, 100).unwrap()), vec!["b"]);
    }

    #[test]
    fn records_round_trip_through_json() {
        let mut store = AnnotationStore::new();
        let id = store.add(1, 4, "spike").unwrap();
        store.set_details(id, "sharp wave", [255, 0, 0], 1.7).unwrap();
        let json = serde_json::to_string(&store.to_records()).unwrap();
        let records: Vec<AnnotationRecord> = serde_json::from_str(&json).unwrap();
        let restored = AnnotationStore::from_records(records).unwrap();
        let back = restored.iter().next().unwrap();
        assert_eq!(back.description, "sharp wave");
        assert_eq!(back.confidence, 1.0);

        let minimal: AnnotationRecord =
            serde_json::from_str(r#"{"start_sample":3,"end_sample":9,"label":"x"}"#).unwrap();
        assert_eq!(minimal.color, DEFAULT_COLOR);
    }
}
