//! Streaming multi-resolution cache and render-state engine for long multi-channel recordings.
//!
//! A [`ResolutionCache`] keeps decimated tiers of a [`SampleSource`] so any window can be served
//! without touching the whole recording, [`RenderState`] turns a served window into stacked
//! plot coordinates, and [`Engine`] ties both to trigger detection and annotations.

pub mod annotations;
pub mod cache;
pub mod config;
pub mod engine;
pub mod error;
pub mod navigation;
pub mod render;
pub mod signal;
pub mod trigger;
pub mod types;

pub use annotations::{Annotation, AnnotationRecord, AnnotationStore};
pub use cache::{CacheStats, CachedView, RangeClipped, ResolutionCache, TierKey};
pub use config::{CacheConfig, EngineConfig, RenderConfig};
pub use engine::Engine;
pub use error::{EngineError, Result};
pub use navigation::Viewport;
pub use render::{ChannelTrace, RenderLayout, RenderState};
pub use signal::{ArraySource, Pipeline, ProcessingStage, SampleSource, SampleWindow, TimeRange};
pub use trigger::{TriggerDetector, TriggerEvent};
pub use types::{EngineCommand, EngineEvent, EventBus};
