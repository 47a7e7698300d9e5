// src/types.rs
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, PoisonError};

use crate::signal::transform::Pipeline;

// UI 发给引擎的命令 (单向)
#[derive(Clone, Debug)]
pub enum EngineCommand {
    SetChannelScale { channel: usize, factor: f32 },
    ClearChannelScale(usize),
    SetBaseScale(f32),
    SetBad { channel: usize, bad: bool },
    SetVisible { channel: usize, visible: bool },
    SelectChannels(Vec<usize>),
    SetPipeline(Pipeline),
    AddAnnotation { start_sample: u64, end_sample: u64, label: String },
    ResizeAnnotation { id: u64, start_sample: u64, end_sample: u64 },
    RemoveAnnotation(u64),
    ResetDetector,
}

// 引擎发给 UI 的通知
#[derive(Clone, Debug, PartialEq)]
pub enum EngineEvent {
    /// Selection, scales, flags or the pipeline changed; the current layout is out of date.
    LayoutInvalidated,
    /// A tier tile finished building in the background and covers these native samples.
    TierReady {
        factor: u64,
        start_sample: u64,
        end_sample: u64,
    },
    AnnotationsChanged,
    SourceUnavailable(String),
    SourceReattached,
}

/// Fan-out of engine events to any number of subscribers.
#[derive(Clone, Default)]
pub struct EventBus {
    subscribers: Arc<Mutex<Vec<Sender<EngineEvent>>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> Receiver<EngineEvent> {
        let (tx, rx) = mpsc::channel();
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(tx);
        rx
    }

    /// Sends to every live subscriber and forgets the ones whose receiver is gone.
    pub fn emit(&self, event: EngineEvent) {
        let mut subscribers = self
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dropped_subscribers_are_pruned() {
        let bus = EventBus::new();
        let kept = bus.subscribe();
        drop(bus.subscribe());
        bus.emit(EngineEvent::AnnotationsChanged);
        assert_eq!(bus.subscriber_count(), 1);
        assert_eq!(kept.try_recv().unwrap(), EngineEvent::AnnotationsChanged);
        assert!(kept.try_recv().is_err());
    }
}
