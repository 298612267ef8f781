//! Progress/log fan-out and the cooperative cancel flag

use liboxidisk::{EngineEvent, LogEvent, OpPhase, ProgressEvent};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::trace;

/// Events kept for lagging subscribers before the oldest are dropped.
const WINDOW: usize = 256;

/// Process-wide event bus. Writers are the engine components; readers are
/// IPC subscribers and tests. Readers may be absent.
#[derive(Clone)]
pub struct Bus {
    tx: broadcast::Sender<EngineEvent>,
    cancel: Arc<AtomicBool>,
    high_water: Arc<AtomicU64>,
}

impl Bus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(WINDOW);
        Self {
            tx,
            cancel: Arc::new(AtomicBool::new(false)),
            high_water: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }

    /// Emit a progress tick. The byte counter is clamped so consumers
    /// always observe a monotone sequence, whatever a parser produced.
    pub fn progress(&self, mut event: ProgressEvent) {
        if let Some(bytes) = event.bytes {
            let prev = self.high_water.fetch_max(bytes, Ordering::Relaxed);
            if bytes < prev {
                event.bytes = Some(prev);
            }
        }
        trace!(percent = event.percent, bytes = ?event.bytes, "progress");
        let _ = self.tx.send(EngineEvent::Progress(event));
    }

    pub fn log(&self, source: &str, line: impl Into<String>) {
        let _ = self.tx.send(EngineEvent::Log(LogEvent {
            source: source.to_string(),
            line: line.into(),
        }));
    }

    /// Request cooperative cancellation of the active operation.
    pub fn request_cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    pub fn cancel_requested(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    /// Called by the dispatcher at operation start; a cancel issued while
    /// no operation is active must not leak into the next one.
    pub fn begin_operation(&self) {
        self.cancel.store(false, Ordering::SeqCst);
        self.high_water.store(0, Ordering::SeqCst);
    }

    /// Terminal tick for a finished, failed, or cancelled operation.
    pub fn finish(&self, phase: OpPhase, message: impl Into<String>) {
        let percent = if phase == OpPhase::Completed { 100 } else { 0 };
        let _ = self.tx.send(EngineEvent::Progress(
            ProgressEvent::percent(percent).phase(phase).message(message),
        ));
    }
}

impl Default for Bus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bytes_monotone() {
        let bus = Bus::new();
        let mut rx = bus.subscribe();
        bus.begin_operation();

        bus.progress(ProgressEvent::percent(10).bytes(100, 1000));
        bus.progress(ProgressEvent::percent(20).bytes(50, 1000));

        let first = match rx.try_recv().unwrap() {
            EngineEvent::Progress(p) => p.bytes.unwrap(),
            _ => panic!("expected progress"),
        };
        let second = match rx.try_recv().unwrap() {
            EngineEvent::Progress(p) => p.bytes.unwrap(),
            _ => panic!("expected progress"),
        };
        assert_eq!(first, 100);
        assert_eq!(second, 100);
    }

    #[test]
    fn test_cancel_reset_between_operations() {
        let bus = Bus::new();
        bus.request_cancel();
        assert!(bus.cancel_requested());
        bus.begin_operation();
        assert!(!bus.cancel_requested());
    }

    #[test]
    fn test_emit_without_readers() {
        let bus = Bus::new();
        // Must not error when nobody subscribed.
        bus.log("engine", "hello");
        bus.progress(ProgressEvent::percent(1));
    }
}
