use std::collections::HashMap;

use dvt_error::{ErrorRecord, WarningRecord};
use strum_macros::Display;
use tokio::sync::mpsc;

/// The three import phases, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum Phase {
    #[strum(serialize = "entity import")]
    EntityImport,
    #[strum(serialize = "deferred fields")]
    DeferredFields,
    #[strum(serialize = "relationships")]
    Relationships,
}

/// Events flowing from the executor/orchestrator to the run's consumers.
#[derive(Debug, Clone)]
pub enum ProgressEvent {
    PhaseStart(Phase),
    PhaseEnd(Phase),
    TierStart { tier: usize, entities: Vec<String> },
    TierEnd { tier: usize },
    EntityProgress { entity: String, processed: usize, total: usize, rps: f64 },
    Warning(WarningRecord),
    ErrorSample(ErrorRecord),
    Complete { success: bool },
}

impl ProgressEvent {
    /// Coalescable events may be replaced by a newer event with the same key
    /// when the consumer lags. Terminal and error events never coalesce.
    fn coalesce_key(&self) -> Option<&str> {
        match self {
            ProgressEvent::EntityProgress { entity, .. } => Some(entity.as_str()),
            _ => None,
        }
    }
}

/// Multi-producer event sink. Emission never blocks the producer.
pub trait ProgressSink: Send + Sync {
    fn emit(&self, event: ProgressEvent);
}

/// Sink that drops everything.
pub struct NullSink;

impl ProgressSink for NullSink {
    fn emit(&self, _event: ProgressEvent) {}
}

/// Sink backed by an unbounded channel; pairs with [ProgressReceiver].
#[derive(Clone)]
pub struct ChannelSink {
    sender: mpsc::UnboundedSender<ProgressEvent>,
}

impl ProgressSink for ChannelSink {
    fn emit(&self, event: ProgressEvent) {
        // A dropped receiver means the consumer is gone; nothing to do.
        let _ = self.sender.send(event);
    }
}

/// Consumer half of the progress stream.
pub struct ProgressReceiver {
    receiver: mpsc::UnboundedReceiver<ProgressEvent>,
}

pub fn progress_channel() -> (ChannelSink, ProgressReceiver) {
    let (sender, receiver) = mpsc::unbounded_channel();
    (ChannelSink { sender }, ProgressReceiver { receiver })
}

impl ProgressReceiver {
    /// Waits for at least one event, then drains whatever else is pending
    /// and coalesces per-entity progress updates down to the newest one.
    /// Returns `None` once all senders are gone and the queue is empty.
    pub async fn next_batch(&mut self) -> Option<Vec<ProgressEvent>> {
        let first = self.receiver.recv().await?;
        let mut pending = vec![first];
        while let Ok(event) = self.receiver.try_recv() {
            pending.push(event);
        }
        Some(coalesce(pending))
    }

    /// Non-blocking drain, coalesced the same way.
    pub fn drain(&mut self) -> Vec<ProgressEvent> {
        let mut pending = Vec::new();
        while let Ok(event) = self.receiver.try_recv() {
            pending.push(event);
        }
        coalesce(pending)
    }
}

/// Keeps only the newest `EntityProgress` per entity, preserving the order
/// of everything else.
fn coalesce(events: Vec<ProgressEvent>) -> Vec<ProgressEvent> {
    let mut newest: HashMap<String, usize> = HashMap::new();
    for (index, event) in events.iter().enumerate() {
        if let Some(key) = event.coalesce_key() {
            newest.insert(key.to_string(), index);
        }
    }
    events
        .into_iter()
        .enumerate()
        .filter(|(index, event)| match event.coalesce_key() {
            Some(key) => newest[key] == *index,
            None => true,
        })
        .map(|(_, event)| event)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn progress(entity: &str, processed: usize) -> ProgressEvent {
        ProgressEvent::EntityProgress {
            entity: entity.to_string(),
            processed,
            total: 100,
            rps: 0.0,
        }
    }

    #[tokio::test]
    async fn test_coalesces_stale_progress() {
        let (sink, mut receiver) = progress_channel();
        sink.emit(ProgressEvent::PhaseStart(Phase::EntityImport));
        sink.emit(progress("account", 10));
        sink.emit(progress("contact", 5));
        sink.emit(progress("account", 20));
        sink.emit(ProgressEvent::PhaseEnd(Phase::EntityImport));

        let batch = receiver.next_batch().await.unwrap();
        assert_eq!(batch.len(), 4);
        assert!(matches!(batch[0], ProgressEvent::PhaseStart(Phase::EntityImport)));
        assert!(matches!(
            &batch[1],
            ProgressEvent::EntityProgress { entity, processed: 5, .. } if entity == "contact"
        ));
        assert!(matches!(
            &batch[2],
            ProgressEvent::EntityProgress { entity, processed: 20, .. } if entity == "account"
        ));
        assert!(matches!(batch[3], ProgressEvent::PhaseEnd(Phase::EntityImport)));
    }

    #[tokio::test]
    async fn test_errors_and_warnings_never_coalesce() {
        let (sink, mut receiver) = progress_channel();
        for i in 0..3 {
            sink.emit(ProgressEvent::ErrorSample(ErrorRecord::new(
                "account",
                format!("error {i}"),
            )));
            sink.emit(ProgressEvent::Warning(WarningRecord::new(
                "BulkNotSupported",
                format!("warning {i}"),
            )));
        }
        let batch = receiver.next_batch().await.unwrap();
        assert_eq!(batch.len(), 6);
    }

    #[tokio::test]
    async fn test_receiver_ends_when_senders_drop() {
        let (sink, mut receiver) = progress_channel();
        sink.emit(ProgressEvent::Complete { success: true });
        drop(sink);
        assert!(receiver.next_batch().await.is_some());
        assert!(receiver.next_batch().await.is_none());
    }

    #[test]
    fn test_phase_names() {
        assert_eq!(Phase::EntityImport.to_string(), "entity import");
        assert_eq!(Phase::DeferredFields.to_string(), "deferred fields");
        assert_eq!(Phase::Relationships.to_string(), "relationships");
    }
}
