//! Ordered, replayable progress events.
//!
//! Every event a session emits is kept in its history and fanned out to live
//! subscribers. A late subscriber first replays the history and then follows
//! the live stream, so it sees the same sequence as an early one. Subscribers
//! may disconnect at any time without affecting the transfer.

use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::watch;

use crate::controller::ControllerEvent;
use crate::profile::ConnectionClass;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TransferEvent {
    Started {
        key: String,
        size_bytes: u64,
        profile: ConnectionClass,
        chunk_bytes: u64,
        parallelism: usize,
    },
    MultipartStarted {
        key: String,
        upload_id: String,
    },
    PartCompleted {
        part_number: u32,
        bytes: u64,
        mib_per_sec: f64,
        uploaded_bytes: u64,
        total_bytes: u64,
    },
    Strategy(ControllerEvent),
    Completed {
        key: String,
        parts: u32,
        bytes: u64,
        elapsed_ms: u64,
        location: Option<String>,
    },
    Error {
        message: String,
        aborted: bool,
    },
}

impl TransferEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TransferEvent::Completed { .. } | TransferEvent::Error { .. })
    }
}

pub struct EventStream {
    history: Arc<Mutex<Vec<TransferEvent>>>,
    /// Number of events emitted so far; wakes subscribers.
    emitted: watch::Sender<usize>,
}

impl Default for EventStream {
    fn default() -> Self {
        Self::new()
    }
}

impl EventStream {
    pub fn new() -> Self {
        let (emitted, _) = watch::channel(0);
        Self {
            history: Arc::new(Mutex::new(Vec::new())),
            emitted,
        }
    }

    pub fn emit(&self, event: TransferEvent) {
        let mut history = self.history.lock();
        history.push(event);
        self.emitted.send_replace(history.len());
    }

    /// Replay everything emitted so far, then follow live events.
    pub fn subscribe(&self) -> EventSubscription {
        EventSubscription {
            history: Arc::clone(&self.history),
            cursor: 0,
            emitted: self.emitted.subscribe(),
        }
    }

    pub fn history(&self) -> Vec<TransferEvent> {
        self.history.lock().clone()
    }
}

/// Reads the shared history at its own pace, so a slow subscriber falls
/// behind but never skips an event.
pub struct EventSubscription {
    history: Arc<Mutex<Vec<TransferEvent>>>,
    cursor: usize,
    emitted: watch::Receiver<usize>,
}

impl EventSubscription {
    /// Next event, or `None` once the stream is closed and drained.
    pub async fn next(&mut self) -> Option<TransferEvent> {
        loop {
            if let Some(event) = self.take_next() {
                return Some(event);
            }
            let cursor = self.cursor;
            if self.emitted.wait_for(|emitted| *emitted > cursor).await.is_err() {
                return self.take_next();
            }
        }
    }

    fn take_next(&mut self) -> Option<TransferEvent> {
        let event = self.history.lock().get(self.cursor).cloned()?;
        self.cursor += 1;
        Some(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn part(n: u32) -> TransferEvent {
        TransferEvent::PartCompleted {
            part_number: n,
            bytes: 10,
            mib_per_sec: 1.0,
            uploaded_bytes: 10 * n as u64,
            total_bytes: 100,
        }
    }

    #[tokio::test]
    async fn late_subscriber_replays_history_then_live() {
        let stream = EventStream::new();
        stream.emit(part(1));
        stream.emit(part(2));

        let mut sub = stream.subscribe();
        stream.emit(part(3));

        assert_eq!(sub.next().await, Some(part(1)));
        assert_eq!(sub.next().await, Some(part(2)));
        assert_eq!(sub.next().await, Some(part(3)));
    }

    #[tokio::test]
    async fn stream_closes_when_dropped() {
        let stream = EventStream::new();
        let mut sub = stream.subscribe();
        stream.emit(part(1));
        drop(stream);
        assert_eq!(sub.next().await, Some(part(1)));
        assert_eq!(sub.next().await, None);
    }

    #[test]
    fn serializes_with_type_tag() {
        let json = serde_json::to_value(TransferEvent::MultipartStarted {
            key: "a.bin".into(),
            upload_id: "u-1".into(),
        })
        .unwrap();
        assert_eq!(json["type"], "multipart_started");
        assert_eq!(json["upload_id"], "u-1");
    }

    #[tokio::test]
    async fn slow_subscriber_sees_every_event() {
        let stream = EventStream::new();
        let mut sub = stream.subscribe();
        for n in 1..=1500 {
            stream.emit(part(n));
        }
        for n in 1..=1500 {
            assert_eq!(sub.next().await, Some(part(n)));
        }
        drop(stream);
        assert_eq!(sub.next().await, None);
    }

    #[tokio::test]
    async fn subscriber_wakes_for_live_events() {
        let stream = Arc::new(EventStream::new());
        let mut sub = stream.subscribe();
        let emitter = Arc::clone(&stream);
        let task = tokio::spawn(async move {
            tokio::task::yield_now().await;
            emitter.emit(part(7));
        });
        assert_eq!(sub.next().await, Some(part(7)));
        task.await.unwrap();
    }

    #[test]
    fn dropped_subscriber_does_not_block_emit() {
        let stream = EventStream::new();
        drop(stream.subscribe());
        stream.emit(part(1));
        assert_eq!(stream.history().len(), 1);
    }
}
