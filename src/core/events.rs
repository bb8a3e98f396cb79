//! Publish/subscribe ports between pipeline stages
//!
//! Each component owns one [`EventPort`] and hands out receivers through
//! `subscribe()`. Payloads are owned copies, so subscribers never share state
//! with the emitting component.

use crate::core::models::{CleanupOperation, ProcessInfo, ZombieProcessInfo};
use crate::error::ReaperError;
use std::sync::Arc;
use tokio::sync::broadcast;

pub const DEFAULT_EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub enum MonitorEvent {
    ProcessDetected(ProcessInfo),
    ScanComplete(Vec<ProcessInfo>),
    ZombieIdentified(ProcessInfo),
    Error(Arc<ReaperError>),
}

#[derive(Debug, Clone)]
pub enum DetectorEvent {
    ZombieConfirmed(ZombieProcessInfo),
    AnalysisComplete(Vec<ZombieProcessInfo>),
    Error(Arc<ReaperError>),
}

#[derive(Debug, Clone)]
pub enum CleanerEvent {
    CleanupQueued(CleanupOperation),
    CleanupSuccess(CleanupOperation),
    CleanupFailed(CleanupOperation),
    Error(Arc<ReaperError>),
}

/// Broadcast sender wrapper; emitting with no subscribers is not an error
#[derive(Debug)]
pub struct EventPort<E: Clone> {
    tx: broadcast::Sender<E>,
}

impl<E: Clone> EventPort<E> {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<E> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: E) {
        let _ = self.tx.send(event);
    }
}

impl<E: Clone> Default for EventPort<E> {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::errors;
    use tokio::sync::broadcast::error::TryRecvError;

    #[tokio::test]
    async fn emit_without_subscribers_is_silent() {
        let port: EventPort<MonitorEvent> = EventPort::default();
        port.emit(MonitorEvent::Error(Arc::new(errors::introspection_error(
            "nobody listening",
        ))));

        // 晚到的订阅者看不到订阅前的事件
        let mut late = port.subscribe();
        assert!(matches!(late.try_recv(), Err(TryRecvError::Empty)));
    }

    #[tokio::test]
    async fn subscribers_receive_copies() {
        let port: EventPort<MonitorEvent> = EventPort::default();
        let mut rx = port.subscribe();
        port.emit(MonitorEvent::ScanComplete(Vec::new()));
        match rx.recv().await.unwrap() {
            MonitorEvent::ScanComplete(list) => assert!(list.is_empty()),
            other => panic!("unexpected event {:?}", other),
        }
    }
}
