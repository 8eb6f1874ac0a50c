//! Typed file change events.
//!
//! ```text
//!  SyncFileSystem ──emit──► EventBus ──► EventSubscription (UI, indexer, ...)
//!  SyncEngine (remote) ─┘                └► EventSubscription
//! ```
//!
//! Writes bracketed as sync-originated never reach the bus from the
//! filesystem layer; the engine emits one event per remotely changed path
//! instead.

use std::sync::Mutex;

use tokio::sync::broadcast::{self, error::RecvError};

use crate::types::FileMetadata;

#[derive(Debug, Clone, PartialEq)]
pub enum FileEvent {
    FileCreated {
        path: String,
        metadata: FileMetadata,
    },
    FileDeleted {
        path: String,
    },
    MetadataChanged {
        path: String,
        metadata: FileMetadata,
    },
    ContentsChanged {
        path: String,
        contents: Vec<String>,
    },
    FileRenamed {
        old_path: String,
        new_path: String,
    },
    FileMoved {
        path: String,
        old_parent: Option<String>,
        new_parent: Option<String>,
    },
}

impl FileEvent {
    /// The path the event is about (the new path for renames).
    pub fn path(&self) -> &str {
        match self {
            FileEvent::FileCreated { path, .. }
            | FileEvent::FileDeleted { path }
            | FileEvent::MetadataChanged { path, .. }
            | FileEvent::ContentsChanged { path, .. }
            | FileEvent::FileMoved { path, .. } => path,
            FileEvent::FileRenamed { new_path, .. } => new_path,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            FileEvent::FileCreated { .. } => "file_created",
            FileEvent::FileDeleted { .. } => "file_deleted",
            FileEvent::MetadataChanged { .. } => "metadata_changed",
            FileEvent::ContentsChanged { .. } => "contents_changed",
            FileEvent::FileRenamed { .. } => "file_renamed",
            FileEvent::FileMoved { .. } => "file_moved",
        }
    }
}

/// Broadcast channel for [`FileEvent`]s, closed on teardown.
pub struct EventBus {
    sender: Mutex<Option<broadcast::Sender<FileEvent>>>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender: Mutex::new(Some(sender)),
        }
    }

    /// Deliver to every live subscription. Returns how many received it.
    pub fn emit(&self, event: FileEvent) -> usize {
        let sender = self.sender.lock().unwrap_or_else(|e| e.into_inner());
        match sender.as_ref() {
            Some(tx) => {
                log::debug!("event {} {}", event.kind(), event.path());
                tx.send(event).unwrap_or(0)
            }
            None => 0,
        }
    }

    /// New subscription; after [`EventBus::close`] it yields nothing.
    pub fn subscribe(&self) -> EventSubscription {
        let sender = self.sender.lock().unwrap_or_else(|e| e.into_inner());
        EventSubscription {
            receiver: sender.as_ref().map(|tx| tx.subscribe()),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        let sender = self.sender.lock().unwrap_or_else(|e| e.into_inner());
        sender.as_ref().map_or(0, |tx| tx.receiver_count())
    }

    /// Drop the sender so every subscription ends.
    pub fn close(&self) {
        self.sender
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
    }

    pub fn is_closed(&self) -> bool {
        self.sender
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_none()
    }
}

/// Handle returned by [`EventBus::subscribe`]. Dropping it unsubscribes.
pub struct EventSubscription {
    receiver: Option<broadcast::Receiver<FileEvent>>,
}

impl EventSubscription {
    /// Next event, or `None` once the bus is closed.
    pub async fn recv(&mut self) -> Option<FileEvent> {
        let receiver = self.receiver.as_mut()?;
        loop {
            match receiver.recv().await {
                Ok(event) => return Some(event),
                Err(RecvError::Lagged(skipped)) => {
                    log::warn!("event subscriber lagged, {skipped} events dropped");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Non-blocking variant of [`EventSubscription::recv`].
    pub fn try_recv(&mut self) -> Option<FileEvent> {
        let receiver = self.receiver.as_mut()?;
        loop {
            match receiver.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => return None,
            }
        }
    }

    /// Drain whatever is buffered right now.
    pub fn drain(&mut self) -> Vec<FileEvent> {
        std::iter::from_fn(|| self.try_recv()).collect()
    }
}
