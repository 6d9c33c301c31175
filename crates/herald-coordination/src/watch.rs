//! One-shot child watches

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::sync::oneshot;

use crate::{CoordinationError, Result};

/// Notification delivered when a watch fires.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WatchEvent {
    /// A child of `path` was created, deleted or rewritten
    ChildrenChanged { path: String },
}

/// Backend side of a watch; firing consumes it.
#[derive(Debug)]
pub struct WatchTrigger {
    path: String,
    tx: oneshot::Sender<WatchEvent>,
}

impl WatchTrigger {
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Deliver the change notification. A no-op if the watcher is gone.
    pub fn fire(self) {
        let _ = self.tx.send(WatchEvent::ChildrenChanged { path: self.path });
    }

    /// Whether the watching side has been dropped.
    pub fn is_abandoned(&self) -> bool {
        self.tx.is_closed()
    }

    /// Resolves once the watching side is dropped.
    pub async fn abandoned(&mut self) {
        self.tx.closed().await
    }
}

/// Consumer side of a one-shot watch.
///
/// Resolves to the change notification, or to `ConnectionLoss` if the backend
/// discarded the watch (session expiry, client close).
#[derive(Debug)]
pub struct ChildWatch {
    path: String,
    rx: oneshot::Receiver<WatchEvent>,
}

impl ChildWatch {
    /// Create a linked trigger/watch pair for `path`.
    pub fn channel(path: impl Into<String>) -> (WatchTrigger, ChildWatch) {
        let path = path.into();
        let (tx, rx) = oneshot::channel();
        (
            WatchTrigger {
                path: path.clone(),
                tx,
            },
            ChildWatch { path, rx },
        )
    }

    pub fn path(&self) -> &str {
        &self.path
    }
}

impl Future for ChildWatch {
    type Output = Result<WatchEvent>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|res| res.map_err(|_| CoordinationError::ConnectionLoss))
    }
}
