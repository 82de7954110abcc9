//! Ordered per-session update stream.

use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_stream::Stream;
use tracing::warn;

use super::SessionId;
use super::block::{BlockId, BlockStatus};
use crate::error::BlockError;
use crate::executor::{Classification, OutputStream};

/// What happened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateEvent {
    /// A block was allocated.
    BlockCreated {
        /// Command text.
        command: String,
        /// How completion is detected.
        classification: Classification,
    },
    /// The block's command is running.
    BlockStarted,
    /// Live output.
    Output {
        /// Source stream.
        stream: OutputStream,
        /// Raw bytes.
        bytes: Vec<u8>,
    },
    /// The block's retained buffer started dropping old output.
    OutputTruncated {
        /// Retained byte cap.
        limit: usize,
    },
    /// The block reached a terminal status.
    BlockFinished {
        /// Terminal status.
        status: BlockStatus,
        /// Remote exit status.
        exit_code: Option<i32>,
        /// Terminal failure.
        error: Option<BlockError>,
    },
    /// The connection degraded; the session is recoverable for `grace`.
    SessionRecovering {
        /// Grace window.
        grace: Duration,
    },
    /// The connection recovered; the session is Active again.
    SessionResumed,
    /// The session closed. Always the last update.
    SessionClosed {
        /// Set when the close was forced.
        reason: Option<BlockError>,
    },
}

/// One entry in a session's update sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockUpdate {
    /// Session-scoped sequence number, strictly increasing.
    pub seq: u64,
    /// Session.
    pub session_id: SessionId,
    /// Block, for block-scoped events.
    pub block_id: Option<BlockId>,
    /// Event.
    pub event: UpdateEvent,
}

impl BlockUpdate {
    /// True for the session's final update.
    #[must_use]
    pub fn is_session_closed(&self) -> bool {
        matches!(self.event, UpdateEvent::SessionClosed { .. })
    }
}

/// Default number of undelivered updates a subscriber may hold.
pub const DEFAULT_UPDATE_BUFFER: usize = 1024;

/// Sending half kept by the session.
pub(crate) struct Subscriber {
    tx: mpsc::Sender<BlockUpdate>,
    lagged: Arc<AtomicBool>,
}

impl Subscriber {
    /// A subscriber holding at most `capacity` undelivered updates.
    pub(crate) fn channel(capacity: usize) -> (Self, BlockUpdates) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let lagged = Arc::new(AtomicBool::new(false));
        let updates = BlockUpdates {
            rx,
            lagged: Arc::clone(&lagged),
        };
        (Self { tx, lagged }, updates)
    }

    /// Queues `update`. False once the subscriber is gone or has fallen too
    /// far behind; either way it gets no further updates.
    pub(crate) fn deliver(&self, update: &BlockUpdate) -> bool {
        match self.tx.try_send(update.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!(session = %update.session_id, seq = update.seq, "Update subscriber fell behind, dropping it");
                self.lagged.store(true, Ordering::Release);
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }
}

/// Lazy, ordered sequence of a session's updates from the moment of
/// subscription. Ends after `SessionClosed`, or early when the reader let
/// the buffer fill up; [`Self::lagged`] tells the two apart.
#[derive(Debug)]
pub struct BlockUpdates {
    rx: mpsc::Receiver<BlockUpdate>,
    lagged: Arc<AtomicBool>,
}

impl BlockUpdates {
    /// Receives the next update, or `None` once the stream has ended.
    pub async fn recv(&mut self) -> Option<BlockUpdate> {
        self.rx.recv().await
    }

    /// True if the stream was cut because updates were not read in time.
    /// Block state can still be read from the session manager.
    #[must_use]
    pub fn lagged(&self) -> bool {
        self.lagged.load(Ordering::Acquire)
    }
}

impl Stream for BlockUpdates {
    type Item = BlockUpdate;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}
