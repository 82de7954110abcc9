//! Blocks: one submitted command and everything it produced.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::output::OutputBuffer;
use crate::error::BlockError;
use crate::executor::{Classification, Completion};

/// Session-unique block number, starting at 1.
pub type BlockId = u64;

/// Block lifecycle.
///
/// ```text
/// Pending -> Running -> Completed | Failed | Cancelled
///    \
///     +--> Failed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockStatus {
    /// Allocated, channel not open yet.
    Pending,
    /// Command running.
    Running,
    /// Remote process exited.
    Completed,
    /// Ended with an error.
    Failed,
    /// Cancelled by the caller.
    Cancelled,
}

impl BlockStatus {
    /// Returns the display name for this status.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Returns true for Completed, Failed, and Cancelled.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for BlockStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A command and its captured result.
#[derive(Debug, Clone)]
pub struct Block {
    /// Block id.
    pub id: BlockId,
    /// Command text as submitted.
    pub command: String,
    /// How completion is detected.
    pub classification: Classification,
    /// Display-only category from an external classifier.
    pub category: Option<String>,
    /// Current status.
    pub status: BlockStatus,
    /// Retained output.
    pub output: OutputBuffer,
    /// When the block was allocated.
    pub created_at: DateTime<Utc>,
    /// When the command started running.
    pub started_at: Option<DateTime<Utc>>,
    /// When the block reached a terminal status.
    pub finished_at: Option<DateTime<Utc>>,
    /// Remote exit status.
    pub exit_code: Option<i32>,
    /// Terminal failure.
    pub error: Option<BlockError>,
}

impl Block {
    pub(crate) fn new(
        id: BlockId,
        command: &str,
        classification: Classification,
        category: Option<String>,
        output_limit: usize,
    ) -> Self {
        Self {
            id,
            command: command.to_string(),
            classification,
            category,
            status: BlockStatus::Pending,
            output: OutputBuffer::new(output_limit),
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            exit_code: None,
            error: None,
        }
    }

    /// Pending -> Running. Returns false if the block was not Pending.
    pub(crate) fn start(&mut self) -> bool {
        if self.status != BlockStatus::Pending {
            return false;
        }
        self.status = BlockStatus::Running;
        self.started_at = Some(Utc::now());
        true
    }

    /// Moves to the terminal status for `completion`. Terminal blocks are
    /// left untouched; returns false in that case.
    pub(crate) fn finish(&mut self, completion: Completion, exit_code: Option<i32>) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        let (status, error) = match completion {
            Completion::Completed => (BlockStatus::Completed, None),
            Completion::Cancelled => (BlockStatus::Cancelled, None),
            Completion::Failed(error) => (BlockStatus::Failed, Some(error)),
        };
        self.status = status;
        self.error = error;
        self.exit_code = exit_code;
        self.finished_at = Some(Utc::now());
        true
    }

    /// Retained output as text.
    #[must_use]
    pub fn output_text(&self) -> String {
        self.output.text()
    }

    /// True while the command may still produce output.
    #[must_use]
    pub fn is_running(&self) -> bool {
        !self.status.is_terminal()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn block() -> Block {
        Block::new(1, "echo hi", Classification::OneShot, None, 64)
    }

    #[test]
    fn test_lifecycle() {
        let mut b = block();
        assert_eq!(b.status, BlockStatus::Pending);
        assert!(b.start());
        assert!(!b.start());
        assert!(b.started_at.is_some());

        assert!(b.finish(Completion::Completed, Some(0)));
        assert_eq!(b.status, BlockStatus::Completed);
        assert_eq!(b.exit_code, Some(0));
        assert!(b.finished_at.is_some());
    }

    #[test]
    fn test_terminal_block_is_immutable() {
        let mut b = block();
        b.start();
        assert!(b.finish(Completion::Failed(BlockError::connection_lost("gone")), None));
        assert!(!b.finish(Completion::Completed, Some(0)));
        assert_eq!(b.status, BlockStatus::Failed);
        assert_eq!(b.error.as_ref().map(|e| e.kind), Some(ErrorKind::ConnectionLost));
        assert_eq!(b.exit_code, None);
    }

    #[test]
    fn test_pending_can_fail_directly() {
        let mut b = block();
        assert!(b.finish(Completion::Failed(BlockError::new(ErrorKind::Network, "open failed")), None));
        assert!(!b.start());
    }
}
