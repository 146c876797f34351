//! Lifecycle of a consumer group member.
//!
//! ```text
//! Joining ──► Ready ──► Consuming { partitions }
//!    ▲                      │
//!    └──── all revoked ─────┤
//!                           ▼ shutdown
//!                       Draining ──► Stopped
//! ```

use std::fmt;

/// Observable state of a [`ReviewEventConsumer`](crate::ReviewEventConsumer).
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConsumerState {
    /// Subscribed, waiting for the group coordinator to assign partitions.
    Joining,
    /// First assignment received. Entered once per run.
    Ready,
    /// Workers are running for these partitions (sorted).
    Consuming {
        /// Assigned partitions
        partitions: Vec<i32>,
    },
    /// Shutdown requested; workers finish their current message.
    Draining,
    /// All workers stopped and the subscription is dropped.
    Stopped,
}

impl ConsumerState {
    /// Whether the consumer reached a terminal state.
    #[must_use]
    pub const fn is_stopped(&self) -> bool {
        matches!(self, Self::Stopped)
    }
}

impl fmt::Display for ConsumerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Joining => write!(f, "joining"),
            Self::Ready => write!(f, "ready"),
            Self::Consuming { partitions } => write!(f, "consuming {partitions:?}"),
            Self::Draining => write!(f, "draining"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}
