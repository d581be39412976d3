//! Forward-only command status transitions.
//!
//! Agent reports can arrive reordered, duplicated, or without an explicit
//! ack, so marking a command never fails on ordering. Instead every advance
//! is classified, and only forward moves are written.

use streamspace_core::CommandStatus;

/// Outcome of a command status advance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandTransition {
    /// Moved to the next status.
    Applied,
    /// Moved forward but skipped at least one status (e.g. `complete`
    /// without a prior `ack`). Written, and worth logging.
    AppliedOutOfOrder,
    /// Already in the target status. Nothing was written.
    Unchanged,
    /// The target is behind the current status, or is the other terminal
    /// status. Nothing was written.
    Ignored,
}

impl CommandTransition {
    /// Classify an advance from `current` to `target`.
    #[must_use]
    pub const fn classify(current: CommandStatus, target: CommandStatus) -> Self {
        let (from, to) = (current.rank(), target.rank());
        if current as u8 == target as u8 {
            Self::Unchanged
        } else if to <= from {
            Self::Ignored
        } else if to == from + 1 {
            Self::Applied
        } else {
            Self::AppliedOutOfOrder
        }
    }

    /// Returns true if the advance was written.
    #[must_use]
    pub const fn is_applied(self) -> bool {
        matches!(self, Self::Applied | Self::AppliedOutOfOrder)
    }
}
