//! Transaction status state machine
//!
//! Each status (except `New`) declares the set of statuses that may legally
//! precede it. A transaction only ever advances along this graph;
//! `CommitFinished` and `RollbackFinished` are terminal.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle status of a transaction, at the coordinator or at a participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransactionStatus {
    New,
    BeginStarted,
    BeginFinished,
    PrepareStarted,
    PrepareFinished,
    CommitStarted,
    CommitFinished,
    RollbackStarted,
    RollbackFinished,
}

impl TransactionStatus {
    /// All statuses, in protocol order. Index doubles as the log key suffix.
    pub const ALL: [TransactionStatus; 9] = [
        Self::New,
        Self::BeginStarted,
        Self::BeginFinished,
        Self::PrepareStarted,
        Self::PrepareFinished,
        Self::CommitStarted,
        Self::CommitFinished,
        Self::RollbackStarted,
        Self::RollbackFinished,
    ];

    /// Statuses that may directly precede this one.
    pub fn direct_predecessors(self) -> &'static [TransactionStatus] {
        use TransactionStatus::*;
        match self {
            New => &[],
            BeginStarted => &[New],
            BeginFinished => &[BeginStarted],
            PrepareStarted => &[BeginFinished],
            PrepareFinished => &[PrepareStarted],
            CommitStarted => &[PrepareFinished],
            CommitFinished => &[CommitStarted],
            RollbackStarted => &[
                BeginStarted,
                BeginFinished,
                PrepareStarted,
                PrepareFinished,
                CommitStarted,
            ],
            RollbackFinished => &[RollbackStarted],
        }
    }

    /// Whether `self` appears, directly or transitively, among the
    /// predecessors of `successor`. Used by the log loader to pick the most
    /// advanced status among several persisted entries for one id.
    pub fn is_predecessor_of(self, successor: TransactionStatus) -> bool {
        successor
            .direct_predecessors()
            .iter()
            .any(|&p| p == self || self.is_predecessor_of(p))
    }

    /// Whether a transition from `predecessor` to `self` is legal.
    pub fn can_follow(self, predecessor: TransactionStatus) -> bool {
        self.direct_predecessors().contains(&predecessor)
    }

    /// Terminal statuses never advance further.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::CommitFinished | Self::RollbackFinished)
    }

    /// Stable single-byte encoding, used as the log key suffix.
    pub(crate) fn ordinal(self) -> u8 {
        Self::ALL.iter().position(|&s| s == self).unwrap() as u8
    }

    pub(crate) fn from_ordinal(ordinal: u8) -> Option<Self> {
        Self::ALL.get(ordinal as usize).copied()
    }
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::New => "NEW",
            Self::BeginStarted => "BEGIN_STARTED",
            Self::BeginFinished => "BEGIN_FINISHED",
            Self::PrepareStarted => "PREPARE_STARTED",
            Self::PrepareFinished => "PREPARE_FINISHED",
            Self::CommitStarted => "COMMIT_STARTED",
            Self::CommitFinished => "COMMIT_FINISHED",
            Self::RollbackStarted => "ROLLBACK_STARTED",
            Self::RollbackFinished => "ROLLBACK_FINISHED",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::TransactionStatus::*;

    #[test]
    fn test_direct_transitions() {
        assert!(BeginStarted.can_follow(New));
        assert!(BeginFinished.can_follow(BeginStarted));
        assert!(PrepareStarted.can_follow(BeginFinished));
        assert!(CommitStarted.can_follow(PrepareFinished));
        assert!(RollbackStarted.can_follow(CommitStarted));
        assert!(RollbackFinished.can_follow(RollbackStarted));

        assert!(!CommitStarted.can_follow(BeginFinished));
        assert!(!BeginStarted.can_follow(BeginFinished));
        assert!(!RollbackStarted.can_follow(RollbackFinished));
    }

    #[test]
    fn test_transitive_predecessors() {
        assert!(New.is_predecessor_of(CommitFinished));
        assert!(BeginStarted.is_predecessor_of(RollbackFinished));
        assert!(PrepareFinished.is_predecessor_of(CommitFinished));
        assert!(!CommitFinished.is_predecessor_of(PrepareFinished));
        assert!(!CommitFinished.is_predecessor_of(RollbackFinished));
        assert!(!RollbackFinished.is_predecessor_of(CommitFinished));
    }

    #[test]
    fn test_terminal() {
        assert!(CommitFinished.is_terminal());
        assert!(RollbackFinished.is_terminal());
        assert!(!PrepareFinished.is_terminal());
        assert!(!New.is_terminal());
    }

    #[test]
    fn test_ordinal_roundtrip() {
        for status in super::TransactionStatus::ALL {
            assert_eq!(
                super::TransactionStatus::from_ordinal(status.ordinal()),
                Some(status)
            );
        }
        assert_eq!(super::TransactionStatus::from_ordinal(9), None);
    }
}
