//! Transaction status reconciliation.
//!
//! A redemption can be observed many times: by the live watcher, by a
//! backfill, before and after its receipt is available. The stored status may
//! only move forward along `Unknown -> FailedToProcess -> Confirmed`, which
//! makes every write commutative and idempotent with respect to final state.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Execution status of a redemption on its destination chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TxStatus {
    Unknown,
    FailedToProcess,
    Confirmed,
}

impl TxStatus {
    /// Precedence rank. A write is accepted iff `candidate.rank() >= stored.rank()`.
    pub const fn rank(self) -> i32 {
        match self {
            Self::Unknown => 0,
            Self::FailedToProcess => 1,
            Self::Confirmed => 2,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::FailedToProcess => "failed_to_process",
            Self::Confirmed => "confirmed",
        }
    }
}

impl fmt::Display for TxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TxStatus {
    type Err = ReconcileError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unknown" => Ok(Self::Unknown),
            "failed_to_process" => Ok(Self::FailedToProcess),
            "confirmed" => Ok(Self::Confirmed),
            other => Err(ReconcileError::InvalidStatus(other.to_string())),
        }
    }
}

/// A rejected write. These are business outcomes, not system failures.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ReconcileError {
    #[error("cannot downgrade status from confirmed")]
    CannotDowngradeFromConfirmed,
    #[error("cannot downgrade from known status {stored}")]
    CannotDowngradeFromKnownStatus { stored: TxStatus },
    #[error("invalid status '{0}'")]
    InvalidStatus(String),
}

/// Decide whether `candidate` may overwrite `stored`.
pub fn reconcile(stored: Option<TxStatus>, candidate: TxStatus) -> Result<(), ReconcileError> {
    match (candidate, stored) {
        (TxStatus::Confirmed, _) => Ok(()),
        (TxStatus::FailedToProcess, Some(TxStatus::Confirmed)) => {
            Err(ReconcileError::CannotDowngradeFromConfirmed)
        }
        (TxStatus::FailedToProcess, _) => Ok(()),
        (TxStatus::Unknown, Some(stored @ (TxStatus::Confirmed | TxStatus::FailedToProcess))) => {
            Err(ReconcileError::CannotDowngradeFromKnownStatus { stored })
        }
        (TxStatus::Unknown, _) => Ok(()),
    }
}

/// [`reconcile`] for a status that still has to be parsed, as read from an
/// untyped source. Unparseable candidates are rejected as invalid.
pub fn reconcile_raw(stored: Option<TxStatus>, candidate: &str) -> Result<TxStatus, ReconcileError> {
    let candidate = candidate.parse::<TxStatus>()?;
    reconcile(stored, candidate).map(|()| candidate)
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [TxStatus; 3] = [TxStatus::Unknown, TxStatus::FailedToProcess, TxStatus::Confirmed];

    #[test]
    fn test_first_write_always_accepted() {
        for candidate in ALL {
            assert_eq!(reconcile(None, candidate), Ok(()));
        }
    }

    #[test]
    fn test_precedence_matrix() {
        use TxStatus::*;
        let cases = [
            (Unknown, Unknown, true),
            (Unknown, FailedToProcess, true),
            (Unknown, Confirmed, true),
            (FailedToProcess, Unknown, false),
            (FailedToProcess, FailedToProcess, true),
            (FailedToProcess, Confirmed, true),
            (Confirmed, Unknown, false),
            (Confirmed, FailedToProcess, false),
            (Confirmed, Confirmed, true),
        ];
        for (stored, candidate, accepted) in cases {
            assert_eq!(
                reconcile(Some(stored), candidate).is_ok(),
                accepted,
                "stored {stored} candidate {candidate}"
            );
            // The SQL guard relies on rank ordering agreeing with the rule.
            assert_eq!(candidate.rank() >= stored.rank(), accepted);
        }
    }

    #[test]
    fn test_rejection_reasons() {
        assert_eq!(
            reconcile(Some(TxStatus::Confirmed), TxStatus::FailedToProcess),
            Err(ReconcileError::CannotDowngradeFromConfirmed)
        );
        assert_eq!(
            reconcile(Some(TxStatus::FailedToProcess), TxStatus::Unknown),
            Err(ReconcileError::CannotDowngradeFromKnownStatus {
                stored: TxStatus::FailedToProcess
            })
        );
        assert_eq!(
            reconcile(Some(TxStatus::Confirmed), TxStatus::Unknown),
            Err(ReconcileError::CannotDowngradeFromKnownStatus {
                stored: TxStatus::Confirmed
            })
        );
    }

    #[test]
    fn test_idempotent() {
        for stored in ALL {
            for candidate in ALL {
                let first = reconcile(Some(stored), candidate);
                let after = if first.is_ok() { candidate } else { stored };
                // Re-applying the same candidate to the resulting state is always accepted
                // when it was accepted the first time, and leaves the state unchanged.
                if first.is_ok() {
                    assert!(reconcile(Some(after), candidate).is_ok());
                } else {
                    assert_eq!(after, stored);
                    assert!(reconcile(Some(after), candidate).is_err());
                }
            }
        }
    }

    #[test]
    fn test_invalid_status() {
        assert_eq!(
            reconcile_raw(None, "completed"),
            Err(ReconcileError::InvalidStatus("completed".to_string()))
        );
        assert_eq!(reconcile_raw(None, "confirmed"), Ok(TxStatus::Confirmed));
        for status in ALL {
            assert_eq!(status.as_str().parse::<TxStatus>(), Ok(status));
        }
    }
}
