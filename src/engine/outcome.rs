//! Classification of restic exit codes.
//!
//! Only the `backup` action distinguishes partial success; every other action
//! is judged by a zero exit code alone.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Result class of a backup attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// A complete snapshot was written.
    Success,
    /// A snapshot was written but some sources could not be read.
    IncompleteSnapshot,
    /// No snapshot was created.
    Failure,
    /// Exit code outside the known mapping.
    Unknown(i32),
}

impl Outcome {
    /// Whether the attempt made durable progress and must not be repeated.
    ///
    /// [`Outcome::Unknown`] is never a success.
    pub fn is_success(self) -> bool {
        matches!(self, Self::Success | Self::IncompleteSnapshot)
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => write!(f, "success"),
            Self::IncompleteSnapshot => write!(f, "incomplete snapshot"),
            Self::Failure => write!(f, "failure"),
            Self::Unknown(code) => write!(f, "unknown exit code {code}"),
        }
    }
}

/// Outcomes an exit code can be mapped to from configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MappedOutcome {
    /// See [`Outcome::Success`].
    Success,
    /// See [`Outcome::IncompleteSnapshot`].
    IncompleteSnapshot,
    /// See [`Outcome::Failure`].
    Failure,
}

impl From<MappedOutcome> for Outcome {
    fn from(value: MappedOutcome) -> Self {
        match value {
            MappedOutcome::Success => Self::Success,
            MappedOutcome::IncompleteSnapshot => Self::IncompleteSnapshot,
            MappedOutcome::Failure => Self::Failure,
        }
    }
}

/// Exit-code table for `restic backup`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitCodeMap {
    codes: BTreeMap<i32, Outcome>,
}

impl Default for ExitCodeMap {
    /// restic's documented exit codes.
    fn default() -> Self {
        let codes = BTreeMap::from([
            (0, Outcome::Success),
            (1, Outcome::Failure),
            (3, Outcome::IncompleteSnapshot),
            // repository does not exist
            (10, Outcome::Failure),
            // failed to lock repository
            (11, Outcome::Failure),
            // wrong password
            (12, Outcome::Failure),
            // interrupted
            (130, Outcome::Failure),
        ]);
        Self { codes }
    }
}

impl ExitCodeMap {
    /// The default table with configured entries layered on top.
    pub fn with_overrides(overrides: &BTreeMap<i32, MappedOutcome>) -> Self {
        let mut map = Self::default();
        for (code, outcome) in overrides {
            map.codes.insert(*code, (*outcome).into());
        }
        map
    }

    /// Map an exit code to an outcome. Codes not in the table are [`Outcome::Unknown`].
    pub fn classify(&self, exit_code: i32) -> Outcome {
        self.codes
            .get(&exit_code)
            .copied()
            .unwrap_or(Outcome::Unknown(exit_code))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn restic_codes_are_classified() {
        let map = ExitCodeMap::default();
        assert_eq!(map.classify(0), Outcome::Success);
        assert_eq!(map.classify(3), Outcome::IncompleteSnapshot);
        assert_eq!(map.classify(1), Outcome::Failure);
        assert_eq!(map.classify(12), Outcome::Failure);
    }

    #[test]
    fn unmapped_codes_are_unknown_and_not_success() {
        let map = ExitCodeMap::default();
        for code in [-1, 2, 4, 9, 13, 127, 255] {
            let outcome = map.classify(code);
            assert_eq!(outcome, Outcome::Unknown(code));
            assert!(!outcome.is_success());
        }
    }

    #[test]
    fn overrides_extend_the_table() {
        let overrides = BTreeMap::from([(2, MappedOutcome::Failure), (3, MappedOutcome::Failure)]);
        let map = ExitCodeMap::with_overrides(&overrides);
        assert_eq!(map.classify(2), Outcome::Failure);
        assert_eq!(map.classify(3), Outcome::Failure);
        assert_eq!(map.classify(0), Outcome::Success);
    }

    #[test]
    fn partial_snapshot_counts_as_success() {
        assert!(Outcome::Success.is_success());
        assert!(Outcome::IncompleteSnapshot.is_success());
        assert!(!Outcome::Failure.is_success());
    }
}
