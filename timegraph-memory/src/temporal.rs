//! Bi-temporal validity for facts
//!
//! - **Valid time**: when a fact became true in the real world (`valid_at`)
//!   and when it stopped being true (`invalid_at`)
//! - **Transaction time**: when the record was written (`created_at` on the
//!   records themselves)
//!
//! Ordering between facts uses [`EpisodeOrder`]: reference time first,
//! ingestion sequence second.

use std::cmp::Ordering;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Validity window of a fact
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Validity {
    /// When the fact became true
    pub valid_at: DateTime<Utc>,

    /// When the fact ceased to be true (None while still believed)
    pub invalid_at: Option<DateTime<Utc>>,
}

impl Validity {
    /// Open-ended window starting at `valid_at`
    pub fn starting(valid_at: DateTime<Utc>) -> Self {
        Self {
            valid_at,
            invalid_at: None,
        }
    }

    /// Window with an explicit end. An end before the start is dropped.
    pub fn bounded(valid_at: DateTime<Utc>, invalid_at: Option<DateTime<Utc>>) -> Self {
        let invalid_at = invalid_at.filter(|end| *end >= valid_at);
        Self {
            valid_at,
            invalid_at,
        }
    }

    /// Currently believed true
    pub fn is_current(&self) -> bool {
        self.invalid_at.is_none()
    }

    /// Check if the fact was true at a specific point in time
    pub fn was_valid_at(&self, time: DateTime<Utc>) -> bool {
        let valid_start = self.valid_at <= time;
        let valid_end = match self.invalid_at {
            None => true,
            Some(invalid_at) => invalid_at > time,
        };
        valid_start && valid_end
    }

    /// Whether the window closed at or before `time`
    pub fn ended_by(&self, time: DateTime<Utc>) -> bool {
        matches!(self.invalid_at, Some(end) if end <= time)
    }

    /// Close the window at `at`.
    ///
    /// An end is never cleared and only ever moves earlier; it is clamped so
    /// that `valid_at <= invalid_at` keeps holding. Returns true if the window
    /// changed.
    pub fn invalidate_at(&mut self, at: DateTime<Utc>) -> bool {
        let at = at.max(self.valid_at);
        match self.invalid_at {
            Some(current) if current <= at => false,
            _ => {
                self.invalid_at = Some(at);
                true
            }
        }
    }
}

/// Eligibility predicate for search and listing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TemporalScope {
    /// Only facts with no `invalid_at`
    #[default]
    Current,
    /// Facts true at the given instant
    AsOf(DateTime<Utc>),
    /// Full history
    All,
}

impl TemporalScope {
    /// From an optional as-of time: `None` means current facts
    pub fn from_as_of(as_of: Option<DateTime<Utc>>) -> Self {
        match as_of {
            Some(t) => Self::AsOf(t),
            None => Self::Current,
        }
    }

    pub fn admits(&self, validity: &Validity) -> bool {
        match self {
            Self::Current => validity.is_current(),
            Self::AsOf(t) => validity.was_valid_at(*t),
            Self::All => true,
        }
    }
}

/// Total order between assertions: reference time, then ingestion sequence
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EpisodeOrder {
    pub reference_time: DateTime<Utc>,
    pub sequence: u64,
}

impl EpisodeOrder {
    pub fn new(reference_time: DateTime<Utc>, sequence: u64) -> Self {
        Self {
            reference_time,
            sequence,
        }
    }
}

impl PartialOrd for EpisodeOrder {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for EpisodeOrder {
    fn cmp(&self, other: &Self) -> Ordering {
        self.reference_time
            .cmp(&other.reference_time)
            .then(self.sequence.cmp(&other.sequence))
    }
}
