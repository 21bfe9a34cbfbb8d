//! Half-open key interval model.

use std::fmt;
use std::str::FromStr;

use reshard_common::error::{ReshardError, ReshardResult};
use reshard_common::ids::TupleId;

/// Half-open key range `[from, to)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct KeyRange {
    /// First key inside the range.
    pub from: TupleId,
    /// First key past the range.
    pub to: TupleId,
}

impl KeyRange {
    /// Builds a non-empty range.
    ///
    /// # Errors
    ///
    /// Returns `ReshardError::Plan` when `from >= to`.
    pub fn new(from: TupleId, to: TupleId) -> ReshardResult<Self> {
        if from >= to {
            return Err(ReshardError::Plan(format!(
                "key range {from}-{to} is empty or inverted"
            )));
        }
        Ok(Self { from, to })
    }

    /// Range holding exactly one key.
    ///
    /// `TupleId::MAX` cannot be represented as a half-open single-key range, so callers must
    /// keep keys below it.
    #[must_use]
    pub fn single(key: TupleId) -> Self {
        debug_assert!(key < TupleId::MAX);
        Self {
            from: key,
            to: key.saturating_add(1),
        }
    }

    /// Number of keys in the range.
    #[must_use]
    pub fn width(self) -> u64 {
        self.to - self.from
    }

    /// Checks whether a key is within this range.
    #[must_use]
    pub fn contains(self, key: TupleId) -> bool {
        self.from <= key && key < self.to
    }

    /// Checks whether two ranges share at least one key.
    #[must_use]
    pub fn overlaps(self, other: Self) -> bool {
        self.from < other.to && other.from < self.to
    }

    /// Returns the parts of `self` that are not covered by `cut`, left part first.
    #[must_use]
    pub fn subtract(self, cut: Self) -> (Option<Self>, Option<Self>) {
        if !self.overlaps(cut) {
            return (Some(self), None);
        }
        let left = (self.from < cut.from).then_some(Self {
            from: self.from,
            to: cut.from,
        });
        let right = (cut.to < self.to).then_some(Self {
            from: cut.to,
            to: self.to,
        });
        (left, right)
    }
}

impl fmt::Display for KeyRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.from, self.to)
    }
}

impl FromStr for KeyRange {
    type Err = ReshardError;

    fn from_str(text: &str) -> Result<Self, Self::Err> {
        let Some((from, to)) = text.trim().split_once('-') else {
            return Err(ReshardError::Plan(format!(
                "key range `{text}` must look like `from-to`"
            )));
        };
        let parse = |value: &str| {
            value
                .trim()
                .parse::<TupleId>()
                .map_err(|_| ReshardError::Plan(format!("invalid key `{value}` in range `{text}`")))
        };
        Self::new(parse(from)?, parse(to)?)
    }
}

/// Parses a comma-separated range list such as `0-100,200-300`. Empty text is an empty list.
///
/// # Errors
///
/// Returns `ReshardError::Plan` for any malformed element.
pub fn parse_range_list(text: &str) -> ReshardResult<Vec<KeyRange>> {
    text.split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(str::parse)
        .collect()
}

/// Formats a range list in the same shape `parse_range_list` accepts.
#[must_use]
pub fn format_range_list(ranges: &[KeyRange]) -> String {
    ranges
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(",")
}
