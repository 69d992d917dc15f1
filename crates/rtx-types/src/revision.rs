use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use crate::error::TypeError;

/// A comparable version marker, bounded by two sentinels.
///
/// `Zero` sorts before every concrete revision and `Infinity` after every
/// concrete revision. Concrete revisions are ordered by their ordinal. The
/// optional attached value never participates in ordering or equality, so a
/// revision may be re-typed ([`Revision::comparable_to`]) or given a value
/// ([`Revision::with_value`]) without changing where it sorts.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Revision<T> {
    Zero,
    At { ordinal: u64, value: Option<T> },
    Infinity,
}

impl<T> Revision<T> {
    pub fn zero() -> Self {
        Self::Zero
    }

    pub fn infinity() -> Self {
        Self::Infinity
    }

    /// A concrete revision with no attached value.
    pub fn at(ordinal: u64) -> Self {
        Self::At {
            ordinal,
            value: None,
        }
    }

    /// Parse a revision from its unique identifier.
    pub fn parse(identifier: &str) -> Result<Self, TypeError> {
        match identifier {
            "zero" => Ok(Self::Zero),
            "infinity" => Ok(Self::Infinity),
            other => u64::from_str_radix(other, 16)
                .map(Self::at)
                .map_err(|_| TypeError::InvalidRevision(other.to_string())),
        }
    }

    /// A string uniquely identifying the position of this revision.
    pub fn unique_identifier(&self) -> String {
        match self {
            Self::Zero => "zero".to_string(),
            Self::Infinity => "infinity".to_string(),
            Self::At { ordinal, .. } => format!("{ordinal:016X}"),
        }
    }

    pub fn value(&self) -> Option<&T> {
        match self {
            Self::At { value, .. } => value.as_ref(),
            _ => None,
        }
    }

    fn rank(&self) -> (u8, u64) {
        match self {
            Self::Zero => (0, 0),
            Self::At { ordinal, .. } => (1, *ordinal),
            Self::Infinity => (2, 0),
        }
    }

    /// Compare positions with a revision of any value type.
    pub fn compare<U>(&self, other: &Revision<U>) -> Ordering {
        self.rank().cmp(&other.rank())
    }

    pub fn is_before<U>(&self, other: &Revision<U>) -> bool {
        self.compare(other) == Ordering::Less
    }

    pub fn is_same<U>(&self, other: &Revision<U>) -> bool {
        self.compare(other) == Ordering::Equal
    }

    pub fn is_before_or_same<U>(&self, other: &Revision<U>) -> bool {
        self.compare(other) != Ordering::Greater
    }

    pub fn is_after<U>(&self, other: &Revision<U>) -> bool {
        self.compare(other) == Ordering::Greater
    }

    /// Transform the attached value, keeping the position.
    pub fn map<U>(self, mapper: impl FnOnce(T) -> U) -> Revision<U> {
        match self {
            Self::Zero => Revision::Zero,
            Self::Infinity => Revision::Infinity,
            Self::At { ordinal, value } => Revision::At {
                ordinal,
                value: value.map(mapper),
            },
        }
    }

    /// Attach a value at this position. Sentinels never carry a value.
    pub fn with_value<U>(&self, value: U) -> Revision<U> {
        self.with_optional_value(Some(value))
    }

    pub fn with_optional_value<U>(&self, value: Option<U>) -> Revision<U> {
        match self {
            Self::Zero => Revision::Zero,
            Self::Infinity => Revision::Infinity,
            Self::At { ordinal, .. } => Revision::At {
                ordinal: *ordinal,
                value,
            },
        }
    }

    /// Keep the value only if it satisfies `predicate`.
    pub fn filter(self, predicate: impl FnOnce(&T) -> bool) -> Revision<T> {
        match self {
            Self::At { ordinal, value } => Revision::At {
                ordinal,
                value: value.filter(predicate),
            },
            other => other,
        }
    }

    /// The same position, re-typed with no value.
    pub fn comparable_to<U>(&self) -> Revision<U> {
        self.with_optional_value(None)
    }
}

impl<T> PartialEq for Revision<T> {
    fn eq(&self, other: &Self) -> bool {
        self.is_same(other)
    }
}

impl<T> Eq for Revision<T> {}

impl<T> PartialOrd for Revision<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for Revision<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.compare(other)
    }
}
