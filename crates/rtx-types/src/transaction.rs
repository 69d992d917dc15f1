use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::TypeError;

/// Monotonically increasing identifier of a journaled transaction.
///
/// Displayed as 16 upper-case hex digits so ids sort lexically in the same
/// order as numerically.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TransactionId(u64);

impl TransactionId {
    pub const FIRST: TransactionId = TransactionId(1);

    pub fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn value(&self) -> u64 {
        self.0
    }

    /// The id that follows this one.
    pub fn next(&self) -> Self {
        Self(self.0.saturating_add(1))
    }
}

impl Default for TransactionId {
    fn default() -> Self {
        Self::FIRST
    }
}

impl fmt::Debug for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TransactionId({self})")
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016X}", self.0)
    }
}

impl FromStr for TransactionId {
    type Err = TypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        u64::from_str_radix(s.trim(), 16)
            .map(Self)
            .map_err(|_| TypeError::InvalidTransactionId(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_is_fixed_width_hex() {
        assert_eq!(TransactionId::new(255).to_string(), "00000000000000FF");
        assert_eq!(TransactionId::FIRST.to_string(), "0000000000000001");
    }

    #[test]
    fn parse_accepts_display_form() {
        let id = TransactionId::new(0xDEAD_BEEF);
        assert_eq!(id.to_string().parse::<TransactionId>().unwrap(), id);
    }

    #[test]
    fn next_increments() {
        assert_eq!(TransactionId::new(7).next(), TransactionId::new(8));
        assert_eq!(TransactionId::new(u64::MAX).next(), TransactionId::new(u64::MAX));
    }
}
