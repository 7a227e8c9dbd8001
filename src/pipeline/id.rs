//! Identity types for the pipeline system.
//!
//! Data source and operator ids are newtypes over `u32` that index directly
//! into the [`super::DataSourceTree`] arena. Slots are never reused, so a
//! stale id resolves to `None` instead of to another entry.

use std::fmt;

/// Index into `DataSourceTree::data_sources`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub struct DataSourceId(pub u32);

impl DataSourceId {
    pub const INVALID: DataSourceId = DataSourceId(u32::MAX);

    #[inline]
    pub fn is_valid(self) -> bool {
        self != Self::INVALID
    }

    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Debug for DataSourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == Self::INVALID {
            write!(f, "DataSourceId(INVALID)")
        } else {
            write!(f, "DataSourceId({})", self.0)
        }
    }
}

impl fmt::Display for DataSourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Index into `DataSourceTree::operators`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub struct OperatorId(pub u32);

impl OperatorId {
    pub const INVALID: OperatorId = OperatorId(u32::MAX);

    #[inline]
    pub fn is_valid(self) -> bool {
        self != Self::INVALID
    }

    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Debug for OperatorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == Self::INVALID {
            write!(f, "OperatorId(INVALID)")
        } else {
            write!(f, "OperatorId({})", self.0)
        }
    }
}

impl fmt::Display for OperatorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Monotonic identifier of one executor request.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(pub u64);

impl RequestId {
    #[inline]
    pub fn next(self) -> RequestId {
        RequestId(self.0 + 1)
    }
}

impl fmt::Debug for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Request#{}", self.0)
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_source_id() {
        let id = DataSourceId(42);
        assert!(id.is_valid());
        assert_eq!(id.index(), 42);
        assert!(!DataSourceId::INVALID.is_valid());
        assert_eq!(format!("{}", DataSourceId::INVALID), "DataSourceId(INVALID)");
    }

    #[test]
    fn test_operator_id() {
        let id = OperatorId(0);
        assert!(id.is_valid());
        assert_eq!(id.index(), 0);
        assert!(!OperatorId::INVALID.is_valid());
    }

    #[test]
    fn test_request_id_sequence() {
        let first = RequestId(1);
        assert_eq!(first.next(), RequestId(2));
        assert!(first < first.next());
        assert_eq!(first.to_string(), "Request#1");
    }
}
