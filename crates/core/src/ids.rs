use serde::{Deserialize, Serialize};
use std::fmt;

use crate::CoreError;

macro_rules! int_id {
    ($name:ident) => {
        #[derive(
            Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
        )]
        pub struct $name(u64);

        impl $name {
            pub const fn new(value: u64) -> Self {
                Self(value)
            }

            pub const fn get(self) -> u64 {
                self.0
            }

            /// Value as bound into an SQLite INTEGER column.
            pub fn to_sql(self) -> Result<i64, CoreError> {
                i64::try_from(self.0).map_err(|_| CoreError::IdOutOfRange {
                    kind: stringify!($name),
                    value: self.0,
                })
            }

            pub fn from_sql(value: i64) -> Result<Self, CoreError> {
                u64::try_from(value).map(Self).map_err(|_| {
                    CoreError::InvalidData(format!(
                        "negative {} in column: {value}",
                        stringify!($name)
                    ))
                })
            }
        }

        impl From<u64> for $name {
            fn from(value: u64) -> Self {
                Self(value)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

int_id!(Oid);
int_id!(Tid);

impl Tid {
    /// Prior tid of an object that has never been committed.
    pub const ZERO: Tid = Tid(0);

    pub fn is_zero(self) -> bool {
        self.0 == 0
    }

    pub fn next(self) -> Result<Tid, CoreError> {
        self.0
            .checked_add(1)
            .map(Tid)
            .ok_or(CoreError::IdOutOfRange {
                kind: "Tid",
                value: self.0,
            })
    }
}

/// A staged write whose assumed prior revision does not match the committed one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Conflict {
    pub oid: Oid,
    pub current_tid: Tid,
    pub staged_prev_tid: Tid,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sql_conversion_rejects_out_of_range() {
        assert_eq!(Oid::new(7).to_sql().unwrap(), 7);
        let huge = Tid::new(u64::MAX);
        match huge.to_sql() {
            Err(CoreError::IdOutOfRange { kind, value }) => {
                assert_eq!(kind, "Tid");
                assert_eq!(value, u64::MAX);
            }
            other => panic!("expected IdOutOfRange, got {other:?}"),
        }
        assert!(Oid::from_sql(-1).is_err());
        assert_eq!(Oid::from_sql(42).unwrap(), Oid::new(42));
    }

    #[test]
    fn tid_next_is_monotonic() {
        let mut tid = Tid::ZERO;
        for expected in 1..=5 {
            tid = tid.next().unwrap();
            assert_eq!(tid.get(), expected);
        }
        assert!(Tid::new(u64::MAX).next().is_err());
    }

    #[test]
    fn debug_and_display() {
        assert_eq!(format!("{:?}", Oid::new(3)), "Oid(3)");
        assert_eq!(Tid::new(100).to_string(), "100");
        assert!(Tid::ZERO.is_zero());
    }
}
