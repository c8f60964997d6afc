//! Comparison operators usable in condition tree leaves.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::schema::ColumnType;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Operator {
    Present,
    Blank,
    Missing,
    Equal,
    NotEqual,
    LessThan,
    GreaterThan,
    LessThanOrEqual,
    GreaterThanOrEqual,
    In,
    NotIn,
    Like,
    ILike,
    Contains,
    NotContains,
    IContains,
    StartsWith,
    EndsWith,
    IncludesAll,
    IncludesNone,
    Before,
    After,
}

impl Operator {
    /// Operators whose value is a list.
    pub fn expects_list(self) -> bool {
        matches!(
            self,
            Operator::In | Operator::NotIn | Operator::IncludesAll | Operator::IncludesNone
        )
    }

    /// Operator set a native collection typically exposes for a column type.
    pub fn defaults_for(column_type: ColumnType) -> BTreeSet<Operator> {
        use Operator::*;

        let mut ops: BTreeSet<Operator> = [Present, Blank, Missing, Equal, NotEqual, In, NotIn]
            .into_iter()
            .collect();
        match column_type {
            ColumnType::Number => {
                ops.extend([LessThan, GreaterThan, LessThanOrEqual, GreaterThanOrEqual]);
            }
            ColumnType::String | ColumnType::Uuid => {
                ops.extend([
                    LessThan,
                    GreaterThan,
                    Like,
                    ILike,
                    Contains,
                    NotContains,
                    IContains,
                    StartsWith,
                    EndsWith,
                ]);
            }
            ColumnType::Date | ColumnType::Dateonly | ColumnType::Timeonly => {
                ops.extend([LessThan, GreaterThan, Before, After]);
            }
            ColumnType::Json => {
                ops.extend([IncludesAll, IncludesNone]);
            }
            ColumnType::Boolean | ColumnType::Enum | ColumnType::Binary => {}
        }
        ops
    }
}
