//! Convenient re-exports for downstream crates.

pub use crate::aggregation::{
    AggregateOperation, AggregateResult, Aggregation, AggregationGroup, DateOperation,
};
pub use crate::condition_tree::{Aggregator, ConditionLeaf, ConditionTree};
pub use crate::config::VeneerConfig;
pub use crate::error::{Error, Result};
pub use crate::filter::{Filter, Page, PaginatedFilter};
pub use crate::operator::Operator;
pub use crate::projection::Projection;
pub use crate::schema::{
    CollectionSchema, ColumnSchema, ColumnType, FieldSchema, ManyToManySchema, ManyToOneSchema,
    OneToManySchema, OneToOneSchema, SchemaLookup,
};
pub use crate::sort::{Sort, SortClause};
pub use crate::types::{Record, Value};
