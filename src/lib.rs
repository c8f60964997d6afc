#![forbid(unsafe_code)]
//! veneer: decorators that let a thin native collection answer queries it
//! cannot run by itself.
//!
//! - [`core`]: values, schemas and the projection/filter/sort/aggregation
//!   algebra.
//! - [`decorators`]: the async collection surface, the decorator layers and
//!   the [`DecoratorStack`](decorators::DecoratorStack) pipeline.

pub use veneer_core as core;
pub use veneer_decorators as decorators;

pub use veneer_core::record;

pub mod prelude {
    pub use veneer_core::aggregation::{
        AggregateOperation, AggregateResult, Aggregation, DateOperation,
    };
    pub use veneer_core::condition_tree::{Aggregator, ConditionLeaf, ConditionTree};
    pub use veneer_core::config::VeneerConfig;
    pub use veneer_core::filter::{Filter, Page, PaginatedFilter};
    pub use veneer_core::operator::Operator;
    pub use veneer_core::projection::Projection;
    pub use veneer_core::schema::{CollectionSchema, ColumnSchema, ColumnType, FieldSchema};
    pub use veneer_core::sort::{Sort, SortClause};
    pub use veneer_core::types::{Record, Value};

    pub use veneer_decorators::{
        Collection, CollectionRef, ComputedDefinition, DataSource, DecoratorStack, Error,
        MemoryDataSource, RelationDefinition, Result, WriteAction, WriteContext,
    };
}
