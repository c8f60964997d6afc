#![forbid(unsafe_code)]
//! veneer-core: values, schemas and the query algebra shared by every layer.
//!
//! Everything here is pure data plus synchronous rewriting: projections,
//! sorts, condition trees, filters and in-memory aggregation. Collections and
//! decorators live in `veneer-decorators`.

pub mod aggregation;
pub mod condition_tree;
pub mod config;
pub mod error;
pub mod filter;
pub mod hash;
pub mod operator;
pub mod prelude;
pub mod projection;
pub mod record;
pub mod schema;
pub mod sort;
pub mod types;

pub use error::{Error, Result};
