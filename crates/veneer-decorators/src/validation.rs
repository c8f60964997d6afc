//! Configuration-time checks on field paths and condition trees.

use veneer_core::condition_tree::ConditionTree;
use veneer_core::schema::{resolve_column, ColumnSchema, SchemaLookup};

use crate::error::{Error, Result};

/// `path` must resolve, from `collection`, to a column.
pub fn validate_column(lookup: &dyn SchemaLookup, collection: &str, path: &str) -> Result<ColumnSchema> {
    resolve_column(lookup, collection, path)
        .map(|(_, column)| column)
        .map_err(|e| Error::Validation(e.to_string()))
}

/// Every leaf must target a column that declares the leaf's operator.
pub fn validate_condition_tree(
    tree: &ConditionTree,
    collection: &str,
    lookup: &dyn SchemaLookup,
) -> Result<()> {
    for leaf in tree.leafs() {
        let column = validate_column(lookup, collection, &leaf.field)?;
        if !column.supports(leaf.operator) {
            return Err(Error::Validation(format!(
                "The given operator '{:?}' is not supported by the column: '{}'",
                leaf.operator, leaf.field
            )));
        }
        if leaf.operator.expects_list() && !leaf.value.is_null() && leaf.value.as_list().is_none() {
            return Err(Error::Validation(format!(
                "The operator '{:?}' on '{}' expects a list of values",
                leaf.operator, leaf.field
            )));
        }
    }
    Ok(())
}
