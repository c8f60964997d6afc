//! Column-major view of records: one cell vector per path.

use veneer_core::record::set_field_value;
use veneer_core::types::{Record, Value};

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Cell {
    /// The path is absent from the record.
    Undefined,
    /// A relation along the path is null; holds the path of that relation.
    NullRelation(String),
    Defined(Value),
}

pub(crate) fn flatten(records: &[Record], paths: &[String]) -> Vec<Vec<Cell>> {
    paths
        .iter()
        .map(|path| records.iter().map(|r| flatten_cell(r, path)).collect())
        .collect()
}

fn flatten_cell(record: &Record, path: &str) -> Cell {
    let parts: Vec<&str> = path.split(':').collect();
    let last = parts.len() - 1;
    let mut current = record;
    for (i, part) in parts.iter().enumerate() {
        match current.get(*part) {
            None => return Cell::Undefined,
            Some(value) if i == last => return Cell::Defined(value.clone()),
            Some(Value::Record(child)) => current = child,
            Some(Value::Null) => return Cell::NullRelation(parts[..=i].join(":")),
            Some(_) => return Cell::Undefined,
        }
    }
    Cell::Undefined
}

/// Rebuild `len` records from columns aligned with `paths`.
pub(crate) fn unflatten(columns: &[&[Cell]], paths: &[String], len: usize) -> Vec<Record> {
    (0..len)
        .map(|row| {
            let mut record = Record::new();
            for (column, path) in columns.iter().zip(paths) {
                match column.get(row) {
                    Some(Cell::Defined(value)) => set_field_value(&mut record, path, value.clone()),
                    Some(Cell::NullRelation(relation)) => {
                        set_field_value(&mut record, relation, Value::Null)
                    }
                    Some(Cell::Undefined) | None => {}
                }
            }
            record
        })
        .collect()
}
