//! Helpers for reading paths and primary keys out of records.

use crate::error::{Error, Result};
use crate::schema::CollectionSchema;
use crate::types::{Record, Value};

/// Value at a colon-separated path. `None` means undefined: some segment is
/// missing, or the path walks through a null relation.
pub fn field_value<'a>(record: &'a Record, path: &str) -> Option<&'a Value> {
    let mut parts = path.split(':');
    let mut current = record.get(parts.next()?)?;
    for part in parts {
        current = current.as_record()?.get(part)?;
    }
    Some(current)
}

/// Primary key values of `record`, in the schema's primary key order.
pub fn primary_key(schema: &CollectionSchema, record: &Record) -> Result<Vec<Value>> {
    schema
        .primary_keys()
        .iter()
        .map(|pk| {
            record
                .get(pk)
                .cloned()
                .ok_or_else(|| Error::InvalidValue(format!("Missing primary key: {pk}")))
        })
        .collect()
}

/// Set `value` at `path`, creating intermediate records as needed. Existing
/// non-record values along the way are replaced.
pub fn set_field_value(record: &mut Record, path: &str, value: Value) {
    match path.split_once(':') {
        None => {
            record.insert(path.to_string(), value);
        }
        Some((head, rest)) => {
            let entry = record
                .entry(head.to_string())
                .or_insert_with(|| Value::Record(Record::new()));
            if entry.as_record().is_none() {
                *entry = Value::Record(Record::new());
            }
            if let Some(child) = entry.as_record_mut() {
                set_field_value(child, rest, value);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record;
    use crate::schema::{ColumnSchema, ColumnType};

    #[test]
    fn reads_nested_paths_and_stops_at_null() {
        let r = record! {
            "id" => 1,
            "author" => record! { "name" => "x" },
            "editor" => Value::Null,
        };
        assert_eq!(field_value(&r, "author:name"), Some(&Value::from("x")));
        assert_eq!(field_value(&r, "editor"), Some(&Value::Null));
        assert_eq!(field_value(&r, "editor:name"), None);
        assert_eq!(field_value(&r, "missing"), None);
    }

    #[test]
    fn primary_key_requires_every_key() {
        let schema = crate::schema::CollectionSchema::new()
            .with_field("a", ColumnSchema::new(ColumnType::Number).primary_key())
            .with_field("b", ColumnSchema::new(ColumnType::String).primary_key());
        let r = record! { "a" => 1, "b" => "z" };
        assert_eq!(primary_key(&schema, &r).unwrap(), vec![Value::Int(1), Value::from("z")]);
        assert!(primary_key(&schema, &record! { "a" => 1 }).is_err());
    }

    #[test]
    fn set_creates_intermediate_records() {
        let mut r = Record::new();
        set_field_value(&mut r, "author:country:name", Value::from("fr"));
        assert_eq!(field_value(&r, "author:country:name"), Some(&Value::from("fr")));
    }
}
