//! Stable structural hashing for values, group keys, and dedup tuples.

use blake3::Hasher;

use crate::types::{value_type_order, Record, Value};

/// A blake3 digest used as a map key for values, group keys and records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Hash256(pub [u8; 32]);

/// Structural hash of a single value. Equal values (including `Int(2)` and
/// `Float(2.0)`) hash identically.
pub fn hash_value(value: &Value) -> Hash256 {
    let mut hasher = Hasher::new();
    hash_into(value, &mut hasher);
    Hash256(hasher.finalize().into())
}

/// Structural hash of an ordered list of defined values (group keys, join keys).
pub fn hash_values(values: &[Value]) -> Hash256 {
    let mut hasher = Hasher::new();
    hasher.update(&(values.len() as u64).to_le_bytes());
    for value in values {
        hash_into(value, &mut hasher);
    }
    Hash256(hasher.finalize().into())
}

pub fn hash_record(record: &Record) -> Hash256 {
    let mut hasher = Hasher::new();
    hash_record_into(record, &mut hasher);
    Hash256(hasher.finalize().into())
}

fn hash_record_into(record: &Record, hasher: &mut Hasher) {
    hasher.update(&(record.len() as u64).to_le_bytes());
    for (key, value) in record {
        hasher.update(&(key.len() as u64).to_le_bytes());
        hasher.update(key.as_bytes());
        hash_into(value, hasher);
    }
}

fn hash_into(value: &Value, hasher: &mut Hasher) {
    // Write type discriminant first
    hasher.update(&[value_type_order(value)]);

    match value {
        Value::Null => {}
        Value::Bool(b) => {
            hasher.update(&[*b as u8]);
        }
        Value::Int(i) => {
            hasher.update(&[0]);
            hasher.update(&i.to_le_bytes());
        }
        Value::Float(f) => {
            if f.fract() == 0.0 && *f >= i64::MIN as f64 && *f <= i64::MAX as f64 {
                hasher.update(&[0]);
                hasher.update(&(*f as i64).to_le_bytes());
            } else {
                hasher.update(&[1]);
                hasher.update(&f.to_bits().to_le_bytes());
            }
        }
        Value::Str(s) => {
            hasher.update(&(s.len() as u64).to_le_bytes());
            hasher.update(s.as_bytes());
        }
        Value::List(items) => {
            hasher.update(&(items.len() as u64).to_le_bytes());
            for item in items {
                hash_into(item, hasher);
            }
        }
        Value::Record(record) => hash_record_into(record, hasher),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record;

    #[test]
    fn equal_numbers_share_a_hash() {
        assert_eq!(hash_value(&Value::Int(4)), hash_value(&Value::Float(4.0)));
        assert_ne!(hash_value(&Value::Int(4)), hash_value(&Value::Str("4".into())));
    }

    #[test]
    fn key_lists_hash_by_position() {
        let a = [Value::Int(1), Value::Null];
        let b = [Value::Null, Value::Int(1)];
        assert_ne!(hash_values(&a), hash_values(&b));
        assert_ne!(hash_values(&[]), hash_values(&[Value::Null]));
        assert_eq!(hash_values(&a), hash_values(&[Value::Float(1.0), Value::Null]));
    }

    #[test]
    fn record_hash_is_structural() {
        let a = record! { "x" => 1, "y" => "b" };
        let b = record! { "y" => "b", "x" => 1 };
        assert_eq!(hash_record(&a), hash_record(&b));
    }
}
