//! Evaluate a computed field once per distinct dependency tuple.

use std::collections::HashMap;

use veneer_core::hash::{hash_record, Hash256};
use veneer_core::types::{Record, Value};

use super::ComputedDefinition;
use crate::error::{Error, Result};
use crate::metrics;

/// Run `definition` on `inputs`, invoking its evaluator exactly once with the
/// distinct non-empty inputs and fanning the outputs back out. Empty inputs
/// (every dependency undefined) produce `Null` without reaching the
/// evaluator.
pub(crate) async fn transform_unique_values(
    field: &str,
    definition: &ComputedDefinition,
    inputs: Vec<Record>,
) -> Result<Vec<Value>> {
    let total = inputs.len();
    let mut index: HashMap<Hash256, usize> = HashMap::new();
    let mut unique: Vec<Record> = Vec::new();
    let mut mapping: Vec<Option<usize>> = Vec::with_capacity(total);

    for input in inputs {
        if input.is_empty() {
            mapping.push(None);
            continue;
        }
        let slot = *index.entry(hash_record(&input)).or_insert_with(|| {
            unique.push(input);
            unique.len() - 1
        });
        mapping.push(Some(slot));
    }

    if unique.is_empty() {
        return Ok(vec![Value::Null; total]);
    }

    let expected = unique.len();
    metrics::emit_event(
        "computed.evaluate",
        &[
            ("field", field.to_string()),
            ("records", total.to_string()),
            ("distinct", expected.to_string()),
        ],
    );
    let outputs = definition.evaluate(unique).await?;
    if outputs.len() != expected {
        return Err(Error::Invariant(format!(
            "computed field '{field}' returned {} values for {expected} inputs",
            outputs.len()
        )));
    }

    Ok(mapping
        .into_iter()
        .map(|slot| slot.map_or(Value::Null, |i| outputs[i].clone()))
        .collect())
}
