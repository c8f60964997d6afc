//! Custom write logic per field.
//!
//! A handler turns the value written to its field into a partial record of
//! other values to write. Those are rewritten in turn, so handlers chain;
//! the chain of fields used so far is carried along to reject cycles.
//! Values landing on ManyToOne and OneToOne relations are then written to
//! the related collections.

mod relations;

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use futures::future::{try_join_all, BoxFuture};
use futures::FutureExt;
use veneer_core::filter::Filter;
use veneer_core::schema::{CollectionSchema, FieldSchema};
use veneer_core::types::{Record, Value};

use crate::collection::{Collection, CollectionRef};
use crate::datasource::{read, write};
use crate::decorator::{CollectionDecorator, DataSourceHandle, DecoratorBase};
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteAction {
    Create,
    Update,
}

impl fmt::Display for WriteAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WriteAction::Create => f.write_str("create"),
            WriteAction::Update => f.write_str("update"),
        }
    }
}

/// What a handler sees besides the value of its own field.
#[derive(Debug, Clone)]
pub struct WriteContext {
    pub action: WriteAction,
    /// The whole record or patch being written, as the caller sent it.
    pub record: Record,
    pub collection: String,
}

type WriteHandler =
    Arc<dyn Fn(Value, WriteContext) -> BoxFuture<'static, Result<Option<Record>>> + Send + Sync>;

pub struct WriteCollection {
    base: DecoratorBase<WriteCollection>,
    handlers: RwLock<HashMap<String, WriteHandler>>,
}

impl WriteCollection {
    /// Route writes to column `field` through `handler`. Returning the field
    /// itself in the partial record keeps that value for it.
    pub fn replace_field_writing<F, Fut>(&self, field: &str, handler: F) -> Result<()>
    where
        F: Fn(Value, WriteContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Option<Record>>> + Send + 'static,
    {
        if self.schema().column(field).is_none() {
            return Err(Error::Validation(format!(
                "Column not found: '{}.{field}'",
                self.name()
            )));
        }

        #[cfg(feature = "tracing")]
        tracing::debug!(collection = self.name(), field, "replaced field writing");

        let handler: WriteHandler = Arc::new(move |value, context| handler(value, context).boxed());
        write(&self.handlers).insert(field.to_string(), handler);
        self.base.mark_schema_as_dirty();
        Ok(())
    }

    fn handler(&self, field: &str) -> Option<WriteHandler> {
        read(&self.handlers).get(field).cloned()
    }

    fn related(&self, schema: &CollectionSchema, relation: &str) -> Result<Arc<WriteCollection>> {
        let foreign = schema
            .field(relation)
            .and_then(FieldSchema::foreign_collection)
            .ok_or_else(|| {
                Error::Core(veneer_core::Error::UnknownField {
                    collection: self.name().to_string(),
                    field: relation.to_string(),
                })
            })?;
        self.base.datasource.sibling(foreign)
    }

    /// Apply handlers to every key of `patch` and merge what they produce.
    fn rewrite_patch<'a>(
        &'a self,
        action: WriteAction,
        patch: Record,
        used: Vec<String>,
    ) -> BoxFuture<'a, Result<Record>> {
        async move {
            let original = &patch;
            let used = &used;
            let parts = try_join_all(patch.iter().map(|(key, value)| {
                self.rewrite_key(action, key.clone(), value.clone(), original, used.clone())
            }))
            .await?;
            parts
                .into_iter()
                .try_fold(Record::new(), |merged, part| deep_merge(merged, part, ""))
        }
        .boxed()
    }

    fn rewrite_key<'a>(
        &'a self,
        action: WriteAction,
        key: String,
        value: Value,
        original: &'a Record,
        mut used: Vec<String>,
    ) -> BoxFuture<'a, Result<Record>> {
        async move {
            let qualified = format!("{}.{key}", self.name());
            if used.contains(&qualified) {
                used.push(qualified);
                return Err(Error::CyclicDependency(used.join(" -> ")));
            }

            let schema = self.schema();
            let field = schema.field(&key).ok_or_else(|| {
                Error::Core(veneer_core::Error::UnknownField {
                    collection: self.name().to_string(),
                    field: key.clone(),
                })
            })?;

            match field {
                FieldSchema::Column(_) => {
                    let Some(handler) = self.handler(&key) else {
                        return Ok(Record::from([(key, value)]));
                    };
                    let context = WriteContext {
                        action,
                        record: original.clone(),
                        collection: self.name().to_string(),
                    };
                    let Some(mut produced) = handler(value, context).await? else {
                        return Ok(Record::new());
                    };

                    #[cfg(feature = "tracing")]
                    tracing::trace!(field = %qualified, produced = produced.len(), %action, "applied write handler");

                    let own = produced.remove(&key);
                    used.push(qualified);
                    let rest = self.rewrite_patch(action, produced, used).await?;
                    match own {
                        Some(own) => deep_merge(Record::from([(key, own)]), rest, ""),
                        None => Ok(rest),
                    }
                }
                FieldSchema::ManyToOne(_) | FieldSchema::OneToOne(_) => match value {
                    Value::Record(sub) => {
                        let related = self.related(&schema, &key)?;
                        used.push(qualified);
                        let rewritten = related.rewrite_patch(action, sub, used).await?;
                        Ok(Record::from([(key, Value::Record(rewritten))]))
                    }
                    Value::Null => Ok(Record::from([(key, Value::Null)])),
                    other => Err(Error::Validation(format!(
                        "Expected a record for relation '{}.{key}', got {}",
                        self.name(),
                        other.type_name()
                    ))),
                },
                FieldSchema::OneToMany(_) | FieldSchema::ManyToMany(_) => {
                    Err(Error::Validation(format!(
                        "Cannot write to the to-many relation '{}.{key}'",
                        self.name()
                    )))
                }
            }
        }
        .boxed()
    }
}

/// Merge `other` into `base`; two different values for one field conflict.
fn deep_merge(mut base: Record, other: Record, prefix: &str) -> Result<Record> {
    for (key, value) in other {
        let path = if prefix.is_empty() {
            key.clone()
        } else {
            format!("{prefix}:{key}")
        };
        let merged = match (base.remove(&key), value) {
            (None, value) => value,
            (Some(Value::Record(left)), Value::Record(right)) => {
                Value::Record(deep_merge(left, right, &path)?)
            }
            (Some(left), right) if left == right => left,
            (Some(_), _) => return Err(Error::ConflictingWrite { field: path }),
        };
        base.insert(key, merged);
    }
    Ok(base)
}

#[async_trait]
impl CollectionDecorator for WriteCollection {
    fn new(child: CollectionRef, datasource: DataSourceHandle<Self>) -> Self {
        Self {
            base: DecoratorBase::new(child, datasource),
            handlers: RwLock::new(HashMap::new()),
        }
    }

    fn base(&self) -> &DecoratorBase<Self> {
        &self.base
    }

    fn refine_schema(&self, child_schema: &CollectionSchema) -> CollectionSchema {
        let mut schema = child_schema.clone();
        for name in read(&self.handlers).keys() {
            if let Some(column) = schema.fields.get_mut(name).and_then(FieldSchema::as_column_mut) {
                column.is_read_only = false;
            }
        }
        schema
    }

    async fn on_create(&self, records: Vec<Record>) -> Result<Vec<Record>> {
        let patched = try_join_all(
            records
                .into_iter()
                .map(|record| self.rewrite_patch(WriteAction::Create, record, vec![])),
        )
        .await?;
        self.create_relations(patched).await
    }

    async fn on_update(&self, filter: Filter, patch: Record) -> Result<()> {
        let patch = self.rewrite_patch(WriteAction::Update, patch, vec![]).await?;
        self.update_relations(filter, patch).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use veneer_core::record;

    #[test]
    fn merge_keeps_equal_values_and_nests() {
        let merged = deep_merge(
            record! { "a" => 1, "author" => record! { "name" => "x" } },
            record! { "a" => 1, "author" => record! { "age" => 3 } },
            "",
        )
        .unwrap();
        assert_eq!(merged["a"], Value::Int(1));
        assert_eq!(
            merged["author"],
            Value::Record(record! { "name" => "x", "age" => 3 })
        );
    }

    #[test]
    fn merge_rejects_two_values_for_one_field() {
        let err = deep_merge(
            record! { "author" => record! { "name" => "x" } },
            record! { "author" => record! { "name" => "y" } },
            "",
        )
        .unwrap_err();
        assert!(matches!(err, Error::ConflictingWrite { field } if field == "author:name"));
    }
}
