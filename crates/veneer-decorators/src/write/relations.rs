use futures::future::{try_join_all, BoxFuture};
use futures::FutureExt;
use veneer_core::condition_tree::ConditionTree;
use veneer_core::filter::{Filter, PaginatedFilter};
use veneer_core::operator::Operator;
use veneer_core::projection::Projection;
use veneer_core::record::field_value;
use veneer_core::schema::{CollectionSchema, FieldSchema, ManyToOneSchema, OneToOneSchema};
use veneer_core::types::{Record, Value};

use super::WriteCollection;
use crate::collection::Collection;
use crate::error::{Error, Result};

/// A patch split into its own columns and the sub-records of its relations.
struct Split {
    columns: Record,
    many_to_one: Vec<(ManyToOneSchema, String, Record)>,
    one_to_one: Vec<(OneToOneSchema, String, Record)>,
}

fn split(schema: &CollectionSchema, record: Record) -> Split {
    let mut split = Split {
        columns: Record::new(),
        many_to_one: vec![],
        one_to_one: vec![],
    };
    for (key, value) in record {
        match (schema.field(&key), value) {
            (Some(FieldSchema::ManyToOne(r)), Value::Record(sub)) => {
                split.many_to_one.push((r.clone(), key, sub))
            }
            (Some(FieldSchema::OneToOne(r)), Value::Record(sub)) => {
                split.one_to_one.push((r.clone(), key, sub))
            }
            // Null relation values carry nothing to write.
            (Some(field), _) if !field.is_column() => {}
            (_, value) => {
                split.columns.insert(key, value);
            }
        }
    }
    split
}

fn equal(field: &str, value: Value) -> Filter {
    Filter::new().with_condition_tree(Some(ConditionTree::leaf(field, Operator::Equal, value)))
}

fn defined(record: &Record, path: &str) -> Option<Value> {
    field_value(record, path).filter(|v| !v.is_null()).cloned()
}

impl WriteCollection {
    /// Create `records`, writing ManyToOne sub-records first so their keys
    /// can be stored on the parents, and OneToOne sub-records last so they
    /// can point back at the created parents.
    pub(super) fn create_relations(&self, records: Vec<Record>) -> BoxFuture<'_, Result<Vec<Record>>> {
        async move {
            let schema = self.schema();
            let splits: Vec<Split> = records.into_iter().map(|r| split(&schema, r)).collect();

            let parents = try_join_all(splits.iter().map(|s| self.attach_many_to_one(s))).await?;
            let created = self.base.child.create(parents).await?;
            if created.len() != splits.len() {
                return Err(Error::Invariant(format!(
                    "'{}' created {} records out of {}",
                    self.name(),
                    created.len(),
                    splits.len()
                )));
            }

            let created_ref = &created;
            try_join_all(splits.into_iter().enumerate().flat_map(|(i, s)| {
                s.one_to_one.into_iter().map(move |(relation, name, mut sub)| async move {
                    let target = defined(&created_ref[i], &relation.origin_key_target).ok_or_else(|| {
                        Error::Validation(format!(
                            "'{}.{}' is needed to create '{name}' but was not returned",
                            self.name(),
                            relation.origin_key_target
                        ))
                    })?;
                    sub.insert(relation.origin_key.clone(), target);
                    let related = self.base.datasource.sibling(&relation.foreign_collection)?;
                    related.create_relations(vec![sub]).await
                })
            }))
            .await?;

            Ok(created)
        }
        .boxed()
    }

    /// The parent's columns, with the key of every ManyToOne sub-record
    /// written in. Sub-records are updated when the parent already names
    /// one, created otherwise.
    async fn attach_many_to_one(&self, split: &Split) -> Result<Record> {
        let keys = try_join_all(split.many_to_one.iter().map(|(relation, _, sub)| async move {
            let related = self.base.datasource.sibling(&relation.foreign_collection)?;
            match defined(&split.columns, &relation.foreign_key) {
                Some(key) => {
                    related
                        .update_relations(equal(&relation.foreign_key_target, key.clone()), sub.clone())
                        .await?;
                    Ok::<_, Error>((relation.foreign_key.clone(), key))
                }
                None => {
                    let created = related.create_relations(vec![sub.clone()]).await?;
                    let key = created
                        .first()
                        .and_then(|r| defined(r, &relation.foreign_key_target))
                        .ok_or_else(|| {
                            Error::Validation(format!(
                                "'{}.{}' was not returned on create",
                                relation.foreign_collection, relation.foreign_key_target
                            ))
                        })?;
                    Ok((relation.foreign_key.clone(), key))
                }
            }
        }))
        .await?;

        let mut parent = split.columns.clone();
        parent.extend(keys);
        Ok(parent)
    }

    /// Update the records matching `filter`: columns first, then the related
    /// records, creating the ones that do not exist yet.
    pub(super) fn update_relations(&self, filter: Filter, patch: Record) -> BoxFuture<'_, Result<()>> {
        async move {
            let schema = self.schema();
            let Split {
                columns,
                many_to_one,
                one_to_one,
            } = split(&schema, patch);

            if !columns.is_empty() {
                self.base.child.update(&filter, columns).await?;
            }
            if many_to_one.is_empty() && one_to_one.is_empty() {
                return Ok(());
            }

            let mut projection = Projection::new();
            for (relation, _, _) in &many_to_one {
                projection.push(relation.foreign_key.clone());
            }
            for (relation, name, _) in &one_to_one {
                projection.push(relation.origin_key_target.clone());
                projection.push(format!("{name}:{}", relation.origin_key));
            }
            let projection = projection.with_pks(self.name(), &self.base.datasource)?;
            let targets = self
                .base
                .child
                .list(&PaginatedFilter::from(filter), &projection)
                .await?;

            let schema = &schema;
            let many_to_one = &many_to_one;
            let one_to_one = &one_to_one;
            try_join_all(targets.iter().flat_map(|record| {
                let parents = many_to_one.iter().map(move |(relation, _, sub)| {
                    self.update_many_to_one(schema, record, relation, sub).boxed()
                });
                let children = one_to_one.iter().map(move |(relation, name, sub)| {
                    self.update_one_to_one(record, relation, name, sub).boxed()
                });
                parents.chain(children)
            }))
            .await?;
            Ok(())
        }
        .boxed()
    }

    async fn update_many_to_one(
        &self,
        schema: &CollectionSchema,
        record: &Record,
        relation: &ManyToOneSchema,
        sub: &Record,
    ) -> Result<()> {
        let related = self.base.datasource.sibling(&relation.foreign_collection)?;
        if let Some(key) = defined(record, &relation.foreign_key) {
            return related
                .update_relations(equal(&relation.foreign_key_target, key), sub.clone())
                .await;
        }

        let created = related.create_relations(vec![sub.clone()]).await?;
        let key = created
            .first()
            .and_then(|r| defined(r, &relation.foreign_key_target))
            .unwrap_or(Value::Null);
        let this = Filter::new().with_condition_tree(Some(ConditionTree::match_records(
            schema,
            std::slice::from_ref(record),
        )?));
        self.base
            .child
            .update(&this, Record::from([(relation.foreign_key.clone(), key)]))
            .await
    }

    async fn update_one_to_one(
        &self,
        record: &Record,
        relation: &OneToOneSchema,
        name: &str,
        sub: &Record,
    ) -> Result<()> {
        let related = self.base.datasource.sibling(&relation.foreign_collection)?;
        let Some(target) = defined(record, &relation.origin_key_target) else {
            return Ok(());
        };
        if matches!(record.get(name), Some(Value::Record(_))) {
            return related
                .update_relations(equal(&relation.origin_key, target), sub.clone())
                .await;
        }
        let mut sub = sub.clone();
        sub.insert(relation.origin_key.clone(), target);
        related.create_relations(vec![sub]).await.map(|_| ())
    }
}
