use std::collections::{HashMap, HashSet};

use futures::future::{try_join_all, BoxFuture};
use futures::FutureExt;
use veneer_core::condition_tree::ConditionTree;
use veneer_core::filter::PaginatedFilter;
use veneer_core::hash::{hash_value, Hash256};
use veneer_core::operator::Operator;
use veneer_core::projection::Projection;
use veneer_core::record::field_value;
use veneer_core::schema::{FieldSchema, ManyToManySchema, OneToManySchema, OneToOneSchema};
use veneer_core::types::{Record, Value};

use super::RelationCollection;
use crate::collection::Collection;
use crate::error::{Error, Result};

/// Distinct, non-null values at `path`, in order of first occurrence.
pub(super) fn distinct_values(records: &[Record], path: &str) -> Vec<Value> {
    let mut seen = HashSet::new();
    records
        .iter()
        .filter_map(|r| field_value(r, path))
        .filter(|v| !v.is_null() && seen.insert(hash_value(v)))
        .cloned()
        .collect()
}

/// List the records of `collection` whose `field` is one of `ids`, issuing
/// one `In` query per chunk of at most `max_batch` ids.
pub(super) async fn fetch_in(
    collection: &dyn Collection,
    field: &str,
    ids: Vec<Value>,
    projection: &Projection,
    max_batch: Option<usize>,
) -> Result<Vec<Record>> {
    if ids.is_empty() {
        return Ok(vec![]);
    }
    let projection = projection.union([&Projection::from([field])]);
    let chunk = max_batch.unwrap_or(ids.len()).max(1);
    let pages = try_join_all(ids.chunks(chunk).map(|ids| {
        let filter = PaginatedFilter::new().with_condition_tree(Some(ConditionTree::leaf(
            field,
            Operator::In,
            Value::List(ids.to_vec()),
        )));
        let projection = &projection;
        async move { collection.list(&filter, projection).await }
    }))
    .await?;

    #[cfg(feature = "tracing")]
    tracing::trace!(
        collection = collection.name(),
        field,
        ids = ids.len(),
        queries = pages.len(),
        "fetched related records"
    );

    Ok(pages.into_iter().flatten().collect())
}

fn index_by(records: Vec<Record>, key: &str) -> HashMap<Hash256, Vec<Record>> {
    let mut index: HashMap<Hash256, Vec<Record>> = HashMap::new();
    for record in records {
        if let Some(value) = field_value(&record, key).filter(|v| !v.is_null()) {
            index.entry(hash_value(value)).or_default().push(record);
        }
    }
    index
}

fn lookup<'a>(
    index: &'a HashMap<Hash256, Vec<Record>>,
    record: &Record,
    key: &str,
) -> Option<&'a Vec<Record>> {
    field_value(record, key)
        .filter(|v| !v.is_null())
        .and_then(|v| index.get(&hash_value(v)))
}

/// Where the related value of each record sits, for native relations.
enum Slot {
    Keep,
    One(usize),
    Many(Vec<usize>),
}

impl RelationCollection {
    /// Fill every relation of `projection` into `records`, which were
    /// fetched with the rewritten projection.
    pub(super) fn reproject<'a>(
        &'a self,
        records: Vec<Record>,
        projection: &'a Projection,
    ) -> BoxFuture<'a, Result<Vec<Record>>> {
        async move {
            let relations = projection.relations();
            if relations.is_empty() || records.is_empty() {
                return Ok(records);
            }

            let records_ref = &records;
            let values = try_join_all(relations.iter().map(|(name, sub)| async move {
                let values = match self.emulated(name) {
                    Some(relation) => self.join_emulated(relation, records_ref, sub).await?,
                    None => self.reproject_native(name, records_ref, sub).await?,
                };
                Ok::<_, Error>((name.clone(), values))
            }))
            .await?;

            let mut records = records;
            for (name, column) in values {
                for (record, value) in records.iter_mut().zip(column) {
                    if let Some(value) = value {
                        record.insert(name.clone(), value);
                    }
                }
            }
            Ok(records)
        }
        .boxed()
    }

    /// Values for one emulated relation, aligned with `records`.
    async fn join_emulated(
        &self,
        relation: FieldSchema,
        records: &[Record],
        sub: &Projection,
    ) -> Result<Vec<Option<Value>>> {
        let max_batch = self.base.config().max_relation_batch;
        let foreign_name = relation
            .foreign_collection()
            .ok_or_else(|| Error::Invariant("emulated relation is a column".into()))?
            .to_string();
        let foreign = self.base.datasource.sibling(&foreign_name)?;

        let values = match relation {
            FieldSchema::ManyToOne(r) => {
                let ids = distinct_values(records, &r.foreign_key);
                let related = fetch_in(&*foreign, &r.foreign_key_target, ids, sub, max_batch).await?;
                let index = index_by(related, &r.foreign_key_target);
                records
                    .iter()
                    .map(|record| {
                        let found = lookup(&index, record, &r.foreign_key).and_then(|m| m.first());
                        Some(found.cloned().map(Value::Record).unwrap_or(Value::Null))
                    })
                    .collect()
            }
            FieldSchema::OneToOne(OneToOneSchema {
                origin_key,
                origin_key_target,
                ..
            }) => {
                let ids = distinct_values(records, &origin_key_target);
                let related = fetch_in(&*foreign, &origin_key, ids, sub, max_batch).await?;
                let index = index_by(related, &origin_key);
                records
                    .iter()
                    .map(|record| {
                        let found = lookup(&index, record, &origin_key_target).and_then(|m| m.first());
                        Some(found.cloned().map(Value::Record).unwrap_or(Value::Null))
                    })
                    .collect()
            }
            FieldSchema::OneToMany(OneToManySchema {
                origin_key,
                origin_key_target,
                ..
            }) => {
                let ids = distinct_values(records, &origin_key_target);
                let related = fetch_in(&*foreign, &origin_key, ids, sub, max_batch).await?;
                let index = index_by(related, &origin_key);
                records
                    .iter()
                    .map(|record| Some(to_list(lookup(&index, record, &origin_key_target))))
                    .collect()
            }
            FieldSchema::ManyToMany(ManyToManySchema {
                through_collection,
                foreign_key,
                foreign_key_target,
                origin_key,
                origin_key_target,
                ..
            }) => {
                let through = self.base.datasource.sibling(&through_collection)?;
                let ids = distinct_values(records, &origin_key_target);
                let links_projection = Projection::from([foreign_key.as_str()]);
                let links = fetch_in(&*through, &origin_key, ids, &links_projection, max_batch).await?;

                let foreign_ids = distinct_values(&links, &foreign_key);
                let related = fetch_in(&*foreign, &foreign_key_target, foreign_ids, sub, max_batch).await?;
                let related = index_by(related, &foreign_key_target);
                let links = index_by(links, &origin_key);

                records
                    .iter()
                    .map(|record| {
                        let items = lookup(&links, record, &origin_key_target)
                            .map(|links| {
                                links
                                    .iter()
                                    .filter_map(|link| lookup(&related, link, &foreign_key))
                                    .flat_map(|found| found.first().cloned())
                                    .map(Value::Record)
                                    .collect()
                            })
                            .unwrap_or_default();
                        Some(Value::List(items))
                    })
                    .collect()
            }
            FieldSchema::Column(_) => {
                return Err(Error::Invariant("emulated relation is a column".into()));
            }
        };
        Ok(values)
    }

    /// The child joined this relation already; emulated relations further
    /// down still need to be filled by the sibling.
    async fn reproject_native(
        &self,
        name: &str,
        records: &[Record],
        sub: &Projection,
    ) -> Result<Vec<Option<Value>>> {
        if sub.relations().is_empty() {
            return Ok(vec![None; records.len()]);
        }
        let (_, related) = self.related(name)?;

        let mut items = Vec::new();
        let slots: Vec<Slot> = records
            .iter()
            .map(|record| match record.get(name) {
                Some(Value::Record(item)) => {
                    items.push(item.clone());
                    Slot::One(items.len() - 1)
                }
                Some(Value::List(list)) => Slot::Many(
                    list.iter()
                        .filter_map(Value::as_record)
                        .map(|item| {
                            items.push(item.clone());
                            items.len() - 1
                        })
                        .collect(),
                ),
                _ => Slot::Keep,
            })
            .collect();

        let mut items: Vec<Option<Record>> = related
            .reproject(items, sub)
            .await?
            .into_iter()
            .map(Some)
            .collect();
        let mut take = |i: usize| items.get_mut(i).and_then(Option::take).map(Value::Record);

        Ok(slots
            .into_iter()
            .map(|slot| match slot {
                Slot::Keep => None,
                Slot::One(i) => take(i),
                Slot::Many(indices) => Some(Value::List(indices.into_iter().filter_map(&mut take).collect())),
            })
            .collect())
    }
}

fn to_list(found: Option<&Vec<Record>>) -> Value {
    Value::List(
        found
            .map(|records| records.iter().cloned().map(Value::Record).collect())
            .unwrap_or_default(),
    )
}
