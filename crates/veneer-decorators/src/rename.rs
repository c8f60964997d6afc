//! Field renaming.
//!
//! Every path crossing the decorator is translated between the public names
//! and the child's names, recursively through relations using the related
//! collection's own renames.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use veneer_core::aggregation::{AggregateResult, Aggregation};
use veneer_core::filter::{Filter, PaginatedFilter};
use veneer_core::projection::Projection;
use veneer_core::schema::{
    CollectionSchema, FieldSchema, ManyToManySchema, ManyToOneSchema, OneToManySchema,
    OneToOneSchema,
};
use veneer_core::sort::SortClause;
use veneer_core::types::{Record, Value};

use crate::collection::{Collection, CollectionRef};
use crate::datasource::{read, write};
use crate::decorator::{CollectionDecorator, DataSourceHandle, DecoratorBase};
use crate::error::{Error, Result};

#[derive(Debug, Clone, Default)]
struct RenameMaps {
    from_child: HashMap<String, String>,
    to_child: HashMap<String, String>,
}

impl RenameMaps {
    fn public(&self, child_name: &str) -> String {
        self.from_child
            .get(child_name)
            .cloned()
            .unwrap_or_else(|| child_name.to_string())
    }

    fn child(&self, public_name: &str) -> String {
        self.to_child
            .get(public_name)
            .cloned()
            .unwrap_or_else(|| public_name.to_string())
    }
}

pub struct RenameCollection {
    base: DecoratorBase<RenameCollection>,
    maps: RwLock<RenameMaps>,
}

impl RenameCollection {
    /// Expose field `current` as `new`. Renaming a field back to its child
    /// name cancels the rename.
    pub fn rename_field(&self, current: &str, new: &str) -> Result<()> {
        let collection = self.name().to_string();
        let schema = self.schema();
        if schema.field(current).is_none() {
            return Err(Error::Validation(format!(
                "No such field '{collection}.{current}'"
            )));
        }
        if new.contains(':') {
            return Err(Error::Validation(format!(
                "Field name '{collection}.{new}' cannot contain ':'"
            )));
        }
        if current == new {
            return Ok(());
        }
        if schema.field(new).is_some() {
            return Err(Error::Validation(format!(
                "Field '{collection}.{new}' already exists"
            )));
        }

        {
            let mut maps = write(&self.maps);
            let child_name = maps.child(current);
            maps.to_child.remove(current);
            maps.from_child.remove(&child_name);
            if child_name != new {
                maps.to_child.insert(new.to_string(), child_name.clone());
                maps.from_child.insert(child_name, new.to_string());
            }
        }

        #[cfg(feature = "tracing")]
        tracing::debug!(collection = %collection, from = current, to = new, "renamed field");

        // Relations declared on other collections name our columns as keys.
        for sibling in self.base.datasource.siblings() {
            sibling.base.mark_schema_as_dirty();
        }
        self.base.mark_schema_as_dirty();
        Ok(())
    }

    fn maps(&self) -> RenameMaps {
        read(&self.maps).clone()
    }

    fn maps_of(&self, collection: &str) -> Result<RenameMaps> {
        Ok(self.base.datasource.sibling(collection)?.maps())
    }

    fn related_by<'a>(
        &self,
        schema: &'a CollectionSchema,
        relation: &str,
    ) -> Result<(&'a FieldSchema, Arc<RenameCollection>)> {
        let field = schema.field(relation).ok_or_else(|| {
            Error::Core(veneer_core::Error::UnknownField {
                collection: self.name().to_string(),
                field: relation.to_string(),
            })
        })?;
        let foreign = field.foreign_collection().ok_or_else(|| {
            Error::Validation(format!(
                "Unexpected field type: '{}.{relation}' (found 'Column' expected relation)",
                self.name()
            ))
        })?;
        Ok((field, self.base.datasource.sibling(foreign)?))
    }

    fn path_to_child(&self, path: &str) -> Result<String> {
        let child = self.maps();
        match path.split_once(':') {
            None => Ok(child.child(path)),
            Some((head, rest)) => {
                let schema = self.schema();
                let (_, related) = self.related_by(&schema, head)?;
                Ok(format!("{}:{}", child.child(head), related.path_to_child(rest)?))
            }
        }
    }

    fn record_from_child(&self, record: Record) -> Result<Record> {
        let maps = self.maps();
        let schema = self.base.child.schema();
        let mut out = Record::new();
        for (name, value) in record {
            let value = match schema.field(&name) {
                Some(field) if !field.is_column() => {
                    let (_, related) = self.related_by(&schema, &name)?;
                    map_related(value, |r| related.record_from_child(r))?
                }
                _ => value,
            };
            out.insert(maps.public(&name), value);
        }
        Ok(out)
    }

    fn record_to_child(&self, record: Record) -> Result<Record> {
        let maps = self.maps();
        let schema = self.schema();
        let mut out = Record::new();
        for (name, value) in record {
            let value = match schema.field(&name) {
                Some(field) if !field.is_column() => {
                    let (_, related) = self.related_by(&schema, &name)?;
                    map_related(value, |r| related.record_to_child(r))?
                }
                _ => value,
            };
            out.insert(maps.child(&name), value);
        }
        Ok(out)
    }

    fn filter_to_child(&self, filter: Filter) -> Result<Filter> {
        let tree = filter
            .condition_tree
            .as_ref()
            .map(|tree| {
                tree.try_replace_leafs(|leaf| Ok::<_, Error>(leaf.with_field(self.path_to_child(&leaf.field)?).into()))
            })
            .transpose()?;
        Ok(filter.with_condition_tree(tree))
    }
}

/// Apply `f` to a related record or to every record of a related list.
fn map_related(value: Value, mut f: impl FnMut(Record) -> Result<Record>) -> Result<Value> {
    Ok(match value {
        Value::Record(record) => Value::Record(f(record)?),
        Value::List(items) => Value::List(
            items
                .into_iter()
                .map(|item| match item {
                    Value::Record(record) => f(record).map(Value::Record),
                    other => Ok(other),
                })
                .collect::<Result<Vec<_>>>()?,
        ),
        other => other,
    })
}

#[async_trait]
impl CollectionDecorator for RenameCollection {
    fn new(child: CollectionRef, datasource: DataSourceHandle<Self>) -> Self {
        Self {
            base: DecoratorBase::new(child, datasource),
            maps: RwLock::new(RenameMaps::default()),
        }
    }

    fn base(&self) -> &DecoratorBase<Self> {
        &self.base
    }

    fn refine_schema(&self, child_schema: &CollectionSchema) -> CollectionSchema {
        let own = self.maps();
        let name = self.name().to_string();
        // A sibling that cannot be found keeps its child names.
        let public = |collection: &str, field: &str| -> String {
            if collection == name {
                return own.public(field);
            }
            self.maps_of(collection)
                .map(|maps| maps.public(field))
                .unwrap_or_else(|_| field.to_string())
        };

        let mut schema = child_schema.clone();
        schema.fields = child_schema
            .fields
            .iter()
            .map(|(field_name, field)| {
                let field = match field {
                    FieldSchema::Column(column) => FieldSchema::Column(column.clone()),
                    FieldSchema::ManyToOne(r) => FieldSchema::ManyToOne(ManyToOneSchema {
                        foreign_collection: r.foreign_collection.clone(),
                        foreign_key: public(&name, &r.foreign_key),
                        foreign_key_target: public(&r.foreign_collection, &r.foreign_key_target),
                    }),
                    FieldSchema::OneToOne(r) => FieldSchema::OneToOne(OneToOneSchema {
                        foreign_collection: r.foreign_collection.clone(),
                        origin_key: public(&r.foreign_collection, &r.origin_key),
                        origin_key_target: public(&name, &r.origin_key_target),
                    }),
                    FieldSchema::OneToMany(r) => FieldSchema::OneToMany(OneToManySchema {
                        foreign_collection: r.foreign_collection.clone(),
                        origin_key: public(&r.foreign_collection, &r.origin_key),
                        origin_key_target: public(&name, &r.origin_key_target),
                    }),
                    FieldSchema::ManyToMany(r) => FieldSchema::ManyToMany(ManyToManySchema {
                        foreign_collection: r.foreign_collection.clone(),
                        through_collection: r.through_collection.clone(),
                        foreign_key: public(&r.through_collection, &r.foreign_key),
                        foreign_key_target: public(&r.foreign_collection, &r.foreign_key_target),
                        origin_key: public(&r.through_collection, &r.origin_key),
                        origin_key_target: public(&name, &r.origin_key_target),
                    }),
                };
                (own.public(field_name), field)
            })
            .collect();
        schema
    }

    async fn refine_filter(&self, filter: PaginatedFilter) -> Result<PaginatedFilter> {
        let sort = filter
            .sort
            .as_ref()
            .map(|sort| {
                sort.try_replace_clauses(|clause| {
                    Ok::<_, Error>([SortClause {
                        field: self.path_to_child(&clause.field)?,
                        ascending: clause.ascending,
                    }])
                })
            })
            .transpose()?;
        let PaginatedFilter { filter, page, .. } = filter;
        Ok(PaginatedFilter {
            filter: self.filter_to_child(filter)?,
            sort,
            page,
        })
    }

    async fn on_list(&self, filter: PaginatedFilter, projection: &Projection) -> Result<Vec<Record>> {
        let child_projection = projection.try_replace(|path| self.path_to_child(path).map(|p| [p]))?;
        self.base
            .child
            .list(&filter, &child_projection)
            .await?
            .into_iter()
            .map(|record| self.record_from_child(record))
            .collect()
    }

    async fn on_aggregate(
        &self,
        filter: Filter,
        aggregation: &Aggregation,
        limit: Option<usize>,
    ) -> Result<Vec<AggregateResult>> {
        let child_aggregation = aggregation.try_replace_fields(|field| self.path_to_child(field))?;
        let group_names: HashMap<&str, &str> = child_aggregation
            .groups
            .iter()
            .zip(&aggregation.groups)
            .map(|(child, public)| (child.field.as_str(), public.field.as_str()))
            .collect();

        let results = self
            .base
            .child
            .aggregate(&filter, &child_aggregation, limit)
            .await?;
        Ok(results
            .into_iter()
            .map(|result| AggregateResult {
                value: result.value,
                group: result
                    .group
                    .into_iter()
                    .map(|(key, value)| {
                        let key = group_names.get(key.as_str()).map(|k| k.to_string()).unwrap_or(key);
                        (key, value)
                    })
                    .collect(),
            })
            .collect())
    }

    async fn on_create(&self, records: Vec<Record>) -> Result<Vec<Record>> {
        let records = records
            .into_iter()
            .map(|record| self.record_to_child(record))
            .collect::<Result<Vec<_>>>()?;
        self.base
            .child
            .create(records)
            .await?
            .into_iter()
            .map(|record| self.record_from_child(record))
            .collect()
    }

    async fn on_update(&self, filter: Filter, patch: Record) -> Result<()> {
        let patch = self.record_to_child(patch)?;
        self.base.child.update(&filter, patch).await
    }
}
