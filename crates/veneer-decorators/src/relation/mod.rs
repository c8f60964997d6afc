//! Relations emulated on top of collections that cannot join natively.
//!
//! Projections through an emulated relation are rewritten to the local key,
//! related records are fetched with one batched `In` query per relation and
//! merged in memory. Filters crossing an emulated relation are pre-queried
//! on the related collection and pushed down as `In` leaves on the key.

mod join;

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use futures::future::{try_join_all, BoxFuture};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use veneer_core::aggregation::{AggregateResult, Aggregation};
use veneer_core::condition_tree::{ConditionLeaf, ConditionTree};
use veneer_core::filter::{Filter, PaginatedFilter};
use veneer_core::operator::Operator;
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
use crate::metrics;

/// A relation as declared by the caller. Omitted `*_target` keys default to
/// the primary key of the collection they live on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum RelationDefinition {
    ManyToOne {
        foreign_collection: String,
        foreign_key: String,
        foreign_key_target: Option<String>,
    },
    OneToOne {
        foreign_collection: String,
        origin_key: String,
        origin_key_target: Option<String>,
    },
    OneToMany {
        foreign_collection: String,
        origin_key: String,
        origin_key_target: Option<String>,
    },
    ManyToMany {
        foreign_collection: String,
        through_collection: String,
        foreign_key: String,
        foreign_key_target: Option<String>,
        origin_key: String,
        origin_key_target: Option<String>,
    },
}

pub struct RelationCollection {
    base: DecoratorBase<RelationCollection>,
    relations: RwLock<BTreeMap<String, FieldSchema>>,
}

impl RelationCollection {
    pub fn add_relation(&self, name: &str, definition: RelationDefinition) -> Result<()> {
        if name.contains(':') {
            return Err(Error::Validation(format!(
                "Relation name '{}.{name}' cannot contain ':'",
                self.name()
            )));
        }
        if self.schema().field(name).is_some() {
            return Err(Error::Validation(format!(
                "Field '{}.{name}' already exists",
                self.name()
            )));
        }

        let relation = self.complete(definition)?;
        match &relation {
            FieldSchema::ManyToOne(r) => {
                self.check_keys(self.name(), &r.foreign_key, &r.foreign_collection, &r.foreign_key_target)?;
            }
            FieldSchema::OneToOne(OneToOneSchema {
                foreign_collection,
                origin_key,
                origin_key_target,
            })
            | FieldSchema::OneToMany(OneToManySchema {
                foreign_collection,
                origin_key,
                origin_key_target,
            }) => {
                self.check_keys(foreign_collection, origin_key, self.name(), origin_key_target)?;
            }
            FieldSchema::ManyToMany(r) => {
                self.check_keys(&r.through_collection, &r.foreign_key, &r.foreign_collection, &r.foreign_key_target)?;
                self.check_keys(&r.through_collection, &r.origin_key, self.name(), &r.origin_key_target)?;
            }
            FieldSchema::Column(_) => {
                return Err(Error::Invariant("relation completed to a column".into()));
            }
        }

        #[cfg(feature = "tracing")]
        tracing::debug!(collection = self.name(), relation = name, kind = relation.kind(), "added relation");

        write(&self.relations).insert(name.to_string(), relation);
        self.base.mark_schema_as_dirty();
        Ok(())
    }

    fn complete(&self, definition: RelationDefinition) -> Result<FieldSchema> {
        Ok(match definition {
            RelationDefinition::ManyToOne {
                foreign_collection,
                foreign_key,
                foreign_key_target,
            } => FieldSchema::ManyToOne(ManyToOneSchema {
                foreign_key_target: self.target_or_pk(foreign_key_target, &foreign_collection)?,
                foreign_collection,
                foreign_key,
            }),
            RelationDefinition::OneToOne {
                foreign_collection,
                origin_key,
                origin_key_target,
            } => FieldSchema::OneToOne(OneToOneSchema {
                origin_key_target: self.target_or_pk(origin_key_target, self.name())?,
                foreign_collection,
                origin_key,
            }),
            RelationDefinition::OneToMany {
                foreign_collection,
                origin_key,
                origin_key_target,
            } => FieldSchema::OneToMany(OneToManySchema {
                origin_key_target: self.target_or_pk(origin_key_target, self.name())?,
                foreign_collection,
                origin_key,
            }),
            RelationDefinition::ManyToMany {
                foreign_collection,
                through_collection,
                foreign_key,
                foreign_key_target,
                origin_key,
                origin_key_target,
            } => FieldSchema::ManyToMany(ManyToManySchema {
                foreign_key_target: self.target_or_pk(foreign_key_target, &foreign_collection)?,
                origin_key_target: self.target_or_pk(origin_key_target, self.name())?,
                foreign_collection,
                through_collection,
                foreign_key,
                origin_key,
            }),
        })
    }

    fn target_or_pk(&self, target: Option<String>, collection: &str) -> Result<String> {
        if let Some(target) = target {
            return Ok(target);
        }
        let schema = self.base.datasource.sibling(collection)?.schema();
        match schema.primary_keys().as_slice() {
            [pk] => Ok(pk.clone()),
            _ => Err(Error::Validation(format!(
                "Collection '{collection}' must have exactly one primary key to be targeted by a relation"
            ))),
        }
    }

    /// `owner.key` and `target_owner.target` must both be `In`-filterable
    /// columns of the same type.
    fn check_keys(&self, owner: &str, key: &str, target_owner: &str, target: &str) -> Result<()> {
        let key_type = self.check_column(owner, key)?;
        let target_type = self.check_column(target_owner, target)?;
        if key_type != target_type {
            return Err(Error::Validation(format!(
                "Types from '{owner}.{key}' and '{target_owner}.{target}' do not match."
            )));
        }
        Ok(())
    }

    fn check_column(&self, owner: &str, name: &str) -> Result<veneer_core::schema::ColumnType> {
        let schema = self.base.datasource.sibling(owner)?.schema();
        let column = schema
            .column(name)
            .ok_or_else(|| Error::Validation(format!("Column not found: '{owner}.{name}'")))?;
        if !column.supports(Operator::In) {
            return Err(Error::Validation(format!(
                "Column does not support the In operator: '{owner}.{name}'"
            )));
        }
        Ok(column.column_type)
    }

    fn emulated(&self, name: &str) -> Option<FieldSchema> {
        read(&self.relations).get(name).cloned()
    }

    fn related(&self, relation: &str) -> Result<(FieldSchema, Arc<RelationCollection>)> {
        let schema = self.schema();
        let field = schema.field(relation).cloned().ok_or_else(|| {
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
        let collection = self.base.datasource.sibling(foreign)?;
        Ok((field, collection))
    }

    /// Whether `path` crosses an emulated relation anywhere along its length.
    fn is_emulated(&self, path: &str) -> Result<bool> {
        let Some((prefix, rest)) = path.split_once(':') else {
            return Ok(false);
        };
        if self.emulated(prefix).is_some() {
            return Ok(true);
        }
        self.related(prefix)?.1.is_emulated(rest)
    }

    /// Child-side paths needed to produce `path`.
    fn rewrite_field(&self, path: &str) -> Result<Projection> {
        let Some((prefix, rest)) = path.split_once(':') else {
            return Ok(Projection::from([path]));
        };
        match self.emulated(prefix) {
            Some(FieldSchema::ManyToOne(r)) => Ok(Projection::from([r.foreign_key.as_str()])),
            Some(FieldSchema::OneToOne(OneToOneSchema { origin_key_target, .. }))
            | Some(FieldSchema::OneToMany(OneToManySchema { origin_key_target, .. }))
            | Some(FieldSchema::ManyToMany(ManyToManySchema { origin_key_target, .. })) => {
                Ok(Projection::from([origin_key_target.as_str()]))
            }
            Some(FieldSchema::Column(_)) | None => {
                let (_, related) = self.related(prefix)?;
                Ok(related.rewrite_field(rest)?.nest(prefix))
            }
        }
    }

    // Sorting through an emulated relation sorts on the raw foreign key.
    // The order is only approximate; exact ordering by a related field needs
    // the relation to be native.
    fn rewrite_sort_clause(&self, clause: &SortClause) -> Result<Vec<SortClause>> {
        Ok(self
            .rewrite_field(&clause.field)?
            .into_iter()
            .map(|field| SortClause {
                field,
                ascending: clause.ascending,
            })
            .collect())
    }

    /// Replace a leaf crossing an emulated relation by an `In` leaf on the
    /// local key, computed by querying the related collection.
    fn rewrite_leaf<'a>(&'a self, leaf: &'a ConditionLeaf) -> BoxFuture<'a, Result<ConditionTree>> {
        async move {
            let Some((prefix, rest)) = leaf.field.split_once(':') else {
                return Ok(ConditionTree::Leaf(leaf.clone()));
            };
            let (_, related) = self.related(prefix)?;
            let Some(relation) = self.emulated(prefix) else {
                let nested = related.rewrite_leaf(&leaf.with_field(rest)).await?;
                return Ok(nested.nest(prefix));
            };
            let sub_filter = PaginatedFilter::new()
                .with_condition_tree(Some(ConditionTree::Leaf(leaf.with_field(rest))));

            let (local_key, values) = match relation {
                FieldSchema::ManyToOne(r) => {
                    let target = Projection::from([r.foreign_key_target.as_str()]);
                    let records = related.list(&sub_filter, &target).await?;
                    (r.foreign_key, join::distinct_values(&records, &r.foreign_key_target))
                }
                FieldSchema::OneToOne(OneToOneSchema {
                    origin_key,
                    origin_key_target,
                    ..
                })
                | FieldSchema::OneToMany(OneToManySchema {
                    origin_key,
                    origin_key_target,
                    ..
                }) => {
                    let records = related
                        .list(&sub_filter, &Projection::from([origin_key.as_str()]))
                        .await?;
                    (origin_key_target, join::distinct_values(&records, &origin_key))
                }
                FieldSchema::ManyToMany(r) => {
                    let foreign = related
                        .list(&sub_filter, &Projection::from([r.foreign_key_target.as_str()]))
                        .await?;
                    let ids = join::distinct_values(&foreign, &r.foreign_key_target);
                    let through = self.base.datasource.sibling(&r.through_collection)?;
                    let links = join::fetch_in(
                        &*through,
                        &r.foreign_key,
                        ids,
                        &Projection::from([r.origin_key.as_str()]),
                        self.base.config().max_relation_batch,
                    )
                    .await?;
                    (r.origin_key_target, join::distinct_values(&links, &r.origin_key))
                }
                FieldSchema::Column(_) => {
                    return Err(Error::Invariant("emulated relation is a column".into()));
                }
            };

            Ok(ConditionTree::leaf(local_key, Operator::In, Value::List(values)))
        }
        .boxed()
    }

    async fn rewrite_condition_tree(&self, tree: &ConditionTree) -> Result<ConditionTree> {
        let leafs: Vec<ConditionLeaf> = tree.leafs().into_iter().cloned().collect();
        if !leafs.iter().any(|l| l.field.contains(':')) {
            return Ok(tree.clone());
        }
        let mut rewritten = try_join_all(leafs.iter().map(|leaf| self.rewrite_leaf(leaf)))
            .await?
            .into_iter();
        tree.try_replace_leafs(|_| {
            rewritten
                .next()
                .ok_or_else(|| Error::Invariant("condition tree changed while rewriting".into()))
        })
    }
}

#[async_trait]
impl CollectionDecorator for RelationCollection {
    fn new(child: CollectionRef, datasource: DataSourceHandle<Self>) -> Self {
        Self {
            base: DecoratorBase::new(child, datasource),
            relations: RwLock::new(BTreeMap::new()),
        }
    }

    fn base(&self) -> &DecoratorBase<Self> {
        &self.base
    }

    fn refine_schema(&self, child_schema: &CollectionSchema) -> CollectionSchema {
        let mut schema = child_schema.clone();
        for (name, relation) in read(&self.relations).iter() {
            schema.fields.insert(name.clone(), relation.clone());
        }
        schema
    }

    async fn refine_filter(&self, filter: PaginatedFilter) -> Result<PaginatedFilter> {
        let tree = match filter.condition_tree() {
            Some(tree) => Some(self.rewrite_condition_tree(tree).await?),
            None => None,
        };
        let sort = filter
            .sort
            .as_ref()
            .map(|sort| sort.try_replace_clauses(|clause| self.rewrite_sort_clause(clause)))
            .transpose()?;
        Ok(filter.with_condition_tree(tree).with_sort(sort))
    }

    async fn on_list(&self, filter: PaginatedFilter, projection: &Projection) -> Result<Vec<Record>> {
        let child_projection = projection
            .try_replace(|path| self.rewrite_field(path))?
            .with_pks(self.name(), &self.base.datasource)?;
        let records = self.base.child.list(&filter, &child_projection).await?;
        if records.is_empty() {
            return Ok(records);
        }
        let records = self.reproject(records, projection).await?;
        Ok(projection.apply_all(&records))
    }

    async fn on_aggregate(
        &self,
        filter: Filter,
        aggregation: &Aggregation,
        limit: Option<usize>,
    ) -> Result<Vec<AggregateResult>> {
        let mut emulated = false;
        for path in aggregation.projection().iter() {
            emulated |= self.is_emulated(path)?;
        }
        if !emulated {
            return self.base.child.aggregate(&filter, aggregation, limit).await;
        }

        metrics::emit_event(
            "aggregate.emulated",
            &[("collection", self.name().to_string()), ("reason", "relation".into())],
        );
        let records = self
            .on_list(PaginatedFilter::from(filter.clone()), &aggregation.projection())
            .await?;
        let config = self.base.config();
        let timezone = filter.effective_timezone(&config.default_timezone);
        Ok(aggregation.apply(&records, timezone, limit)?)
    }
}
