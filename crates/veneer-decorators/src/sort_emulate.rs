//! Sorting on fields the child cannot sort.
//!
//! A field is either emulated (full scan then in-memory sort) or declared
//! equivalent to another sort, which is substituted before reaching the
//! child. Substitutions chain and may cross relations.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use veneer_core::condition_tree::ConditionTree;
use veneer_core::filter::PaginatedFilter;
use veneer_core::hash::hash_values;
use veneer_core::projection::Projection;
use veneer_core::record::primary_key;
use veneer_core::schema::{CollectionSchema, FieldSchema};
use veneer_core::sort::{Sort, SortClause};
use veneer_core::types::Record;

use crate::collection::{Collection, CollectionRef};
use crate::datasource::{read, write};
use crate::decorator::{CollectionDecorator, DataSourceHandle, DecoratorBase};
use crate::error::{Error, Result};
use crate::metrics;
use crate::validation::validate_column;

pub struct SortEmulateCollection {
    base: DecoratorBase<SortEmulateCollection>,
    /// `None` emulates the field; `Some` substitutes an equivalent sort.
    sorts: RwLock<HashMap<String, Option<Sort>>>,
}

impl SortEmulateCollection {
    /// Sort `name` in memory after scanning every matching record.
    pub fn emulate_field_sorting(&self, name: &str) -> Result<()> {
        self.replace_field_sorting(name, None)
    }

    /// Sort `name` with `equivalent` instead, or by full scan when `None`.
    pub fn replace_field_sorting(&self, name: &str, equivalent: Option<Sort>) -> Result<()> {
        let collection = self.name().to_string();
        if name.contains(':') {
            return Err(Error::Validation(format!(
                "Cannot replace sort on relation '{collection}.{name}'"
            )));
        }
        if self.schema().column(name).is_none() {
            return Err(Error::Validation(format!(
                "Column not found: '{collection}.{name}'"
            )));
        }
        if let Some(sort) = &equivalent {
            if sort.is_empty() {
                return Err(Error::Validation(format!(
                    "Equivalent sort for '{collection}.{name}' cannot be empty"
                )));
            }
            for clause in sort.iter() {
                validate_column(&self.base.datasource, &collection, &clause.field)?;
            }
        }

        #[cfg(feature = "tracing")]
        tracing::debug!(
            collection = %collection,
            field = name,
            emulated = equivalent.is_none(),
            "replaced field sorting"
        );

        write(&self.sorts).insert(name.to_string(), equivalent);
        self.base.mark_schema_as_dirty();
        Ok(())
    }

    fn related(&self, relation: &str) -> Result<Arc<SortEmulateCollection>> {
        let schema = self.schema();
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

    /// Expand substitutions in `clause` until only native or emulated fields
    /// remain. `visited` holds the `collection.field` replacements being
    /// expanded, across relation hops.
    fn rewrite_clause(&self, clause: &SortClause, visited: &mut Vec<String>) -> Result<Sort> {
        // Clauses through a relation are handed to the related collection.
        // If nothing there replaces the field and the relation is emulated
        // further down, the sort ends up on the raw foreign key.
        if let Some((prefix, rest)) = clause.field.split_once(':') {
            let nested = SortClause {
                field: rest.to_string(),
                ascending: clause.ascending,
            };
            let related = self.related(prefix)?;
            return Ok(related.rewrite_clause(&nested, visited)?.nest(prefix));
        }

        let equivalent = match read(&self.sorts).get(&clause.field) {
            Some(Some(sort)) => sort.clone(),
            _ => return Ok(Sort::new([clause.clone()])),
        };
        let key = format!("{}.{}", self.name(), clause.field);
        if visited.contains(&key) {
            visited.push(key);
            return Err(Error::CyclicDependency(format!(
                "sort replacement refers back to itself: {}",
                visited.join(" -> ")
            )));
        }
        visited.push(key);
        let equivalent = if clause.ascending {
            equivalent
        } else {
            equivalent.inverse()
        };
        let rewritten = equivalent.try_replace_clauses(|c| self.rewrite_clause(c, visited));
        visited.pop();
        rewritten
    }

    fn is_emulated(&self, path: &str) -> Result<bool> {
        match path.split_once(':') {
            Some((prefix, rest)) => self.related(prefix)?.is_emulated(rest),
            None => Ok(matches!(read(&self.sorts).get(path), Some(None))),
        }
    }

    /// The caller's sort followed by the primary keys, which follow the
    /// direction of the last clause so that inverting the sort inverts the
    /// whole order.
    fn total_order(&self, sort: &Sort, schema: &CollectionSchema) -> Sort {
        let ascending = sort.clauses().last().map(|c| c.ascending).unwrap_or(true);
        let mut total = sort.clone();
        for pk in schema.primary_keys() {
            if !sort.iter().any(|c| c.field == pk) {
                total.push(SortClause { field: pk, ascending });
            }
        }
        total
    }

    async fn list_emulated(
        &self,
        filter: PaginatedFilter,
        sort: Sort,
        projection: &Projection,
    ) -> Result<Vec<Record>> {
        let schema = self.schema();
        let config = self.base.config();

        let scan_projection = sort.projection().with_pks(self.name(), &self.base.datasource)?;
        let scan_filter = filter.clone().with_sort(None).with_page(None);
        let mut scanned = self.base.child.list(&scan_filter, &scan_projection).await?;
        metrics::full_scan(self.name(), scanned.len(), config.emulation_warn_rows);

        self.total_order(&sort, &schema).apply(&mut scanned);
        let window = match filter.page {
            Some(page) => page.apply(scanned),
            None => scanned,
        };
        if window.is_empty() {
            return Ok(window);
        }

        let ids = window
            .iter()
            .map(|record| primary_key(&schema, record))
            .collect::<veneer_core::Result<Vec<_>>>()?;
        let refetch = PaginatedFilter::new()
            .with_condition_tree(Some(ConditionTree::match_ids(&schema, &ids)?));
        let refetch_projection = projection.with_pks(self.name(), &self.base.datasource)?;
        let fetched = self.base.child.list(&refetch, &refetch_projection).await?;

        let mut by_id: HashMap<_, Record> = HashMap::with_capacity(fetched.len());
        for record in fetched {
            let id = primary_key(&schema, &record)?;
            by_id.insert(hash_values(&id), record);
        }
        let ordered: Vec<Record> = ids
            .iter()
            .filter_map(|id| by_id.remove(&hash_values(id)))
            .collect();
        Ok(projection.apply_all(&ordered))
    }
}

#[async_trait]
impl CollectionDecorator for SortEmulateCollection {
    fn new(child: CollectionRef, datasource: DataSourceHandle<Self>) -> Self {
        Self {
            base: DecoratorBase::new(child, datasource),
            sorts: RwLock::new(HashMap::new()),
        }
    }

    fn base(&self) -> &DecoratorBase<Self> {
        &self.base
    }

    fn refine_schema(&self, child_schema: &CollectionSchema) -> CollectionSchema {
        let mut schema = child_schema.clone();
        for name in read(&self.sorts).keys() {
            if let Some(column) = schema.fields.get_mut(name).and_then(FieldSchema::as_column_mut) {
                column.is_sortable = true;
            }
        }
        schema
    }

    async fn refine_filter(&self, filter: PaginatedFilter) -> Result<PaginatedFilter> {
        let Some(sort) = &filter.sort else {
            return Ok(filter);
        };
        let sort = sort.try_replace_clauses(|clause| self.rewrite_clause(clause, &mut Vec::new()))?;
        Ok(filter.with_sort(Some(sort)))
    }

    async fn on_list(&self, filter: PaginatedFilter, projection: &Projection) -> Result<Vec<Record>> {
        let sort = match &filter.sort {
            Some(sort) if !sort.is_empty() => sort.clone(),
            _ => return self.base.child.list(&filter, projection).await,
        };
        let mut emulated = false;
        for clause in sort.iter() {
            emulated |= self.is_emulated(&clause.field)?;
        }
        if !emulated {
            return self.base.child.list(&filter, projection).await;
        }
        self.list_emulated(filter, sort, projection).await
    }
}
