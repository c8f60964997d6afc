//! In-memory native collections.
//!
//! Rows live in a store shared by every collection of a [`MemoryDataSource`],
//! so relations declared in a collection's schema are joined natively,
//! straight from the store, without going through any `list` call.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use veneer_core::aggregation::{AggregateResult, Aggregation};
use veneer_core::condition_tree::ConditionTree;
use veneer_core::filter::{Filter, PaginatedFilter};
use veneer_core::hash::{hash_values, Hash256};
use veneer_core::projection::Projection;
use veneer_core::record::field_value;
use veneer_core::schema::{CollectionSchema, ColumnType, FieldSchema, SchemaLookup};
use veneer_core::types::{Record, Value};

use crate::collection::{Collection, CollectionRef};
use crate::datasource::{read, write, BaseDataSource, CollectionObserver, DataSource};
use crate::error::{Error, Result};
use crate::validation::validate_condition_tree;

type Tables = HashMap<String, Vec<Record>>;

#[derive(Default)]
struct MemoryStore {
    tables: RwLock<Tables>,
    schemas: RwLock<HashMap<String, Arc<CollectionSchema>>>,
}

impl MemoryStore {
    fn snapshot(&self) -> Tables {
        read(&self.tables).clone()
    }

    fn schema(&self, name: &str) -> Result<Arc<CollectionSchema>> {
        read(&self.schemas)
            .get(name)
            .cloned()
            .ok_or_else(|| Error::UnknownCollection(name.to_string()))
    }
}

impl SchemaLookup for MemoryStore {
    fn schema_of(&self, collection: &str) -> veneer_core::Result<Arc<CollectionSchema>> {
        self.schema(collection)
            .map_err(|_| veneer_core::Error::UnknownCollection(collection.to_string()))
    }
}

/// Datasource whose collections keep their rows in memory.
#[derive(Default)]
pub struct MemoryDataSource {
    base: BaseDataSource,
    store: Arc<MemoryStore>,
}

impl MemoryDataSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_collection(
        &self,
        name: &str,
        schema: CollectionSchema,
        rows: Vec<Record>,
    ) -> Result<Arc<MemoryCollection>> {
        if read(&self.store.schemas).contains_key(name) {
            return Err(Error::Validation(format!(
                "Collection '{name}' already defined in datasource"
            )));
        }
        write(&self.store.schemas).insert(name.to_string(), Arc::new(schema));
        write(&self.store.tables).insert(name.to_string(), rows);

        let collection = Arc::new(MemoryCollection {
            name: name.to_string(),
            store: self.store.clone(),
            segments: RwLock::new(HashMap::new()),
            version: AtomicU64::new(0),
            list_calls: AtomicUsize::new(0),
        });
        self.base.add_collection(collection.clone())?;
        Ok(collection)
    }

    /// Current rows of `name`, as stored.
    pub fn rows(&self, name: &str) -> Vec<Record> {
        read(&self.store.tables).get(name).cloned().unwrap_or_default()
    }
}

impl DataSource for MemoryDataSource {
    fn collections(&self) -> Vec<CollectionRef> {
        self.base.collections()
    }

    fn collection(&self, name: &str) -> Result<CollectionRef> {
        self.base.collection(name)
    }

    fn on_collection_added(&self, observer: Arc<dyn CollectionObserver>) {
        self.base.on_collection_added(observer)
    }
}

pub struct MemoryCollection {
    name: String,
    store: Arc<MemoryStore>,
    segments: RwLock<HashMap<String, ConditionTree>>,
    version: AtomicU64,
    list_calls: AtomicUsize,
}

impl MemoryCollection {
    /// Declare a named segment selecting the records matching `tree`.
    pub fn define_segment(&self, name: &str, tree: ConditionTree) -> Result<()> {
        validate_condition_tree(&tree, &self.name, &*self.store)?;
        let mut schema = (*self.store.schema(&self.name)?).clone();
        if !schema.segments.iter().any(|s| s == name) {
            schema.segments.push(name.to_string());
        }
        write(&self.store.schemas).insert(self.name.clone(), Arc::new(schema));
        write(&self.segments).insert(name.to_string(), tree);
        self.version.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    /// Number of `list` calls served so far.
    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::Acquire)
    }

    fn own_schema(&self) -> Result<Arc<CollectionSchema>> {
        self.store.schema(&self.name)
    }

    /// `record` with every relation named by `projection` joined in.
    fn materialize(
        &self,
        tables: &Tables,
        schema: &CollectionSchema,
        record: &Record,
        projection: &Projection,
    ) -> Result<Record> {
        let mut out = record.clone();
        for (name, sub) in projection.relations() {
            let Some(field) = schema.field(&name) else {
                continue;
            };
            let Some(foreign) = field.foreign_collection() else {
                continue;
            };
            let foreign_schema = self.store.schema(foreign)?;
            let rows = tables.get(foreign).map(Vec::as_slice).unwrap_or(&[]);
            let join = |rows: Vec<&Record>| -> Result<Vec<Value>> {
                rows.into_iter()
                    .map(|row| self.materialize(tables, &foreign_schema, row, &sub).map(Value::Record))
                    .collect()
            };

            let value = match field {
                FieldSchema::Column(_) => continue,
                FieldSchema::ManyToOne(r) => {
                    let key = defined(record, &r.foreign_key);
                    let found = rows.iter().filter(|row| key.is_some() && row.get(&r.foreign_key_target) == key).take(1).collect();
                    join(found)?.pop().unwrap_or(Value::Null)
                }
                FieldSchema::OneToOne(r) => {
                    let key = defined(record, &r.origin_key_target);
                    let found = rows.iter().filter(|row| key.is_some() && row.get(&r.origin_key) == key).take(1).collect();
                    join(found)?.pop().unwrap_or(Value::Null)
                }
                FieldSchema::OneToMany(r) => {
                    let key = defined(record, &r.origin_key_target);
                    let found = rows.iter().filter(|row| key.is_some() && row.get(&r.origin_key) == key).collect();
                    Value::List(join(found)?)
                }
                FieldSchema::ManyToMany(r) => {
                    let key = defined(record, &r.origin_key_target);
                    let through = tables.get(&r.through_collection).map(Vec::as_slice).unwrap_or(&[]);
                    let found = through
                        .iter()
                        .filter(|link| key.is_some() && link.get(&r.origin_key) == key)
                        .filter_map(|link| {
                            let target = defined(link, &r.foreign_key)?;
                            rows.iter().find(|row| row.get(&r.foreign_key_target) == Some(target))
                        })
                        .collect();
                    Value::List(join(found)?)
                }
            };
            out.insert(name, value);
        }
        Ok(out)
    }

    /// Materialized rows matching `filter`, with their position in the table.
    fn matching(&self, tables: &Tables, filter: &Filter, needed: &Projection) -> Result<Vec<(usize, Record)>> {
        let schema = self.own_schema()?;
        let needed = match &filter.condition_tree {
            Some(tree) => needed.union([&tree.projection()]),
            None => needed.clone(),
        };
        let segment = match &filter.segment {
            Some(name) => Some(read(&self.segments).get(name).cloned().ok_or_else(|| {
                Error::Validation(format!("Unknown segment '{name}' on '{}'", self.name))
            })?),
            None => None,
        };
        let search = filter.search.as_ref().map(|s| s.to_lowercase());

        let rows = tables.get(&self.name).map(Vec::as_slice).unwrap_or(&[]);
        let mut out = Vec::new();
        for (index, row) in rows.iter().enumerate() {
            let record = self.materialize(tables, &schema, row, &needed)?;
            if !filter.matches(&record) {
                continue;
            }
            if segment.as_ref().is_some_and(|tree| !tree.matches(&record)) {
                continue;
            }
            if let Some(search) = &search {
                if !matches_search(&schema, &record, search) {
                    continue;
                }
            }
            out.push((index, record));
        }
        Ok(out)
    }
}

fn defined<'a>(record: &'a Record, path: &str) -> Option<&'a Value> {
    field_value(record, path).filter(|v| !v.is_null())
}

fn matches_search(schema: &CollectionSchema, record: &Record, search: &str) -> bool {
    schema.fields.iter().any(|(name, field)| match field {
        FieldSchema::Column(c) if c.column_type == ColumnType::String => record
            .get(name)
            .and_then(Value::as_str)
            .is_some_and(|s| s.to_lowercase().contains(search)),
        _ => false,
    })
}

#[async_trait]
impl Collection for MemoryCollection {
    fn name(&self) -> &str {
        &self.name
    }

    fn schema(&self) -> Arc<CollectionSchema> {
        self.own_schema().unwrap_or_default()
    }

    fn schema_version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    async fn list(&self, filter: &PaginatedFilter, projection: &Projection) -> Result<Vec<Record>> {
        self.list_calls.fetch_add(1, Ordering::AcqRel);
        let tables = self.store.snapshot();
        let mut needed = projection.clone();
        if let Some(sort) = &filter.sort {
            needed = needed.union([&sort.projection()]);
        }

        let mut records: Vec<Record> = self
            .matching(&tables, &filter.filter, &needed)?
            .into_iter()
            .map(|(_, record)| record)
            .collect();
        if let Some(sort) = &filter.sort {
            sort.apply(&mut records);
        }
        if let Some(page) = filter.page {
            records = page.apply(records);
        }
        Ok(projection.apply_all(&records))
    }

    async fn aggregate(
        &self,
        filter: &Filter,
        aggregation: &Aggregation,
        limit: Option<usize>,
    ) -> Result<Vec<AggregateResult>> {
        let tables = self.store.snapshot();
        let records: Vec<Record> = self
            .matching(&tables, filter, &aggregation.projection())?
            .into_iter()
            .map(|(_, record)| record)
            .collect();
        let timezone = filter.effective_timezone("UTC");
        Ok(aggregation.apply(&records, timezone, limit)?)
    }

    async fn create(&self, records: Vec<Record>) -> Result<Vec<Record>> {
        let schema = self.own_schema()?;
        let pks = schema.primary_keys();
        let auto_increment = match pks.as_slice() {
            [pk] => schema
                .column(pk)
                .is_some_and(|c| c.column_type == ColumnType::Number)
                .then(|| pk.clone()),
            _ => None,
        };

        let key_of = |record: &Record| -> Option<Hash256> {
            let key = pks
                .iter()
                .map(|pk| defined(record, pk).cloned())
                .collect::<Option<Vec<_>>>()?;
            Some(hash_values(&key))
        };

        let mut tables = write(&self.store.tables);
        let table = tables.entry(self.name.clone()).or_default();
        let mut taken: HashSet<Hash256> = table.iter().filter_map(|row| key_of(row)).collect();
        let mut next = auto_increment.as_ref().map(|pk| {
            table
                .iter()
                .filter_map(|row| row.get(pk).and_then(Value::as_i64))
                .max()
                .unwrap_or(0)
        });

        let mut created = Vec::with_capacity(records.len());
        for mut record in records {
            if let (Some(pk), Some(last)) = (&auto_increment, next.as_mut()) {
                match defined(&record, pk).and_then(Value::as_i64) {
                    Some(id) => *last = (*last).max(id),
                    None if defined(&record, pk).is_none() => {
                        *last += 1;
                        record.insert(pk.clone(), Value::Int(*last));
                    }
                    None => {}
                }
            }
            if let Some(key) = key_of(&record) {
                if !taken.insert(key) {
                    return Err(Error::Native(format!(
                        "duplicate primary key in '{}': {:?}",
                        self.name,
                        pks.iter().map(|pk| record.get(pk)).collect::<Vec<_>>()
                    )));
                }
            }
            record.retain(|name, _| schema.field(name).map_or(true, FieldSchema::is_column));
            created.push(record);
        }
        table.extend(created.iter().cloned());
        Ok(created)
    }

    async fn update(&self, filter: &Filter, patch: Record) -> Result<()> {
        let tables = self.store.snapshot();
        let targets = self.matching(&tables, filter, &Projection::new())?;
        let mut tables = write(&self.store.tables);
        let table = tables.entry(self.name.clone()).or_default();
        for (index, _) in targets {
            if let Some(row) = table.get_mut(index) {
                row.extend(patch.clone());
            }
        }
        Ok(())
    }

    async fn delete(&self, filter: &Filter) -> Result<()> {
        let tables = self.store.snapshot();
        let targets: Vec<usize> = self
            .matching(&tables, filter, &Projection::new())?
            .into_iter()
            .map(|(index, _)| index)
            .collect();
        let mut tables = write(&self.store.tables);
        let table = tables.entry(self.name.clone()).or_default();
        let mut index = 0;
        table.retain(|_| {
            let keep = !targets.contains(&index);
            index += 1;
            keep
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use veneer_core::operator::Operator;
    use veneer_core::record;
    use veneer_core::schema::{ColumnSchema, ManyToOneSchema};
    use veneer_core::sort::{Sort, SortClause};

    fn library() -> (MemoryDataSource, Arc<MemoryCollection>) {
        let ds = MemoryDataSource::new();
        ds.add_collection(
            "authors",
            CollectionSchema::new()
                .with_field("id", ColumnSchema::new(ColumnType::Number).primary_key())
                .with_field("name", ColumnSchema::new(ColumnType::String)),
            vec![record! { "id" => 10, "name" => "Ursula" }],
        )
        .unwrap();
        let books = ds
            .add_collection(
                "books",
                CollectionSchema::new()
                    .with_field("id", ColumnSchema::new(ColumnType::Number).primary_key())
                    .with_field("title", ColumnSchema::new(ColumnType::String))
                    .with_field("author_id", ColumnSchema::new(ColumnType::Number))
                    .with_field(
                        "author",
                        FieldSchema::ManyToOne(ManyToOneSchema {
                            foreign_collection: "authors".into(),
                            foreign_key: "author_id".into(),
                            foreign_key_target: "id".into(),
                        }),
                    ),
                vec![
                    record! { "id" => 1, "title" => "Earthsea", "author_id" => 10 },
                    record! { "id" => 2, "title" => "Anonymous", "author_id" => Value::Null },
                ],
            )
            .unwrap();
        (ds, books)
    }

    #[tokio::test]
    async fn joins_native_relations_and_filters_through_them() {
        let (_ds, books) = library();
        let filter = PaginatedFilter::new().with_condition_tree(Some(ConditionTree::leaf(
            "author:name",
            Operator::Equal,
            "Ursula",
        )));
        let rows = books
            .list(&filter, &Projection::from(["title", "author:name"]))
            .await
            .unwrap();
        assert_eq!(
            rows,
            vec![record! { "title" => "Earthsea", "author" => record! { "name" => "Ursula" } }]
        );

        let all = books
            .list(&PaginatedFilter::new(), &Projection::from(["id", "author:name"]))
            .await
            .unwrap();
        assert_eq!(all[1]["author"], Value::Null);
    }

    #[tokio::test]
    async fn duplicate_primary_keys_fail_the_whole_create() {
        let (ds, books) = library();
        let err = books
            .create(vec![record! { "title" => "Tehanu" }, record! { "id" => 1, "title" => "Again" }])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Native(m) if m.contains("duplicate primary key")));
        assert_eq!(ds.rows("books").len(), 2);

        let err = books
            .create(vec![record! { "id" => 7 }, record! { "id" => 7 }])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Native(_)));

        // Explicit ids move the counter past them.
        let created = books
            .create(vec![record! { "id" => 9 }, record! { "title" => "Next" }])
            .await
            .unwrap();
        assert_eq!(created[1]["id"], Value::Int(10));
        assert_eq!(ds.rows("books").len(), 4);
    }

    #[tokio::test]
    async fn create_assigns_increasing_ids_and_update_patches_rows() {
        let (ds, books) = library();
        let created = books
            .create(vec![record! { "title" => "Lathe" }, record! { "title" => "Dispossessed" }])
            .await
            .unwrap();
        assert_eq!(created[0]["id"], Value::Int(3));
        assert_eq!(created[1]["id"], Value::Int(4));

        let filter = Filter::new().with_condition_tree(Some(ConditionTree::leaf("id", Operator::Equal, 3)));
        books.update(&filter, record! { "author_id" => 10 }).await.unwrap();
        assert_eq!(ds.rows("books")[2]["author_id"], Value::Int(10));

        books.delete(&filter).await.unwrap();
        assert_eq!(ds.rows("books").len(), 3);
    }

    #[tokio::test]
    async fn sorts_pages_searches_and_segments() {
        let (_ds, books) = library();
        books
            .define_segment("anonymous", ConditionTree::leaf("author_id", Operator::Missing, Value::Null))
            .unwrap();
        assert_eq!(books.schema_version(), 1);
        assert_eq!(books.schema().segments, vec!["anonymous".to_string()]);

        let segment = PaginatedFilter::new().with_segment(Some("anonymous".into()));
        let rows = books.list(&segment, &Projection::from(["id"])).await.unwrap();
        assert_eq!(rows, vec![record! { "id" => 2 }]);

        let search = PaginatedFilter::new().with_search(Some("EARTH".into()), false);
        let rows = books.list(&search, &Projection::from(["id"])).await.unwrap();
        assert_eq!(rows, vec![record! { "id" => 1 }]);

        let sorted = PaginatedFilter::new()
            .with_sort(Some(Sort::new([SortClause::desc("id")])))
            .with_page(Some(veneer_core::filter::Page::new(0, 1)));
        let rows = books.list(&sorted, &Projection::from(["id"])).await.unwrap();
        assert_eq!(rows, vec![record! { "id" => 2 }]);
        assert_eq!(books.list_calls(), 3);
    }

    #[test]
    fn segments_must_use_supported_operators() {
        let (_ds, books) = library();
        let err = books
            .define_segment("recent", ConditionTree::leaf("title", Operator::Before, "2020-01-01"))
            .unwrap_err();
        assert!(matches!(err, Error::Validation(m) if m.contains("not supported")));

        let err = books
            .define_segment("missing", ConditionTree::leaf("author:age", Operator::Equal, 3))
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert_eq!(books.schema_version(), 0);
    }
}
