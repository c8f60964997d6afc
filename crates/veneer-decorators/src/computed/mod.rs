//! Computed fields: columns derived from other fields by an async evaluator.
//!
//! Listing rewrites every computed path into its dependencies (recursively,
//! across relations), fetches those from the child, then evaluates the
//! computed columns level by level. Fields on the same level run
//! concurrently and each evaluator sees every distinct dependency tuple
//! once.

mod dedup;
mod flatten;

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::future::Future;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use futures::future::{try_join_all, BoxFuture};
use futures::FutureExt;
use veneer_core::aggregation::{AggregateResult, Aggregation};
use veneer_core::filter::{Filter, PaginatedFilter};
use veneer_core::projection::Projection;
use veneer_core::schema::{CollectionSchema, ColumnSchema, ColumnType, FieldSchema};
use veneer_core::types::{Record, Value};

use crate::collection::{Collection, CollectionRef};
use crate::datasource::{read, write};
use crate::decorator::{CollectionDecorator, DataSourceHandle, DecoratorBase};
use crate::error::{Error, Result};
use crate::metrics;
use crate::validation::validate_column;

use self::dedup::transform_unique_values;
use self::flatten::{flatten, unflatten, Cell};

type Evaluator = Arc<dyn Fn(Vec<Record>) -> BoxFuture<'static, Result<Vec<Value>>> + Send + Sync>;

/// Declaration of a computed field.
///
/// The evaluator receives one record per distinct dependency tuple, holding
/// only the dependency paths, and must return one value per record in the
/// same order.
#[derive(Clone)]
pub struct ComputedDefinition {
    pub column_type: ColumnType,
    pub dependencies: Vec<String>,
    pub default_value: Option<Value>,
    pub enum_values: Vec<String>,
    evaluator: Evaluator,
}

impl ComputedDefinition {
    pub fn new<F, Fut>(
        column_type: ColumnType,
        dependencies: impl IntoIterator<Item = impl Into<String>>,
        evaluator: F,
    ) -> Self
    where
        F: Fn(Vec<Record>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Vec<Value>>> + Send + 'static,
    {
        Self {
            column_type,
            dependencies: dependencies.into_iter().map(Into::into).collect(),
            default_value: None,
            enum_values: vec![],
            evaluator: Arc::new(move |records| evaluator(records).boxed()),
        }
    }

    /// Synchronous, record-at-a-time evaluator.
    pub fn from_fn(
        column_type: ColumnType,
        dependencies: impl IntoIterator<Item = impl Into<String>>,
        f: impl Fn(&Record) -> Value + Send + Sync + 'static,
    ) -> Self {
        Self::new(column_type, dependencies, move |records: Vec<Record>| {
            futures::future::ready(Ok(records.iter().map(&f).collect()))
        })
    }

    pub fn with_default(mut self, value: impl Into<Value>) -> Self {
        self.default_value = Some(value.into());
        self
    }

    pub fn with_enum_values(mut self, values: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.enum_values = values.into_iter().map(Into::into).collect();
        self
    }

    pub async fn evaluate(&self, records: Vec<Record>) -> Result<Vec<Value>> {
        (self.evaluator)(records).await
    }

    fn column(&self) -> ColumnSchema {
        let mut column = ColumnSchema::new(self.column_type)
            .read_only()
            .not_sortable()
            .with_operators([]);
        column.default_value = self.default_value.clone();
        column.enum_values = self.enum_values.clone();
        column
    }
}

impl fmt::Debug for ComputedDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComputedDefinition")
            .field("column_type", &self.column_type)
            .field("dependencies", &self.dependencies)
            .finish_non_exhaustive()
    }
}

pub struct ComputedCollection {
    base: DecoratorBase<ComputedCollection>,
    computeds: RwLock<BTreeMap<String, ComputedDefinition>>,
}

struct Step {
    path: String,
    definition: ComputedDefinition,
    /// Dependency paths relative to the listed collection.
    inputs: Vec<String>,
    level: usize,
}

impl ComputedCollection {
    pub fn register_computed(&self, name: &str, definition: ComputedDefinition) -> Result<()> {
        let collection = self.name().to_string();
        if name.contains(':') {
            return Err(Error::Validation(format!(
                "Computed field name '{collection}.{name}' cannot contain ':'"
            )));
        }
        if self.schema().field(name).is_some() {
            return Err(Error::Validation(format!(
                "Field '{collection}.{name}' already exists"
            )));
        }
        if definition.dependencies.is_empty() {
            return Err(Error::Validation(format!(
                "Computed field '{collection}.{name}' must have at least one dependency"
            )));
        }
        for dependency in &definition.dependencies {
            validate_column(&self.base.datasource, &collection, dependency)?;
        }

        #[cfg(feature = "tracing")]
        tracing::debug!(collection = %collection, field = name, "registered computed field");

        write(&self.computeds).insert(name.to_string(), definition);
        self.base.mark_schema_as_dirty();
        Ok(())
    }

    /// Definition of the computed field at `path`, following relations.
    pub fn get_computed(&self, path: &str) -> Result<Option<ComputedDefinition>> {
        match path.split_once(':') {
            None => Ok(read(&self.computeds).get(path).cloned()),
            Some((prefix, rest)) => self.related(prefix)?.get_computed(rest),
        }
    }

    fn related(&self, relation: &str) -> Result<Arc<ComputedCollection>> {
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

    /// Paths the child must return so `path` can be produced.
    fn rewrite_field(&self, path: &str) -> Result<Projection> {
        if let Some((prefix, rest)) = path.split_once(':') {
            return Ok(self.related(prefix)?.rewrite_field(rest)?.nest(prefix));
        }
        match self.get_computed(path)? {
            Some(definition) => Projection::from(definition.dependencies.clone())
                .try_replace(|dependency| self.rewrite_field(dependency)),
            None => Ok(Projection::from([path])),
        }
    }

    fn plan(
        &self,
        path: &str,
        fetched: &Projection,
        levels: &mut HashMap<String, usize>,
        steps: &mut Vec<Step>,
    ) -> Result<usize> {
        if let Some(level) = levels.get(path) {
            return Ok(*level);
        }
        if fetched.contains(path) {
            levels.insert(path.to_string(), 0);
            return Ok(0);
        }

        let definition = self.get_computed(path)?.ok_or_else(|| {
            Error::Invariant(format!("'{path}' is neither fetched nor computed"))
        })?;
        let prefix = path.rsplit_once(':').map(|(prefix, _)| prefix).unwrap_or("");
        let inputs = Projection::from(definition.dependencies.clone()).nest(prefix);

        let mut level = 0;
        for input in inputs.iter() {
            level = level.max(self.plan(input, fetched, levels, steps)?);
        }
        levels.insert(path.to_string(), level + 1);
        steps.push(Step {
            path: path.to_string(),
            definition,
            inputs: inputs.into_iter().collect(),
            level: level + 1,
        });
        Ok(level + 1)
    }

    async fn compute_from_records(
        &self,
        fetched: &Projection,
        desired: &Projection,
        records: Vec<Record>,
    ) -> Result<Vec<Record>> {
        let len = records.len();
        let mut levels = HashMap::new();
        let mut steps = Vec::new();
        for path in desired.iter() {
            self.plan(path, fetched, &mut levels, &mut steps)?;
        }

        let mut columns: HashMap<String, Vec<Cell>> = fetched
            .paths()
            .iter()
            .cloned()
            .zip(flatten(&records, fetched.paths()))
            .collect();

        let depth = steps.iter().map(|s| s.level).max().unwrap_or(0);
        for level in 1..=depth {
            let batch: Vec<&Step> = steps.iter().filter(|s| s.level == level).collect();
            let computed = try_join_all(batch.iter().map(|step| {
                let inputs: Vec<&[Cell]> = step
                    .inputs
                    .iter()
                    .map(|input| columns.get(input).map(Vec::as_slice).unwrap_or(&[]))
                    .collect();
                let partials = unflatten(&inputs, &step.definition.dependencies, len);
                transform_unique_values(&step.path, &step.definition, partials)
            }))
            .await?;

            for (step, values) in batch.iter().zip(computed) {
                columns.insert(
                    step.path.clone(),
                    values.into_iter().map(Cell::Defined).collect(),
                );
            }
        }

        let wanted: Vec<&[Cell]> = desired
            .iter()
            .map(|path| columns.get(path).map(Vec::as_slice).unwrap_or(&[]))
            .collect();
        Ok(unflatten(&wanted, desired.paths(), len))
    }

    fn uses_computed(&self, projection: &Projection) -> Result<bool> {
        for path in projection.iter() {
            if self.get_computed(path)?.is_some() {
                return Ok(true);
            }
        }
        Ok(false)
    }
}

#[async_trait]
impl CollectionDecorator for ComputedCollection {
    fn new(child: CollectionRef, datasource: DataSourceHandle<Self>) -> Self {
        Self {
            base: DecoratorBase::new(child, datasource),
            computeds: RwLock::new(BTreeMap::new()),
        }
    }

    fn base(&self) -> &DecoratorBase<Self> {
        &self.base
    }

    fn refine_schema(&self, child_schema: &CollectionSchema) -> CollectionSchema {
        let mut schema = child_schema.clone();
        for (name, definition) in read(&self.computeds).iter() {
            schema
                .fields
                .insert(name.clone(), FieldSchema::Column(definition.column()));
        }
        schema
    }

    async fn on_list(&self, filter: PaginatedFilter, projection: &Projection) -> Result<Vec<Record>> {
        let child_projection = projection.try_replace(|path| self.rewrite_field(path))?;
        let records = self.base.child.list(&filter, &child_projection).await?;
        if &child_projection == projection || records.is_empty() {
            return Ok(records);
        }
        self.compute_from_records(&child_projection, projection, records)
            .await
    }

    async fn on_aggregate(
        &self,
        filter: Filter,
        aggregation: &Aggregation,
        limit: Option<usize>,
    ) -> Result<Vec<AggregateResult>> {
        if !self.uses_computed(&aggregation.projection())? {
            return self.base.child.aggregate(&filter, aggregation, limit).await;
        }

        metrics::emit_event(
            "aggregate.emulated",
            &[("collection", self.name().to_string()), ("reason", "computed".into())],
        );
        let records = self
            .on_list(PaginatedFilter::from(filter.clone()), &aggregation.projection())
            .await?;
        let config = self.base.config();
        let timezone = filter.effective_timezone(&config.default_timezone);
        Ok(aggregation.apply(&records, timezone, limit)?)
    }
}
