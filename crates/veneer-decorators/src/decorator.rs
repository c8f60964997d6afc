//! Composition substrate: one decorator per collection, one decorator
//! datasource per layer.
//!
//! A layer is a [`DataSourceDecorator<D>`] owning an arena of `Arc<D>`, one
//! per collection of the child datasource. Decorators reach their siblings
//! through a [`DataSourceHandle`], which only holds a `Weak` back-reference
//! to the arena.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, Weak};

use async_trait::async_trait;
use veneer_core::aggregation::{AggregateResult, Aggregation};
use veneer_core::config::VeneerConfig;
use veneer_core::filter::{Filter, PaginatedFilter};
use veneer_core::projection::Projection;
use veneer_core::schema::{CollectionSchema, SchemaLookup};
use veneer_core::types::{Record, Value};

use crate::collection::{ActionField, Collection, CollectionRef};
use crate::datasource::{read, write, CollectionObserver, DataSource};
use crate::error::{Error, Result};

/// A collection wrapping exactly one child and adding one capability.
///
/// Implementors get [`Collection`] for free: every operation runs
/// [`refine_filter`](CollectionDecorator::refine_filter) and then the
/// matching `on_*` hook, which delegates to the child unless overridden.
#[async_trait]
pub trait CollectionDecorator: Send + Sync + Sized + 'static {
    fn new(child: CollectionRef, datasource: DataSourceHandle<Self>) -> Self;

    fn base(&self) -> &DecoratorBase<Self>;

    /// Derive this layer's schema from the child's. Must be a pure function
    /// of the child schema and the decorator's own configuration.
    fn refine_schema(&self, child_schema: &CollectionSchema) -> CollectionSchema {
        child_schema.clone()
    }

    async fn refine_filter(&self, filter: PaginatedFilter) -> Result<PaginatedFilter> {
        Ok(filter)
    }

    async fn on_list(&self, filter: PaginatedFilter, projection: &Projection) -> Result<Vec<Record>> {
        self.base().child.list(&filter, projection).await
    }

    async fn on_aggregate(
        &self,
        filter: Filter,
        aggregation: &Aggregation,
        limit: Option<usize>,
    ) -> Result<Vec<AggregateResult>> {
        self.base().child.aggregate(&filter, aggregation, limit).await
    }

    async fn on_create(&self, records: Vec<Record>) -> Result<Vec<Record>> {
        self.base().child.create(records).await
    }

    async fn on_update(&self, filter: Filter, patch: Record) -> Result<()> {
        self.base().child.update(&filter, patch).await
    }

    async fn on_delete(&self, filter: Filter) -> Result<()> {
        self.base().child.delete(&filter).await
    }
}

#[async_trait]
impl<T: CollectionDecorator> Collection for T {
    fn name(&self) -> &str {
        self.base().child.name()
    }

    fn schema(&self) -> Arc<CollectionSchema> {
        let base = self.base();
        base.cache
            .get_or_refresh(base.child.schema_version(), || {
                self.refine_schema(&base.child.schema())
            })
    }

    fn schema_version(&self) -> u64 {
        self.base().child.schema_version() + self.base().cache.generation()
    }

    async fn list(&self, filter: &PaginatedFilter, projection: &Projection) -> Result<Vec<Record>> {
        let refined = self.refine_filter(filter.clone()).await?;
        self.on_list(refined, projection).await
    }

    async fn aggregate(
        &self,
        filter: &Filter,
        aggregation: &Aggregation,
        limit: Option<usize>,
    ) -> Result<Vec<AggregateResult>> {
        let refined = self
            .refine_filter(PaginatedFilter::from(filter.clone()))
            .await?
            .into_filter();
        self.on_aggregate(refined, aggregation, limit).await
    }

    async fn create(&self, records: Vec<Record>) -> Result<Vec<Record>> {
        self.on_create(records).await
    }

    async fn update(&self, filter: &Filter, patch: Record) -> Result<()> {
        let refined = self
            .refine_filter(PaginatedFilter::from(filter.clone()))
            .await?
            .into_filter();
        self.on_update(refined, patch).await
    }

    async fn delete(&self, filter: &Filter) -> Result<()> {
        let refined = self
            .refine_filter(PaginatedFilter::from(filter.clone()))
            .await?
            .into_filter();
        self.on_delete(refined).await
    }

    async fn execute(&self, action: &str, data: Record, filter: &Filter) -> Result<Value> {
        let refined = self
            .refine_filter(PaginatedFilter::from(filter.clone()))
            .await?
            .into_filter();
        self.base().child.execute(action, data, &refined).await
    }

    async fn get_form(&self, action: &str, data: Option<Record>) -> Result<Vec<ActionField>> {
        self.base().child.get_form(action, data).await
    }

    async fn render_chart(&self, chart: &str, record_id: Vec<Value>) -> Result<Value> {
        self.base().child.render_chart(chart, record_id).await
    }
}

/// State every decorator carries: its child, its layer, its schema cache.
pub struct DecoratorBase<D> {
    pub child: CollectionRef,
    pub datasource: DataSourceHandle<D>,
    cache: SchemaCache,
}

impl<D: CollectionDecorator> DecoratorBase<D> {
    pub fn new(child: CollectionRef, datasource: DataSourceHandle<D>) -> Self {
        Self {
            child,
            datasource,
            cache: SchemaCache::default(),
        }
    }

    /// Invalidate the cached schema after the decorator's configuration
    /// changed.
    pub fn mark_schema_as_dirty(&self) {
        self.cache.bump();
    }

    pub fn config(&self) -> Arc<VeneerConfig> {
        self.datasource.config()
    }
}

/// Schema memo keyed by (child schema version, own generation).
///
/// Refreshes happen outside the lock; two readers racing on a stale entry
/// both compute the same schema and the first one stored wins.
#[derive(Default)]
struct SchemaCache {
    generation: AtomicU64,
    cached: RwLock<Option<CachedSchema>>,
}

struct CachedSchema {
    child_version: u64,
    generation: u64,
    schema: Arc<CollectionSchema>,
}

impl SchemaCache {
    fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    fn bump(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
    }

    fn get_or_refresh(
        &self,
        child_version: u64,
        refine: impl FnOnce() -> CollectionSchema,
    ) -> Arc<CollectionSchema> {
        let generation = self.generation();
        if let Some(hit) = Self::lookup(&read(&self.cached), child_version, generation) {
            return hit;
        }

        let fresh = Arc::new(refine());
        let mut slot = write(&self.cached);
        if let Some(hit) = Self::lookup(&slot, child_version, generation) {
            return hit;
        }
        *slot = Some(CachedSchema {
            child_version,
            generation,
            schema: fresh.clone(),
        });
        fresh
    }

    fn lookup(
        cached: &Option<CachedSchema>,
        child_version: u64,
        generation: u64,
    ) -> Option<Arc<CollectionSchema>> {
        cached
            .as_ref()
            .filter(|c| c.child_version == child_version && c.generation == generation)
            .map(|c| c.schema.clone())
    }
}

/// Non-owning reference from a decorator to its layer.
pub struct DataSourceHandle<D> {
    inner: Weak<DataSourceDecorator<D>>,
}

impl<D: CollectionDecorator> Clone for DataSourceHandle<D> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<D: CollectionDecorator> DataSourceHandle<D> {
    fn layer(&self) -> Result<Arc<DataSourceDecorator<D>>> {
        self.inner
            .upgrade()
            .ok_or_else(|| Error::Invariant("decorator outlived its datasource".into()))
    }

    /// The decorator wrapping collection `name` in the same layer.
    pub fn sibling(&self, name: &str) -> Result<Arc<D>> {
        self.layer()?.decorated(name)
    }

    pub fn siblings(&self) -> Vec<Arc<D>> {
        self.layer()
            .map(|layer| layer.decorated_collections())
            .unwrap_or_default()
    }

    pub fn config(&self) -> Arc<VeneerConfig> {
        self.layer()
            .map(|layer| layer.config.clone())
            .unwrap_or_default()
    }
}

impl<D: CollectionDecorator> SchemaLookup for DataSourceHandle<D> {
    fn schema_of(&self, collection: &str) -> veneer_core::Result<Arc<CollectionSchema>> {
        self.sibling(collection)
            .map(|c| c.schema())
            .map_err(|_| veneer_core::Error::UnknownCollection(collection.to_string()))
    }
}

/// A datasource wrapping every collection of its child with `D`.
pub struct DataSourceDecorator<D> {
    child: Arc<dyn DataSource>,
    config: Arc<VeneerConfig>,
    arena: RwLock<Arena<D>>,
    observers: RwLock<Vec<Arc<dyn CollectionObserver>>>,
    me: Weak<Self>,
}

struct Arena<D> {
    collections: Vec<Arc<D>>,
    index: HashMap<String, usize>,
}

impl<D: CollectionDecorator> DataSourceDecorator<D> {
    pub fn new(child: Arc<dyn DataSource>, config: Arc<VeneerConfig>) -> Arc<Self> {
        let layer = Arc::new_cyclic(|me| Self {
            child,
            config,
            arena: RwLock::new(Arena {
                collections: Vec::new(),
                index: HashMap::new(),
            }),
            observers: RwLock::new(Vec::new()),
            me: me.clone(),
        });

        // Subscribe before the initial walk so nothing registered in between
        // is missed; `wrap` ignores collections it already holds.
        layer.child.on_collection_added(Arc::new(LateRegistration {
            layer: Arc::downgrade(&layer),
        }));
        for collection in layer.child.collections() {
            layer.wrap(collection);
        }
        layer
    }

    pub fn config(&self) -> &Arc<VeneerConfig> {
        &self.config
    }

    pub fn decorated(&self, name: &str) -> Result<Arc<D>> {
        let arena = read(&self.arena);
        arena
            .index
            .get(name)
            .map(|&i| arena.collections[i].clone())
            .ok_or_else(|| Error::UnknownCollection(name.to_string()))
    }

    pub fn decorated_collections(&self) -> Vec<Arc<D>> {
        read(&self.arena).collections.clone()
    }

    fn wrap(&self, child: CollectionRef) -> Arc<D> {
        if let Ok(existing) = self.decorated(child.name()) {
            return existing;
        }

        let name = child.name().to_string();
        let decorated = Arc::new(D::new(child, DataSourceHandle { inner: self.me.clone() }));
        {
            let mut arena = write(&self.arena);
            if let Some(&i) = arena.index.get(&name) {
                return arena.collections[i].clone();
            }
            let slot = arena.collections.len();
            arena.index.insert(name, slot);
            arena.collections.push(decorated.clone());
        }

        let observers = read(&self.observers).clone();
        for observer in observers {
            observer.collection_added(decorated.clone());
        }
        decorated
    }
}

impl<D: CollectionDecorator> DataSource for DataSourceDecorator<D> {
    fn collections(&self) -> Vec<CollectionRef> {
        self.decorated_collections()
            .into_iter()
            .map(|c| c as CollectionRef)
            .collect()
    }

    fn collection(&self, name: &str) -> Result<CollectionRef> {
        self.decorated(name).map(|c| c as CollectionRef)
    }

    fn on_collection_added(&self, observer: Arc<dyn CollectionObserver>) {
        write(&self.observers).push(observer);
    }
}

/// Registered on the child datasource; wraps collections added after the
/// layer was built.
struct LateRegistration<D> {
    layer: Weak<DataSourceDecorator<D>>,
}

impl<D: CollectionDecorator> CollectionObserver for LateRegistration<D> {
    fn collection_added(&self, collection: CollectionRef) {
        if let Some(layer) = self.layer.upgrade() {
            #[cfg(feature = "tracing")]
            tracing::debug!(collection = collection.name(), "wrapping late collection");
            layer.wrap(collection);
        }
    }
}
