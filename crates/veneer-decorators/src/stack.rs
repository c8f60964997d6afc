//! The decorator pipeline assembled over a native datasource.

use std::future::Future;
use std::sync::Arc;

use veneer_core::config::VeneerConfig;
use veneer_core::sort::Sort;
use veneer_core::types::{Record, Value};

use crate::collection::CollectionRef;
use crate::computed::{ComputedCollection, ComputedDefinition};
use crate::datasource::{DataSource, Schemas};
use crate::decorator::DataSourceDecorator;
use crate::error::Result;
use crate::relation::{RelationCollection, RelationDefinition};
use crate::rename::RenameCollection;
use crate::sort_emulate::SortEmulateCollection;
use crate::validation::validate_column;
use crate::write::{WriteCollection, WriteContext};

/// Layers, from the native datasource up:
/// computed (early), relation, computed (late), sort emulation, write,
/// rename. Collections added to the native datasource later show up in
/// every layer.
pub struct DecoratorStack {
    pub early_computed: Arc<DataSourceDecorator<ComputedCollection>>,
    pub relation: Arc<DataSourceDecorator<RelationCollection>>,
    pub late_computed: Arc<DataSourceDecorator<ComputedCollection>>,
    pub sort_emulate: Arc<DataSourceDecorator<SortEmulateCollection>>,
    pub write: Arc<DataSourceDecorator<WriteCollection>>,
    pub rename: Arc<DataSourceDecorator<RenameCollection>>,
}

impl DecoratorStack {
    pub fn new(native: Arc<dyn DataSource>, config: VeneerConfig) -> Self {
        let config = Arc::new(config);
        let early_computed = DataSourceDecorator::<ComputedCollection>::new(native, config.clone());
        let relation =
            DataSourceDecorator::<RelationCollection>::new(early_computed.clone(), config.clone());
        let late_computed =
            DataSourceDecorator::<ComputedCollection>::new(relation.clone(), config.clone());
        let sort_emulate =
            DataSourceDecorator::<SortEmulateCollection>::new(late_computed.clone(), config.clone());
        let write = DataSourceDecorator::<WriteCollection>::new(sort_emulate.clone(), config.clone());
        let rename = DataSourceDecorator::<RenameCollection>::new(write.clone(), config);

        #[cfg(feature = "tracing")]
        tracing::debug!(
            collections = rename.collections().len(),
            "decorator stack assembled"
        );

        Self {
            early_computed,
            relation,
            late_computed,
            sort_emulate,
            write,
            rename,
        }
    }

    /// The top of the stack.
    pub fn datasource(&self) -> Arc<dyn DataSource> {
        self.rename.clone()
    }

    pub fn collection(&self, name: &str) -> Result<CollectionRef> {
        self.rename.collection(name)
    }

    /// Register a computed field below the relation layer when every
    /// dependency is a plain column there, above it otherwise.
    pub fn add_field(&self, collection: &str, name: &str, definition: ComputedDefinition) -> Result<()> {
        let lookup = Schemas(&*self.early_computed);
        let early = definition
            .dependencies
            .iter()
            .all(|dependency| validate_column(&lookup, collection, dependency).is_ok());
        let layer = if early {
            &self.early_computed
        } else {
            &self.late_computed
        };
        layer.decorated(collection)?.register_computed(name, definition)
    }

    pub fn add_relation(&self, collection: &str, name: &str, definition: RelationDefinition) -> Result<()> {
        self.relation.decorated(collection)?.add_relation(name, definition)
    }

    pub fn emulate_field_sorting(&self, collection: &str, field: &str) -> Result<()> {
        self.sort_emulate.decorated(collection)?.emulate_field_sorting(field)
    }

    pub fn replace_field_sorting(&self, collection: &str, field: &str, equivalent: Sort) -> Result<()> {
        self.sort_emulate
            .decorated(collection)?
            .replace_field_sorting(field, Some(equivalent))
    }

    pub fn replace_field_writing<F, Fut>(&self, collection: &str, field: &str, handler: F) -> Result<()>
    where
        F: Fn(Value, WriteContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Option<Record>>> + Send + 'static,
    {
        self.write.decorated(collection)?.replace_field_writing(field, handler)
    }

    pub fn rename_field(&self, collection: &str, current: &str, new: &str) -> Result<()> {
        self.rename.decorated(collection)?.rename_field(current, new)
    }
}
