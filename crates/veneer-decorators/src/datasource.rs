//! Datasources: named sets of collections that announce late registrations.

use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use veneer_core::schema::{CollectionSchema, SchemaLookup};

use crate::collection::CollectionRef;
use crate::error::{Error, Result};

/// Notified every time a collection is added to the datasource it was
/// registered on.
pub trait CollectionObserver: Send + Sync {
    fn collection_added(&self, collection: CollectionRef);
}

pub trait DataSource: Send + Sync {
    /// Collections in registration order.
    fn collections(&self) -> Vec<CollectionRef>;

    fn collection(&self, name: &str) -> Result<CollectionRef>;

    /// Register `observer` for collections added from now on.
    fn on_collection_added(&self, observer: Arc<dyn CollectionObserver>);
}

/// Adapts any datasource to the core's schema lookup.
pub struct Schemas<'a>(pub &'a dyn DataSource);

impl SchemaLookup for Schemas<'_> {
    fn schema_of(&self, collection: &str) -> veneer_core::Result<Arc<CollectionSchema>> {
        self.0
            .collection(collection)
            .map(|c| c.schema())
            .map_err(|_| veneer_core::Error::UnknownCollection(collection.to_string()))
    }
}

pub(crate) fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

/// Plain datasource holding collections supplied by a driver.
#[derive(Default)]
pub struct BaseDataSource {
    collections: RwLock<Vec<CollectionRef>>,
    observers: RwLock<Vec<Arc<dyn CollectionObserver>>>,
}

impl BaseDataSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_collection(&self, collection: CollectionRef) -> Result<()> {
        {
            let mut collections = write(&self.collections);
            if collections.iter().any(|c| c.name() == collection.name()) {
                return Err(Error::Validation(format!(
                    "Collection '{}' already defined in datasource",
                    collection.name()
                )));
            }
            collections.push(collection.clone());
        }

        #[cfg(feature = "tracing")]
        tracing::debug!(collection = collection.name(), "collection registered");

        let observers = read(&self.observers).clone();
        for observer in observers {
            observer.collection_added(collection.clone());
        }
        Ok(())
    }
}

impl DataSource for BaseDataSource {
    fn collections(&self) -> Vec<CollectionRef> {
        read(&self.collections).clone()
    }

    fn collection(&self, name: &str) -> Result<CollectionRef> {
        read(&self.collections)
            .iter()
            .find(|c| c.name() == name)
            .cloned()
            .ok_or_else(|| Error::UnknownCollection(name.to_string()))
    }

    fn on_collection_added(&self, observer: Arc<dyn CollectionObserver>) {
        write(&self.observers).push(observer);
    }
}
