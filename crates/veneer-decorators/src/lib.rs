#![forbid(unsafe_code)]
//! veneer-decorators: the async collection surface and the decorators that
//! emulate capabilities a native collection lacks.
//!
//! Each decorator wraps one collection and adds one capability: computed
//! fields, relations, sort emulation, field write handlers, renames.
//! Decorators of the same kind form a layer ([`DataSourceDecorator`]) over a
//! child datasource; [`DecoratorStack`] assembles the usual pipeline.

pub mod batch;
pub mod collection;
pub mod computed;
pub mod datasource;
pub mod decorator;
pub mod error;
pub mod memory;
pub mod metrics;
pub mod relation;
pub mod rename;
pub mod sort_emulate;
pub mod stack;
pub mod validation;
pub mod write;

pub use batch::BatchCollection;
pub use collection::{ActionField, Collection, CollectionRef};
pub use computed::{ComputedCollection, ComputedDefinition};
pub use datasource::{BaseDataSource, CollectionObserver, DataSource, Schemas};
pub use decorator::{CollectionDecorator, DataSourceDecorator, DataSourceHandle, DecoratorBase};
pub use error::{Error, Result};
pub use memory::{MemoryCollection, MemoryDataSource};
pub use relation::{RelationCollection, RelationDefinition};
pub use rename::RenameCollection;
pub use sort_emulate::SortEmulateCollection;
pub use stack::DecoratorStack;
pub use write::{WriteAction, WriteCollection, WriteContext};
