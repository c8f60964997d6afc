//! The capability surface shared by native collections and decorators.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use veneer_core::aggregation::{AggregateResult, Aggregation};
use veneer_core::filter::{Filter, PaginatedFilter};
use veneer_core::projection::Projection;
use veneer_core::schema::{CollectionSchema, ColumnType};
use veneer_core::types::{Record, Value};

use crate::error::{Error, Result};

/// One input of an action form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionField {
    pub label: String,
    pub field_type: ColumnType,
    pub is_required: bool,
    pub value: Option<Value>,
}

#[async_trait]
pub trait Collection: Send + Sync {
    fn name(&self) -> &str;

    /// Current schema. Repeated reads return the same `Arc` until the
    /// schema version changes.
    fn schema(&self) -> Arc<CollectionSchema>;

    /// Monotonic counter bumped whenever `schema()` may return something new.
    fn schema_version(&self) -> u64;

    async fn list(&self, filter: &PaginatedFilter, projection: &Projection) -> Result<Vec<Record>>;

    async fn aggregate(
        &self,
        filter: &Filter,
        aggregation: &Aggregation,
        limit: Option<usize>,
    ) -> Result<Vec<AggregateResult>>;

    /// Returns the created records with generated keys filled in.
    async fn create(&self, records: Vec<Record>) -> Result<Vec<Record>>;

    async fn update(&self, filter: &Filter, patch: Record) -> Result<()>;

    async fn delete(&self, filter: &Filter) -> Result<()>;

    async fn execute(&self, action: &str, _data: Record, _filter: &Filter) -> Result<Value> {
        Err(Error::NotImplemented(format!(
            "action '{action}' on collection '{}'",
            self.name()
        )))
    }

    async fn get_form(&self, _action: &str, _data: Option<Record>) -> Result<Vec<ActionField>> {
        Ok(vec![])
    }

    async fn render_chart(&self, chart: &str, _record_id: Vec<Value>) -> Result<Value> {
        Err(Error::NotImplemented(format!(
            "chart '{chart}' on collection '{}'",
            self.name()
        )))
    }
}

pub type CollectionRef = Arc<dyn Collection>;
