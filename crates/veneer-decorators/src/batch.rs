//! Listing a collection page by page.

use async_trait::async_trait;
use veneer_core::aggregation::{AggregateResult, Aggregation};
use veneer_core::config::VeneerConfig;
use veneer_core::filter::{Filter, Page, PaginatedFilter};
use veneer_core::projection::Projection;
use veneer_core::schema::CollectionSchema;
use veneer_core::sort::{Sort, SortClause};
use veneer_core::types::{Record, Value};

use std::sync::Arc;

use crate::collection::{ActionField, Collection, CollectionRef};
use crate::error::{Error, Result};
use crate::metrics;

/// Wraps a collection so that `list` reads at most `batch_size` records per
/// call to the inner collection. Pages are fetched one after the other, in
/// primary key order within equal sort keys.
pub struct BatchCollection {
    inner: CollectionRef,
    batch_size: usize,
}

impl BatchCollection {
    pub fn new(inner: CollectionRef, config: &VeneerConfig) -> Result<Self> {
        Self::with_batch_size(inner, config.batch_size)
    }

    pub fn with_batch_size(inner: CollectionRef, batch_size: usize) -> Result<Self> {
        if batch_size == 0 {
            return Err(Error::Validation("batch_size must be > 0".into()));
        }
        Ok(Self { inner, batch_size })
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    fn stable_sort(&self, sort: Option<&Sort>) -> Sort {
        let mut sort = sort.cloned().unwrap_or_default();
        for pk in self.inner.schema().primary_keys() {
            if !sort.iter().any(|c| c.field == pk) {
                sort.push(SortClause::asc(pk));
            }
        }
        sort
    }
}

#[async_trait]
impl Collection for BatchCollection {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn schema(&self) -> Arc<CollectionSchema> {
        self.inner.schema()
    }

    fn schema_version(&self) -> u64 {
        self.inner.schema_version()
    }

    async fn list(&self, filter: &PaginatedFilter, projection: &Projection) -> Result<Vec<Record>> {
        let sort = self.stable_sort(filter.sort.as_ref());
        let (mut skip, mut remaining) = match filter.page {
            Some(page) => (page.skip, Some(page.limit)),
            None => (0, None),
        };

        let mut out = Vec::new();
        let mut pages = 0usize;
        loop {
            let limit = remaining.map_or(self.batch_size, |r| r.min(self.batch_size));
            if limit == 0 {
                break;
            }
            let batch_filter = filter
                .clone()
                .with_sort(Some(sort.clone()))
                .with_page(Some(Page::new(skip, limit)));
            let batch = self.inner.list(&batch_filter, projection).await?;
            pages += 1;

            let fetched = batch.len();
            out.extend(batch);
            skip += fetched;
            remaining = remaining.map(|r| r - fetched);
            if fetched < limit {
                break;
            }
        }

        metrics::emit_event(
            "batch.list",
            &[
                ("collection", self.name().to_string()),
                ("pages", pages.to_string()),
                ("rows", out.len().to_string()),
            ],
        );
        Ok(out)
    }

    async fn aggregate(
        &self,
        filter: &Filter,
        aggregation: &Aggregation,
        limit: Option<usize>,
    ) -> Result<Vec<AggregateResult>> {
        self.inner.aggregate(filter, aggregation, limit).await
    }

    async fn create(&self, records: Vec<Record>) -> Result<Vec<Record>> {
        self.inner.create(records).await
    }

    async fn update(&self, filter: &Filter, patch: Record) -> Result<()> {
        self.inner.update(filter, patch).await
    }

    async fn delete(&self, filter: &Filter) -> Result<()> {
        self.inner.delete(filter).await
    }

    async fn execute(&self, action: &str, data: Record, filter: &Filter) -> Result<Value> {
        self.inner.execute(action, data, filter).await
    }

    async fn get_form(&self, action: &str, data: Option<Record>) -> Result<Vec<ActionField>> {
        self.inner.get_form(action, data).await
    }

    async fn render_chart(&self, chart: &str, record_id: Vec<Value>) -> Result<Value> {
        self.inner.render_chart(chart, record_id).await
    }
}
