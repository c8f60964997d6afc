//! Filters: predicate plus search/segment/timezone, and the paginated variant
//! carrying sort and page.

use serde::{Deserialize, Serialize};

use crate::condition_tree::ConditionTree;
use crate::error::{Error, Result};
use crate::sort::Sort;
use crate::types::Record;

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Filter {
    pub condition_tree: Option<ConditionTree>,
    pub search: Option<String>,
    #[serde(default)]
    pub search_extended: bool,
    pub segment: Option<String>,
    pub timezone: Option<String>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_condition_tree(mut self, tree: Option<ConditionTree>) -> Self {
        self.condition_tree = tree;
        self
    }

    pub fn with_search(mut self, search: Option<String>, extended: bool) -> Self {
        self.search = search;
        self.search_extended = extended;
        self
    }

    pub fn with_segment(mut self, segment: Option<String>) -> Self {
        self.segment = segment;
        self
    }

    pub fn with_timezone(mut self, timezone: impl Into<String>) -> Self {
        self.timezone = Some(timezone.into());
        self
    }

    /// Search and segments are bound to the collection they were written for.
    pub fn is_nestable(&self) -> bool {
        self.search.is_none() && self.segment.is_none()
    }

    /// Re-express the filter from the point of view of a collection that
    /// reaches this one through `prefix`.
    pub fn nest(&self, prefix: &str) -> Result<Filter> {
        if !self.is_nestable() {
            return Err(Error::Validation(
                "Filter can only be nested when it has no search or segment".into(),
            ));
        }
        Ok(Filter {
            condition_tree: self.condition_tree.as_ref().map(|t| t.nest(prefix)),
            ..self.clone()
        })
    }

    pub fn effective_timezone<'a>(&'a self, default: &'a str) -> &'a str {
        self.timezone.as_deref().unwrap_or(default)
    }

    /// In-memory evaluation of the condition tree alone.
    pub fn matches(&self, record: &Record) -> bool {
        self.condition_tree.as_ref().map_or(true, |t| t.matches(record))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Page {
    pub skip: usize,
    pub limit: usize,
}

impl Page {
    pub fn new(skip: usize, limit: usize) -> Self {
        Self { skip, limit }
    }

    pub fn apply<T>(&self, items: Vec<T>) -> Vec<T> {
        items.into_iter().skip(self.skip).take(self.limit).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PaginatedFilter {
    #[serde(flatten)]
    pub filter: Filter,
    pub sort: Option<Sort>,
    pub page: Option<Page>,
}

impl PaginatedFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_condition_tree(mut self, tree: Option<ConditionTree>) -> Self {
        self.filter.condition_tree = tree;
        self
    }

    pub fn with_sort(mut self, sort: Option<Sort>) -> Self {
        self.sort = sort;
        self
    }

    pub fn with_page(mut self, page: Option<Page>) -> Self {
        self.page = page;
        self
    }

    pub fn with_search(mut self, search: Option<String>, extended: bool) -> Self {
        self.filter = self.filter.with_search(search, extended);
        self
    }

    pub fn with_segment(mut self, segment: Option<String>) -> Self {
        self.filter.segment = segment;
        self
    }

    pub fn condition_tree(&self) -> Option<&ConditionTree> {
        self.filter.condition_tree.as_ref()
    }

    pub fn nest(&self, prefix: &str) -> Result<PaginatedFilter> {
        Ok(PaginatedFilter {
            filter: self.filter.nest(prefix)?,
            sort: self.sort.as_ref().map(|s| s.nest(prefix)),
            page: self.page,
        })
    }

    pub fn into_filter(self) -> Filter {
        self.filter
    }
}

impl From<Filter> for PaginatedFilter {
    fn from(filter: Filter) -> Self {
        Self {
            filter,
            sort: None,
            page: None,
        }
    }
}
