//! Ordered sort clauses and the stable in-memory multi-key sort.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::projection::Projection;
use crate::record::field_value;
use crate::types::{Record, Value};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortClause {
    pub field: String,
    pub ascending: bool,
}

impl SortClause {
    pub fn asc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            ascending: true,
        }
    }

    pub fn desc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            ascending: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Sort(Vec<SortClause>);

impl Sort {
    pub fn new(clauses: impl IntoIterator<Item = SortClause>) -> Self {
        Self(clauses.into_iter().collect())
    }

    pub fn clauses(&self) -> &[SortClause] {
        &self.0
    }

    pub fn iter(&self) -> impl Iterator<Item = &SortClause> {
        self.0.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn push(&mut self, clause: SortClause) {
        self.0.push(clause);
    }

    /// Fields the sort reads.
    pub fn projection(&self) -> Projection {
        self.0.iter().map(|c| c.field.as_str()).collect()
    }

    pub fn nest(&self, prefix: &str) -> Sort {
        if prefix.is_empty() {
            return self.clone();
        }
        Sort(
            self.0
                .iter()
                .map(|c| SortClause {
                    field: format!("{prefix}:{}", c.field),
                    ascending: c.ascending,
                })
                .collect(),
        )
    }

    pub fn unnest(&self) -> Result<Sort> {
        let Some(first) = self.0.first() else {
            return Ok(Sort::default());
        };
        let Some((prefix, _)) = first.field.split_once(':') else {
            return Err(Error::Unnest(format!(
                "heterogeneous sort cannot be unnested: '{}' has no relation",
                first.field
            )));
        };
        let needle = format!("{prefix}:");
        self.0
            .iter()
            .map(|c| match c.field.strip_prefix(&needle) {
                Some(rest) => Ok(SortClause {
                    field: rest.to_string(),
                    ascending: c.ascending,
                }),
                None => Err(Error::Unnest(format!(
                    "heterogeneous sort cannot be unnested: '{}' is not under '{prefix}'",
                    c.field
                ))),
            })
            .collect::<Result<Vec<_>>>()
            .map(Sort)
    }

    /// Flip the direction of every clause.
    pub fn inverse(&self) -> Sort {
        Sort(
            self.0
                .iter()
                .map(|c| SortClause {
                    field: c.field.clone(),
                    ascending: !c.ascending,
                })
                .collect(),
        )
    }

    pub fn replace_clauses<F, I>(&self, mut handler: F) -> Sort
    where
        F: FnMut(&SortClause) -> I,
        I: IntoIterator<Item = SortClause>,
    {
        Sort(self.0.iter().flat_map(|c| handler(c)).collect())
    }

    pub fn try_replace_clauses<F, I, E>(&self, mut handler: F) -> std::result::Result<Sort, E>
    where
        F: FnMut(&SortClause) -> std::result::Result<I, E>,
        I: IntoIterator<Item = SortClause>,
    {
        let mut out = Vec::with_capacity(self.0.len());
        for clause in &self.0 {
            out.extend(handler(clause)?);
        }
        Ok(Sort(out))
    }

    /// Compare two records clause by clause; the first non-equal clause decides.
    pub fn compare(&self, a: &Record, b: &Record) -> Ordering {
        for clause in &self.0 {
            let left = field_value(a, &clause.field).unwrap_or(&Value::Null);
            let right = field_value(b, &clause.field).unwrap_or(&Value::Null);
            let ordering = left.total_cmp(right);
            let ordering = if clause.ascending {
                ordering
            } else {
                ordering.reverse()
            };
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        Ordering::Equal
    }

    /// Stable sort: records equal on every clause keep their relative order.
    pub fn apply(&self, records: &mut [Record]) {
        if self.0.is_empty() {
            return;
        }
        records.sort_by(|a, b| self.compare(a, b));
    }
}

impl FromIterator<SortClause> for Sort {
    fn from_iter<T: IntoIterator<Item = SortClause>>(iter: T) -> Self {
        Sort(iter.into_iter().collect())
    }
}

impl IntoIterator for Sort {
    type Item = SortClause;
    type IntoIter = std::vec::IntoIter<SortClause>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}
