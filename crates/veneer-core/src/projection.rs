//! Projections: ordered sets of colon-separated field paths.
//!
//! `"title"` names a column, `"author:name"` names the `name` column of the
//! record reached through the `author` relation. Every decorator rewrites
//! projections with [`Projection::replace`] before forwarding a query.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::schema::SchemaLookup;
use crate::types::{Record, Value};

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Projection(Vec<String>);

impl Projection {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn paths(&self) -> &[String] {
        &self.0
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn contains(&self, path: &str) -> bool {
        self.0.iter().any(|p| p == path)
    }

    /// Append a path unless it is already present.
    pub fn push(&mut self, path: impl Into<String>) {
        let path = path.into();
        if !self.contains(&path) {
            self.0.push(path);
        }
    }

    /// Paths that name columns of this collection.
    pub fn columns(&self) -> Vec<&str> {
        self.iter().filter(|p| !p.contains(':')).collect()
    }

    /// Sub-projections grouped by relation name, in order of first occurrence.
    pub fn relations(&self) -> Vec<(String, Projection)> {
        let mut out: Vec<(String, Projection)> = Vec::new();
        for path in &self.0 {
            if let Some((relation, rest)) = path.split_once(':') {
                match out.iter_mut().find(|(name, _)| name == relation) {
                    Some((_, sub)) => sub.push(rest),
                    None => out.push((relation.to_string(), Projection(vec![rest.to_string()]))),
                }
            }
        }
        out
    }

    /// Prefix every path with `prefix:`. Identity when `prefix` is empty.
    pub fn nest(&self, prefix: &str) -> Projection {
        if prefix.is_empty() {
            return self.clone();
        }
        Projection(self.0.iter().map(|p| format!("{prefix}:{p}")).collect())
    }

    /// Strip the first segment shared by every path.
    pub fn unnest(&self) -> Result<Projection> {
        let Some(first) = self.0.first() else {
            return Ok(Projection::new());
        };
        let prefix = match first.split_once(':') {
            Some((prefix, _)) => prefix,
            None => {
                return Err(Error::Unnest(format!(
                    "heterogeneous projection cannot be unnested: '{first}' has no relation"
                )))
            }
        };
        let needle = format!("{prefix}:");
        self.0
            .iter()
            .map(|p| {
                p.strip_prefix(&needle).map(str::to_string).ok_or_else(|| {
                    Error::Unnest(format!(
                        "heterogeneous projection cannot be unnested: '{p}' is not under '{prefix}'"
                    ))
                })
            })
            .collect::<Result<Vec<_>>>()
            .map(Projection)
    }

    /// Set union keeping the order of first occurrence.
    pub fn union<'a>(&self, others: impl IntoIterator<Item = &'a Projection>) -> Projection {
        let mut out = Projection::new();
        for path in self.iter().chain(others.into_iter().flat_map(|p| p.iter())) {
            out.push(path);
        }
        out
    }

    /// Map every path through `handler` (which may return zero, one, or many
    /// paths) and union the results.
    pub fn replace<F, I>(&self, mut handler: F) -> Projection
    where
        F: FnMut(&str) -> I,
        I: IntoIterator<Item = String>,
    {
        let mut out = Projection::new();
        for path in &self.0 {
            for replaced in handler(path.as_str()) {
                out.push(replaced);
            }
        }
        out
    }

    /// Fallible variant of [`Projection::replace`].
    pub fn try_replace<F, I, E>(&self, mut handler: F) -> std::result::Result<Projection, E>
    where
        F: FnMut(&str) -> std::result::Result<I, E>,
        I: IntoIterator<Item = String>,
    {
        let mut out = Projection::new();
        for path in &self.0 {
            for replaced in handler(path.as_str())? {
                out.push(replaced);
            }
        }
        Ok(out)
    }

    /// Append the primary keys of `collection` and, for every relation in the
    /// projection, the related collection's primary keys nested under the
    /// relation name.
    pub fn with_pks(&self, collection: &str, lookup: &dyn SchemaLookup) -> Result<Projection> {
        let schema = lookup.schema_of(collection)?;
        let mut out = self.clone();
        for pk in schema.primary_keys() {
            out.push(pk);
        }
        for (relation, sub) in self.relations() {
            let foreign = schema
                .field(&relation)
                .and_then(|f| f.foreign_collection())
                .ok_or_else(|| Error::UnknownField {
                    collection: collection.to_string(),
                    field: relation.clone(),
                })?;
            for path in sub.with_pks(foreign, lookup)?.nest(&relation).iter() {
                out.push(path);
            }
        }
        Ok(out)
    }

    /// Keep exactly the requested columns and nested relations of `record`.
    /// Null relations stay null; absent columns stay absent.
    pub fn apply(&self, record: &Record) -> Record {
        let mut out = Record::new();
        for column in self.columns() {
            if let Some(value) = record.get(column) {
                out.insert(column.to_string(), value.clone());
            }
        }
        for (relation, sub) in self.relations() {
            let value = match record.get(&relation) {
                Some(Value::Record(child)) => Value::Record(sub.apply(child)),
                Some(Value::List(items)) => Value::List(
                    items
                        .iter()
                        .map(|item| match item {
                            Value::Record(child) => Value::Record(sub.apply(child)),
                            other => other.clone(),
                        })
                        .collect(),
                ),
                _ => Value::Null,
            };
            out.insert(relation, value);
        }
        out
    }

    pub fn apply_all(&self, records: &[Record]) -> Vec<Record> {
        records.iter().map(|r| self.apply(r)).collect()
    }
}

impl IntoIterator for Projection {
    type Item = String;
    type IntoIter = std::vec::IntoIter<String>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl<'a> IntoIterator for &'a Projection {
    type Item = &'a String;
    type IntoIter = std::slice::Iter<'a, String>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

impl FromIterator<String> for Projection {
    fn from_iter<T: IntoIterator<Item = String>>(iter: T) -> Self {
        let mut out = Projection::new();
        for path in iter {
            out.push(path);
        }
        out
    }
}

impl<'a> FromIterator<&'a str> for Projection {
    fn from_iter<T: IntoIterator<Item = &'a str>>(iter: T) -> Self {
        iter.into_iter().map(str::to_string).collect()
    }
}

impl<const N: usize> From<[&str; N]> for Projection {
    fn from(paths: [&str; N]) -> Self {
        paths.into_iter().collect()
    }
}

impl From<Vec<String>> for Projection {
    fn from(paths: Vec<String>) -> Self {
        paths.into_iter().collect()
    }
}
