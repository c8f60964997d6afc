//! Collection schemas. Pure data; decorators derive new schemas from their
//! child's instead of mutating them.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::operator::Operator;
use crate::types::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ColumnType {
    Boolean,
    Number,
    String,
    Date,
    Dateonly,
    Timeonly,
    Enum,
    Json,
    Uuid,
    Binary,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnSchema {
    pub column_type: ColumnType,
    pub filter_operators: BTreeSet<Operator>,
    pub is_primary_key: bool,
    pub is_read_only: bool,
    pub is_sortable: bool,
    pub is_groupable: bool,
    pub nullable: bool,
    pub default_value: Option<Value>,
    pub enum_values: Vec<String>,
}

impl ColumnSchema {
    /// A nullable, sortable, groupable column exposing the default operator
    /// set for its type.
    pub fn new(column_type: ColumnType) -> Self {
        Self {
            column_type,
            filter_operators: Operator::defaults_for(column_type),
            is_primary_key: false,
            is_read_only: false,
            is_sortable: true,
            is_groupable: true,
            nullable: true,
            default_value: None,
            enum_values: vec![],
        }
    }

    pub fn primary_key(mut self) -> Self {
        self.is_primary_key = true;
        self.nullable = false;
        self
    }

    pub fn read_only(mut self) -> Self {
        self.is_read_only = true;
        self
    }

    pub fn not_sortable(mut self) -> Self {
        self.is_sortable = false;
        self
    }

    pub fn not_nullable(mut self) -> Self {
        self.nullable = false;
        self
    }

    pub fn with_operators(mut self, ops: impl IntoIterator<Item = Operator>) -> Self {
        self.filter_operators = ops.into_iter().collect();
        self
    }

    pub fn with_enum_values(mut self, values: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.enum_values = values.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_default(mut self, value: impl Into<Value>) -> Self {
        self.default_value = Some(value.into());
        self
    }

    pub fn supports(&self, op: Operator) -> bool {
        self.filter_operators.contains(&op)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManyToOneSchema {
    pub foreign_collection: String,
    pub foreign_key: String,
    pub foreign_key_target: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OneToOneSchema {
    pub foreign_collection: String,
    pub origin_key: String,
    pub origin_key_target: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OneToManySchema {
    pub foreign_collection: String,
    pub origin_key: String,
    pub origin_key_target: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManyToManySchema {
    pub foreign_collection: String,
    pub through_collection: String,
    /// Column of the through collection pointing at the foreign collection.
    pub foreign_key: String,
    pub foreign_key_target: String,
    /// Column of the through collection pointing at the origin collection.
    pub origin_key: String,
    pub origin_key_target: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum FieldSchema {
    Column(ColumnSchema),
    ManyToOne(ManyToOneSchema),
    OneToOne(OneToOneSchema),
    OneToMany(OneToManySchema),
    ManyToMany(ManyToManySchema),
}

impl FieldSchema {
    pub fn as_column(&self) -> Option<&ColumnSchema> {
        match self {
            FieldSchema::Column(c) => Some(c),
            _ => None,
        }
    }

    pub fn as_column_mut(&mut self) -> Option<&mut ColumnSchema> {
        match self {
            FieldSchema::Column(c) => Some(c),
            _ => None,
        }
    }

    pub fn is_column(&self) -> bool {
        matches!(self, FieldSchema::Column(_))
    }

    pub fn foreign_collection(&self) -> Option<&str> {
        match self {
            FieldSchema::Column(_) => None,
            FieldSchema::ManyToOne(r) => Some(&r.foreign_collection),
            FieldSchema::OneToOne(r) => Some(&r.foreign_collection),
            FieldSchema::OneToMany(r) => Some(&r.foreign_collection),
            FieldSchema::ManyToMany(r) => Some(&r.foreign_collection),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            FieldSchema::Column(_) => "Column",
            FieldSchema::ManyToOne(_) => "ManyToOne",
            FieldSchema::OneToOne(_) => "OneToOne",
            FieldSchema::OneToMany(_) => "OneToMany",
            FieldSchema::ManyToMany(_) => "ManyToMany",
        }
    }
}

impl From<ColumnSchema> for FieldSchema {
    fn from(c: ColumnSchema) -> Self {
        FieldSchema::Column(c)
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CollectionSchema {
    pub fields: BTreeMap<String, FieldSchema>,
    pub searchable: bool,
    pub segments: Vec<String>,
    pub countable: bool,
}

impl CollectionSchema {
    pub fn new() -> Self {
        Self {
            countable: true,
            ..Default::default()
        }
    }

    pub fn with_field(mut self, name: impl Into<String>, field: impl Into<FieldSchema>) -> Self {
        self.fields.insert(name.into(), field.into());
        self
    }

    pub fn with_segments(mut self, segments: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.segments = segments.into_iter().map(Into::into).collect();
        self
    }

    pub fn searchable(mut self) -> Self {
        self.searchable = true;
        self
    }

    pub fn field(&self, name: &str) -> Option<&FieldSchema> {
        self.fields.get(name)
    }

    pub fn column(&self, name: &str) -> Option<&ColumnSchema> {
        self.fields.get(name).and_then(FieldSchema::as_column)
    }

    /// Field `name` when it is a relation.
    pub fn relation(&self, name: &str) -> Option<&FieldSchema> {
        self.fields.get(name).filter(|f| !f.is_column())
    }

    /// Primary key column names, in field order.
    pub fn primary_keys(&self) -> Vec<String> {
        self.fields
            .iter()
            .filter(|(_, f)| f.as_column().is_some_and(|c| c.is_primary_key))
            .map(|(name, _)| name.clone())
            .collect()
    }
}

/// Resolves a collection name to its current schema. Every datasource
/// implements this so path-walking helpers can cross relations.
pub trait SchemaLookup {
    fn schema_of(&self, collection: &str) -> Result<Arc<CollectionSchema>>;
}

/// Walk `path` (e.g. `"author:country:name"`) starting at `collection` and
/// return the name of the collection owning the last segment plus its schema.
pub fn resolve_field(
    lookup: &dyn SchemaLookup,
    collection: &str,
    path: &str,
) -> Result<(String, FieldSchema)> {
    let schema = lookup.schema_of(collection)?;
    let (head, rest) = match path.split_once(':') {
        Some((head, rest)) => (head, Some(rest)),
        None => (path, None),
    };
    let field = schema.field(head).ok_or_else(|| Error::UnknownField {
        collection: collection.to_string(),
        field: head.to_string(),
    })?;

    match (rest, field.foreign_collection()) {
        (None, _) => Ok((collection.to_string(), field.clone())),
        (Some(rest), Some(foreign)) => resolve_field(lookup, foreign, rest),
        (Some(_), None) => Err(Error::Validation(format!(
            "Unexpected field type: '{collection}.{head}' (found 'Column' expected relation)"
        ))),
    }
}

/// Like [`resolve_field`] but requires the path to end on a column.
pub fn resolve_column(
    lookup: &dyn SchemaLookup,
    collection: &str,
    path: &str,
) -> Result<(String, ColumnSchema)> {
    match resolve_field(lookup, collection, path)? {
        (owner, FieldSchema::Column(c)) => Ok((owner, c)),
        (owner, other) => Err(Error::Validation(format!(
            "Unexpected field type: '{owner}.{path}' (found '{}' expected 'Column')",
            other.kind()
        ))),
    }
}
