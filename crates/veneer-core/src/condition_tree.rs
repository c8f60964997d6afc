//! Boolean predicate trees over field paths.
//!
//! A tree is either a leaf comparison (`field operator value`) or a branch
//! combining children with `And`/`Or`. `And []` matches every record and
//! `Or []` matches none.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::operator::Operator;
use crate::projection::Projection;
use crate::record::{field_value, primary_key};
use crate::schema::CollectionSchema;
use crate::types::{Record, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Aggregator {
    And,
    Or,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConditionLeaf {
    pub field: String,
    pub operator: Operator,
    #[serde(default)]
    pub value: Value,
}

impl ConditionLeaf {
    pub fn new(field: impl Into<String>, operator: Operator, value: impl Into<Value>) -> Self {
        Self {
            field: field.into(),
            operator,
            value: value.into(),
        }
    }

    pub fn with_field(&self, field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            operator: self.operator,
            value: self.value.clone(),
        }
    }

    pub fn matches(&self, record: &Record) -> bool {
        let actual = field_value(record, &self.field).unwrap_or(&Value::Null);
        leaf_matches(self.operator, actual, &self.value)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConditionTree {
    Branch {
        aggregator: Aggregator,
        conditions: Vec<ConditionTree>,
    },
    Leaf(ConditionLeaf),
}

impl From<ConditionLeaf> for ConditionTree {
    fn from(leaf: ConditionLeaf) -> Self {
        ConditionTree::Leaf(leaf)
    }
}

impl ConditionTree {
    pub fn leaf(field: impl Into<String>, operator: Operator, value: impl Into<Value>) -> Self {
        ConditionTree::Leaf(ConditionLeaf::new(field, operator, value))
    }

    pub fn and(conditions: Vec<ConditionTree>) -> Self {
        ConditionTree::Branch {
            aggregator: Aggregator::And,
            conditions,
        }
    }

    pub fn or(conditions: Vec<ConditionTree>) -> Self {
        ConditionTree::Branch {
            aggregator: Aggregator::Or,
            conditions,
        }
    }

    pub fn match_all() -> Self {
        Self::and(vec![])
    }

    pub fn match_none() -> Self {
        Self::or(vec![])
    }

    pub fn is_match_all(&self) -> bool {
        matches!(self, ConditionTree::Branch { aggregator: Aggregator::And, conditions } if conditions.is_empty())
    }

    pub fn is_match_none(&self) -> bool {
        matches!(self, ConditionTree::Branch { aggregator: Aggregator::Or, conditions } if conditions.is_empty())
    }

    /// Tree matching exactly the records whose primary key is one of `ids`.
    ///
    /// A single primary key becomes an `Equal`/`In` leaf; composite keys
    /// become an `Or` of `And`s of `Equal` leaves.
    pub fn match_ids(schema: &CollectionSchema, ids: &[Vec<Value>]) -> Result<Self> {
        let pks = schema.primary_keys();
        if pks.is_empty() {
            return Err(Error::Validation(
                "Collection must have at least one primary key".into(),
            ));
        }
        if let Some(bad) = ids.iter().find(|id| id.len() != pks.len()) {
            return Err(Error::InvalidValue(format!(
                "Expected {} primary key values, got {}",
                pks.len(),
                bad.len()
            )));
        }

        match (pks.len(), ids.len()) {
            (_, 0) => Ok(Self::match_none()),
            (1, 1) => Ok(Self::leaf(pks[0].clone(), Operator::Equal, ids[0][0].clone())),
            (1, _) => Ok(Self::leaf(
                pks[0].clone(),
                Operator::In,
                Value::List(ids.iter().map(|id| id[0].clone()).collect()),
            )),
            _ => Ok(Self::union(ids.iter().map(|id| {
                Self::intersect(
                    pks.iter()
                        .zip(id)
                        .map(|(pk, v)| Self::leaf(pk.clone(), Operator::Equal, v.clone())),
                )
            }))),
        }
    }

    pub fn match_records(schema: &CollectionSchema, records: &[Record]) -> Result<Self> {
        let ids = records
            .iter()
            .map(|r| primary_key(schema, r))
            .collect::<Result<Vec<_>>>()?;
        Self::match_ids(schema, &ids)
    }

    /// Conjunction of `trees`, flattening nested `And`s and dropping
    /// match-all members.
    pub fn intersect(trees: impl IntoIterator<Item = ConditionTree>) -> Self {
        Self::merge(Aggregator::And, trees)
    }

    /// Disjunction of `trees`, flattening nested `Or`s and dropping
    /// match-none members.
    pub fn union(trees: impl IntoIterator<Item = ConditionTree>) -> Self {
        Self::merge(Aggregator::Or, trees)
    }

    fn merge(aggregator: Aggregator, trees: impl IntoIterator<Item = ConditionTree>) -> Self {
        let mut conditions = Vec::new();
        for tree in trees {
            match tree {
                ConditionTree::Branch {
                    aggregator: inner,
                    conditions: children,
                } if inner == aggregator => conditions.extend(children),
                other => conditions.push(other),
            }
        }
        if conditions.len() == 1 {
            return conditions.remove(0);
        }
        ConditionTree::Branch {
            aggregator,
            conditions,
        }
    }

    pub fn leafs(&self) -> Vec<&ConditionLeaf> {
        let mut out = Vec::new();
        self.collect_leafs(&mut out);
        out
    }

    fn collect_leafs<'a>(&'a self, out: &mut Vec<&'a ConditionLeaf>) {
        match self {
            ConditionTree::Leaf(leaf) => out.push(leaf),
            ConditionTree::Branch { conditions, .. } => {
                for c in conditions {
                    c.collect_leafs(out);
                }
            }
        }
    }

    /// Fields read by the tree.
    pub fn projection(&self) -> Projection {
        self.leafs().into_iter().map(|l| l.field.as_str()).collect()
    }

    pub fn nest(&self, prefix: &str) -> ConditionTree {
        if prefix.is_empty() {
            return self.clone();
        }
        self.replace_fields(|field| format!("{prefix}:{field}"))
    }

    pub fn unnest(&self) -> Result<ConditionTree> {
        let Some(first) = self.leafs().first().map(|l| l.field.clone()) else {
            return Ok(self.clone());
        };
        let Some((prefix, _)) = first.split_once(':') else {
            return Err(Error::Unnest(format!(
                "heterogeneous condition tree cannot be unnested: '{first}' has no relation"
            )));
        };
        let needle = format!("{prefix}:");
        self.try_replace_leafs(|leaf| match leaf.field.strip_prefix(&needle) {
            Some(rest) => Ok(ConditionTree::Leaf(leaf.with_field(rest))),
            None => Err(Error::Unnest(format!(
                "heterogeneous condition tree cannot be unnested: '{}' is not under '{prefix}'",
                leaf.field
            ))),
        })
    }

    pub fn replace_fields(&self, mut handler: impl FnMut(&str) -> String) -> ConditionTree {
        self.replace_leafs(|leaf| ConditionTree::Leaf(leaf.with_field(handler(&leaf.field))))
    }

    pub fn replace_leafs(&self, mut handler: impl FnMut(&ConditionLeaf) -> ConditionTree) -> ConditionTree {
        match self.try_replace_leafs(|leaf| Ok::<_, std::convert::Infallible>(handler(leaf))) {
            Ok(tree) => tree,
            Err(never) => match never {},
        }
    }

    /// Rebuild the tree, replacing every leaf by the tree `handler` returns.
    pub fn try_replace_leafs<E>(
        &self,
        mut handler: impl FnMut(&ConditionLeaf) -> std::result::Result<ConditionTree, E>,
    ) -> std::result::Result<ConditionTree, E> {
        self.try_replace_leafs_inner(&mut handler)
    }

    fn try_replace_leafs_inner<E>(
        &self,
        handler: &mut impl FnMut(&ConditionLeaf) -> std::result::Result<ConditionTree, E>,
    ) -> std::result::Result<ConditionTree, E> {
        match self {
            ConditionTree::Leaf(leaf) => handler(leaf),
            ConditionTree::Branch {
                aggregator,
                conditions,
            } => Ok(ConditionTree::Branch {
                aggregator: *aggregator,
                conditions: conditions
                    .iter()
                    .map(|c| c.try_replace_leafs_inner(handler))
                    .collect::<std::result::Result<Vec<_>, E>>()?,
            }),
        }
    }

    pub fn matches(&self, record: &Record) -> bool {
        match self {
            ConditionTree::Leaf(leaf) => leaf.matches(record),
            ConditionTree::Branch {
                aggregator: Aggregator::And,
                conditions,
            } => conditions.iter().all(|c| c.matches(record)),
            ConditionTree::Branch {
                aggregator: Aggregator::Or,
                conditions,
            } => conditions.iter().any(|c| c.matches(record)),
        }
    }

    pub fn filter(&self, records: Vec<Record>) -> Vec<Record> {
        records.into_iter().filter(|r| self.matches(r)).collect()
    }
}

fn leaf_matches(operator: Operator, actual: &Value, expected: &Value) -> bool {
    use Operator::*;

    match operator {
        Present => !is_blank(actual),
        Blank => is_blank(actual),
        Missing => actual.is_null(),
        Equal => actual == expected,
        NotEqual => actual != expected,
        LessThan | Before => ordered(actual, expected) == Some(Ordering::Less),
        GreaterThan | After => ordered(actual, expected) == Some(Ordering::Greater),
        LessThanOrEqual => matches!(ordered(actual, expected), Some(Ordering::Less | Ordering::Equal)),
        GreaterThanOrEqual => {
            matches!(ordered(actual, expected), Some(Ordering::Greater | Ordering::Equal))
        }
        In => contains_value(expected, actual),
        NotIn => !contains_value(expected, actual),
        Like => strings(actual, expected).is_some_and(|(a, e)| like(a, e)),
        ILike => strings(actual, expected)
            .is_some_and(|(a, e)| like(&a.to_lowercase(), &e.to_lowercase())),
        Contains => strings(actual, expected).is_some_and(|(a, e)| a.contains(e)),
        NotContains => !strings(actual, expected).is_some_and(|(a, e)| a.contains(e)),
        IContains => {
            strings(actual, expected).is_some_and(|(a, e)| a.to_lowercase().contains(&e.to_lowercase()))
        }
        StartsWith => strings(actual, expected).is_some_and(|(a, e)| a.starts_with(e)),
        EndsWith => strings(actual, expected).is_some_and(|(a, e)| a.ends_with(e)),
        IncludesAll => match (actual.as_list(), expected.as_list()) {
            (Some(items), Some(wanted)) => wanted.iter().all(|w| items.contains(w)),
            _ => false,
        },
        IncludesNone => match (actual.as_list(), expected.as_list()) {
            (Some(items), Some(wanted)) => !wanted.iter().any(|w| items.contains(w)),
            (None, _) => actual.is_null(),
            _ => false,
        },
    }
}

fn is_blank(v: &Value) -> bool {
    match v {
        Value::Null => true,
        Value::Str(s) => s.is_empty(),
        _ => false,
    }
}

/// Ordering between two non-null values of the same kind.
fn ordered(actual: &Value, expected: &Value) -> Option<Ordering> {
    if actual.is_null() || expected.is_null() || actual.type_name() != expected.type_name() {
        return None;
    }
    Some(actual.total_cmp(expected))
}

fn contains_value(list: &Value, needle: &Value) -> bool {
    match list {
        Value::List(items) => items.contains(needle),
        other => other == needle,
    }
}

fn strings<'a>(actual: &'a Value, expected: &'a Value) -> Option<(&'a str, &'a str)> {
    Some((actual.as_str()?, expected.as_str()?))
}

/// SQL `LIKE` matching: `%` matches any run of characters, `_` exactly one.
fn like(text: &str, pattern: &str) -> bool {
    let text: Vec<char> = text.chars().collect();
    let pattern: Vec<char> = pattern.chars().collect();
    let (mut t, mut p) = (0, 0);
    let mut backtrack: Option<(usize, usize)> = None;

    while t < text.len() {
        if p < pattern.len() && (pattern[p] == '_' || pattern[p] == text[t]) {
            t += 1;
            p += 1;
        } else if p < pattern.len() && pattern[p] == '%' {
            backtrack = Some((p, t));
            p += 1;
        } else if let Some((star, matched)) = backtrack {
            p = star + 1;
            t = matched + 1;
            backtrack = Some((star, matched + 1));
        } else {
            return false;
        }
    }
    pattern[p..].iter().all(|c| *c == '%')
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record;
    use crate::schema::{ColumnSchema, ColumnType};

    #[test]
    fn null_semantics() {
        let r = record! { "n" => Value::Null, "s" => "" };
        assert!(!ConditionTree::leaf("n", Operator::LessThan, 5).matches(&r));
        assert!(!ConditionTree::leaf("n", Operator::GreaterThan, 5).matches(&r));
        assert!(ConditionTree::leaf("n", Operator::Missing, Value::Null).matches(&r));
        assert!(ConditionTree::leaf("missing", Operator::Missing, Value::Null).matches(&r));
        assert!(ConditionTree::leaf("s", Operator::Blank, Value::Null).matches(&r));
        assert!(ConditionTree::leaf("n", Operator::NotEqual, 5).matches(&r));
        assert!(ConditionTree::leaf("n", Operator::NotIn, vec![Value::from(1)]).matches(&r));
    }

    #[test]
    fn empty_branches() {
        let r = record! { "a" => 1 };
        assert!(ConditionTree::match_all().matches(&r));
        assert!(!ConditionTree::match_none().matches(&r));
    }

    #[test]
    fn like_patterns() {
        assert!(like("hello world", "h%o w_rld"));
        assert!(like("abc", "%"));
        assert!(like("abc", "a%c%"));
        assert!(!like("abc", "a_"));
        assert!(!like("abd", "%c"));
        let r = record! { "name" => "Alice" };
        assert!(ConditionTree::leaf("name", Operator::ILike, "al%").matches(&r));
        assert!(!ConditionTree::leaf("name", Operator::Like, "al%").matches(&r));
    }

    #[test]
    fn comparisons_follow_paths() {
        let r = record! { "author" => record! { "age" => 42 } };
        assert!(ConditionTree::leaf("author:age", Operator::GreaterThanOrEqual, 42).matches(&r));
        assert!(ConditionTree::leaf("author:age", Operator::In, vec![Value::from(1), Value::from(42.0)])
            .matches(&r));
    }

    #[test]
    fn match_ids_for_single_and_composite_keys() {
        let single = CollectionSchema::new()
            .with_field("id", ColumnSchema::new(ColumnType::Number).primary_key());
        let tree = ConditionTree::match_ids(&single, &[vec![1.into()], vec![2.into()]]).unwrap();
        assert_eq!(
            tree,
            ConditionTree::leaf("id", Operator::In, vec![Value::from(1), Value::from(2)])
        );
        assert!(ConditionTree::match_ids(&single, &[]).unwrap().is_match_none());

        let composite = single.with_field("k", ColumnSchema::new(ColumnType::String).primary_key());
        let tree = ConditionTree::match_ids(
            &composite,
            &[vec![1.into(), "a".into()], vec![2.into(), "b".into()]],
        )
        .unwrap();
        assert!(tree.matches(&record! { "id" => 2, "k" => "b" }));
        assert!(!tree.matches(&record! { "id" => 2, "k" => "a" }));
    }

    #[test]
    fn intersect_flattens_and_drops_match_all() {
        let a = ConditionTree::leaf("a", Operator::Equal, 1);
        let b = ConditionTree::leaf("b", Operator::Equal, 2);
        assert_eq!(ConditionTree::intersect([a.clone(), ConditionTree::match_all()]), a);
        let both = ConditionTree::intersect([ConditionTree::and(vec![a.clone()]), b.clone()]);
        assert_eq!(both, ConditionTree::and(vec![a, b]));
    }

    #[test]
    fn nest_and_unnest() {
        let tree = ConditionTree::or(vec![
            ConditionTree::leaf("name", Operator::Equal, "x"),
            ConditionTree::leaf("age", Operator::LessThan, 3),
        ]);
        let nested = tree.nest("author");
        assert_eq!(nested.projection(), Projection::from(["author:name", "author:age"]));
        assert_eq!(nested.unnest().unwrap(), tree);
        assert!(tree.unnest().is_err());
    }

    #[test]
    fn serde_shape() {
        let tree = ConditionTree::and(vec![ConditionTree::leaf("a", Operator::In, vec![Value::from(1)])]);
        let json = serde_json::to_string(&tree).unwrap();
        let back: ConditionTree = serde_json::from_str(&json).unwrap();
        assert_eq!(back, tree);
    }
}
