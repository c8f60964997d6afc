//! Computed fields through the decorator stack.


use std::sync::{Arc, Mutex};

use test_data_gen::library;
use veneer_core::aggregation::Aggregation;
use veneer_core::condition_tree::ConditionTree;
use veneer_core::config::VeneerConfig;
use veneer_core::filter::PaginatedFilter;
use veneer_core::operator::Operator;
use veneer_core::projection::Projection;
use veneer_core::record::field_value;
use veneer_core::schema::ColumnType;
use veneer_core::types::{Record, Value};
use veneer_decorators::{ComputedDefinition, DecoratorStack, Error, RelationDefinition};

fn decade() -> ComputedDefinition {
    ComputedDefinition::from_fn(ColumnType::Number, ["year"], |r| {
        Value::from(r.get("year").and_then(Value::as_i64).map(|y| y / 10 * 10))
    })
}

fn by_id(id: i64) -> PaginatedFilter {
    PaginatedFilter::new().with_condition_tree(Some(ConditionTree::leaf("id", Operator::Equal, id)))
}

#[tokio::test]
async fn evaluator_runs_once_over_distinct_inputs() {
    let lib = library();
    let stack = DecoratorStack::new(lib.ds.clone(), VeneerConfig::default());

    let batches = Arc::new(Mutex::new(Vec::<usize>::new()));
    let seen = batches.clone();
    let definition = ComputedDefinition::new(ColumnType::Number, ["year"], move |records: Vec<Record>| {
        seen.lock().unwrap().push(records.len());
        async move {
            let values: Vec<Value> = records
                .iter()
                .map(|r| Value::from(r["year"].as_i64().map(|y| y / 10 * 10)))
                .collect();
            Ok::<_, Error>(values)
        }
    });
    stack.add_field("books", "decade", definition).unwrap();

    let rows = stack
        .collection("books")
        .unwrap()
        .list(&PaginatedFilter::new(), &Projection::from(["id", "decade"]))
        .await
        .unwrap();
    let decades: Vec<Value> = rows.iter().map(|r| r["decade"].clone()).collect();
    assert_eq!(
        decades,
        [1970, 1990, 1970, 2010, 1980, 1970].map(Value::from).to_vec()
    );
    // Six books, five distinct years, one call.
    assert_eq!(*batches.lock().unwrap(), vec![5]);
}

#[tokio::test]
async fn computed_fields_depend_on_other_computed_fields() {
    let lib = library();
    let stack = DecoratorStack::new(lib.ds.clone(), VeneerConfig::default());
    stack.add_field("books", "decade", decade()).unwrap();
    stack
        .add_field(
            "books",
            "label",
            ComputedDefinition::from_fn(ColumnType::String, ["title", "decade"], |r| {
                let title = r.get("title").and_then(Value::as_str).unwrap_or_default();
                let decade = r.get("decade").and_then(Value::as_i64).unwrap_or_default();
                Value::from(format!("{title} ({decade}s)"))
            }),
        )
        .unwrap();

    let rows = stack
        .collection("books")
        .unwrap()
        .list(&by_id(3), &Projection::from(["label"]))
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["label"], Value::from("The Lathe of Heaven (1970s)"));
    // Only what was asked for comes back.
    assert_eq!(rows[0].len(), 1);
}

#[tokio::test]
async fn computed_fields_read_through_relations() {
    let lib = library();
    let stack = DecoratorStack::new(lib.ds.clone(), VeneerConfig::default());
    stack
        .add_relation(
            "books",
            "author",
            RelationDefinition::ManyToOne {
                foreign_collection: "authors".into(),
                foreign_key: "author_id".into(),
                foreign_key_target: None,
            },
        )
        .unwrap();
    stack
        .add_field(
            "books",
            "author_name",
            ComputedDefinition::from_fn(
                ColumnType::String,
                ["author:first_name", "author:last_name"],
                |r| match (field_value(r, "author:first_name"), field_value(r, "author:last_name")) {
                    (Some(Value::Str(first)), Some(Value::Str(last))) => Value::from(format!("{first} {last}")),
                    _ => Value::Null,
                },
            ),
        )
        .unwrap();

    let books = stack.collection("books").unwrap();
    let rows = books
        .list(&PaginatedFilter::new(), &Projection::from(["id", "author_name"]))
        .await
        .unwrap();
    assert_eq!(rows[0]["author_name"], Value::from("Ursula Le Guin"));
    assert_eq!(rows[1]["author_name"], Value::from("Iain Banks"));
    assert_eq!(rows[5]["author_name"], Value::Null);
    assert!(!rows[0].contains_key("author"));

    let column = books.schema().column("author_name").cloned().unwrap();
    assert!(column.is_read_only);
    assert!(!column.is_sortable);
}

#[tokio::test]
async fn aggregating_a_computed_field_lists_and_groups_in_memory() {
    let lib = library();
    let stack = DecoratorStack::new(lib.ds.clone(), VeneerConfig::default());
    stack.add_field("books", "decade", decade()).unwrap();

    let results = stack
        .collection("books")
        .unwrap()
        .aggregate(&Default::default(), &Aggregation::count().with_group("decade", None), None)
        .await
        .unwrap();
    assert_eq!(results.len(), 4);
    assert_eq!(results[0].value, Value::Int(3));
    assert_eq!(results[0].group["decade"], Value::Int(1970));
}

#[tokio::test]
async fn evaluator_returning_the_wrong_number_of_values_is_an_error() {
    let lib = library();
    let stack = DecoratorStack::new(lib.ds.clone(), VeneerConfig::default());
    stack
        .add_field(
            "books",
            "broken",
            ComputedDefinition::new(ColumnType::Number, ["year"], |_records: Vec<Record>| async {
                Ok::<_, Error>(Vec::<Value>::new())
            }),
        )
        .unwrap();

    let err = stack
        .collection("books")
        .unwrap()
        .list(&PaginatedFilter::new(), &Projection::from(["broken"]))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Invariant(_)), "{err}");
}

#[test]
fn invalid_computed_fields_are_rejected() {
    let lib = library();
    let stack = DecoratorStack::new(lib.ds.clone(), VeneerConfig::default());

    let unknown = ComputedDefinition::from_fn(ColumnType::Number, ["nope"], |_| Value::Null);
    assert!(matches!(
        stack.add_field("books", "x", unknown),
        Err(Error::Validation(_))
    ));

    assert!(matches!(
        stack.add_field("books", "title", decade()),
        Err(Error::Validation(m)) if m.contains("already exists")
    ));
    assert!(matches!(
        stack.add_field("books", "a:b", decade()),
        Err(Error::Validation(_))
    ));

    let empty = ComputedDefinition::from_fn(ColumnType::Number, Vec::<String>::new(), |_| Value::Null);
    assert!(matches!(
        stack.add_field("books", "x", empty),
        Err(Error::Validation(_))
    ));

    assert!(matches!(
        stack.add_field("publishers", "x", decade()),
        Err(Error::UnknownCollection(_))
    ));
}
