//! Write handlers and writes through relations.


use std::sync::{Arc, Mutex};

use test_data_gen::library;
use veneer_core::condition_tree::ConditionTree;
use veneer_core::config::VeneerConfig;
use veneer_core::filter::Filter;
use veneer_core::operator::Operator;
use veneer_core::record;
use veneer_core::schema::ColumnType;
use veneer_core::types::{Record, Value};
use veneer_decorators::{
    ComputedDefinition, DecoratorStack, Error, RelationDefinition, WriteAction, WriteContext,
};

fn with_author(stack: &DecoratorStack) {
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
}

fn book_id(id: i64) -> Filter {
    Filter::new().with_condition_tree(Some(ConditionTree::leaf("id", Operator::Equal, id)))
}

#[tokio::test]
async fn handlers_chain_and_see_the_whole_record() {
    let lib = library();
    let stack = DecoratorStack::new(lib.ds.clone(), VeneerConfig::default());

    let actions = Arc::new(Mutex::new(Vec::<WriteAction>::new()));
    let seen = actions.clone();
    // "Dune (1965)" is split into a title and a year.
    stack
        .replace_field_writing("books", "title", move |value: Value, context: WriteContext| {
            seen.lock().unwrap().push(context.action);
            async move {
                let raw = value.as_str().unwrap_or_default().to_string();
                let patch = match raw.rsplit_once(" (") {
                    Some((title, year)) => record! {
                        "title" => title,
                        "year" => year.trim_end_matches(')').parse::<i64>().unwrap_or_default(),
                    },
                    None => record! { "title" => raw },
                };
                Ok::<_, Error>(Some(patch))
            }
        })
        .unwrap();
    stack
        .replace_field_writing("books", "year", |value: Value, _context: WriteContext| async move {
            let published = value.as_i64().map(|y| format!("{y}-01-01"));
            Ok::<_, Error>(Some(record! { "year" => value, "published" => published }))
        })
        .unwrap();

    let books = stack.collection("books").unwrap();
    let created = books
        .create(vec![record! { "title" => "Dune (1965)", "author_id" => 12 }])
        .await
        .unwrap();
    assert_eq!(created[0]["id"], Value::Int(7));

    let stored = lib.ds.rows("books").pop().unwrap();
    assert_eq!(stored["title"], Value::from("Dune"));
    assert_eq!(stored["year"], Value::Int(1965));
    assert_eq!(stored["published"], Value::from("1965-01-01"));

    books
        .update(&book_id(7), record! { "title" => "Dune Messiah (1969)" })
        .await
        .unwrap();
    let stored = lib.ds.rows("books").pop().unwrap();
    assert_eq!(stored["published"], Value::from("1969-01-01"));
    assert_eq!(*actions.lock().unwrap(), vec![WriteAction::Create, WriteAction::Update]);
}

#[tokio::test]
async fn handlers_writing_back_into_each_other_are_a_cycle() {
    let lib = library();
    let stack = DecoratorStack::new(lib.ds.clone(), VeneerConfig::default());
    stack
        .replace_field_writing("books", "title", |value: Value, _: WriteContext| async move {
            Ok::<_, Error>(Some(record! { "year" => value }))
        })
        .unwrap();
    stack
        .replace_field_writing("books", "year", |value: Value, _: WriteContext| async move {
            Ok::<_, Error>(Some(record! { "title" => value }))
        })
        .unwrap();

    let err = stack
        .collection("books")
        .unwrap()
        .create(vec![record! { "title" => "x" }])
        .await
        .unwrap_err();
    match err {
        Error::CyclicDependency(chain) => {
            assert_eq!(chain, "books.title -> books.year -> books.title")
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(lib.ds.rows("books").len(), 6);
}

#[tokio::test]
async fn two_values_for_one_field_conflict() {
    let lib = library();
    let stack = DecoratorStack::new(lib.ds.clone(), VeneerConfig::default());
    stack
        .replace_field_writing("books", "title", |_: Value, _: WriteContext| async {
            Ok::<_, Error>(Some(record! { "year" => 2000 }))
        })
        .unwrap();

    let err = stack
        .collection("books")
        .unwrap()
        .create(vec![record! { "title" => "x", "year" => 1999 }])
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ConflictingWrite { field } if field == "year"));
}

#[tokio::test]
async fn handlers_returning_nothing_drop_the_field() {
    let lib = library();
    let stack = DecoratorStack::new(lib.ds.clone(), VeneerConfig::default());
    stack
        .replace_field_writing("books", "title", |_: Value, _: WriteContext| async {
            Ok::<Option<Record>, Error>(None)
        })
        .unwrap();

    stack
        .collection("books")
        .unwrap()
        .update(&book_id(1), record! { "title" => "ignored", "year" => 1975 })
        .await
        .unwrap();
    let rows = lib.ds.rows("books");
    let stored = &rows[0];
    assert_eq!(stored["title"], Value::from("The Dispossessed"));
    assert_eq!(stored["year"], Value::Int(1975));
}

#[tokio::test]
async fn creating_with_a_parent_record_creates_the_parent_first() {
    let lib = library();
    let stack = DecoratorStack::new(lib.ds.clone(), VeneerConfig::default());
    with_author(&stack);

    let created = stack
        .collection("books")
        .unwrap()
        .create(vec![record! {
            "title" => "The Left Hand of Darkness",
            "year" => 1969,
            "author" => record! { "first_name" => "U.K.", "last_name" => "Le Guin" },
        }])
        .await
        .unwrap();
    assert_eq!(created[0]["author_id"], Value::Int(13));

    let authors = lib.ds.rows("authors");
    assert_eq!(authors.len(), 4);
    assert_eq!(authors[3]["first_name"], Value::from("U.K."));
    let stored = lib.ds.rows("books").pop().unwrap();
    assert_eq!(stored["author_id"], Value::Int(13));
    assert!(!stored.contains_key("author"));
}

#[tokio::test]
async fn native_failures_on_the_parent_abort_the_create() {
    let lib = library();
    let stack = DecoratorStack::new(lib.ds.clone(), VeneerConfig::default());
    with_author(&stack);

    let err = stack
        .collection("books")
        .unwrap()
        .create(vec![record! {
            "title" => "Always Coming Home",
            "author" => record! { "id" => 10, "last_name" => "Le Guin" },
        }])
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Native(m) if m.contains("authors")));
    assert_eq!(lib.ds.rows("authors").len(), 3);
    assert_eq!(lib.ds.rows("books").len(), 6);
}

#[tokio::test]
async fn updating_through_a_relation_patches_or_creates_the_parent() {
    let lib = library();
    let stack = DecoratorStack::new(lib.ds.clone(), VeneerConfig::default());
    with_author(&stack);
    let books = stack.collection("books").unwrap();

    books
        .update(&book_id(1), record! { "author" => record! { "last_name" => "LeGuin" } })
        .await
        .unwrap();
    assert_eq!(lib.ds.rows("authors")[0]["last_name"], Value::from("LeGuin"));
    assert_eq!(lib.ds.rows("authors").len(), 3);

    // Book 6 has no author yet.
    books
        .update(
            &book_id(6),
            record! { "author" => record! { "first_name" => "Anne", "last_name" => "Onymous" } },
        )
        .await
        .unwrap();
    assert_eq!(lib.ds.rows("authors").len(), 4);
    assert_eq!(lib.ds.rows("books")[5]["author_id"], Value::Int(13));
}

#[tokio::test]
async fn writing_to_many_relations_is_rejected() {
    let lib = library();
    let stack = DecoratorStack::new(lib.ds.clone(), VeneerConfig::default());
    stack
        .add_relation(
            "books",
            "reviews",
            RelationDefinition::OneToMany {
                foreign_collection: "reviews".into(),
                origin_key: "book_id".into(),
                origin_key_target: None,
            },
        )
        .unwrap();

    let err = stack
        .collection("books")
        .unwrap()
        .create(vec![record! {
            "title" => "x",
            "reviews" => vec![Value::Record(record! { "rating" => 1 })],
        }])
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Validation(m) if m.contains("to-many")));
    assert_eq!(lib.ds.rows("books").len(), 6);
}

#[tokio::test]
async fn computed_fields_become_writable_with_a_handler() {
    let lib = library();
    let stack = DecoratorStack::new(lib.ds.clone(), VeneerConfig::default());
    stack
        .add_field(
            "authors",
            "full_name",
            ComputedDefinition::from_fn(ColumnType::String, ["first_name", "last_name"], |r| {
                let first = r.get("first_name").and_then(Value::as_str).unwrap_or_default();
                let last = r.get("last_name").and_then(Value::as_str).unwrap_or_default();
                Value::from(format!("{first} {last}"))
            }),
        )
        .unwrap();
    let authors = stack.collection("authors").unwrap();
    assert!(authors.schema().column("full_name").unwrap().is_read_only);

    stack
        .replace_field_writing("authors", "full_name", |value: Value, _: WriteContext| async move {
            let full = value.as_str().unwrap_or_default().to_string();
            let (first, last) = full.split_once(' ').unwrap_or((full.as_str(), ""));
            Ok::<_, Error>(Some(record! { "first_name" => first, "last_name" => last }))
        })
        .unwrap();
    assert!(!authors.schema().column("full_name").unwrap().is_read_only);

    authors
        .create(vec![record! { "full_name" => "Octavia Butler" }])
        .await
        .unwrap();
    let stored = lib.ds.rows("authors").pop().unwrap();
    assert_eq!(stored["first_name"], Value::from("Octavia"));
    assert_eq!(stored["last_name"], Value::from("Butler"));

    assert!(matches!(
        stack.replace_field_writing("authors", "nope", |_: Value, _: WriteContext| async {
            Ok::<Option<Record>, Error>(None)
        }),
        Err(Error::Validation(_))
    ));
}
