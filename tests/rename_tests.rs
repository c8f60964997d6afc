//! Renamed fields on every operation.


use test_data_gen::{ids, library, Library};
use veneer_core::aggregation::Aggregation;
use veneer_core::condition_tree::ConditionTree;
use veneer_core::config::VeneerConfig;
use veneer_core::filter::{Filter, PaginatedFilter};
use veneer_core::operator::Operator;
use veneer_core::projection::Projection;
use veneer_core::record;
use veneer_core::schema::FieldSchema;
use veneer_core::sort::{Sort, SortClause};
use veneer_core::types::Value;
use veneer_decorators::{DecoratorStack, Error, RelationDefinition};

fn renamed_library() -> (Library, DecoratorStack) {
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
    stack.rename_field("books", "title", "heading").unwrap();
    stack.rename_field("books", "author_id", "writer_id").unwrap();
    stack.rename_field("authors", "last_name", "surname").unwrap();
    (lib, stack)
}

fn equal(field: &str, value: impl Into<Value>) -> Option<ConditionTree> {
    Some(ConditionTree::leaf(field, Operator::Equal, value))
}

#[tokio::test]
async fn listing_uses_public_names_across_relations() {
    let (_lib, stack) = renamed_library();
    let books = stack.collection("books").unwrap();

    let filter = PaginatedFilter::new().with_condition_tree(equal("heading", "Excession"));
    let rows = books
        .list(&filter, &Projection::from(["id", "heading", "author:surname"]))
        .await
        .unwrap();
    assert_eq!(
        rows,
        vec![record! {
            "id" => 2,
            "heading" => "Excession",
            "author" => record! { "surname" => "Banks" },
        }]
    );

    let filter = PaginatedFilter::new()
        .with_condition_tree(equal("author:surname", "Banks"))
        .with_sort(Some(Sort::new([SortClause::desc("writer_id"), SortClause::desc("id")])));
    let rows = books.list(&filter, &Projection::from(["id", "writer_id"])).await.unwrap();
    assert_eq!(ids(&rows), vec![5, 2]);
    assert_eq!(rows[0]["writer_id"], Value::Int(11));
    assert!(!rows[0].contains_key("author_id"));
}

#[tokio::test]
async fn aggregation_groups_come_back_under_public_names() {
    let (_lib, stack) = renamed_library();
    let results = stack
        .collection("books")
        .unwrap()
        .aggregate(
            &Filter::new(),
            &Aggregation::count().with_group("writer_id", None),
            Some(1),
        )
        .await
        .unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].value, Value::Int(2));
    assert!(results[0].group.contains_key("writer_id"));
}

#[tokio::test]
async fn writes_are_translated_to_child_names() {
    let (lib, stack) = renamed_library();
    let books = stack.collection("books").unwrap();

    let created = books
        .create(vec![record! { "heading" => "Surface Detail", "writer_id" => 11 }])
        .await
        .unwrap();
    assert_eq!(created[0]["heading"], Value::from("Surface Detail"));
    assert_eq!(created[0]["writer_id"], Value::Int(11));
    let stored = lib.ds.rows("books").pop().unwrap();
    assert_eq!(stored["title"], Value::from("Surface Detail"));
    assert_eq!(stored["author_id"], Value::Int(11));

    books
        .update(
            &Filter::new().with_condition_tree(equal("heading", "Excession")),
            record! { "author" => record! { "surname" => "M. Banks" } },
        )
        .await
        .unwrap();
    assert_eq!(lib.ds.rows("authors")[1]["last_name"], Value::from("M. Banks"));
}

#[test]
fn relation_keys_follow_renames_on_both_sides() {
    let (_lib, stack) = renamed_library();
    stack.rename_field("authors", "id", "key").unwrap();

    let schema = stack.collection("books").unwrap().schema();
    assert!(schema.field("title").is_none());
    match schema.field("author") {
        Some(FieldSchema::ManyToOne(r)) => {
            assert_eq!(r.foreign_key, "writer_id");
            assert_eq!(r.foreign_key_target, "key");
        }
        other => panic!("unexpected field: {other:?}"),
    }
}

#[tokio::test]
async fn renaming_back_cancels_the_rename() {
    let (_lib, stack) = renamed_library();
    stack.rename_field("books", "heading", "title").unwrap();

    let books = stack.collection("books").unwrap();
    assert!(books.schema().field("heading").is_none());
    let rows = books
        .list(
            &PaginatedFilter::new().with_condition_tree(equal("id", 1)),
            &Projection::from(["title"]),
        )
        .await
        .unwrap();
    assert_eq!(rows, vec![record! { "title" => "The Dispossessed" }]);
}

#[test]
fn invalid_renames_are_rejected() {
    let (_lib, stack) = renamed_library();

    assert!(matches!(
        stack.rename_field("books", "nope", "other"),
        Err(Error::Validation(_))
    ));
    assert!(matches!(
        stack.rename_field("books", "heading", "a:b"),
        Err(Error::Validation(_))
    ));
    assert!(matches!(
        stack.rename_field("books", "heading", "year"),
        Err(Error::Validation(m)) if m.contains("already exists")
    ));
    // A rename to the same name changes nothing.
    stack.rename_field("books", "heading", "heading").unwrap();
    assert!(matches!(
        stack.rename_field("books", "title", "other"),
        Err(Error::Validation(_))
    ));
}
