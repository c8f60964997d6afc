use std::sync::Arc;

use criterion::{criterion_group, criterion_main, Criterion};
use veneer_core::aggregation::{AggregateOperation, Aggregation, DateOperation};
use veneer_core::config::VeneerConfig;
use veneer_core::filter::PaginatedFilter;
use veneer_core::projection::Projection;
use veneer_core::record;
use veneer_core::schema::{CollectionSchema, ColumnSchema, ColumnType};
use veneer_core::sort::{Sort, SortClause};
use veneer_core::types::Record;
use veneer_decorators::{Collection, DecoratorStack, MemoryDataSource, RelationDefinition};

fn make_books(rows: usize) -> Vec<Record> {
    (0..rows)
        .map(|i| {
            record! {
                "id" => i,
                "title" => format!("book-{i}"),
                "author_id" => i % 50,
                "price" => (i % 17) as f64 * 1.5,
                "published" => format!("20{:02}-{:02}-01", i % 24, i % 12 + 1),
                "author" => record! { "id" => i % 50, "name" => format!("author-{}", i % 50) },
            }
        })
        .collect()
}

fn bench_projection(c: &mut Criterion) {
    let books = make_books(1024);
    let projection = Projection::from(["id", "title", "author:name"]);
    c.bench_function("projection_apply_all", |b| {
        b.iter(|| projection.apply_all(&books))
    });
}

fn bench_sort(c: &mut Criterion) {
    let books = make_books(1024);
    let sort = Sort::new([SortClause::desc("author:name"), SortClause::asc("id")]);
    c.bench_function("sort_apply", |b| {
        b.iter(|| {
            let mut rows = books.clone();
            sort.apply(&mut rows);
            rows
        })
    });
}

fn bench_aggregation(c: &mut Criterion) {
    let books = make_books(1024);
    let aggregation = Aggregation::new(AggregateOperation::Sum, Some("price"))
        .with_group("published", Some(DateOperation::Month));
    c.bench_function("aggregation_apply", |b| {
        b.iter(|| aggregation.apply(&books, "+02:00", None).unwrap())
    });
}

fn bench_emulated_relation(c: &mut Criterion) {
    let ds = Arc::new(MemoryDataSource::new());
    let pk = ColumnSchema::new(ColumnType::Number).primary_key();
    ds.add_collection(
        "authors",
        CollectionSchema::new()
            .with_field("id", pk.clone())
            .with_field("name", ColumnSchema::new(ColumnType::String)),
        (0..50)
            .map(|i| record! { "id" => i, "name" => format!("author-{i}") })
            .collect(),
    )
    .unwrap();
    ds.add_collection(
        "books",
        CollectionSchema::new()
            .with_field("id", pk)
            .with_field("title", ColumnSchema::new(ColumnType::String))
            .with_field("author_id", ColumnSchema::new(ColumnType::Number)),
        (0..1024)
            .map(|i| record! { "id" => i, "title" => format!("book-{i}"), "author_id" => i % 50 })
            .collect(),
    )
    .unwrap();

    let stack = DecoratorStack::new(ds, VeneerConfig::default());
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
    let books = stack.collection("books").unwrap();
    let projection = Projection::from(["id", "title", "author:name"]);
    let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();

    c.bench_function("emulated_many_to_one_list", |b| {
        b.iter(|| {
            let rows = runtime
                .block_on(books.list(&PaginatedFilter::new(), &projection))
                .unwrap();
            assert_eq!(rows[0]["author"].as_record().map(|r| r.len()), Some(1));
            rows.len()
        })
    });
}

criterion_group!(
    benches,
    bench_projection,
    bench_sort,
    bench_aggregation,
    bench_emulated_relation
);
criterion_main!(benches);
