//! End-to-end compilation scenarios: builder in, pipeline out.

use bson::doc;
use indexmap::IndexMap;
use mongodb_query_connector::compile;
use pretty_assertions::assert_eq;
use query_builder::{Aggregate, GroupSpec, QueryBuilder};
use serde_json::json;

fn pipeline(build: impl FnOnce(&mut QueryBuilder)) -> Vec<bson::Document> {
    let mut qb = QueryBuilder::new("t");
    build(&mut qb);
    compile(&mut qb).unwrap().into_documents()
}

#[test]
fn and_clauses_fold_into_one_match() {
    let stages = pipeline(|qb| {
        qb.where_eq("a", 1).where_op("b", ">", 2);
    });

    assert_eq!(stages, vec![doc! { "$match": { "a": 1, "b": { "$gt": 2 } } }]);
}

#[test]
fn the_or_latch_captures_trailing_clauses() {
    let stages = pipeline(|qb| {
        qb.where_eq("a", 1).or_where_eq("b", 2).where_eq("c", 3);
    });

    assert_eq!(
        stages,
        vec![doc! { "$match": { "$or": [{ "a": 1 }, { "b": 2 }, { "c": 3 }] } }]
    );
}

#[test]
fn nested_callbacks_merge_as_single_nodes() {
    let stages = pipeline(|qb| {
        qb.where_eq("status", "active").where_callback(|sub| {
            sub.where_eq("x", 1).or_where_eq("y", 2);
        });
    });

    assert_eq!(
        stages,
        vec![doc! { "$match": { "status": "active", "$or": [{ "x": 1 }, { "y": 2 }] } }]
    );
}

#[test]
fn grouping_renames_the_synthetic_identifier() {
    let stages = pipeline(|qb| {
        let mut aggregates = IndexMap::new();
        aggregates.insert("total".to_owned(), Aggregate::Sum("duration".to_owned()));
        qb.group_by_with(GroupSpec::Field("type".to_owned()), aggregates);
    });

    assert_eq!(
        stages,
        vec![
            doc! { "$group": { "_id": "$type", "total": { "$sum": "$duration" } } },
            doc! { "$project": { "type": "$_id", "total": 1, "_id": 0 } },
        ]
    );
}

#[test]
fn where_eq_and_where_map_compile_identically() {
    let via_eq = pipeline(|qb| {
        qb.where_eq("name", "ada");
    });
    let via_map = pipeline(|qb| {
        let mut map = IndexMap::new();
        map.insert("name".to_owned(), json!("ada"));
        qb.where_map(map);
    });

    assert_eq!(via_eq, via_map);
}

#[test]
fn cloned_builders_compile_independently() {
    let mut original = QueryBuilder::new("t");
    original.where_eq("a", 1);

    let mut clone = original.clone();
    clone.where_eq("b", 2);

    assert_eq!(
        compile(&mut original).unwrap().into_documents(),
        vec![doc! { "$match": { "a": 1 } }]
    );
    assert_eq!(
        compile(&mut clone).unwrap().into_documents(),
        vec![doc! { "$match": { "a": 1, "b": 2 } }]
    );
}

#[test]
fn a_full_query_assembles_in_operation_order() {
    let stages = pipeline(|qb| {
        qb.where_eq("published", true)
            .inner_join("users", "author_id", "_id", "author")
            .select(["title", "author"])
            .order_by_desc("created_at")
            .skip(20)
            .limit(10);
    });

    assert_eq!(
        stages,
        vec![
            doc! { "$match": { "published": true } },
            doc! { "$lookup": {
                "from": "users",
                "localField": "author_id",
                "foreignField": "_id",
                "as": "author",
            } },
            doc! { "$match": { "author": { "$ne": [] } } },
            doc! { "$project": { "title": 1, "author": 1 } },
            doc! { "$sort": { "created_at": -1 } },
            doc! { "$skip": 20 },
            doc! { "$limit": 10 },
        ]
    );
}

#[test]
fn distinct_lowers_to_a_group_and_rename() {
    let stages = pipeline(|qb| {
        qb.distinct("status");
    });

    assert_eq!(
        stages,
        vec![
            doc! { "$group": { "_id": "$status" } },
            doc! { "$project": { "status": "$_id", "_id": 0 } },
        ]
    );
}

#[test]
fn repeated_limits_shadow_earlier_values() {
    let stages = pipeline(|qb| {
        qb.where_eq("a", 1).limit(5).limit(50);
    });

    assert_eq!(
        stages,
        vec![doc! { "$match": { "a": 1 } }, doc! { "$limit": 50 }]
    );
}
