//! Running a builder against a driver.

use crate::compiler::compile;
use crate::driver::{Driver, OperationOptions};
use crate::error::Result;
use crate::plan::PlanStage;
use bson::{Bson, Document};
use query_builder::QueryBuilder;

/// Compile and run the builder, returning all matching documents.
pub async fn find(driver: &dyn Driver, builder: &mut QueryBuilder) -> Result<Vec<Document>> {
    let plan = compile(builder)?;
    driver
        .aggregate(builder.table(), plan, OperationOptions::default())
        .await
}

/// Like [`find`], limited to one document.
pub async fn find_one(
    driver: &dyn Driver,
    builder: &mut QueryBuilder,
) -> Result<Option<Document>> {
    builder.limit(1);
    Ok(find(driver, builder).await?.into_iter().next())
}

/// Count the documents the builder matches, server-side.
pub async fn count(driver: &dyn Driver, builder: &mut QueryBuilder) -> Result<u64> {
    let mut plan = compile(builder)?;
    plan.push(PlanStage::new("$count", "count"));

    let results = driver
        .aggregate(builder.table(), plan, OperationOptions::default())
        .await?;

    Ok(match results.first().and_then(|doc| doc.get("count")) {
        Some(Bson::Int32(n)) => *n as u64,
        Some(Bson::Int64(n)) => *n as u64,
        _ => 0,
    })
}

/// Whether the builder matches anything at all.
pub async fn exists(driver: &dyn Driver, builder: &mut QueryBuilder) -> Result<bool> {
    Ok(find_one(driver, builder).await?.is_some())
}
