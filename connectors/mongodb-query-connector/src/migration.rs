//! The migration driver contract.
//!
//! Migrations are a collaborator, not part of the query core; this module
//! only pins down the interface the core's callers program against. Column
//! operations are free to be no-ops on a schemaless store. The migration
//! collaborator owns the tracking collection (unique on `name`); the core
//! itself persists nothing.

use crate::error::Result;
use async_trait::async_trait;
use bson::Document;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IndexKind {
    Normal,
    FullText,
    Geo,
    Vector,
}

/// One index to create. `fields` pairs each field with its direction
/// (`1`/`-1`); direction is ignored for non-normal kinds.
#[derive(Clone, Debug)]
pub struct IndexSpec {
    pub name: Option<String>,
    pub fields: Vec<(String, i32)>,
    pub kind: IndexKind,
    pub unique: bool,
    /// Partial index predicate, when the backend supports one.
    pub partial_filter: Option<Document>,
    /// Expire documents this many seconds after the indexed timestamp.
    pub ttl_seconds: Option<u64>,
}

#[async_trait]
pub trait MigrationDriver: Send + Sync {
    async fn create_table(&self, table: &str) -> Result<()>;
    async fn drop_table(&self, table: &str) -> Result<()>;
    async fn rename_table(&self, table: &str, new_name: &str) -> Result<()>;

    /// Column operations may be no-ops on schemaless stores.
    async fn add_column(&self, table: &str, column: &str) -> Result<()>;
    async fn drop_column(&self, table: &str, column: &str) -> Result<()>;
    async fn rename_column(&self, table: &str, column: &str, new_name: &str) -> Result<()>;
    async fn modify_column(&self, table: &str, column: &str) -> Result<()>;

    async fn create_index(&self, table: &str, spec: IndexSpec) -> Result<()>;
    async fn drop_index(&self, table: &str, name: &str) -> Result<()>;

    async fn set_schema_validation(&self, table: &str, validator: Document) -> Result<()>;
    async fn remove_schema_validation(&self, table: &str) -> Result<()>;

    /// Escape hatch: run a raw command against the underlying database.
    async fn raw(&self, command: Document) -> Result<Document>;
}
