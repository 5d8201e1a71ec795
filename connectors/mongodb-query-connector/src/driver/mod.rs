//! The driver surface the core consumes.
//!
//! [`Driver`] is the object-safe write/read interface over one backend
//! database. Every implementation must honor the ambient transaction
//! context: when the caller did not supply a session in the options and the
//! context carries one, the call attaches it.

mod mongodb_driver;
mod recording;
mod transaction;

pub use mongodb_driver::MongoDbDriver;
pub use recording::{RecordedCall, RecordingDriver};
pub use transaction::Transaction;

use crate::context;
use crate::error::Result;
use crate::plan::Pipeline;
use async_trait::async_trait;
use bson::Document;
use mongodb::ClientSession;
use query_builder::QueryBuilder;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard};

/// A shared handle to one backend session.
///
/// Driver sessions are `&mut`-threaded through every call, so the handle
/// wraps the session in an async mutex. A *detached* handle carries no
/// backend session; it participates in context propagation (and tests)
/// without a live server.
#[derive(Clone)]
pub struct SessionHandle {
    inner: Arc<Mutex<Option<ClientSession>>>,
}

impl SessionHandle {
    pub fn new(session: ClientSession) -> Self {
        SessionHandle {
            inner: Arc::new(Mutex::new(Some(session))),
        }
    }

    pub fn detached() -> Self {
        SessionHandle {
            inner: Arc::new(Mutex::new(None)),
        }
    }

    pub(crate) async fn lock(&self) -> MutexGuard<'_, Option<ClientSession>> {
        self.inner.lock().await
    }

    /// Identity comparison: two handles are the same session, not equal
    /// sessions.
    pub fn is_same(&self, other: &SessionHandle) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionHandle")
            .field("ptr", &Arc::as_ptr(&self.inner))
            .finish()
    }
}

/// Per-call options. An explicit session overrides the ambient one.
#[derive(Clone, Debug, Default)]
pub struct OperationOptions {
    pub session: Option<SessionHandle>,
    pub array_filters: Option<Vec<Document>>,
}

impl OperationOptions {
    pub fn with_session(session: SessionHandle) -> Self {
        OperationOptions {
            session: Some(session),
            ..Default::default()
        }
    }

    pub fn with_array_filters(filters: Vec<Document>) -> Self {
        OperationOptions {
            array_filters: Some(filters),
            ..Default::default()
        }
    }

    /// The session this call runs under: the explicit override when given,
    /// otherwise whatever the ambient context carries.
    pub fn resolve_session(&self) -> Option<SessionHandle> {
        self.session.clone().or_else(context::session)
    }
}

#[async_trait]
pub trait Driver: Send + Sync {
    /// Insert one document; the returned document carries the stamped
    /// identifier.
    async fn insert(
        &self,
        table: &str,
        document: Document,
        options: OperationOptions,
    ) -> Result<Document>;

    async fn insert_many(
        &self,
        table: &str,
        documents: Vec<Document>,
        options: OperationOptions,
    ) -> Result<Vec<Document>>;

    /// Update the first matching document; returns the modified count.
    async fn update(
        &self,
        table: &str,
        filter: Document,
        update: Document,
        options: OperationOptions,
    ) -> Result<u64>;

    async fn update_many(
        &self,
        table: &str,
        filter: Document,
        update: Document,
        options: OperationOptions,
    ) -> Result<u64>;

    async fn replace(
        &self,
        table: &str,
        filter: Document,
        document: Document,
        options: OperationOptions,
    ) -> Result<Option<Document>>;

    async fn find_one_and_update(
        &self,
        table: &str,
        filter: Document,
        update: Document,
        options: OperationOptions,
    ) -> Result<Option<Document>>;

    async fn find_one_and_delete(
        &self,
        table: &str,
        filter: Document,
        options: OperationOptions,
    ) -> Result<Option<Document>>;

    async fn upsert(
        &self,
        table: &str,
        filter: Document,
        document: Document,
        options: OperationOptions,
    ) -> Result<Document>;

    async fn delete(
        &self,
        table: &str,
        filter: Document,
        options: OperationOptions,
    ) -> Result<u64>;

    async fn delete_many(
        &self,
        table: &str,
        filter: Document,
        options: OperationOptions,
    ) -> Result<u64>;

    async fn truncate_table(&self, table: &str, options: OperationOptions) -> Result<u64>;

    async fn aggregate(
        &self,
        table: &str,
        pipeline: Pipeline,
        options: OperationOptions,
    ) -> Result<Vec<Document>>;

    /// Start a backend transaction, enter the ambient context with its
    /// session, and return the finalization handle.
    async fn begin_transaction(&self) -> Result<Transaction>;

    /// Builder factory for this driver's backend.
    fn query_builder(&self, table: &str) -> QueryBuilder {
        QueryBuilder::new(table)
    }
}
