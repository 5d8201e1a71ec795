//! An in-memory driver that records every call it receives.
//!
//! Used by the test-suite and by embedders that want to inspect the exact
//! backend traffic a flow would produce. Write results are canned: each
//! update/delete reports one affected document unless configured otherwise.

use crate::driver::{Driver, OperationOptions, SessionHandle, Transaction};
use crate::error::Result;
use crate::plan::Pipeline;
use async_trait::async_trait;
use bson::{oid::ObjectId, Bson, Document};
use std::sync::Mutex;

#[derive(Clone, Debug)]
pub struct RecordedCall {
    pub method: &'static str,
    pub table: String,
    pub filter: Option<Document>,
    pub update: Option<Document>,
    pub array_filters: Option<Vec<Document>>,
    /// Whether a session resolved for the call, explicit or ambient.
    pub session_attached: bool,
}

#[derive(Default)]
pub struct RecordingDriver {
    calls: Mutex<Vec<RecordedCall>>,
    modified_count: Option<u64>,
}

impl RecordingDriver {
    pub fn new() -> Self {
        RecordingDriver::default()
    }

    /// Report this modified count from every write instead of the default 1.
    pub fn with_modified_count(count: u64) -> Self {
        RecordingDriver {
            calls: Mutex::new(Vec::new()),
            modified_count: Some(count),
        }
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().expect("recording driver poisoned").clone()
    }

    fn record(
        &self,
        method: &'static str,
        table: &str,
        filter: Option<Document>,
        update: Option<Document>,
        options: &OperationOptions,
    ) {
        let call = RecordedCall {
            method,
            table: table.to_owned(),
            filter,
            update,
            array_filters: options.array_filters.clone(),
            session_attached: options.resolve_session().is_some(),
        };
        self.calls.lock().expect("recording driver poisoned").push(call);
    }

    fn count(&self) -> u64 {
        self.modified_count.unwrap_or(1)
    }
}

#[async_trait]
impl Driver for RecordingDriver {
    async fn insert(
        &self,
        table: &str,
        document: Document,
        options: OperationOptions,
    ) -> Result<Document> {
        self.record("insert", table, None, Some(document.clone()), &options);

        let mut stamped = document;
        if !stamped.contains_key("_id") {
            stamped.insert("_id", Bson::ObjectId(ObjectId::new()));
        }
        Ok(stamped)
    }

    async fn insert_many(
        &self,
        table: &str,
        documents: Vec<Document>,
        options: OperationOptions,
    ) -> Result<Vec<Document>> {
        let mut stamped = Vec::with_capacity(documents.len());
        for document in documents {
            stamped.push(self.insert(table, document, options.clone()).await?);
        }
        Ok(stamped)
    }

    async fn update(
        &self,
        table: &str,
        filter: Document,
        update: Document,
        options: OperationOptions,
    ) -> Result<u64> {
        self.record("update", table, Some(filter), Some(update), &options);
        Ok(self.count())
    }

    async fn update_many(
        &self,
        table: &str,
        filter: Document,
        update: Document,
        options: OperationOptions,
    ) -> Result<u64> {
        self.record("update_many", table, Some(filter), Some(update), &options);
        Ok(self.count())
    }

    async fn replace(
        &self,
        table: &str,
        filter: Document,
        document: Document,
        options: OperationOptions,
    ) -> Result<Option<Document>> {
        self.record("replace", table, Some(filter), Some(document.clone()), &options);
        Ok(Some(document))
    }

    async fn find_one_and_update(
        &self,
        table: &str,
        filter: Document,
        update: Document,
        options: OperationOptions,
    ) -> Result<Option<Document>> {
        self.record(
            "find_one_and_update",
            table,
            Some(filter),
            Some(update),
            &options,
        );
        Ok(None)
    }

    async fn find_one_and_delete(
        &self,
        table: &str,
        filter: Document,
        options: OperationOptions,
    ) -> Result<Option<Document>> {
        self.record("find_one_and_delete", table, Some(filter), None, &options);
        Ok(None)
    }

    async fn upsert(
        &self,
        table: &str,
        filter: Document,
        document: Document,
        options: OperationOptions,
    ) -> Result<Document> {
        self.record("upsert", table, Some(filter), Some(document.clone()), &options);
        Ok(document)
    }

    async fn delete(
        &self,
        table: &str,
        filter: Document,
        options: OperationOptions,
    ) -> Result<u64> {
        self.record("delete", table, Some(filter), None, &options);
        Ok(self.count())
    }

    async fn delete_many(
        &self,
        table: &str,
        filter: Document,
        options: OperationOptions,
    ) -> Result<u64> {
        self.record("delete_many", table, Some(filter), None, &options);
        Ok(self.count())
    }

    async fn truncate_table(&self, table: &str, options: OperationOptions) -> Result<u64> {
        self.record("truncate_table", table, None, None, &options);
        Ok(self.count())
    }

    async fn aggregate(
        &self,
        table: &str,
        pipeline: Pipeline,
        options: OperationOptions,
    ) -> Result<Vec<Document>> {
        let as_filter = pipeline
            .stages()
            .first()
            .map(|stage| stage.clone().into_document());
        self.record("aggregate", table, as_filter, None, &options);
        Ok(Vec::new())
    }

    async fn begin_transaction(&self) -> Result<Transaction> {
        Ok(Transaction::start(SessionHandle::detached()))
    }
}
