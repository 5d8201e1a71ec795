//! The MongoDB driver.

use crate::driver::{Driver, OperationOptions, SessionHandle, Transaction};
use crate::error::{Error, Result};
use crate::plan::Pipeline;
use async_trait::async_trait;
use bson::{doc, Document};
use futures::TryStreamExt;
use mongodb::options::{
    FindOneAndReplaceOptions, FindOneAndUpdateOptions, ReturnDocument, UpdateOptions,
};
use mongodb::{Client, Collection, Database};
use tracing_futures::Instrument as _;

/// Driver over one MongoDB database. All calls honor the ambient session
/// unless the options carry an explicit one.
#[derive(Clone)]
pub struct MongoDbDriver {
    client: Client,
    database: Database,
}

impl MongoDbDriver {
    pub fn new(client: Client, database_name: &str) -> Self {
        let database = client.database(database_name);
        MongoDbDriver { client, database }
    }

    pub fn database(&self) -> &Database {
        &self.database
    }

    fn collection(&self, table: &str) -> Collection<Document> {
        self.database.collection(table)
    }

    fn update_options(options: &OperationOptions) -> UpdateOptions {
        UpdateOptions::builder()
            .array_filters(options.array_filters.clone())
            .build()
    }
}

#[async_trait]
impl Driver for MongoDbDriver {
    async fn insert(
        &self,
        table: &str,
        document: Document,
        options: OperationOptions,
    ) -> Result<Document> {
        let collection = self.collection(table);

        let inserted_id = match options.resolve_session() {
            Some(handle) => {
                let mut guard = handle.lock().await;
                match guard.as_mut() {
                    Some(session) => {
                        collection
                            .insert_one_with_session(document.clone(), None, session)
                            .await?
                            .inserted_id
                    }
                    None => collection.insert_one(document.clone(), None).await?.inserted_id,
                }
            }
            None => collection.insert_one(document.clone(), None).await?.inserted_id,
        };

        let mut stamped = document;
        stamped.insert("_id", inserted_id);
        Ok(stamped)
    }

    async fn insert_many(
        &self,
        table: &str,
        documents: Vec<Document>,
        options: OperationOptions,
    ) -> Result<Vec<Document>> {
        if documents.is_empty() {
            return Ok(Vec::new());
        }

        let collection = self.collection(table);

        let inserted_ids = match options.resolve_session() {
            Some(handle) => {
                let mut guard = handle.lock().await;
                match guard.as_mut() {
                    Some(session) => {
                        collection
                            .insert_many_with_session(documents.clone(), None, session)
                            .await?
                            .inserted_ids
                    }
                    None => {
                        collection
                            .insert_many(documents.clone(), None)
                            .await?
                            .inserted_ids
                    }
                }
            }
            None => {
                collection
                    .insert_many(documents.clone(), None)
                    .await?
                    .inserted_ids
            }
        };

        let mut stamped = documents;
        for (index, id) in inserted_ids {
            if let Some(document) = stamped.get_mut(index) {
                document.insert("_id", id);
            }
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
        let collection = self.collection(table);
        let update_options = Self::update_options(&options);

        let result = match options.resolve_session() {
            Some(handle) => {
                let mut guard = handle.lock().await;
                match guard.as_mut() {
                    Some(session) => {
                        collection
                            .update_one_with_session(filter, update, update_options, session)
                            .await?
                    }
                    None => collection.update_one(filter, update, update_options).await?,
                }
            }
            None => collection.update_one(filter, update, update_options).await?,
        };

        Ok(result.modified_count)
    }

    async fn update_many(
        &self,
        table: &str,
        filter: Document,
        update: Document,
        options: OperationOptions,
    ) -> Result<u64> {
        let collection = self.collection(table);
        let update_options = Self::update_options(&options);

        let result = match options.resolve_session() {
            Some(handle) => {
                let mut guard = handle.lock().await;
                match guard.as_mut() {
                    Some(session) => {
                        collection
                            .update_many_with_session(filter, update, update_options, session)
                            .await?
                    }
                    None => {
                        collection
                            .update_many(filter, update, update_options)
                            .await?
                    }
                }
            }
            None => {
                collection
                    .update_many(filter, update, update_options)
                    .await?
            }
        };

        Ok(result.modified_count)
    }

    async fn replace(
        &self,
        table: &str,
        filter: Document,
        document: Document,
        options: OperationOptions,
    ) -> Result<Option<Document>> {
        let collection = self.collection(table);
        let replace_options = FindOneAndReplaceOptions::builder()
            .return_document(ReturnDocument::After)
            .build();

        let replaced = match options.resolve_session() {
            Some(handle) => {
                let mut guard = handle.lock().await;
                match guard.as_mut() {
                    Some(session) => {
                        collection
                            .find_one_and_replace_with_session(
                                filter,
                                document,
                                replace_options,
                                session,
                            )
                            .await?
                    }
                    None => {
                        collection
                            .find_one_and_replace(filter, document, replace_options)
                            .await?
                    }
                }
            }
            None => {
                collection
                    .find_one_and_replace(filter, document, replace_options)
                    .await?
            }
        };

        Ok(replaced)
    }

    async fn find_one_and_update(
        &self,
        table: &str,
        filter: Document,
        update: Document,
        options: OperationOptions,
    ) -> Result<Option<Document>> {
        let collection = self.collection(table);
        let update_options = FindOneAndUpdateOptions::builder()
            .return_document(ReturnDocument::After)
            .array_filters(options.array_filters.clone())
            .build();

        let updated = match options.resolve_session() {
            Some(handle) => {
                let mut guard = handle.lock().await;
                match guard.as_mut() {
                    Some(session) => {
                        collection
                            .find_one_and_update_with_session(
                                filter,
                                update,
                                update_options,
                                session,
                            )
                            .await?
                    }
                    None => {
                        collection
                            .find_one_and_update(filter, update, update_options)
                            .await?
                    }
                }
            }
            None => {
                collection
                    .find_one_and_update(filter, update, update_options)
                    .await?
            }
        };

        Ok(updated)
    }

    async fn find_one_and_delete(
        &self,
        table: &str,
        filter: Document,
        options: OperationOptions,
    ) -> Result<Option<Document>> {
        let collection = self.collection(table);

        let deleted = match options.resolve_session() {
            Some(handle) => {
                let mut guard = handle.lock().await;
                match guard.as_mut() {
                    Some(session) => {
                        collection
                            .find_one_and_delete_with_session(filter, None, session)
                            .await?
                    }
                    None => collection.find_one_and_delete(filter, None).await?,
                }
            }
            None => collection.find_one_and_delete(filter, None).await?,
        };

        Ok(deleted)
    }

    async fn upsert(
        &self,
        table: &str,
        filter: Document,
        document: Document,
        options: OperationOptions,
    ) -> Result<Document> {
        let collection = self.collection(table);
        let upsert_options = FindOneAndReplaceOptions::builder()
            .upsert(true)
            .return_document(ReturnDocument::After)
            .build();

        let upserted = match options.resolve_session() {
            Some(handle) => {
                let mut guard = handle.lock().await;
                match guard.as_mut() {
                    Some(session) => {
                        collection
                            .find_one_and_replace_with_session(
                                filter,
                                document,
                                upsert_options,
                                session,
                            )
                            .await?
                    }
                    None => {
                        collection
                            .find_one_and_replace(filter, document, upsert_options)
                            .await?
                    }
                }
            }
            None => {
                collection
                    .find_one_and_replace(filter, document, upsert_options)
                    .await?
            }
        };

        upserted.ok_or_else(|| Error::invalid_argument("upsert returned no document"))
    }

    async fn delete(
        &self,
        table: &str,
        filter: Document,
        options: OperationOptions,
    ) -> Result<u64> {
        let collection = self.collection(table);

        let result = match options.resolve_session() {
            Some(handle) => {
                let mut guard = handle.lock().await;
                match guard.as_mut() {
                    Some(session) => {
                        collection
                            .delete_one_with_session(filter, None, session)
                            .await?
                    }
                    None => collection.delete_one(filter, None).await?,
                }
            }
            None => collection.delete_one(filter, None).await?,
        };

        Ok(result.deleted_count)
    }

    async fn delete_many(
        &self,
        table: &str,
        filter: Document,
        options: OperationOptions,
    ) -> Result<u64> {
        let collection = self.collection(table);

        let result = match options.resolve_session() {
            Some(handle) => {
                let mut guard = handle.lock().await;
                match guard.as_mut() {
                    Some(session) => {
                        collection
                            .delete_many_with_session(filter, None, session)
                            .await?
                    }
                    None => collection.delete_many(filter, None).await?,
                }
            }
            None => collection.delete_many(filter, None).await?,
        };

        Ok(result.deleted_count)
    }

    async fn truncate_table(&self, table: &str, options: OperationOptions) -> Result<u64> {
        self.delete_many(table, doc! {}, options).await
    }

    async fn aggregate(
        &self,
        table: &str,
        pipeline: Pipeline,
        options: OperationOptions,
    ) -> Result<Vec<Document>> {
        let collection = self.collection(table);
        let stages = pipeline.into_documents();
        let span = tracing::debug_span!("aggregate", table);

        async move {
            match options.resolve_session() {
                Some(handle) => {
                    let mut guard = handle.lock().await;
                    match guard.as_mut() {
                        Some(session) => {
                            let mut cursor =
                                collection.aggregate_with_session(stages, None, session).await?;
                            let mut documents = Vec::new();
                            while let Some(document) =
                                cursor.next(session).await.transpose()?
                            {
                                documents.push(document);
                            }
                            Ok(documents)
                        }
                        None => {
                            let cursor = collection.aggregate(stages, None).await?;
                            Ok(cursor.try_collect().await?)
                        }
                    }
                }
                None => {
                    let cursor = collection.aggregate(stages, None).await?;
                    Ok(cursor.try_collect().await?)
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn begin_transaction(&self) -> Result<Transaction> {
        let mut session = self.client.start_session(None).await?;
        session.start_transaction(None).await?;
        Ok(Transaction::start(SessionHandle::new(session)))
    }
}
