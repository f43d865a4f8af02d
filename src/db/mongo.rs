//! MongoDB client and collection wrapper
//!
//! Typed collections apply their schema-declared indexes on open. Ledger
//! records are never deleted, so there is no soft-delete filtering here.

use bson::{doc, oid::ObjectId, DateTime, Document};
use futures_util::TryStreamExt;
use mongodb::{
    error::{ErrorKind, WriteFailure},
    options::{IndexOptions, ReturnDocument, UpdateModifications},
    results::UpdateResult,
    Client, ClientSession, Collection, IndexModel,
};
use serde::{de::DeserializeOwned, Serialize};
use tracing::info;

use crate::db::schemas::Metadata;
use crate::types::LedgerError;

/// Server error code for a unique index violation
const DUPLICATE_KEY_CODE: i32 = 11000;

/// Trait for schemas that provide index definitions
pub trait IntoIndexes {
    fn into_indices() -> Vec<(Document, Option<IndexOptions>)>;
}

/// Trait for schemas with mutable metadata
pub trait MutMetadata {
    fn mut_metadata(&mut self) -> &mut Metadata;
}

/// Whether a driver error is a unique index violation
pub fn is_duplicate_key(err: &mongodb::error::Error) -> bool {
    match err.kind.as_ref() {
        ErrorKind::Write(WriteFailure::WriteError(we)) => we.code == DUPLICATE_KEY_CODE,
        ErrorKind::Command(ce) => ce.code == DUPLICATE_KEY_CODE,
        _ => false,
    }
}

/// MongoDB client wrapper
#[derive(Clone)]
pub struct MongoClient {
    client: Client,
    db_name: String,
}

impl MongoClient {
    /// Create a new MongoDB client
    pub async fn new(uri: &str, db_name: &str) -> Result<Self, LedgerError> {
        info!("Connecting to MongoDB at {}", uri);

        // Use serverSelectionTimeoutMS to avoid hanging on unreachable MongoDB
        let timeout_uri = if uri.contains('?') {
            format!("{}&serverSelectionTimeoutMS=3000&connectTimeoutMS=3000", uri)
        } else {
            format!("{}?serverSelectionTimeoutMS=3000&connectTimeoutMS=3000", uri)
        };

        let client = Client::with_uri_str(&timeout_uri)
            .await
            .map_err(|e| LedgerError::Database(format!("Failed to connect to MongoDB: {}", e)))?;

        client
            .database(db_name)
            .run_command(doc! { "ping": 1 })
            .await
            .map_err(|e| LedgerError::Database(format!("MongoDB ping failed: {}", e)))?;

        info!("Connected to MongoDB database '{}'", db_name);

        Ok(Self {
            client,
            db_name: db_name.to_string(),
        })
    }

    /// Get a typed collection
    pub async fn collection<T>(&self, name: &str) -> Result<MongoCollection<T>, LedgerError>
    where
        T: Serialize + DeserializeOwned + Unpin + Send + Sync + IntoIndexes + MutMetadata,
    {
        MongoCollection::new(&self.client, &self.db_name, name).await
    }

    /// Start a client session for multi-document transactions
    pub async fn start_session(&self) -> Result<ClientSession, LedgerError> {
        self.client
            .start_session()
            .await
            .map_err(|e| LedgerError::Database(format!("Failed to start session: {}", e)))
    }

    /// Get the raw MongoDB client
    pub fn inner(&self) -> &Client {
        &self.client
    }

    /// Get the database name
    pub fn db_name(&self) -> &str {
        &self.db_name
    }
}

/// Typed MongoDB collection with automatic indexing
#[derive(Debug, Clone)]
pub struct MongoCollection<T>
where
    T: Serialize + DeserializeOwned + Unpin + Send + Sync,
{
    inner: Collection<T>,
}

impl<T> MongoCollection<T>
where
    T: Serialize + DeserializeOwned + Unpin + Send + Sync + IntoIndexes + MutMetadata,
{
    /// Create a new collection and apply indexes
    pub async fn new(
        client: &Client,
        db_name: &str,
        collection_name: &str,
    ) -> Result<Self, LedgerError> {
        let collection = client.database(db_name).collection::<T>(collection_name);
        let mongo_collection = MongoCollection { inner: collection };

        mongo_collection.apply_indexes().await?;

        Ok(mongo_collection)
    }

    /// Apply schema-defined indexes
    async fn apply_indexes(&self) -> Result<(), LedgerError> {
        let schema_indices = T::into_indices();

        if schema_indices.is_empty() {
            return Ok(());
        }

        let indices: Vec<IndexModel> = schema_indices
            .into_iter()
            .map(|(keys, opts)| IndexModel::builder().keys(keys).options(opts).build())
            .collect();

        self.inner
            .create_indexes(indices)
            .await
            .map_err(|e| LedgerError::Database(format!("Failed to create indexes: {}", e)))?;

        Ok(())
    }

    /// Insert a document, setting metadata timestamps.
    ///
    /// Unique index violations surface as `Conflict`.
    pub async fn insert_one(&self, mut item: T) -> Result<ObjectId, LedgerError> {
        stamp_insert(&mut item);

        let result = self.inner.insert_one(item).await.map_err(map_write_error)?;

        result
            .inserted_id
            .as_object_id()
            .ok_or_else(|| LedgerError::Database("Failed to get inserted ID".into()))
    }

    /// Insert inside a session (transaction participant)
    pub async fn insert_one_with_session(
        &self,
        mut item: T,
        session: &mut ClientSession,
    ) -> Result<(), LedgerError> {
        stamp_insert(&mut item);
        self.inner
            .insert_one(item)
            .session(session)
            .await
            .map_err(map_write_error)?;
        Ok(())
    }

    /// Find one document by filter
    pub async fn find_one(&self, filter: Document) -> Result<Option<T>, LedgerError> {
        self.inner
            .find_one(filter)
            .await
            .map_err(|e| LedgerError::Database(format!("Find failed: {}", e)))
    }

    /// Find documents with explicit sort and optional pagination
    pub async fn find_sorted(
        &self,
        filter: Document,
        sort: Document,
        skip: Option<u64>,
        limit: Option<i64>,
    ) -> Result<Vec<T>, LedgerError> {
        let mut action = self.inner.find(filter).sort(sort);
        if let Some(skip) = skip {
            action = action.skip(skip);
        }
        if let Some(limit) = limit {
            action = action.limit(limit);
        }

        let cursor = action
            .await
            .map_err(|e| LedgerError::Database(format!("Find failed: {}", e)))?;

        cursor
            .try_collect()
            .await
            .map_err(|e| LedgerError::Database(format!("Error reading documents: {}", e)))
    }

    /// Count documents matching a filter
    pub async fn count(&self, filter: Document) -> Result<u64, LedgerError> {
        self.inner
            .count_documents(filter)
            .await
            .map_err(|e| LedgerError::Database(format!("Count failed: {}", e)))
    }

    /// Update one document, touching `metadata.updated_at`
    pub async fn update_one(
        &self,
        filter: Document,
        update: Document,
    ) -> Result<UpdateResult, LedgerError> {
        self.inner
            .update_one(filter, touch_updated_at(update))
            .await
            .map_err(map_write_error)
    }

    /// Update one document inside a session
    pub async fn update_one_with_session(
        &self,
        filter: Document,
        update: Document,
        session: &mut ClientSession,
    ) -> Result<UpdateResult, LedgerError> {
        self.inner
            .update_one(filter, touch_updated_at(update))
            .session(session)
            .await
            .map_err(map_write_error)
    }

    /// Atomic find-and-modify returning the document after the update
    pub async fn find_one_and_update(
        &self,
        filter: Document,
        update: impl Into<UpdateModifications>,
        upsert: bool,
    ) -> Result<Option<T>, LedgerError> {
        self.inner
            .find_one_and_update(filter, update)
            .upsert(upsert)
            .return_document(ReturnDocument::After)
            .await
            .map_err(map_write_error)
    }

    /// Get the underlying collection for advanced operations
    pub fn inner(&self) -> &Collection<T> {
        &self.inner
    }
}

fn stamp_insert<T: MutMetadata>(item: &mut T) {
    let metadata = item.mut_metadata();
    let now = DateTime::now();
    if metadata.created_at.is_none() {
        metadata.created_at = Some(now);
    }
    metadata.updated_at = Some(now);
}

/// Add `metadata.updated_at` to an update document's `$set`
fn touch_updated_at(mut update: Document) -> Document {
    match update.get_document_mut("$set") {
        Ok(set) => {
            set.insert("metadata.updated_at", DateTime::now());
        }
        Err(_) => {
            update.insert("$set", doc! { "metadata.updated_at": DateTime::now() });
        }
    }
    update
}

fn map_write_error(e: mongodb::error::Error) -> LedgerError {
    if is_duplicate_key(&e) {
        LedgerError::Conflict(format!("Duplicate key: {}", e))
    } else {
        LedgerError::Database(format!("Write failed: {}", e))
    }
}
