//! Database layer
//!
//! MongoDB client, typed collections and document schemas.

pub mod mongo;
pub mod schemas;

pub use mongo::{is_duplicate_key, IntoIndexes, MongoClient, MongoCollection, MutMetadata};
