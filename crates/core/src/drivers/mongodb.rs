//! MongoDB driver
//!
//! One document per entry: `{key, created, expiry, value}` with a unique index
//! on `key` and a TTL index on `expiry`. The server's TTL monitor only sweeps
//! about once a minute, so every read also filters on expiry. Expired
//! documents are never deleted by a plain read; only `clean()` and lock
//! takeover remove them, with the expiry in the delete filter.

use super::{
    is_live, key_matcher, Cleanable, Clearable, Destroyable, Driver, HasKey, ListEntry, Listable,
    Lockable, Sizeable,
};
use crate::config::{CacheSettings, MongodbSettings};
use crate::errors::{CacheError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use mongodb::bson::spec::BinarySubtype;
use mongodb::bson::{self, doc, Binary, Bson, Document};
use mongodb::error::{ErrorKind, WriteFailure};
use mongodb::options::{ClientOptions, FindOptions, IndexOptions, ReplaceOptions};
use mongodb::{Client, Collection, IndexModel};
use parking_lot::RwLock;
use std::time::Duration;
use tracing::{debug, info};

const DRIVER: &str = "mongodb";

/// Server error code for a unique index violation
const DUPLICATE_KEY: i32 = 11000;

/// Driver storing entries as documents in one MongoDB collection
pub struct MongodbDriver {
    settings: MongodbSettings,
    collection: RwLock<Option<Collection<Document>>>,
    key_query: String,
}

impl std::fmt::Debug for MongodbDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MongodbDriver")
            .field("collection", &self.settings.collection)
            .field("connected", &self.collection.read().is_some())
            .field("key_query", &self.key_query)
            .finish()
    }
}

fn to_bson_time(at: DateTime<Utc>) -> bson::DateTime {
    bson::DateTime::from_millis(at.timestamp_millis())
}

fn from_bson_time(at: &bson::DateTime) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp_millis(at.timestamp_millis())
}

/// Matches the document for `key` while it is live at `now`
fn live_filter(key: &str, now: DateTime<Utc>) -> Document {
    doc! {
        "key": key,
        "$or": [
            { "expiry": Bson::Null },
            { "expiry": { "$gt": to_bson_time(now) } },
        ],
    }
}

/// Matches the document for `key` only while it is expired at `now`
fn expired_filter(key: &str, now: DateTime<Utc>) -> Document {
    doc! { "key": key, "expiry": { "$lte": to_bson_time(now) } }
}

fn entry_document(key: &str, value: Vec<u8>, expiry: Option<DateTime<Utc>>) -> Document {
    let mut document = doc! {
        "key": key,
        "created": to_bson_time(Utc::now()),
        "value": Binary { subtype: BinarySubtype::Generic, bytes: value },
    };
    if let Some(expiry) = expiry {
        document.insert("expiry", to_bson_time(expiry));
    }
    document
}

fn document_expiry(document: &Document) -> Option<DateTime<Utc>> {
    document.get_datetime("expiry").ok().and_then(from_bson_time)
}

fn is_duplicate_key(error: &mongodb::error::Error) -> bool {
    matches!(
        error.kind.as_ref(),
        ErrorKind::Write(WriteFailure::WriteError(failure)) if failure.code == DUPLICATE_KEY
    )
}

fn backend(operation: &'static str) -> impl FnOnce(mongodb::error::Error) -> CacheError {
    move |e| CacheError::backend_with_source(DRIVER, operation, e)
}

impl MongodbDriver {
    /// Keep the settings; connecting waits for `can_load`
    pub fn new(settings: &CacheSettings) -> Self {
        Self {
            settings: settings.drivers.mongodb.clone(),
            collection: RwLock::new(None),
            key_query: settings.key_query.clone(),
        }
    }

    fn collection(&self, operation: &'static str) -> Result<Collection<Document>> {
        self.collection
            .read()
            .clone()
            .ok_or_else(|| CacheError::backend(DRIVER, operation, "connection is not open"))
    }

    async fn connect(&self) -> Result<Collection<Document>> {
        let timeout = Duration::from_millis(self.settings.connect_timeout_ms);
        let mut options = ClientOptions::parse(&self.settings.uri)
            .await
            .map_err(|e| CacheError::driver_unavailable(DRIVER, e.to_string()))?;
        options.connect_timeout = Some(timeout);
        options.server_selection_timeout = Some(timeout);
        let client = Client::with_options(options)
            .map_err(|e| CacheError::driver_unavailable(DRIVER, e.to_string()))?;

        let database = client
            .default_database()
            .unwrap_or_else(|| client.database(&self.settings.database));
        database
            .run_command(doc! { "ping": 1 }, None)
            .await
            .map_err(|e| CacheError::driver_unavailable(DRIVER, e.to_string()))?;

        let collection = database.collection::<Document>(&self.settings.collection);
        let indexes = [
            IndexModel::builder()
                .keys(doc! { "key": 1 })
                .options(IndexOptions::builder().unique(true).build())
                .build(),
            IndexModel::builder()
                .keys(doc! { "expiry": 1 })
                .options(IndexOptions::builder().expire_after(Duration::ZERO).build())
                .build(),
        ];
        collection
            .create_indexes(indexes, None)
            .await
            .map_err(|e| CacheError::driver_unavailable(DRIVER, e.to_string()))?;
        Ok(collection)
    }

    async fn find_live(&self, operation: &'static str, key: &str) -> Result<Option<Document>> {
        self.collection(operation)?
            .find_one(live_filter(key, Utc::now()), None)
            .await
            .map_err(backend(operation))
    }

    async fn count_live(&self, operation: &'static str, key: &str) -> Result<bool> {
        let count = self
            .collection(operation)?
            .count_documents(live_filter(key, Utc::now()), None)
            .await
            .map_err(backend(operation))?;
        Ok(count > 0)
    }
}

#[async_trait]
impl Driver for MongodbDriver {
    fn id(&self) -> &str {
        DRIVER
    }

    async fn can_load(&self) -> Result<bool> {
        let collection = self.connect().await?;
        info!(collection = %self.settings.collection, "connected to mongodb");
        *self.collection.write() = Some(collection);
        Ok(true)
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let document = self.find_live("get", key).await?;
        Ok(document.and_then(|document| document.get_binary_generic("value").ok().cloned()))
    }

    async fn set(&self, key: &str, value: Vec<u8>, expiry: Option<DateTime<Utc>>) -> Result<()> {
        let upsert = ReplaceOptions::builder().upsert(true).build();
        self.collection("set")?
            .replace_one(doc! { "key": key }, entry_document(key, value, expiry), upsert)
            .await
            .map_err(backend("set"))?;
        Ok(())
    }

    async fn unset(&self, key: &str) -> Result<()> {
        self.collection("unset")?
            .delete_one(doc! { "key": key }, None)
            .await
            .map_err(backend("unset"))?;
        Ok(())
    }

    fn as_has(&self) -> Option<&dyn HasKey> {
        Some(self)
    }

    fn as_sizeable(&self) -> Option<&dyn Sizeable> {
        Some(self)
    }

    fn as_listable(&self) -> Option<&dyn Listable> {
        Some(self)
    }

    fn as_cleanable(&self) -> Option<&dyn Cleanable> {
        Some(self)
    }

    fn as_clearable(&self) -> Option<&dyn Clearable> {
        Some(self)
    }

    fn as_destroyable(&self) -> Option<&dyn Destroyable> {
        Some(self)
    }

    fn as_lockable(&self) -> Option<&dyn Lockable> {
        Some(self)
    }
}

#[async_trait]
impl HasKey for MongodbDriver {
    async fn has(&self, key: &str) -> Result<bool> {
        self.count_live("has", key).await
    }
}

#[async_trait]
impl Sizeable for MongodbDriver {
    async fn size(&self, key: &str) -> Result<Option<u64>> {
        let document = self.find_live("size", key).await?;
        Ok(document
            .and_then(|document| document.get_binary_generic("value").ok().map(Vec::len))
            .map(|len| len as u64))
    }
}

#[async_trait]
impl Listable for MongodbDriver {
    async fn list(&self) -> Result<Vec<ListEntry>> {
        let matcher = key_matcher(&self.key_query)?;
        let now = Utc::now();
        let filter = doc! {
            "$or": [
                { "expiry": Bson::Null },
                { "expiry": { "$gt": to_bson_time(now) } },
            ],
        };
        let projection = FindOptions::builder()
            .projection(doc! { "key": 1, "expiry": 1, "created": 1 })
            .build();
        let documents: Vec<Document> = self
            .collection("list")?
            .find(filter, projection)
            .await
            .map_err(backend("list"))?
            .try_collect()
            .await
            .map_err(backend("list"))?;

        Ok(documents
            .iter()
            .filter_map(|document| {
                let key = document.get_str("key").ok()?;
                matcher.is_match(key).then(|| ListEntry {
                    id: key.to_string(),
                    expiry: document_expiry(document),
                    created: document.get_datetime("created").ok().and_then(from_bson_time),
                })
            })
            .collect())
    }
}

#[async_trait]
impl Cleanable for MongodbDriver {
    async fn clean(&self) -> Result<()> {
        let removed = self
            .collection("clean")?
            .delete_many(doc! { "expiry": { "$lte": to_bson_time(Utc::now()) } }, None)
            .await
            .map_err(backend("clean"))?;
        debug!(removed = removed.deleted_count, "cleaned mongodb entries");
        Ok(())
    }
}

#[async_trait]
impl Clearable for MongodbDriver {
    async fn clear(&self) -> Result<()> {
        self.collection("clear")?
            .delete_many(doc! {}, None)
            .await
            .map_err(backend("clear"))?;
        Ok(())
    }
}

#[async_trait]
impl Destroyable for MongodbDriver {
    async fn destroy(&self) -> Result<()> {
        self.collection.write().take();
        Ok(())
    }
}

#[async_trait]
impl Lockable for MongodbDriver {
    async fn lock_acquire(
        &self,
        key: &str,
        value: Vec<u8>,
        expiry: Option<DateTime<Utc>>,
    ) -> Result<bool> {
        let collection = self.collection("lock_acquire")?;
        // An expired holder would otherwise trip the unique index
        collection
            .delete_one(expired_filter(key, Utc::now()), None)
            .await
            .map_err(backend("lock_acquire"))?;

        match collection
            .insert_one(entry_document(key, value, expiry), None)
            .await
        {
            Ok(_) => Ok(true),
            Err(e) if is_duplicate_key(&e) => Ok(false),
            Err(e) => Err(CacheError::backend_with_source(DRIVER, "lock_acquire", e)),
        }
    }

    async fn lock_hydrate(
        &self,
        key: &str,
        value: Vec<u8>,
        expiry: Option<DateTime<Utc>>,
    ) -> Result<bool> {
        let replaced = self
            .collection("lock_hydrate")?
            .replace_one(
                live_filter(key, Utc::now()),
                entry_document(key, value, expiry),
                None,
            )
            .await
            .map_err(backend("lock_hydrate"))?;
        Ok(replaced.matched_count > 0)
    }

    async fn lock_release(&self, key: &str) -> Result<bool> {
        let removed = self
            .collection("lock_release")?
            .find_one_and_delete(doc! { "key": key }, None)
            .await
            .map_err(backend("lock_release"))?;
        Ok(removed.is_some_and(|document| is_live(document_expiry(&document), Utc::now())))
    }

    async fn lock_exists(&self, key: &str) -> Result<bool> {
        self.count_live("lock_exists", key).await
    }
}
