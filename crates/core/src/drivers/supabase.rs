//! Supabase driver speaking PostgREST over HTTPS
//!
//! Expects a table shaped like:
//!
//! ```sql
//! create table cache (
//!     id text primary key,
//!     created_at timestamptz default now(),
//!     expires_at timestamptz,
//!     data text
//! );
//! ```
//!
//! Column names are configurable. Values are stored base64 encoded.

use super::{is_live, Cleanable, Clearable, Driver, HasKey, ListEntry, Listable, Lockable};
use crate::config::{CacheSettings, SupabaseSettings};
use crate::errors::{CacheError, Result};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::{Client, RequestBuilder, StatusCode};
use serde_json::{json, Map, Value};
use tracing::debug;

const DRIVER: &str = "supabase";

/// Driver storing one row per entry in a Supabase table
#[derive(Debug)]
pub struct SupabaseDriver {
    client: Client,
    settings: SupabaseSettings,
    key_query: String,
}

fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

impl SupabaseDriver {
    pub fn new(settings: &CacheSettings) -> Result<Self> {
        let client = Client::builder()
            .build()
            .map_err(|e| CacheError::driver_unavailable(DRIVER, e.to_string()))?;
        Ok(Self {
            client,
            settings: settings.drivers.supabase.clone(),
            key_query: settings.key_query.clone(),
        })
    }

    fn endpoint(&self) -> Result<String> {
        let url = self
            .settings
            .url
            .as_deref()
            .ok_or_else(|| CacheError::configuration("supabase url is not set"))?;
        Ok(format!(
            "{}/rest/v1/{}",
            url.trim_end_matches('/'),
            self.settings.table
        ))
    }

    fn request(&self, method: reqwest::Method) -> Result<RequestBuilder> {
        let key = self
            .settings
            .api_key
            .as_deref()
            .ok_or_else(|| CacheError::configuration("supabase api key is not set"))?;
        Ok(self
            .client
            .request(method, self.endpoint()?)
            .header("apikey", key)
            .bearer_auth(key))
    }

    fn id_filter(&self, key: &str) -> (String, String) {
        (self.settings.col_id.clone(), format!("eq.{key}"))
    }

    fn row(&self, key: &str, value: &[u8], expiry: Option<DateTime<Utc>>) -> Value {
        let mut row = Map::new();
        row.insert(self.settings.col_id.clone(), json!(key));
        row.insert(self.settings.col_data.clone(), json!(BASE64.encode(value)));
        row.insert(
            self.settings.col_expires.clone(),
            json!(expiry.map(timestamp)),
        );
        row.insert(
            self.settings.col_created.clone(),
            json!(timestamp(Utc::now())),
        );
        Value::Object(row)
    }

    async fn send(&self, operation: &'static str, request: RequestBuilder) -> Result<Vec<Value>> {
        let response = request
            .send()
            .await
            .map_err(|e| CacheError::backend_with_source(DRIVER, operation, e))?
            .error_for_status()
            .map_err(|e| CacheError::backend_with_source(DRIVER, operation, e))?;

        let body = response
            .text()
            .await
            .map_err(|e| CacheError::backend_with_source(DRIVER, operation, e))?;
        if body.trim().is_empty() {
            return Ok(Vec::new());
        }
        serde_json::from_str(&body)
            .map_err(|e| CacheError::backend(DRIVER, operation, format!("unexpected response: {e}")))
    }

    fn parse_time(&self, row: &Value, column: &str) -> Option<DateTime<Utc>> {
        row.get(column)
            .and_then(Value::as_str)
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|t| t.with_timezone(&Utc))
    }

    /// Fetch the row for `key` if it is still live
    async fn fetch(&self, key: &str) -> Result<Option<Value>> {
        let select = format!(
            "{},{},{}",
            self.settings.col_id, self.settings.col_expires, self.settings.col_data
        );
        let request = self
            .request(reqwest::Method::GET)?
            .query(&[("select", select)])
            .query(&[self.id_filter(key)]);
        let row = self.send("get", request).await?.into_iter().next();

        match row {
            Some(row) if is_live(self.parse_time(&row, &self.settings.col_expires), Utc::now()) => {
                Ok(Some(row))
            }
            Some(_) => {
                // Only the stale row goes, a concurrent rewrite keeps its fresh expiry
                self.delete_where("evict", &self.expired_filters(key, Utc::now()))
                    .await?;
                Ok(None)
            }
            None => Ok(None),
        }
    }

    /// Filters matching the row for `key` only while it is expired at `now`
    fn expired_filters(&self, key: &str, now: DateTime<Utc>) -> [(String, String); 2] {
        [
            self.id_filter(key),
            (
                self.settings.col_expires.clone(),
                format!("lt.{}", timestamp(now)),
            ),
        ]
    }

    async fn delete_where(
        &self,
        operation: &'static str,
        filters: &[(String, String)],
    ) -> Result<Vec<Value>> {
        let request = self
            .request(reqwest::Method::DELETE)?
            .query(filters)
            .header("Prefer", "return=representation");
        self.send(operation, request).await
    }
}

#[async_trait]
impl Driver for SupabaseDriver {
    fn id(&self) -> &str {
        DRIVER
    }

    async fn can_load(&self) -> Result<bool> {
        if self.settings.url.is_none() || self.settings.api_key.is_none() {
            debug!("supabase url or api key missing");
            return Ok(false);
        }
        let request = self
            .request(reqwest::Method::GET)?
            .query(&[("select", self.settings.col_id.as_str()), ("limit", "1")]);
        self.send("can_load", request).await?;
        Ok(true)
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let Some(row) = self.fetch(key).await? else {
            return Ok(None);
        };
        let encoded = row
            .get(&self.settings.col_data)
            .and_then(Value::as_str)
            .unwrap_or_default();
        BASE64
            .decode(encoded)
            .map(Some)
            .map_err(|e| CacheError::decode(key, e.to_string()))
    }

    async fn set(&self, key: &str, value: Vec<u8>, expiry: Option<DateTime<Utc>>) -> Result<()> {
        let request = self
            .request(reqwest::Method::POST)?
            .header("Prefer", "resolution=merge-duplicates")
            .json(&self.row(key, &value, expiry));
        self.send("set", request).await?;
        Ok(())
    }

    async fn unset(&self, key: &str) -> Result<()> {
        let request = self
            .request(reqwest::Method::DELETE)?
            .query(&[self.id_filter(key)]);
        self.send("unset", request).await?;
        Ok(())
    }

    fn as_has(&self) -> Option<&dyn HasKey> {
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

    fn as_lockable(&self) -> Option<&dyn Lockable> {
        Some(self)
    }
}

#[async_trait]
impl HasKey for SupabaseDriver {
    async fn has(&self, key: &str) -> Result<bool> {
        Ok(self.fetch(key).await?.is_some())
    }
}

#[async_trait]
impl Listable for SupabaseDriver {
    async fn list(&self) -> Result<Vec<ListEntry>> {
        let select = format!(
            "{},{},{}",
            self.settings.col_id, self.settings.col_created, self.settings.col_expires
        );
        // PostgREST `like` uses `*` as its wildcard, matching the glob syntax
        let request = self.request(reqwest::Method::GET)?.query(&[
            ("select".to_string(), select),
            (self.settings.col_id.clone(), format!("like.{}", self.key_query)),
        ]);
        let now = Utc::now();

        Ok(self
            .send("list", request)
            .await?
            .into_iter()
            .filter_map(|row| {
                let id = row.get(&self.settings.col_id)?.as_str()?.to_string();
                let entry = ListEntry {
                    id,
                    expiry: self.parse_time(&row, &self.settings.col_expires),
                    created: self.parse_time(&row, &self.settings.col_created),
                };
                is_live(entry.expiry, now).then_some(entry)
            })
            .collect())
    }
}

#[async_trait]
impl Cleanable for SupabaseDriver {
    async fn clean(&self) -> Result<()> {
        let filter = (
            self.settings.col_expires.clone(),
            format!("lt.{}", timestamp(Utc::now())),
        );
        self.delete_where("clean", &[filter]).await?;
        Ok(())
    }
}

#[async_trait]
impl Clearable for SupabaseDriver {
    async fn clear(&self) -> Result<()> {
        let filter = (self.settings.col_id.clone(), "not.is.null".to_string());
        self.delete_where("clear", &[filter]).await?;
        Ok(())
    }
}

#[async_trait]
impl Lockable for SupabaseDriver {
    async fn lock_acquire(
        &self,
        key: &str,
        value: Vec<u8>,
        expiry: Option<DateTime<Utc>>,
    ) -> Result<bool> {
        // Expired holders would otherwise trip the primary key conflict
        self.fetch(key).await?;

        let response = self
            .request(reqwest::Method::POST)?
            .json(&self.row(key, &value, expiry))
            .send()
            .await
            .map_err(|e| CacheError::backend_with_source(DRIVER, "lock_acquire", e))?;

        match response.status() {
            StatusCode::CONFLICT => Ok(false),
            status if status.is_success() => Ok(true),
            status => Err(CacheError::backend(
                DRIVER,
                "lock_acquire",
                format!("unexpected status {status}"),
            )),
        }
    }

    async fn lock_hydrate(
        &self,
        key: &str,
        value: Vec<u8>,
        expiry: Option<DateTime<Utc>>,
    ) -> Result<bool> {
        if self.fetch(key).await?.is_none() {
            return Ok(false);
        }
        let request = self
            .request(reqwest::Method::PATCH)?
            .query(&[self.id_filter(key)])
            .header("Prefer", "return=representation")
            .json(&self.row(key, &value, expiry));
        Ok(!self.send("lock_hydrate", request).await?.is_empty())
    }

    async fn lock_release(&self, key: &str) -> Result<bool> {
        let removed = self.delete_where("lock_release", &[self.id_filter(key)]).await?;
        Ok(!removed.is_empty())
    }

    async fn lock_exists(&self, key: &str) -> Result<bool> {
        Ok(self.fetch(key).await?.is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unconfigured_driver_does_not_load() {
        let driver = SupabaseDriver::new(&CacheSettings::default()).unwrap();
        assert!(!driver.can_load().await.unwrap());
    }

    #[test]
    fn test_row_uses_configured_columns() {
        let settings = CacheSettings::builder()
            .with_supabase(SupabaseSettings {
                url: Some("https://example.supabase.co/".to_string()),
                api_key: Some("key".to_string()),
                col_data: "payload".to_string(),
                ..Default::default()
            })
            .build();
        let driver = SupabaseDriver::new(&settings).unwrap();

        assert_eq!(
            driver.endpoint().unwrap(),
            "https://example.supabase.co/rest/v1/cache"
        );
        let row = driver.row("k", b"v", None);
        assert_eq!(row["id"], "k");
        assert_eq!(row["payload"], BASE64.encode(b"v"));
        assert!(row["expires_at"].is_null());
    }

    #[test]
    fn test_expired_delete_is_conditional_on_expiry() {
        let settings = CacheSettings::builder()
            .with_supabase(SupabaseSettings {
                url: Some("https://example.supabase.co/".to_string()),
                api_key: Some("key".to_string()),
                ..Default::default()
            })
            .build();
        let driver = SupabaseDriver::new(&settings).unwrap();
        let now = Utc::now();

        let [id, expires] = driver.expired_filters("k", now);
        assert_eq!(id, ("id".to_string(), "eq.k".to_string()));
        assert_eq!(expires.0, "expires_at");
        assert_eq!(expires.1, format!("lt.{}", timestamp(now)));
    }
}
