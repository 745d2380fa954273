//! In-memory object client.
//!
//! Buckets are `BTreeMap`s of key → object held behind a
//! `tokio::sync::RwLock`, so listings come back in key order like S3.
//! Stores are shared per endpoint URL through [`MemoryClientFactory`]:
//! rebuilding the client registry produces new client instances that
//! still see the same data, the way new SDK clients see the same bucket.

use aws_sdk_s3::primitives::ByteStream;
use bytes::Bytes;
use chrono::Utc;
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use std::collections::{BTreeMap, HashMap};
use std::io::Read;
use std::ops::Bound;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use super::backend::{
    ClientFuture, GetObjectOutput, ListObjectsPage, ListObjectsRequest, ObjectClient, ObjectMeta,
    PresignRequest, PutObjectRequest, ReadSeek,
};
use crate::config::Settings;
use crate::errors::ClientError;
use crate::registry::{BuildFuture, ClientFactory};

/// Default and maximum listing page size, as on S3.
const MAX_PAGE_SIZE: usize = 1000;

/// Characters left unescaped in presigned query values.
const QUERY_VALUE: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

/// A stored object: its bytes plus the metadata a HEAD would return.
#[derive(Debug, Clone)]
struct StoredObject {
    data: Bytes,
    meta: ObjectMeta,
}

/// Shared bucket state behind one or more [`MemoryClient`]s.
#[derive(Debug)]
pub struct MemoryStore {
    buckets: tokio::sync::RwLock<HashMap<String, BTreeMap<String, StoredObject>>>,
    /// Number of calls received, for asserting that none were made.
    requests: AtomicUsize,
    page_size: AtomicUsize,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self {
            buckets: tokio::sync::RwLock::new(HashMap::new()),
            requests: AtomicUsize::new(0),
            page_size: AtomicUsize::new(MAX_PAGE_SIZE),
        }
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty bucket.  Existing buckets are left alone.
    pub async fn create_bucket(&self, bucket: &str) {
        self.buckets
            .write()
            .await
            .entry(bucket.to_string())
            .or_default();
    }

    /// Number of client calls served so far.
    pub fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }

    /// Cap listing pages at `size` entries (clamped to 1..=1000).
    pub fn set_page_size(&self, size: usize) {
        self.page_size
            .store(size.clamp(1, MAX_PAGE_SIZE), Ordering::SeqCst);
    }

    /// Raw stored bytes of an object, bypassing any decoding.
    pub async fn raw_object(&self, bucket: &str, key: &str) -> Option<Bytes> {
        self.buckets
            .read()
            .await
            .get(bucket)
            .and_then(|objects| objects.get(key))
            .map(|object| object.data.clone())
    }

    fn count_request(&self) {
        self.requests.fetch_add(1, Ordering::SeqCst);
    }
}

fn no_such_bucket(bucket: &str) -> ClientError {
    ClientError::new(
        "NoSuchBucket",
        format!("The specified bucket does not exist: {bucket}"),
    )
}

fn no_such_key(key: &str) -> ClientError {
    ClientError::new(
        "NoSuchKey",
        format!("The specified key does not exist: {key}"),
    )
}

/// [`ObjectClient`] over a [`MemoryStore`].
pub struct MemoryClient {
    store: Arc<MemoryStore>,
    endpoint_url: Option<String>,
}

impl MemoryClient {
    pub fn new(store: Arc<MemoryStore>, endpoint_url: Option<String>) -> Self {
        Self {
            store,
            endpoint_url,
        }
    }

    pub fn store(&self) -> &Arc<MemoryStore> {
        &self.store
    }
}

impl ObjectClient for MemoryClient {
    fn endpoint_url(&self) -> Option<&str> {
        self.endpoint_url.as_deref()
    }

    fn get_object(&self, bucket: &str, key: &str) -> ClientFuture<'_, GetObjectOutput> {
        let bucket = bucket.to_string();
        let key = key.to_string();
        Box::pin(async move {
            self.store.count_request();
            let buckets = self.store.buckets.read().await;
            let objects = buckets.get(&bucket).ok_or_else(|| no_such_bucket(&bucket))?;
            let object = objects.get(&key).ok_or_else(|| no_such_key(&key))?;
            Ok(GetObjectOutput {
                body: ByteStream::from(object.data.clone()),
                content_encoding: object.meta.content_encoding.clone(),
            })
        })
    }

    fn head_object(&self, bucket: &str, key: &str) -> ClientFuture<'_, ObjectMeta> {
        let bucket = bucket.to_string();
        let key = key.to_string();
        Box::pin(async move {
            self.store.count_request();
            let buckets = self.store.buckets.read().await;
            let objects = buckets.get(&bucket).ok_or_else(|| no_such_bucket(&bucket))?;
            // HEAD responses have no body, so S3 only reports the status.
            objects
                .get(&key)
                .map(|object| object.meta.clone())
                .ok_or_else(|| ClientError::new("NotFound", "Not Found"))
        })
    }

    fn put_object<'a>(
        &'a self,
        request: PutObjectRequest,
        body: &'a mut dyn ReadSeek,
    ) -> ClientFuture<'a, ()> {
        Box::pin(async move {
            self.store.count_request();
            let mut data = Vec::new();
            body.read_to_end(&mut data)
                .map_err(|e| ClientError::without_code(format!("reading upload body: {e}")))?;

            let meta = ObjectMeta {
                content_length: data.len() as u64,
                content_type: Some(request.content_type),
                content_encoding: request.content_encoding,
                content_disposition: request.content_disposition,
                content_language: request.content_language,
                cache_control: Some(request.cache_control),
                storage_class: Some(request.storage_class.as_str().to_string()),
                server_side_encryption: request.server_side_encryption,
                metadata: request.metadata.into_iter().collect(),
                last_modified: Utc::now(),
                e_tag: None,
            };

            let mut buckets = self.store.buckets.write().await;
            let objects = buckets
                .get_mut(&request.bucket)
                .ok_or_else(|| no_such_bucket(&request.bucket))?;
            objects.insert(
                request.key,
                StoredObject {
                    data: Bytes::from(data),
                    meta,
                },
            );
            Ok(())
        })
    }

    fn delete_object(&self, bucket: &str, key: &str) -> ClientFuture<'_, ()> {
        let bucket = bucket.to_string();
        let key = key.to_string();
        Box::pin(async move {
            self.store.count_request();
            let mut buckets = self.store.buckets.write().await;
            let objects = buckets
                .get_mut(&bucket)
                .ok_or_else(|| no_such_bucket(&bucket))?;
            objects.remove(&key);
            Ok(())
        })
    }

    fn copy_object(
        &self,
        src_bucket: &str,
        src_key: &str,
        dst_bucket: &str,
        dst_key: &str,
    ) -> ClientFuture<'_, ()> {
        let src_bucket = src_bucket.to_string();
        let src_key = src_key.to_string();
        let dst_bucket = dst_bucket.to_string();
        let dst_key = dst_key.to_string();
        Box::pin(async move {
            self.store.count_request();
            let mut buckets = self.store.buckets.write().await;
            let mut object = buckets
                .get(&src_bucket)
                .ok_or_else(|| no_such_bucket(&src_bucket))?
                .get(&src_key)
                .cloned()
                .ok_or_else(|| no_such_key(&src_key))?;
            object.meta.last_modified = Utc::now();
            buckets
                .get_mut(&dst_bucket)
                .ok_or_else(|| no_such_bucket(&dst_bucket))?
                .insert(dst_key, object);
            Ok(())
        })
    }

    fn list_objects(&self, request: ListObjectsRequest) -> ClientFuture<'_, ListObjectsPage> {
        Box::pin(async move {
            self.store.count_request();
            let buckets = self.store.buckets.read().await;
            let objects = buckets
                .get(&request.bucket)
                .ok_or_else(|| no_such_bucket(&request.bucket))?;

            let page_size = self.store.page_size.load(Ordering::SeqCst);
            let limit = match request.max_keys {
                Some(max) => usize::try_from(max).unwrap_or(0).min(page_size),
                None => page_size,
            };
            let start = match request.continuation_token.as_deref() {
                Some(token) => Bound::Excluded(token),
                None => Bound::Unbounded,
            };

            let mut page = ListObjectsPage::default();
            let mut last_key: Option<&str> = None;
            let mut truncated = false;
            for key in objects
                .range::<str, _>((start, Bound::Unbounded))
                .map(|(key, _)| key.as_str())
                .filter(|key| key.starts_with(request.prefix.as_str()))
            {
                let rest = &key[request.prefix.len()..];
                let common_prefix = request.delimiter.as_deref().and_then(|delimiter| {
                    rest.find(delimiter).map(|idx| {
                        format!("{}{}", request.prefix, &rest[..idx + delimiter.len()])
                    })
                });

                // Keys rolled up into the prefix emitted last are consumed silently.
                if common_prefix.is_some() && page.common_prefixes.last() == common_prefix.as_ref()
                {
                    last_key = Some(key);
                    continue;
                }
                if page.keys.len() + page.common_prefixes.len() >= limit {
                    truncated = true;
                    break;
                }
                match common_prefix {
                    Some(prefix) => page.common_prefixes.push(prefix),
                    None => page.keys.push(key.to_string()),
                }
                last_key = Some(key);
            }

            if truncated {
                page.next_continuation_token = last_key.map(str::to_string);
            }
            Ok(page)
        })
    }

    fn presign(&self, request: PresignRequest) -> ClientFuture<'_, String> {
        Box::pin(async move {
            self.store.count_request();
            let base = self.endpoint_url.as_deref().unwrap_or("memory://localhost");
            let mut query = vec![
                format!("x-method={}", request.method.http_method()),
                format!("X-Amz-Expires={}", request.expires_in.as_secs()),
            ];
            for (name, value) in &request.params {
                query.push(format!(
                    "{}={}",
                    query_param_name(name),
                    utf8_percent_encode(value, QUERY_VALUE)
                ));
            }
            Ok(format!(
                "{}/{}/{}?{}",
                base.trim_end_matches('/'),
                request.bucket,
                request.key,
                query.join("&")
            ))
        })
    }
}

/// `ResponseContentDisposition` → `response-content-disposition`.
fn query_param_name(param: &str) -> String {
    let mut name = String::with_capacity(param.len() + 4);
    for (i, c) in param.chars().enumerate() {
        if c.is_ascii_uppercase() {
            if i > 0 {
                name.push('-');
            }
            name.push(c.to_ascii_lowercase());
        } else {
            name.push(c);
        }
    }
    name
}

/// Builds [`MemoryClient`]s, one shared [`MemoryStore`] per endpoint URL.
#[derive(Debug, Default)]
pub struct MemoryClientFactory {
    stores: Mutex<HashMap<Option<String>, Arc<MemoryStore>>>,
    built: AtomicUsize,
}

impl MemoryClientFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// The store behind `endpoint_url`, created on first use.
    pub fn store(&self, endpoint_url: Option<&str>) -> Arc<MemoryStore> {
        let mut stores = self.stores.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(
            stores
                .entry(endpoint_url.map(str::to_string))
                .or_insert_with(|| Arc::new(MemoryStore::new())),
        )
    }

    /// Number of clients built so far.
    pub fn built(&self) -> usize {
        self.built.load(Ordering::SeqCst)
    }
}

impl ClientFactory for MemoryClientFactory {
    fn build<'a>(
        &'a self,
        _settings: &'a Settings,
        endpoint_url: Option<&'a str>,
    ) -> BuildFuture<'a> {
        Box::pin(async move {
            let store = self.store(endpoint_url);
            self.built.fetch_add(1, Ordering::SeqCst);
            let client: Arc<dyn ObjectClient> =
                Arc::new(MemoryClient::new(store, endpoint_url.map(str::to_string)));
            Ok(client)
        })
    }
}

// -- Tests -------------------------------------------------------------------
