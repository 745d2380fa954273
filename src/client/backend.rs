//! Abstract object-store client contract.
//!
//! Every client must implement [`ObjectClient`].  The adapter issues all
//! remote calls through this trait, so it does not care whether the bytes
//! go to AWS, a MinIO endpoint or the in-process [`MemoryClient`].
//!
//! [`MemoryClient`]: super::memory::MemoryClient

use aws_sdk_s3::primitives::ByteStream;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::future::Future;
use std::io::{Read, Seek};
use std::pin::Pin;
use std::str::FromStr;
use std::time::Duration;

use crate::errors::ClientError;

/// Boxed future returned by client calls.
pub type ClientFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, ClientError>> + Send + 'a>>;

/// A seekable byte source that can cross an `.await`.
pub trait ReadSeek: Read + Seek + Send {}

impl<T: Read + Seek + Send> ReadSeek for T {}

/// Object metadata as reported by a HEAD request.
#[derive(Debug, Clone, Serialize)]
pub struct ObjectMeta {
    /// Stored (possibly compressed) length in bytes.
    pub content_length: u64,
    pub content_type: Option<String>,
    pub content_encoding: Option<String>,
    pub content_disposition: Option<String>,
    pub content_language: Option<String>,
    pub cache_control: Option<String>,
    pub storage_class: Option<String>,
    pub server_side_encryption: Option<String>,
    /// User metadata (`x-amz-meta-*`).
    pub metadata: HashMap<String, String>,
    pub last_modified: DateTime<Utc>,
    pub e_tag: Option<String>,
}

/// The body and encoding of a fetched object.
#[derive(Debug)]
pub struct GetObjectOutput {
    pub body: ByteStream,
    pub content_encoding: Option<String>,
}

/// Storage class for uploads.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum StorageClass {
    #[default]
    Standard,
    ReducedRedundancy,
}

impl StorageClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            StorageClass::Standard => "STANDARD",
            StorageClass::ReducedRedundancy => "REDUCED_REDUNDANCY",
        }
    }
}

/// Parameters of a single upload.
#[derive(Debug, Clone, Default)]
pub struct PutObjectRequest {
    pub bucket: String,
    pub key: String,
    pub content_type: String,
    pub content_encoding: Option<String>,
    pub content_disposition: Option<String>,
    pub content_language: Option<String>,
    pub cache_control: String,
    pub metadata: BTreeMap<String, String>,
    pub storage_class: StorageClass,
    pub server_side_encryption: Option<String>,
    pub sse_kms_key_id: Option<String>,
    /// Allow the client to upload parts of a large body concurrently.
    pub use_threads: bool,
}

/// One page of a `ListObjectsV2` call.
#[derive(Debug, Clone, Default)]
pub struct ListObjectsRequest {
    pub bucket: String,
    pub prefix: String,
    pub delimiter: Option<String>,
    pub max_keys: Option<i32>,
    pub continuation_token: Option<String>,
}

/// Keys and common prefixes returned by one listing page.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListObjectsPage {
    pub keys: Vec<String>,
    pub common_prefixes: Vec<String>,
    /// Set when the listing was truncated.
    pub next_continuation_token: Option<String>,
}

/// The operation a presigned URL authorises.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ClientMethod {
    #[default]
    GetObject,
    HeadObject,
    PutObject,
    DeleteObject,
}

impl ClientMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClientMethod::GetObject => "get_object",
            ClientMethod::HeadObject => "head_object",
            ClientMethod::PutObject => "put_object",
            ClientMethod::DeleteObject => "delete_object",
        }
    }

    /// HTTP verb the URL is signed for.
    pub fn http_method(&self) -> &'static str {
        match self {
            ClientMethod::GetObject => "GET",
            ClientMethod::HeadObject => "HEAD",
            ClientMethod::PutObject => "PUT",
            ClientMethod::DeleteObject => "DELETE",
        }
    }

    /// Extra request parameters that may be signed into a URL for this method.
    pub fn supported_params(&self) -> &'static [&'static str] {
        match self {
            ClientMethod::GetObject => &[
                "ResponseCacheControl",
                "ResponseContentDisposition",
                "ResponseContentEncoding",
                "ResponseContentLanguage",
                "ResponseContentType",
                "VersionId",
                "Range",
            ],
            ClientMethod::HeadObject => &["VersionId", "Range"],
            ClientMethod::PutObject => &[
                "CacheControl",
                "ContentDisposition",
                "ContentEncoding",
                "ContentLanguage",
                "ContentType",
            ],
            ClientMethod::DeleteObject => &["VersionId"],
        }
    }
}

impl fmt::Display for ClientMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ClientMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "get_object" | "get" => Ok(ClientMethod::GetObject),
            "head_object" | "head" => Ok(ClientMethod::HeadObject),
            "put_object" | "put" => Ok(ClientMethod::PutObject),
            "delete_object" | "delete" => Ok(ClientMethod::DeleteObject),
            other => Err(format!("unknown client method: {other}")),
        }
    }
}

/// Input to [`ObjectClient::presign`].
#[derive(Debug, Clone)]
pub struct PresignRequest {
    pub method: ClientMethod,
    pub bucket: String,
    pub key: String,
    pub params: BTreeMap<String, String>,
    pub expires_in: Duration,
}

/// Async object-store client contract.
pub trait ObjectClient: Send + Sync + 'static {
    /// Endpoint this client talks to, `None` for the provider default.
    fn endpoint_url(&self) -> Option<&str>;

    /// Fetch an object's body.
    fn get_object(&self, bucket: &str, key: &str) -> ClientFuture<'_, GetObjectOutput>;

    /// Fetch an object's metadata.
    fn head_object(&self, bucket: &str, key: &str) -> ClientFuture<'_, ObjectMeta>;

    /// Upload `body` from its current position to the end.
    ///
    /// The body is borrowed for the duration of the call; the caller keeps
    /// ownership and releases it afterwards.
    fn put_object<'a>(
        &'a self,
        request: PutObjectRequest,
        body: &'a mut dyn ReadSeek,
    ) -> ClientFuture<'a, ()>;

    /// Delete an object.  Deleting a missing key is not an error.
    fn delete_object(&self, bucket: &str, key: &str) -> ClientFuture<'_, ()>;

    /// Server-side copy, keeping the source's metadata.
    fn copy_object(
        &self,
        src_bucket: &str,
        src_key: &str,
        dst_bucket: &str,
        dst_key: &str,
    ) -> ClientFuture<'_, ()>;

    /// Fetch one page of a listing.
    fn list_objects(&self, request: ListObjectsRequest) -> ClientFuture<'_, ListObjectsPage>;

    /// Produce a time-limited signed URL.
    fn presign(&self, request: PresignRequest) -> ClientFuture<'_, String>;
}

// -- Tests -------------------------------------------------------------------
