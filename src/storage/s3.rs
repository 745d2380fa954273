//! S3-backed [`Storage`].
//!
//! An [`S3Storage`] keeps its per-instance overrides and a client factory,
//! plus a snapshot of resolved settings and the scheme → client registry.
//! Every operation takes the current snapshot once and works against it;
//! [`S3Storage::reconfigure`] builds a complete new snapshot before swapping
//! it in, so a call in flight never sees a half-built registry.

use async_trait::async_trait;
use chrono::{Local, NaiveDateTime};
use std::collections::BTreeMap;
use std::future::Future;
use std::io::{Seek, SeekFrom, Write};
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, info, warn};

use super::content::{self, Content};
use super::file::{FileBody, GzipReader, StorageFile};
use super::{Storage, Timestamp};
use crate::client::aws::SdkClientFactory;
use crate::client::backend::{
    ClientMethod, ListObjectsRequest, ObjectClient, ObjectMeta, PresignRequest, PutObjectRequest,
    StorageClass,
};
use crate::config::{Config, Encryption, Settings, SettingsLayer};
use crate::errors::{ClientError, Result, StorageError};
use crate::metrics;
use crate::naming;
use crate::path::{resolve_key, to_storage_path, StorageName};
use crate::registry::{ClientFactory, ClientRegistry};

/// User-metadata key holding the original length of a gzipped object.
pub const UNCOMPRESSED_SIZE_META_KEY: &str = "uncompressed_size";

/// Resolved settings and the clients built from them.
struct Snapshot {
    settings: Arc<Settings>,
    registry: ClientRegistry,
    use_tz: bool,
}

impl Snapshot {
    async fn build(
        overrides: &SettingsLayer,
        config: &Config,
        factory: &dyn ClientFactory,
    ) -> Result<Self> {
        let settings = Settings::resolve(overrides, &config.storage)?;
        let registry = ClientRegistry::build(&settings, factory).await?;
        Ok(Self {
            settings: Arc::new(settings),
            registry,
            use_tz: config.use_tz,
        })
    }
}

struct Inner {
    overrides: SettingsLayer,
    factory: Arc<dyn ClientFactory>,
    snapshot: RwLock<Arc<Snapshot>>,
}

/// File storage over S3-compatible object stores.
///
/// Names are fully qualified: `scheme://bucket/path`.  Cloning is cheap and
/// clones share configuration.
#[derive(Clone)]
pub struct S3Storage {
    inner: Arc<Inner>,
}

/// Client, bucket and key a storage name resolves to.
struct Target {
    client: Arc<dyn ObjectClient>,
    bucket: String,
    key: String,
}

impl S3Storage {
    /// Storage backed by `aws-sdk-s3` clients.
    pub async fn new(overrides: SettingsLayer, config: &Config) -> Result<Self> {
        Self::with_factory(overrides, config, Arc::new(SdkClientFactory)).await
    }

    /// Storage whose clients come from `factory`.
    pub async fn with_factory(
        overrides: SettingsLayer,
        config: &Config,
        factory: Arc<dyn ClientFactory>,
    ) -> Result<Self> {
        let snapshot = Snapshot::build(&overrides, config, factory.as_ref()).await?;
        Ok(Self {
            inner: Arc::new(Inner {
                overrides,
                factory,
                snapshot: RwLock::new(Arc::new(snapshot)),
            }),
        })
    }

    /// Re-resolve settings against `config` and rebuild every client.
    pub async fn reconfigure(&self, config: &Config) -> Result<()> {
        let snapshot =
            Snapshot::build(&self.inner.overrides, config, self.inner.factory.as_ref()).await?;
        let schemes: Vec<String> = snapshot.registry.schemes().map(str::to_string).collect();
        *self
            .inner
            .snapshot
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Arc::new(snapshot);
        info!("S3 storage reconfigured: schemes={:?}", schemes);
        Ok(())
    }

    /// React to a change of process-wide setting `setting`.
    ///
    /// Storage settings and `use_tz` trigger a full rebuild; anything else
    /// is ignored.  Returns whether a rebuild happened.
    pub async fn setting_changed(&self, setting: &str, config: &Config) -> Result<bool> {
        if !SettingsLayer::is_setting_name(setting) && !setting.eq_ignore_ascii_case("use_tz") {
            return Ok(false);
        }
        debug!("Storage setting {} changed, rebuilding clients", setting);
        self.reconfigure(config).await?;
        Ok(true)
    }

    fn snapshot(&self) -> Arc<Snapshot> {
        Arc::clone(
            &self
                .inner
                .snapshot
                .read()
                .unwrap_or_else(PoisonError::into_inner),
        )
    }

    /// Currently resolved settings.
    pub fn settings(&self) -> Arc<Settings> {
        Arc::clone(&self.snapshot().settings)
    }

    /// Data client for `scheme`.
    pub fn client(&self, scheme: &str) -> Result<Arc<dyn ObjectClient>> {
        self.snapshot().registry.client_for(scheme).map(Arc::clone)
    }

    /// Presigning client for `scheme`.
    pub fn presigning_client(&self, scheme: &str) -> Result<Arc<dyn ObjectClient>> {
        self.snapshot()
            .registry
            .presigning_client_for(scheme)
            .map(Arc::clone)
    }

    /// Configured schemes, sorted.
    pub fn schemes(&self) -> Vec<String> {
        self.snapshot()
            .registry
            .schemes()
            .map(str::to_string)
            .collect()
    }

    fn target(snapshot: &Snapshot, name: &str) -> Result<Target> {
        let parsed = StorageName::parse(name)?;
        let client = Arc::clone(snapshot.registry.client_for(&parsed.scheme)?);
        Ok(Target {
            client,
            bucket: parsed.bucket.to_string(),
            key: resolve_key(&snapshot.settings.key_prefix, parsed.path),
        })
    }

    /// Object metadata (a HEAD request).
    pub async fn meta(&self, name: &str) -> Result<ObjectMeta> {
        let snapshot = self.snapshot();
        let target = Self::target(&snapshot, name)?;
        remote(
            "meta",
            name,
            target.client.head_object(&target.bucket, &target.key),
        )
        .await
    }

    /// Server-side copy.  Both names go through the source's client.
    pub async fn copy(&self, src_name: &str, dst_name: &str) -> Result<()> {
        let snapshot = self.snapshot();
        let source = Self::target(&snapshot, src_name)?;
        let dest = Self::target(&snapshot, dst_name)?;
        remote(
            "copy",
            src_name,
            source
                .client
                .copy_object(&source.bucket, &source.key, &dest.bucket, &dest.key),
        )
        .await
    }

    /// Copy then delete.  Not atomic.
    pub async fn rename(&self, src_name: &str, dst_name: &str) -> Result<()> {
        self.copy(src_name, dst_name).await?;
        self.delete(src_name).await
    }

    /// Signed URL for `method` on `name`, with extra request parameters.
    ///
    /// `Bucket` and `Key` in `extra_params` are ignored; any other name the
    /// method does not accept is a usage error.
    pub async fn url_with(
        &self,
        name: &str,
        extra_params: &BTreeMap<String, String>,
        method: ClientMethod,
    ) -> Result<String> {
        let snapshot = self.snapshot();
        let parsed = StorageName::parse(name)?;
        let client = Arc::clone(snapshot.registry.presigning_client_for(&parsed.scheme)?);

        let mut params = BTreeMap::new();
        for (param, value) in extra_params {
            if param == "Bucket" || param == "Key" {
                continue;
            }
            if !method.supported_params().contains(&param.as_str()) {
                return Err(StorageError::Usage(format!(
                    "{param} is not a supported parameter for {method}"
                )));
            }
            params.insert(param.clone(), value.clone());
        }

        let request = PresignRequest {
            method,
            bucket: parsed.bucket.to_string(),
            key: resolve_key(&snapshot.settings.key_prefix, parsed.path),
            params,
            expires_in: snapshot.settings.max_age(),
        };
        remote("url", name, client.presign(request)).await
    }

    /// Last-modified time as naive UTC.
    pub async fn modified_time(&self, name: &str) -> Result<NaiveDateTime> {
        Ok(self.meta(name).await?.last_modified.naive_utc())
    }

    /// Same as [`modified_time`](Self::modified_time); S3 keeps one timestamp.
    pub async fn accessed_time(&self, name: &str) -> Result<NaiveDateTime> {
        self.modified_time(name).await
    }

    /// Same as [`modified_time`](Self::modified_time); S3 keeps one timestamp.
    pub async fn created_time(&self, name: &str) -> Result<NaiveDateTime> {
        self.modified_time(name).await
    }

    async fn timestamp(&self, name: &str) -> Result<Timestamp> {
        let use_tz = self.snapshot().use_tz;
        let last_modified = self.meta(name).await?.last_modified;
        Ok(if use_tz {
            Timestamp::Aware(last_modified)
        } else {
            Timestamp::Naive(last_modified.with_timezone(&Local).naive_local())
        })
    }

    /// Download `name` into a local buffer.
    pub(crate) async fn download(&self, name: &str) -> Result<FileBody> {
        let snapshot = self.snapshot();
        let target = Self::target(&snapshot, name)?;
        let output = remote(
            "open",
            name,
            target.client.get_object(&target.bucket, &target.key),
        )
        .await?;

        let mut file = content::new_temporary_file();
        let mut body = output.body;
        let mut downloaded = 0u64;
        while let Some(chunk) = body.try_next().await.map_err(|e| StorageError::Io {
            operation: "open",
            name: name.to_string(),
            message: e.to_string(),
        })? {
            file.write_all(&chunk)?;
            downloaded += chunk.len() as u64;
        }
        metrics::record_bytes_downloaded(downloaded);
        file.seek(SeekFrom::Start(0))?;

        debug!(
            "Downloaded {} ({} bytes, encoding={:?})",
            name, downloaded, output.content_encoding
        );
        Ok(match output.content_encoding.as_deref() {
            Some("gzip") => FileBody::Gzip(GzipReader::new(file)),
            _ => FileBody::Plain(file),
        })
    }

    /// List with `max_keys = 1` under `name`'s key as a directory.
    ///
    /// Listing failures are logged and reported as "does not exist".
    async fn directory_exists(&self, name: &str) -> Result<bool> {
        let snapshot = self.snapshot();
        let target = Self::target(&snapshot, name)?;
        let request = ListObjectsRequest {
            bucket: target.bucket,
            prefix: dir_prefix(&target.key),
            delimiter: None,
            max_keys: Some(1),
            continuation_token: None,
        };
        match remote("exists", name, target.client.list_objects(request)).await {
            Ok(page) => Ok(!page.keys.is_empty()),
            Err(err) => {
                warn!("Directory probe for {} failed: {}", name, err);
                Ok(false)
            }
        }
    }
}

#[async_trait]
impl Storage for S3Storage {
    type File = StorageFile;

    /// Only `"rb"` is supported; other modes fail before any remote call.
    async fn open(&self, name: &str, mode: &str) -> Result<StorageFile> {
        if mode != "rb" {
            return Err(StorageError::Usage(format!(
                "S3 files can only be opened in read-only mode, not {mode:?}"
            )));
        }
        let body = self.download(name).await?;
        Ok(StorageFile::new(name, self.clone(), body))
    }

    async fn save_content(&self, name: &str, content: Content<'_>) -> Result<String> {
        let snapshot = self.snapshot();
        let target = Self::target(&snapshot, name)?;
        let settings = &snapshot.settings;

        let content_type = content::content_type_for(name);
        let compress = settings.gzip && content::is_compressible(&content_type);
        let mut prepared = content::prepare_upload(content, compress)?;

        let mut request = put_request(settings, &target.bucket, &target.key, name, content_type);
        if let Some(size) = prepared.uncompressed_size {
            request.content_encoding = Some("gzip".to_string());
            request
                .metadata
                .insert(UNCOMPRESSED_SIZE_META_KEY.to_string(), size.to_string());
            metrics::record_gzip_save();
        }

        debug!(
            "Saving {} to {}/{} (type={} gzip={})",
            name,
            target.bucket,
            target.key,
            request.content_type,
            request.content_encoding.is_some()
        );
        remote(
            "save",
            name,
            target.client.put_object(request, prepared.body.as_reader()),
        )
        .await?;
        metrics::record_bytes_uploaded(prepared.body.as_reader().stream_position()?);
        Ok(name.to_string())
    }

    async fn delete(&self, name: &str) -> Result<()> {
        let snapshot = self.snapshot();
        let target = Self::target(&snapshot, name)?;
        remote(
            "delete",
            name,
            target.client.delete_object(&target.bucket, &target.key),
        )
        .await
    }

    /// A name ending in `/` is probed as a directory.  Otherwise the object
    /// is looked up, falling back to a directory probe only when it is not
    /// found.
    async fn exists(&self, name: &str) -> Result<bool> {
        let name = to_storage_path(name);
        if name.ends_with('/') {
            return self.directory_exists(&name).await;
        }
        match self.meta(&name).await {
            Ok(_) => Ok(true),
            Err(err) if err.is_not_found() => self.directory_exists(&format!("{name}/")).await,
            Err(err) => Err(err),
        }
    }

    async fn listdir(&self, path: &str) -> Result<(Vec<String>, Vec<String>)> {
        let snapshot = self.snapshot();
        let target = Self::target(&snapshot, path)?;
        let prefix = dir_prefix(&target.key);

        let mut dirs = Vec::new();
        let mut files = Vec::new();
        let mut continuation_token: Option<String> = None;
        loop {
            let request = ListObjectsRequest {
                bucket: target.bucket.clone(),
                prefix: prefix.clone(),
                delimiter: Some("/".to_string()),
                max_keys: None,
                continuation_token: continuation_token.take(),
            };
            let page = remote("listdir", path, target.client.list_objects(request)).await?;
            files.extend(page.keys.iter().filter_map(|key| relative(key, &prefix)));
            dirs.extend(
                page.common_prefixes
                    .iter()
                    .filter_map(|common| relative(common, &prefix)),
            );
            match page.next_continuation_token {
                Some(token) => continuation_token = Some(token),
                None => break,
            }
        }
        Ok((dirs, files))
    }

    /// Logical size: the stashed original length for gzipped objects.
    async fn size(&self, name: &str) -> Result<u64> {
        let meta = self.meta(name).await?;
        if meta.content_encoding.as_deref() == Some("gzip") {
            if let Some(raw) = meta.metadata.get(UNCOMPRESSED_SIZE_META_KEY) {
                return raw.parse().map_err(|_| StorageError::Io {
                    operation: "size",
                    name: name.to_string(),
                    message: format!("invalid {UNCOMPRESSED_SIZE_META_KEY} metadata {raw:?}"),
                });
            }
        }
        Ok(meta.content_length)
    }

    async fn url(&self, name: &str) -> Result<String> {
        self.url_with(name, &BTreeMap::new(), ClientMethod::GetObject)
            .await
    }

    async fn get_modified_time(&self, name: &str) -> Result<Timestamp> {
        self.timestamp(name).await
    }

    async fn get_accessed_time(&self, name: &str) -> Result<Timestamp> {
        self.timestamp(name).await
    }

    async fn get_created_time(&self, name: &str) -> Result<Timestamp> {
        self.timestamp(name).await
    }

    /// With `file_overwrite` every name is available.
    async fn get_available_name(&self, name: &str, max_length: Option<usize>) -> Result<String> {
        let name = to_storage_path(name);
        if self.settings().file_overwrite {
            return Ok(name);
        }
        naming::available_name(self, &name, max_length).await
    }

    /// Applied to the path of a `scheme://bucket/path` name.
    fn generate_filename(&self, filename: &str) -> Result<String> {
        let filename = to_storage_path(filename);
        match StorageName::parse(&filename) {
            Ok(parsed) => {
                let path = naming::generate_filename(parsed.path, |n| self.get_valid_name(n))?;
                Ok(parsed.with_path(&path))
            }
            Err(_) => naming::generate_filename(&filename, |n| self.get_valid_name(n)),
        }
    }
}

// -- Helpers -----------------------------------------------------------------

/// Await a client call, record it, and translate its error.
async fn remote<T>(
    operation: &'static str,
    name: &str,
    call: impl Future<Output = Result<T, ClientError>>,
) -> Result<T> {
    let result = call.await;
    metrics::record_operation(operation, result.is_ok());
    result.map_err(|err| {
        debug!("S3 {} failed for {}: {} ({})", operation, name, err, err.code());
        StorageError::from_client(operation, name, err)
    })
}

/// Upload parameters for `name` from the settings.
fn put_request(
    settings: &Settings,
    bucket: &str,
    key: &str,
    name: &str,
    content_type: String,
) -> PutObjectRequest {
    let non_empty = |value: String| Some(value).filter(|v| !v.is_empty());
    let sse_kms_key_id = match &settings.encrypt_key {
        Encryption::Algorithm(_) if !settings.kms_encryption_key_id.is_empty() => {
            Some(settings.kms_encryption_key_id.clone())
        }
        _ => None,
    };

    PutObjectRequest {
        bucket: bucket.to_string(),
        key: key.to_string(),
        content_type,
        content_encoding: None,
        content_disposition: non_empty(settings.content_disposition.resolve(name)),
        content_language: non_empty(settings.content_language.resolve(name)),
        cache_control: settings.cache_control(),
        metadata: settings
            .metadata
            .iter()
            .map(|(key, value)| (key.clone(), value.resolve(name)))
            .collect(),
        storage_class: if settings.reduced_redundancy {
            StorageClass::ReducedRedundancy
        } else {
            StorageClass::Standard
        },
        server_side_encryption: settings.encrypt_key.algorithm().map(str::to_string),
        sse_kms_key_id,
        use_threads: settings.use_threads,
    }
}

/// Listing prefix for a key treated as a directory.  The root is `""`.
fn dir_prefix(key: &str) -> String {
    if key == "." {
        String::new()
    } else {
        format!("{key}/")
    }
}

/// `entry` relative to `prefix`, without a trailing `/`.  Empty results
/// (directory marker objects) are skipped.
fn relative(entry: &str, prefix: &str) -> Option<String> {
    let rel = entry
        .strip_prefix(prefix)
        .unwrap_or(entry)
        .trim_end_matches('/');
    (!rel.is_empty()).then(|| rel.to_string())
}

// -- Tests -------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::memory::MemoryClientFactory;
    use crate::config::{Endpoints, SettingValue};
    use std::io::{Cursor, Read};

    const BUCKET: &str = "test-bucket";

    fn name(path: &str) -> String {
        format!("s3://{BUCKET}/{path}")
    }

    async fn storage_with(
        overrides: SettingsLayer,
        config: Config,
    ) -> (S3Storage, Arc<MemoryClientFactory>) {
        let factory = Arc::new(MemoryClientFactory::new());
        factory.store(None).create_bucket(BUCKET).await;
        let storage = S3Storage::with_factory(overrides, &config, factory.clone())
            .await
            .unwrap();
        (storage, factory)
    }

    async fn test_storage() -> (S3Storage, Arc<MemoryClientFactory>) {
        storage_with(SettingsLayer::default(), Config::default()).await
    }

    async fn save_bytes(storage: &S3Storage, path: &str, data: &[u8]) {
        let mut content = Cursor::new(data.to_vec());
        storage
            .save_content(&name(path), Content::Bytes(&mut content))
            .await
            .unwrap();
    }

    async fn read_back(storage: &S3Storage, path: &str) -> Vec<u8> {
        let mut file = storage.open(&name(path), "rb").await.unwrap();
        let mut out = Vec::new();
        file.read_to_end(&mut out).unwrap();
        out
    }

    fn sorted(mut items: Vec<String>) -> Vec<String> {
        items.sort();
        items
    }

    // -- save / open ----------------------------------------------------------

    #[tokio::test]
    async fn test_save_and_open_compressed() {
        let (storage, factory) = test_storage().await;
        let data = b"foo".repeat(1000);
        save_bytes(&storage, "foo/bar.txt", &data).await;

        let raw = factory
            .store(None)
            .raw_object(BUCKET, "foo/bar.txt")
            .await
            .unwrap();
        assert!(raw.len() < data.len());

        let meta = storage.meta(&name("foo/bar.txt")).await.unwrap();
        assert_eq!(meta.content_encoding.as_deref(), Some("gzip"));
        assert_eq!(meta.content_type.as_deref(), Some("text/plain"));
        assert_eq!(
            meta.metadata.get(UNCOMPRESSED_SIZE_META_KEY).map(String::as_str),
            Some("3000")
        );
        assert_eq!(storage.size(&name("foo/bar.txt")).await.unwrap(), 3000);
        assert_eq!(read_back(&storage, "foo/bar.txt").await, data);
    }

    #[tokio::test]
    async fn test_save_small_content_uncompressed() {
        let (storage, _factory) = test_storage().await;
        save_bytes(&storage, "foo.txt", b"foo").await;

        let meta = storage.meta(&name("foo.txt")).await.unwrap();
        assert_eq!(meta.content_encoding, None);
        assert!(!meta.metadata.contains_key(UNCOMPRESSED_SIZE_META_KEY));
        assert_eq!(storage.size(&name("foo.txt")).await.unwrap(), 3);
        assert_eq!(read_back(&storage, "foo.txt").await, b"foo");
    }

    #[tokio::test]
    async fn test_save_gzip_disabled() {
        let overrides = SettingsLayer {
            gzip: Some(false),
            ..Default::default()
        };
        let (storage, _factory) = storage_with(overrides, Config::default()).await;
        save_bytes(&storage, "foo.txt", &b"foo".repeat(1000)).await;

        let meta = storage.meta(&name("foo.txt")).await.unwrap();
        assert_eq!(meta.content_encoding, None);
        assert_eq!(meta.content_length, 3000);
    }

    #[tokio::test]
    async fn test_save_binary_type_uncompressed() {
        let (storage, _factory) = test_storage().await;
        save_bytes(&storage, "image.png", &[0u8; 4096]).await;

        let meta = storage.meta(&name("image.png")).await.unwrap();
        assert_eq!(meta.content_type.as_deref(), Some("image/png"));
        assert_eq!(meta.content_encoding, None);
    }

    #[tokio::test]
    async fn test_save_unknown_extension_is_octet_stream() {
        let (storage, _factory) = test_storage().await;
        save_bytes(&storage, "blob", b"data").await;
        let meta = storage.meta(&name("blob")).await.unwrap();
        assert_eq!(
            meta.content_type.as_deref(),
            Some(content::DEFAULT_CONTENT_TYPE)
        );
    }

    #[tokio::test]
    async fn test_save_text_content() {
        let (storage, _factory) = test_storage().await;
        let mut text = content::TextContent::new("héllo wörld");
        let saved = storage
            .save_content(&name("greeting.txt"), Content::Text(&mut text))
            .await
            .unwrap();
        assert_eq!(saved, name("greeting.txt"));
        assert_eq!(
            read_back(&storage, "greeting.txt").await,
            "héllo wörld".as_bytes()
        );
    }

    #[tokio::test]
    async fn test_save_rewinds_content() {
        let (storage, _factory) = test_storage().await;
        let mut content = Cursor::new(b"rewound".to_vec());
        content.seek(SeekFrom::End(0)).unwrap();
        storage
            .save_content(&name("r.bin"), Content::Bytes(&mut content))
            .await
            .unwrap();
        assert_eq!(read_back(&storage, "r.bin").await, b"rewound");
    }

    #[tokio::test]
    async fn test_save_put_params() {
        let overrides = SettingsLayer {
            content_disposition: Some(SettingValue::computed(|n| {
                format!("attachment; filename={}", n.rsplit('/').next().unwrap_or(n))
            })),
            content_language: Some("en".into()),
            metadata: Some(BTreeMap::from([("owner".to_string(), "web".into())])),
            reduced_redundancy: Some(true),
            encrypt_key: Some(Encryption::Aes256),
            max_age_seconds: Some(60),
            ..Default::default()
        };
        let (storage, _factory) = storage_with(overrides, Config::default()).await;
        save_bytes(&storage, "docs/report.pdf", b"%PDF").await;

        let meta = storage.meta(&name("docs/report.pdf")).await.unwrap();
        assert_eq!(
            meta.content_disposition.as_deref(),
            Some("attachment; filename=report.pdf")
        );
        assert_eq!(meta.content_language.as_deref(), Some("en"));
        assert_eq!(meta.cache_control.as_deref(), Some("private,max-age=60"));
        assert_eq!(meta.storage_class.as_deref(), Some("REDUCED_REDUNDANCY"));
        assert_eq!(meta.server_side_encryption.as_deref(), Some("AES256"));
        assert_eq!(meta.metadata.get("owner").map(String::as_str), Some("web"));
    }

    #[test]
    fn test_put_request_defaults() {
        let request = put_request(
            &Settings::default(),
            "b",
            "k.txt",
            "s3://b/k.txt",
            "text/plain".into(),
        );
        assert_eq!(request.cache_control, "private,max-age=3600");
        assert_eq!(request.storage_class, StorageClass::Standard);
        assert_eq!(request.content_disposition, None);
        assert_eq!(request.content_language, None);
        assert_eq!(request.server_side_encryption, None);
        assert_eq!(request.sse_kms_key_id, None);
        assert!(request.metadata.is_empty());
        assert!(request.use_threads);
    }

    #[test]
    fn test_put_request_kms() {
        let settings = Settings {
            encrypt_key: Encryption::Algorithm("aws:kms".into()),
            kms_encryption_key_id: "key-1".into(),
            metadata: BTreeMap::from([(
                "source".to_string(),
                SettingValue::computed(|n| n.to_uppercase()),
            )]),
            ..Settings::default()
        };
        let request = put_request(&settings, "b", "k", "s3://b/k", "text/plain".into());
        assert_eq!(request.server_side_encryption.as_deref(), Some("aws:kms"));
        assert_eq!(request.sse_kms_key_id.as_deref(), Some("key-1"));
        assert_eq!(request.metadata["source"], "S3://B/K");

        // A key id without a named algorithm is not sent.
        let settings = Settings {
            encrypt_key: Encryption::Aes256,
            kms_encryption_key_id: "key-1".into(),
            ..Settings::default()
        };
        let request = put_request(&settings, "b", "k", "s3://b/k", "text/plain".into());
        assert_eq!(request.server_side_encryption.as_deref(), Some("AES256"));
        assert_eq!(request.sse_kms_key_id, None);
    }

    #[tokio::test]
    async fn test_open_rejects_write_mode_before_remote_call() {
        let (storage, factory) = test_storage().await;
        for mode in ["wb", "w", "r+b", "ab"] {
            let err = storage.open(&name("foo.txt"), mode).await.err().unwrap();
            assert!(matches!(err, StorageError::Usage(_)), "{mode}");
        }
        assert_eq!(factory.store(None).requests(), 0);
    }

    #[tokio::test]
    async fn test_open_missing_is_not_found() {
        let (storage, _factory) = test_storage().await;
        let err = storage.open(&name("nope.txt"), "rb").await.err().unwrap();
        assert!(err.is_not_found());
        assert!(err.to_string().contains("nope.txt"));
    }

    #[tokio::test]
    async fn test_reopen_fetches_fresh_content() {
        let (storage, _factory) = test_storage().await;
        save_bytes(&storage, "foo.txt", b"foo").await;

        let mut file = storage.open(&name("foo.txt"), "rb").await.unwrap();
        let mut out = Vec::new();
        file.read_to_end(&mut out).unwrap();
        assert_eq!(out, b"foo");

        // Reopening an open handle rewinds it.
        file.open().await.unwrap();
        out.clear();
        file.read_to_end(&mut out).unwrap();
        assert_eq!(out, b"foo");

        file.close();
        assert!(file.is_closed());
        assert!(file.read(&mut [0u8; 4]).is_err());

        save_bytes(&storage, "foo.txt", b"bar").await;
        file.open().await.unwrap();
        out.clear();
        file.read_to_end(&mut out).unwrap();
        assert_eq!(out, b"bar");
        assert_eq!(file.name(), name("foo.txt"));
    }

    // -- delete / copy / rename -----------------------------------------------

    #[tokio::test]
    async fn test_delete() {
        let (storage, _factory) = test_storage().await;
        save_bytes(&storage, "foo.txt", b"foo").await;
        storage.delete(&name("foo.txt")).await.unwrap();
        assert!(!storage.exists(&name("foo.txt")).await.unwrap());
        // Deleting again is not an error.
        storage.delete(&name("foo.txt")).await.unwrap();
    }

    #[tokio::test]
    async fn test_copy_and_rename() {
        let (storage, _factory) = test_storage().await;
        save_bytes(&storage, "foo.txt", b"foo").await;

        storage
            .copy(&name("foo.txt"), &name("copy/foo.txt"))
            .await
            .unwrap();
        assert!(storage.exists(&name("foo.txt")).await.unwrap());
        assert_eq!(read_back(&storage, "copy/foo.txt").await, b"foo");

        storage
            .rename(&name("foo.txt"), &name("moved.txt"))
            .await
            .unwrap();
        assert!(!storage.exists(&name("foo.txt")).await.unwrap());
        assert_eq!(read_back(&storage, "moved.txt").await, b"foo");
    }

    #[tokio::test]
    async fn test_copy_missing_source_is_not_found() {
        let (storage, _factory) = test_storage().await;
        let err = storage
            .copy(&name("nope.txt"), &name("dst.txt"))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    // -- exists ---------------------------------------------------------------

    #[tokio::test]
    async fn test_exists() {
        let (storage, _factory) = test_storage().await;
        save_bytes(&storage, "foo/bar.txt", b"foo").await;

        assert!(storage.exists(&name("foo/bar.txt")).await.unwrap());
        assert!(storage.exists(&name("foo/")).await.unwrap());
        assert!(storage.exists(&name("foo")).await.unwrap());
        assert!(storage.exists(&name("a/../foo/bar.txt")).await.unwrap());
        assert!(!storage.exists(&name("fo")).await.unwrap());
        assert!(!storage.exists(&name("nope.txt")).await.unwrap());
        assert!(!storage.exists(&name("nope/")).await.unwrap());
    }

    #[tokio::test]
    async fn test_directory_probe_on_missing_bucket_is_false() {
        let (storage, _factory) = test_storage().await;
        assert!(!storage.exists("s3://missing-bucket/dir/").await.unwrap());
    }

    #[tokio::test]
    async fn test_file_probe_propagates_other_errors() {
        let (storage, _factory) = test_storage().await;
        let err = storage
            .exists("s3://missing-bucket/foo.txt")
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Io { operation: "meta", .. }));
    }

    #[tokio::test]
    async fn test_unqualified_name_is_rejected() {
        let (storage, factory) = test_storage().await;
        let err = storage.exists("foo.txt").await.unwrap_err();
        assert!(matches!(err, StorageError::InvalidName(_)));
        assert_eq!(factory.store(None).requests(), 0);
    }

    #[tokio::test]
    async fn test_unknown_scheme() {
        let (storage, _factory) = test_storage().await;
        let err = storage.size("gs://bucket/foo.txt").await.unwrap_err();
        assert!(matches!(err, StorageError::UnknownScheme(_)));
    }

    // -- listdir --------------------------------------------------------------

    #[tokio::test]
    async fn test_listdir() {
        let (storage, _factory) = test_storage().await;
        let (dirs, files) = storage.listdir(&name("")).await.unwrap();
        assert!(dirs.is_empty());
        assert!(files.is_empty());

        save_bytes(&storage, "foo.txt", b"foo").await;
        save_bytes(&storage, "bar/bat.txt", b"bat").await;

        let (dirs, files) = storage.listdir(&name("")).await.unwrap();
        assert_eq!(dirs, vec!["bar"]);
        assert_eq!(files, vec!["foo.txt"]);

        for path in ["bar", "bar/"] {
            let (dirs, files) = storage.listdir(&name(path)).await.unwrap();
            assert!(dirs.is_empty(), "{path}");
            assert_eq!(files, vec!["bat.txt"], "{path}");
        }
    }

    #[tokio::test]
    async fn test_listdir_across_pages() {
        let (storage, factory) = test_storage().await;
        factory.store(None).set_page_size(2);
        for path in ["a.txt", "b.txt", "c.txt", "d/1.txt", "d/2.txt", "e/1.txt"] {
            save_bytes(&storage, path, b"x").await;
        }
        let (dirs, files) = storage.listdir(&name("")).await.unwrap();
        assert_eq!(sorted(dirs), vec!["d", "e"]);
        assert_eq!(sorted(files), vec!["a.txt", "b.txt", "c.txt"]);
    }

    #[tokio::test]
    async fn test_key_prefix() {
        let overrides = SettingsLayer {
            key_prefix: Some("media".into()),
            ..Default::default()
        };
        let (storage, factory) = storage_with(overrides, Config::default()).await;
        save_bytes(&storage, "foo.txt", b"foo").await;

        assert!(factory
            .store(None)
            .raw_object(BUCKET, "media/foo.txt")
            .await
            .is_some());
        let (dirs, files) = storage.listdir(&name("")).await.unwrap();
        assert!(dirs.is_empty());
        assert_eq!(files, vec!["foo.txt"]);
        assert!(storage.exists(&name("foo.txt")).await.unwrap());
        assert_eq!(read_back(&storage, "foo.txt").await, b"foo");
    }

    // -- url ------------------------------------------------------------------

    #[tokio::test]
    async fn test_url() {
        let (storage, _factory) = test_storage().await;
        let url = storage.url(&name("foo.txt")).await.unwrap();
        assert!(url.contains("/test-bucket/foo.txt?"));
        assert!(url.contains("X-Amz-Expires=3600"));
        assert!(url.contains("x-method=GET"));
    }

    #[tokio::test]
    async fn test_url_extra_params() {
        let (storage, _factory) = test_storage().await;
        let extra = BTreeMap::from([
            (
                "ResponseContentDisposition".to_string(),
                "attachment".to_string(),
            ),
            ("Key".to_string(), "ignored".to_string()),
        ]);
        let url = storage
            .url_with(&name("foo.txt"), &extra, ClientMethod::GetObject)
            .await
            .unwrap();
        assert!(url.contains("response-content-disposition=attachment"));
        assert!(url.contains("/test-bucket/foo.txt?"));
        assert!(!url.contains("ignored"));

        let url = storage
            .url_with(&name("foo.txt"), &BTreeMap::new(), ClientMethod::PutObject)
            .await
            .unwrap();
        assert!(url.contains("x-method=PUT"));
    }

    #[tokio::test]
    async fn test_url_rejects_unsupported_param() {
        let (storage, factory) = test_storage().await;
        let extra = BTreeMap::from([("ResponseContentType".to_string(), "x".to_string())]);
        let err = storage
            .url_with(&name("foo.txt"), &extra, ClientMethod::DeleteObject)
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Usage(_)));
        assert_eq!(factory.store(None).requests(), 0);
    }

    #[tokio::test]
    async fn test_url_uses_presigning_endpoint() {
        let config = Config {
            storage: SettingsLayer {
                endpoints: Some(BTreeMap::from([(
                    "s3".to_string(),
                    Endpoints::with_presigning("http://localhost:9000", "http://example.com:9000"),
                )])),
                ..Default::default()
            },
            ..Config::default()
        };
        let factory = Arc::new(MemoryClientFactory::new());
        let storage = S3Storage::with_factory(SettingsLayer::default(), &config, factory.clone())
            .await
            .unwrap();
        let url = storage.url(&name("foo.txt")).await.unwrap();
        assert!(url.starts_with("http://example.com:9000/test-bucket/foo.txt?"));
    }

    // -- timestamps -----------------------------------------------------------

    #[tokio::test]
    async fn test_timestamps_aware() {
        let (storage, _factory) = test_storage().await;
        save_bytes(&storage, "foo.txt", b"foo").await;
        let meta = storage.meta(&name("foo.txt")).await.unwrap();

        let modified = storage.get_modified_time(&name("foo.txt")).await.unwrap();
        assert_eq!(modified, Timestamp::Aware(meta.last_modified));
        assert_eq!(
            storage.get_accessed_time(&name("foo.txt")).await.unwrap(),
            modified
        );
        assert_eq!(
            storage.get_created_time(&name("foo.txt")).await.unwrap(),
            modified
        );

        let naive = storage.modified_time(&name("foo.txt")).await.unwrap();
        assert_eq!(naive, meta.last_modified.naive_utc());
        assert_eq!(storage.accessed_time(&name("foo.txt")).await.unwrap(), naive);
        assert_eq!(storage.created_time(&name("foo.txt")).await.unwrap(), naive);
    }

    #[tokio::test]
    async fn test_timestamps_naive_without_tz() {
        let config = Config {
            use_tz: false,
            ..Config::default()
        };
        let (storage, _factory) = storage_with(SettingsLayer::default(), config).await;
        save_bytes(&storage, "foo.txt", b"foo").await;
        let meta = storage.meta(&name("foo.txt")).await.unwrap();

        let modified = storage.get_modified_time(&name("foo.txt")).await.unwrap();
        assert!(!modified.is_aware());
        assert_eq!(
            modified,
            Timestamp::Naive(meta.last_modified.with_timezone(&Local).naive_local())
        );
    }

    #[tokio::test]
    async fn test_timestamp_of_missing_file() {
        let (storage, _factory) = test_storage().await;
        let err = storage
            .get_modified_time(&name("nope.txt"))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    // -- naming ---------------------------------------------------------------

    #[tokio::test]
    async fn test_available_name_for_taken_name() {
        let (storage, _factory) = test_storage().await;
        assert_eq!(
            storage
                .get_available_name(&name("dir/foo.txt"), None)
                .await
                .unwrap(),
            name("dir/foo.txt")
        );

        save_bytes(&storage, "dir/foo.txt", b"foo").await;
        let available = storage
            .get_available_name(&name("dir/foo.txt"), None)
            .await
            .unwrap();
        assert_ne!(available, name("dir/foo.txt"));
        assert!(available.starts_with(&name("dir/foo_")));
        assert!(available.ends_with(".txt"));
    }

    #[tokio::test]
    async fn test_available_name_max_length() {
        let (storage, _factory) = test_storage().await;
        save_bytes(&storage, "longfilename.txt", b"x").await;
        let max = name("longfilename.txt").len();
        let available = storage
            .get_available_name(&name("longfilename.txt"), Some(max))
            .await
            .unwrap();
        assert!(available.len() <= max);
        assert!(available.starts_with(&name("long")));

        save_bytes(&storage, "a.txt", b"x").await;
        let err = storage
            .get_available_name(&name("a.txt"), Some(name("a.txt").len()))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::InvalidName(_)));
    }

    #[tokio::test]
    async fn test_file_overwrite() {
        let overrides = SettingsLayer {
            file_overwrite: Some(true),
            ..Default::default()
        };
        let (storage, _factory) = storage_with(overrides, Config::default()).await;
        save_bytes(&storage, "foo.txt", b"foo").await;
        assert_eq!(
            storage
                .get_available_name(&name("foo.txt"), None)
                .await
                .unwrap(),
            name("foo.txt")
        );

        let mut content = Cursor::new(b"bar".to_vec());
        let saved = storage
            .save(&name("foo.txt"), Content::Bytes(&mut content), None)
            .await
            .unwrap();
        assert_eq!(saved, name("foo.txt"));
        assert_eq!(read_back(&storage, "foo.txt").await, b"bar");
    }

    #[tokio::test]
    async fn test_save_picks_free_name() {
        let (storage, _factory) = test_storage().await;
        save_bytes(&storage, "foo.txt", b"foo").await;

        let mut content = Cursor::new(b"bar".to_vec());
        let saved = storage
            .save(&name("foo.txt"), Content::Bytes(&mut content), None)
            .await
            .unwrap();
        assert_ne!(saved, name("foo.txt"));
        assert_eq!(read_back(&storage, "foo.txt").await, b"foo");
        let rel = saved.strip_prefix(&name("")).unwrap();
        assert_eq!(read_back(&storage, rel).await, b"bar");
    }

    #[tokio::test]
    async fn test_generate_filename() {
        let (storage, _factory) = test_storage().await;
        assert_eq!(
            storage
                .generate_filename(&name("dir/my file?.txt"))
                .unwrap(),
            name("dir/my_file.txt")
        );
        assert_eq!(
            storage.generate_filename("plain/a b.txt").unwrap(),
            "plain/a_b.txt"
        );
        assert!(storage.generate_filename(&name("../x.txt")).is_err());
    }

    // -- configuration --------------------------------------------------------

    #[tokio::test]
    async fn test_unknown_override_fails_without_building_clients() {
        let factory = Arc::new(MemoryClientFactory::new());
        let result = async {
            let overrides = SettingsLayer::from_pairs([("aws_s3_bucket_auth", false.into())])?;
            S3Storage::with_factory(overrides, &Config::default(), factory.clone()).await
        }
        .await;
        assert!(matches!(result, Err(StorageError::Config(_))));
        assert_eq!(factory.built(), 0);
    }

    #[tokio::test]
    async fn test_invalid_setting_fails_without_building_clients() {
        let factory = Arc::new(MemoryClientFactory::new());
        let overrides = SettingsLayer {
            signature_version: Some("s3".into()),
            ..Default::default()
        };
        let result = S3Storage::with_factory(overrides, &Config::default(), factory.clone()).await;
        assert!(matches!(result, Err(StorageError::Config(_))));
        assert_eq!(factory.built(), 0);
    }

    #[tokio::test]
    async fn test_instance_override_beats_config() {
        let config = Config {
            storage: SettingsLayer {
                content_language: Some("foo".into()),
                max_age_seconds: Some(10),
                ..Default::default()
            },
            ..Config::default()
        };
        let overrides = SettingsLayer {
            content_language: Some("bar".into()),
            ..Default::default()
        };
        let (storage, _factory) = storage_with(overrides, config).await;
        let settings = storage.settings();
        assert_eq!(settings.content_language.resolve("x"), "bar");
        assert_eq!(settings.max_age_seconds, 10);
    }

    #[tokio::test]
    async fn test_setting_changed_rebuilds_clients() {
        let (storage, factory) = test_storage().await;
        save_bytes(&storage, "foo.txt", b"foo").await;
        let before = storage.client("s3").unwrap();
        assert_eq!(factory.built(), 1);

        assert!(!storage
            .setting_changed("SOME_OTHER_SETTING", &Config::default())
            .await
            .unwrap());
        assert_eq!(factory.built(), 1);
        assert!(Arc::ptr_eq(&before, &storage.client("s3").unwrap()));

        let config = Config {
            storage: SettingsLayer {
                endpoints: Some(BTreeMap::from([
                    ("s3".to_string(), Endpoints::default()),
                    ("s3-other".to_string(), Endpoints::new("http://other:9000")),
                ])),
                ..Default::default()
            },
            ..Config::default()
        };
        assert!(storage
            .setting_changed("AWS_S3_ENDPOINTS", &config)
            .await
            .unwrap());
        assert_eq!(factory.built(), 3);
        assert!(!Arc::ptr_eq(&before, &storage.client("s3").unwrap()));
        assert_eq!(storage.schemes(), vec!["s3", "s3-other"]);
        assert_eq!(
            storage.presigning_client("s3-other").unwrap().endpoint_url(),
            Some("http://other:9000")
        );

        // The new client sees the same bucket.
        assert!(storage.exists(&name("foo.txt")).await.unwrap());
    }

    #[tokio::test]
    async fn test_use_tz_change_applies_after_reconfigure() {
        let (storage, _factory) = test_storage().await;
        save_bytes(&storage, "foo.txt", b"foo").await;
        assert!(storage
            .get_modified_time(&name("foo.txt"))
            .await
            .unwrap()
            .is_aware());

        let config = Config {
            use_tz: false,
            ..Config::default()
        };
        assert!(storage.setting_changed("USE_TZ", &config).await.unwrap());
        assert!(!storage
            .get_modified_time(&name("foo.txt"))
            .await
            .unwrap()
            .is_aware());
    }

    #[tokio::test]
    async fn test_schemes_route_to_their_endpoints() {
        let config = Config {
            storage: SettingsLayer {
                endpoints: Some(BTreeMap::from([
                    ("s3".to_string(), Endpoints::default()),
                    ("s3-other".to_string(), Endpoints::new("http://other:9000")),
                ])),
                ..Default::default()
            },
            ..Config::default()
        };
        let (storage, factory) = storage_with(SettingsLayer::default(), config).await;
        let other = factory.store(Some("http://other:9000"));
        other.create_bucket(BUCKET).await;

        let mut content = Cursor::new(b"elsewhere".to_vec());
        storage
            .save_content(
                &format!("s3-other://{BUCKET}/foo.bin"),
                Content::Bytes(&mut content),
            )
            .await
            .unwrap();

        assert!(other.raw_object(BUCKET, "foo.bin").await.is_some());
        assert!(factory
            .store(None)
            .raw_object(BUCKET, "foo.bin")
            .await
            .is_none());
        assert!(!storage.exists(&name("foo.bin")).await.unwrap());
    }

    #[test]
    fn test_relative() {
        assert_eq!(relative("bar/bat.txt", "bar/"), Some("bat.txt".into()));
        assert_eq!(relative("bar/baz/", "bar/"), Some("baz".into()));
        assert_eq!(relative("bar/", "bar/"), None);
        assert_eq!(dir_prefix("."), "");
        assert_eq!(dir_prefix("media"), "media/");
    }
}
