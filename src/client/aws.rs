//! `aws-sdk-s3` implementation of [`ObjectClient`].
//!
//! One [`S3Client`] is bound to one endpoint URL.  Credentials come from the
//! resolved settings when both key halves are set, and from the standard
//! AWS credential chain (env vars, `~/.aws/credentials`, IAM role, etc.)
//! otherwise.
//!
//! Bodies up to [`MULTIPART_THRESHOLD`] go up in a single `PutObject`.
//! Larger bodies use a multipart upload of [`PART_SIZE`] parts, with up to
//! [`MAX_CONCURRENT_PARTS`] in flight when the request allows threads.

use async_trait::async_trait;
use aws_config::timeout::TimeoutConfig;
use aws_sdk_s3::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart, ServerSideEncryption};
use aws_sdk_s3::Client;
use aws_smithy_runtime_api::client::orchestrator::HttpResponse;
use chrono::{DateTime, Utc};
use futures::stream::{FuturesUnordered, StreamExt};
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use std::io::{self, Read};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::backend::{
    ClientFuture, ClientMethod, GetObjectOutput, ListObjectsPage, ListObjectsRequest,
    ObjectClient, ObjectMeta, PresignRequest, PutObjectRequest, ReadSeek,
};
use crate::config::{AddressingStyle, Settings};
use crate::errors::ClientError;
use crate::registry::{BuildFuture, ClientFactory};

/// Upload size above which a multipart upload is used.
pub const MULTIPART_THRESHOLD: usize = 8 * 1024 * 1024;

/// Size of each multipart part.
pub const PART_SIZE: usize = 8 * 1024 * 1024;

/// Parts uploaded concurrently when threads are allowed.
pub const MAX_CONCURRENT_PARTS: usize = 4;

/// Characters escaped in a `x-amz-copy-source` key.
const COPY_SOURCE: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'/')
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

/// Sets the upload parameters shared by `PutObject` and
/// `CreateMultipartUpload` on either request builder.
macro_rules! apply_put_params {
    ($builder:expr, $request:expr) => {{
        let request = $request;
        $builder
            .bucket(&request.bucket)
            .key(&request.key)
            .content_type(&request.content_type)
            .set_content_encoding(request.content_encoding.clone())
            .set_content_disposition(request.content_disposition.clone())
            .set_content_language(request.content_language.clone())
            .cache_control(&request.cache_control)
            .set_metadata(if request.metadata.is_empty() {
                None
            } else {
                Some(request.metadata.clone().into_iter().collect())
            })
            .storage_class(aws_sdk_s3::types::StorageClass::from(
                request.storage_class.as_str(),
            ))
            .set_server_side_encryption(
                request
                    .server_side_encryption
                    .as_deref()
                    .map(ServerSideEncryption::from),
            )
            .set_ssekms_key_id(request.sse_kms_key_id.clone())
    }};
}

/// S3 client bound to one endpoint.
pub struct S3Client {
    client: Client,
    endpoint_url: Option<String>,
}

impl S3Client {
    /// Build a client for `endpoint_url` from resolved settings.
    pub async fn connect(settings: &Settings, endpoint_url: Option<&str>) -> Self {
        let mut config_loader = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(aws_config::Region::new(settings.region.clone()))
            .timeout_config(
                TimeoutConfig::builder()
                    .connect_timeout(settings.connect_timeout())
                    .build(),
            );

        if let Some(endpoint) = endpoint_url {
            config_loader = config_loader.endpoint_url(endpoint);
        }

        // Explicit credentials win over the default chain.
        if !settings.access_key_id.is_empty() && !settings.secret_access_key.is_empty() {
            let session_token = Some(settings.session_token.clone()).filter(|t| !t.is_empty());
            let creds = aws_sdk_s3::config::Credentials::new(
                &settings.access_key_id,
                &settings.secret_access_key,
                session_token,
                None, // expiry
                "s3-storage-settings",
            );
            config_loader = config_loader.credentials_provider(creds);
        }

        let sdk_config = config_loader.load().await;

        let s3_config_builder = aws_sdk_s3::config::Builder::from(&sdk_config)
            .force_path_style(settings.addressing_style == AddressingStyle::Path);

        let client = Client::from_conf(s3_config_builder.build());

        info!(
            "S3 client initialized: region={} endpoint={}",
            settings.region,
            endpoint_url.unwrap_or("<default>")
        );

        Self {
            client,
            endpoint_url: endpoint_url.map(str::to_string),
        }
    }
}

/// A part accepted by the store.
#[derive(Debug, Clone, PartialEq, Eq)]
struct UploadedPart {
    part_number: i32,
    e_tag: Option<String>,
}

/// Size limits for splitting an upload body.
#[derive(Debug, Clone, Copy)]
struct PartLayout {
    threshold: usize,
    part_size: usize,
}

impl Default for PartLayout {
    fn default() -> Self {
        Self {
            threshold: MULTIPART_THRESHOLD,
            part_size: PART_SIZE,
        }
    }
}

/// The raw upload calls [`upload_body`] drives.
#[async_trait]
trait UploadSink: Send + Sync {
    async fn put_single(&self, request: &PutObjectRequest, body: Vec<u8>)
        -> Result<(), ClientError>;

    /// Start a multipart upload and return its ID.
    async fn create_upload(&self, request: &PutObjectRequest) -> Result<String, ClientError>;

    async fn upload_part(
        &self,
        request: &PutObjectRequest,
        upload_id: &str,
        part_number: i32,
        chunk: Vec<u8>,
    ) -> Result<UploadedPart, ClientError>;

    async fn complete_upload(
        &self,
        request: &PutObjectRequest,
        upload_id: &str,
        parts: Vec<UploadedPart>,
    ) -> Result<(), ClientError>;

    async fn abort_upload(
        &self,
        request: &PutObjectRequest,
        upload_id: &str,
    ) -> Result<(), ClientError>;
}

#[async_trait]
impl UploadSink for S3Client {
    async fn put_single(
        &self,
        request: &PutObjectRequest,
        body: Vec<u8>,
    ) -> Result<(), ClientError> {
        apply_put_params!(self.client.put_object(), request)
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(map_sdk_error)?;
        Ok(())
    }

    async fn create_upload(&self, request: &PutObjectRequest) -> Result<String, ClientError> {
        let resp = apply_put_params!(self.client.create_multipart_upload(), request)
            .send()
            .await
            .map_err(map_sdk_error)?;
        resp.upload_id()
            .map(str::to_string)
            .ok_or_else(|| ClientError::without_code("S3 did not return an upload ID"))
    }

    async fn upload_part(
        &self,
        request: &PutObjectRequest,
        upload_id: &str,
        part_number: i32,
        chunk: Vec<u8>,
    ) -> Result<UploadedPart, ClientError> {
        let resp = self
            .client
            .upload_part()
            .bucket(&request.bucket)
            .key(&request.key)
            .upload_id(upload_id)
            .part_number(part_number)
            .body(ByteStream::from(chunk))
            .send()
            .await
            .map_err(map_sdk_error)?;
        Ok(UploadedPart {
            part_number,
            e_tag: resp.e_tag().map(str::to_string),
        })
    }

    async fn complete_upload(
        &self,
        request: &PutObjectRequest,
        upload_id: &str,
        parts: Vec<UploadedPart>,
    ) -> Result<(), ClientError> {
        let parts = parts
            .into_iter()
            .map(|part| {
                CompletedPart::builder()
                    .set_e_tag(part.e_tag)
                    .part_number(part.part_number)
                    .build()
            })
            .collect();
        let completed = CompletedMultipartUpload::builder()
            .set_parts(Some(parts))
            .build();
        self.client
            .complete_multipart_upload()
            .bucket(&request.bucket)
            .key(&request.key)
            .upload_id(upload_id)
            .multipart_upload(completed)
            .send()
            .await
            .map_err(map_sdk_error)?;
        Ok(())
    }

    async fn abort_upload(
        &self,
        request: &PutObjectRequest,
        upload_id: &str,
    ) -> Result<(), ClientError> {
        self.client
            .abort_multipart_upload()
            .bucket(&request.bucket)
            .key(&request.key)
            .upload_id(upload_id)
            .send()
            .await
            .map_err(map_sdk_error)?;
        Ok(())
    }
}

/// Send `body` as one `PutObject` when it fits in `layout.threshold`,
/// otherwise as a multipart upload.
async fn upload_body<S, R>(
    sink: &S,
    request: &PutObjectRequest,
    body: &mut R,
    layout: PartLayout,
) -> Result<(), ClientError>
where
    S: UploadSink + ?Sized,
    R: Read + Send + ?Sized,
{
    let mut first = read_chunk(body, layout.threshold + 1).map_err(body_error)?;
    if first.len() <= layout.threshold {
        debug!(
            "S3 put_object: bucket={} key={} bytes={}",
            request.bucket,
            request.key,
            first.len()
        );
        return sink.put_single(request, first).await;
    }

    // The first read may run past one part; the remainder leads the rest.
    let spill = first.split_off(layout.part_size.min(first.len()));
    let mut rest = io::Cursor::new(spill).chain(body);
    put_multipart(sink, request, first, &mut rest, layout.part_size).await
}

/// Multipart upload of `first` followed by the rest of `body`.  The upload
/// is aborted if any part fails.
async fn put_multipart<S, R>(
    sink: &S,
    request: &PutObjectRequest,
    first: Vec<u8>,
    body: &mut R,
    part_size: usize,
) -> Result<(), ClientError>
where
    S: UploadSink + ?Sized,
    R: Read + Send + ?Sized,
{
    let upload_id = sink.create_upload(request).await?;
    debug!(
        "S3 multipart upload started: bucket={} key={} upload_id={}",
        request.bucket, request.key, upload_id
    );

    let result = match upload_parts(sink, request, &upload_id, first, body, part_size).await {
        Ok(parts) => sink.complete_upload(request, &upload_id, parts).await,
        Err(e) => Err(e),
    };
    if let Err(e) = &result {
        warn!(
            "Aborting S3 multipart upload {} due to error: {}",
            upload_id, e
        );
        if let Err(abort_err) = sink.abort_upload(request, &upload_id).await {
            warn!("Failed to abort S3 multipart upload: {}", abort_err);
        }
    }
    result
}

/// Upload every part and return them in part-number order.
async fn upload_parts<S, R>(
    sink: &S,
    request: &PutObjectRequest,
    upload_id: &str,
    first: Vec<u8>,
    body: &mut R,
    part_size: usize,
) -> Result<Vec<UploadedPart>, ClientError>
where
    S: UploadSink + ?Sized,
    R: Read + Send + ?Sized,
{
    let max_in_flight = if request.use_threads {
        MAX_CONCURRENT_PARTS
    } else {
        1
    };

    let mut in_flight = FuturesUnordered::new();
    let mut completed: Vec<UploadedPart> = Vec::new();
    let mut next_chunk = Some(first);
    let mut part_number = 0i32;

    loop {
        while in_flight.len() < max_in_flight {
            let Some(chunk) = next_chunk.take() else {
                break;
            };
            part_number += 1;
            debug!(
                "S3 upload_part: key={} part={} bytes={}",
                request.key,
                part_number,
                chunk.len()
            );
            in_flight.push(sink.upload_part(request, upload_id, part_number, chunk));

            let chunk = read_chunk(body, part_size).map_err(body_error)?;
            if !chunk.is_empty() {
                next_chunk = Some(chunk);
            }
        }
        match in_flight.next().await {
            Some(part) => completed.push(part?),
            None => break,
        }
    }

    completed.sort_by_key(|part| part.part_number);
    Ok(completed)
}

impl ObjectClient for S3Client {
    fn endpoint_url(&self) -> Option<&str> {
        self.endpoint_url.as_deref()
    }

    fn get_object(&self, bucket: &str, key: &str) -> ClientFuture<'_, GetObjectOutput> {
        let bucket = bucket.to_string();
        let key = key.to_string();
        Box::pin(async move {
            debug!("S3 get_object: bucket={} key={}", bucket, key);
            let resp = self
                .client
                .get_object()
                .bucket(&bucket)
                .key(&key)
                .send()
                .await
                .map_err(map_sdk_error)?;
            Ok(GetObjectOutput {
                content_encoding: resp.content_encoding().map(str::to_string),
                body: resp.body,
            })
        })
    }

    fn head_object(&self, bucket: &str, key: &str) -> ClientFuture<'_, ObjectMeta> {
        let bucket = bucket.to_string();
        let key = key.to_string();
        Box::pin(async move {
            debug!("S3 head_object: bucket={} key={}", bucket, key);
            let resp = self
                .client
                .head_object()
                .bucket(&bucket)
                .key(&key)
                .send()
                .await
                .map_err(map_sdk_error)?;

            Ok(ObjectMeta {
                content_length: resp
                    .content_length()
                    .and_then(|len| u64::try_from(len).ok())
                    .unwrap_or(0),
                content_type: resp.content_type().map(str::to_string),
                content_encoding: resp.content_encoding().map(str::to_string),
                content_disposition: resp.content_disposition().map(str::to_string),
                content_language: resp.content_language().map(str::to_string),
                cache_control: resp.cache_control().map(str::to_string),
                storage_class: resp.storage_class().map(|c| c.as_str().to_string()),
                server_side_encryption: resp
                    .server_side_encryption()
                    .map(|s| s.as_str().to_string()),
                metadata: resp.metadata().cloned().unwrap_or_default(),
                last_modified: resp.last_modified().map(to_chrono).unwrap_or_default(),
                e_tag: resp.e_tag().map(str::to_string),
            })
        })
    }

    fn put_object<'a>(
        &'a self,
        request: PutObjectRequest,
        body: &'a mut dyn ReadSeek,
    ) -> ClientFuture<'a, ()> {
        Box::pin(async move {
            upload_body(self, &request, body, PartLayout::default()).await
        })
    }

    fn delete_object(&self, bucket: &str, key: &str) -> ClientFuture<'_, ()> {
        let bucket = bucket.to_string();
        let key = key.to_string();
        Box::pin(async move {
            debug!("S3 delete_object: bucket={} key={}", bucket, key);
            // S3 delete_object is idempotent -- no error for missing keys.
            self.client
                .delete_object()
                .bucket(&bucket)
                .key(&key)
                .send()
                .await
                .map_err(map_sdk_error)?;
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
        let copy_source = copy_source(src_bucket, src_key);
        let dst_bucket = dst_bucket.to_string();
        let dst_key = dst_key.to_string();
        Box::pin(async move {
            debug!(
                "S3 copy_object: src={} dst={}/{}",
                copy_source, dst_bucket, dst_key
            );
            self.client
                .copy_object()
                .bucket(&dst_bucket)
                .key(&dst_key)
                .copy_source(&copy_source)
                .send()
                .await
                .map_err(map_sdk_error)?;
            Ok(())
        })
    }

    fn list_objects(&self, request: ListObjectsRequest) -> ClientFuture<'_, ListObjectsPage> {
        Box::pin(async move {
            debug!(
                "S3 list_objects_v2: bucket={} prefix={}",
                request.bucket, request.prefix
            );
            let resp = self
                .client
                .list_objects_v2()
                .bucket(&request.bucket)
                .prefix(&request.prefix)
                .set_delimiter(request.delimiter)
                .set_max_keys(request.max_keys)
                .set_continuation_token(request.continuation_token)
                .send()
                .await
                .map_err(map_sdk_error)?;

            let next_continuation_token = if resp.is_truncated() == Some(true) {
                resp.next_continuation_token().map(str::to_string)
            } else {
                None
            };

            Ok(ListObjectsPage {
                keys: resp
                    .contents()
                    .iter()
                    .filter_map(|obj| obj.key().map(str::to_string))
                    .collect(),
                common_prefixes: resp
                    .common_prefixes()
                    .iter()
                    .filter_map(|p| p.prefix().map(str::to_string))
                    .collect(),
                next_continuation_token,
            })
        })
    }

    fn presign(&self, request: PresignRequest) -> ClientFuture<'_, String> {
        Box::pin(async move {
            let config = PresigningConfig::expires_in(request.expires_in)
                .map_err(|e| ClientError::without_code(format!("presigning config: {e}")))?;
            let bucket = request.bucket.as_str();
            let key = request.key.as_str();

            let presigned = match request.method {
                ClientMethod::GetObject => {
                    let mut req = self.client.get_object().bucket(bucket).key(key);
                    for (name, value) in &request.params {
                        req = match name.as_str() {
                            "ResponseCacheControl" => req.response_cache_control(value),
                            "ResponseContentDisposition" => {
                                req.response_content_disposition(value)
                            }
                            "ResponseContentEncoding" => req.response_content_encoding(value),
                            "ResponseContentLanguage" => req.response_content_language(value),
                            "ResponseContentType" => req.response_content_type(value),
                            "VersionId" => req.version_id(value),
                            "Range" => req.range(value),
                            other => return Err(unsupported_param(request.method, other)),
                        };
                    }
                    req.presigned(config).await.map_err(map_sdk_error)?
                }
                ClientMethod::HeadObject => {
                    let mut req = self.client.head_object().bucket(bucket).key(key);
                    for (name, value) in &request.params {
                        req = match name.as_str() {
                            "VersionId" => req.version_id(value),
                            "Range" => req.range(value),
                            other => return Err(unsupported_param(request.method, other)),
                        };
                    }
                    req.presigned(config).await.map_err(map_sdk_error)?
                }
                ClientMethod::PutObject => {
                    let mut req = self.client.put_object().bucket(bucket).key(key);
                    for (name, value) in &request.params {
                        req = match name.as_str() {
                            "CacheControl" => req.cache_control(value),
                            "ContentDisposition" => req.content_disposition(value),
                            "ContentEncoding" => req.content_encoding(value),
                            "ContentLanguage" => req.content_language(value),
                            "ContentType" => req.content_type(value),
                            other => return Err(unsupported_param(request.method, other)),
                        };
                    }
                    req.presigned(config).await.map_err(map_sdk_error)?
                }
                ClientMethod::DeleteObject => {
                    let mut req = self.client.delete_object().bucket(bucket).key(key);
                    for (name, value) in &request.params {
                        req = match name.as_str() {
                            "VersionId" => req.version_id(value),
                            other => return Err(unsupported_param(request.method, other)),
                        };
                    }
                    req.presigned(config).await.map_err(map_sdk_error)?
                }
            };

            Ok(presigned.uri().to_string())
        })
    }
}

/// Builds [`S3Client`]s.
#[derive(Debug, Default)]
pub struct SdkClientFactory;

impl ClientFactory for SdkClientFactory {
    fn build<'a>(
        &'a self,
        settings: &'a Settings,
        endpoint_url: Option<&'a str>,
    ) -> BuildFuture<'a> {
        Box::pin(async move {
            let client: Arc<dyn ObjectClient> =
                Arc::new(S3Client::connect(settings, endpoint_url).await);
            Ok(client)
        })
    }
}

// -- Helpers -----------------------------------------------------------------

/// Map an AWS SDK error to a [`ClientError`], keeping the S3 error code.
///
/// HEAD responses carry no body, so a bare 404 status is reported as
/// code `"404"`.
fn map_sdk_error<E>(err: SdkError<E, HttpResponse>) -> ClientError
where
    E: ProvideErrorMetadata + std::error::Error + 'static,
{
    let code = err.code().map(str::to_string).or_else(|| {
        err.raw_response()
            .map(|resp| resp.status().as_u16())
            .filter(|status| *status == 404)
            .map(|status| status.to_string())
    });
    let message = DisplayErrorContext(&err).to_string();
    match code {
        Some(code) => ClientError::new(code, message),
        None => ClientError::without_code(message),
    }
}

fn body_error(err: io::Error) -> ClientError {
    ClientError::without_code(format!("reading upload body: {err}"))
}

fn unsupported_param(method: ClientMethod, param: &str) -> ClientError {
    ClientError::new(
        "InvalidParameter",
        format!("{param} is not a supported parameter for {method}"),
    )
}

/// `"{bucket}/{key}"` with the key percent-encoded.
fn copy_source(bucket: &str, key: &str) -> String {
    format!("{bucket}/{}", utf8_percent_encode(key, COPY_SOURCE))
}

/// Read up to `size` bytes, fewer only at end of input.
fn read_chunk<R: Read + ?Sized>(body: &mut R, size: usize) -> io::Result<Vec<u8>> {
    let mut chunk = Vec::with_capacity(size.min(PART_SIZE));
    (&mut *body).take(size as u64).read_to_end(&mut chunk)?;
    Ok(chunk)
}

fn to_chrono(time: &aws_sdk_s3::primitives::DateTime) -> DateTime<Utc> {
    DateTime::from_timestamp(time.secs(), time.subsec_nanos()).unwrap_or_default()
}

// -- Tests -------------------------------------------------------------------
