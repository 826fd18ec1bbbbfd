//! AWS S3 backend.
//!
//! Respects `prefix_in_bucket` from [`S3Config`], so several agents can
//! share one bucket as long as their prefixes differ. The SDK's own retry
//! machinery is limited to a single attempt; retrying is the caller's job
//! and happens with the error cause chain intact.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll};
use std::time::Duration;

use anyhow::Context;
use aws_config::{
    environment::credentials::EnvironmentVariableCredentialsProvider,
    imds::credentials::ImdsCredentialsProvider,
    meta::credentials::CredentialsProviderChain,
    profile::ProfileFileCredentialsProvider,
    provider_config::ProviderConfig,
    retry::{RetryConfigBuilder, RetryMode},
    web_identity_token::WebIdentityTokenCredentialsProvider,
    BehaviorVersion,
};
use aws_credential_types::provider::SharedCredentialsProvider;
use aws_sdk_s3::{
    config::{AsyncSleep, Builder, IdentityCache, Region, SharedAsyncSleep},
    error::SdkError,
    operation::get_object::GetObjectError,
    operation::head_object::HeadObjectError,
    Client,
};
use aws_smithy_async::rt::sleep::TokioSleep;
use aws_smithy_types::{body::SdkBody, byte_stream::ByteStream};
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::Stream;
use hyper::Body;
use tokio::sync::Semaphore;
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;

use crate::{
    BlobStorage, BlobStream, Download, ListEntry, RemotePath, S3Config, StorageError,
    StorageMetadata, PREFIX_SEPARATOR,
};

pub struct S3Bucket {
    client: Client,
    bucket_name: String,
    prefix_in_bucket: Option<String>,
    max_keys_per_list_response: Option<i32>,
    concurrency_limiter: Arc<Semaphore>,
    timeout: Duration,
}

impl S3Bucket {
    /// Creates the S3 backend, errors on incorrect configuration.
    pub fn new(config: &S3Config, timeout: Duration) -> anyhow::Result<Self> {
        tracing::debug!(
            "Creating s3 blob storage for bucket {}",
            config.bucket_name
        );

        let region = Some(Region::new(config.bucket_region.clone()));

        let provider_conf = ProviderConfig::without_region().with_region(region.clone());

        let credentials_provider = {
            // uses "AWS_ACCESS_KEY_ID", "AWS_SECRET_ACCESS_KEY"
            CredentialsProviderChain::first_try(
                "env",
                EnvironmentVariableCredentialsProvider::new(),
            )
            // uses "AWS_PROFILE" / `aws sso login --profile <profile>`
            .or_else(
                "profile-sso",
                ProfileFileCredentialsProvider::builder()
                    .configure(&provider_conf)
                    .build(),
            )
            // uses "AWS_WEB_IDENTITY_TOKEN_FILE", "AWS_ROLE_ARN", "AWS_ROLE_SESSION_NAME"
            .or_else(
                "token",
                WebIdentityTokenCredentialsProvider::builder()
                    .configure(&provider_conf)
                    .build(),
            )
            // uses imds v2
            .or_else("imds", ImdsCredentialsProvider::builder().build())
        };

        let sleep_impl: Arc<dyn AsyncSleep> = Arc::new(TokioSleep::new());

        // Retrying is done by the agent with its own backoff; the adaptive
        // mode still lets the SDK rate-limit itself on throttling responses.
        let mut retry_config = RetryConfigBuilder::new();
        retry_config
            .set_max_attempts(Some(1))
            .set_mode(Some(RetryMode::Adaptive));

        let mut config_builder = Builder::default()
            .behavior_version(BehaviorVersion::v2023_11_09())
            .region(region)
            .identity_cache(IdentityCache::lazy().build())
            .credentials_provider(SharedCredentialsProvider::new(credentials_provider))
            .retry_config(retry_config.build())
            .sleep_impl(SharedAsyncSleep::from(sleep_impl));

        if let Some(custom_endpoint) = config.endpoint.clone() {
            config_builder = config_builder
                .endpoint_url(custom_endpoint)
                .force_path_style(true);
        }

        let client = Client::from_conf(config_builder.build());

        let prefix_in_bucket = config.prefix_in_bucket.as_deref().map(|prefix| {
            prefix
                .trim_start_matches(PREFIX_SEPARATOR)
                .trim_end_matches(PREFIX_SEPARATOR)
                .to_string()
        });

        Ok(Self {
            client,
            bucket_name: config.bucket_name.clone(),
            prefix_in_bucket,
            max_keys_per_list_response: config.max_keys_per_list_response,
            concurrency_limiter: Arc::new(Semaphore::new(config.concurrency_limit.get())),
            timeout,
        })
    }

    fn relative_path_to_s3_object(&self, path: &RemotePath) -> String {
        let path_string = path.get_path().as_str();
        match &self.prefix_in_bucket {
            Some(prefix) => format!("{prefix}{PREFIX_SEPARATOR}{path_string}"),
            None => path_string.to_string(),
        }
    }

    fn s3_object_to_relative_path(&self, key: &str) -> anyhow::Result<RemotePath> {
        let stripped = match &self.prefix_in_bucket {
            Some(prefix) => key
                .strip_prefix(prefix.as_str())
                .map(|k| k.trim_start_matches(PREFIX_SEPARATOR))
                // we rely on the SDK to return properly prefixed keys
                // for requests with a certain prefix
                .with_context(|| {
                    format!("key {key} does not start with bucket prefix {prefix:?}")
                })?,
            None => key,
        };
        RemotePath::from_string(stripped)
    }

    async fn permit(
        &self,
        cancel: &CancellationToken,
    ) -> Result<tokio::sync::SemaphorePermit<'_>, StorageError> {
        tokio::select! {
            permit = self.concurrency_limiter.acquire() => {
                Ok(permit.expect("semaphore is never closed"))
            }
            _ = cancel.cancelled() => Err(StorageError::Cancelled),
        }
    }

    async fn head_object(
        &self,
        path: &RemotePath,
        cancel: &CancellationToken,
    ) -> Result<StorageMetadata, StorageError> {
        let head = self
            .client
            .head_object()
            .bucket(self.bucket_name.clone())
            .key(self.relative_path_to_s3_object(path))
            .send();

        let head = tokio::select! {
            res = head => res,
            _ = tokio::time::sleep(self.timeout) => return Err(StorageError::Timeout),
            _ = cancel.cancelled() => return Err(StorageError::Cancelled),
        };

        match head {
            Ok(output) => Ok(StorageMetadata(
                output.metadata.unwrap_or_default().into_iter().collect(),
            )),
            Err(SdkError::ServiceError(e)) if matches!(e.err(), HeadObjectError::NotFound(_)) => {
                Err(StorageError::NotFound)
            }
            Err(e) => Err(StorageError::Other(
                anyhow::Error::new(e).context("head s3 object"),
            )),
        }
    }
}

#[async_trait]
impl BlobStorage for S3Bucket {
    async fn put(
        &self,
        to: &RemotePath,
        from: BlobStream,
        size: usize,
        metadata: &StorageMetadata,
        cancel: &CancellationToken,
    ) -> Result<(), StorageError> {
        let _permit = self.permit(cancel).await?;

        let body = Body::wrap_stream(ReaderStream::new(from));
        let bytes_stream = ByteStream::new(SdkBody::from_body_0_4(body));

        let upload = self
            .client
            .put_object()
            .bucket(self.bucket_name.clone())
            .key(self.relative_path_to_s3_object(to))
            .set_metadata(if metadata.is_empty() {
                None
            } else {
                Some(metadata.0.clone().into_iter().collect())
            })
            .content_length(size.try_into().context("blob size overflows i64")?)
            .body(bytes_stream)
            .send();

        let upload = tokio::time::timeout(self.timeout, upload);

        let res = tokio::select! {
            res = upload => res,
            _ = cancel.cancelled() => return Err(StorageError::Cancelled),
        };

        match res {
            Ok(Ok(_put)) => Ok(()),
            Ok(Err(sdk)) => Err(StorageError::Other(
                anyhow::Error::new(sdk).context("upload s3 object"),
            )),
            Err(_elapsed) => Err(StorageError::Timeout),
        }
    }

    async fn get(
        &self,
        from: &RemotePath,
        cancel: &CancellationToken,
    ) -> Result<Download, StorageError> {
        let _permit = self.permit(cancel).await?;

        let get_object = self
            .client
            .get_object()
            .bucket(self.bucket_name.clone())
            .key(self.relative_path_to_s3_object(from))
            .send();

        let get_object = tokio::select! {
            res = get_object => res,
            _ = tokio::time::sleep(self.timeout) => return Err(StorageError::Timeout),
            _ = cancel.cancelled() => return Err(StorageError::Cancelled),
        };

        let object_output = match get_object {
            Ok(object_output) => object_output,
            Err(SdkError::ServiceError(e)) if matches!(e.err(), GetObjectError::NoSuchKey(_)) => {
                // 404 is not an error at this level: callers probe for
                // manifests and delta blobs that may legitimately be absent.
                return Err(StorageError::NotFound);
            }
            Err(e) => {
                return Err(StorageError::Other(
                    anyhow::Error::new(e).context("download s3 object"),
                ));
            }
        };

        let metadata = StorageMetadata(
            object_output
                .metadata
                .unwrap_or_default()
                .into_iter()
                .collect(),
        );
        let size = object_output
            .content_length
            .and_then(|l| u64::try_from(l).ok());

        let body = ByteStreamAsStream::from(object_output.body);
        let reader = tokio_util::io::StreamReader::new(body);

        Ok(Download {
            download_stream: Box::pin(reader),
            size,
            metadata,
        })
    }

    async fn list(
        &self,
        prefix: &RemotePath,
        deep: bool,
        cancel: &CancellationToken,
    ) -> Result<Vec<ListEntry>, StorageError> {
        // required to end with a separator, otherwise the response would
        // contain only the entry of the prefix itself
        let mut list_prefix = self.relative_path_to_s3_object(prefix);
        if !list_prefix.ends_with(PREFIX_SEPARATOR) {
            list_prefix.push(PREFIX_SEPARATOR);
        }

        let mut keys = Vec::new();
        {
            let _permit = self.permit(cancel).await?;
            let mut continuation_token = None;

            loop {
                let mut request = self
                    .client
                    .list_objects_v2()
                    .bucket(self.bucket_name.clone())
                    .prefix(list_prefix.clone())
                    .set_continuation_token(continuation_token)
                    .set_max_keys(self.max_keys_per_list_response);

                if !deep {
                    request = request.delimiter(PREFIX_SEPARATOR.to_string());
                }

                let request = request.send();

                let response = tokio::select! {
                    res = request => res,
                    _ = tokio::time::sleep(self.timeout) => return Err(StorageError::Timeout),
                    _ = cancel.cancelled() => return Err(StorageError::Cancelled),
                };

                let response = response
                    .context("list s3 prefix")
                    .map_err(StorageError::Other)?;

                for object in response.contents() {
                    let key = object.key().context("list response entry without key")?;
                    let size = object.size().and_then(|s| u64::try_from(s).ok()).unwrap_or(0);
                    keys.push((self.s3_object_to_relative_path(key)?, size));
                }

                continuation_token = match response.next_continuation_token {
                    Some(new_token) => Some(new_token),
                    None => break,
                };
            }
        }

        // The list response has no per-object metadata; fetch it with one
        // HEAD per key. Listings here are backup inventories, not data
        // planes, so the extra round trips stay cheap.
        let mut entries = Vec::with_capacity(keys.len());
        for (key, size) in keys {
            match self.head_object(&key, cancel).await {
                Ok(metadata) => entries.push(ListEntry {
                    key,
                    size,
                    metadata,
                }),
                // Deleted while we were listing; skip it.
                Err(StorageError::NotFound) => continue,
                Err(e) => return Err(e),
            }
        }
        entries.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(entries)
    }

    async fn delete(
        &self,
        path: &RemotePath,
        cancel: &CancellationToken,
    ) -> Result<(), StorageError> {
        let _permit = self.permit(cancel).await?;

        let delete = self
            .client
            .delete_object()
            .bucket(self.bucket_name.clone())
            .key(self.relative_path_to_s3_object(path))
            .send();

        let delete = tokio::select! {
            res = delete => res,
            _ = tokio::time::sleep(self.timeout) => return Err(StorageError::Timeout),
            _ = cancel.cancelled() => return Err(StorageError::Cancelled),
        };

        delete
            .map(|_output| ())
            .context("delete s3 object")
            .map_err(StorageError::Other)
    }

    async fn get_metadata(
        &self,
        path: &RemotePath,
        cancel: &CancellationToken,
    ) -> Result<StorageMetadata, StorageError> {
        let _permit = self.permit(cancel).await?;
        self.head_object(path, cancel).await
    }
}

pin_project_lite::pin_project! {
    struct ByteStreamAsStream {
        #[pin]
        inner: ByteStream
    }
}

impl From<ByteStream> for ByteStreamAsStream {
    fn from(inner: ByteStream) -> Self {
        ByteStreamAsStream { inner }
    }
}

impl Stream for ByteStreamAsStream {
    type Item = std::io::Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Option<Self::Item>> {
        // this does the std::io::ErrorKind::Other conversion
        self.project().inner.poll_next(cx).map_err(|x| x.into())
    }

    // cannot implement size_hint because inner.size_hint is remaining size in bytes, which makes
    // sense and Stream::size_hint does not really
}
