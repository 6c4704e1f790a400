use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use aws_sdk_s3::Client;
use aws_sdk_s3::config::{BehaviorVersion, Credentials, Region, RequestChecksumCalculation};
use aws_sdk_s3::error::{DisplayErrorContext, SdkError};
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::primitives::DateTime;
use aws_sdk_s3::types::{BucketLocationConstraint, CreateBucketConfiguration};
use time::OffsetDateTime;
use tracing::debug;

use crate::mtime::{ORIGINAL_MTIME_KEY, parse_original_mtime};
use crate::store::{
    DownloadOptions, ObjectStore, ObjectSummary, RemoteObjectMetadata, StoreError, validate_key,
};
use crate::transfer::TransferClient;

const DEFAULT_REGION: &str = "us-east-1";
const PRESIGN_TTL: Duration = Duration::from_secs(15 * 60);

/// Configuration for [`S3Store`].
#[derive(Debug, Clone)]
pub struct S3StoreConfig {
    pub bucket: String,
    /// Custom endpoint (MinIO, LocalStack); switches to path-style addressing.
    pub endpoint_url: Option<String>,
    pub region: Option<String>,
    /// Static credentials; the default AWS credential chain is used when absent.
    pub credentials: Option<StaticCredentials>,
}

#[derive(Clone)]
pub struct StaticCredentials {
    pub access_key_id: String,
    pub secret_access_key: String,
}

impl std::fmt::Debug for StaticCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticCredentials")
            .field("access_key_id", &self.access_key_id)
            .finish_non_exhaustive()
    }
}

impl S3StoreConfig {
    pub fn new(bucket: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            endpoint_url: None,
            region: None,
            credentials: None,
        }
    }

    pub fn with_endpoint_url(mut self, endpoint_url: impl Into<String>) -> Self {
        self.endpoint_url = Some(endpoint_url.into());
        self
    }

    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }

    pub fn with_credentials(
        mut self,
        access_key_id: impl Into<String>,
        secret_access_key: impl Into<String>,
    ) -> Self {
        self.credentials = Some(StaticCredentials {
            access_key_id: access_key_id.into(),
            secret_access_key: secret_access_key.into(),
        });
        self
    }

    fn region_name(&self) -> &str {
        self.region.as_deref().unwrap_or(DEFAULT_REGION)
    }
}

/// S3-compatible bucket. Metadata calls go through the SDK; bodies are streamed
/// through presigned URLs by the [`TransferClient`].
pub struct S3Store {
    client: Client,
    bucket: String,
    region: String,
    transfer: TransferClient,
}

impl S3Store {
    pub async fn connect(config: S3StoreConfig) -> Self {
        let mut loader = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(config.region_name().to_string()));
        if let Some(credentials) = &config.credentials {
            loader = loader.credentials_provider(Credentials::new(
                credentials.access_key_id.clone(),
                credentials.secret_access_key.clone(),
                None,
                None,
                "bucketsync",
            ));
        }
        let shared = loader.load().await;

        let mut builder = aws_sdk_s3::config::Builder::from(&shared)
            .request_checksum_calculation(RequestChecksumCalculation::WhenRequired);
        if let Some(endpoint) = &config.endpoint_url {
            builder = builder.endpoint_url(endpoint).force_path_style(true);
        }

        let region = config.region_name().to_string();
        Self::with_client(Client::from_conf(builder.build()), config.bucket, &region)
    }

    pub fn with_client(client: Client, bucket: impl Into<String>, region: &str) -> Self {
        Self {
            client,
            bucket: bucket.into(),
            region: region.to_string(),
            transfer: TransferClient::new(),
        }
    }

    fn presigning(&self) -> Result<PresigningConfig, StoreError> {
        PresigningConfig::expires_in(PRESIGN_TTL)
            .map_err(|err| StoreError::Transport(format!("presigning config: {err}")))
    }

    async fn create_bucket(&self) -> Result<(), StoreError> {
        let mut request = self.client.create_bucket().bucket(&self.bucket);
        if self.region != DEFAULT_REGION {
            request = request.create_bucket_configuration(
                CreateBucketConfiguration::builder()
                    .location_constraint(BucketLocationConstraint::from(self.region.as_str()))
                    .build(),
            );
        }
        request.send().await.map_err(transport)?;
        Ok(())
    }
}

fn is_not_found<E>(err: &SdkError<E>) -> bool {
    matches!(err, SdkError::ServiceError(e) if e.raw().status().as_u16() == 404)
}

fn transport<E>(err: SdkError<E>) -> StoreError
where
    E: std::error::Error + 'static,
{
    StoreError::Transport(DisplayErrorContext(&err).to_string())
}

fn to_offset_date_time(value: &DateTime) -> Option<OffsetDateTime> {
    OffsetDateTime::from_unix_timestamp_nanos(value.as_nanos()).ok()
}

#[async_trait]
impl ObjectStore for S3Store {
    async fn ensure_bucket(&self) -> Result<bool, StoreError> {
        match self.client.head_bucket().bucket(&self.bucket).send().await {
            Ok(_) => Ok(false),
            Err(err) if is_not_found(&err) => {
                self.create_bucket().await?;
                Ok(true)
            }
            Err(err) => Err(transport(err)),
        }
    }

    async fn head(&self, key: &str) -> Result<Option<RemoteObjectMetadata>, StoreError> {
        let response = match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(response) => response,
            Err(err) if is_not_found(&err) => return Ok(None),
            Err(err) => return Err(transport(err)),
        };

        let original_mtime = response
            .metadata()
            .and_then(|metadata| metadata.get(ORIGINAL_MTIME_KEY))
            .and_then(|value| {
                let parsed = parse_original_mtime(value);
                if parsed.is_none() {
                    debug!(key, value = %value, "ignoring unparsable origin mtime");
                }
                parsed
            });

        Ok(Some(RemoteObjectMetadata {
            key: key.to_string(),
            store_last_modified: response.last_modified().and_then(to_offset_date_time),
            etag: response.e_tag().map(str::to_string),
            size: response
                .content_length()
                .and_then(|len| u64::try_from(len).ok()),
            original_mtime,
        }))
    }

    async fn upload(
        &self,
        key: &str,
        source: &Path,
        original_mtime: &str,
    ) -> Result<(), StoreError> {
        validate_key(key)?;
        let presigned = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .metadata(ORIGINAL_MTIME_KEY, original_mtime)
            .presigned(self.presigning()?)
            .await
            .map_err(transport)?;
        let headers: Vec<(String, String)> = presigned
            .headers()
            .map(|(name, value)| (name.to_string(), value.to_string()))
            .collect();
        self.transfer
            .upload_from_path(presigned.uri(), source, &headers)
            .await?;
        Ok(())
    }

    async fn download(
        &self,
        key: &str,
        target: &Path,
        options: &DownloadOptions,
    ) -> Result<(), StoreError> {
        let presigned = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .presigned(self.presigning()?)
            .await
            .map_err(transport)?;
        self.transfer
            .download_to_path_checked(
                presigned.uri(),
                target,
                options.expected_md5.as_deref(),
                options.modified,
            )
            .await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        match self
            .client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(_) => Ok(()),
            Err(err) if is_not_found(&err) => Err(StoreError::NotFound {
                key: key.to_string(),
            }),
            Err(err) => Err(transport(err)),
        }
    }

    async fn list(&self) -> Result<Vec<ObjectSummary>, StoreError> {
        let mut items = Vec::new();
        let mut continuation: Option<String> = None;
        loop {
            let page = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .set_continuation_token(continuation.take())
                .send()
                .await
                .map_err(transport)?;
            for object in page.contents() {
                let Some(key) = object.key() else {
                    continue;
                };
                items.push(ObjectSummary {
                    key: key.to_string(),
                    size: object.size().and_then(|len| u64::try_from(len).ok()),
                    store_last_modified: object.last_modified().and_then(to_offset_date_time),
                });
            }
            match page.next_continuation_token() {
                Some(token) if page.is_truncated().unwrap_or(false) => {
                    continuation = Some(token.to_string());
                }
                _ => break,
            }
        }
        Ok(items)
    }
}
