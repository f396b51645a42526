//! [`RemoteStore`] backed by the AWS SDK.

use crate::{
    models::{
        digest::Digest,
        object::{RestorePriority, StorageTier},
    },
    services::remote::{
        DeleteFailure, ObjectPage, ObjectReader, PendingUpload, RemoteError, RemoteErrorKind,
        RemoteObject, RemoteResult, RemoteStore, RestoreRequestOutcome, RestoreStatus,
        UploadPage, VersionMarker, VersionPage, VersionRef, parse_restore_header,
    },
};
use async_trait::async_trait;
use aws_sdk_s3 as s3;
use chrono::{DateTime, Utc};
use s3::{
    config::Region,
    error::{BuildError, DisplayErrorContext, ProvideErrorMetadata, SdkError},
    types::{ChecksumMode, Delete, GlacierJobParameters, ObjectIdentifier, RestoreRequest, Tier},
};
use tracing::debug;

/// Provider error codes worth retrying.
const TRANSIENT_CODES: &[&str] = &[
    "SlowDown",
    "Throttling",
    "ThrottlingException",
    "RequestTimeout",
    "RequestTimeTooSkewed",
    "InternalError",
    "ServiceUnavailable",
];

const RESTORE_IN_PROGRESS_CODE: &str = "RestoreAlreadyInProgress";

pub struct S3RemoteStore {
    client: s3::Client,
}

impl S3RemoteStore {
    /// Build a client from the ambient AWS configuration chain, optionally
    /// pinned to a region or an S3-compatible endpoint.
    pub async fn connect(region: Option<String>, endpoint_url: Option<String>) -> Self {
        let mut loader = aws_config::defaults(s3::config::BehaviorVersion::latest());
        if let Some(region) = region {
            loader = loader.region(Region::new(region));
        }
        if let Some(endpoint) = endpoint_url.as_deref() {
            loader = loader.endpoint_url(endpoint);
        }
        let sdk_config = loader.load().await;
        let s3_config = s3::config::Builder::from(&sdk_config)
            .force_path_style(endpoint_url.is_some())
            .build();
        Self {
            client: s3::Client::from_conf(s3_config),
        }
    }
}

/// Map an SDK failure onto the engine's error kinds.
fn classify<E>(err: SdkError<E>) -> RemoteError
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
{
    let message = DisplayErrorContext(&err).to_string();
    match &err {
        SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) | SdkError::ResponseError(_) => {
            RemoteError::transient(message)
        }
        SdkError::ServiceError(service_err) => {
            let status = service_err.raw().status().as_u16();
            let code = service_err.err().code().map(str::to_string);
            let kind = match code.as_deref() {
                Some(RESTORE_IN_PROGRESS_CODE) => RemoteErrorKind::RestoreAlreadyInProgress,
                Some(code) if TRANSIENT_CODES.contains(&code) => RemoteErrorKind::Transient,
                Some("NoSuchKey" | "NoSuchBucket" | "NotFound") => RemoteErrorKind::NotFound,
                _ if status == 404 => RemoteErrorKind::NotFound,
                _ if status >= 500 || status == 429 => RemoteErrorKind::Transient,
                _ => RemoteErrorKind::Other,
            };
            let mut remote = RemoteError::new(kind, message);
            remote.code = code;
            remote
        }
        _ => RemoteError::new(RemoteErrorKind::Other, message),
    }
}

fn build_error(err: BuildError) -> RemoteError {
    RemoteError::new(RemoteErrorKind::Other, format!("invalid request: {err}"))
}

fn to_chrono(value: &s3::primitives::DateTime) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp(value.secs(), value.subsec_nanos())
}

#[async_trait]
impl RemoteStore for S3RemoteStore {
    async fn list_buckets(&self) -> RemoteResult<Vec<String>> {
        let mut names = Vec::new();
        let mut continuation: Option<String> = None;
        loop {
            let output = self
                .client
                .list_buckets()
                .set_continuation_token(continuation.take())
                .send()
                .await
                .map_err(classify)?;
            names.extend(
                output
                    .buckets()
                    .iter()
                    .filter_map(|bucket| bucket.name().map(str::to_string)),
            );
            match output.continuation_token() {
                Some(token) if !token.is_empty() => continuation = Some(token.to_string()),
                _ => break,
            }
        }
        names.sort();
        Ok(names)
    }

    async fn list_objects_page(
        &self,
        bucket: &str,
        continuation: Option<String>,
    ) -> RemoteResult<ObjectPage> {
        let output = self
            .client
            .list_objects_v2()
            .bucket(bucket)
            .set_continuation_token(continuation)
            .send()
            .await
            .map_err(classify)?;

        let objects = output
            .contents()
            .iter()
            .filter_map(|object| {
                let key = object.key()?.to_string();
                Some(RemoteObject {
                    key,
                    size_bytes: object.size().unwrap_or_default(),
                    digest: Digest::parse(object.e_tag().unwrap_or_default()),
                    storage_tier: StorageTier::from_class(
                        object.storage_class().map(|class| class.as_str()),
                    ),
                    last_modified: object.last_modified().and_then(to_chrono),
                })
            })
            .collect();

        let next_token = if output.is_truncated() == Some(true) {
            output.next_continuation_token().map(str::to_string)
        } else {
            None
        };
        Ok(ObjectPage {
            objects,
            next_token,
        })
    }

    async fn request_restore(
        &self,
        bucket: &str,
        key: &str,
        days: i32,
        priority: RestorePriority,
    ) -> RemoteResult<RestoreRequestOutcome> {
        let job = GlacierJobParameters::builder()
            .tier(Tier::from(priority.as_str()))
            .build()
            .map_err(build_error)?;
        let request = RestoreRequest::builder()
            .days(days)
            .glacier_job_parameters(job)
            .build();

        let result = self
            .client
            .restore_object()
            .bucket(bucket)
            .key(key)
            .restore_request(request)
            .send()
            .await;

        match result.map_err(classify) {
            Ok(_) => Ok(RestoreRequestOutcome::Accepted),
            Err(err) if err.kind == RemoteErrorKind::RestoreAlreadyInProgress => {
                debug!(bucket, key, "restore already in progress");
                Ok(RestoreRequestOutcome::AlreadyInProgress)
            }
            Err(err) => Err(err),
        }
    }

    async fn restore_status(&self, bucket: &str, key: &str) -> RemoteResult<RestoreStatus> {
        let result = self.client.head_object().bucket(bucket).key(key).send().await;
        match result.map_err(classify) {
            Ok(output) => Ok(parse_restore_header(output.restore())),
            Err(err) if err.kind == RemoteErrorKind::NotFound => Ok(RestoreStatus::Failed(
                format!("object `{bucket}/{key}` no longer exists"),
            )),
            Err(err) => Err(err),
        }
    }

    async fn get_object(&self, bucket: &str, key: &str) -> RemoteResult<ObjectReader> {
        let output = self
            .client
            .get_object()
            .bucket(bucket)
            .key(key)
            .checksum_mode(ChecksumMode::Enabled)
            .send()
            .await
            .map_err(classify)?;
        Ok(Box::pin(output.body.into_async_read()))
    }

    async fn list_versions_page(
        &self,
        bucket: &str,
        marker: Option<VersionMarker>,
    ) -> RemoteResult<VersionPage> {
        let marker = marker.unwrap_or_default();
        let output = self
            .client
            .list_object_versions()
            .bucket(bucket)
            .set_key_marker(marker.key_marker)
            .set_version_id_marker(marker.version_id_marker)
            .send()
            .await
            .map_err(classify)?;

        let versions = output
            .versions()
            .iter()
            .filter_map(|version| {
                Some(VersionRef {
                    key: version.key()?.to_string(),
                    version_id: version.version_id().map(str::to_string),
                    is_delete_marker: false,
                    is_latest: version.is_latest().unwrap_or(false),
                    size_bytes: version.size(),
                    digest: version.e_tag().map(Digest::parse),
                })
            })
            .chain(output.delete_markers().iter().filter_map(|marker| {
                Some(VersionRef {
                    key: marker.key()?.to_string(),
                    version_id: marker.version_id().map(str::to_string),
                    is_delete_marker: true,
                    is_latest: marker.is_latest().unwrap_or(false),
                    size_bytes: None,
                    digest: None,
                })
            }))
            .collect();

        let next = (output.is_truncated() == Some(true)).then(|| VersionMarker {
            key_marker: output.next_key_marker().map(str::to_string),
            version_id_marker: output.next_version_id_marker().map(str::to_string),
        });
        Ok(VersionPage { versions, next })
    }

    async fn delete_versions(
        &self,
        bucket: &str,
        versions: &[VersionRef],
    ) -> RemoteResult<Vec<DeleteFailure>> {
        if versions.is_empty() {
            return Ok(Vec::new());
        }
        let identifiers = versions
            .iter()
            .map(|version| {
                ObjectIdentifier::builder()
                    .key(&version.key)
                    .set_version_id(version.version_id.clone())
                    .build()
            })
            .collect::<Result<Vec<_>, _>>()
            .map_err(build_error)?;
        let delete = Delete::builder()
            .set_objects(Some(identifiers))
            .quiet(true)
            .build()
            .map_err(build_error)?;

        let output = self
            .client
            .delete_objects()
            .bucket(bucket)
            .delete(delete)
            .send()
            .await
            .map_err(classify)?;

        Ok(output
            .errors()
            .iter()
            .map(|err| DeleteFailure {
                key: err.key().unwrap_or_default().to_string(),
                version_id: err.version_id().map(str::to_string),
                code: err.code().map(str::to_string),
                message: err.message().unwrap_or("no message").to_string(),
            })
            .collect())
    }

    async fn list_multipart_uploads_page(
        &self,
        bucket: &str,
        marker: Option<VersionMarker>,
    ) -> RemoteResult<UploadPage> {
        let marker = marker.unwrap_or_default();
        let output = self
            .client
            .list_multipart_uploads()
            .bucket(bucket)
            .set_key_marker(marker.key_marker)
            .set_upload_id_marker(marker.version_id_marker)
            .send()
            .await
            .map_err(classify)?;

        let uploads = output
            .uploads()
            .iter()
            .filter_map(|upload| {
                Some(PendingUpload {
                    key: upload.key()?.to_string(),
                    upload_id: upload.upload_id()?.to_string(),
                })
            })
            .collect();
        let next = (output.is_truncated() == Some(true)).then(|| VersionMarker {
            key_marker: output.next_key_marker().map(str::to_string),
            version_id_marker: output.next_upload_id_marker().map(str::to_string),
        });
        Ok(UploadPage { uploads, next })
    }

    async fn abort_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
    ) -> RemoteResult<()> {
        self.client
            .abort_multipart_upload()
            .bucket(bucket)
            .key(key)
            .upload_id(upload_id)
            .send()
            .await
            .map_err(classify)?;
        Ok(())
    }

    async fn delete_bucket(&self, bucket: &str) -> RemoteResult<()> {
        self.client
            .delete_bucket()
            .bucket(bucket)
            .send()
            .await
            .map_err(classify)?;
        Ok(())
    }
}
