//! S3 object store.

use async_trait::async_trait;
use aws_sdk_s3::config::{BehaviorVersion, Credentials, Region};
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{Delete, ObjectIdentifier};
use aws_sdk_s3::Client;
use tracing::{debug, info, warn};

use super::objects::{ObjectMetadata, RemoteObjectStore};
use super::{
    BackendSettings, ACCESS_KEY_ID_KEY, REGION_KEY, REMOTE_BACKEND_FLAG, SECRET_ACCESS_KEY_KEY,
};
use crate::errors::{ConfigError, RemoteObjectError};

/// `DeleteObjects` accepts at most this many keys per request.
const DELETE_BATCH: usize = 1000;

/// A [`RemoteObjectStore`] backed by S3 with static credentials.
#[derive(Debug, Clone)]
pub struct S3ObjectStore {
    client: Client,
}

impl S3ObjectStore {
    /// Builds a client from the remote backend settings.
    pub fn from_settings(settings: &BackendSettings) -> Result<Self, ConfigError> {
        let require = |value: &Option<String>, key: &str| {
            value
                .clone()
                .ok_or_else(|| ConfigError::remote_backend(key, REMOTE_BACKEND_FLAG))
        };

        let credentials = Credentials::new(
            require(&settings.access_key_id, ACCESS_KEY_ID_KEY)?,
            require(&settings.secret_access_key, SECRET_ACCESS_KEY_KEY)?,
            settings.session_token.clone(),
            None,
            "infrastage",
        );
        let config = aws_sdk_s3::Config::builder()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new(require(&settings.region, REGION_KEY)?))
            .credentials_provider(credentials)
            .build();

        Ok(Self {
            client: Client::from_conf(config),
        })
    }

    /// Wraps an existing client.
    #[must_use]
    pub fn from_client(client: Client) -> Self {
        Self { client }
    }

    async fn list_keys(&self, bucket: &str, prefix: &str) -> Result<Vec<String>, RemoteObjectError> {
        let mut keys = Vec::new();
        let mut token: Option<String> = None;
        loop {
            let page = self
                .client
                .list_objects_v2()
                .bucket(bucket)
                .prefix(prefix)
                .set_continuation_token(token.take())
                .send()
                .await
                .map_err(|e| RemoteObjectError::new("list", bucket, prefix, DisplayErrorContext(&e).to_string()))?;

            keys.extend(page.contents().iter().filter_map(|object| object.key().map(str::to_string)));
            match page.next_continuation_token() {
                Some(next) if page.is_truncated().unwrap_or(false) => token = Some(next.to_string()),
                _ => break,
            }
        }
        Ok(keys)
    }
}

#[async_trait]
impl RemoteObjectStore for S3ObjectStore {
    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        body: Vec<u8>,
        metadata: ObjectMetadata,
    ) -> Result<(), RemoteObjectError> {
        self.client
            .put_object()
            .bucket(bucket)
            .key(key)
            .content_type("application/json")
            .set_metadata(Some(metadata.into_iter().collect()))
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(|e| RemoteObjectError::new("upload", bucket, key, DisplayErrorContext(&e).to_string()))?;
        info!("☁️ Uploaded s3://{bucket}/{key}");
        Ok(())
    }

    async fn delete_prefix(&self, bucket: &str, prefix: &str) -> Result<usize, RemoteObjectError> {
        let keys = self.list_keys(bucket, prefix).await?;
        if keys.is_empty() {
            info!(prefix = %prefix, "🔍 No remote objects to clean up");
            return Ok(0);
        }

        let mut deleted = 0;
        for batch in keys.chunks(DELETE_BATCH) {
            let delete_error = |reason: String| RemoteObjectError::new("delete", bucket, prefix, reason);
            let objects = batch
                .iter()
                .map(|key| ObjectIdentifier::builder().key(key).build())
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| delete_error(e.to_string()))?;
            let delete = Delete::builder()
                .set_objects(Some(objects))
                .quiet(false)
                .build()
                .map_err(|e| delete_error(e.to_string()))?;

            let output = self
                .client
                .delete_objects()
                .bucket(bucket)
                .delete(delete)
                .send()
                .await
                .map_err(|e| delete_error(DisplayErrorContext(&e).to_string()))?;

            for object in output.deleted() {
                debug!("🗑️ Deleted s3://{bucket}/{}", object.key().unwrap_or_default());
            }
            for failure in output.errors() {
                warn!(
                    key = failure.key().unwrap_or_default(),
                    message = failure.message().unwrap_or_default(),
                    "⚠️ Failed to delete remote object"
                );
            }
            deleted += output.deleted().len();
        }

        info!(prefix = %prefix, deleted, "✅ Remote objects cleaned up");
        Ok(deleted)
    }
}
