//! Objects stored next to remote state.
//!
//! With the remote backend enabled, every stage's variable document is
//! uploaded beside its state object so a failed CI job can be inspected and
//! cleaned up from elsewhere. Once a run is fully torn down, everything
//! under its prefix is deleted.

use async_trait::async_trait;
use std::collections::BTreeMap;

use crate::errors::RemoteObjectError;

/// Object metadata, as string pairs.
pub type ObjectMetadata = BTreeMap<String, String>;

/// The bucket operations the orchestrator needs.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RemoteObjectStore: Send + Sync {
    /// Uploads one object, replacing any existing one.
    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        body: Vec<u8>,
        metadata: ObjectMetadata,
    ) -> Result<(), RemoteObjectError>;

    /// Deletes every object under `prefix` and returns how many went.
    async fn delete_prefix(&self, bucket: &str, prefix: &str) -> Result<usize, RemoteObjectError>;
}
