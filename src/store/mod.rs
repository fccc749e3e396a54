//! Artifact store: a named bucket over a pluggable object backend.
//!
//! [`Bucket`] adds key validation and retention evaluation on top of an
//! [`ObjectBackend`]. Components never hold a `Bucket` directly; they get a
//! [`BucketHandle`] bound to their [`Principal`], which checks every call
//! against the access policy. Only the retention sweeper deletes.

pub mod libsql_backend;
pub mod memory;
pub mod migrations;
pub mod retention;
pub mod traits;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::access::{AccessPolicy, Permission, Principal, Resource};
use crate::error::StoreError;

pub use libsql_backend::LibSqlBackend;
pub use memory::MemoryBackend;
pub use retention::{RetentionDecision, RetentionEngine, RetentionSweeper};
pub use traits::{ArtifactMeta, ArtifactRef, ObjectBackend, TagSet};

/// A named bucket with retention rules.
pub struct Bucket {
    name: String,
    backend: Arc<dyn ObjectBackend>,
    retention: RetentionEngine,
}

impl Bucket {
    pub fn new(
        name: impl Into<String>,
        backend: Arc<dyn ObjectBackend>,
        retention: RetentionEngine,
    ) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            backend,
            retention,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn retention(&self) -> &RetentionEngine {
        &self.retention
    }

    /// Bind this bucket to a principal under `policy`.
    pub fn handle(self: &Arc<Self>, policy: Arc<AccessPolicy>, principal: Principal) -> BucketHandle {
        BucketHandle {
            bucket: Arc::clone(self),
            policy,
            principal,
        }
    }

    pub async fn put(&self, key: &str, body: Vec<u8>, tags: TagSet) -> Result<ArtifactRef, StoreError> {
        validate_key(key)?;
        let meta = self.backend.put_object(key, body, tags, Utc::now()).await?;
        info!(
            bucket = %self.name,
            key = %key,
            size = meta.size,
            expires_at = ?self.retention.evaluate(&meta).map(|d| d.expires_at),
            "Artifact stored"
        );
        Ok(meta.to_ref(&self.name))
    }

    pub async fn get(&self, key: &str) -> Result<Vec<u8>, StoreError> {
        self.backend.get_object(key).await
    }

    pub async fn head(&self, key: &str) -> Result<ArtifactMeta, StoreError> {
        self.backend.head_object(key).await
    }

    /// Merge tags into an artifact. Expiration is re-evaluated from the new tag state.
    pub async fn tag(&self, key: &str, tags: TagSet) -> Result<ArtifactMeta, StoreError> {
        let meta = self.backend.tag_object(key, &tags, Utc::now()).await?;
        let decision = self.retention.evaluate(&meta);
        info!(
            bucket = %self.name,
            key = %key,
            tags = ?meta.tags,
            rule = decision.as_ref().map(|d| d.rule_id.as_str()).unwrap_or("none"),
            expires_at = ?decision.as_ref().map(|d| d.expires_at),
            "Artifact tagged"
        );
        Ok(meta)
    }

    /// Current expiration for an artifact, or `None` if no rule applies.
    pub async fn expiration(&self, key: &str) -> Result<Option<DateTime<Utc>>, StoreError> {
        let meta = self.backend.head_object(key).await?;
        Ok(self.retention.evaluate(&meta).map(|d| d.expires_at))
    }

    pub async fn list(&self, prefix: &str) -> Result<Vec<ArtifactMeta>, StoreError> {
        self.backend.list_objects(prefix).await
    }

    pub(crate) async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let existed = self.backend.delete_object(key).await?;
        debug!(bucket = %self.name, key = %key, existed, "Artifact deleted");
        Ok(existed)
    }
}

/// A bucket seen through one principal's grants.
#[derive(Clone)]
pub struct BucketHandle {
    bucket: Arc<Bucket>,
    policy: Arc<AccessPolicy>,
    principal: Principal,
}

impl BucketHandle {
    pub fn name(&self) -> &str {
        self.bucket.name()
    }

    fn authorize(&self, permission: Permission, key: &str) -> Result<(), StoreError> {
        self.policy.authorize(
            self.principal,
            permission,
            &Resource::Object {
                bucket: self.bucket.name(),
                key,
            },
        )?;
        Ok(())
    }

    pub async fn put(&self, key: &str, body: Vec<u8>, tags: TagSet) -> Result<ArtifactRef, StoreError> {
        self.authorize(Permission::StoreWrite, key)?;
        self.bucket.put(key, body, tags).await
    }

    pub async fn get(&self, key: &str) -> Result<Vec<u8>, StoreError> {
        self.authorize(Permission::StoreRead, key)?;
        self.bucket.get(key).await
    }

    pub async fn head(&self, key: &str) -> Result<ArtifactMeta, StoreError> {
        self.authorize(Permission::StoreRead, key)?;
        self.bucket.head(key).await
    }

    pub async fn tag(&self, key: &str, tags: TagSet) -> Result<ArtifactMeta, StoreError> {
        self.authorize(Permission::StoreTag, key)?;
        self.bucket.tag(key, tags).await
    }

    pub async fn expiration(&self, key: &str) -> Result<Option<DateTime<Utc>>, StoreError> {
        self.authorize(Permission::StoreRead, key)?;
        self.bucket.expiration(key).await
    }

    /// List objects under `prefix`. Authorized as a read of the prefix itself.
    pub async fn list(&self, prefix: &str) -> Result<Vec<ArtifactMeta>, StoreError> {
        self.authorize(Permission::StoreRead, prefix)?;
        self.bucket.list(prefix).await
    }
}

/// Reject keys that are empty, absolute, or contain path traversal segments.
fn validate_key(key: &str) -> Result<(), StoreError> {
    let reason = if key.is_empty() {
        Some("empty key")
    } else if key.starts_with('/') {
        Some("key must be relative")
    } else if key.split('/').any(|seg| seg == "..") {
        Some("key must not contain '..'")
    } else {
        None
    };

    match reason {
        Some(reason) => Err(StoreError::InvalidKey {
            key: key.to_string(),
            reason: reason.into(),
        }),
        None => Ok(()),
    }
}
