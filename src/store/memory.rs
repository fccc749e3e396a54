//! In-memory object backend.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::StoreError;
use crate::store::traits::{ArtifactMeta, ObjectBackend, TagSet};

struct StoredObject {
    body: Vec<u8>,
    meta: ArtifactMeta,
}

/// Object backend kept entirely in memory. Used by tests and ephemeral runs.
#[derive(Default)]
pub struct MemoryBackend {
    objects: RwLock<BTreeMap<String, StoredObject>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

fn not_found(key: &str) -> StoreError {
    StoreError::NotFound {
        key: key.to_string(),
    }
}

#[async_trait]
impl ObjectBackend for MemoryBackend {
    async fn put_object(
        &self,
        key: &str,
        body: Vec<u8>,
        tags: TagSet,
        now: DateTime<Utc>,
    ) -> Result<ArtifactMeta, StoreError> {
        let mut objects = self.objects.write().await;

        if let Some(existing) = objects.get(key) {
            if existing.body == body {
                debug!(key = %key, "Identical object already stored");
                return Ok(existing.meta.clone());
            }
            return Err(StoreError::WriteFailure {
                key: key.to_string(),
                reason: "object already exists with different content".into(),
            });
        }

        let meta = ArtifactMeta::new(key, body.len() as u64, tags, now);
        objects.insert(
            key.to_string(),
            StoredObject {
                body,
                meta: meta.clone(),
            },
        );
        Ok(meta)
    }

    async fn get_object(&self, key: &str) -> Result<Vec<u8>, StoreError> {
        self.objects
            .read()
            .await
            .get(key)
            .map(|o| o.body.clone())
            .ok_or_else(|| not_found(key))
    }

    async fn head_object(&self, key: &str) -> Result<ArtifactMeta, StoreError> {
        self.objects
            .read()
            .await
            .get(key)
            .map(|o| o.meta.clone())
            .ok_or_else(|| not_found(key))
    }

    async fn tag_object(
        &self,
        key: &str,
        tags: &TagSet,
        now: DateTime<Utc>,
    ) -> Result<ArtifactMeta, StoreError> {
        let mut objects = self.objects.write().await;
        let object = objects.get_mut(key).ok_or_else(|| not_found(key))?;
        object.meta.apply_tags(tags, now);
        Ok(object.meta.clone())
    }

    async fn list_objects(&self, prefix: &str) -> Result<Vec<ArtifactMeta>, StoreError> {
        let objects = self.objects.read().await;
        Ok(objects
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(_, o)| o.meta.clone())
            .collect())
    }

    async fn delete_object(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.objects.write().await.remove(key).is_some())
    }
}
