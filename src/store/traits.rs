//! `ObjectBackend` trait and the artifact types shared by every backend.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StoreError;

/// Object tags, keyed by tag name.
pub type TagSet = BTreeMap<String, String>;

/// Reference to a durably stored artifact, handed from the store action to the invoker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRef {
    pub bucket: String,
    pub key: String,
    pub size: u64,
    pub created_at: DateTime<Utc>,
}

/// Stored object metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactMeta {
    pub key: String,
    pub size: u64,
    pub created_at: DateTime<Utc>,
    pub tags: TagSet,
    /// When each tag key received its current value.
    #[serde(default)]
    pub tag_applied_at: BTreeMap<String, DateTime<Utc>>,
}

impl ArtifactMeta {
    /// Metadata for a freshly written object.
    pub fn new(key: &str, size: u64, tags: TagSet, now: DateTime<Utc>) -> Self {
        let tag_applied_at = tags.keys().map(|k| (k.clone(), now)).collect();
        Self {
            key: key.to_string(),
            size,
            created_at: now,
            tags,
            tag_applied_at,
        }
    }

    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags.get(key).map(String::as_str)
    }

    pub fn tag_applied_at(&self, key: &str) -> Option<DateTime<Utc>> {
        self.tag_applied_at.get(key).copied()
    }

    /// Merge `tags` into this object's tag set.
    ///
    /// Only keys whose value actually changes get a new applied-at time, so
    /// re-applying the same tag never pushes a tag-anchored deadline out.
    /// Returns whether anything changed.
    pub fn apply_tags(&mut self, tags: &TagSet, now: DateTime<Utc>) -> bool {
        let mut changed = false;
        for (k, v) in tags {
            if self.tags.get(k) != Some(v) {
                self.tags.insert(k.clone(), v.clone());
                self.tag_applied_at.insert(k.clone(), now);
                changed = true;
            }
        }
        changed
    }

    pub fn to_ref(&self, bucket: &str) -> ArtifactRef {
        ArtifactRef {
            bucket: bucket.to_string(),
            key: self.key.clone(),
            size: self.size,
            created_at: self.created_at,
        }
    }
}

/// Raw object storage. No access control and no retention; see [`super::Bucket`].
#[async_trait]
pub trait ObjectBackend: Send + Sync {
    /// Write an object.
    ///
    /// Objects are immutable: writing identical bytes to an existing key returns
    /// the existing metadata, different bytes fail with `WriteFailure`.
    async fn put_object(
        &self,
        key: &str,
        body: Vec<u8>,
        tags: TagSet,
        now: DateTime<Utc>,
    ) -> Result<ArtifactMeta, StoreError>;

    /// Read an object's bytes.
    async fn get_object(&self, key: &str) -> Result<Vec<u8>, StoreError>;

    /// Read an object's metadata.
    async fn head_object(&self, key: &str) -> Result<ArtifactMeta, StoreError>;

    /// Merge tags into an object's tag set.
    async fn tag_object(
        &self,
        key: &str,
        tags: &TagSet,
        now: DateTime<Utc>,
    ) -> Result<ArtifactMeta, StoreError>;

    /// List metadata for every object under `prefix`, ordered by key.
    async fn list_objects(&self, prefix: &str) -> Result<Vec<ArtifactMeta>, StoreError>;

    /// Delete an object. Returns whether it existed.
    async fn delete_object(&self, key: &str) -> Result<bool, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tags(pairs: &[(&str, &str)]) -> TagSet {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn new_meta_stamps_initial_tags() {
        let now = Utc::now();
        let meta = ArtifactMeta::new("raw-emails/a", 3, tags(&[("source", "relay")]), now);
        assert_eq!(meta.tag("source"), Some("relay"));
        assert_eq!(meta.tag_applied_at("source"), Some(now));
        assert_eq!(meta.created_at, now);
    }

    #[test]
    fn reapplying_same_tag_keeps_original_time() {
        let t0 = Utc::now();
        let t1 = t0 + chrono::Duration::hours(5);
        let mut meta = ArtifactMeta::new("raw-emails/a", 3, TagSet::new(), t0);

        assert!(meta.apply_tags(&tags(&[("status", "processed")]), t0));
        assert!(!meta.apply_tags(&tags(&[("status", "processed")]), t1));
        assert_eq!(meta.tag_applied_at("status"), Some(t0));
    }

    #[test]
    fn changing_tag_value_restamps() {
        let t0 = Utc::now();
        let t1 = t0 + chrono::Duration::hours(1);
        let mut meta = ArtifactMeta::new("k", 1, tags(&[("stage", "a")]), t0);
        assert!(meta.apply_tags(&tags(&[("stage", "b")]), t1));
        assert_eq!(meta.tag("stage"), Some("b"));
        assert_eq!(meta.tag_applied_at("stage"), Some(t1));
    }
}
