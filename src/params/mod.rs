//! Secret and allow-list parameters, resolved per invocation.
//!
//! Values are never cached across invocations: every [`ScopedParameters::resolve`]
//! goes back to the source, so a rotated key or an edited allow-list takes
//! effect on the next message.

pub mod allowlist;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use tokio::sync::RwLock;
use tracing::debug;

use crate::access::{AccessPolicy, Permission, Principal, Resource};
use crate::error::ParameterError;

pub use allowlist::AllowList;

/// A hierarchical parameter store (`/app/name` paths).
#[async_trait]
pub trait ParameterSource: Send + Sync {
    /// Fetch a parameter. Absent paths fail with `NotFound`.
    async fn get_parameter(&self, path: &str) -> Result<SecretString, ParameterError>;
}

fn not_found(path: &str) -> ParameterError {
    ParameterError::NotFound {
        path: path.to_string(),
    }
}

/// Parameters held in memory. Values can be replaced at runtime.
#[derive(Default)]
pub struct InMemoryParameters {
    values: RwLock<HashMap<String, String>>,
}

impl InMemoryParameters {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set(&self, path: impl Into<String>, value: impl Into<String>) {
        self.values
            .write()
            .await
            .insert(path.into(), value.into());
    }

    pub async fn remove(&self, path: &str) {
        self.values.write().await.remove(path);
    }
}

#[async_trait]
impl ParameterSource for InMemoryParameters {
    async fn get_parameter(&self, path: &str) -> Result<SecretString, ParameterError> {
        self.values
            .read()
            .await
            .get(path)
            .map(|v| SecretString::from(v.clone()))
            .ok_or_else(|| not_found(path))
    }
}

/// Parameters read from environment variables.
///
/// `/hsa-receipt-archiver/anthropic-api-key` maps to
/// `HSA_RECEIPT_ARCHIVER_ANTHROPIC_API_KEY`. Read on every call.
#[derive(Debug, Default, Clone)]
pub struct EnvParameters;

impl EnvParameters {
    pub fn var_name(path: &str) -> String {
        path.trim_start_matches('/')
            .chars()
            .map(|c| match c {
                '/' | '-' | '.' => '_',
                c => c.to_ascii_uppercase(),
            })
            .collect()
    }
}

#[async_trait]
impl ParameterSource for EnvParameters {
    async fn get_parameter(&self, path: &str) -> Result<SecretString, ParameterError> {
        std::env::var(Self::var_name(path))
            .map(SecretString::from)
            .map_err(|_| not_found(path))
    }
}

/// A parameter source seen through one principal's grants.
#[derive(Clone)]
pub struct ScopedParameters {
    source: Arc<dyn ParameterSource>,
    policy: Arc<AccessPolicy>,
    principal: Principal,
}

impl ScopedParameters {
    pub fn new(source: Arc<dyn ParameterSource>, policy: Arc<AccessPolicy>, principal: Principal) -> Self {
        Self {
            source,
            policy,
            principal,
        }
    }

    /// Resolve a parameter. The permission check happens before the source is touched.
    pub async fn resolve(&self, path: &str) -> Result<SecretString, ParameterError> {
        self.policy
            .authorize(self.principal, Permission::ParameterRead, &Resource::Parameter(path))?;
        let value = self.source.get_parameter(path).await?;
        debug!(principal = %self.principal, path = %path, "Parameter resolved");
        Ok(value)
    }

    /// Resolve and parse a sender allow-list parameter.
    pub async fn resolve_allow_list(&self, path: &str) -> Result<AllowList, ParameterError> {
        let raw = self.resolve(path).await?;
        Ok(AllowList::parse(raw.expose_secret()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IntakeConfig;

    async fn scoped(principal: Principal) -> (Arc<InMemoryParameters>, ScopedParameters) {
        let config = IntakeConfig::default();
        let source = Arc::new(InMemoryParameters::new());
        source.set(config.api_key_param(), "sk-test").await;
        source.set("/other-app/secret", "nope").await;
        let policy = Arc::new(AccessPolicy::least_privilege(&config));
        (source.clone(), ScopedParameters::new(source, policy, principal))
    }

    #[tokio::test]
    async fn processor_reads_own_namespace() {
        let (_, params) = scoped(Principal::Processor).await;
        let key = params
            .resolve("/hsa-receipt-archiver/anthropic-api-key")
            .await
            .unwrap();
        assert_eq!(key.expose_secret(), "sk-test");
    }

    #[tokio::test]
    async fn unconfigured_path_is_not_found() {
        let (_, params) = scoped(Principal::Processor).await;
        assert!(matches!(
            params.resolve("/hsa-receipt-archiver/allowed-senders").await,
            Err(ParameterError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn foreign_namespace_denied() {
        let (_, params) = scoped(Principal::Processor).await;
        assert!(matches!(
            params.resolve("/other-app/secret").await,
            Err(ParameterError::AccessDenied(_))
        ));
    }

    #[tokio::test]
    async fn router_cannot_read_parameters() {
        let (_, params) = scoped(Principal::IngestionRouter).await;
        assert!(matches!(
            params.resolve("/hsa-receipt-archiver/anthropic-api-key").await,
            Err(ParameterError::AccessDenied(_))
        ));
    }

    #[tokio::test]
    async fn updates_visible_on_next_resolve() {
        let (source, params) = scoped(Principal::Processor).await;
        let path = "/hsa-receipt-archiver/allowed-senders";
        source.set(path, "alice@example.com").await;
        assert!(
            params
                .resolve_allow_list(path)
                .await
                .unwrap()
                .permits("alice@example.com")
        );

        source.set(path, "bob@example.com").await;
        let list = params.resolve_allow_list(path).await.unwrap();
        assert!(!list.permits("alice@example.com"));
        assert!(list.permits("bob@example.com"));
    }

    #[test]
    fn env_var_name_mapping() {
        assert_eq!(
            EnvParameters::var_name("/hsa-receipt-archiver/anthropic-api-key"),
            "HSA_RECEIPT_ARCHIVER_ANTHROPIC_API_KEY"
        );
    }
}
