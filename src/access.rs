//! Least-privilege access policy.
//!
//! Every component acts as a [`Principal`] and every call it makes is checked
//! against the grants in an [`AccessPolicy`]. A call outside the granted
//! permission/resource scope fails with [`AccessDenied`] at call time.
//!
//! The default policy (`AccessPolicy::least_privilege`) grants:
//! - ingestion router: read-write on the artifact bucket, invoke on the processor
//! - processor: read-write-tag on the artifact bucket, parameter read under the
//!   app namespace, email send to any destination
//! - budget service: publish on the budget alert topic

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::config::IntakeConfig;
use crate::error::AccessDenied;

/// Identity a component acts as.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Principal {
    IngestionRouter,
    Processor,
    BudgetService,
}

impl fmt::Display for Principal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::IngestionRouter => "ingestion-router",
            Self::Processor => "processor",
            Self::BudgetService => "budget-service",
        };
        f.write_str(s)
    }
}

/// A single action a principal may perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Permission {
    StoreRead,
    StoreWrite,
    StoreTag,
    ParameterRead,
    FunctionInvoke,
    EmailSend,
    TopicPublish,
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::StoreRead => "store:read",
            Self::StoreWrite => "store:write",
            Self::StoreTag => "store:tag",
            Self::ParameterRead => "parameter:read",
            Self::FunctionInvoke => "function:invoke",
            Self::EmailSend => "email:send",
            Self::TopicPublish => "topic:publish",
        };
        f.write_str(s)
    }
}

/// A concrete resource being accessed.
#[derive(Debug, Clone, Copy)]
pub enum Resource<'a> {
    Object { bucket: &'a str, key: &'a str },
    Parameter(&'a str),
    Function(&'a str),
    Mailbox(&'a str),
    Topic(&'a str),
}

impl fmt::Display for Resource<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Object { bucket, key } => write!(f, "object:{bucket}/{key}"),
            Self::Parameter(path) => write!(f, "param:{path}"),
            Self::Function(name) => write!(f, "function:{name}"),
            Self::Mailbox(addr) => write!(f, "mailbox:{addr}"),
            Self::Topic(name) => write!(f, "topic:{name}"),
        }
    }
}

/// The resource set a grant covers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Scope {
    /// Every object in one bucket.
    Bucket(String),
    /// Parameters whose path starts with this prefix.
    ParameterPrefix(String),
    /// One processing function.
    Function(String),
    /// Any outbound email destination.
    AnyMailbox,
    /// One pub/sub topic.
    Topic(String),
}

impl Scope {
    fn covers(&self, resource: &Resource<'_>) -> bool {
        match (self, resource) {
            (Self::Bucket(name), Resource::Object { bucket, .. }) => name == bucket,
            (Self::ParameterPrefix(prefix), Resource::Parameter(path)) => path.starts_with(prefix),
            (Self::Function(name), Resource::Function(f)) => name == f,
            (Self::AnyMailbox, Resource::Mailbox(_)) => true,
            (Self::Topic(name), Resource::Topic(t)) => name == t,
            _ => false,
        }
    }
}

/// Permissions granted to one principal over one scope.
#[derive(Debug, Clone)]
pub struct Grant {
    pub principal: Principal,
    pub permissions: Vec<Permission>,
    pub scope: Scope,
}

/// Set of grants. Anything not granted is denied.
#[derive(Debug, Clone, Default)]
pub struct AccessPolicy {
    grants: Vec<Grant>,
}

impl AccessPolicy {
    /// Policy with no grants (denies everything).
    pub fn deny_all() -> Self {
        Self::default()
    }

    /// The minimal grant set the intake pipeline needs.
    pub fn least_privilege(config: &IntakeConfig) -> Self {
        Self::deny_all()
            .grant(
                Principal::IngestionRouter,
                &[Permission::StoreRead, Permission::StoreWrite],
                Scope::Bucket(config.bucket_name.clone()),
            )
            .grant(
                Principal::IngestionRouter,
                &[Permission::FunctionInvoke],
                Scope::Function(config.function_name()),
            )
            .grant(
                Principal::Processor,
                &[
                    Permission::StoreRead,
                    Permission::StoreWrite,
                    Permission::StoreTag,
                ],
                Scope::Bucket(config.bucket_name.clone()),
            )
            .grant(
                Principal::Processor,
                &[Permission::ParameterRead],
                Scope::ParameterPrefix(config.parameter_prefix()),
            )
            .grant(Principal::Processor, &[Permission::EmailSend], Scope::AnyMailbox)
            .grant(
                Principal::BudgetService,
                &[Permission::TopicPublish],
                Scope::Topic(config.budget_topic_name()),
            )
    }

    /// Add a grant.
    pub fn grant(mut self, principal: Principal, permissions: &[Permission], scope: Scope) -> Self {
        self.grants.push(Grant {
            principal,
            permissions: permissions.to_vec(),
            scope,
        });
        self
    }

    /// Check whether `principal` may perform `permission` on `resource`.
    pub fn authorize(
        &self,
        principal: Principal,
        permission: Permission,
        resource: &Resource<'_>,
    ) -> Result<(), AccessDenied> {
        let allowed = self.grants.iter().any(|g| {
            g.principal == principal && g.permissions.contains(&permission) && g.scope.covers(resource)
        });

        if allowed {
            Ok(())
        } else {
            warn!(
                principal = %principal,
                permission = %permission,
                resource = %resource,
                "Access denied"
            );
            Err(AccessDenied {
                principal,
                permission,
                resource: resource.to_string(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> AccessPolicy {
        AccessPolicy::least_privilege(&IntakeConfig::default())
    }

    fn object(key: &str) -> Resource<'_> {
        Resource::Object {
            bucket: "hsa-receipts",
            key,
        }
    }

    #[test]
    fn router_can_write_artifacts_but_not_tag() {
        let p = policy();
        assert!(p
            .authorize(Principal::IngestionRouter, Permission::StoreWrite, &object("raw-emails/a"))
            .is_ok());
        let err = p
            .authorize(Principal::IngestionRouter, Permission::StoreTag, &object("raw-emails/a"))
            .unwrap_err();
        assert_eq!(err.permission, Permission::StoreTag);
    }

    #[test]
    fn store_grant_is_bucket_scoped() {
        let p = policy();
        let other = Resource::Object {
            bucket: "someone-elses-bucket",
            key: "raw-emails/a",
        };
        assert!(p
            .authorize(Principal::Processor, Permission::StoreRead, &other)
            .is_err());
    }

    #[test]
    fn processor_parameter_reads_limited_to_namespace() {
        let p = policy();
        assert!(p
            .authorize(
                Principal::Processor,
                Permission::ParameterRead,
                &Resource::Parameter("/hsa-receipt-archiver/anthropic-api-key"),
            )
            .is_ok());
        assert!(p
            .authorize(
                Principal::Processor,
                Permission::ParameterRead,
                &Resource::Parameter("/other-app/db-password"),
            )
            .is_err());
        // Sibling prefix that merely shares a leading substring.
        assert!(p
            .authorize(
                Principal::Processor,
                Permission::ParameterRead,
                &Resource::Parameter("/hsa-receipt-archiver-staging/key"),
            )
            .is_err());
    }

    #[test]
    fn router_cannot_read_parameters() {
        let p = policy();
        assert!(p
            .authorize(
                Principal::IngestionRouter,
                Permission::ParameterRead,
                &Resource::Parameter("/hsa-receipt-archiver/allowed-senders"),
            )
            .is_err());
    }

    #[test]
    fn processor_may_email_anyone() {
        let p = policy();
        for addr in ["alice@example.com", "bob@elsewhere.org"] {
            assert!(p
                .authorize(Principal::Processor, Permission::EmailSend, &Resource::Mailbox(addr))
                .is_ok());
        }
        assert!(p
            .authorize(
                Principal::IngestionRouter,
                Permission::EmailSend,
                &Resource::Mailbox("alice@example.com"),
            )
            .is_err());
    }

    #[test]
    fn only_budget_service_publishes_alerts() {
        let p = policy();
        let topic = Resource::Topic("hsa-receipt-archiver-budget-alerts");
        assert!(p
            .authorize(Principal::BudgetService, Permission::TopicPublish, &topic)
            .is_ok());
        assert!(p
            .authorize(Principal::Processor, Permission::TopicPublish, &topic)
            .is_err());
    }

    #[test]
    fn deny_all_denies() {
        let p = AccessPolicy::deny_all();
        assert!(p
            .authorize(Principal::Processor, Permission::StoreRead, &object("raw-emails/a"))
            .is_err());
    }
}
