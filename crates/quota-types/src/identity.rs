//! Deterministic bucket identity.
//!
//! Every writer that needs to locate the bucket of a `(consumer, resource
//! type)` tuple derives the same name and namespace from these functions,
//! which is what makes the bucket controller's single-writer rule and the
//! on-demand bootstrap possible without any coordination.

use sha2::{Digest, Sha256};

use crate::refs::ConsumerRef;

/// Consumer kind that owns a dedicated per-organization namespace.
pub const ORGANIZATION_KIND: &str = "Organization";

/// Namespace prefix for organization-owned buckets.
pub const ORGANIZATION_NAMESPACE_PREFIX: &str = "organization-";

/// Namespace holding the buckets of every non-organization consumer.
pub const SYSTEM_NAMESPACE: &str = "quota-system";

/// Derives the bucket object name for a `(consumer, resource type)` tuple.
///
/// The name is `bucket-` followed by the lower-case hex SHA-256 of the
/// resource type, consumer kind and consumer name concatenated in that
/// order. Hex output keeps the result DNS-safe.
pub fn bucket_name(resource_type: &str, consumer_kind: &str, consumer_name: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(resource_type.as_bytes());
    hasher.update(consumer_kind.as_bytes());
    hasher.update(consumer_name.as_bytes());
    format!("bucket-{:x}", hasher.finalize())
}

/// Derives the namespace a consumer's buckets live in.
///
/// Organizations get their own `organization-<name>` namespace; everything
/// else shares the system namespace.
pub fn bucket_namespace(consumer: &ConsumerRef) -> String {
    if consumer.kind == ORGANIZATION_KIND {
        format!("{ORGANIZATION_NAMESPACE_PREFIX}{}", consumer.name)
    } else {
        SYSTEM_NAMESPACE.to_owned()
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;
    use crate::validation::is_rfc_1123_subdomain;

    fn organization(name: &str) -> ConsumerRef {
        ConsumerRef {
            group: "resourcemanager.miloapis.com".to_owned(),
            kind: ORGANIZATION_KIND.to_owned(),
            name: name.to_owned(),
            namespace: None,
        }
    }

    #[test]
    fn name_is_deterministic() {
        let first = bucket_name("resourcemanager.miloapis.com/projects", "Organization", "acme");
        let second = bucket_name("resourcemanager.miloapis.com/projects", "Organization", "acme");

        assert_eq!(first, second);
    }

    #[test]
    fn name_depends_on_every_input() {
        let base = bucket_name("compute.miloapis.com/workloads", "Organization", "acme");

        assert_ne!(base, bucket_name("compute.miloapis.com/gateways", "Organization", "acme"));
        assert_ne!(base, bucket_name("compute.miloapis.com/workloads", "Project", "acme"));
        assert_ne!(base, bucket_name("compute.miloapis.com/workloads", "Organization", "globex"));
    }

    #[test]
    fn name_is_dns_safe() {
        let name = bucket_name("resourcemanager.miloapis.com/projects", "Organization", "acme");

        assert!(name.starts_with("bucket-"));
        assert_eq!(name, name.to_lowercase());
        assert!(is_rfc_1123_subdomain(&name).is_ok());
    }

    #[rstest]
    #[case::organization(organization("acme"), "organization-acme")]
    #[case::other_kind(
        ConsumerRef {
            group: "resourcemanager.miloapis.com".to_owned(),
            kind: "Project".to_owned(),
            name: "acme".to_owned(),
            namespace: None,
        },
        SYSTEM_NAMESPACE
    )]
    fn namespace_derivation(#[case] consumer: ConsumerRef, #[case] expected: &str) {
        assert_eq!(bucket_namespace(&consumer), expected);
    }
}
