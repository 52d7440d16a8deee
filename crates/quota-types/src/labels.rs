//! Labels, annotations and field-owner tags shared across the quota
//! control plane and the admission boundary.

/// Label marking a claim as created by automation rather than a user.
pub const AUTO_CREATED_LABEL: &str = "quota.miloapis.com/auto-created";

/// Label naming the policy a record was created from.
pub const POLICY_LABEL: &str = "quota.miloapis.com/policy";

/// Annotation naming the component that created a claim.
pub const CREATED_BY_ANNOTATION: &str = "quota.miloapis.com/created-by";

/// Annotation naming the trigger resource a claim was created for.
pub const RESOURCE_NAME_ANNOTATION: &str = "quota.miloapis.com/resource-name";

/// `created-by` value stamped by the claim creation admission plugin.
pub const CLAIM_CREATION_PLUGIN: &str = "claim-creation-plugin";

/// Field owner of ownership controller writes on claim metadata.
pub const OWNERSHIP_FIELD_MANAGER: &str = "resourceclaim-ownership-metadata";

/// Field owner of bucket controller writes on claim allocations.
///
/// The bucket name is part of the tag so two bucket controllers working on
/// different resource types of the same claim own disjoint fields.
pub fn bucket_field_manager(bucket_name: &str) -> String {
    format!("allowance-bucket-{bucket_name}")
}
