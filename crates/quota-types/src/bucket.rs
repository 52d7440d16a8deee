use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::refs::ConsumerRef;

/// The per-`(consumer, resource type)` aggregate of granted and consumed
/// capacity.
///
/// Buckets are created on demand and written exclusively by the bucket
/// controller; every other component treats them as read-only. The object
/// name and namespace are pure functions of the spec, see
/// [`crate::identity`].
#[derive(CustomResource, Clone, Debug, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[kube(
    group = "quota.miloapis.com",
    version = "v1alpha1",
    kind = "AllowanceBucket",
    plural = "allowancebuckets",
    status = "AllowanceBucketStatus",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct AllowanceBucketSpec {
    /// Consumer this bucket aggregates capacity for.
    pub consumer_ref: ConsumerRef,

    /// Slashed resource type identifier this bucket aggregates capacity of.
    pub resource_type: String,
}

#[derive(Clone, Debug, Default, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AllowanceBucketStatus {
    /// Sum of the active grant amounts matching this bucket.
    #[serde(default)]
    pub limit: i64,

    /// Capacity currently reserved by granted claim allocations.
    #[serde(default)]
    pub allocated: i64,

    /// `max(0, limit - allocated)`; never negative.
    #[serde(default)]
    pub available: i64,

    /// Number of claims holding at least one granted allocation here.
    #[serde(default)]
    pub claim_count: i32,

    /// Number of active grants contributing to the limit.
    #[serde(default)]
    pub grant_count: i32,

    /// The grants whose amounts were summed into the limit.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    #[schemars(schema_with = "contributing_grants_schema")]
    pub contributing_grant_refs: Vec<ContributingGrantRef>,

    /// When the controller last wrote a semantically changed status.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_reconciliation: Option<Time>,

    /// Generation most recently processed by the bucket controller.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

fn contributing_grants_schema(generator: &mut schemars::SchemaGenerator) -> schemars::Schema {
    crate::conditions::map_list_schema::<ContributingGrantRef>(generator, &["name"])
}

/// One grant's contribution to a bucket limit.
#[derive(Clone, Debug, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContributingGrantRef {
    /// Name of the contributing grant.
    pub name: String,

    /// Generation of the grant at the time its amount was summed.
    pub observed_generation: i64,

    /// Amount the grant contributed for this bucket's resource type.
    pub amount: i64,
}

impl AllowanceBucketStatus {
    /// Semantic equality, ignoring the reconciliation timestamp.
    pub fn semantically_equals(&self, other: &Self) -> bool {
        self.limit == other.limit
            && self.allocated == other.allocated
            && self.available == other.available
            && self.claim_count == other.claim_count
            && self.grant_count == other.grant_count
            && self.contributing_grant_refs == other.contributing_grant_refs
            && self.observed_generation == other.observed_generation
    }
}
