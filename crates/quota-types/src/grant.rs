use k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::{
    conditions::{self, TYPE_ACTIVE},
    refs::ConsumerRef,
};

/// Allocates capacity of one or more resource types to a consumer.
///
/// Grants are created by administrators or by the grant-creation executor
/// on behalf of a policy. Only grants whose `Active` condition is `True`
/// contribute to bucket limits.
#[derive(CustomResource, Clone, Debug, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[kube(
    group = "quota.miloapis.com",
    version = "v1alpha1",
    kind = "ResourceGrant",
    plural = "resourcegrants",
    status = "ResourceGrantStatus",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct ResourceGrantSpec {
    /// Consumer the granted capacity is accounted against.
    pub consumer_ref: ConsumerRef,

    /// Capacity granted per resource type.
    pub allowances: Vec<Allowance>,
}

/// Capacity granted for a single resource type.
#[derive(Clone, Debug, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Allowance {
    /// Slashed resource type identifier the capacity applies to.
    pub resource_type: String,

    /// Granted amounts. At least one bucket is required; the amounts of
    /// all buckets are summed into the limit contribution.
    pub buckets: Vec<GrantBucket>,
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GrantBucket {
    /// Granted amount in base units. Must not be negative.
    pub amount: i64,
}

#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceGrantStatus {
    /// `Active` is managed by the grant lifecycle loop; the bucket
    /// controller only reads it.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    #[schemars(schema_with = "crate::conditions::schema")]
    pub conditions: Vec<Condition>,

    /// Generation most recently processed by the grant lifecycle loop.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

impl ResourceGrant {
    /// Whether this grant currently contributes to bucket limits.
    pub fn is_active(&self) -> bool {
        self.status
            .as_ref()
            .is_some_and(|status| conditions::is_condition_true(&status.conditions, TYPE_ACTIVE))
    }

    /// Sum of the granted amounts for `resource_type` across all matching
    /// allowances and their buckets.
    pub fn amount_for(&self, resource_type: &str) -> i64 {
        self.spec
            .allowances
            .iter()
            .filter(|allowance| allowance.resource_type == resource_type)
            .flat_map(|allowance| &allowance.buckets)
            .map(|bucket| bucket.amount)
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use kube::api::ObjectMeta;

    use super::*;

    fn grant(amounts: &[(&str, i64)]) -> ResourceGrant {
        ResourceGrant {
            metadata: ObjectMeta::default(),
            spec: ResourceGrantSpec {
                consumer_ref: ConsumerRef {
                    kind: "Organization".to_owned(),
                    name: "acme".to_owned(),
                    ..ConsumerRef::default()
                },
                allowances: amounts
                    .iter()
                    .map(|(resource_type, amount)| Allowance {
                        resource_type: (*resource_type).to_owned(),
                        buckets: vec![GrantBucket { amount: *amount }],
                    })
                    .collect(),
            },
            status: None,
        }
    }

    #[test]
    fn amount_sums_matching_allowances_only() {
        let grant = grant(&[
            ("resourcemanager.miloapis.com/projects", 10),
            ("compute.miloapis.com/workloads", 4),
            ("resourcemanager.miloapis.com/projects", 5),
        ]);

        assert_eq!(grant.amount_for("resourcemanager.miloapis.com/projects"), 15);
        assert_eq!(grant.amount_for("compute.miloapis.com/workloads"), 4);
        assert_eq!(grant.amount_for("iam.miloapis.com/roles"), 0);
    }

    #[test]
    fn grant_without_status_is_inactive() {
        assert!(!grant(&[]).is_active());
    }
}
