use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition, Time};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::{
    conditions::{self, TYPE_GRANTED},
    refs::{ConsumerRef, TypedObjectRef},
};

/// Requests consumption of registered resource types by a consumer.
///
/// Claims are created by the admission plugin or by claim creation
/// policies. The bucket controller answers each request with exactly one
/// allocation entry; an entry never leaves the `Granted` or `Denied`
/// state again.
#[derive(CustomResource, Clone, Debug, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[kube(
    group = "quota.miloapis.com",
    version = "v1alpha1",
    kind = "ResourceClaim",
    plural = "resourceclaims",
    status = "ResourceClaimStatus",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct ResourceClaimSpec {
    /// Consumer the requested capacity is accounted against.
    pub consumer_ref: ConsumerRef,

    /// Requested amounts, one entry per resource type.
    pub requests: Vec<ResourceRequest>,

    /// The object whose admission triggered this claim. When present, the
    /// ownership controller attaches it as the claim's parent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_ref: Option<TypedObjectRef>,
}

/// A single requested amount of one resource type.
#[derive(Clone, Debug, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceRequest {
    /// Slashed resource type identifier being consumed.
    pub resource_type: String,

    /// Requested amount in base units. Must not be negative.
    pub amount: i64,
}

#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceClaimStatus {
    /// One entry per requested resource type, keyed by `resourceType` so
    /// concurrent bucket controllers merge entry-wise.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    #[schemars(schema_with = "allocations_schema")]
    pub allocations: Vec<Allocation>,

    /// `Granted` reflects the whole-claim outcome once every request has
    /// been answered.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    #[schemars(schema_with = "crate::conditions::schema")]
    pub conditions: Vec<Condition>,
}

fn allocations_schema(generator: &mut schemars::SchemaGenerator) -> schemars::Schema {
    crate::conditions::map_list_schema::<Allocation>(generator, &["resourceType"])
}

/// Outcome of one request of a claim.
#[derive(Clone, Debug, Default, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Allocation {
    /// Resource type this entry answers.
    pub resource_type: String,

    /// Allocation outcome.
    pub status: AllocationStatus,

    /// Machine-readable reason for the outcome.
    #[serde(default)]
    pub reason: String,

    /// Human-readable context for the outcome.
    #[serde(default)]
    pub message: String,

    /// Amount reserved from the allocating bucket. Only set once granted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allocated_amount: Option<i64>,

    /// Name of the bucket the reservation was taken from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allocating_bucket: Option<String>,

    /// When this entry last changed state.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<Time>,
}

#[derive(
    strum::Display, Clone, Copy, Debug, Default, Deserialize, Eq, JsonSchema, PartialEq, Serialize,
)]
#[strum(serialize_all = "PascalCase")]
pub enum AllocationStatus {
    /// The request has not been answered yet.
    #[default]
    Pending,

    /// Capacity was reserved; the recorded amount is final.
    Granted,

    /// The request exceeded the available capacity; terminal.
    Denied,
}

impl ResourceClaim {
    /// The allocation entry answering `resource_type`, if any.
    pub fn allocation_for(&self, resource_type: &str) -> Option<&Allocation> {
        self.status
            .as_ref()?
            .allocations
            .iter()
            .find(|allocation| allocation.resource_type == resource_type)
    }

    /// Whether the aggregate `Granted` condition is `True`.
    pub fn is_granted(&self) -> bool {
        self.status
            .as_ref()
            .is_some_and(|status| conditions::is_condition_true(&status.conditions, TYPE_GRANTED))
    }

    /// The aggregate `Granted` condition, if published yet.
    pub fn granted_condition(&self) -> Option<&Condition> {
        conditions::find_condition(&self.status.as_ref()?.conditions, TYPE_GRANTED)
    }
}

#[cfg(test)]
mod tests {
    use kube::api::ObjectMeta;

    use super::*;

    #[test]
    fn allocation_lookup_by_resource_type() {
        let claim = ResourceClaim {
            metadata: ObjectMeta::default(),
            spec: ResourceClaimSpec {
                consumer_ref: ConsumerRef::default(),
                requests: vec![],
                resource_ref: None,
            },
            status: Some(ResourceClaimStatus {
                allocations: vec![Allocation {
                    resource_type: "resourcemanager.miloapis.com/projects".to_owned(),
                    status: AllocationStatus::Granted,
                    allocated_amount: Some(3),
                    ..Allocation::default()
                }],
                conditions: vec![],
            }),
        };

        assert_eq!(
            claim
                .allocation_for("resourcemanager.miloapis.com/projects")
                .and_then(|allocation| allocation.allocated_amount),
            Some(3)
        );
        assert!(claim.allocation_for("compute.miloapis.com/workloads").is_none());
    }

    #[test]
    fn allocation_wire_format_is_camel_case() {
        let allocation = Allocation {
            resource_type: "resourcemanager.miloapis.com/projects".to_owned(),
            status: AllocationStatus::Granted,
            reason: "CapacityReserved".to_owned(),
            message: "reserved".to_owned(),
            allocated_amount: Some(3),
            allocating_bucket: Some("bucket-abc".to_owned()),
            last_transition_time: None,
        };

        let wire = serde_json::to_value(&allocation).expect("serializable");

        // The map-list key of the allocations list; a rename would break
        // entry-wise merging on the server.
        assert_eq!(wire["resourceType"], "resourcemanager.miloapis.com/projects");
        assert_eq!(wire["status"], "Granted");
        assert_eq!(wire["allocatedAmount"], 3);
        assert_eq!(wire["allocatingBucket"], "bucket-abc");
    }

    #[test]
    fn pending_is_the_default_allocation_status() {
        let wire = serde_json::to_value(AllocationStatus::default()).expect("serializable");

        assert_eq!(wire, "Pending");
    }

    #[test]
    fn claim_without_conditions_is_not_granted() {
        let claim = ResourceClaim {
            metadata: ObjectMeta::default(),
            spec: ResourceClaimSpec {
                consumer_ref: ConsumerRef::default(),
                requests: vec![],
                resource_ref: None,
            },
            status: None,
        };

        assert!(!claim.is_granted());
    }
}
