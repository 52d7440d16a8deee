use k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::refs::GroupKindRef;

/// Declares that a resource type is under quota control.
///
/// Registrations are administrator-managed and cluster-scoped; claims and
/// grants for a resource type are only meaningful once a registration for
/// it exists and is `Active`.
#[derive(CustomResource, Clone, Debug, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[kube(
    group = "quota.miloapis.com",
    version = "v1alpha1",
    kind = "ResourceRegistration",
    plural = "resourceregistrations",
    status = "ResourceRegistrationStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct ResourceRegistrationSpec {
    /// Kind of the consumer this resource type is accounted against.
    pub consumer_type_ref: GroupKindRef,

    /// Whether the resource type counts discrete entities or an allocation
    /// of a divisible quantity.
    #[serde(rename = "type")]
    pub type_: RegistrationType,

    /// Globally-unique slashed identifier of the registered resource type,
    /// matching `group/resource` with an optional `/subpath`.
    pub resource_type: String,

    /// Units the quota amounts of this resource type are expressed in.
    pub units: ResourceUnits,

    /// Resource kinds authorized to create claims for this resource type.
    /// An empty list denies all claim creation.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub claiming_resources: Vec<GroupKindRef>,
}

#[derive(strum::Display, Clone, Copy, Debug, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[strum(serialize_all = "PascalCase")]
pub enum RegistrationType {
    /// Counts whole objects, e.g. projects per organization.
    Entity,

    /// Counts a divisible quantity carved out of a larger pool, e.g. CPU
    /// cores per workload.
    Allocation,
}

/// Unit metadata for the amounts of a registered resource type.
#[derive(Clone, Debug, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceUnits {
    /// Unit amounts are stored in.
    pub base_unit: String,

    /// Unit amounts are displayed in.
    pub display_unit: String,

    /// How many base units make up one display unit. Must be at least 1.
    pub conversion_factor: i64,
}

#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceRegistrationStatus {
    /// `Active` reflects the outcome of the most recent validation pass.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    #[schemars(schema_with = "crate::conditions::schema")]
    pub conditions: Vec<Condition>,

    /// Generation most recently processed by the validator.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spec_wire_format_is_camel_case() {
        let spec = ResourceRegistrationSpec {
            consumer_type_ref: GroupKindRef {
                group: "resourcemanager.miloapis.com".to_owned(),
                kind: "Organization".to_owned(),
            },
            type_: RegistrationType::Entity,
            resource_type: "resourcemanager.miloapis.com/projects".to_owned(),
            units: ResourceUnits {
                base_unit: "project".to_owned(),
                display_unit: "project".to_owned(),
                conversion_factor: 1,
            },
            claiming_resources: vec![],
        };

        let wire = serde_json::to_value(&spec).expect("serializable");

        assert_eq!(wire["type"], "Entity");
        assert_eq!(wire["resourceType"], "resourcemanager.miloapis.com/projects");
        assert_eq!(wire["consumerTypeRef"]["kind"], "Organization");
        assert_eq!(wire["units"]["conversionFactor"], 1);
        // Empty claiming resources are omitted, not serialized as [].
        assert!(wire.get("claimingResources").is_none());
    }
}
