use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::{
    claim::ResourceClaimSpec,
    conditions::{self, TYPE_READY},
    grant::ResourceGrantSpec,
    refs::GroupKindRef,
};

/// Drives claim creation from lifecycle events of a trigger kind.
///
/// The admission plugin consults ready claim policies when objects of the
/// trigger kind are admitted and instantiates the template inline on the
/// request. This control plane only validates the policy and publishes
/// `Ready`.
#[derive(CustomResource, Clone, Debug, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[kube(
    group = "quota.miloapis.com",
    version = "v1alpha1",
    kind = "ClaimCreationPolicy",
    plural = "claimcreationpolicies",
    status = "ClaimCreationPolicyStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct ClaimCreationPolicySpec {
    /// Resource kind whose admission triggers claim creation.
    pub trigger: GroupKindRef,

    /// Boolean guard expressions over `trigger`, `user` and `requestInfo`.
    /// All must evaluate to true for a claim to be created.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub when: Vec<String>,

    /// Template of the claim to create. String fields may embed `{{ ... }}`
    /// expressions; amounts are literal integers.
    pub template: ClaimTemplate,
}

#[derive(Clone, Debug, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClaimTemplate {
    #[serde(default)]
    pub metadata: TemplateMetadata,
    pub spec: ResourceClaimSpec,
}

#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClaimCreationPolicyStatus {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    #[schemars(schema_with = "crate::conditions::schema")]
    pub conditions: Vec<Condition>,

    /// Generation most recently processed by the validator.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

/// Drives grant creation from lifecycle events of a trigger kind.
///
/// The grant-creation executor subscribes to the trigger kind of every
/// ready policy, evaluates the guards against observed objects and upserts
/// the rendered grant, optionally into a parent context.
#[derive(CustomResource, Clone, Debug, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[kube(
    group = "quota.miloapis.com",
    version = "v1alpha1",
    kind = "GrantCreationPolicy",
    plural = "grantcreationpolicies",
    status = "GrantCreationPolicyStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct GrantCreationPolicySpec {
    /// Resource kind whose lifecycle drives grant creation.
    pub trigger: GroupKindRef,

    /// Boolean guard expressions over `trigger`. All must evaluate to true
    /// for the grant to exist; a false guard deletes a previously created
    /// grant.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub when: Vec<String>,

    /// When set, the rendered grant is written into the named parent
    /// context instead of the local cluster.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_context: Option<ParentContextRef>,

    /// Template of the grant to upsert. String fields may embed `${ ... }`
    /// expressions; amounts are literal integers.
    pub template: GrantTemplate,
}

/// Names the parent context a grant is written into.
#[derive(Clone, Debug, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ParentContextRef {
    /// API group of the parent context kind.
    pub group: String,

    /// Kind of the parent context. Only `Project` is supported.
    pub kind: String,

    /// Expression producing the parent context name, evaluated against
    /// `trigger`.
    pub name_expression: String,
}

#[derive(Clone, Debug, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GrantTemplate {
    pub metadata: TemplateMetadata,
    pub spec: ResourceGrantSpec,
}

/// Metadata rendered onto policy-created records.
#[derive(Clone, Debug, Default, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TemplateMetadata {
    /// Name of the created record.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Namespace of the created record.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GrantCreationPolicyStatus {
    /// `Ready`, and `ParentContextReady` when a parent context is declared.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    #[schemars(schema_with = "crate::conditions::schema")]
    pub conditions: Vec<Condition>,

    /// Generation most recently processed by the validator.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

impl GrantCreationPolicy {
    /// Whether the validator has marked this policy ready for execution.
    pub fn is_ready(&self) -> bool {
        self.status
            .as_ref()
            .is_some_and(|status| conditions::is_condition_true(&status.conditions, TYPE_READY))
    }
}

impl ClaimCreationPolicy {
    /// Whether the validator has marked this policy ready for use.
    pub fn is_ready(&self) -> bool {
        self.status
            .as_ref()
            .is_some_and(|status| conditions::is_condition_true(&status.conditions, TYPE_READY))
    }
}
