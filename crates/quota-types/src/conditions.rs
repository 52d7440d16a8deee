//! Helpers for the `conditions` lists carried by every record status.
//!
//! These mirror the apimachinery `SetStatusCondition` semantics: a write
//! with an unchanged status preserves the original transition time, so
//! `lastTransitionTime` always answers "since when" rather than "when was
//! this last reconciled".

use k8s_openapi::{
    apimachinery::pkg::apis::meta::v1::{Condition, Time},
    jiff::Timestamp,
};
use schemars::{JsonSchema, Schema, SchemaGenerator};

/// Condition published by the registration validator.
pub const TYPE_ACTIVE: &str = "Active";

/// Condition published by the policy validators.
pub const TYPE_READY: &str = "Ready";

/// Condition published on grant policies that declare a parent context.
pub const TYPE_PARENT_CONTEXT_READY: &str = "ParentContextReady";

/// Aggregate claim condition reflecting the whole-claim outcome.
pub const TYPE_GRANTED: &str = "Granted";

pub const REASON_REGISTRATION_ACTIVE: &str = "RegistrationActive";
pub const REASON_VALIDATION_FAILED: &str = "ValidationFailed";
pub const REASON_CAPACITY_RESERVED: &str = "CapacityReserved";
pub const REASON_QUOTA_EXCEEDED: &str = "QuotaExceeded";
pub const REASON_POLICY_READY: &str = "PolicyReady";
pub const REASON_PARENT_CONTEXT_READY: &str = "ParentContextReady";
pub const REASON_PARENT_CONTEXT_UNSUPPORTED: &str = "ParentContextUnsupported";

pub const STATUS_TRUE: &str = "True";
pub const STATUS_FALSE: &str = "False";

/// Schema for a `conditions` list: the upstream [`Condition`] schema plus
/// the map-list extensions, so server-side apply merges entries by `type`.
pub fn schema(generator: &mut SchemaGenerator) -> Schema {
    map_list_schema::<Condition>(generator, &["type"])
}

/// Marks a list schema as a map-list keyed by `keys`, the declaration the
/// record server needs to merge entries instead of replacing the list.
pub(crate) fn map_list_schema<T: JsonSchema>(
    generator: &mut SchemaGenerator,
    keys: &[&str],
) -> Schema {
    let mut schema = generator.subschema_for::<Vec<T>>();
    let object = schema.ensure_object();
    object.insert(
        "x-kubernetes-list-type".to_owned(),
        serde_json::Value::from("map"),
    );
    object.insert(
        "x-kubernetes-list-map-keys".to_owned(),
        serde_json::json!(keys),
    );
    schema
}

/// Builds a condition stamped with the current time.
pub fn new_condition(
    type_: &str,
    status: bool,
    reason: &str,
    message: impl Into<String>,
    observed_generation: Option<i64>,
) -> Condition {
    Condition {
        last_transition_time: Time(Timestamp::now()),
        message: message.into(),
        observed_generation,
        reason: reason.to_owned(),
        status: if status { STATUS_TRUE } else { STATUS_FALSE }.to_owned(),
        type_: type_.to_owned(),
    }
}

/// Inserts or replaces the condition of `condition.type_`.
///
/// The transition time of an existing condition is kept whenever the status
/// does not flip.
pub fn set_condition(conditions: &mut Vec<Condition>, mut condition: Condition) {
    match conditions.iter_mut().find(|c| c.type_ == condition.type_) {
        Some(existing) => {
            if existing.status == condition.status {
                condition.last_transition_time = existing.last_transition_time.clone();
            }
            *existing = condition;
        }
        None => conditions.push(condition),
    }
}

pub fn find_condition<'a>(conditions: &'a [Condition], type_: &str) -> Option<&'a Condition> {
    conditions.iter().find(|c| c.type_ == type_)
}

/// Whether the condition of the given type exists and is `True`.
pub fn is_condition_true(conditions: &[Condition], type_: &str) -> bool {
    find_condition(conditions, type_).is_some_and(|c| c.status == STATUS_TRUE)
}

/// Semantic equality of two condition lists, ignoring transition times.
///
/// Controllers use this to decide whether a status write would be a no-op.
pub fn conditions_equal(left: &[Condition], right: &[Condition]) -> bool {
    if left.len() != right.len() {
        return false;
    }

    left.iter().all(|l| {
        find_condition(right, &l.type_).is_some_and(|r| {
            l.status == r.status
                && l.reason == r.reason
                && l.message == r.message
                && l.observed_generation == r.observed_generation
        })
    })
}
