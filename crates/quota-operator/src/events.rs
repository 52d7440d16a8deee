//! Publishing Kubernetes events for quota decisions.
//!
//! Denials, reservations and lifecycle deletions are the moments operators
//! ask "why": each one is published as an event on the claim so `kubectl
//! describe` answers without log access. Publishing is fire-and-forget; a
//! failed event write never fails the reconcile that produced it.

use k8s_openapi::api::core::v1::ObjectReference;
use kube::{
    Client, Resource, ResourceExt,
    runtime::events::{Event, EventType, Recorder, Reporter},
};
use quota_types::claim::ResourceClaim;

const NOTE_MAX_BYTES: usize = 1024;

/// Publishes decision events on behalf of one controller.
pub struct DecisionEvents {
    recorder: Recorder,
}

impl DecisionEvents {
    pub fn new(client: Client, controller: &str) -> Self {
        let reporter = Reporter {
            controller: controller.to_owned(),
            instance: None,
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }

    /// A pending request was denied because the bucket ran out of capacity.
    pub async fn quota_exceeded(
        &self,
        claim: &ResourceClaim,
        resource_type: &str,
        requested: i64,
        available: i64,
    ) {
        self.publish(
            claim,
            Event {
                type_: EventType::Warning,
                reason: "QuotaExceeded".to_owned(),
                note: Some(note(format!(
                    "denied request for {requested} {resource_type}: only {available} available"
                ))),
                action: "Allocate".to_owned(),
                secondary: None,
            },
        )
        .await;
    }

    /// Capacity was reserved for a pending request.
    pub async fn capacity_reserved(
        &self,
        claim: &ResourceClaim,
        resource_type: &str,
        amount: i64,
        bucket: &str,
    ) {
        self.publish(
            claim,
            Event {
                type_: EventType::Normal,
                reason: "CapacityReserved".to_owned(),
                note: Some(note(format!(
                    "reserved {amount} {resource_type} from bucket {bucket}"
                ))),
                action: "Allocate".to_owned(),
                secondary: None,
            },
        )
        .await;
    }

    /// A granted claim whose owner never appeared was deleted.
    pub async fn orphan_deleted(&self, claim: &ResourceClaim, owner: &str) {
        self.publish(
            claim,
            Event {
                type_: EventType::Warning,
                reason: "OrphanedClaimDeleted".to_owned(),
                note: Some(note(format!(
                    "deleted claim because its owner {owner} never appeared"
                ))),
                action: "GarbageCollect".to_owned(),
                secondary: None,
            },
        )
        .await;
    }

    /// A denied automation-created claim was removed.
    pub async fn denied_claim_removed(&self, claim: &ResourceClaim) {
        self.publish(
            claim,
            Event {
                type_: EventType::Normal,
                reason: "DeniedClaimRemoved".to_owned(),
                note: Some("removed automation-created claim denied for quota".to_owned()),
                action: "GarbageCollect".to_owned(),
                secondary: None,
            },
        )
        .await;
    }

    async fn publish(&self, claim: &ResourceClaim, event: Event) {
        let reference = object_reference(claim);
        if let Err(err) = self.recorder.publish(&event, &reference).await {
            tracing::warn!(
                error = %err,
                reason = %event.reason,
                "failed to publish decision event"
            );
        }
    }
}

fn object_reference(claim: &ResourceClaim) -> ObjectReference {
    ObjectReference {
        api_version: Some(ResourceClaim::api_version(&()).into_owned()),
        kind: Some(ResourceClaim::kind(&()).into_owned()),
        name: Some(claim.name_any()),
        namespace: claim.namespace(),
        uid: claim.uid(),
        ..ObjectReference::default()
    }
}

/// Event notes are capped by the API server; keep ours well under the
/// limit, cutting at a character boundary.
fn note(message: String) -> String {
    if message.len() <= NOTE_MAX_BYTES {
        return message;
    }
    let cut = message
        .char_indices()
        .map(|(index, _)| index)
        .take_while(|index| *index <= NOTE_MAX_BYTES - '…'.len_utf8())
        .last()
        .unwrap_or(0);
    let mut truncated = message;
    truncated.truncate(cut);
    truncated.push('…');
    truncated
}
