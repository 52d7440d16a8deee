//! Bucket controller: the single writer of `AllowanceBucket` records.
//!
//! For every `(consumer, resource type)` tuple there is exactly one bucket
//! object, created on demand, whose status this controller alone writes.
//! Grants feed the limit side, claim allocations feed the usage side, and
//! pending claim requests are answered by reserving capacity on the bucket
//! *before* the claim allocation is granted. The reservation is an
//! optimistic status update: a version conflict abandons the pass and the
//! watch re-enqueues, so capacity can never be reserved twice.

mod aggregate;

pub use aggregate::{
    Decision, LimitSummary, Outcome, PendingRequest, UsageSummary, build_status,
    plan_reservations, pending_requests, sort_claims, summarize_limit, summarize_usage,
};

use std::{sync::Arc, time::Duration};

use k8s_openapi::{apimachinery::pkg::apis::meta::v1::Time, jiff::Timestamp};
use kube::{
    Api, Client, ResourceExt,
    api::{ListParams, ObjectMeta, Patch, PatchParams, PostParams},
};
use quota_types::{
    bucket::{AllowanceBucket, AllowanceBucketSpec, AllowanceBucketStatus},
    claim::{Allocation, AllocationStatus, ResourceClaim},
    conditions::{
        self, REASON_CAPACITY_RESERVED, REASON_QUOTA_EXCEEDED, TYPE_ACTIVE, TYPE_GRANTED,
        new_condition,
    },
    grant::ResourceGrant,
    identity::{bucket_name, bucket_namespace},
    labels,
};
use snafu::{ResultExt, Snafu};

use crate::{
    cluster::{ClusterRouter, ObjectKey},
    events::DecisionEvents,
    runtime::{Action, WorkQueue, run_controller},
    utils::{self, shutdown::ShutdownWatcher},
};

const CONTROLLER_NAME: &str = "allowance-bucket";

/// Requeue on transient failures, per the error handling design.
const ERROR_REQUEUE: Duration = Duration::from_millis(500);

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to resolve cluster"))]
    ResolveCluster { source: crate::cluster::router::Error },

    #[snafu(display("failed to get bucket {name:?}"))]
    GetBucket { source: kube::Error, name: String },

    #[snafu(display("failed to create bucket {name:?}"))]
    CreateBucket { source: kube::Error, name: String },

    #[snafu(display("failed to list grants"))]
    ListGrants { source: kube::Error },

    #[snafu(display("failed to list claims"))]
    ListClaims { source: kube::Error },

    #[snafu(display("failed to serialize bucket {name:?}"))]
    SerializeBucket {
        source: serde_json::Error,
        name: String,
    },

    #[snafu(display("failed to write status of bucket {name:?}"))]
    WriteBucketStatus { source: kube::Error, name: String },

    #[snafu(display("failed to patch allocation of claim {name:?}"))]
    WriteAllocation { source: kube::Error, name: String },
}

pub struct Context {
    router: Arc<ClusterRouter>,
}

/// Runs the bucket controller until shutdown.
pub async fn run(router: Arc<ClusterRouter>, workers: usize, shutdown: &ShutdownWatcher) {
    let queue = WorkQueue::new(crate::runtime::DEFAULT_CAPACITY);

    // The bucket's own events re-drive the reconcile unconditionally.
    router.spawn_watches::<AllowanceBucket, _, _, _>(
        &queue,
        &Default::default(),
        shutdown,
        |cluster, bucket| vec![ObjectKey::of(cluster, bucket)],
        |_| None,
    );

    // Grants enqueue the affected bucket keys on generation changes and
    // flips of the Active condition.
    router.spawn_watches::<ResourceGrant, _, _, _>(
        &queue,
        &Default::default(),
        shutdown,
        |cluster, grant: &ResourceGrant| grant_keys(cluster, grant),
        |grant: &ResourceGrant| {
            let active = grant
                .status
                .as_ref()
                .and_then(|status| conditions::find_condition(&status.conditions, TYPE_ACTIVE))
                .map(|condition| (condition.status.clone(), condition.reason.clone()));
            Some(utils::fingerprint(&(grant.metadata.generation, active)))
        },
    );

    // Claims enqueue one bucket key per request on generation changes and
    // any change of the aggregate Granted condition.
    router.spawn_watches::<ResourceClaim, _, _, _>(
        &queue,
        &Default::default(),
        shutdown,
        |cluster, claim: &ResourceClaim| claim_keys(cluster, claim),
        |claim: &ResourceClaim| {
            let granted = claim
                .granted_condition()
                .map(|condition| (condition.status.clone(), condition.reason.clone()));
            Some(utils::fingerprint(&(claim.metadata.generation, granted)))
        },
    );

    run_controller(
        CONTROLLER_NAME,
        queue,
        workers,
        Arc::new(Context { router }),
        reconcile,
        ERROR_REQUEUE,
        shutdown.handle(),
    )
    .await;
}

/// The bucket keys a grant's allowances map to.
fn grant_keys(cluster: &str, grant: &ResourceGrant) -> Vec<ObjectKey> {
    let consumer = &grant.spec.consumer_ref;
    grant
        .spec
        .allowances
        .iter()
        .map(|allowance| ObjectKey {
            cluster: cluster.to_owned(),
            namespace: Some(bucket_namespace(consumer)),
            name: bucket_name(&allowance.resource_type, &consumer.kind, &consumer.name),
        })
        .collect()
}

/// The bucket keys a claim's requests map to.
fn claim_keys(cluster: &str, claim: &ResourceClaim) -> Vec<ObjectKey> {
    let consumer = &claim.spec.consumer_ref;
    claim
        .spec
        .requests
        .iter()
        .map(|request| ObjectKey {
            cluster: cluster.to_owned(),
            namespace: Some(bucket_namespace(consumer)),
            name: bucket_name(&request.resource_type, &consumer.kind, &consumer.name),
        })
        .collect()
}

async fn reconcile(key: ObjectKey, context: Arc<Context>) -> Result<Action, Error> {
    let handle = context.router.get(&key.cluster).context(ResolveClusterSnafu)?;
    let client = handle.client;
    let namespace = key.namespace.clone().unwrap_or_default();
    let buckets: Api<AllowanceBucket> = Api::namespaced(client.clone(), &namespace);

    let Some(mut bucket) = buckets
        .get_opt(&key.name)
        .await
        .context(GetBucketSnafu { name: key.name.clone() })?
    else {
        return bootstrap(&key, &client, &buckets).await;
    };

    // Recompute the limit side from the cluster's grants.
    let grants = Api::<ResourceGrant>::all(client.clone())
        .list(&ListParams::default())
        .await
        .context(ListGrantsSnafu)?
        .items;
    let limit = summarize_limit(&bucket.spec, &grants);

    // Recompute the usage side from the cluster's claims.
    let mut claims = Api::<ResourceClaim>::all(client.clone())
        .list(&ListParams::default())
        .await
        .context(ListClaimsSnafu)?
        .items;
    claims.retain(|claim| claim.spec.consumer_ref.matches(&bucket.spec.consumer_ref));
    sort_claims(&mut claims);
    let usage = summarize_usage(&bucket.spec, &claims);

    // Answer pending requests, reserving on the bucket before granting.
    let pending = pending_requests(&bucket.spec, &claims);
    let decisions = plan_reservations(limit.limit, usage.allocated, &pending);

    let generation = bucket.metadata.generation;
    let mut allocated = usage.allocated;
    let mut claim_count = usage.claim_count;

    let events = DecisionEvents::new(client.clone(), CONTROLLER_NAME);
    for decision in decisions {
        let claim = &claims[decision.claim_index];
        match decision.outcome {
            Outcome::Deny => {
                let entry = denied_allocation(&bucket.spec.resource_type, decision.amount, decision.available);
                write_allocation(&client, claim, &key.name, entry).await?;
                events
                    .quota_exceeded(claim, &bucket.spec.resource_type, decision.amount, decision.available)
                    .await;
            }
            Outcome::Reserve => {
                allocated += decision.amount;
                claim_count += 1;
                let next = build_status(&limit, allocated, claim_count, generation);
                bucket = match write_bucket_status(&buckets, &bucket, next).await? {
                    Some(updated) => updated,
                    // Conflict: abandon the reservation, the watch
                    // re-enqueues and the next pass recomputes.
                    None => return Ok(Action::await_change()),
                };

                let entry = granted_allocation(&bucket.spec.resource_type, decision.amount, &key.name);
                write_allocation(&client, claim, &key.name, entry).await?;
                events
                    .capacity_reserved(claim, &bucket.spec.resource_type, decision.amount, &key.name)
                    .await;
            }
        }
    }

    // Finalize: persist the recomputed aggregate when it changed.
    let next = build_status(&limit, allocated, claim_count, generation);
    let current = bucket.status.clone().unwrap_or_default();
    if !current.semantically_equals(&next) {
        let stamped = AllowanceBucketStatus {
            last_reconciliation: Some(Time(Timestamp::now())),
            ..next
        };
        write_bucket_status(&buckets, &bucket, stamped).await?;
    }

    Ok(Action::await_change())
}

/// On-demand bucket creation: derive the spec from any claim or grant
/// whose requests map to this key, then let the watch on the new object
/// re-enqueue.
async fn bootstrap(
    key: &ObjectKey,
    client: &Client,
    buckets: &Api<AllowanceBucket>,
) -> Result<Action, Error> {
    let claims = Api::<ResourceClaim>::all(client.clone())
        .list(&ListParams::default())
        .await
        .context(ListClaimsSnafu)?
        .items;

    for claim in &claims {
        for request in &claim.spec.requests {
            if let Some(spec) = derived_spec(key, &claim.spec.consumer_ref, &request.resource_type) {
                return create_bucket(key, buckets, spec).await;
            }
        }
    }

    let grants = Api::<ResourceGrant>::all(client.clone())
        .list(&ListParams::default())
        .await
        .context(ListGrantsSnafu)?
        .items;

    for grant in &grants {
        for allowance in &grant.spec.allowances {
            if let Some(spec) = derived_spec(key, &grant.spec.consumer_ref, &allowance.resource_type)
            {
                return create_bucket(key, buckets, spec).await;
            }
        }
    }

    // Nothing references this key anymore.
    Ok(Action::await_change())
}

/// The bucket spec for `(consumer, resource_type)` if the tuple derives
/// exactly this key.
fn derived_spec(
    key: &ObjectKey,
    consumer: &quota_types::refs::ConsumerRef,
    resource_type: &str,
) -> Option<AllowanceBucketSpec> {
    let name = bucket_name(resource_type, &consumer.kind, &consumer.name);
    let namespace = bucket_namespace(consumer);
    (name == key.name && key.namespace.as_deref() == Some(namespace.as_str())).then(|| {
        AllowanceBucketSpec {
            consumer_ref: consumer.clone(),
            resource_type: resource_type.to_owned(),
        }
    })
}

async fn create_bucket(
    key: &ObjectKey,
    buckets: &Api<AllowanceBucket>,
    spec: AllowanceBucketSpec,
) -> Result<Action, Error> {
    let bucket = AllowanceBucket {
        metadata: ObjectMeta {
            name: Some(key.name.clone()),
            namespace: key.namespace.clone(),
            ..ObjectMeta::default()
        },
        spec,
        status: None,
    };

    match buckets.create(&PostParams::default(), &bucket).await {
        Ok(_) => {
            tracing::info!(bucket = %key, "created bucket on demand");
            Ok(Action::await_change())
        }
        // Lost a benign race against another trigger for the same key.
        Err(err) if utils::is_conflict(&err) => Ok(Action::await_change()),
        Err(err) => Err(err).context(CreateBucketSnafu { name: key.name.clone() }),
    }
}

/// Optimistic status write. `None` signals a version conflict.
async fn write_bucket_status(
    buckets: &Api<AllowanceBucket>,
    bucket: &AllowanceBucket,
    status: AllowanceBucketStatus,
) -> Result<Option<AllowanceBucket>, Error> {
    let name = bucket.name_any();
    let mut updated = bucket.clone();
    updated.status = Some(status);

    match buckets.replace_status(&name, &PostParams::default(), &updated).await {
        Ok(written) => Ok(Some(written)),
        Err(err) if utils::is_conflict(&err) => Ok(None),
        Err(err) => Err(err).context(WriteBucketStatusSnafu { name }),
    }
}

fn granted_allocation(resource_type: &str, amount: i64, bucket: &str) -> Allocation {
    Allocation {
        resource_type: resource_type.to_owned(),
        status: AllocationStatus::Granted,
        reason: REASON_CAPACITY_RESERVED.to_owned(),
        message: format!("reserved {amount} from bucket {bucket}"),
        allocated_amount: Some(amount),
        allocating_bucket: Some(bucket.to_owned()),
        last_transition_time: Some(Time(Timestamp::now())),
    }
}

fn denied_allocation(resource_type: &str, amount: i64, available: i64) -> Allocation {
    Allocation {
        resource_type: resource_type.to_owned(),
        status: AllocationStatus::Denied,
        reason: REASON_QUOTA_EXCEEDED.to_owned(),
        message: format!("requested {amount}, only {available} available"),
        allocated_amount: None,
        allocating_bucket: None,
        last_transition_time: Some(Time(Timestamp::now())),
    }
}

/// Writes one allocation entry (and, when the claim is fully answered, the
/// aggregate `Granted` condition) through a field-scoped apply owning only
/// this bucket's entry.
async fn write_allocation(
    client: &Client,
    claim: &ResourceClaim,
    bucket: &str,
    entry: Allocation,
) -> Result<(), Error> {
    let name = claim.name_any();
    let namespace = claim.namespace().unwrap_or_default();
    let api: Api<ResourceClaim> = Api::namespaced(client.clone(), &namespace);

    let aggregate = aggregate_condition(claim, &entry);
    let mut status = serde_json::json!({ "allocations": [entry] });
    if let Some(condition) = aggregate {
        status["conditions"] = serde_json::json!([condition]);
    }
    let patch = serde_json::json!({
        "apiVersion": "quota.miloapis.com/v1alpha1",
        "kind": "ResourceClaim",
        "status": status,
    });

    let params = PatchParams::apply(&labels::bucket_field_manager(bucket)).force();
    api.patch_status(&name, &params, &Patch::Apply(&patch))
        .await
        .map(|_| ())
        .context(WriteAllocationSnafu { name })
}

/// The whole-claim outcome once every request has an answer.
///
/// Computed over the claim's current allocation set with `entry` applied,
/// so concurrent bucket controllers for different resource types converge:
/// whichever writes last sees the full set.
fn aggregate_condition(
    claim: &ResourceClaim,
    entry: &Allocation,
) -> Option<k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition> {
    let mut denied = Vec::new();

    for request in &claim.spec.requests {
        let allocation = if request.resource_type == entry.resource_type {
            Some(entry)
        } else {
            claim.allocation_for(&request.resource_type)
        };

        match allocation.map(|a| a.status) {
            Some(AllocationStatus::Granted) => {}
            Some(AllocationStatus::Denied) => denied.push(request.resource_type.as_str()),
            Some(AllocationStatus::Pending) | None => return None,
        }
    }

    let generation = claim.metadata.generation;
    if denied.is_empty() {
        Some(new_condition(
            TYPE_GRANTED,
            true,
            REASON_CAPACITY_RESERVED,
            "all requested capacity was reserved",
            generation,
        ))
    } else {
        Some(new_condition(
            TYPE_GRANTED,
            false,
            REASON_QUOTA_EXCEEDED,
            format!("quota exceeded for {}", denied.join(", ")),
            generation,
        ))
    }
}

#[cfg(test)]
mod tests {
    use kube::api::ObjectMeta;
    use quota_types::{
        claim::{ResourceClaimSpec, ResourceClaimStatus, ResourceRequest},
        conditions::STATUS_FALSE,
        refs::ConsumerRef,
    };

    use super::*;

    const PROJECTS: &str = "resourcemanager.miloapis.com/projects";
    const WORKLOADS: &str = "compute.miloapis.com/workloads";

    fn claim_with(requests: &[&str], allocations: Vec<Allocation>) -> ResourceClaim {
        ResourceClaim {
            metadata: ObjectMeta {
                name: Some("claim".to_owned()),
                generation: Some(2),
                ..ObjectMeta::default()
            },
            spec: ResourceClaimSpec {
                consumer_ref: ConsumerRef {
                    kind: "Organization".to_owned(),
                    name: "acme".to_owned(),
                    ..ConsumerRef::default()
                },
                requests: requests
                    .iter()
                    .map(|resource_type| ResourceRequest {
                        resource_type: (*resource_type).to_owned(),
                        amount: 1,
                    })
                    .collect(),
                resource_ref: None,
            },
            status: Some(ResourceClaimStatus {
                allocations,
                conditions: vec![],
            }),
        }
    }

    #[test]
    fn no_aggregate_while_other_requests_are_unanswered() {
        let claim = claim_with(&[PROJECTS, WORKLOADS], vec![]);
        let entry = granted_allocation(PROJECTS, 1, "bucket-a");

        assert!(aggregate_condition(&claim, &entry).is_none());
    }

    #[test]
    fn aggregate_granted_when_every_request_is_granted() {
        let claim = claim_with(&[PROJECTS, WORKLOADS], vec![granted_allocation(WORKLOADS, 2, "bucket-b")]);
        let entry = granted_allocation(PROJECTS, 1, "bucket-a");

        let condition = aggregate_condition(&claim, &entry).expect("aggregate present");
        assert_eq!(condition.type_, TYPE_GRANTED);
        assert_eq!(condition.reason, REASON_CAPACITY_RESERVED);
        assert_eq!(condition.observed_generation, Some(2));
    }

    #[test]
    fn aggregate_denied_when_any_request_is_denied() {
        let claim = claim_with(&[PROJECTS, WORKLOADS], vec![granted_allocation(WORKLOADS, 2, "bucket-b")]);
        let entry = denied_allocation(PROJECTS, 5, 0);

        let condition = aggregate_condition(&claim, &entry).expect("aggregate present");
        assert_eq!(condition.status, STATUS_FALSE);
        assert_eq!(condition.reason, REASON_QUOTA_EXCEEDED);
        assert!(condition.message.contains(PROJECTS));
    }

    #[test]
    fn new_entry_overrides_stale_allocation_of_same_type() {
        let claim = claim_with(
            &[PROJECTS],
            vec![Allocation {
                resource_type: PROJECTS.to_owned(),
                status: AllocationStatus::Pending,
                ..Allocation::default()
            }],
        );
        let entry = granted_allocation(PROJECTS, 1, "bucket-a");

        assert!(aggregate_condition(&claim, &entry).is_some());
    }

    #[test]
    fn denial_message_carries_availability_context() {
        let entry = denied_allocation(PROJECTS, 4, 1);

        assert_eq!(entry.reason, REASON_QUOTA_EXCEEDED);
        assert!(entry.message.contains("requested 4"));
        assert!(entry.message.contains("only 1 available"));
    }

    #[test]
    fn derived_spec_requires_both_name_and_namespace_to_match() {
        let consumer = ConsumerRef {
            kind: "Organization".to_owned(),
            name: "acme".to_owned(),
            ..ConsumerRef::default()
        };
        let key = ObjectKey {
            cluster: String::new(),
            namespace: Some(bucket_namespace(&consumer)),
            name: bucket_name(PROJECTS, &consumer.kind, &consumer.name),
        };

        assert!(derived_spec(&key, &consumer, PROJECTS).is_some());
        assert!(derived_spec(&key, &consumer, WORKLOADS).is_none());

        let wrong_namespace = ObjectKey {
            namespace: Some("elsewhere".to_owned()),
            ..key
        };
        assert!(derived_spec(&wrong_namespace, &consumer, PROJECTS).is_none());
    }
}
