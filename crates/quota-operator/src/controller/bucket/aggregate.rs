//! Pure aggregation and reservation planning over listed grants and
//! claims.
//!
//! Everything that decides *what* the bucket controller writes lives here,
//! free of I/O, so the quota invariants can be exercised directly.

use kube::ResourceExt;
use quota_types::{
    bucket::{AllowanceBucketSpec, AllowanceBucketStatus, ContributingGrantRef},
    claim::{AllocationStatus, ResourceClaim},
    grant::ResourceGrant,
};

/// The limit side of a bucket: active grant amounts for the tuple.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct LimitSummary {
    pub limit: i64,
    pub grant_count: i32,
    pub contributing: Vec<ContributingGrantRef>,
}

/// Sums the active grants matching the bucket's consumer and resource
/// type. Inactive grants and non-matching allowances contribute nothing.
pub fn summarize_limit(spec: &AllowanceBucketSpec, grants: &[ResourceGrant]) -> LimitSummary {
    let mut contributing = Vec::new();
    let mut limit = 0;

    for grant in grants {
        if !grant.spec.consumer_ref.matches(&spec.consumer_ref) || !grant.is_active() {
            continue;
        }
        if !grant
            .spec
            .allowances
            .iter()
            .any(|allowance| allowance.resource_type == spec.resource_type)
        {
            continue;
        }

        let amount = grant.amount_for(&spec.resource_type);
        limit += amount;
        contributing.push(ContributingGrantRef {
            name: grant.name_any(),
            observed_generation: grant.metadata.generation.unwrap_or_default(),
            amount,
        });
    }

    contributing.sort_by(|a, b| a.name.cmp(&b.name));
    LimitSummary {
        limit,
        grant_count: contributing.len() as i32,
        contributing,
    }
}

/// The usage side of a bucket: capacity already reserved by granted
/// allocations.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct UsageSummary {
    pub allocated: i64,
    pub claim_count: i32,
}

/// Sums the granted allocations for the bucket's resource type across the
/// matching claims. A claim is counted once no matter how many granted
/// allocations it holds.
pub fn summarize_usage(spec: &AllowanceBucketSpec, claims: &[ResourceClaim]) -> UsageSummary {
    let mut usage = UsageSummary::default();

    for claim in claims {
        if !claim.spec.consumer_ref.matches(&spec.consumer_ref) {
            continue;
        }
        let granted: i64 = claim
            .status
            .iter()
            .flat_map(|status| &status.allocations)
            .filter(|allocation| {
                allocation.resource_type == spec.resource_type
                    && allocation.status == AllocationStatus::Granted
            })
            .filter_map(|allocation| allocation.allocated_amount)
            .sum();

        if claim.allocation_for(&spec.resource_type).is_some_and(|allocation| {
            allocation.status == AllocationStatus::Granted
        }) {
            usage.claim_count += 1;
        }
        usage.allocated += granted;
    }

    usage
}

/// Orders claims by creation timestamp, then uid, so pending requests are
/// processed deterministically across reconciles.
pub fn sort_claims(claims: &mut [ResourceClaim]) {
    claims.sort_by(|a, b| {
        a.metadata
            .creation_timestamp
            .cmp(&b.metadata.creation_timestamp)
            .then_with(|| a.metadata.uid.cmp(&b.metadata.uid))
    });
}

/// A claim request with no allocation entry yet, or one still `Pending`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PendingRequest {
    pub claim_index: usize,
    pub amount: i64,
}

/// Collects the unanswered requests targeting this bucket, in claim order.
pub fn pending_requests(spec: &AllowanceBucketSpec, claims: &[ResourceClaim]) -> Vec<PendingRequest> {
    let mut pending = Vec::new();

    for (claim_index, claim) in claims.iter().enumerate() {
        if !claim.spec.consumer_ref.matches(&spec.consumer_ref) {
            continue;
        }
        let requests_bucket = claim
            .spec
            .requests
            .iter()
            .find(|request| request.resource_type == spec.resource_type);
        let Some(request) = requests_bucket else {
            continue;
        };

        let answered = claim
            .allocation_for(&spec.resource_type)
            .is_some_and(|allocation| allocation.status != AllocationStatus::Pending);
        if !answered {
            pending.push(PendingRequest {
                claim_index,
                amount: request.amount,
            });
        }
    }

    pending
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Outcome {
    /// Reserve the amount from the bucket, then grant the allocation.
    Reserve,
    /// Deny the allocation; the bucket is not touched.
    Deny,
}

/// One planned answer to a pending request.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Decision {
    pub claim_index: usize,
    pub amount: i64,
    pub outcome: Outcome,
    /// Capacity that was available when this request was considered,
    /// recorded as denial context.
    pub available: i64,
}

/// Walks the pending requests in order, reserving against a local
/// available counter. First pending request wins capacity; a denial does
/// not consume any.
pub fn plan_reservations(limit: i64, allocated: i64, pending: &[PendingRequest]) -> Vec<Decision> {
    let mut available = (limit - allocated).max(0);
    let mut decisions = Vec::with_capacity(pending.len());

    for request in pending {
        if request.amount > available {
            decisions.push(Decision {
                claim_index: request.claim_index,
                amount: request.amount,
                outcome: Outcome::Deny,
                available,
            });
        } else {
            decisions.push(Decision {
                claim_index: request.claim_index,
                amount: request.amount,
                outcome: Outcome::Reserve,
                available,
            });
            available -= request.amount;
        }
    }

    decisions
}

/// Assembles the bucket status for the current aggregation state.
/// `available` is always clamped to zero.
pub fn build_status(
    limit: &LimitSummary,
    allocated: i64,
    claim_count: i32,
    observed_generation: Option<i64>,
) -> AllowanceBucketStatus {
    AllowanceBucketStatus {
        limit: limit.limit,
        allocated,
        available: (limit.limit - allocated).max(0),
        claim_count,
        grant_count: limit.grant_count,
        contributing_grant_refs: limit.contributing.clone(),
        last_reconciliation: None,
        observed_generation,
    }
}
