//! Ownership controller.
//!
//! Granted claims carry a `resourceRef` naming the object whose admission
//! triggered them. This loop attaches exactly one non-controller owner
//! reference pointing at that object, rescues claims whose owner shows up
//! late, and deletes true orphans once they outlive the configured maximum
//! age. Writes go through a field-scoped apply on
//! `metadata.ownerReferences` with a dedicated field owner, so they can
//! never conflict with the admission plugin or the bucket controller.

use std::{sync::Arc, time::Duration};

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::{
    Api, Client, ResourceExt,
    api::{DeleteParams, DynamicObject, Patch, PatchParams},
    discovery::{self, Scope},
};
use quota_types::{
    claim::ResourceClaim,
    labels::OWNERSHIP_FIELD_MANAGER,
    refs::TypedObjectRef,
};
use snafu::{OptionExt, ResultExt, Snafu};

use crate::{
    cluster::{ClusterRouter, ObjectKey},
    config::OwnershipConfig,
    events::DecisionEvents,
    runtime::{Action, WorkQueue, run_controller},
    utils::{self, shutdown::ShutdownWatcher},
};

const CONTROLLER_NAME: &str = "resourceclaim-ownership";

/// Requeue while a claim is younger than the grace period.
const GRACE_REQUEUE: Duration = Duration::from_secs(2);

/// Requeue after transient failures while rescuing a claim.
const RESCUE_REQUEUE: Duration = Duration::from_secs(1);

/// Requeue while waiting for a missing owner that may still appear.
const ORPHAN_POLL_REQUEUE: Duration = Duration::from_secs(30);

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to resolve cluster"))]
    ResolveCluster { source: crate::cluster::router::Error },

    #[snafu(display("failed to get claim {name:?}"))]
    GetClaim { source: kube::Error, name: String },

    #[snafu(display("failed to discover API group {group:?}"))]
    DiscoverGroup { source: kube::Error, group: String },

    #[snafu(display("API group {group:?} serves no kind {kind:?}"))]
    UnknownKind { group: String, kind: String },

    #[snafu(display("failed to look up owner {reference}"))]
    LookupOwner {
        source: kube::Error,
        reference: TypedObjectRef,
    },

    #[snafu(display("owner {reference} has no uid"))]
    OwnerWithoutUid { reference: TypedObjectRef },

    #[snafu(display("failed to attach owner reference on claim {name:?}"))]
    AttachOwner { source: kube::Error, name: String },

    #[snafu(display("failed to delete orphaned claim {name:?}"))]
    DeleteOrphan { source: kube::Error, name: String },
}

pub struct Context {
    router: Arc<ClusterRouter>,
    config: OwnershipConfig,
}

/// What the controller should do with a claim, decided from its age and
/// whether the owner was found.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Disposition {
    /// The claim is not granted yet, already owned, or carries no
    /// resource reference.
    Skip,
    /// Too young to judge; wait out the grace period.
    AwaitGrace,
    /// Old enough to resolve the owner and attach it if present.
    Attach,
    /// The owner never appeared and the claim outlived the maximum age.
    DeleteOrphan,
}

/// Pure decision over the claim's lifecycle state.
pub fn disposition(
    claim: &ResourceClaim,
    age: Duration,
    owner_found: bool,
    config: &OwnershipConfig,
) -> Disposition {
    if claim.metadata.deletion_timestamp.is_some()
        || !claim.is_granted()
        || claim.spec.resource_ref.is_none()
        || !claim.owner_references().is_empty()
    {
        return Disposition::Skip;
    }
    if age < config.grace_period {
        return Disposition::AwaitGrace;
    }
    if owner_found {
        return Disposition::Attach;
    }
    if age > config.max_orphan_age {
        return Disposition::DeleteOrphan;
    }
    Disposition::AwaitGrace
}

/// Runs the ownership controller until shutdown.
pub async fn run(
    router: Arc<ClusterRouter>,
    config: OwnershipConfig,
    workers: usize,
    shutdown: &ShutdownWatcher,
) {
    let queue = WorkQueue::new(crate::runtime::DEFAULT_CAPACITY);

    router.spawn_watches::<ResourceClaim, _, _, _>(
        &queue,
        &Default::default(),
        shutdown,
        |cluster, claim| vec![ObjectKey::of(cluster, claim)],
        |claim: &ResourceClaim| {
            let granted = claim
                .granted_condition()
                .map(|condition| condition.status.clone());
            Some(utils::fingerprint(&(
                claim.metadata.generation,
                granted,
                claim.owner_references().len(),
            )))
        },
    );

    run_controller(
        CONTROLLER_NAME,
        queue,
        workers,
        Arc::new(Context { router, config }),
        reconcile,
        RESCUE_REQUEUE,
        shutdown.handle(),
    )
    .await;
}

async fn reconcile(key: ObjectKey, context: Arc<Context>) -> Result<Action, Error> {
    let handle = context.router.get(&key.cluster).context(ResolveClusterSnafu)?;
    let client = handle.client;
    let namespace = key.namespace.clone().unwrap_or_default();
    let claims: Api<ResourceClaim> = Api::namespaced(client.clone(), &namespace);

    let Some(claim) = claims
        .get_opt(&key.name)
        .await
        .context(GetClaimSnafu { name: key.name.clone() })?
    else {
        return Ok(Action::await_change());
    };

    let age = utils::object_age(&claim.metadata);

    // Cheap pre-checks before any discovery round trip.
    match disposition(&claim, age, false, &context.config) {
        Disposition::Skip => return Ok(Action::await_change()),
        Disposition::AwaitGrace if age < context.config.grace_period => {
            return Ok(Action::requeue(GRACE_REQUEUE));
        }
        _ => {}
    }

    let Some(reference) = claim.spec.resource_ref.clone() else {
        return Ok(Action::await_change());
    };
    let owner = lookup_owner(&client, &reference, &namespace).await?;

    match (disposition(&claim, age, owner.is_some(), &context.config), owner) {
        (Disposition::Skip, _) => Ok(Action::await_change()),
        (Disposition::AwaitGrace, _) => Ok(Action::requeue(ORPHAN_POLL_REQUEUE)),
        (Disposition::Attach, Some(owner)) => {
            attach_owner(&claims, &key.name, owner).await?;
            tracing::info!(claim = %key, owner = %reference, "attached owner reference");
            Ok(Action::await_change())
        }
        // Attach is only decided with a resolved owner.
        (Disposition::Attach, None) => Ok(Action::requeue(RESCUE_REQUEUE)),
        (Disposition::DeleteOrphan, _) => {
            match claims.delete(&key.name, &DeleteParams::default()).await {
                Ok(_) => {
                    tracing::info!(claim = %key, age = ?age, "deleted orphaned claim");
                    DecisionEvents::new(client, CONTROLLER_NAME)
                        .orphan_deleted(&claim, &reference.to_string())
                        .await;
                    Ok(Action::await_change())
                }
                Err(err) if utils::is_not_found(&err) => Ok(Action::await_change()),
                Err(err) => Err(err).context(DeleteOrphanSnafu { name: key.name.clone() }),
            }
        }
    }
}

/// Resolves the referenced owner through API discovery (kind to resource
/// and scope) and fetches it. `None` means the owner does not exist (yet).
async fn lookup_owner(
    client: &Client,
    reference: &TypedObjectRef,
    claim_namespace: &str,
) -> Result<Option<OwnerReference>, Error> {
    let group = discovery::group(client, &reference.group)
        .await
        .context(DiscoverGroupSnafu {
            group: reference.group.clone(),
        })?;
    let (resource, capabilities) =
        group
            .recommended_kind(&reference.kind)
            .context(UnknownKindSnafu {
                group: reference.group.clone(),
                kind: reference.kind.clone(),
            })?;

    let api: Api<DynamicObject> = match capabilities.scope {
        Scope::Namespaced => {
            let namespace = reference.namespace.as_deref().unwrap_or(claim_namespace);
            Api::namespaced_with(client.clone(), namespace, &resource)
        }
        Scope::Cluster => Api::all_with(client.clone(), &resource),
    };

    let found = match api.get_opt(&reference.name).await {
        Ok(found) => found,
        Err(err) => {
            return Err(err).context(LookupOwnerSnafu {
                reference: reference.clone(),
            });
        }
    };

    found
        .map(|object| {
            let uid = object.uid().context(OwnerWithoutUidSnafu {
                reference: reference.clone(),
            })?;
            Ok(OwnerReference {
                api_version: resource.api_version.clone(),
                kind: reference.kind.clone(),
                name: reference.name.clone(),
                uid,
                // Owner references set across the fleet boundary are
                // forbidden; locally the trigger is a plain parent, never
                // the controller.
                controller: None,
                block_owner_deletion: None,
            })
        })
        .transpose()
}

/// Field-scoped apply touching only the owner reference list.
async fn attach_owner(
    claims: &Api<ResourceClaim>,
    name: &str,
    owner: OwnerReference,
) -> Result<(), Error> {
    let patch = serde_json::json!({
        "apiVersion": "quota.miloapis.com/v1alpha1",
        "kind": "ResourceClaim",
        "metadata": {
            "ownerReferences": [owner],
        },
    });
    let params = PatchParams::apply(OWNERSHIP_FIELD_MANAGER);

    claims
        .patch(name, &params, &Patch::Apply(&patch))
        .await
        .map(|_| ())
        .context(AttachOwnerSnafu {
            name: name.to_owned(),
        })
}
