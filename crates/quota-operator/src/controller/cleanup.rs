//! Denied auto-claim cleanup.
//!
//! Claims created by the claim creation admission plugin are marked with
//! the auto-created label and the created-by annotation. Once such a claim
//! is denied for quota, nothing will ever retry it; this loop deletes it
//! promptly. The watch subscribes with a label selector so manually
//! created claims never reach the controller.

use std::{sync::Arc, time::Duration};

use kube::{
    Api, ResourceExt,
    api::DeleteParams,
    runtime::watcher,
};
use quota_types::{
    claim::ResourceClaim,
    conditions::{REASON_QUOTA_EXCEEDED, STATUS_FALSE},
    labels::{AUTO_CREATED_LABEL, CLAIM_CREATION_PLUGIN, CREATED_BY_ANNOTATION},
};
use snafu::{ResultExt, Snafu};

use crate::{
    cluster::{ClusterRouter, ObjectKey},
    events::DecisionEvents,
    runtime::{Action, WorkQueue, run_controller},
    utils::{self, shutdown::ShutdownWatcher},
};

const CONTROLLER_NAME: &str = "denied-claim-cleanup";

const ERROR_REQUEUE: Duration = Duration::from_secs(1);

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to resolve cluster"))]
    ResolveCluster { source: crate::cluster::router::Error },

    #[snafu(display("failed to get claim {name:?}"))]
    GetClaim { source: kube::Error, name: String },

    #[snafu(display("failed to delete denied claim {name:?}"))]
    DeleteClaim { source: kube::Error, name: String },
}

pub struct Context {
    router: Arc<ClusterRouter>,
}

/// Whether a claim is an automation-created claim that was denied for
/// quota and should be removed.
pub fn should_delete(claim: &ResourceClaim) -> bool {
    let auto_created = claim
        .labels()
        .get(AUTO_CREATED_LABEL)
        .is_some_and(|value| value == "true");
    let by_plugin = claim
        .annotations()
        .get(CREATED_BY_ANNOTATION)
        .is_some_and(|value| value == CLAIM_CREATION_PLUGIN);

    let denied = claim.granted_condition().is_some_and(|condition| {
        condition.status == STATUS_FALSE && condition.reason == REASON_QUOTA_EXCEEDED
    });

    auto_created && by_plugin && denied
}

/// Runs the cleanup controller until shutdown.
pub async fn run(router: Arc<ClusterRouter>, workers: usize, shutdown: &ShutdownWatcher) {
    let queue = WorkQueue::new(crate::runtime::DEFAULT_CAPACITY);

    // Filter at subscription time: only auto-created claims are watched.
    let config = watcher::Config::default().labels(&format!("{AUTO_CREATED_LABEL}=true"));

    router.spawn_watches::<ResourceClaim, _, _, _>(
        &queue,
        &config,
        shutdown,
        |cluster, claim| vec![ObjectKey::of(cluster, claim)],
        |claim: &ResourceClaim| {
            let granted = claim
                .granted_condition()
                .map(|condition| (condition.status.clone(), condition.reason.clone()));
            Some(utils::fingerprint(&granted))
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

    if !should_delete(&claim) {
        return Ok(Action::await_change());
    }

    match claims.delete(&key.name, &DeleteParams::default()).await {
        Ok(_) => {
            tracing::info!(claim = %key, "deleted denied auto-created claim");
            DecisionEvents::new(client, CONTROLLER_NAME)
                .denied_claim_removed(&claim)
                .await;
            Ok(Action::await_change())
        }
        Err(err) if utils::is_not_found(&err) => Ok(Action::await_change()),
        Err(err) => Err(err).context(DeleteClaimSnafu { name: key.name.clone() }),
    }
}
