//! Registration validator.
//!
//! Syntactic constraints are enforced at storage time by the schema; this
//! loop re-checks them defensively and publishes the `Active` condition
//! consumed by the policy validators. Registrations are re-validated
//! periodically so drift in out-of-band admission configuration surfaces
//! eventually.

use std::{sync::Arc, time::Duration};

use kube::{Api, api::PostParams};
use quota_types::{
    conditions::{
        self, REASON_REGISTRATION_ACTIVE, REASON_VALIDATION_FAILED, TYPE_ACTIVE, new_condition,
        set_condition,
    },
    registration::{ResourceRegistration, ResourceRegistrationSpec, ResourceRegistrationStatus},
    validation,
};
use snafu::{ResultExt, Snafu};

use crate::{
    cluster::{ClusterRouter, ObjectKey},
    runtime::{Action, WorkQueue, run_controller},
    utils::{self, shutdown::ShutdownWatcher},
};

const REVALIDATION_INTERVAL: Duration = Duration::from_secs(5 * 60);
const ERROR_REQUEUE: Duration = Duration::from_secs(1);

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to resolve cluster"))]
    ResolveCluster { source: crate::cluster::router::Error },

    #[snafu(display("failed to get registration {name:?}"))]
    GetRegistration { source: kube::Error, name: String },

    #[snafu(display("failed to serialize registration {name:?}"))]
    SerializeRegistration {
        source: serde_json::Error,
        name: String,
    },

    #[snafu(display("failed to update status of registration {name:?}"))]
    UpdateStatus { source: kube::Error, name: String },
}

pub struct Context {
    router: Arc<ClusterRouter>,
}

/// Runs the registration validator until shutdown.
pub async fn run(router: Arc<ClusterRouter>, workers: usize, shutdown: &ShutdownWatcher) {
    let queue = WorkQueue::new(crate::runtime::DEFAULT_CAPACITY);

    router.spawn_watches::<ResourceRegistration, _, _, _>(
        &queue,
        &Default::default(),
        shutdown,
        |cluster, registration| vec![ObjectKey::of(cluster, registration)],
        |registration| Some(utils::fingerprint(&registration.metadata.generation)),
    );

    run_controller(
        "registration-validator",
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
    let api: Api<ResourceRegistration> = Api::all(handle.client);

    let Some(registration) = api
        .get_opt(&key.name)
        .await
        .context(GetRegistrationSnafu { name: key.name.clone() })?
    else {
        return Ok(Action::await_change());
    };

    let generation = registration.metadata.generation;
    let condition = match validate(&registration.spec) {
        Ok(()) => new_condition(
            TYPE_ACTIVE,
            true,
            REASON_REGISTRATION_ACTIVE,
            "registration is active",
            generation,
        ),
        Err(failures) => new_condition(
            TYPE_ACTIVE,
            false,
            REASON_VALIDATION_FAILED,
            failures.join("\n"),
            generation,
        ),
    };

    let mut status = registration.status.clone().unwrap_or_default();
    status.observed_generation = generation;
    set_condition(&mut status.conditions, condition);

    let unchanged = registration.status.as_ref().is_some_and(|current| {
        current.observed_generation == status.observed_generation
            && conditions::conditions_equal(&current.conditions, &status.conditions)
    });
    if unchanged {
        return Ok(Action::requeue(REVALIDATION_INTERVAL));
    }

    write_status(&api, &registration, status).await?;
    Ok(Action::requeue(REVALIDATION_INTERVAL))
}

async fn write_status(
    api: &Api<ResourceRegistration>,
    registration: &ResourceRegistration,
    status: ResourceRegistrationStatus,
) -> Result<(), Error> {
    let name = registration.metadata.name.clone().unwrap_or_default();
    let mut updated = registration.clone();
    updated.status = Some(status);

    match api.replace_status(&name, &PostParams::default(), &updated).await {
        Ok(_) => Ok(()),
        // A stale version means something else changed the object; the
        // watch will re-enqueue.
        Err(err) if utils::is_conflict(&err) => Ok(()),
        Err(err) => Err(err).context(UpdateStatusSnafu { name }),
    }
}

/// The schema-beyond checks of a registration spec. Returns every failure.
fn validate(spec: &ResourceRegistrationSpec) -> Result<(), Vec<String>> {
    let mut failures = Vec::new();

    if let Err(errors) = validation::is_resource_type(&spec.resource_type) {
        for error in errors {
            failures.push(format!("resourceType {:?}: {error}", spec.resource_type));
        }
    }

    if spec.consumer_type_ref.kind.is_empty() {
        failures.push("consumerTypeRef.kind must not be empty".to_owned());
    }

    if spec.units.conversion_factor < 1 {
        failures.push(format!(
            "units.conversionFactor must be at least 1, got {}",
            spec.units.conversion_factor
        ));
    }

    let mut seen = std::collections::HashSet::new();
    for claiming in &spec.claiming_resources {
        if !seen.insert((claiming.group.clone(), claiming.kind.clone())) {
            failures.push(format!("duplicate claimingResources entry {claiming}"));
        }
    }

    if failures.is_empty() { Ok(()) } else { Err(failures) }
}

#[cfg(test)]
mod tests {
    use quota_types::{
        refs::GroupKindRef,
        registration::{RegistrationType, ResourceUnits},
    };
    use rstest::rstest;

    use super::*;

    fn spec() -> ResourceRegistrationSpec {
        ResourceRegistrationSpec {
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
            claiming_resources: vec![GroupKindRef {
                group: "resourcemanager.miloapis.com".to_owned(),
                kind: "Project".to_owned(),
            }],
        }
    }

    #[test]
    fn valid_spec_passes() {
        assert!(validate(&spec()).is_ok());
    }

    #[rstest]
    #[case::bad_resource_type(ResourceRegistrationSpec {
        resource_type: "not a resource type".to_owned(),
        ..spec()
    })]
    #[case::zero_conversion_factor(ResourceRegistrationSpec {
        units: ResourceUnits { conversion_factor: 0, ..spec().units },
        ..spec()
    })]
    #[case::empty_consumer_kind(ResourceRegistrationSpec {
        consumer_type_ref: GroupKindRef { group: String::new(), kind: String::new() },
        ..spec()
    })]
    fn invalid_specs_fail(#[case] spec: ResourceRegistrationSpec) {
        assert!(validate(&spec).is_err());
    }

    #[test]
    fn duplicate_claiming_resources_fail() {
        let mut spec = spec();
        spec.claiming_resources.push(spec.claiming_resources[0].clone());

        let failures = validate(&spec).expect_err("duplicate must fail");
        assert!(failures[0].contains("duplicate claimingResources"));
    }

    #[test]
    fn all_failures_are_collected() {
        let mut spec = spec();
        spec.resource_type = "nope".to_owned();
        spec.units.conversion_factor = -3;

        let failures = validate(&spec).expect_err("invalid spec");
        assert!(failures.len() >= 2);
    }
}
