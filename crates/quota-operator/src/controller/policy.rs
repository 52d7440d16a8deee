//! Claim and grant creation policy validators.
//!
//! Both validators run the schema-beyond checks: guard expression syntax
//! and length, template expression syntax per delimiter family, and that
//! every referenced resource type resolves to an `Active` registration.
//! Claim policies additionally require the trigger kind to be authorized
//! by the registration's `claimingResources`. Failures are aggregated into
//! one human-readable condition message, and policies are re-validated
//! periodically so registration drift surfaces without an edit.

use std::{sync::Arc, time::Duration};

use kube::{Api, api::{ListParams, PostParams}};
use quota_types::{
    conditions::{
        self, REASON_PARENT_CONTEXT_READY, REASON_PARENT_CONTEXT_UNSUPPORTED, REASON_POLICY_READY,
        REASON_VALIDATION_FAILED, TYPE_ACTIVE, TYPE_PARENT_CONTEXT_READY, TYPE_READY,
        new_condition, set_condition,
    },
    policy::{
        ClaimCreationPolicy, ClaimCreationPolicySpec, GrantCreationPolicy, GrantCreationPolicySpec,
    },
    refs::GroupKindRef,
    registration::ResourceRegistration,
};
use snafu::{ResultExt, Snafu};

use crate::{
    cluster::{ClusterRouter, ObjectKey, parent::ParentContextResolver},
    engine::{CLAIM_DELIMITERS, ExpressionEngine, GRANT_DELIMITERS, TemplateEngine},
    runtime::{Action, WorkQueue, run_controller},
    utils::{self, shutdown::ShutdownWatcher},
};

const REVALIDATION_INTERVAL: Duration = Duration::from_secs(5 * 60);
const ERROR_REQUEUE: Duration = Duration::from_secs(1);

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to resolve cluster"))]
    ResolveCluster { source: crate::cluster::router::Error },

    #[snafu(display("failed to get policy {name:?}"))]
    GetPolicy { source: kube::Error, name: String },

    #[snafu(display("failed to list registrations"))]
    ListRegistrations { source: kube::Error },

    #[snafu(display("failed to serialize policy {name:?}"))]
    SerializePolicy {
        source: serde_json::Error,
        name: String,
    },

    #[snafu(display("failed to update status of policy {name:?}"))]
    UpdateStatus { source: kube::Error, name: String },
}

/// Registrations a policy's resource types are checked against.
pub struct RegistrationIndex {
    registrations: Vec<ResourceRegistration>,
}

impl RegistrationIndex {
    pub fn new(registrations: Vec<ResourceRegistration>) -> Self {
        Self { registrations }
    }

    /// The active registration for a resource type, if any.
    fn active(&self, resource_type: &str) -> Option<&ResourceRegistration> {
        self.registrations.iter().find(|registration| {
            registration.spec.resource_type == resource_type
                && registration.status.as_ref().is_some_and(|status| {
                    conditions::is_condition_true(&status.conditions, TYPE_ACTIVE)
                })
        })
    }

    /// Checks that `resource_type` resolves to an active registration and,
    /// when `claimant` is given, that the kind is authorized to claim it.
    fn check(
        &self,
        resource_type: &str,
        claimant: Option<&GroupKindRef>,
        failures: &mut Vec<String>,
    ) {
        let Some(registration) = self.active(resource_type) else {
            failures.push(format!(
                "resource type {resource_type:?} does not resolve to an active registration"
            ));
            return;
        };

        if let Some(claimant) = claimant
            && !registration.spec.claiming_resources.contains(claimant)
        {
            failures.push(format!(
                "kind {claimant} is not authorized to create claims for {resource_type:?}"
            ));
        }
    }
}

/// Schema-beyond validation of a claim creation policy. Returns every
/// failure.
pub fn validate_claim_policy(
    spec: &ClaimCreationPolicySpec,
    registrations: &RegistrationIndex,
) -> Vec<String> {
    let mut failures = Vec::new();
    let expressions = ExpressionEngine::new();
    let templates = TemplateEngine::new(CLAIM_DELIMITERS);

    for guard in &spec.when {
        if let Err(err) = expressions.validate(guard) {
            failures.push(format!("guard {guard:?}: {err}"));
        }
    }

    validate_template_metadata(&templates, &spec.template.metadata, &mut failures);
    match serde_json::to_value(&spec.template.spec) {
        Ok(template) => {
            if let Err(err) = templates.validate_value(&template) {
                failures.push(format!("template spec: {err}"));
            }
        }
        Err(err) => failures.push(format!("template spec is not serializable: {err}")),
    }

    for request in &spec.template.spec.requests {
        registrations.check(&request.resource_type, Some(&spec.trigger), &mut failures);
    }

    failures
}

/// Schema-beyond validation of a grant creation policy, excluding the
/// parent context (reported on its own condition).
pub fn validate_grant_policy(
    spec: &GrantCreationPolicySpec,
    registrations: &RegistrationIndex,
) -> Vec<String> {
    let mut failures = Vec::new();
    let expressions = ExpressionEngine::new();
    let templates = TemplateEngine::new(GRANT_DELIMITERS);

    for guard in &spec.when {
        if let Err(err) = expressions.validate(guard) {
            failures.push(format!("guard {guard:?}: {err}"));
        }
    }

    if spec.template.metadata.name.is_none() {
        failures.push("template.metadata.name is required for grant templates".to_owned());
    }
    if spec.template.metadata.namespace.is_none() {
        failures.push("template.metadata.namespace is required for grant templates".to_owned());
    }
    validate_template_metadata(&templates, &spec.template.metadata, &mut failures);

    match serde_json::to_value(&spec.template.spec) {
        Ok(template) => {
            if let Err(err) = templates.validate_value(&template) {
                failures.push(format!("template spec: {err}"));
            }
        }
        Err(err) => failures.push(format!("template spec is not serializable: {err}")),
    }

    for allowance in &spec.template.spec.allowances {
        registrations.check(&allowance.resource_type, None, &mut failures);
    }

    failures
}

/// Validation of a declared parent context: the resolver must support the
/// kind and the name expression must compile.
pub fn validate_parent_context(
    spec: &GrantCreationPolicySpec,
    resolver: &ParentContextResolver,
) -> Result<(), Vec<String>> {
    let Some(parent) = &spec.parent_context else {
        return Ok(());
    };

    let mut failures = Vec::new();
    if !resolver.supports(&parent.group, &parent.kind) {
        failures.push(format!(
            "parent context kind {}.{} is not supported",
            parent.kind, parent.group
        ));
    }
    if let Err(err) = ExpressionEngine::new().validate(&parent.name_expression) {
        failures.push(format!("parent context name expression: {err}"));
    }

    if failures.is_empty() { Ok(()) } else { Err(failures) }
}

fn validate_template_metadata(
    templates: &TemplateEngine,
    metadata: &quota_types::policy::TemplateMetadata,
    failures: &mut Vec<String>,
) {
    let fields = metadata
        .name
        .iter()
        .chain(metadata.namespace.iter())
        .chain(metadata.labels.values())
        .chain(metadata.annotations.values());
    for field in fields {
        if let Err(err) = templates.validate_string(field) {
            failures.push(format!("template metadata: {err}"));
        }
    }
}

struct ClaimPolicyContext {
    router: Arc<ClusterRouter>,
}

struct GrantPolicyContext {
    router: Arc<ClusterRouter>,
    resolver: Arc<ParentContextResolver>,
}

/// Runs the claim creation policy validator until shutdown.
pub async fn run_claim_policy_validator(
    router: Arc<ClusterRouter>,
    workers: usize,
    shutdown: &ShutdownWatcher,
) {
    let queue = WorkQueue::new(crate::runtime::DEFAULT_CAPACITY);

    router.spawn_watches::<ClaimCreationPolicy, _, _, _>(
        &queue,
        &Default::default(),
        shutdown,
        |cluster, policy| vec![ObjectKey::of(cluster, policy)],
        |policy: &ClaimCreationPolicy| Some(utils::fingerprint(&policy.metadata.generation)),
    );

    run_controller(
        "claimcreationpolicy-validator",
        queue,
        workers,
        Arc::new(ClaimPolicyContext { router }),
        reconcile_claim_policy,
        ERROR_REQUEUE,
        shutdown.handle(),
    )
    .await;
}

/// Runs the grant creation policy validator until shutdown.
pub async fn run_grant_policy_validator(
    router: Arc<ClusterRouter>,
    resolver: Arc<ParentContextResolver>,
    workers: usize,
    shutdown: &ShutdownWatcher,
) {
    let queue = WorkQueue::new(crate::runtime::DEFAULT_CAPACITY);

    router.spawn_watches::<GrantCreationPolicy, _, _, _>(
        &queue,
        &Default::default(),
        shutdown,
        |cluster, policy| vec![ObjectKey::of(cluster, policy)],
        |policy: &GrantCreationPolicy| Some(utils::fingerprint(&policy.metadata.generation)),
    );

    run_controller(
        "grantcreationpolicy-validator",
        queue,
        workers,
        Arc::new(GrantPolicyContext { router, resolver }),
        reconcile_grant_policy,
        ERROR_REQUEUE,
        shutdown.handle(),
    )
    .await;
}

async fn reconcile_claim_policy(
    key: ObjectKey,
    context: Arc<ClaimPolicyContext>,
) -> Result<Action, Error> {
    let handle = context.router.get(&key.cluster).context(ResolveClusterSnafu)?;
    let api: Api<ClaimCreationPolicy> = Api::all(handle.client.clone());

    let Some(policy) = api
        .get_opt(&key.name)
        .await
        .context(GetPolicySnafu { name: key.name.clone() })?
    else {
        return Ok(Action::await_change());
    };

    let registrations = load_registrations(&handle.client).await?;
    let failures = validate_claim_policy(&policy.spec, &registrations);
    let generation = policy.metadata.generation;

    let mut status = policy.status.clone().unwrap_or_default();
    status.observed_generation = generation;
    set_condition(&mut status.conditions, ready_condition(&failures, generation));

    let unchanged = policy.status.as_ref().is_some_and(|current| {
        current.observed_generation == status.observed_generation
            && conditions::conditions_equal(&current.conditions, &status.conditions)
    });
    if !unchanged {
        let mut updated = policy.clone();
        updated.status = Some(status);
        write_policy_status(&api, &key.name, &updated).await?;
    }

    Ok(Action::requeue(REVALIDATION_INTERVAL))
}

async fn reconcile_grant_policy(
    key: ObjectKey,
    context: Arc<GrantPolicyContext>,
) -> Result<Action, Error> {
    let handle = context.router.get(&key.cluster).context(ResolveClusterSnafu)?;
    let api: Api<GrantCreationPolicy> = Api::all(handle.client.clone());

    let Some(policy) = api
        .get_opt(&key.name)
        .await
        .context(GetPolicySnafu { name: key.name.clone() })?
    else {
        return Ok(Action::await_change());
    };

    let registrations = load_registrations(&handle.client).await?;
    let mut failures = validate_grant_policy(&policy.spec, &registrations);
    let parent_context = validate_parent_context(&policy.spec, &context.resolver);
    let generation = policy.metadata.generation;

    let mut status = policy.status.clone().unwrap_or_default();
    status.observed_generation = generation;

    if policy.spec.parent_context.is_some() {
        let condition = match &parent_context {
            Ok(()) => new_condition(
                TYPE_PARENT_CONTEXT_READY,
                true,
                REASON_PARENT_CONTEXT_READY,
                "parent context is reachable",
                generation,
            ),
            Err(parent_failures) => new_condition(
                TYPE_PARENT_CONTEXT_READY,
                false,
                REASON_PARENT_CONTEXT_UNSUPPORTED,
                parent_failures.join("\n"),
                generation,
            ),
        };
        set_condition(&mut status.conditions, condition);
    }

    // An unusable parent context keeps the policy from executing at all.
    if let Err(parent_failures) = parent_context {
        failures.extend(parent_failures);
    }
    set_condition(&mut status.conditions, ready_condition(&failures, generation));

    let unchanged = policy.status.as_ref().is_some_and(|current| {
        current.observed_generation == status.observed_generation
            && conditions::conditions_equal(&current.conditions, &status.conditions)
    });
    if !unchanged {
        let mut updated = policy.clone();
        updated.status = Some(status);
        write_policy_status(&api, &key.name, &updated).await?;
    }

    Ok(Action::requeue(REVALIDATION_INTERVAL))
}

fn ready_condition(
    failures: &[String],
    generation: Option<i64>,
) -> k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition {
    if failures.is_empty() {
        new_condition(
            TYPE_READY,
            true,
            REASON_POLICY_READY,
            "policy is ready",
            generation,
        )
    } else {
        new_condition(
            TYPE_READY,
            false,
            REASON_VALIDATION_FAILED,
            failures.join("\n"),
            generation,
        )
    }
}

async fn load_registrations(client: &kube::Client) -> Result<RegistrationIndex, Error> {
    let registrations = Api::<ResourceRegistration>::all(client.clone())
        .list(&ListParams::default())
        .await
        .context(ListRegistrationsSnafu)?
        .items;
    Ok(RegistrationIndex::new(registrations))
}

async fn write_policy_status<K>(api: &Api<K>, name: &str, updated: &K) -> Result<(), Error>
where
    K: kube::Resource + serde::Serialize + serde::de::DeserializeOwned + Clone + std::fmt::Debug,
{
    match api.replace_status(name, &PostParams::default(), updated).await {
        Ok(_) => Ok(()),
        Err(err) if utils::is_conflict(&err) => Ok(()),
        Err(err) => Err(err).context(UpdateStatusSnafu {
            name: name.to_owned(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use kube::api::ObjectMeta;
    use quota_types::{
        claim::{ResourceClaimSpec, ResourceRequest},
        grant::{Allowance, GrantBucket, ResourceGrantSpec},
        policy::{ClaimTemplate, GrantTemplate, ParentContextRef, TemplateMetadata},
        refs::ConsumerRef,
        registration::{
            RegistrationType, ResourceRegistrationSpec, ResourceRegistrationStatus, ResourceUnits,
        },
    };

    use super::*;
    use crate::cluster::parent::{DEFAULT_CLIENT_TTL, PROJECT_GROUP, PROJECT_KIND};

    const PROJECTS: &str = "resourcemanager.miloapis.com/projects";

    fn project_trigger() -> GroupKindRef {
        GroupKindRef {
            group: "resourcemanager.miloapis.com".to_owned(),
            kind: "Project".to_owned(),
        }
    }

    fn registration(resource_type: &str, active: bool, claiming: Vec<GroupKindRef>) -> ResourceRegistration {
        ResourceRegistration {
            metadata: ObjectMeta {
                name: Some("registration".to_owned()),
                ..ObjectMeta::default()
            },
            spec: ResourceRegistrationSpec {
                consumer_type_ref: GroupKindRef {
                    group: "resourcemanager.miloapis.com".to_owned(),
                    kind: "Organization".to_owned(),
                },
                type_: RegistrationType::Entity,
                resource_type: resource_type.to_owned(),
                units: ResourceUnits {
                    base_unit: "project".to_owned(),
                    display_unit: "project".to_owned(),
                    conversion_factor: 1,
                },
                claiming_resources: claiming,
            },
            status: Some(ResourceRegistrationStatus {
                conditions: vec![new_condition(
                    TYPE_ACTIVE,
                    active,
                    if active { "RegistrationActive" } else { "ValidationFailed" },
                    "test",
                    Some(1),
                )],
                observed_generation: Some(1),
            }),
        }
    }

    fn claim_policy() -> ClaimCreationPolicySpec {
        ClaimCreationPolicySpec {
            trigger: project_trigger(),
            when: vec!["trigger.metadata.name != ''".to_owned()],
            template: ClaimTemplate {
                metadata: TemplateMetadata {
                    name: Some("claim-{{ trigger.metadata.name }}".to_owned()),
                    ..TemplateMetadata::default()
                },
                spec: ResourceClaimSpec {
                    consumer_ref: ConsumerRef {
                        kind: "Organization".to_owned(),
                        name: "{{ trigger.metadata.labels.org }}".to_owned(),
                        ..ConsumerRef::default()
                    },
                    requests: vec![ResourceRequest {
                        resource_type: PROJECTS.to_owned(),
                        amount: 1,
                    }],
                    resource_ref: None,
                },
            },
        }
    }

    fn grant_policy() -> GrantCreationPolicySpec {
        GrantCreationPolicySpec {
            trigger: project_trigger(),
            when: vec!["trigger.spec.tier == 'gold'".to_owned()],
            parent_context: None,
            template: GrantTemplate {
                metadata: TemplateMetadata {
                    name: Some("grant-${ trigger.metadata.name }".to_owned()),
                    namespace: Some("quota-system".to_owned()),
                    ..TemplateMetadata::default()
                },
                spec: ResourceGrantSpec {
                    consumer_ref: ConsumerRef {
                        kind: "Organization".to_owned(),
                        name: "${ trigger.metadata.labels.org }".to_owned(),
                        ..ConsumerRef::default()
                    },
                    allowances: vec![Allowance {
                        resource_type: PROJECTS.to_owned(),
                        buckets: vec![GrantBucket { amount: 10 }],
                    }],
                },
            },
        }
    }

    #[test]
    fn valid_claim_policy_passes() {
        let index = RegistrationIndex::new(vec![registration(
            PROJECTS,
            true,
            vec![project_trigger()],
        )]);

        assert!(validate_claim_policy(&claim_policy(), &index).is_empty());
    }

    #[test]
    fn unregistered_resource_type_fails() {
        let index = RegistrationIndex::new(vec![]);

        let failures = validate_claim_policy(&claim_policy(), &index);
        assert!(failures[0].contains("does not resolve to an active registration"));
    }

    #[test]
    fn inactive_registration_fails() {
        let index = RegistrationIndex::new(vec![registration(
            PROJECTS,
            false,
            vec![project_trigger()],
        )]);

        assert!(!validate_claim_policy(&claim_policy(), &index).is_empty());
    }

    #[test]
    fn unauthorized_trigger_kind_fails() {
        // Empty claimingResources is deny-all.
        let index = RegistrationIndex::new(vec![registration(PROJECTS, true, vec![])]);

        let failures = validate_claim_policy(&claim_policy(), &index);
        assert!(failures[0].contains("not authorized to create claims"));
    }

    #[test]
    fn bad_guard_expression_fails() {
        let index = RegistrationIndex::new(vec![registration(
            PROJECTS,
            true,
            vec![project_trigger()],
        )]);
        let mut spec = claim_policy();
        spec.when.push("trigger.metadata. ==".to_owned());

        let failures = validate_claim_policy(&spec, &index);
        assert!(failures.iter().any(|failure| failure.contains("guard")));
    }

    #[test]
    fn bad_template_expression_fails() {
        let index = RegistrationIndex::new(vec![registration(
            PROJECTS,
            true,
            vec![project_trigger()],
        )]);
        let mut spec = claim_policy();
        spec.template.metadata.name = Some("claim-{{ trigger.metadata.name".to_owned());

        let failures = validate_claim_policy(&spec, &index);
        assert!(failures.iter().any(|failure| failure.contains("template metadata")));
    }

    #[test]
    fn valid_grant_policy_passes() {
        let index = RegistrationIndex::new(vec![registration(PROJECTS, true, vec![])]);

        assert!(validate_grant_policy(&grant_policy(), &index).is_empty());
    }

    #[test]
    fn grant_template_requires_name_and_namespace() {
        let index = RegistrationIndex::new(vec![registration(PROJECTS, true, vec![])]);
        let mut spec = grant_policy();
        spec.template.metadata.name = None;
        spec.template.metadata.namespace = None;

        let failures = validate_grant_policy(&spec, &index);
        assert!(failures.iter().any(|failure| failure.contains("metadata.name")));
        assert!(failures.iter().any(|failure| failure.contains("metadata.namespace")));
    }

    #[tokio::test]
    async fn parent_context_project_is_supported() {
        let config = kube::Config::new("https://api.example.com".parse().expect("test uri"));
        let resolver = ParentContextResolver::new(config, DEFAULT_CLIENT_TTL);

        let mut spec = grant_policy();
        spec.parent_context = Some(ParentContextRef {
            group: PROJECT_GROUP.to_owned(),
            kind: PROJECT_KIND.to_owned(),
            name_expression: "trigger.metadata.labels.project".to_owned(),
        });

        assert!(validate_parent_context(&spec, &resolver).is_ok());

        spec.parent_context = Some(ParentContextRef {
            group: PROJECT_GROUP.to_owned(),
            kind: "Folder".to_owned(),
            name_expression: "trigger.metadata.name".to_owned(),
        });
        let failures = validate_parent_context(&spec, &resolver).expect_err("unsupported kind");
        assert!(failures[0].contains("not supported"));

        resolver.close();
    }
}
