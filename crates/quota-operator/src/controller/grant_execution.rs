//! Grant-creation executor.
//!
//! For every ready `GrantCreationPolicy` the executor subscribes to the
//! policy's trigger kind through the dynamic informer manager. Observed
//! trigger objects are run through the policy's guards: when all hold, the
//! grant template is rendered and upserted on the target control plane
//! (local, or a parent context resolved from the policy); when one fails,
//! a previously created grant is cleaned up by label match. Delete events
//! on triggers are intentionally ignored; local garbage collection flows
//! through the controller owner reference attached at creation.

use std::{collections::HashMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use kube::{
    Api, Client, ResourceExt,
    api::{DeleteParams, DynamicObject, ObjectMeta, PostParams},
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use quota_types::{
    grant::{ResourceGrant, ResourceGrantSpec},
    labels::POLICY_LABEL,
    policy::GrantCreationPolicy,
    refs::GroupKindRef,
};
use snafu::{OptionExt, ResultExt, Snafu};

use crate::{
    cluster::{ClusterRouter, ObjectKey, parent::ParentContextResolver},
    engine::{Environment, ExpressionEngine, GRANT_DELIMITERS, TemplateEngine},
    informer::{EventHandler, InformerManager},
    runtime::{Action, WorkQueue, run_controller},
    utils::{self, shutdown::ShutdownWatcher},
};

const ERROR_REQUEUE: Duration = Duration::from_secs(1);

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to resolve cluster"))]
    ResolveCluster { source: crate::cluster::router::Error },

    #[snafu(display("failed to get policy {name:?}"))]
    GetPolicy { source: kube::Error, name: String },

    #[snafu(display("failed to subscribe policy {name:?} to its trigger kind"))]
    Subscribe {
        source: crate::informer::Error,
        name: String,
    },
}

/// Errors of the event handling path; logged, never fatal to the watch.
#[derive(Debug, Snafu)]
enum ApplyError {
    #[snafu(display("trigger object is not serializable"))]
    SerializeTrigger { source: serde_json::Error },

    #[snafu(display("failed to evaluate guard {guard:?}"))]
    EvaluateGuard {
        source: crate::engine::expression::Error,
        guard: String,
    },

    #[snafu(display("failed to render {field}"))]
    RenderField {
        source: crate::engine::template::Error,
        field: &'static str,
    },

    #[snafu(display("grant template has no {field}"))]
    MissingTemplateField { field: &'static str },

    #[snafu(display("failed to evaluate parent context name expression"))]
    EvaluateParentName {
        source: crate::engine::expression::Error,
    },

    #[snafu(display("failed to resolve parent context {name:?}"))]
    ResolveParentContext {
        source: crate::cluster::parent::Error,
        name: String,
    },

    #[snafu(display("rendered grant spec is invalid"))]
    InvalidRenderedSpec { source: serde_json::Error },

    #[snafu(display("failed to read grant {name:?}"))]
    ReadGrant { source: kube::Error, name: String },

    #[snafu(display("failed to write grant {name:?}"))]
    WriteGrant { source: kube::Error, name: String },

    #[snafu(display("failed to delete grant {name:?}"))]
    DeleteGrant { source: kube::Error, name: String },
}

struct Context {
    router: Arc<ClusterRouter>,
    resolver: Arc<ParentContextResolver>,
    shutdown: ShutdownWatcher,
    /// One informer manager per cluster, created lazily.
    informers: tokio::sync::Mutex<HashMap<String, Arc<InformerManager>>>,
    /// Trigger kind currently subscribed per policy, keyed by
    /// `cluster/policy`.
    subscriptions: tokio::sync::Mutex<HashMap<String, GroupKindRef>>,
}

/// Runs the grant-creation executor until shutdown.
pub async fn run(
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
        // Resubscription cares about the spec and the Ready condition.
        |policy: &GrantCreationPolicy| {
            Some(utils::fingerprint(&(
                policy.metadata.generation,
                policy.is_ready(),
            )))
        },
    );

    let context = Context {
        router: Arc::clone(&router),
        resolver,
        shutdown: shutdown.clone(),
        informers: tokio::sync::Mutex::new(HashMap::new()),
        subscriptions: tokio::sync::Mutex::new(HashMap::new()),
    };

    run_controller(
        "grant-creation-executor",
        queue,
        workers,
        Arc::new(context),
        reconcile,
        ERROR_REQUEUE,
        shutdown.handle(),
    )
    .await;
}

/// Keeps the informer subscription of one policy in step with its
/// readiness.
async fn reconcile(key: ObjectKey, context: Arc<Context>) -> Result<Action, Error> {
    let handle = context.router.get(&key.cluster).context(ResolveClusterSnafu)?;
    let api: Api<GrantCreationPolicy> = Api::all(handle.client.clone());
    let subscriber = format!("{}/{}", key.cluster, key.name);

    let policy = api
        .get_opt(&key.name)
        .await
        .context(GetPolicySnafu { name: key.name.clone() })?;

    let desired = policy
        .as_ref()
        .filter(|policy| policy.is_ready() && policy.metadata.deletion_timestamp.is_none())
        .map(|policy| policy.spec.trigger.clone());

    let informer = informer_for(&context, &key.cluster, &handle.client).await;
    let mut subscriptions = context.subscriptions.lock().await;
    let current = subscriptions.get(&subscriber).cloned();

    if current == desired {
        return Ok(Action::await_change());
    }

    if let Some(previous) = current {
        informer
            .unsubscribe(&previous.group, &previous.kind, &subscriber)
            .await;
        subscriptions.remove(&subscriber);
    }

    if let Some(trigger) = desired {
        let handler = Arc::new(PolicyEventHandler {
            client: handle.client.clone(),
            policy_name: key.name.clone(),
            resolver: Arc::clone(&context.resolver),
        });
        informer
            .subscribe(
                &trigger.group,
                &trigger.kind,
                &subscriber,
                handler,
                &context.shutdown,
            )
            .await
            .context(SubscribeSnafu { name: key.name.clone() })?;
        subscriptions.insert(subscriber, trigger.clone());
        tracing::info!(policy = %key, trigger = %trigger, "subscribed policy to trigger kind");
    }

    Ok(Action::await_change())
}

async fn informer_for(context: &Context, cluster: &str, client: &Client) -> Arc<InformerManager> {
    let mut informers = context.informers.lock().await;
    Arc::clone(
        informers
            .entry(cluster.to_owned())
            .or_insert_with(|| InformerManager::new(client.clone())),
    )
}

/// Handles trigger events for one policy.
struct PolicyEventHandler {
    client: Client,
    policy_name: String,
    resolver: Arc<ParentContextResolver>,
}

#[async_trait]
impl EventHandler for PolicyEventHandler {
    async fn on_add(&self, object: DynamicObject) {
        self.handle(object).await;
    }

    async fn on_update(&self, object: DynamicObject) {
        self.handle(object).await;
    }

    async fn on_delete(&self, _object: DynamicObject) {
        // Trigger deletion is intentionally ignored; local grants are
        // garbage collected through their owner reference and parent
        // cluster grants through policy deletion.
    }
}

/// The target control plane a policy writes grants to.
struct Target {
    client: Client,
    local: bool,
}

impl PolicyEventHandler {
    async fn handle(&self, trigger: DynamicObject) {
        if let Err(err) = self.apply(&trigger).await {
            tracing::warn!(
                policy = %self.policy_name,
                trigger = %trigger.name_any(),
                error = %err,
                "failed to apply grant creation policy"
            );
        }
    }

    async fn apply(&self, trigger: &DynamicObject) -> Result<(), ApplyError> {
        let policies: Api<GrantCreationPolicy> = Api::all(self.client.clone());
        let Ok(Some(policy)) = policies.get_opt(&self.policy_name).await else {
            return Ok(());
        };
        if !policy.is_ready() {
            return Ok(());
        }

        let environment =
            Environment::for_trigger(serde_json::to_value(trigger).context(SerializeTriggerSnafu)?);
        let templates = TemplateEngine::new(GRANT_DELIMITERS);

        let name_template = policy
            .spec
            .template
            .metadata
            .name
            .as_deref()
            .context(MissingTemplateFieldSnafu { field: "metadata.name" })?;
        let namespace_template = policy
            .spec
            .template
            .metadata
            .namespace
            .as_deref()
            .context(MissingTemplateFieldSnafu {
                field: "metadata.namespace",
            })?;
        let name = templates
            .render_string(name_template, &environment)
            .context(RenderFieldSnafu { field: "metadata.name" })?;
        let namespace = templates
            .render_string(namespace_template, &environment)
            .context(RenderFieldSnafu {
                field: "metadata.namespace",
            })?;

        let target = self.resolve_target(&policy, &environment)?;
        let grants: Api<ResourceGrant> = Api::namespaced(target.client.clone(), &namespace);

        if !self.guards_hold(&policy, &environment)? {
            return self.cleanup(&grants, &name).await;
        }

        let spec = self.render_spec(&templates, &policy, &environment)?;
        let labels = self.render_metadata(&templates, &policy.spec.template.metadata.labels, &environment, "metadata.labels")?;
        let annotations = self.render_metadata(
            &templates,
            &policy.spec.template.metadata.annotations,
            &environment,
            "metadata.annotations",
        )?;

        self.upsert(&grants, trigger, &target, &name, &namespace, spec, labels, annotations)
            .await
    }

    fn guards_hold(
        &self,
        policy: &GrantCreationPolicy,
        environment: &Environment,
    ) -> Result<bool, ApplyError> {
        let expressions = ExpressionEngine::new();
        for guard in &policy.spec.when {
            let holds = expressions
                .evaluate_bool(guard, environment)
                .context(EvaluateGuardSnafu { guard: guard.clone() })?;
            if !holds {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn resolve_target(
        &self,
        policy: &GrantCreationPolicy,
        environment: &Environment,
    ) -> Result<Target, ApplyError> {
        let Some(parent) = &policy.spec.parent_context else {
            return Ok(Target {
                client: self.client.clone(),
                local: true,
            });
        };

        let name = ExpressionEngine::new()
            .evaluate_scalar(&parent.name_expression, environment)
            .context(EvaluateParentNameSnafu)?;
        let client = self
            .resolver
            .resolve(&parent.group, &parent.kind, &name)
            .context(ResolveParentContextSnafu { name: name.clone() })?;

        Ok(Target {
            client,
            local: false,
        })
    }

    fn render_spec(
        &self,
        templates: &TemplateEngine,
        policy: &GrantCreationPolicy,
        environment: &Environment,
    ) -> Result<ResourceGrantSpec, ApplyError> {
        let template =
            serde_json::to_value(&policy.spec.template.spec).context(InvalidRenderedSpecSnafu)?;
        let rendered = templates
            .render_value(&template, environment)
            .context(RenderFieldSnafu { field: "spec" })?;
        serde_json::from_value(rendered).context(InvalidRenderedSpecSnafu)
    }

    fn render_metadata(
        &self,
        templates: &TemplateEngine,
        fields: &std::collections::BTreeMap<String, String>,
        environment: &Environment,
        field: &'static str,
    ) -> Result<std::collections::BTreeMap<String, String>, ApplyError> {
        fields
            .iter()
            .map(|(key, value)| {
                Ok((
                    key.clone(),
                    templates
                        .render_string(value, environment)
                        .context(RenderFieldSnafu { field })?,
                ))
            })
            .collect()
    }

    /// Deletes a previously created grant when the guards stopped holding,
    /// but only if it is labeled as created from this policy.
    async fn cleanup(&self, grants: &Api<ResourceGrant>, name: &str) -> Result<(), ApplyError> {
        let existing = match grants.get_opt(name).await {
            Ok(existing) => existing,
            Err(err) => {
                return Err(err).context(ReadGrantSnafu {
                    name: name.to_owned(),
                });
            }
        };
        let Some(existing) = existing else {
            return Ok(());
        };

        let created_by_policy = existing
            .labels()
            .get(POLICY_LABEL)
            .is_some_and(|policy| policy == &self.policy_name);
        if !created_by_policy {
            return Ok(());
        }

        match grants.delete(name, &DeleteParams::default()).await {
            Ok(_) => {
                tracing::info!(grant = %name, policy = %self.policy_name, "deleted grant after guard stopped holding");
                Ok(())
            }
            Err(err) if utils::is_not_found(&err) => Ok(()),
            Err(err) => Err(err).context(DeleteGrantSnafu {
                name: name.to_owned(),
            }),
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn upsert(
        &self,
        grants: &Api<ResourceGrant>,
        trigger: &DynamicObject,
        target: &Target,
        name: &str,
        namespace: &str,
        spec: ResourceGrantSpec,
        mut labels: std::collections::BTreeMap<String, String>,
        annotations: std::collections::BTreeMap<String, String>,
    ) -> Result<(), ApplyError> {
        labels.insert(POLICY_LABEL.to_owned(), self.policy_name.clone());

        let existing = grants.get_opt(name).await.context(ReadGrantSnafu {
            name: name.to_owned(),
        })?;

        match existing {
            None => {
                // A controller owner reference ties the grant's lifetime
                // to the trigger, but only on the local cluster; owner
                // references never cross the fleet boundary.
                let owner_references = target
                    .local
                    .then(|| trigger_owner_reference(trigger))
                    .flatten()
                    .map(|reference| vec![reference]);

                let grant = ResourceGrant {
                    metadata: ObjectMeta {
                        name: Some(name.to_owned()),
                        namespace: Some(namespace.to_owned()),
                        labels: Some(labels),
                        annotations: (!annotations.is_empty()).then_some(annotations),
                        owner_references,
                        ..ObjectMeta::default()
                    },
                    spec,
                    status: None,
                };
                match grants.create(&PostParams::default(), &grant).await {
                    Ok(_) => {
                        tracing::info!(grant = %name, policy = %self.policy_name, "created grant");
                        Ok(())
                    }
                    // Lost a benign creation race; the update path of the
                    // next event converges.
                    Err(err) if utils::is_conflict(&err) => Ok(()),
                    Err(err) => Err(err).context(WriteGrantSnafu {
                        name: name.to_owned(),
                    }),
                }
            }
            Some(mut existing) => {
                existing.spec = spec;
                existing
                    .metadata
                    .labels
                    .get_or_insert_with(Default::default)
                    .extend(labels);
                if !annotations.is_empty() {
                    existing
                        .metadata
                        .annotations
                        .get_or_insert_with(Default::default)
                        .extend(annotations);
                }
                grants
                    .replace(name, &PostParams::default(), &existing)
                    .await
                    .map(|_| ())
                    .context(WriteGrantSnafu {
                        name: name.to_owned(),
                    })
            }
        }
    }
}

/// Controller owner reference pointing at the trigger, when the watch
/// delivered enough type information.
fn trigger_owner_reference(trigger: &DynamicObject) -> Option<OwnerReference> {
    let types = trigger.types.as_ref()?;
    Some(OwnerReference {
        api_version: types.api_version.clone(),
        kind: types.kind.clone(),
        name: trigger.name_any(),
        uid: trigger.uid()?,
        controller: Some(true),
        block_owner_deletion: None,
    })
}
