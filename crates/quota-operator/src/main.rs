use std::sync::Arc;

use clap::Parser;
use kube::{
    Client, Config, CustomResourceExt,
    config::KubeConfigOptions,
};
use quota_types::{
    bucket::AllowanceBucket,
    claim::ResourceClaim,
    grant::ResourceGrant,
    policy::{ClaimCreationPolicy, GrantCreationPolicy},
    registration::ResourceRegistration,
};
use quota_operator::{
    cluster::{ClusterRouter, parent::{DEFAULT_CLIENT_TTL, ParentContextResolver}, router::LOCAL_CLUSTER},
    config::OwnershipConfig,
    controller::{bucket, cleanup, grant_execution, ownership, policy, registration},
    utils::shutdown::ShutdownWatcher,
};
use snafu::{ResultExt, Snafu};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Environment variable controlling the tracing filter.
const LOG_ENV: &str = "QUOTA_OPERATOR_LOG";

#[derive(Debug, Snafu)]
enum Error {
    #[snafu(display("failed to infer local cluster configuration"))]
    InferConfig { source: kube::config::InferConfigError },

    #[snafu(display("failed to load kubeconfig context {context:?}"))]
    LoadKubeconfig {
        source: kube::config::KubeconfigError,
        context: String,
    },

    #[snafu(display("failed to construct client for cluster {cluster:?}"))]
    ConstructClient { source: kube::Error, cluster: String },

    #[snafu(display("failed to serialize CRD schema"))]
    SerializeCrd { source: serde_yaml::Error },

    #[snafu(display("failed to install signal handler"))]
    WatchSignals {
        source: quota_operator::utils::shutdown::SignalError,
    },

    #[snafu(display("invalid ownership configuration"))]
    OwnershipConfiguration { source: quota_operator::config::Error },
}

#[derive(Parser)]
#[command(
    name = "quota-operator",
    author,
    version,
    about = "Controllers of the declarative multi-tenant quota control plane"
)]
struct Opts {
    #[command(subcommand)]
    command: Command,
}

#[derive(clap::Subcommand)]
enum Command {
    /// Print the CRD schemas of the quota API group as YAML
    Crd,

    /// Run the control plane controllers
    Run(RunArgs),
}

#[derive(clap::Args)]
struct RunArgs {
    /// Kubeconfig contexts to watch as additional named clusters
    #[arg(long = "watch-cluster")]
    watch_clusters: Vec<String>,

    /// Reconcile workers per controller
    #[arg(long, default_value_t = 2)]
    workers: usize,
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    let opts = Opts::parse();

    match opts.command {
        Command::Crd => print_crds(),
        Command::Run(args) => run(args).await,
    }
}

fn print_crds() -> Result<(), Error> {
    let crds = [
        serde_yaml::to_string(&ResourceRegistration::crd()).context(SerializeCrdSnafu)?,
        serde_yaml::to_string(&ResourceGrant::crd()).context(SerializeCrdSnafu)?,
        serde_yaml::to_string(&ResourceClaim::crd()).context(SerializeCrdSnafu)?,
        serde_yaml::to_string(&AllowanceBucket::crd()).context(SerializeCrdSnafu)?,
        serde_yaml::to_string(&ClaimCreationPolicy::crd()).context(SerializeCrdSnafu)?,
        serde_yaml::to_string(&GrantCreationPolicy::crd()).context(SerializeCrdSnafu)?,
    ];
    println!("{}", crds.join("---\n"));
    Ok(())
}

async fn run(args: RunArgs) -> Result<(), Error> {
    initialize_logging();

    let ownership_config = OwnershipConfig::from_env().context(OwnershipConfigurationSnafu)?;

    let local_config = Config::infer().await.context(InferConfigSnafu)?;
    let local_client = Client::try_from(local_config.clone()).context(ConstructClientSnafu {
        cluster: "local".to_owned(),
    })?;

    let router = ClusterRouter::new();
    router.register(LOCAL_CLUSTER, local_client);

    for context in &args.watch_clusters {
        let config = Config::from_kubeconfig(&KubeConfigOptions {
            context: Some(context.clone()),
            ..KubeConfigOptions::default()
        })
        .await
        .context(LoadKubeconfigSnafu {
            context: context.clone(),
        })?;
        let client = Client::try_from(config).context(ConstructClientSnafu {
            cluster: context.clone(),
        })?;
        router.register(context.clone(), client);
        tracing::info!(cluster = %context, "registered cluster");
    }

    let resolver = ParentContextResolver::new(local_config, DEFAULT_CLIENT_TTL);
    let shutdown = ShutdownWatcher::terminate().context(WatchSignalsSnafu)?;

    tracing::info!(
        clusters = router.handles().len(),
        workers = args.workers,
        "starting quota control plane"
    );

    tokio::join!(
        registration::run(Arc::clone(&router), args.workers, &shutdown),
        bucket::run(Arc::clone(&router), args.workers, &shutdown),
        ownership::run(Arc::clone(&router), ownership_config, args.workers, &shutdown),
        cleanup::run(Arc::clone(&router), args.workers, &shutdown),
        policy::run_claim_policy_validator(Arc::clone(&router), args.workers, &shutdown),
        policy::run_grant_policy_validator(
            Arc::clone(&router),
            Arc::clone(&resolver),
            args.workers,
            &shutdown
        ),
        grant_execution::run(
            Arc::clone(&router),
            Arc::clone(&resolver),
            args.workers,
            &shutdown
        ),
    );

    resolver.close();
    tracing::info!("quota control plane stopped");
    Ok(())
}

/// Initializes `tracing` logging with options from the `QUOTA_OPERATOR_LOG`
/// environment variable. Defaults to `info` when unset.
fn initialize_logging() {
    let filter = EnvFilter::try_from_env(LOG_ENV)
        .unwrap_or_else(|_| EnvFilter::new(tracing::Level::INFO.to_string()));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}
