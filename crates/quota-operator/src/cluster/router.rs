use std::{
    collections::HashMap,
    fmt::Debug,
    hash::Hash,
    sync::{Arc, RwLock},
};

use futures::TryStreamExt;
use kube::{
    Api, Client, Resource, ResourceExt,
    runtime::{
        WatchStreamExt,
        watcher::{self, Event, watcher},
    },
};
use serde::de::DeserializeOwned;
use snafu::Snafu;

use crate::{runtime::WorkQueue, utils::shutdown::ShutdownWatcher};

/// Name of the local cluster in the router.
pub const LOCAL_CLUSTER: &str = "";

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("no cluster named {name:?} is registered"))]
    UnknownCluster { name: String },
}

/// A named cluster and the client to reach it.
#[derive(Clone)]
pub struct ClusterHandle {
    pub name: String,
    pub client: Client,
}

/// Process-wide registry mapping cluster names to record clients.
///
/// The empty string denotes the local cluster. All reconcile requests,
/// enqueue functions and watch callbacks cross the fleet boundary here:
/// watches established through the router tag every enqueued key with the
/// originating cluster name so reconcilers read and write against the
/// correct client.
#[derive(Default)]
pub struct ClusterRouter {
    clusters: RwLock<HashMap<String, ClusterHandle>>,
}

impl ClusterRouter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register(&self, name: impl Into<String>, client: Client) {
        let name = name.into();
        let handle = ClusterHandle {
            name: name.clone(),
            client,
        };
        self.clusters
            .write()
            .expect("cluster registry lock poisoned")
            .insert(name, handle);
    }

    /// Resolves a cluster handle by name.
    pub fn get(&self, name: &str) -> Result<ClusterHandle, Error> {
        self.clusters
            .read()
            .expect("cluster registry lock poisoned")
            .get(name)
            .cloned()
            .ok_or_else(|| Error::UnknownCluster {
                name: name.to_owned(),
            })
    }

    /// All registered cluster handles.
    pub fn handles(&self) -> Vec<ClusterHandle> {
        self.clusters
            .read()
            .expect("cluster registry lock poisoned")
            .values()
            .cloned()
            .collect()
    }

    /// Establishes a watch for `K` on every registered cluster, mapping
    /// each relevant event to reconcile keys on the queue.
    ///
    /// `fingerprint_of` suppresses events that carry no relevant change: an
    /// object whose fingerprint matches the previously observed one is not
    /// enqueued. Returning `None` disables suppression for that object.
    /// Deletes always enqueue.
    pub fn spawn_watches<K, Q, M, F>(
        &self,
        queue: &Arc<WorkQueue<Q>>,
        config: &watcher::Config,
        shutdown: &ShutdownWatcher,
        map: M,
        fingerprint_of: F,
    ) where
        K: Resource + Clone + Debug + DeserializeOwned + Send + 'static,
        K::DynamicType: Default,
        Q: Clone + Eq + Hash + Send + Sync + 'static,
        M: Fn(&str, &K) -> Vec<Q> + Clone + Send + Sync + 'static,
        F: Fn(&K) -> Option<u64> + Clone + Send + Sync + 'static,
    {
        for handle in self.handles() {
            let api: Api<K> = Api::all(handle.client.clone());
            let queue = Arc::clone(queue);
            let config = config.clone();
            let map = map.clone();
            let fingerprint_of = fingerprint_of.clone();
            let shutdown = shutdown.handle();

            tokio::spawn(async move {
                run_watch(handle.name, api, config, queue, map, fingerprint_of, shutdown).await;
            });
        }
    }
}

async fn run_watch<K, Q, M, F>(
    cluster: String,
    api: Api<K>,
    config: watcher::Config,
    queue: Arc<WorkQueue<Q>>,
    map: M,
    fingerprint_of: F,
    shutdown: impl Future<Output = ()>,
) where
    K: Resource + Clone + Debug + DeserializeOwned + Send + 'static,
    Q: Clone + Eq + Hash,
    M: Fn(&str, &K) -> Vec<Q>,
    F: Fn(&K) -> Option<u64>,
{
    let mut stream = std::pin::pin!(watcher(api, config).default_backoff());
    let mut shutdown = std::pin::pin!(shutdown);
    // Fingerprints of the last observed revision per object uid.
    let mut seen: HashMap<String, u64> = HashMap::new();

    loop {
        let event = tokio::select! {
            () = &mut shutdown => break,
            event = stream.try_next() => event,
        };

        match event {
            Ok(Some(Event::Apply(object) | Event::InitApply(object))) => {
                let uid = uid_of(&object);
                if let Some(fingerprint) = fingerprint_of(&object)
                    && seen.insert(uid, fingerprint) == Some(fingerprint)
                {
                    continue;
                }
                for key in map(&cluster, &object) {
                    queue.enqueue(key).await;
                }
            }
            Ok(Some(Event::Delete(object))) => {
                seen.remove(&uid_of(&object));
                for key in map(&cluster, &object) {
                    queue.enqueue(key).await;
                }
            }
            Ok(Some(Event::Init | Event::InitDone)) => {}
            Ok(None) => break,
            Err(err) => {
                tracing::warn!(cluster = %cluster, error = %err, "watch stream error");
            }
        }
    }
}

fn uid_of<K: Resource>(object: &K) -> String {
    object
        .meta()
        .uid
        .clone()
        .unwrap_or_else(|| format!("{}/{}", object.namespace().unwrap_or_default(), object.name_any()))
}

/// A cluster-tagged reference to one object, the reconcile key of most
/// controllers.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct ObjectKey {
    /// Originating cluster name; empty for the local cluster.
    pub cluster: String,
    /// Namespace, unset for cluster-scoped kinds.
    pub namespace: Option<String>,
    pub name: String,
}

impl ObjectKey {
    pub fn of<K: Resource>(cluster: &str, object: &K) -> Self {
        Self {
            cluster: cluster.to_owned(),
            namespace: object.namespace(),
            name: object.name_any(),
        }
    }
}

impl std::fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let cluster = if self.cluster.is_empty() {
            "local"
        } else {
            &self.cluster
        };
        match &self.namespace {
            Some(namespace) => write!(f, "{cluster}:{namespace}/{}", self.name),
            None => write!(f, "{cluster}:{}", self.name),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_cluster_is_an_error() {
        let router = ClusterRouter::new();

        assert!(matches!(
            router.get("nowhere"),
            Err(Error::UnknownCluster { name }) if name == "nowhere"
        ));
    }

    #[test]
    fn object_key_display() {
        let namespaced = ObjectKey {
            cluster: String::new(),
            namespace: Some("quota-system".to_owned()),
            name: "bucket-abc".to_owned(),
        };
        assert_eq!(namespaced.to_string(), "local:quota-system/bucket-abc");

        let cluster_scoped = ObjectKey {
            cluster: "staging".to_owned(),
            namespace: None,
            name: "projects".to_owned(),
        };
        assert_eq!(cluster_scoped.to_string(), "staging:projects");
    }
}
