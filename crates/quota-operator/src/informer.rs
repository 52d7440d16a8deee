//! Dynamic informer manager.
//!
//! The grant-creation executor subscribes to arbitrary group/kind pairs as
//! policies become ready. One watch task per kind is shared across all
//! subscribers; subscribing to an already-watched kind only registers
//! another handler, and the watch is torn down once the last subscriber
//! leaves.

use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, RwLock},
};

use async_trait::async_trait;
use futures::TryStreamExt;
use kube::{
    Api, Client, ResourceExt,
    api::{ApiResource, DynamicObject},
    discovery,
    runtime::{
        WatchStreamExt,
        watcher::{self, Event, watcher},
    },
};
use snafu::{OptionExt, ResultExt, Snafu};

use crate::utils::shutdown::ShutdownWatcher;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to discover API group {group:?}"))]
    DiscoverGroup { source: kube::Error, group: String },

    #[snafu(display("API group {group:?} serves no kind {kind:?}"))]
    UnknownKind { group: String, kind: String },
}

/// Receives the events of one subscribed kind.
///
/// Handlers are invoked from the shared watch task of the kind; the
/// objects are fully formed [`DynamicObject`]s.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn on_add(&self, object: DynamicObject);
    async fn on_update(&self, object: DynamicObject);
    async fn on_delete(&self, object: DynamicObject);
}

type SubscriberMap = Arc<RwLock<HashMap<String, Arc<dyn EventHandler>>>>;

struct KindWatch {
    subscribers: SubscriberMap,
    task: tokio::task::JoinHandle<()>,
}

/// Shares one watch per kind between any number of subscribers.
pub struct InformerManager {
    client: Client,
    watches: tokio::sync::Mutex<HashMap<(String, String), KindWatch>>,
}

impl InformerManager {
    pub fn new(client: Client) -> Arc<Self> {
        Arc::new(Self {
            client,
            watches: tokio::sync::Mutex::new(HashMap::new()),
        })
    }

    /// Registers a handler for a kind, establishing the shared watch on
    /// first subscription. The kind is resolved to its served version
    /// through API discovery.
    pub async fn subscribe(
        &self,
        group: &str,
        kind: &str,
        subscriber: &str,
        handler: Arc<dyn EventHandler>,
        shutdown: &ShutdownWatcher,
    ) -> Result<(), Error> {
        let mut watches = self.watches.lock().await;
        let key = (group.to_owned(), kind.to_owned());

        if let Some(watch) = watches.get(&key) {
            watch
                .subscribers
                .write()
                .expect("informer subscriber lock poisoned")
                .insert(subscriber.to_owned(), handler);
            return Ok(());
        }

        let resource = self.resolve(group, kind).await?;
        let subscribers: SubscriberMap = Arc::new(RwLock::new(HashMap::from([(
            subscriber.to_owned(),
            handler,
        )])));

        let api: Api<DynamicObject> = Api::all_with(self.client.clone(), &resource);
        let task = tokio::spawn(run_informer(
            api,
            Arc::clone(&subscribers),
            shutdown.handle(),
        ));

        watches.insert(key, KindWatch { subscribers, task });
        Ok(())
    }

    /// Removes a handler; the shared watch stops once no subscriber is
    /// left.
    pub async fn unsubscribe(&self, group: &str, kind: &str, subscriber: &str) {
        let mut watches = self.watches.lock().await;
        let key = (group.to_owned(), kind.to_owned());

        let Some(watch) = watches.get(&key) else {
            return;
        };

        let drained = {
            let mut subscribers = watch
                .subscribers
                .write()
                .expect("informer subscriber lock poisoned");
            subscribers.remove(subscriber);
            subscribers.is_empty()
        };

        if drained
            && let Some(watch) = watches.remove(&key)
        {
            watch.task.abort();
        }
    }

    /// Stops every shared watch.
    pub async fn close(&self) {
        let mut watches = self.watches.lock().await;
        for (_, watch) in watches.drain() {
            watch.task.abort();
        }
    }

    async fn resolve(&self, group: &str, kind: &str) -> Result<ApiResource, Error> {
        let api_group = discovery::group(&self.client, group)
            .await
            .context(DiscoverGroupSnafu {
                group: group.to_owned(),
            })?;

        let (resource, _capabilities) =
            api_group.recommended_kind(kind).context(UnknownKindSnafu {
                group: group.to_owned(),
                kind: kind.to_owned(),
            })?;

        Ok(resource)
    }
}

async fn run_informer(
    api: Api<DynamicObject>,
    subscribers: SubscriberMap,
    shutdown: impl Future<Output = ()>,
) {
    let mut stream = std::pin::pin!(watcher(api, watcher::Config::default()).default_backoff());
    let mut shutdown = std::pin::pin!(shutdown);
    // Uids already delivered as adds, to tell updates apart.
    let mut known: HashSet<String> = HashSet::new();

    loop {
        let event = tokio::select! {
            () = &mut shutdown => break,
            event = stream.try_next() => event,
        };

        match event {
            Ok(Some(Event::Apply(object) | Event::InitApply(object))) => {
                let uid = object.uid().unwrap_or_else(|| object.name_any());
                let first_sighting = known.insert(uid);
                for handler in handlers(&subscribers) {
                    if first_sighting {
                        handler.on_add(object.clone()).await;
                    } else {
                        handler.on_update(object.clone()).await;
                    }
                }
            }
            Ok(Some(Event::Delete(object))) => {
                known.remove(&object.uid().unwrap_or_else(|| object.name_any()));
                for handler in handlers(&subscribers) {
                    handler.on_delete(object.clone()).await;
                }
            }
            Ok(Some(Event::Init | Event::InitDone)) => {}
            Ok(None) => break,
            Err(err) => {
                tracing::warn!(error = %err, "informer watch stream error");
            }
        }
    }
}

fn handlers(subscribers: &SubscriberMap) -> Vec<Arc<dyn EventHandler>> {
    subscribers
        .read()
        .expect("informer subscriber lock poisoned")
        .values()
        .cloned()
        .collect()
}
