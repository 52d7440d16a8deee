use std::{fmt::Display, hash::Hash, sync::Arc, time::Duration};

use tokio::task::JoinSet;

use super::WorkQueue;

/// Outcome of a successful reconcile.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Action {
    requeue_after: Option<Duration>,
}

impl Action {
    /// Re-run the reconciliation after the given duration even if no watch
    /// trigger fires.
    #[must_use]
    pub fn requeue(duration: Duration) -> Self {
        Self {
            requeue_after: Some(duration),
        }
    }

    /// Do nothing until a watch trigger enqueues the key again.
    #[must_use]
    pub fn await_change() -> Self {
        Self { requeue_after: None }
    }
}

/// Runs `workers` reconcile loops over the queue until shutdown.
///
/// Successful reconciles schedule their own requeue through [`Action`];
/// failed ones are logged and requeued after `error_requeue_after`. The
/// future resolves once shutdown fired and every in-flight reconcile
/// finished.
pub async fn run_controller<K, Ctx, F, Fut, E>(
    controller: &'static str,
    queue: Arc<WorkQueue<K>>,
    workers: usize,
    context: Arc<Ctx>,
    reconcile: F,
    error_requeue_after: Duration,
    shutdown: impl Future<Output = ()> + Send + 'static,
) where
    K: Clone + Eq + Hash + Display + Send + Sync + 'static,
    Ctx: Send + Sync + 'static,
    F: Fn(K, Arc<Ctx>) -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = Result<Action, E>> + Send,
    E: Display + Send + 'static,
{
    {
        let queue = Arc::clone(&queue);
        tokio::spawn(async move {
            shutdown.await;
            queue.shutdown().await;
        });
    }

    let mut join_set = JoinSet::new();
    for worker in 0..workers {
        let queue = Arc::clone(&queue);
        let context = Arc::clone(&context);
        let reconcile = reconcile.clone();

        join_set.spawn(async move {
            while let Some(key) = queue.next().await {
                let outcome = reconcile(key.clone(), Arc::clone(&context)).await;
                queue.done(&key).await;

                let requeue_after = match outcome {
                    Ok(Action { requeue_after }) => requeue_after,
                    Err(err) => {
                        tracing::warn!(controller, worker, %key, error = %err, "reconcile failed");
                        Some(error_requeue_after)
                    }
                };

                if let Some(delay) = requeue_after {
                    let queue = Arc::clone(&queue);
                    tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        queue.enqueue(key).await;
                    });
                }
            }
        });
    }

    while join_set.join_next().await.is_some() {}
    tracing::info!(controller, "controller stopped");
}
